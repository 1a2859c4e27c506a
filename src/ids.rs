use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Correlation id for one submission, backed by ULID.
///
/// Assigned when a request is submitted and carried in every log line the
/// publisher, the consumer thread, and the waiting caller emit for it.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct DispatchId(pub ulid::Ulid);

impl DispatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Milliseconds since the Unix epoch at which the id was minted
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DispatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DispatchId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DispatchId(ulid::Ulid::from_string(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_id_round_trips_through_display() {
        let id = DispatchId::new();
        let parsed: DispatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_dispatch_ids_are_unique() {
        assert_ne!(DispatchId::new(), DispatchId::new());
    }

    #[test]
    fn test_invalid_dispatch_id() {
        assert!("not-a-ulid".parse::<DispatchId>().is_err());
    }
}
