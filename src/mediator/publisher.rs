//! Producer side: claim a slot, write the envelope, publish, wake the consumer.

use tracing::{debug, trace};

use crate::error::DispatchError;
use crate::ring::slot::Envelope;
use crate::ring::ClaimPolicy;

use super::lane::Lane;

pub(crate) struct Publisher {
    policy: ClaimPolicy,
}

impl Publisher {
    pub(crate) fn new(policy: ClaimPolicy) -> Self {
        Self { policy }
    }

    /// Hand `envelope` to `lane` and return its sequence.
    ///
    /// Fails only at submission time: `Capacity` under backpressure, or
    /// `Shutdown` once the lane is closed. Once this returns `Ok` the
    /// submission will be processed even if nobody waits for it.
    pub(crate) fn submit(&self, lane: &Lane, envelope: Envelope) -> Result<u64, DispatchError> {
        let claimed = match lane.ring.claim_next(&self.policy) {
            Ok(claimed) => claimed,
            Err(err) => {
                if matches!(err, DispatchError::Capacity { .. }) {
                    lane.metrics.record_shed();
                }
                debug!(
                    dispatch_id = %envelope.id,
                    lane = lane.index,
                    request_type = %envelope.key,
                    backpressure = ?self.policy.backpressure,
                    error = %err,
                    "Submission rejected"
                );
                return Err(err);
            }
        };

        let sequence = claimed.sequence();
        trace!(
            dispatch_id = %envelope.id,
            lane = lane.index,
            sequence,
            request_type = %envelope.key,
            completion = envelope.completion.kind(),
            "Publishing submission"
        );
        claimed.publish(envelope);
        lane.metrics.record_publish();
        lane.notify_published();
        Ok(sequence)
    }
}
