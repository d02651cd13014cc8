use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::rate::Rate;
use crate::{BidId, DeviceId, JobId, WorkerId};

/// A stored bid. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRecord {
    pub id:         BidId,
    pub job:        JobId,
    pub worker:     WorkerId,
    pub device:     DeviceId,
    pub rate:       Rate,
    /// Decided once, from the auction phase at the time the bid arrived.
    pub late:       bool,
    pub created_at: DateTime<Utc>,
    /// Insertion order, assigned by the store; breaks ties between equal
    /// rates.
    pub sequence:   u64,
}

impl BidRecord {
    pub fn new(
        job: JobId,
        worker: WorkerId,
        device: DeviceId,
        rate: Rate,
        late: bool,
    ) -> Self {
        Self {
            id: BidId::generate(),
            job,
            worker,
            device,
            rate,
            late,
            created_at: Utc::now(),
            sequence: 0,
        }
    }

    /// The resource unit this bid would occupy if it won.
    pub fn executor(&self) -> (WorkerId, DeviceId) { (self.worker, self.device) }
}
