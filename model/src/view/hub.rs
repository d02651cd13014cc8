use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::auction::ChosenBid;
use crate::domain::category::Category;
use crate::domain::stage::Terminal;
use crate::{BidId, DeviceId, JobId, WorkerId};

/// Announcement fanned out to every connected worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPosted {
    pub job_id:    JobId,
    pub project:   String,
    pub posted_at: DateTime<Utc>,
}

/// Body of the per-job events the broker itself publishes. Callers of
/// `Publish` may send any JSON value instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Canceled { job_id: JobId, winner: Option<BidId> },
    OutputReady { job_id: JobId },
    AuctionClosed { job_id: JobId, chosen: Option<ChosenBid> },
    Retired { job_id: JobId, terminal: Terminal },
}

/// Sent to the downstream service when a job with a winner is canceled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelNotice {
    pub job_id: JobId,
    pub bid_id: BidId,
    pub worker: WorkerId,
    pub device: DeviceId,
}

/// Acknowledges an event published on a category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub category:     Category,
    pub published_at: DateTime<Utc>,
}
