use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::stage::Stage;
use crate::{ClientId, DeviceId, JobId, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostJob {
    pub client_id: ClientId,
    pub project:   String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedJob {
    pub job_id: JobId,
}

/// Execution snapshot reported periodically by the worker running a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostHeartbeat {
    pub worker_id: WorkerId,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    /// `None` while the stage has not been reached.
    pub at:    Option<DateTime<Utc>>,
}
