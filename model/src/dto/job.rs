use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::rate::Rate;
use crate::domain::stage::{Stage, Terminal};
use crate::{BidId, ClientId, JobId};

/// Winner columns of a job, written together exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub bid:  BidId,
    pub rate: Rate,
}

/// Durable row of a job and its lifecycle timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id:                 JobId,
    pub client:             ClientId,
    pub project:            String,
    pub created_at:         DateTime<Utc>,
    pub active:             bool,
    pub winner:             Option<WinnerRecord>,
    pub auction_started_at: Option<DateTime<Utc>>,
    stages:                 HashMap<Stage, DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(client: ClientId, project: String) -> Self {
        Self {
            id: JobId::generate(),
            client,
            project,
            created_at: Utc::now(),
            active: true,
            winner: None,
            auction_started_at: None,
            stages: HashMap::new(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.stages.get(&stage).copied()
    }

    pub fn has(&self, stage: Stage) -> bool { self.stages.contains_key(&stage) }

    /// Records the stage unless it is already set. Returns whether it was
    /// written.
    pub fn set_stage_once(&mut self, stage: Stage, at: DateTime<Utc>) -> bool {
        if self.stages.contains_key(&stage) {
            return false;
        }
        self.stages.insert(stage, at);
        true
    }

    pub fn terminal(&self) -> Option<Terminal> {
        [Terminal::Completed, Terminal::Canceled, Terminal::Failed]
            .into_iter()
            .find(|terminal| self.has(terminal.stage()))
    }

    pub fn is_terminal(&self) -> bool { self.terminal().is_some() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_are_set_once() {
        let mut job = JobRecord::new(ClientId::generate(), "proj".into());
        let first = Utc::now();
        assert!(job.set_stage_once(Stage::DataSynced, first));
        assert!(!job.set_stage_once(
            Stage::DataSynced,
            first + chrono::Duration::seconds(5)
        ));
        assert_eq!(job.stage(Stage::DataSynced), Some(first));
        assert_eq!(job.terminal(), None);
    }

    #[test]
    fn test_terminal_is_derived_from_stages() {
        let mut job = JobRecord::new(ClientId::generate(), "proj".into());
        job.set_stage_once(Stage::Canceled, Utc::now());
        assert_eq!(job.terminal(), Some(Terminal::Canceled));
        assert!(job.is_terminal());
    }
}
