use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use model::domain::category::{Category, JobTopic};
use model::domain::stage::Terminal;
use model::dto::job::JobRecord;
use model::view::hub::{JobEvent, JobPosted};
use model::{JobId, WorkerId};
use serde_json::Value;

use crate::prom_metrics::JOBS_RETIRED;
use crate::repository::category_board::{CategoryBoard, Event};
use crate::repository::cron::Cron;
use crate::repository::subscribers::{
    Connection, SubscriberInfo, SubscriberRegistry,
};

/// Longest a long-poll subscriber may wait for an event.
pub const MAX_LONG_POLL: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] crate::repository::subscribers::Error),
    #[error("Failed to serialize the event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Fans job announcements out to every connected worker and carries the
/// per-category events consumed through long polls.
#[derive(Debug)]
pub struct Hub {
    registry: SubscriberRegistry,
    board:    Arc<CategoryBoard>,
    cron:     Arc<Cron>,
    ttl:      Duration,
}

impl Hub {
    pub fn new(
        registry: SubscriberRegistry,
        board: Arc<CategoryBoard>,
        cron: Arc<Cron>,
        ttl: Duration,
    ) -> Self {
        Self { registry, board, cron, ttl }
    }

    pub fn announce(&self, job: &JobRecord) -> Result<(), Error> {
        trace!("announce job {}", job.id);
        self.registry.broadcast(JobPosted {
            job_id:    job.id,
            project:   job.project.clone(),
            posted_at: job.created_at,
        })?;
        Ok(())
    }

    pub fn connect(&self, worker: WorkerId) -> Result<Connection, Error> {
        Ok(self.registry.connect(worker)?)
    }

    pub async fn connected(&self) -> Result<Vec<SubscriberInfo>, Error> {
        Ok(self.registry.snapshot().await?)
    }

    pub fn publish(&self, category: Category, payload: Value) -> DateTime<Utc> {
        trace!("publish on {}", category);
        self.board.publish(category, payload)
    }

    pub fn publish_job_event(
        &self,
        job: &JobId,
        topic: JobTopic,
        event: &JobEvent,
    ) -> Result<(), Error> {
        let payload = serde_json::to_value(event)?;
        self.board.publish(Category::for_job(job, topic), payload);
        Ok(())
    }

    /// Waits for the next event of the category, `wait` being capped at
    /// [`MAX_LONG_POLL`]. `None` when nothing arrived in time.
    pub async fn subscribe(
        &self,
        category: &Category,
        wait: Duration,
    ) -> Option<Event> {
        self.board.subscribe(category, wait.min(MAX_LONG_POLL)).await
    }

    /// Announces on the status category that the job is over, then forgets
    /// its categories once that last event had time to be consumed.
    pub fn retire_job(&self, job: JobId, terminal: Terminal) {
        JOBS_RETIRED.with_label_values(&[terminal.stage().as_str()]).inc();
        if let Err(err) = self.publish_job_event(
            &job,
            JobTopic::Status,
            &JobEvent::Retired { job_id: job, terminal },
        ) {
            warn!("Failed to publish the retirement of job {}: {:?}", job, err);
        }

        let board = self.board.clone();
        self.cron.add_oneshot(self.ttl, async move {
            let released = board.release(|category| category.is_of_job(&job));
            debug!("Released {} categories of job {}", released, job);
        });
    }

    /// Drops expired events, returns how many.
    pub fn sweep(&self) -> usize { self.board.sweep() }

    pub fn categories(&self) -> usize { self.board.len() }
}
