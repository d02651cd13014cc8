use std::sync::Arc;

use chrono::{DateTime, Utc};
use model::domain::category::JobTopic;
use model::domain::stage::{Stage, Terminal};
use model::dto::job::JobRecord;
use model::view::hub::{CancelNotice, JobEvent};
use model::JobId;

use crate::prom_metrics::NOTIFY_FAILURES;
use crate::repository::auction::AuctionTable;
use crate::repository::notifier::CancellationNotifier;
use crate::repository::status_store::{StageWrite, StatusStore, TerminalWrite};
use crate::service::hub::Hub;
use crate::service::watchdog::Watchdog;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Job {0} is already {1}")]
    JobTerminal(JobId, Terminal),
    #[error("Job {0} is not active")]
    JobNotActive(JobId),
    #[error("Job {job} cannot reach {stage} before {missing} is set")]
    MissingStage { job: JobId, stage: Stage, missing: Stage },
    #[error("{0} is only ever set by the auction")]
    OwnedByAuction(Stage),
    #[error("The output of job {0} has not been posted yet")]
    OutputNotReady(JobId),
    #[error(transparent)]
    Store(#[from] crate::repository::status_store::Error),
}

/// Stage that has to be set before the given one can be.
fn prerequisite(stage: Stage) -> Option<Stage> {
    match stage {
        Stage::ImageDownloaded
        | Stage::DataDownloaded
        | Stage::OutputLogPosted
        | Stage::OutputDataPosted
        | Stage::Completed
        | Stage::Failed => Some(Stage::AuctionCompleted),
        _ => None,
    }
}

/// Gates the lifecycle of jobs. Guards are always checked against a fresh
/// read of the store.
#[derive(Debug)]
pub struct JobStatus {
    store:    Arc<dyn StatusStore>,
    hub:      Arc<Hub>,
    watchdog: Arc<Watchdog>,
    auctions: Arc<AuctionTable>,
    notifier: Option<Arc<dyn CancellationNotifier>>,
}

impl JobStatus {
    pub fn new(
        store: Arc<dyn StatusStore>,
        hub: Arc<Hub>,
        watchdog: Arc<Watchdog>,
        auctions: Arc<AuctionTable>,
        notifier: Option<Arc<dyn CancellationNotifier>>,
    ) -> Self {
        Self { store, hub, watchdog, auctions, notifier }
    }

    /// Sets the stage once. Setting it again is a no-op.
    pub async fn set_stage(&self, id: JobId, stage: Stage) -> Result<(), Error> {
        trace!("set stage {} of job {}", stage, id);
        match stage {
            Stage::AuctionCompleted => return Err(Error::OwnedByAuction(stage)),
            Stage::Canceled => return self.cancel(id).await,
            Stage::Completed => return self.finish(id, Terminal::Completed).await,
            Stage::Failed => return self.finish(id, Terminal::Failed).await,
            _ => {}
        }

        let job = self.store.get_job(&id).await?;
        if job.has(stage) {
            return Ok(());
        }
        self.check_open(&job)?;
        check_prerequisite(&job, stage)?;

        match self.store.set_stage(&id, stage, Utc::now()).await? {
            StageWrite::Written => {
                debug!("Job {} reached {}", id, stage);
                if stage == Stage::OutputDataPosted {
                    self.publish(&id, JobTopic::Output, &JobEvent::OutputReady {
                        job_id: id,
                    });
                }
                Ok(())
            }
            StageWrite::AlreadySet => Ok(()),
            StageWrite::JobTerminal(terminal) => {
                Err(Error::JobTerminal(id, terminal))
            }
        }
    }

    pub async fn get_stage(
        &self,
        id: &JobId,
        stage: Stage,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self.store.get_job(id).await?.stage(stage))
    }

    /// Cancels an active job, telling its executor if it has one.
    pub async fn cancel(&self, id: JobId) -> Result<(), Error> {
        trace!("cancel job {}", id);
        match self.store.set_terminal(&id, Terminal::Canceled, Utc::now()).await? {
            TerminalWrite::Written => {}
            TerminalWrite::AlreadyTerminal(Terminal::Canceled) => return Ok(()),
            TerminalWrite::AlreadyTerminal(terminal) => {
                return Err(Error::JobTerminal(id, terminal));
            }
            TerminalWrite::Inactive => return Err(Error::JobNotActive(id)),
        }
        info!("Job {} canceled", id);
        self.retire(id, Terminal::Canceled);

        // The cancellation is committed, what follows only informs others
        if let Err(err) = self.announce_cancel(id).await {
            NOTIFY_FAILURES.inc();
            error!(
                "Could not announce the cancellation of job {}: {:?}",
                id, err
            );
        }
        Ok(())
    }

    /// Publishes the cancel event and notifies the executor, if any, in the
    /// background.
    async fn announce_cancel(&self, id: JobId) -> Result<(), Error> {
        // Read after the write, the winner cannot change anymore
        let job = self.store.get_job(&id).await?;
        let winner = job.winner.map(|winner| winner.bid);
        self.publish(&id, JobTopic::Cancel, &JobEvent::Canceled {
            job_id: id,
            winner,
        });

        let (Some(bid), Some(notifier)) = (winner, self.notifier.clone()) else {
            return Ok(());
        };
        let bid = self.store.get_bid(&bid).await?;
        let notice = CancelNotice {
            job_id: id,
            bid_id: bid.id,
            worker: bid.worker,
            device: bid.device,
        };
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&notice).await {
                NOTIFY_FAILURES.inc();
                error!(
                    "Could not notify the cancellation of job {} to {} on \
                     {}: {:?}",
                    notice.job_id, notice.worker, notice.device, err
                );
            }
        });
        Ok(())
    }

    /// Ends a job that went through its auction, either completed or failed
    /// as reported by its executor.
    pub async fn finish(&self, id: JobId, terminal: Terminal) -> Result<(), Error> {
        trace!("finish job {} as {}", id, terminal);
        let job = self.store.get_job(&id).await?;
        match job.terminal() {
            Some(previous) if previous == terminal => return Ok(()),
            Some(previous) => return Err(Error::JobTerminal(id, previous)),
            None => {}
        }
        self.check_open(&job)?;
        check_prerequisite(&job, terminal.stage())?;

        match self.store.set_terminal(&id, terminal, Utc::now()).await? {
            TerminalWrite::Written => {
                info!("Job {} is {}", id, terminal);
                self.retire(id, terminal);
                Ok(())
            }
            TerminalWrite::AlreadyTerminal(previous) if previous == terminal => {
                Ok(())
            }
            TerminalWrite::AlreadyTerminal(previous) => {
                Err(Error::JobTerminal(id, previous))
            }
            TerminalWrite::Inactive => Err(Error::JobNotActive(id)),
        }
    }

    /// Succeeds once the executor posted the output data, with the instant
    /// it did.
    pub async fn request_output(&self, id: &JobId) -> Result<DateTime<Utc>, Error> {
        self.store
            .get_job(id)
            .await?
            .stage(Stage::OutputDataPosted)
            .ok_or(Error::OutputNotReady(*id))
    }

    /// Releases everything held in memory for a job that just ended.
    fn retire(&self, id: JobId, terminal: Terminal) {
        self.watchdog.retire(&id);
        self.auctions.remove(&id);
        self.hub.retire_job(id, terminal);
    }

    fn check_open(&self, job: &JobRecord) -> Result<(), Error> {
        if let Some(terminal) = job.terminal() {
            return Err(Error::JobTerminal(job.id, terminal));
        }
        if !job.active {
            return Err(Error::JobNotActive(job.id));
        }
        Ok(())
    }

    fn publish(&self, id: &JobId, topic: JobTopic, event: &JobEvent) {
        if let Err(err) = self.hub.publish_job_event(id, topic, event) {
            warn!("Failed to publish {:?} of job {}: {:?}", event, id, err);
        }
    }
}

fn check_prerequisite(job: &JobRecord, stage: Stage) -> Result<(), Error> {
    match prerequisite(stage) {
        Some(missing) if !job.has(missing) => {
            Err(Error::MissingStage { job: job.id, stage, missing })
        }
        _ => Ok(()),
    }
}
