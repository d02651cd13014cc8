use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use model::domain::stage::Terminal;
use model::{DeviceId, JobId, WorkerId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::prom_metrics::WATCHDOG_FAILURES;
use crate::repository::status_store::{StatusStore, TerminalWrite};
use crate::service::hub::Hub;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{worker} on {device} is not executing job {job}")]
    NotExecutor { job: JobId, worker: WorkerId, device: DeviceId },
    #[error("Job {0} is already {1}")]
    JobTerminal(JobId, Terminal),
    #[error("Job {0} is not active")]
    JobNotActive(JobId),
    #[error("Job {0} has no winner to watch over")]
    NoWinner(JobId),
    #[error(transparent)]
    Store(#[from] crate::repository::status_store::Error),
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    executor:   (WorkerId, DeviceId),
    beats:      mpsc::Sender<()>,
}

/// One liveness timer per executing job. A job whose executor stops sending
/// heartbeats for longer than the timeout is failed.
#[derive(Debug)]
pub struct Watchdog {
    store:      Arc<dyn StatusStore>,
    hub:        Arc<Hub>,
    timeout:    Duration,
    entries:    Arc<DashMap<JobId, Entry>>,
    generation: AtomicU64,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn StatusStore>,
        hub: Arc<Hub>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            timeout,
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Starts watching the job unless it is already watched. Returns whether
    /// a new timer was armed.
    pub fn arm(&self, job: JobId, executor: (WorkerId, DeviceId)) -> bool {
        let MapEntry::Vacant(vacant) = self.entries.entry(job) else {
            return false;
        };

        let (beats, receiver) = mpsc::channel(1);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        vacant.insert(Entry { generation, executor, beats });

        tokio::spawn(watch(
            job,
            generation,
            receiver,
            self.timeout,
            self.entries.clone(),
            self.store.clone(),
            self.hub.clone(),
        ));
        debug!(
            "Watching job {} executed by {} on {}",
            job, executor.0, executor.1
        );
        true
    }

    /// Resets the timer of the job. A job that lost its timer (restart,
    /// failed write) gets a fresh one if its executor is the one beating.
    pub async fn heartbeat(
        &self,
        job: JobId,
        worker: WorkerId,
        device: DeviceId,
    ) -> Result<(), Error> {
        trace!("heartbeat of {} on {} for job {}", worker, device, job);
        if let Some(entry) = self.entries.get(&job) {
            if entry.executor != (worker, device) {
                return Err(Error::NotExecutor { job, worker, device });
            }
            match entry.beats.try_send(()) {
                // A beat already pending resets the timer all the same
                Ok(()) | Err(TrySendError::Full(())) => return Ok(()),
                Err(TrySendError::Closed(())) => {}
            }
        }

        let record = self.store.get_job(&job).await?;
        if let Some(terminal) = record.terminal() {
            return Err(Error::JobTerminal(job, terminal));
        }
        if !record.active {
            return Err(Error::JobNotActive(job));
        }
        let winner = record.winner.ok_or(Error::NoWinner(job))?;
        let bid = self.store.get_bid(&winner.bid).await?;
        if bid.executor() != (worker, device) {
            return Err(Error::NotExecutor { job, worker, device });
        }

        // The timer gone, its stale entry has to make room
        self.entries
            .remove_if(&job, |_, entry| entry.beats.is_closed());
        if self.arm(job, (worker, device)) {
            info!("Re-armed the watchdog of job {} on heartbeat", job);
        }
        Ok(())
    }

    /// Stops watching the job without failing it.
    pub fn retire(&self, job: &JobId) -> bool {
        self.entries.remove(job).is_some()
    }

    pub fn watched(&self) -> usize { self.entries.len() }

    #[cfg(test)]
    pub fn is_armed(&self, job: &JobId) -> bool {
        self.entries.contains_key(job)
    }
}

async fn watch(
    job: JobId,
    generation: u64,
    mut beats: mpsc::Receiver<()>,
    timeout: Duration,
    entries: Arc<DashMap<JobId, Entry>>,
    store: Arc<dyn StatusStore>,
    hub: Arc<Hub>,
) {
    loop {
        match tokio::time::timeout(timeout, beats.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) => {
                trace!("Watchdog of job {} retired", job);
                return;
            }
            Err(_) => break,
        }
    }

    entries.remove_if(&job, |_, entry| entry.generation == generation);
    drop(beats);
    warn!("No heartbeat for job {} in {:?}, failing it", job, timeout);

    match store.set_terminal(&job, Terminal::Failed, Utc::now()).await {
        Ok(TerminalWrite::Written) => {
            WATCHDOG_FAILURES.inc();
            hub.retire_job(job, Terminal::Failed);
        }
        Ok(TerminalWrite::AlreadyTerminal(terminal)) => {
            debug!("Job {} was already {} when its watchdog fired", job, terminal);
        }
        Ok(TerminalWrite::Inactive) => {
            debug!("Job {} was inactive when its watchdog fired", job);
        }
        Err(err) => {
            warn!(
                "Failed to mark job {} as failed, it stays active: {:?}",
                job, err
            );
        }
    }
}
