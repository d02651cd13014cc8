use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use model::domain::rate::Rate;
use model::domain::stage::{Stage, Terminal};
use model::dto::bid::BidRecord;
use model::dto::job::{JobRecord, WinnerRecord};
use model::{BidId, DeviceId, JobId, WorkerId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Job {0} does not exist")]
    JobNotFound(JobId),
    #[error("Bid {0} does not exist")]
    BidNotFound(BidId),
    #[error("Job {0} already exists")]
    Duplicate(JobId),
    #[error("The status store is unavailable: {0}")]
    Unavailable(String),
}

/// Result of a set-once stage write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageWrite {
    Written,
    AlreadySet,
    /// The job already carries a terminal timestamp, nothing was written.
    JobTerminal(Terminal),
}

/// Result of the single winner write of an auction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuctionWrite {
    Written,
    AlreadyDecided(WinnerRecord),
    JobInactive,
    /// The (worker, device) of the bid holds the win of this other active
    /// job, nothing was written.
    ExecutorBusy(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalWrite {
    Written,
    AlreadyTerminal(Terminal),
    /// Not terminal but deactivated (an auction without bids).
    Inactive,
}

/// Durable store of jobs, their lifecycle timestamps and their bids.
///
/// Every mutation is atomic per job and set-once, so retrying any of them is
/// harmless.
#[async_trait]
pub trait StatusStore: Debug + Sync + Send {
    async fn insert_job(&self, job: JobRecord) -> Result<(), Error>;
    async fn get_job(&self, id: &JobId) -> Result<JobRecord, Error>;
    async fn set_stage(
        &self,
        id: &JobId,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> Result<StageWrite, Error>;
    /// Records when the bidding window of the job first opened, returns the
    /// stored instant (the earlier one if it was already set).
    async fn mark_auction_started(
        &self,
        id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Error>;
    /// Writes winner, clearing rate and `auction_completed` together, only if
    /// no winner exists yet, the job is still active and the executor of the
    /// winning bid holds no other active win. Claiming the executor is part
    /// of the same write.
    async fn set_auction_result(
        &self,
        id: &JobId,
        winner: WinnerRecord,
        at: DateTime<Utc>,
    ) -> Result<AuctionWrite, Error>;
    /// Sets one terminal timestamp and clears `active` in the same write.
    async fn set_terminal(
        &self,
        id: &JobId,
        terminal: Terminal,
        at: DateTime<Utc>,
    ) -> Result<TerminalWrite, Error>;
    async fn deactivate(&self, id: &JobId) -> Result<(), Error>;
    /// Stores the bid and returns it with its insertion sequence.
    async fn insert_bid(&self, bid: BidRecord) -> Result<BidRecord, Error>;
    async fn get_bid(&self, id: &BidId) -> Result<BidRecord, Error>;
    /// On-time bids of the job whose (worker, device) does not already hold
    /// the win of another active job, cheapest first then earliest first.
    async fn eligible_bids(
        &self,
        id: &JobId,
        limit: usize,
    ) -> Result<Vec<BidRecord>, Error>;
}

#[derive(Debug, Default)]
pub struct StatusStoreImpl {
    jobs:     DashMap<JobId, JobRecord>,
    bids:     DashMap<BidId, BidRecord>,
    job_bids: DashMap<JobId, Vec<BidId>>,
    /// Job each (worker, device) last won. Locked before `jobs`.
    claims:   DashMap<(WorkerId, DeviceId), JobId>,
    sequence: AtomicU64,
}

impl StatusStoreImpl {
    pub fn new() -> Self { Self::default() }

    /// (worker, device) pairs currently holding the win of an active job
    /// other than `except`.
    fn busy_executors(&self, except: &JobId) -> HashSet<(WorkerId, DeviceId)> {
        self.claims
            .iter()
            .filter(|claim| claim.value() != except)
            .filter(|claim| self.is_active(claim.value()))
            .map(|claim| *claim.key())
            .collect()
    }

    fn is_active(&self, id: &JobId) -> bool {
        self.jobs.get(id).map_or(false, |job| job.active)
    }
}

#[async_trait]
impl StatusStore for StatusStoreImpl {
    async fn insert_job(&self, job: JobRecord) -> Result<(), Error> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(Error::Duplicate(job.id)),
            Entry::Vacant(entry) => {
                entry.insert(job);
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, Error> {
        self.jobs
            .get(id)
            .map(|job| job.clone())
            .ok_or(Error::JobNotFound(*id))
    }

    async fn set_stage(
        &self,
        id: &JobId,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> Result<StageWrite, Error> {
        let mut job = self.jobs.get_mut(id).ok_or(Error::JobNotFound(*id))?;
        if let Some(terminal) = job.terminal() {
            return Ok(StageWrite::JobTerminal(terminal));
        }
        if job.set_stage_once(stage, at) {
            Ok(StageWrite::Written)
        } else {
            Ok(StageWrite::AlreadySet)
        }
    }

    async fn mark_auction_started(
        &self,
        id: &JobId,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Error> {
        let mut job = self.jobs.get_mut(id).ok_or(Error::JobNotFound(*id))?;
        Ok(*job.auction_started_at.get_or_insert(at))
    }

    async fn set_auction_result(
        &self,
        id: &JobId,
        winner: WinnerRecord,
        at: DateTime<Utc>,
    ) -> Result<AuctionWrite, Error> {
        let executor = self
            .bids
            .get(&winner.bid)
            .map(|bid| bid.executor())
            .ok_or(Error::BidNotFound(winner.bid))?;

        let claim = self.claims.entry(executor);
        if let Entry::Occupied(holder) = &claim {
            let holder = *holder.get();
            if holder != *id && self.is_active(&holder) {
                let decided = self.jobs.get(id).and_then(|job| job.winner);
                return Ok(match decided {
                    Some(previous) => AuctionWrite::AlreadyDecided(previous),
                    None => AuctionWrite::ExecutorBusy(holder),
                });
            }
        }

        let mut job = self.jobs.get_mut(id).ok_or(Error::JobNotFound(*id))?;
        if let Some(previous) = job.winner {
            return Ok(AuctionWrite::AlreadyDecided(previous));
        }
        if !job.active || job.is_terminal() {
            return Ok(AuctionWrite::JobInactive);
        }
        job.winner = Some(winner);
        job.set_stage_once(Stage::AuctionCompleted, at);
        drop(job);
        claim.insert(*id);
        Ok(AuctionWrite::Written)
    }

    async fn set_terminal(
        &self,
        id: &JobId,
        terminal: Terminal,
        at: DateTime<Utc>,
    ) -> Result<TerminalWrite, Error> {
        let mut job = self.jobs.get_mut(id).ok_or(Error::JobNotFound(*id))?;
        if let Some(previous) = job.terminal() {
            return Ok(TerminalWrite::AlreadyTerminal(previous));
        }
        if !job.active {
            return Ok(TerminalWrite::Inactive);
        }
        job.set_stage_once(terminal.stage(), at);
        job.active = false;
        let winner = job.winner;
        drop(job);

        if let Some(executor) = winner
            .and_then(|winner| self.bids.get(&winner.bid))
            .map(|bid| bid.executor())
        {
            self.claims.remove_if(&executor, |_, holder| holder == id);
        }
        Ok(TerminalWrite::Written)
    }

    async fn deactivate(&self, id: &JobId) -> Result<(), Error> {
        let mut job = self.jobs.get_mut(id).ok_or(Error::JobNotFound(*id))?;
        job.active = false;
        Ok(())
    }

    async fn insert_bid(&self, mut bid: BidRecord) -> Result<BidRecord, Error> {
        if !self.jobs.contains_key(&bid.job) {
            return Err(Error::JobNotFound(bid.job));
        }
        bid.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.job_bids.entry(bid.job).or_default().push(bid.id);
        self.bids.insert(bid.id, bid.clone());
        Ok(bid)
    }

    async fn get_bid(&self, id: &BidId) -> Result<BidRecord, Error> {
        self.bids
            .get(id)
            .map(|bid| bid.clone())
            .ok_or(Error::BidNotFound(*id))
    }

    async fn eligible_bids(
        &self,
        id: &JobId,
        limit: usize,
    ) -> Result<Vec<BidRecord>, Error> {
        if !self.jobs.contains_key(id) {
            return Err(Error::JobNotFound(*id));
        }
        let busy = self.busy_executors(id);
        let ids = self
            .job_bids
            .get(id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut bids: Vec<BidRecord> = ids
            .iter()
            .filter_map(|bid| self.bids.get(bid).map(|bid| bid.clone()))
            .filter(|bid| !bid.late)
            .filter(|bid| !busy.contains(&bid.executor()))
            .collect();
        bids.sort_by(|a, b| {
            a.rate.cmp_asc(&b.rate).then(a.sequence.cmp(&b.sequence))
        });
        bids.truncate(limit);
        Ok(bids)
    }
}
