use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use model::domain::auction::{AuctionOutcome, ChosenBid};
use model::dto::bid::BidRecord;
use model::JobId;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    LateGrace,
    Closed,
    /// The run failed before it could settle, nothing was decided.
    Aborted,
}

impl Phase {
    pub fn is_final(&self) -> bool {
        matches!(self, Phase::Closed | Phase::Aborted)
    }
}

/// In-memory run of one auction. Both guarded slots are written by the
/// runner only, and read concurrently by bid submissions and pollers.
#[derive(Debug)]
pub struct AuctionRecord {
    pub job:        JobId,
    pub created_at: Instant,
    winner:         Mutex<Option<ChosenBid>>,
    late:           Mutex<bool>,
    phase:          watch::Sender<Phase>,
}

impl AuctionRecord {
    fn new(job: JobId) -> Self {
        let (phase, _) = watch::channel(Phase::Open);
        Self {
            job,
            created_at: Instant::now(),
            winner: Mutex::new(None),
            late: Mutex::new(false),
            phase,
        }
    }

    pub fn phase(&self) -> Phase { *self.phase.borrow() }

    /// Holding the guard keeps the window from closing, so a bid persisted
    /// under it carries a lateness that agrees with the runner.
    pub async fn lateness(&self) -> MutexGuard<'_, bool> {
        self.late.lock().await
    }

    /// End of the bidding window: every bid from now on is late.
    pub async fn close_window(&self) {
        let mut late = self.late.lock().await;
        *late = true;
        self.phase.send_replace(Phase::LateGrace);
    }

    /// Fills the winner slot. Only the first settlement has any effect.
    pub async fn settle(&self, chosen: Option<ChosenBid>) -> AuctionOutcome {
        let mut winner = self.winner.lock().await;
        if !self.phase().is_final() {
            *winner = chosen;
            self.phase.send_replace(Phase::Closed);
        }
        drop(winner);
        self.outcome().await
    }

    /// Releases the waiters of a run that could not settle.
    pub async fn abort(&self) {
        let _winner = self.winner.lock().await;
        if !self.phase().is_final() {
            self.phase.send_replace(Phase::Aborted);
        }
    }

    pub async fn outcome(&self) -> AuctionOutcome {
        let winner = self.winner.lock().await;
        match (self.phase(), *winner) {
            (Phase::Closed, Some(chosen)) => AuctionOutcome::Won(chosen),
            (Phase::Closed, None) => AuctionOutcome::NoBids,
            _ => AuctionOutcome::Pending,
        }
    }

    /// Resolves once the runner has settled or aborted the auction. An
    /// aborted run reads as [`AuctionOutcome::Pending`].
    pub async fn closed(&self) -> AuctionOutcome {
        let mut phase = self.phase.subscribe();
        // The sender lives in `self`, the wait cannot fail while borrowed
        let _ = phase.wait_for(Phase::is_final).await;
        self.outcome().await
    }
}

/// Live auctions indexed by job.
#[derive(Debug, Default)]
pub struct AuctionTable {
    auctions: DashMap<JobId, Arc<AuctionRecord>>,
}

impl AuctionTable {
    pub fn new() -> Self { Self::default() }

    /// Returns the live record of the job, creating it if there is none.
    /// The boolean tells whether the caller created it and thus owns the run.
    pub fn open(&self, job: JobId) -> (Arc<AuctionRecord>, bool) {
        match self.auctions.entry(job) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let record = Arc::new(AuctionRecord::new(job));
                entry.insert(record.clone());
                (record, true)
            }
        }
    }

    pub fn get(&self, job: &JobId) -> Option<Arc<AuctionRecord>> {
        self.auctions.get(job).map(|record| record.clone())
    }

    /// Removes this exact record, leaving alone any newer run of the job.
    pub fn evict(&self, record: &Arc<AuctionRecord>) -> bool {
        self.auctions
            .remove_if(&record.job, |_, live| Arc::ptr_eq(live, record))
            .is_some()
    }

    pub fn remove(&self, job: &JobId) { self.auctions.remove(job); }

    pub fn len(&self) -> usize { self.auctions.len() }
}

/// Second-price selection over bids already ordered cheapest first: the
/// cheapest bid wins and pays the rate of the runner-up, or its own rate when
/// it is alone.
pub fn second_price(bids: &[BidRecord]) -> Option<ChosenBid> {
    let first = bids.first();
    let second = bids.get(1);
    match (first, second) {
        (Some(first), Some(second)) => Some(ChosenBid {
            bid:    first.id,
            worker: first.worker,
            device: first.device,
            price:  second.rate,
        }),
        (Some(first), None) => Some(ChosenBid {
            bid:    first.id,
            worker: first.worker,
            device: first.device,
            price:  first.rate,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::domain::rate::Rate;
    use model::{DeviceId, WorkerId};
    use yare::parameterized;

    fn bids(rates: &[f64]) -> Vec<BidRecord> {
        rates
            .iter()
            .enumerate()
            .map(|(sequence, rate)| BidRecord {
                sequence: sequence as u64,
                ..BidRecord::new(
                    JobId::generate(),
                    WorkerId::generate(),
                    DeviceId::generate(),
                    Rate::try_new(*rate).unwrap(),
                    false,
                )
            })
            .collect()
    }

    #[parameterized(
        alone = {&[2.0], 2.0},
        pair = {&[1.0, 1.5], 1.5},
        three_takes_runner_up = {&[1.0, 1.5, 2.0], 1.5},
        tie = {&[1.0, 1.0], 1.0}
    )]
    fn test_clearing_price(rates: &[f64], price: f64) {
        let bids = bids(rates);
        let chosen = second_price(&bids).unwrap();
        assert_eq!(chosen.bid, bids[0].id);
        assert_eq!(chosen.price.into_inner(), price);
    }

    #[test]
    fn test_no_bids_no_winner() {
        assert_eq!(second_price(&[]), None);
    }

    #[tokio::test]
    async fn test_open_returns_the_live_record() {
        let table = AuctionTable::new();
        let job = JobId::generate();
        let (first, created) = table.open(job);
        assert!(created);
        let (again, created) = table.open(job);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &again));

        table.remove(&job);
        let (fresh, created) = table.open(job);
        assert!(created);
        // The stale record cannot evict its successor
        assert!(!table.evict(&first));
        assert!(table.evict(&fresh));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_settle_is_write_once() {
        let record = AuctionRecord::new(JobId::generate());
        assert_eq!(record.outcome().await, AuctionOutcome::Pending);
        let bids = bids(&[1.0]);
        let chosen = second_price(&bids);

        record.close_window().await;
        assert!(*record.lateness().await);
        assert_eq!(record.phase(), Phase::LateGrace);

        let won = AuctionOutcome::Won(chosen.unwrap());
        assert_eq!(record.settle(chosen).await, won);
        assert_eq!(record.settle(None).await, won);
        record.abort().await;
        assert_eq!(record.closed().await, won);
    }

    #[tokio::test]
    async fn test_aborted_run_releases_waiters_without_outcome() {
        let record = Arc::new(AuctionRecord::new(JobId::generate()));
        let waiter = {
            let record = record.clone();
            tokio::spawn(async move { record.closed().await })
        };
        record.abort().await;
        assert_eq!(waiter.await.unwrap(), AuctionOutcome::Pending);
        assert_eq!(record.phase(), Phase::Aborted);
        // Settling after an abort changes nothing
        assert_eq!(record.settle(None).await, AuctionOutcome::Pending);
    }
}
