use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use model::domain::auction::{AuctionOutcome, ChosenBid};
use model::domain::category::JobTopic;
use model::domain::stage::{Stage, Terminal};
use model::dto::job::WinnerRecord;
use model::view::hub::JobEvent;
use model::JobId;

use crate::prom_metrics::AUCTIONS_CLOSED;
use crate::repository::auction::{second_price, AuctionRecord, AuctionTable};
use crate::repository::cron::Cron;
use crate::repository::status_store::{AuctionWrite, StatusStore};
use crate::service::hub::Hub;

/// Bids arriving after this long are late.
pub const BIDDING_WINDOW: Duration = Duration::from_secs(3);
/// Lets submissions already in flight at the window close land.
pub const LATE_GRACE: Duration = Duration::from_millis(500);
/// How long a closed run stays in memory for racing submissions.
pub const EVICTION_DELAY: Duration = Duration::from_millis(2 * 3500);
/// Winner plus the runner-up setting the clearing rate.
const CANDIDATES: usize = 2;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No eligible bid was received for job {0}")]
    NoBids(JobId),
    #[error("Job {0} is already {1}")]
    JobTerminal(JobId, Terminal),
    #[error("Job {0} is not active")]
    JobNotActive(JobId),
    #[error("Job {0} cannot be auctioned before {1} is set")]
    MissingStage(JobId, Stage),
    #[error("The auction of job {0} was interrupted before settling")]
    Aborted(JobId),
    #[error(transparent)]
    Store(#[from] crate::repository::status_store::Error),
}

/// Runs the sealed-bid auction of a job: a fixed bidding window, a short
/// grace for in-flight bids, then a second-price selection written once.
#[derive(Debug)]
pub struct AuctionRunner {
    store:    Arc<dyn StatusStore>,
    auctions: Arc<AuctionTable>,
    hub:      Arc<Hub>,
    cron:     Arc<Cron>,
}

impl AuctionRunner {
    pub fn new(
        store: Arc<dyn StatusStore>,
        auctions: Arc<AuctionTable>,
        hub: Arc<Hub>,
        cron: Arc<Cron>,
    ) -> Self {
        Self { store, auctions, hub, cron }
    }

    /// Starts the auction of the job, or joins the run already going on.
    /// Resolves with the winner once the run closed.
    pub async fn run(&self, id: JobId) -> Result<ChosenBid, Error> {
        trace!("run auction for job {}", id);
        let job = self.store.get_job(&id).await?;
        if let Some(terminal) = job.terminal() {
            return Err(Error::JobTerminal(id, terminal));
        }
        if !job.active {
            return Err(Error::JobNotActive(id));
        }
        for stage in [Stage::DataSynced, Stage::ImageBuilt] {
            if !job.has(stage) {
                return Err(Error::MissingStage(id, stage));
            }
        }
        if let Some(winner) = job.winner {
            debug!("Auction of job {} was already decided", id);
            return self.durable_winner(winner).await;
        }

        let (record, owner) = self.auctions.open(id);
        if !owner {
            debug!("Joining the auction of job {} already running", id);
            return match record.closed().await {
                AuctionOutcome::Won(chosen) => Ok(chosen),
                AuctionOutcome::NoBids => Err(Error::NoBids(id)),
                AuctionOutcome::Pending => Err(Error::Aborted(id)),
            };
        }

        match self.close(&record).await {
            Ok(chosen) => {
                let outcome = record.settle(chosen).await;
                self.conclude(&record, outcome);
                outcome.winner().copied().ok_or(Error::NoBids(id))
            }
            Err(err) => {
                warn!("Auction of job {} aborted: {:?}", id, err);
                record.abort().await;
                self.auctions.evict(&record);
                Err(err)
            }
        }
    }

    /// Where the auction of the job stands, from the live run if any, from
    /// the store otherwise.
    pub async fn outcome(&self, id: &JobId) -> Result<AuctionOutcome, Error> {
        if let Some(record) = self.auctions.get(id) {
            let outcome = record.outcome().await;
            if outcome != AuctionOutcome::Pending || !record.phase().is_final()
            {
                return Ok(outcome);
            }
        }

        let job = self.store.get_job(id).await?;
        if let Some(winner) = job.winner {
            return Ok(AuctionOutcome::Won(self.durable_winner(winner).await?));
        }
        if job.auction_started_at.is_some() && !job.active {
            return Ok(AuctionOutcome::NoBids);
        }
        Ok(AuctionOutcome::Pending)
    }

    async fn close(
        &self,
        record: &AuctionRecord,
    ) -> Result<Option<ChosenBid>, Error> {
        let id = record.job;
        let started = self.store.mark_auction_started(&id, Utc::now()).await?;
        debug!("Auction of job {} opened at {}", id, started);

        tokio::time::sleep_until(record.created_at + BIDDING_WINDOW).await;
        record.close_window().await;
        trace!("Bidding window of job {} closed", id);
        tokio::time::sleep(LATE_GRACE).await;

        // An executor may win elsewhere between reading the candidates and
        // writing the winner, the store then refuses and we pick again
        loop {
            let bids = self.store.eligible_bids(&id, CANDIDATES).await?;
            let Some(chosen) = second_price(&bids) else {
                return Ok(None);
            };

            let winner = WinnerRecord { bid: chosen.bid, rate: chosen.price };
            match self.store.set_auction_result(&id, winner, Utc::now()).await? {
                AuctionWrite::Written => return Ok(Some(chosen)),
                AuctionWrite::AlreadyDecided(previous) => {
                    warn!(
                        "Auction of job {} was decided elsewhere, keeping bid {}",
                        id, previous.bid
                    );
                    return Ok(Some(self.durable_winner(previous).await?));
                }
                AuctionWrite::ExecutorBusy(holder) => {
                    debug!(
                        "{} on {} just won job {}, selecting again for job {}",
                        chosen.worker, chosen.device, holder, id
                    );
                }
                AuctionWrite::JobInactive => {
                    return Err(Error::JobNotActive(id))
                }
            }
        }
    }

    /// Publishes the outcome and schedules the eviction of the record.
    fn conclude(&self, record: &Arc<AuctionRecord>, outcome: AuctionOutcome) {
        let id = record.job;
        let chosen = outcome.winner().copied();
        match chosen {
            Some(chosen) => {
                AUCTIONS_CLOSED.with_label_values(&["won"]).inc();
                info!(
                    "Auction of job {} won by bid {} of {} on {}, clearing at \
                     {}",
                    id, chosen.bid, chosen.worker, chosen.device, chosen.price
                );
            }
            None => {
                AUCTIONS_CLOSED.with_label_values(&["no_bids"]).inc();
                info!("Auction of job {} closed without eligible bids", id);
            }
        }

        if let Err(err) = self.hub.publish_job_event(
            &id,
            JobTopic::Auction,
            &JobEvent::AuctionClosed { job_id: id, chosen },
        ) {
            warn!("Failed to publish the auction outcome of {}: {:?}", id, err);
        }

        let auctions = self.auctions.clone();
        let record = record.clone();
        self.cron.add_oneshot(EVICTION_DELAY, async move {
            if auctions.evict(&record) {
                trace!("Evicted the auction record of job {}", record.job);
            }
        });
    }

    async fn durable_winner(
        &self,
        winner: WinnerRecord,
    ) -> Result<ChosenBid, Error> {
        let bid = self.store.get_bid(&winner.bid).await?;
        Ok(ChosenBid {
            bid:    bid.id,
            worker: bid.worker,
            device: bid.device,
            price:  winner.rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::category_board::CategoryBoard;
    use crate::repository::status_store::StatusStoreImpl;
    use crate::repository::subscribers::SubscriberRegistry;
    use crate::service::bidding::BidRegistry;
    use model::domain::category::Category;
    use model::domain::rate::Rate;
    use model::dto::job::JobRecord;
    use model::{BidId, ClientId, DeviceId, WorkerId};

    struct Fixture {
        store:    Arc<StatusStoreImpl>,
        auctions: Arc<AuctionTable>,
        hub:      Arc<Hub>,
        runner:   Arc<AuctionRunner>,
        bids:     BidRegistry,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StatusStoreImpl::new());
        let auctions = Arc::new(AuctionTable::new());
        let cron = Arc::new(Cron::new());
        let hub = Arc::new(Hub::new(
            SubscriberRegistry::spawn(8),
            Arc::new(CategoryBoard::new(Duration::from_secs(60))),
            cron.clone(),
            Duration::from_secs(60),
        ));
        let runner = Arc::new(AuctionRunner::new(
            store.clone(),
            auctions.clone(),
            hub.clone(),
            cron,
        ));
        let bids = BidRegistry::new(store.clone(), auctions.clone());
        Fixture { store, auctions, hub, runner, bids }
    }

    async fn ready_job(store: &StatusStoreImpl) -> JobId {
        let job = JobRecord::new(ClientId::generate(), "proj".into());
        let id = job.id;
        store.insert_job(job).await.unwrap();
        store.set_stage(&id, Stage::DataSynced, Utc::now()).await.unwrap();
        store.set_stage(&id, Stage::ImageBuilt, Utc::now()).await.unwrap();
        id
    }

    async fn bid(f: &Fixture, job: JobId, rate: f64) -> BidId {
        f.bids
            .submit(
                job,
                WorkerId::generate(),
                DeviceId::generate(),
                Rate::try_new(rate).unwrap(),
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_price_over_three_bids() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        let a = bid(&f, job, 2.0).await;
        let b = bid(&f, job, 1.0).await;
        let c = bid(&f, job, 1.5).await;

        let chosen = f.runner.run(job).await.unwrap();

        assert_eq!(chosen.bid, b);
        assert_eq!(chosen.price.into_inner(), 1.5);
        assert_ne!(chosen.bid, a);
        assert_ne!(chosen.bid, c);
        let record = f.store.get_job(&job).await.unwrap();
        assert_eq!(record.winner.unwrap().bid, b);
        assert!(record.has(Stage::AuctionCompleted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_bid_clears_at_its_own_rate() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        let a = bid(&f, job, 2.0).await;

        let chosen = f.runner.run(job).await.unwrap();
        assert_eq!(chosen.bid, a);
        assert_eq!(chosen.price.into_inner(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_bids_sets_no_winner() {
        let f = fixture();
        let job = ready_job(&f.store).await;

        assert!(matches!(f.runner.run(job).await, Err(Error::NoBids(_))));
        assert_eq!(f.store.get_job(&job).await.unwrap().winner, None);
        assert_eq!(
            f.runner.outcome(&job).await.unwrap(),
            AuctionOutcome::NoBids
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_bid_never_wins() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        let on_time = bid(&f, job, 5.0).await;

        let runner = f.runner.clone();
        let run = tokio::spawn(async move { runner.run(job).await });
        tokio::time::sleep(BIDDING_WINDOW + Duration::from_millis(100)).await;
        let late = f
            .bids
            .submit(
                job,
                WorkerId::generate(),
                DeviceId::generate(),
                Rate::try_new(0.1).unwrap(),
            )
            .await
            .unwrap();

        let chosen = run.await.unwrap().unwrap();
        assert!(late.late);
        assert_eq!(chosen.bid, on_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_agree_on_one_winner() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        bid(&f, job, 1.0).await;
        bid(&f, job, 1.2).await;

        let first = {
            let runner = f.runner.clone();
            tokio::spawn(async move { runner.run(job).await })
        };
        let second = {
            let runner = f.runner.clone();
            tokio::spawn(async move { runner.run(job).await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        // A rerun after the close reads the durable result
        assert_eq!(f.runner.run(job).await.unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_guards_are_checked() {
        let f = fixture();
        let job = JobRecord::new(ClientId::generate(), "proj".into());
        let id = job.id;
        f.store.insert_job(job).await.unwrap();
        f.store.set_stage(&id, Stage::DataSynced, Utc::now()).await.unwrap();

        assert!(matches!(
            f.runner.run(id).await,
            Err(Error::MissingStage(_, Stage::ImageBuilt))
        ));
        assert_eq!(f.auctions.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_job_cannot_be_auctioned() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        f.store.set_terminal(&job, Terminal::Canceled, Utc::now()).await.unwrap();

        assert!(matches!(
            f.runner.run(job).await,
            Err(Error::JobTerminal(_, Terminal::Canceled))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_the_window_aborts_the_run() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        bid(&f, job, 1.0).await;

        let runner = f.runner.clone();
        let run = tokio::spawn(async move { runner.run(job).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        f.store.set_terminal(&job, Terminal::Canceled, Utc::now()).await.unwrap();

        assert!(matches!(run.await.unwrap(), Err(Error::JobNotActive(_))));
        assert_eq!(f.store.get_job(&job).await.unwrap().winner, None);
        assert_eq!(f.auctions.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_is_published_and_record_evicted() {
        let f = fixture();
        let job = ready_job(&f.store).await;
        let a = bid(&f, job, 3.0).await;
        f.runner.run(job).await.unwrap();

        let event = f
            .hub
            .subscribe(
                &Category::for_job(&job, JobTopic::Auction),
                Duration::ZERO,
            )
            .await
            .unwrap();
        match serde_json::from_value::<JobEvent>(event.payload).unwrap() {
            JobEvent::AuctionClosed { chosen: Some(chosen), .. } => {
                assert_eq!(chosen.bid, a)
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(f.auctions.len(), 1);
        tokio::time::sleep(EVICTION_DELAY + Duration::from_millis(1)).await;
        assert_eq!(f.auctions.len(), 0);
        assert!(matches!(
            f.runner.outcome(&job).await.unwrap(),
            AuctionOutcome::Won(chosen) if chosen.bid == a
        ));
    }
}
