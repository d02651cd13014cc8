use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use model::domain::auction::{AuctionOutcome, ChosenBid};
use model::domain::category::Category;
use model::domain::rate::Rate;
use model::domain::stage::Stage;
use model::dto::job::JobRecord;
use model::view::auction::BidReceipt;
use model::{ClientId, DeviceId, JobId, WorkerId};
use serde_json::Value;

use crate::prom_metrics::{EVENT_CATEGORIES, LIVE_AUCTIONS, WATCHED_JOBS};
use crate::repository::auction::AuctionTable;
use crate::repository::category_board::Event;
use crate::repository::cron::Cron;
use crate::repository::notifier::CancellationNotifier;
use crate::repository::status_store::StatusStore;
use crate::repository::subscribers::{Connection, SubscriberInfo};
use crate::service::auction::AuctionRunner;
use crate::service::bidding::BidRegistry;
use crate::service::hub::Hub;
use crate::service::status::JobStatus;
use crate::service::watchdog::Watchdog;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Bid(#[from] crate::service::bidding::Error),
    #[error(transparent)]
    Auction(#[from] crate::service::auction::Error),
    #[error(transparent)]
    Watchdog(#[from] crate::service::watchdog::Error),
    #[error(transparent)]
    Status(#[from] crate::service::status::Error),
    #[error(transparent)]
    Hub(#[from] crate::service::hub::Error),
    #[error(transparent)]
    Store(#[from] crate::repository::status_store::Error),
}

/// Entry point of every operation on jobs: posting, bidding, auctions,
/// liveness, lifecycle stages and event distribution.
#[derive(Debug)]
pub struct Scheduler {
    store:    Arc<dyn StatusStore>,
    hub:      Arc<Hub>,
    bids:     BidRegistry,
    auctions: Arc<AuctionTable>,
    runner:   AuctionRunner,
    watchdog: Arc<Watchdog>,
    status:   JobStatus,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StatusStore>,
        hub: Arc<Hub>,
        cron: Arc<Cron>,
        notifier: Option<Arc<dyn CancellationNotifier>>,
        liveness_timeout: Duration,
    ) -> Self {
        let auctions = Arc::new(AuctionTable::new());
        let watchdog =
            Arc::new(Watchdog::new(store.clone(), hub.clone(), liveness_timeout));
        Self {
            bids: BidRegistry::new(store.clone(), auctions.clone()),
            runner: AuctionRunner::new(
                store.clone(),
                auctions.clone(),
                hub.clone(),
                cron,
            ),
            status: JobStatus::new(
                store.clone(),
                hub.clone(),
                watchdog.clone(),
                auctions.clone(),
                notifier,
            ),
            store,
            hub,
            auctions,
            watchdog,
        }
    }

    pub async fn post_job(
        &self,
        client: ClientId,
        project: String,
    ) -> Result<JobId, Error> {
        trace!("post job of {} in {}", client, project);
        let job = JobRecord::new(client, project);
        let id = job.id;
        self.store.insert_job(job.clone()).await?;
        info!("Job {} posted by {}", id, client);

        if let Err(err) = self.hub.announce(&job) {
            warn!("Failed to announce job {}: {:?}", id, err);
        }
        Ok(id)
    }

    /// Stores the bid. An on-time bid on a running auction only returns once
    /// that auction closed, telling the bidder whether it won.
    pub async fn submit_bid(
        &self,
        job: JobId,
        worker: WorkerId,
        device: DeviceId,
        rate: Rate,
    ) -> Result<BidReceipt, Error> {
        let bid = self.bids.submit(job, worker, device, rate).await?;
        let mut receipt =
            BidReceipt { bid_id: bid.id, is_winner: false, late: bid.late };
        if bid.late {
            return Ok(receipt);
        }

        if let Some(auction) = self.auctions.get(&job) {
            let outcome = auction.closed().await;
            receipt.is_winner =
                outcome.winner().is_some_and(|chosen| chosen.bid == bid.id);
        }
        Ok(receipt)
    }

    /// Runs the auction of the job, or joins the one in progress. A won
    /// auction starts watching over the liveness of its executor.
    pub async fn run_auction(&self, job: JobId) -> Result<ChosenBid, Error> {
        match self.runner.run(job).await {
            Ok(chosen) => {
                self.watchdog.arm(job, (chosen.worker, chosen.device));
                Ok(chosen)
            }
            Err(crate::service::auction::Error::NoBids(id)) => {
                if let Err(err) = self.store.deactivate(&id).await {
                    error!(
                        "Failed to deactivate job {} left without bids: {:?}",
                        id, err
                    );
                }
                Err(crate::service::auction::Error::NoBids(id).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_auction_outcome(
        &self,
        job: &JobId,
    ) -> Result<AuctionOutcome, Error> {
        Ok(self.runner.outcome(job).await?)
    }

    pub async fn cancel_job(&self, job: JobId) -> Result<(), Error> {
        Ok(self.status.cancel(job).await?)
    }

    pub async fn post_heartbeat(
        &self,
        job: JobId,
        worker: WorkerId,
        device: DeviceId,
    ) -> Result<(), Error> {
        Ok(self.watchdog.heartbeat(job, worker, device).await?)
    }

    pub async fn subscribe(
        &self,
        category: &Category,
        wait: Duration,
    ) -> Option<Event> {
        self.hub.subscribe(category, wait).await
    }

    pub fn publish(&self, category: Category, payload: Value) -> DateTime<Utc> {
        self.hub.publish(category, payload)
    }

    /// Sets the stage and returns when it was reached.
    pub async fn set_stage(
        &self,
        job: JobId,
        stage: Stage,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        self.status.set_stage(job, stage).await?;
        self.get_stage(&job, stage).await
    }

    pub async fn get_stage(
        &self,
        job: &JobId,
        stage: Stage,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self.status.get_stage(job, stage).await?)
    }

    pub async fn request_output(
        &self,
        job: &JobId,
    ) -> Result<DateTime<Utc>, Error> {
        Ok(self.status.request_output(job).await?)
    }

    pub fn connect_worker(&self, worker: WorkerId) -> Result<Connection, Error> {
        Ok(self.hub.connect(worker)?)
    }

    /// Drops expired events and refreshes the occupancy gauges. Returns how
    /// many events were dropped.
    pub fn sweep(&self) -> usize {
        let dropped = self.hub.sweep();
        LIVE_AUCTIONS.set(self.auctions.len() as f64);
        WATCHED_JOBS.set(self.watchdog.watched() as f64);
        EVENT_CATEGORIES.set(self.hub.categories() as f64);
        dropped
    }

    pub async fn connected_workers(
        &self,
    ) -> Result<Vec<SubscriberInfo>, Error> {
        Ok(self.hub.connected().await?)
    }
}
