use std::sync::Arc;

use model::domain::rate::Rate;
use model::domain::stage::{Stage, Terminal};
use model::dto::bid::BidRecord;
use model::dto::job::JobRecord;
use model::{DeviceId, JobId, WorkerId};

use crate::prom_metrics::BIDS_RECEIVED;
use crate::repository::auction::AuctionTable;
use crate::repository::status_store::StatusStore;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Job {0} is already {1}")]
    JobTerminal(JobId, Terminal),
    #[error("Job {0} is not open for bidding anymore")]
    JobNotActive(JobId),
    #[error(transparent)]
    Store(#[from] crate::repository::status_store::Error),
}

/// Records bids, each tagged late or on time once and for all.
#[derive(Debug)]
pub struct BidRegistry {
    store:    Arc<dyn StatusStore>,
    auctions: Arc<AuctionTable>,
}

impl BidRegistry {
    pub fn new(store: Arc<dyn StatusStore>, auctions: Arc<AuctionTable>) -> Self {
        Self { store, auctions }
    }

    pub async fn submit(
        &self,
        job: JobId,
        worker: WorkerId,
        device: DeviceId,
        rate: Rate,
    ) -> Result<BidRecord, Error> {
        trace!("bid of {} on {} for job {} at {}", worker, device, job, rate);
        let record = self.store.get_job(&job).await?;
        if let Some(terminal) = record.terminal() {
            return Err(Error::JobTerminal(job, terminal));
        }
        if !record.active {
            return Err(Error::JobNotActive(job));
        }

        let bid = match self.auctions.get(&job) {
            Some(auction) => {
                // Held until the bid is stored so the window cannot close in
                // between
                let late = auction.lateness().await;
                let bid = self
                    .store
                    .insert_bid(BidRecord::new(job, worker, device, rate, *late))
                    .await?;
                drop(late);
                bid
            }
            None => {
                let late = auction_already_ran(&record);
                self.store
                    .insert_bid(BidRecord::new(job, worker, device, rate, late))
                    .await?
            }
        };

        BIDS_RECEIVED.with_label_values(&[&bid.late.to_string()]).inc();
        debug!(
            "Stored bid {} of {} on {} for job {} (late: {})",
            bid.id, worker, device, job, bid.late
        );
        Ok(bid)
    }
}

/// With no live run in memory, the durable start timestamp tells whether the
/// window already came and went.
fn auction_already_ran(job: &JobRecord) -> bool {
    job.auction_started_at.is_some() || job.has(Stage::AuctionCompleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::status_store::StatusStoreImpl;
    use chrono::Utc;
    use model::ClientId;

    fn rate(value: f64) -> Rate { Rate::try_new(value).unwrap() }

    async fn setup() -> (BidRegistry, Arc<StatusStoreImpl>, Arc<AuctionTable>, JobId)
    {
        let store = Arc::new(StatusStoreImpl::new());
        let auctions = Arc::new(AuctionTable::new());
        let job = JobRecord::new(ClientId::generate(), "proj".into());
        let id = job.id;
        store.insert_job(job).await.unwrap();
        (BidRegistry::new(store.clone(), auctions.clone()), store, auctions, id)
    }

    #[tokio::test]
    async fn test_bid_before_any_auction_is_on_time() {
        let (registry, store, _, job) = setup().await;
        let bid = registry
            .submit(job, WorkerId::generate(), DeviceId::generate(), rate(1.0))
            .await
            .unwrap();
        assert!(!bid.late);
        assert_eq!(store.get_bid(&bid.id).await.unwrap(), bid);
    }

    #[tokio::test]
    async fn test_lateness_follows_the_live_auction() {
        let (registry, _, auctions, job) = setup().await;
        let (auction, _) = auctions.open(job);

        let on_time = registry
            .submit(job, WorkerId::generate(), DeviceId::generate(), rate(1.0))
            .await
            .unwrap();
        auction.close_window().await;
        let late = registry
            .submit(job, WorkerId::generate(), DeviceId::generate(), rate(0.5))
            .await
            .unwrap();

        assert!(!on_time.late);
        assert!(late.late);
    }

    #[tokio::test]
    async fn test_evicted_auction_falls_back_to_durable_start() {
        let (registry, store, _, job) = setup().await;
        store.mark_auction_started(&job, Utc::now()).await.unwrap();

        let bid = registry
            .submit(job, WorkerId::generate(), DeviceId::generate(), rate(1.0))
            .await
            .unwrap();
        assert!(bid.late);
    }

    #[tokio::test]
    async fn test_terminal_and_inactive_jobs_refuse_bids() {
        let (registry, store, _, job) = setup().await;
        store.deactivate(&job).await.unwrap();
        assert!(matches!(
            registry
                .submit(job, WorkerId::generate(), DeviceId::generate(), rate(1.0))
                .await,
            Err(Error::JobNotActive(_))
        ));

        let (registry, store, _, job) = setup().await;
        store.set_terminal(&job, Terminal::Canceled, Utc::now()).await.unwrap();
        assert!(matches!(
            registry
                .submit(job, WorkerId::generate(), DeviceId::generate(), rate(1.0))
                .await,
            Err(Error::JobTerminal(_, Terminal::Canceled))
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (registry, ..) = setup().await;
        let err = registry
            .submit(
                JobId::generate(),
                WorkerId::generate(),
                DeviceId::generate(),
                rate(1.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(crate::repository::status_store::Error::JobNotFound(_))
        ));
    }
}
