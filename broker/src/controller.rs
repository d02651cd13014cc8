use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use model::domain::category::{Category, CategoryError};
use model::domain::stage::{Stage, UnknownStage};
use model::view::auction::{AuctionStatus, AuctionWon, BidReceipt, PostBid};
use model::view::hub::Published;
use model::view::job::{PostHeartbeat, PostJob, PostedJob, StageStatus};
use model::{JobId, WorkerId};
use serde_json::Value;

use crate::repository::category_board::Event;
use crate::repository::status_store::Error as StoreError;
use crate::repository::subscribers::{Connection, SubscriberInfo};
use crate::service::scheduler::{Error as SchedulerError, Scheduler};

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Category(#[from] CategoryError),
    #[error(transparent)]
    Stage(#[from] UnknownStage),
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

impl actix_web::error::ResponseError for ControllerError {
    fn status_code(&self) -> StatusCode {
        match self {
            ControllerError::Scheduler(err) => scheduler_status(err),
            ControllerError::Category(_) | ControllerError::Stage(_) => {
                StatusCode::BAD_REQUEST
            }
            ControllerError::Metrics(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{:?}", self);
        } else {
            debug!("Refused request: {}", self);
        }
        HttpResponse::build(status)
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

fn scheduler_status(err: &SchedulerError) -> StatusCode {
    use crate::service::{auction, bidding, status, watchdog};

    match err {
        SchedulerError::Bid(bidding::Error::Store(err))
        | SchedulerError::Auction(auction::Error::Store(err))
        | SchedulerError::Watchdog(watchdog::Error::Store(err))
        | SchedulerError::Status(status::Error::Store(err))
        | SchedulerError::Store(err) => store_status(err),

        SchedulerError::Auction(auction::Error::NoBids(_)) => {
            StatusCode::PAYMENT_REQUIRED
        }
        SchedulerError::Auction(auction::Error::MissingStage(..))
        | SchedulerError::Status(
            status::Error::MissingStage { .. }
            | status::Error::OwnedByAuction(_)
            | status::Error::OutputNotReady(_),
        ) => StatusCode::BAD_REQUEST,
        SchedulerError::Auction(auction::Error::Aborted(_))
        | SchedulerError::Hub(_) => StatusCode::INTERNAL_SERVER_ERROR,

        SchedulerError::Bid(_)
        | SchedulerError::Auction(_)
        | SchedulerError::Watchdog(_)
        | SchedulerError::Status(_) => StatusCode::CONFLICT,
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::JobNotFound(_) | StoreError::BidNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StoreError::Duplicate(_) => StatusCode::CONFLICT,
        StoreError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn post_job(
    payload: PostJob,
    scheduler: &Scheduler,
) -> Result<PostedJob, ControllerError> {
    trace!("post job: {:?}", payload);
    let job_id =
        scheduler.post_job(payload.client_id, payload.project).await?;
    Ok(PostedJob { job_id })
}

/// Stores the bid; an on-time bid answers once the auction it entered closed.
pub async fn submit_bid(
    job: JobId,
    payload: PostBid,
    scheduler: &Scheduler,
) -> Result<BidReceipt, ControllerError> {
    trace!("bid on {}: {:?}", job, payload);
    Ok(scheduler
        .submit_bid(job, payload.worker_id, payload.device_id, payload.rate)
        .await?)
}

/// Runs the auction of the job, can take the whole bidding window.
pub async fn run_auction(
    job: JobId,
    scheduler: &Scheduler,
) -> Result<AuctionWon, ControllerError> {
    trace!("run auction of {}", job);
    Ok(scheduler.run_auction(job).await?.into())
}

pub async fn get_auction(
    job: JobId,
    scheduler: &Scheduler,
) -> Result<AuctionStatus, ControllerError> {
    Ok(scheduler.get_auction_outcome(&job).await?.into())
}

pub async fn cancel_job(
    job: JobId,
    scheduler: &Scheduler,
) -> Result<(), ControllerError> {
    trace!("cancel {}", job);
    Ok(scheduler.cancel_job(job).await?)
}

pub async fn post_heartbeat(
    job: JobId,
    payload: PostHeartbeat,
    scheduler: &Scheduler,
) -> Result<(), ControllerError> {
    Ok(scheduler
        .post_heartbeat(job, payload.worker_id, payload.device_id)
        .await?)
}

pub async fn set_stage(
    job: JobId,
    stage: &str,
    scheduler: &Scheduler,
) -> Result<StageStatus, ControllerError> {
    let stage: Stage = stage.parse()?;
    let at = scheduler.set_stage(job, stage).await?;
    Ok(StageStatus { stage, at })
}

pub async fn get_stage(
    job: JobId,
    stage: &str,
    scheduler: &Scheduler,
) -> Result<StageStatus, ControllerError> {
    let stage: Stage = stage.parse()?;
    let at = scheduler.get_stage(&job, stage).await?;
    Ok(StageStatus { stage, at })
}

pub async fn request_output(
    job: JobId,
    scheduler: &Scheduler,
) -> Result<StageStatus, ControllerError> {
    let at = scheduler.request_output(&job).await?;
    Ok(StageStatus { stage: Stage::OutputDataPosted, at: Some(at) })
}

pub async fn subscribe(
    category: &str,
    wait: Duration,
    scheduler: &Scheduler,
) -> Result<Option<Event>, ControllerError> {
    let category = Category::parse(category)?;
    Ok(scheduler.subscribe(&category, wait).await)
}

pub fn publish(
    category: &str,
    payload: Value,
    scheduler: &Scheduler,
) -> Result<Published, ControllerError> {
    let category = Category::parse(category)?;
    let published_at = scheduler.publish(category.clone(), payload);
    Ok(Published { category, published_at })
}

pub fn connect_worker(
    worker: WorkerId,
    scheduler: &Scheduler,
) -> Result<Connection, ControllerError> {
    trace!("worker {} connecting", worker);
    Ok(scheduler.connect_worker(worker)?)
}

pub async fn connected_workers(
    scheduler: &Scheduler,
) -> Result<Vec<SubscriberInfo>, ControllerError> {
    Ok(scheduler.connected_workers().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::auction;
    use actix_web::ResponseError;
    use yare::parameterized;

    #[parameterized(
        no_bids = {SchedulerError::Auction(auction::Error::NoBids(JobId::generate())), StatusCode::PAYMENT_REQUIRED},
        missing = {SchedulerError::Auction(auction::Error::MissingStage(JobId::generate(), Stage::ImageBuilt)), StatusCode::BAD_REQUEST},
        inactive = {SchedulerError::Auction(auction::Error::JobNotActive(JobId::generate())), StatusCode::CONFLICT},
        not_found = {SchedulerError::Store(StoreError::JobNotFound(JobId::generate())), StatusCode::NOT_FOUND},
        unavailable = {SchedulerError::Store(StoreError::Unavailable("down".into())), StatusCode::INTERNAL_SERVER_ERROR}
    )]
    fn test_status_codes(err: SchedulerError, expected: StatusCode) {
        assert_eq!(ControllerError::from(err).status_code(), expected);
    }

    #[test]
    fn test_malformed_inputs_are_bad_requests() {
        let stage = "nope".parse::<Stage>().unwrap_err();
        assert_eq!(
            ControllerError::from(stage).status_code(),
            StatusCode::BAD_REQUEST
        );
        let category = Category::parse("two words").unwrap_err();
        assert_eq!(
            ControllerError::from(category).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
