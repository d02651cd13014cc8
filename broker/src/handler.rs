use std::time::Duration;

use actix_web::http::header::{self, CacheControl, CacheDirective};
use actix_web::web::{self, Data, Json};
use actix_web::HttpResponse;
use bytes::Bytes;
use model::view::auction::PostBid;
use model::view::job::{PostHeartbeat, PostJob};
use model::{JobId, WorkerId};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::Value;

use crate::controller::{self, ControllerError};
use crate::service::scheduler::Scheduler;

/// Wait of a long poll when the caller does not say.
const DEFAULT_LONG_POLL: Duration = Duration::from_secs(30);

pub async fn post_job(
    payload: Json<PostJob>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res = controller::post_job(payload.0, &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn post_bid(
    job: web::Path<JobId>,
    payload: Json<PostBid>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res =
        controller::submit_bid(job.into_inner(), payload.0, &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn post_auction(
    job: web::Path<JobId>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res = controller::run_auction(job.into_inner(), &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn get_auction(
    job: web::Path<JobId>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res = controller::get_auction(job.into_inner(), &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn post_cancel(
    job: web::Path<JobId>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    controller::cancel_job(job.into_inner(), &scheduler).await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn post_heartbeat(
    job: web::Path<JobId>,
    payload: Json<PostHeartbeat>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    controller::post_heartbeat(job.into_inner(), payload.0, &scheduler)
        .await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn put_stage(
    path: web::Path<(JobId, String)>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let (job, stage) = path.into_inner();
    let res = controller::set_stage(job, &stage, &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn get_stage(
    path: web::Path<(JobId, String)>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let (job, stage) = path.into_inner();
    let res = controller::get_stage(job, &stage, &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn get_output(
    job: web::Path<JobId>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res = controller::request_output(job.into_inner(), &scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

/// Streams the announcement of every new job to the worker as server-sent
/// events, until the broker drops a worker that stopped reading.
pub async fn get_worker_jobs(
    worker: web::Path<WorkerId>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let connection =
        controller::connect_worker(worker.into_inner(), &scheduler)?;

    let stream = futures::stream::unfold(connection, |mut conn| async move {
        let posted = conn.recv().await?;
        let data = serde_json::to_string(&posted).unwrap_or_else(|err| {
            error!("Failed to serialize announcement: {}", err);
            "{}".to_string()
        });
        let frame = Bytes::from(format!("data: {}\n\n", data));
        Some((Ok::<_, actix_web::Error>(frame), conn))
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(CacheControl(vec![CacheDirective::NoCache]))
        // Compressed frames would sit in the encoder
        .insert_header((header::CONTENT_ENCODING, "identity"))
        .streaming(stream))
}

/// Connections currently receiving job announcements.
pub async fn get_workers(
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res = controller::connected_workers(&scheduler).await?;
    Ok(HttpResponse::Ok().json(res))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    /// Seconds to wait for an event.
    timeout: Option<u64>,
}

pub async fn get_event(
    category: web::Path<String>,
    params: web::Query<SubscribeParams>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let wait = params.timeout.map_or(DEFAULT_LONG_POLL, Duration::from_secs);
    match controller::subscribe(&category, wait, &scheduler).await? {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::NoContent().finish()),
    }
}

pub async fn post_event(
    category: web::Path<String>,
    payload: Json<Value>,
    scheduler: Data<Scheduler>,
) -> Result<HttpResponse, ControllerError> {
    let res = controller::publish(&category, payload.0, &scheduler)?;
    Ok(HttpResponse::Ok().json(res))
}

pub async fn metrics() -> Result<HttpResponse, ControllerError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(HttpResponse::Ok().content_type(encoder.format_type()).body(buffer))
}

pub async fn health() -> HttpResponse { HttpResponse::Ok().finish() }
