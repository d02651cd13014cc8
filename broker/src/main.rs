#[macro_use]
extern crate tracing;

use std::sync::Arc;

use actix_web::web::Data;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

use crate::handler::*;
use crate::repository::category_board::CategoryBoard;
use crate::repository::cron::Cron;
use crate::repository::notifier::{
    CancellationNotifier, CancellationNotifierREST,
};
use crate::repository::status_store::{StatusStore, StatusStoreImpl};
use crate::repository::subscribers::SubscriberRegistry;
use crate::service::hub::Hub;
use crate::service::scheduler::Scheduler;
use crate::settings::Settings;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod controller;
mod handler;
mod prom_metrics;
mod repeated_tasks;
mod repository;
mod service;
mod settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = helper::init::init_subscriber("broker", "info")
        .context("Failed to initialize tracing")?;

    debug!("Tracing initialized.");

    let settings = Settings::from_env()?;
    let event_ttl = settings.event_ttl();

    let store: Arc<dyn StatusStore> = Arc::new(StatusStoreImpl::new());
    let cron = Arc::new(Cron::new());
    let hub = Arc::new(Hub::new(
        SubscriberRegistry::spawn(settings.subscriber_queue_size.into_inner()),
        Arc::new(CategoryBoard::new(event_ttl)),
        cron.clone(),
        event_ttl,
    ));

    let notifier = settings.cancel_notify_url.clone().map(|url| {
        Arc::new(CancellationNotifierREST::new(
            url.into_inner(),
            reqwest::Client::new(),
            settings.notify_max_retries.into_inner(),
        )) as Arc<dyn CancellationNotifier>
    });
    if notifier.is_none() {
        info!("No cancellation notification target configured");
    }

    let scheduler = Arc::new(Scheduler::new(
        store,
        hub,
        cron.clone(),
        notifier,
        settings.liveness_timeout(),
    ));

    repeated_tasks::init(&cron, scheduler.clone(), settings.sweep_period());

    let port = settings.server_port.into_inner();
    info!("Starting HTTP server on 0.0.0.0:{}", port);

    let scheduler = Data::from(scheduler);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Compress::default())
            .app_data(Data::clone(&scheduler))
            .route("/metrics", web::get().to(metrics))
            .service(
                web::scope("/api")
                    .route("/job", web::post().to(post_job))
                    .route("/job/{id}/bid", web::post().to(post_bid))
                    .route("/job/{id}/auction", web::post().to(post_auction))
                    .route("/job/{id}/auction", web::get().to(get_auction))
                    .route("/job/{id}/cancel", web::post().to(post_cancel))
                    .route(
                        "/job/{id}/heartbeat",
                        web::post().to(post_heartbeat),
                    )
                    .route("/job/{id}/stage/{stage}", web::put().to(put_stage))
                    .route("/job/{id}/stage/{stage}", web::get().to(get_stage))
                    .route("/job/{id}/output", web::get().to(get_output))
                    .route("/workers", web::get().to(get_workers))
                    .route(
                        "/worker/{worker_id}/jobs",
                        web::get().to(get_worker_jobs),
                    )
                    .route("/events/{category}", web::get().to(get_event))
                    .route("/events/{category}", web::post().to(post_event))
                    .route("/health", web::get().to(health)),
            )
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    cron.shutdown();

    Ok(())
}
