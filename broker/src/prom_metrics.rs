use lazy_static::lazy_static;
use prometheus::{
    opts, register_counter, register_counter_vec, register_gauge, Counter,
    CounterVec, Gauge,
};

macro_rules! PREFIX {
    () => {
        "broker_"
    };
}

lazy_static! {
    pub static ref BIDS_RECEIVED: CounterVec = {
        register_counter_vec!(
            opts!(
                concat!(PREFIX!(), "bids_received"),
                "Number of bids stored, by lateness."
            ),
            &["late"]
        )
        .unwrap()
    };
    pub static ref AUCTIONS_CLOSED: CounterVec = {
        register_counter_vec!(
            opts!(
                concat!(PREFIX!(), "auctions_closed"),
                "Number of auctions that reached their close, by outcome \
                 (won, no_bids)."
            ),
            &["outcome"]
        )
        .unwrap()
    };
    pub static ref WATCHDOG_FAILURES: Counter = {
        register_counter!(opts!(
            concat!(PREFIX!(), "watchdog_failures"),
            "Number of jobs failed because their heartbeats stopped."
        ))
        .unwrap()
    };
    pub static ref JOBS_RETIRED: CounterVec = {
        register_counter_vec!(
            opts!(
                concat!(PREFIX!(), "jobs_retired"),
                "Number of jobs that reached a terminal state, by terminal \
                 state."
            ),
            &["terminal"]
        )
        .unwrap()
    };
    pub static ref SUBSCRIBERS_EVICTED: Counter = {
        register_counter!(opts!(
            concat!(PREFIX!(), "subscribers_evicted"),
            "Number of worker connections dropped for not draining their \
             queue."
        ))
        .unwrap()
    };
    pub static ref CONNECTED_WORKERS: Gauge = {
        register_gauge!(opts!(
            concat!(PREFIX!(), "connected_workers"),
            "Number of worker connections receiving job announcements."
        ))
        .unwrap()
    };
    pub static ref NOTIFY_FAILURES: Counter = {
        register_counter!(opts!(
            concat!(PREFIX!(), "cancel_notify_failures"),
            "Number of cancellations the downstream service could not be \
             told about."
        ))
        .unwrap()
    };
    pub static ref LIVE_AUCTIONS: Gauge = {
        register_gauge!(opts!(
            concat!(PREFIX!(), "live_auctions"),
            "Number of auction runs held in memory."
        ))
        .unwrap()
    };
    pub static ref WATCHED_JOBS: Gauge = {
        register_gauge!(opts!(
            concat!(PREFIX!(), "watched_jobs"),
            "Number of executing jobs with an armed liveness watchdog."
        ))
        .unwrap()
    };
    pub static ref EVENT_CATEGORIES: Gauge = {
        register_gauge!(opts!(
            concat!(PREFIX!(), "event_categories"),
            "Number of categories with queued events or waiting subscribers."
        ))
        .unwrap()
    };
}
