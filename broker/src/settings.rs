use std::time::Duration;

use anyhow::{Context, Result};
use helper::{env_load, env_load_or, env_var};
use nutype::nutype;

env_var!(SERVER_PORT);
env_var!(LIVENESS_TIMEOUT_SECS);
env_var!(EVENT_TTL_SECS);
env_var!(SUBSCRIBER_QUEUE_SIZE);
env_var!(SWEEP_PERIOD_SECS);
env_var!(CANCEL_NOTIFY_URL);
env_var!(NOTIFY_MAX_RETRIES);

#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq))]
pub struct ServerPort(u16);

#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq))]
pub struct LivenessTimeoutSecs(u64);

#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq))]
pub struct EventTtlSecs(u64);

#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq))]
pub struct SubscriberQueueSize(usize);

#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq))]
pub struct SweepPeriodSecs(u64);

#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq))]
pub struct NotifyMaxRetries(u32);

#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(Debug, Clone, PartialEq)
)]
pub struct CancelNotifyUrl(String);

/// Runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_port:           ServerPort,
    pub liveness_timeout:      LivenessTimeoutSecs,
    pub event_ttl:             EventTtlSecs,
    pub subscriber_queue_size: SubscriberQueueSize,
    pub sweep_period:          SweepPeriodSecs,
    pub cancel_notify_url:     Option<CancelNotifyUrl>,
    pub notify_max_retries:    NotifyMaxRetries,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let cancel_notify_url = match std::env::var(CANCEL_NOTIFY_URL) {
            Ok(raw) => Some(CancelNotifyUrl::try_new(raw).with_context(
                || format!("{} was not formatted right", CANCEL_NOTIFY_URL),
            )?),
            Err(_) => None,
        };

        Ok(Self {
            server_port: env_load!(ServerPort, SERVER_PORT, u16),
            liveness_timeout: env_load_or!(
                LivenessTimeoutSecs,
                LIVENESS_TIMEOUT_SECS,
                u64,
                30
            ),
            event_ttl: env_load_or!(EventTtlSecs, EVENT_TTL_SECS, u64, 120),
            subscriber_queue_size: env_load_or!(
                SubscriberQueueSize,
                SUBSCRIBER_QUEUE_SIZE,
                usize,
                64
            ),
            sweep_period: env_load_or!(
                SweepPeriodSecs,
                SWEEP_PERIOD_SECS,
                u64,
                10
            ),
            cancel_notify_url,
            notify_max_retries: env_load_or!(
                NotifyMaxRetries,
                NOTIFY_MAX_RETRIES,
                u32,
                5
            ),
        })
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout.into_inner())
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl.into_inner())
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period.into_inner())
    }
}
