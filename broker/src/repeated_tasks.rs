use std::sync::Arc;
use std::time::Duration;

use crate::repository::cron::Cron;
use crate::service::scheduler::Scheduler;

pub fn init(cron: &Cron, scheduler: Arc<Scheduler>, sweep_period: Duration) {
    cron.add_periodic(sweep_period, move || {
        let scheduler = scheduler.clone();
        Box::pin(sweep(scheduler))
    });
}

async fn sweep(scheduler: Arc<Scheduler>) {
    let dropped = scheduler.sweep();
    if dropped > 0 {
        debug!("Swept {} expired events", dropped);
    }
}
