use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;

/// Spawns periodic and delayed tasks that all stop on [`Cron::shutdown`] or
/// when the cron itself is dropped.
#[derive(Debug)]
pub struct Cron {
    shutdown: watch::Sender<bool>,
}

impl Default for Cron {
    fn default() -> Self { Self::new() }
}

impl Cron {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { shutdown }
    }

    // Add job to be executed every period, the first run happens right away
    pub fn add_periodic<T>(&self, period: Duration, callback: T)
    where
        T: 'static,
        T: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
    {
        let stop = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(period);

        tokio::spawn(async move {
            let shutdown = stopped(stop);
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tokio::spawn(callback());
                    }
                    _ = &mut shutdown => break,
                }
            }
        });
    }

    // Add a job to execute in <delay> time
    pub fn add_oneshot<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task.await,
                _ = stopped(stop) => {}
            }
        });
    }

    pub fn shutdown(&self) { self.shutdown.send_replace(true); }
}

/// Resolves once shutdown was requested or the cron was dropped. The borrow
/// of the channel never outlives this future.
async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_runs_until_shutdown() {
        let cron = Cron::new();
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            cron.add_periodic(Duration::from_secs(10), move || {
                let runs = runs.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            });
        }

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        cron.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oneshot_fires_once_after_delay() {
        let cron = Cron::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cron.add_oneshot(Duration::from_secs(5), async move {
            let _ = tx.send(());
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_oneshots() {
        let cron = Cron::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            cron.add_oneshot(Duration::from_secs(5), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        cron.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tasks_run_on_a_multi_threaded_runtime() {
        let cron = Cron::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        {
            let tx = tx.clone();
            cron.add_periodic(Duration::from_millis(5), move || {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send("tick");
                })
            });
        }
        cron.add_oneshot(Duration::from_millis(10), async move {
            let _ = tx.send("once");
        });

        let mut seen = Vec::new();
        while !seen.contains(&"once") {
            seen.push(rx.recv().await.unwrap());
        }
        assert!(seen.contains(&"tick"));

        cron.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
