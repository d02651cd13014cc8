use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use model::domain::category::Category;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// An event handed to exactly one long-poll subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub category:     Category,
    pub payload:      Value,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Queued {
    payload:      Value,
    published_at: DateTime<Utc>,
    expires_at:   Instant,
}

#[derive(Debug, Default)]
struct Slot {
    events: VecDeque<Queued>,
    notify: Arc<Notify>,
}

impl Slot {
    fn pop_live(&mut self, now: Instant) -> Option<Queued> {
        while let Some(queued) = self.events.pop_front() {
            if queued.expires_at > now {
                return Some(queued);
            }
        }
        None
    }

    /// Nobody is parked on this slot.
    fn unwatched(&self) -> bool { Arc::strong_count(&self.notify) == 1 }
}

/// Per-category event queues with a time-to-live, consumed by long polls.
#[derive(Debug)]
pub struct CategoryBoard {
    slots: DashMap<Category, Slot>,
    ttl:   Duration,
}

impl CategoryBoard {
    pub fn new(ttl: Duration) -> Self { Self { slots: DashMap::new(), ttl } }

    pub fn publish(&self, category: Category, payload: Value) -> DateTime<Utc> {
        let published_at = Utc::now();
        let mut slot = self.slots.entry(category).or_default();
        slot.events.push_back(Queued {
            payload,
            published_at,
            expires_at: Instant::now() + self.ttl,
        });
        slot.notify.notify_one();
        published_at
    }

    /// Takes the oldest live event of the category, waiting up to `wait` for
    /// one to be published.
    pub async fn subscribe(
        &self,
        category: &Category,
        wait: Duration,
    ) -> Option<Event> {
        let deadline = Instant::now() + wait;
        loop {
            let notify = {
                let mut slot = self.slots.entry(category.clone()).or_default();
                if let Some(queued) = slot.pop_live(Instant::now()) {
                    return Some(Event {
                        category:     category.clone(),
                        payload:      queued.payload,
                        published_at: queued.published_at,
                    });
                }
                slot.notify.clone()
            };
            // A publish racing this point leaves a permit behind, it is not
            // lost
            if timeout_at(deadline, notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    /// Drops expired events and the categories nobody uses anymore. Returns
    /// how many events were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        self.slots.retain(|_, slot| {
            let before = slot.events.len();
            slot.events.retain(|queued| queued.expires_at > now);
            dropped += before - slot.events.len();
            !(slot.events.is_empty() && slot.unwatched())
        });
        dropped
    }

    /// Forgets every category matching the predicate, queued events
    /// included. A category someone is still waiting on only loses its
    /// events, the sweep drops it once the wait is over.
    pub fn release<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&Category) -> bool,
    {
        let before = self.slots.len();
        self.slots.retain(|category, slot| {
            if !matches(category) {
                return true;
            }
            slot.events.clear();
            !slot.unwatched()
        });
        before - self.slots.len()
    }

    pub fn len(&self) -> usize { self.slots.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::domain::category::JobTopic;
    use model::JobId;
    use serde_json::json;

    fn category(name: &str) -> Category { Category::parse(name).unwrap() }

    #[tokio::test(start_paused = true)]
    async fn test_event_is_delivered_once() {
        let board = CategoryBoard::new(Duration::from_secs(60));
        let logs = category("logs");
        board.publish(logs.clone(), json!({"line": 1}));

        let event = board.subscribe(&logs, Duration::ZERO).await.unwrap();
        assert_eq!(event.payload, json!({"line": 1}));
        assert_eq!(board.subscribe(&logs, Duration::from_secs(1)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_waits_for_a_publish() {
        let board = Arc::new(CategoryBoard::new(Duration::from_secs(60)));
        let logs = category("logs");
        let waiter = {
            let board = board.clone();
            let logs = logs.clone();
            tokio::spawn(async move {
                board.subscribe(&logs, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        board.publish(logs, json!("late but in time"));

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.payload, json!("late but in time"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_times_out_with_nothing() {
        let board = CategoryBoard::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(
            board.subscribe(&category("quiet"), Duration::from_secs(10)).await,
            None
        );
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_categories_do_not_wake_subscribers() {
        let board = CategoryBoard::new(Duration::from_secs(60));
        board.publish(category("elsewhere"), json!(1));
        assert_eq!(
            board.subscribe(&category("here"), Duration::from_secs(1)).await,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_events_are_not_delivered_and_get_swept() {
        let board = CategoryBoard::new(Duration::from_secs(10));
        let logs = category("logs");
        board.publish(logs.clone(), json!(1));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(board.sweep(), 1);
        assert_eq!(board.len(), 0);

        board.publish(logs.clone(), json!(2));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(board.subscribe(&logs, Duration::ZERO).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_only_touches_the_job() {
        let board = CategoryBoard::new(Duration::from_secs(60));
        let job = JobId::generate();
        let other = JobId::generate();
        board.publish(Category::for_job(&job, JobTopic::Cancel), json!(1));
        board.publish(Category::for_job(&job, JobTopic::Output), json!(2));
        board.publish(Category::for_job(&other, JobTopic::Cancel), json!(3));

        assert_eq!(board.release(|category| category.is_of_job(&job)), 2);
        assert_eq!(board.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_waiting_subscribers_reachable() {
        let board = Arc::new(CategoryBoard::new(Duration::from_secs(60)));
        let job = JobId::generate();
        let cancel = Category::for_job(&job, JobTopic::Cancel);
        let waiter = {
            let board = board.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                board.subscribe(&cancel, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The waiter cannot run between the publish and the release
        board.publish(cancel.clone(), json!("dropped"));
        assert_eq!(board.release(|category| category.is_of_job(&job)), 0);
        board.publish(cancel, json!("after release"));

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.payload, json!("after release"));

        board.sweep();
        assert_eq!(board.len(), 0);
    }
}
