use std::collections::HashMap;

use chrono::{DateTime, Utc};
use model::view::hub::JobPosted;
use model::{ConnectionId, WorkerId};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::prom_metrics::{CONNECTED_WORKERS, SUBSCRIBERS_EVICTED};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("The subscriber registry task is not running anymore")]
    Stopped,
}

/// What the registry knows about one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub connection:   ConnectionId,
    pub worker:       WorkerId,
    pub connected_at: DateTime<Utc>,
    pub delivered:    u64,
}

#[derive(Debug)]
struct Subscriber {
    info:  SubscriberInfo,
    queue: mpsc::Sender<JobPosted>,
}

/// Receiving end of a worker connection. Dropping it unregisters the
/// connection.
#[derive(Debug)]
pub struct Connection {
    pub id:     ConnectionId,
    pub worker: WorkerId,
    receiver:   mpsc::Receiver<JobPosted>,
    disconnect: mpsc::UnboundedSender<ConnectionId>,
}

impl Connection {
    /// Next announcement, `None` once the registry closed the queue.
    pub async fn recv(&mut self) -> Option<JobPosted> {
        self.receiver.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) { let _ = self.disconnect.send(self.id); }
}

/// Handle on the task owning the set of connected workers. Registration,
/// removal and broadcast all go through that single task, so a broadcast
/// never races a removal.
#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    connect:    mpsc::UnboundedSender<Subscriber>,
    disconnect: mpsc::UnboundedSender<ConnectionId>,
    broadcast:  mpsc::UnboundedSender<JobPosted>,
    snapshot:   mpsc::UnboundedSender<oneshot::Sender<Vec<SubscriberInfo>>>,
    queue_size: usize,
}

impl SubscriberRegistry {
    /// Spawns the owning task; each connection gets a queue of `queue_size`
    /// announcements.
    pub fn spawn(queue_size: usize) -> Self {
        let (connect, connect_rx) = mpsc::unbounded_channel();
        let (disconnect, disconnect_rx) = mpsc::unbounded_channel();
        let (broadcast, broadcast_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(connect_rx, disconnect_rx, broadcast_rx, snapshot_rx));

        Self { connect, disconnect, broadcast, snapshot, queue_size }
    }

    pub fn connect(&self, worker: WorkerId) -> Result<Connection, Error> {
        let (queue, receiver) = mpsc::channel(self.queue_size.max(1));
        let id = ConnectionId::generate();
        let info = SubscriberInfo {
            connection: id,
            worker,
            connected_at: Utc::now(),
            delivered: 0,
        };
        self.connect
            .send(Subscriber { info, queue })
            .map_err(|_| Error::Stopped)?;
        Ok(Connection {
            id,
            worker,
            receiver,
            disconnect: self.disconnect.clone(),
        })
    }

    /// Queues the announcement for every connection, never waits on them.
    pub fn broadcast(&self, posted: JobPosted) -> Result<(), Error> {
        self.broadcast.send(posted).map_err(|_| Error::Stopped)
    }

    pub async fn snapshot(&self) -> Result<Vec<SubscriberInfo>, Error> {
        let (reply, response) = oneshot::channel();
        self.snapshot.send(reply).map_err(|_| Error::Stopped)?;
        response.await.map_err(|_| Error::Stopped)
    }
}

async fn run(
    mut connect: mpsc::UnboundedReceiver<Subscriber>,
    mut disconnect: mpsc::UnboundedReceiver<ConnectionId>,
    mut broadcast: mpsc::UnboundedReceiver<JobPosted>,
    mut snapshot: mpsc::UnboundedReceiver<
        oneshot::Sender<Vec<SubscriberInfo>>,
    >,
) {
    let mut subscribers: HashMap<ConnectionId, Subscriber> = HashMap::new();

    loop {
        // A connection is always registered before its own disconnect
        tokio::select! {
            biased;
            Some(subscriber) = connect.recv() => {
                debug!(
                    "Worker {} connected ({})",
                    subscriber.info.worker, subscriber.info.connection
                );
                subscribers.insert(subscriber.info.connection, subscriber);
            }
            Some(id) = disconnect.recv() => {
                if let Some(gone) = subscribers.remove(&id) {
                    debug!(
                        "Worker {} disconnected ({})",
                        gone.info.worker, gone.info.connection
                    );
                }
            }
            Some(posted) = broadcast.recv() => {
                deliver(&mut subscribers, posted);
            }
            Some(reply) = snapshot.recv() => {
                let _ = reply.send(
                    subscribers.values().map(|s| s.info.clone()).collect(),
                );
            }
            else => break,
        }
        CONNECTED_WORKERS.set(subscribers.len() as f64);
    }
    trace!("Subscriber registry stopped");
}

fn deliver(
    subscribers: &mut HashMap<ConnectionId, Subscriber>,
    posted: JobPosted,
) {
    subscribers.retain(|_, subscriber| {
        match subscriber.queue.try_send(posted.clone()) {
            Ok(()) => {
                subscriber.info.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Evicting worker {} ({}): not draining announcements",
                    subscriber.info.worker, subscriber.info.connection
                );
                SUBSCRIBERS_EVICTED.inc();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    "Worker {} went away ({})",
                    subscriber.info.worker, subscriber.info.connection
                );
                false
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::JobId;

    fn posted() -> JobPosted {
        JobPosted {
            job_id:    JobId::generate(),
            project:   "proj".into(),
            posted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_every_connection_receives_the_broadcast() {
        let registry = SubscriberRegistry::spawn(4);
        let mut a = registry.connect(WorkerId::generate()).unwrap();
        let mut b = registry.connect(WorkerId::generate()).unwrap();

        let announcement = posted();
        registry.broadcast(announcement.clone()).unwrap();

        assert_eq!(a.recv().await, Some(announcement.clone()));
        assert_eq!(b.recv().await, Some(announcement));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted_without_blocking_others() {
        let registry = SubscriberRegistry::spawn(1);
        let mut slow = registry.connect(WorkerId::generate()).unwrap();
        let mut fast = registry.connect(WorkerId::generate()).unwrap();

        let first = posted();
        let second = posted();
        registry.broadcast(first.clone()).unwrap();
        assert_eq!(fast.recv().await, Some(first.clone()));
        registry.broadcast(second.clone()).unwrap();
        assert_eq!(fast.recv().await, Some(second));

        let live = registry.snapshot().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].connection, fast.id);
        assert_eq!(live[0].delivered, 2);

        // The evicted queue drains what it got, then closes
        assert_eq!(slow.recv().await, Some(first));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_unregistered() {
        let registry = SubscriberRegistry::spawn(4);
        let kept = registry.connect(WorkerId::generate()).unwrap();
        let dropped = registry.connect(WorkerId::generate()).unwrap();
        drop(dropped);

        let live = registry.snapshot().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].connection, kept.id);
    }
}
