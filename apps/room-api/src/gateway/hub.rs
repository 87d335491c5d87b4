//! The per-session hub: an actor owning the live client set for one
//! session, serialising interview mutation, and fanning events out.
//!
//! All state transitions run in a single serving task driven by the
//! register/unregister/broadcast channels. The interview mutex is the
//! only place a read-decide-write of session state may happen.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::SessionStore;
use crate::gateway::client::Client;
use crate::gateway::messages;
use crate::interview::{Interview, InterviewError};

const CONTROL_BUFFER: usize = 64;

#[derive(Debug)]
pub struct Hub {
    pub session_id: String,
    /// Serialises every read-modify-write of the interview, including
    /// compaction. Held only across short critical sections.
    pub interview: Mutex<Interview>,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    register_tx: mpsc::Sender<Arc<Client>>,
    unregister_tx: mpsc::Sender<Arc<Client>>,
    broadcast_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
    done: CancellationToken,
}

struct HubChannels {
    register_rx: mpsc::Receiver<Arc<Client>>,
    unregister_rx: mpsc::Receiver<Arc<Client>>,
    broadcast_rx: mpsc::Receiver<String>,
}

impl Hub {
    fn new(session_id: String, interview: Interview) -> (Arc<Self>, HubChannels) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(CONTROL_BUFFER);

        let hub = Arc::new(Self {
            session_id,
            interview: Mutex::new(interview),
            clients: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            shutdown: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        (
            hub,
            HubChannels {
                register_rx,
                unregister_rx,
                broadcast_rx,
            },
        )
    }

    pub async fn register(&self, client: Arc<Client>) {
        let _ = self.register_tx.send(client).await;
    }

    pub async fn unregister(&self, client: Arc<Client>) {
        let _ = self.unregister_tx.send(client).await;
    }

    /// Queues a frame for every client, the sender included. The serving
    /// task fans it out with the usual backpressure contract.
    pub async fn broadcast_all(&self, frame: String) {
        let _ = self.broadcast_tx.send(frame).await;
    }

    /// Fanout to everyone except `sender`. Same backpressure contract as
    /// a full broadcast: a client whose queue is full is evicted rather
    /// than stalling its peers.
    pub fn broadcast_to_others(&self, sender: &str, frame: &str) {
        self.fanout(Some(sender), frame);
    }

    /// The single fanout path. Enqueues non-blockingly; a client whose
    /// outbound queue is full is dropped from the map and closed. Its
    /// reader then unregisters it, which announces `user_left`.
    fn fanout(&self, exclude: Option<&str>, frame: &str) {
        let evicted: Vec<Arc<Client>> = {
            let mut clients = self.clients.write();
            let mut evicted = Vec::new();
            clients.retain(|name, client| {
                if exclude == Some(name.as_str()) {
                    return true;
                }
                if client.try_send(frame.to_string()) {
                    true
                } else {
                    tracing::warn!(
                        session_id = %self.session_id,
                        username = %name,
                        "evicting unresponsive client"
                    );
                    evicted.push(client.clone());
                    false
                }
            });
            evicted
        };
        for client in evicted {
            client.close();
        }
    }

    pub fn usernames(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn has_client(&self, username: &str) -> bool {
        self.clients.read().contains_key(username)
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Stops the serving task, closing every client. Waits up to five
    /// seconds for the task to finish tearing down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.done.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.session_id, "hub shutdown timed out");
        }
    }

    async fn run(self: Arc<Self>, registry: Arc<HubRegistry>, mut channels: HubChannels) {
        loop {
            tokio::select! {
                Some(client) = channels.register_rx.recv() => {
                    let count = {
                        let mut clients = self.clients.write();
                        clients.insert(client.username.clone(), client.clone());
                        clients.len()
                    };
                    tracing::info!(
                        session_id = %self.session_id,
                        username = %client.username,
                        clients = count,
                        "client joined"
                    );
                    self.broadcast_to_others(
                        &client.username,
                        &messages::user_joined(&client.username).to_json(),
                    );
                }

                Some(client) = channels.unregister_rx.recv() => {
                    let count = {
                        let mut clients = self.clients.write();
                        // Only drop the exact client: an evicted name may
                        // already have been reassigned.
                        if clients
                            .get(&client.username)
                            .is_some_and(|c| Arc::ptr_eq(c, &client))
                        {
                            clients.remove(&client.username);
                            client.close();
                        }
                        clients.len()
                    };
                    tracing::info!(
                        session_id = %self.session_id,
                        username = %client.username,
                        clients = count,
                        "client left"
                    );
                    self.broadcast_to_others(
                        &client.username,
                        &messages::user_left(&client.username).to_json(),
                    );
                    if count == 0 {
                        registry.remove(&self.session_id);
                        tracing::info!(session_id = %self.session_id, "session hub stopped");
                        break;
                    }
                }

                Some(frame) = channels.broadcast_rx.recv() => {
                    self.fanout(None, &frame);
                }

                _ = self.shutdown.cancelled() => {
                    let drained: Vec<Arc<Client>> = {
                        let mut clients = self.clients.write();
                        clients.drain().map(|(_, client)| client).collect()
                    };
                    for client in drained {
                        client.close();
                    }
                    break;
                }
            }
        }
        self.done.cancel();
    }
}

/// Process-wide directory of live hubs, keyed by session id. The map
/// lock is never held across I/O: the interview loads first, then a
/// double-checked insert resolves creation races.
pub struct HubRegistry {
    hubs: DashMap<String, Arc<Hub>>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self {
            hubs: DashMap::new(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Hub>> {
        self.hubs.get(session_id).map(|h| h.clone())
    }

    /// Live connection count for a session; zero when no hub exists.
    pub fn population(&self, session_id: &str) -> usize {
        self.get(session_id).map_or(0, |h| h.client_count())
    }

    /// Number of sessions with a live hub in this process.
    pub fn live_sessions(&self) -> usize {
        self.hubs.len()
    }

    /// Returns the session's hub, constructing one (and starting its
    /// serving task) from the stored interview if needed. Does not create
    /// the interview — a missing session surfaces as `NotFound`.
    pub async fn get_or_create(
        self: &Arc<Self>,
        store: Arc<dyn SessionStore>,
        session_id: &str,
    ) -> Result<Arc<Hub>, InterviewError> {
        if let Some(hub) = self.get(session_id) {
            return Ok(hub);
        }

        let interview = Interview::load(store, session_id).await?;
        let (hub, channels) = Hub::new(session_id.to_string(), interview);

        match self.hubs.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Ok(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(hub.clone());
                tokio::spawn(hub.clone().run(self.clone(), channels));
                Ok(hub)
            }
        }
    }

    fn remove(&self, session_id: &str) {
        self.hubs.remove(session_id);
    }
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::gateway::client::SEND_BUFFER_SIZE;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn test_hub() -> (Arc<HubRegistry>, Arc<Hub>) {
        let store = Arc::new(MemoryStore::new());
        let languages = vec!["python".to_string()];
        Interview::create(store.clone(), "s1", &languages)
            .await
            .unwrap();

        let registry = Arc::new(HubRegistry::new());
        let hub = registry
            .get_or_create(store, "s1")
            .await
            .unwrap();
        (registry, hub)
    }

    #[tokio::test]
    async fn get_or_create_requires_existing_session() {
        let registry = Arc::new(HubRegistry::new());
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let err = registry.get_or_create(store, "ghost").await.unwrap_err();
        assert!(matches!(err, InterviewError::NotFound));
    }

    #[tokio::test]
    async fn get_or_create_reuses_the_live_hub() {
        let store = Arc::new(MemoryStore::new());
        let languages = vec!["python".to_string()];
        Interview::create(store.clone(), "s1", &languages)
            .await
            .unwrap();

        let registry = Arc::new(HubRegistry::new());
        let a = registry.get_or_create(store.clone(), "s1").await.unwrap();
        let b = registry.get_or_create(store, "s1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn register_announces_to_peers_only() {
        let (_registry, hub) = test_hub().await;

        let (alice, mut alice_rx) = Client::new("User1".to_string());
        let alice = Arc::new(alice);
        hub.register(alice.clone()).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.has_client("User1")).await;
        }

        let (bob, _bob_rx) = Client::new("User2".to_string());
        hub.register(Arc::new(bob)).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.has_client("User2")).await;
        }

        // Alice hears about Bob; nothing was echoed to Bob about himself.
        let frame = alice_rx.recv().await.unwrap();
        assert!(frame.contains("user_joined"));
        assert!(frame.contains("User2"));
    }

    #[tokio::test]
    async fn full_queue_is_evicted_by_the_join_announcement() {
        let (_registry, hub) = test_hub().await;

        let (slow, _slow_rx) = Client::new("User1".to_string());
        let slow = Arc::new(slow);
        // Never drained: fill the queue to the brim.
        for _ in 0..SEND_BUFFER_SIZE {
            assert!(slow.try_send("backlog".to_string()));
        }
        let slow_token = slow.cancel_token();
        hub.register(slow).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.client_count() == 1).await;
        }

        // The user_joined announcement for the newcomer cannot be queued
        // on the stalled client, so that one broadcast cycle evicts it.
        let (healthy, mut healthy_rx) = Client::new("User2".to_string());
        hub.register(Arc::new(healthy)).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.has_client("User2") && !hub.has_client("User1")).await;
        }
        assert!(slow_token.is_cancelled());
        assert_eq!(hub.client_count(), 1);

        // Peers keep receiving after the eviction.
        hub.broadcast_to_others("User1", "still live");
        let frame = healthy_rx.recv().await.unwrap();
        assert_eq!(frame, "still live");
    }

    #[tokio::test]
    async fn channel_broadcast_reaches_everyone_and_evicts_laggards() {
        let (_registry, hub) = test_hub().await;

        let (slow, _slow_rx) = Client::new("User1".to_string());
        let slow = Arc::new(slow);
        let (healthy, mut healthy_rx) = Client::new("User2".to_string());
        hub.register(slow.clone()).await;
        hub.register(Arc::new(healthy)).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.client_count() == 2).await;
        }

        // Stall the slow client only now, after the join announcements.
        while slow.try_send("backlog".to_string()) {}

        hub.broadcast_all("live".to_string()).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.client_count() == 1).await;
        }
        assert!(!hub.has_client("User1"));

        let frame = healthy_rx.recv().await.unwrap();
        assert_eq!(frame, "live");
    }

    #[tokio::test]
    async fn last_unregister_removes_hub_from_registry() {
        let (registry, hub) = test_hub().await;

        let (client, _rx) = Client::new("User1".to_string());
        let client = Arc::new(client);
        hub.register(client.clone()).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.client_count() == 1).await;
        }

        hub.unregister(client).await;
        {
            let registry = registry.clone();
            wait_until(move || registry.get("s1").is_none()).await;
        }
    }

    #[tokio::test]
    async fn shutdown_closes_every_client() {
        let (_registry, hub) = test_hub().await;

        let (client, _rx) = Client::new("User1".to_string());
        let client = Arc::new(client);
        let token = client.cancel_token();
        hub.register(client).await;
        {
            let hub = hub.clone();
            wait_until(move || hub.client_count() == 1).await;
        }

        hub.shutdown().await;
        assert!(token.is_cancelled());
        assert_eq!(hub.client_count(), 0);
    }
}
