use std::collections::{HashMap, HashSet};

use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::messages::{Broadcast, WsMessage, TYPE_PING};

/// Outbound buffer per connection. A client whose buffer is full when a
/// broadcast arrives is dropped instead of stalling the coordinator.
const CLIENT_BUFFER: usize = 64;
/// Command queue into the coordinator.
const COMMAND_BUFFER: usize = 1024;
/// Ping cadence; a client missing two consecutive pongs is dropped.
pub const HEARTBEAT_SECS: u64 = 30;
const MAX_MISSED_PONGS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Register {
        id: ClientId,
        org_id: Uuid,
        user_id: Uuid,
        sender: mpsc::Sender<WsMessage>,
    },
    Unregister(ClientId),
    SetContact(ClientId, Option<Uuid>),
    Pong(ClientId),
    Broadcast(Broadcast),
    Heartbeat,
}

struct ClientEntry {
    org_id: Uuid,
    user_id: Uuid,
    current_contact: Option<Uuid>,
    missed_pongs: u8,
    sender: mpsc::Sender<WsMessage>,
}

/// Cloneable handle used by everything that talks to the coordinator.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
}

impl HubHandle {
    pub async fn register(
        &self,
        id: ClientId,
        org_id: Uuid,
        user_id: Uuid,
    ) -> mpsc::Receiver<WsMessage> {
        let (sender, receiver) = mpsc::channel(CLIENT_BUFFER);
        let _ = self
            .tx
            .send(Command::Register {
                id,
                org_id,
                user_id,
                sender,
            })
            .await;
        receiver
    }

    pub async fn unregister(&self, id: ClientId) {
        let _ = self.tx.send(Command::Unregister(id)).await;
    }

    pub async fn set_contact(&self, id: ClientId, contact_id: Option<Uuid>) {
        let _ = self.tx.send(Command::SetContact(id, contact_id)).await;
    }

    pub async fn pong(&self, id: ClientId) {
        let _ = self.tx.send(Command::Pong(id)).await;
    }

    pub async fn broadcast(&self, broadcast: Broadcast) {
        let _ = self.tx.send(Command::Broadcast(broadcast)).await;
    }

    /// Drives one heartbeat round. The spawned coordinator ticks this on its
    /// own interval; tests call it directly.
    pub async fn heartbeat_tick(&self) {
        let _ = self.tx.send(Command::Heartbeat).await;
    }
}

/// Spawns the coordinator task and returns its handle. The task exits when
/// every handle has been dropped.
pub fn spawn() -> HubHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = HubHandle { tx };
    let ticker = handle.clone();
    tokio::spawn(run(rx));
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            ticker.heartbeat_tick().await;
        }
    });
    handle
}

/// Spawns only the coordinator, without the interval timer. Used by tests
/// that drive heartbeats explicitly.
pub fn spawn_without_heartbeat() -> HubHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(run(rx));
    HubHandle { tx }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut registry = Registry::default();
    while let Some(command) = rx.recv().await {
        match command {
            Command::Register {
                id,
                org_id,
                user_id,
                sender,
            } => registry.register(id, org_id, user_id, sender),
            Command::Unregister(id) => registry.remove(id),
            Command::SetContact(id, contact) => registry.set_contact(id, contact),
            Command::Pong(id) => registry.pong(id),
            Command::Broadcast(broadcast) => registry.broadcast(&broadcast),
            Command::Heartbeat => registry.heartbeat(),
        }
    }
    tracing::debug!("hub coordinator stopped");
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientEntry>,
    by_org: HashMap<Uuid, HashSet<ClientId>>,
    by_user: HashMap<Uuid, HashSet<ClientId>>,
}

impl Registry {
    fn register(&mut self, id: ClientId, org_id: Uuid, user_id: Uuid, sender: mpsc::Sender<WsMessage>) {
        self.clients.insert(
            id,
            ClientEntry {
                org_id,
                user_id,
                current_contact: None,
                missed_pongs: 0,
                sender,
            },
        );
        self.by_org.entry(org_id).or_default().insert(id);
        self.by_user.entry(user_id).or_default().insert(id);
        tracing::debug!(org = %org_id, user = %user_id, "ws client registered");
    }

    fn remove(&mut self, id: ClientId) {
        if let Some(entry) = self.clients.remove(&id) {
            if let Some(set) = self.by_org.get_mut(&entry.org_id) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_org.remove(&entry.org_id);
                }
            }
            if let Some(set) = self.by_user.get_mut(&entry.user_id) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_user.remove(&entry.user_id);
                }
            }
        }
    }

    fn set_contact(&mut self, id: ClientId, contact: Option<Uuid>) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.current_contact = contact;
        }
    }

    fn pong(&mut self, id: ClientId) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.missed_pongs = 0;
        }
    }

    fn broadcast(&mut self, broadcast: &Broadcast) {
        let Some(candidates) = self.by_org.get(&broadcast.org_id) else {
            return;
        };

        let mut dropped = Vec::new();
        for id in candidates {
            let Some(entry) = self.clients.get(id) else {
                continue;
            };
            if let Some(user_id) = broadcast.user_id {
                if entry.user_id != user_id {
                    continue;
                }
            }
            if let Some(contact_id) = broadcast.contact_id {
                if entry.current_contact != Some(contact_id) {
                    continue;
                }
            }
            if entry.sender.try_send(broadcast.message.clone()).is_err() {
                dropped.push(*id);
            }
        }

        for id in dropped {
            tracing::warn!(org = %broadcast.org_id, "dropping slow ws client");
            metrics::counter!("ws_clients_dropped", 1, "reason" => "slow");
            self.remove(id);
        }
    }

    fn heartbeat(&mut self) {
        let ping = WsMessage::new(TYPE_PING, json!({}));
        let mut dropped = Vec::new();
        for (id, entry) in self.clients.iter_mut() {
            if entry.missed_pongs >= MAX_MISSED_PONGS {
                dropped.push(*id);
                continue;
            }
            entry.missed_pongs += 1;
            if entry.sender.try_send(ping.clone()).is_err() {
                dropped.push(*id);
            }
        }
        for id in dropped {
            metrics::counter!("ws_clients_dropped", 1, "reason" => "heartbeat");
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::TYPE_NEW_MESSAGE;

    fn message() -> WsMessage {
        WsMessage::new(TYPE_NEW_MESSAGE, json!({"id": 1}))
    }

    #[tokio::test]
    async fn tenant_broadcast_reaches_only_that_tenant() {
        let hub = spawn_without_heartbeat();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let mut rx_a = hub.register(ClientId::new(), org_a, Uuid::new_v4()).await;
        let mut rx_b = hub.register(ClientId::new(), org_b, Uuid::new_v4()).await;

        hub.broadcast(Broadcast::tenant(org_a, message())).await;
        // allow the coordinator to process
        tokio::task::yield_now().await;

        assert_eq!(rx_a.recv().await.unwrap().message_type, TYPE_NEW_MESSAGE);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_targeting_narrows_delivery() {
        let hub = spawn_without_heartbeat();
        let org = Uuid::new_v4();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        let mut rx_a = hub.register(ClientId::new(), org, user_a).await;
        let mut rx_b = hub.register(ClientId::new(), org, user_b).await;

        hub.broadcast(Broadcast::user(org, user_a, message())).await;
        tokio::task::yield_now().await;

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn contact_targeting_requires_selection() {
        let hub = spawn_without_heartbeat();
        let org = Uuid::new_v4();
        let contact = Uuid::new_v4();
        let viewing = ClientId::new();
        let elsewhere = ClientId::new();

        let mut rx_viewing = hub.register(viewing, org, Uuid::new_v4()).await;
        let mut rx_elsewhere = hub.register(elsewhere, org, Uuid::new_v4()).await;
        hub.set_contact(viewing, Some(contact)).await;
        hub.set_contact(elsewhere, Some(Uuid::new_v4())).await;

        hub.broadcast(Broadcast {
            org_id: org,
            user_id: None,
            contact_id: Some(contact),
            message: message(),
        })
        .await;
        tokio::task::yield_now().await;

        assert!(rx_viewing.recv().await.is_some());
        assert!(rx_elsewhere.try_recv().is_err());
    }

    #[tokio::test]
    async fn two_missed_pongs_drop_the_client() {
        let hub = spawn_without_heartbeat();
        let org = Uuid::new_v4();
        let quiet = ClientId::new();
        let lively = ClientId::new();

        let mut rx_quiet = hub.register(quiet, org, Uuid::new_v4()).await;
        let mut rx_lively = hub.register(lively, org, Uuid::new_v4()).await;

        for _ in 0..3 {
            hub.heartbeat_tick().await;
            hub.pong(lively).await;
        }
        tokio::task::yield_now().await;

        hub.broadcast(Broadcast::tenant(org, message())).await;
        tokio::task::yield_now().await;

        // drain pings, then expect the broadcast only on the lively client
        let mut lively_got_broadcast = false;
        while let Ok(msg) = rx_lively.try_recv() {
            if msg.message_type == TYPE_NEW_MESSAGE {
                lively_got_broadcast = true;
            }
        }
        assert!(lively_got_broadcast);

        let mut quiet_got_broadcast = false;
        while let Ok(msg) = rx_quiet.try_recv() {
            if msg.message_type == TYPE_NEW_MESSAGE {
                quiet_got_broadcast = true;
            }
        }
        assert!(!quiet_got_broadcast);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_not_queued() {
        let hub = spawn_without_heartbeat();
        let org = Uuid::new_v4();
        let slow = ClientId::new();

        // never read from rx: the buffer fills, then the drop kicks in
        let _rx = hub.register(slow, org, Uuid::new_v4()).await;
        for _ in 0..(CLIENT_BUFFER + 2) {
            hub.broadcast(Broadcast::tenant(org, message())).await;
        }
        tokio::task::yield_now().await;

        let mut rx_new = hub.register(ClientId::new(), org, Uuid::new_v4()).await;
        hub.broadcast(Broadcast::tenant(org, message())).await;
        tokio::task::yield_now().await;
        assert!(rx_new.recv().await.is_some());
    }
}
