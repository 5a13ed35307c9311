//! Connection, identity and chat-subscription registry.
//!
//! Three views are kept under one lock so that every operation is atomic
//! with respect to the others:
//! - live connections and the handle used to reach them,
//! - the authenticated identity bound to a connection,
//! - the set of connections subscribed to each chat.
//!
//! Each connection also records the chats it joined, so unregistering or
//! logging out touches only those subscriber sets.

use std::collections::{HashMap, HashSet, VecDeque};

use dvid_core::{Chat, ChatId, UserId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionId, ConnectionSender};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),

    #[error("connection {0} is not registered")]
    NotRegistered(ConnectionId),

    #[error("connection {0} is already authenticated")]
    AlreadyAuthenticated(ConnectionId),

    #[error("connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),

    #[error("chat {0} is already registered")]
    ChatAlreadyRegistered(ChatId),
}

/// The authenticated principal bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub token: String,
}

struct ClientEntry {
    sender: ConnectionSender,
    /// Reverse index of the subscriber sets this connection belongs to.
    chats: HashSet<ChatId>,
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ConnectionId, ClientEntry>,
    identities: HashMap<ConnectionId, Identity>,
    subscribers: HashMap<ChatId, HashSet<ConnectionId>>,
    /// Ids that were registered and have since been removed, oldest first.
    /// Capped at `retired_limit`; an evicted id is treated as never registered.
    retired: HashSet<ConnectionId>,
    retired_order: VecDeque<ConnectionId>,
}

impl RegistryState {
    fn subscribe(&mut self, id: ConnectionId, chat_id: ChatId) {
        self.subscribers.entry(chat_id).or_default().insert(id);
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.chats.insert(chat_id);
        }
    }

    fn retire(&mut self, id: ConnectionId, limit: usize) {
        if limit == 0 || !self.retired.insert(id) {
            return;
        }
        self.retired_order.push_back(id);
        while self.retired_order.len() > limit {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn unsubscribe_all(&mut self, id: ConnectionId) {
        let Some(entry) = self.clients.get_mut(&id) else {
            return;
        };
        for chat_id in entry.chats.drain() {
            if let Some(set) = self.subscribers.get_mut(&chat_id) {
                set.remove(&id);
            }
        }
    }
}

/// Retired ids remembered by default.
const RETIRED_LIMIT: usize = 65_536;

/// Shared registry of live client connections.
pub struct ClientRegistry {
    inner: RwLock<RegistryState>,
    retired_limit: usize,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_retired_limit(RETIRED_LIMIT)
    }

    /// Registry that remembers at most `limit` removed connection ids.
    pub fn with_retired_limit(limit: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryState::default()),
            retired_limit: limit,
        }
    }

    /// Add a freshly accepted connection.
    pub async fn register(
        &self,
        id: ConnectionId,
        sender: ConnectionSender,
    ) -> Result<(), RegistryError> {
        let mut state = self.inner.write().await;
        if state.clients.contains_key(&id) || state.retired.contains(&id) {
            warn!(conn = %id, "connection registered twice");
            return Err(RegistryError::AlreadyRegistered(id));
        }
        state.clients.insert(
            id,
            ClientEntry {
                sender,
                chats: HashSet::new(),
            },
        );
        debug!(conn = %id, total = state.clients.len(), "connection registered");
        Ok(())
    }

    /// Bind an authenticated identity and subscribe the connection to the
    /// user's existing chats.
    ///
    /// Subscriptions are additive: a chat that already has subscribers keeps
    /// them and gains this connection.
    pub async fn bind_identity(
        &self,
        id: ConnectionId,
        user_id: UserId,
        token: String,
        initial_chats: &[ChatId],
    ) -> Result<(), RegistryError> {
        let mut state = self.inner.write().await;
        if !state.clients.contains_key(&id) {
            return Err(RegistryError::NotRegistered(id));
        }
        if state.identities.contains_key(&id) {
            warn!(conn = %id, user = %user_id, "connection authenticated twice");
            return Err(RegistryError::AlreadyAuthenticated(id));
        }
        state.identities.insert(id, Identity { user_id, token });
        for chat_id in initial_chats {
            state.subscribe(id, *chat_id);
        }
        info!(conn = %id, user = %user_id, chats = initial_chats.len(), "identity bound");
        Ok(())
    }

    /// Look up the identity bound to a connection.
    pub async fn identity(&self, id: ConnectionId) -> Result<Identity, RegistryError> {
        let state = self.inner.read().await;
        if !state.clients.contains_key(&id) {
            return Err(RegistryError::NotRegistered(id));
        }
        state
            .identities
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotAuthenticated(id))
    }

    /// Drop the identity of a connection and all of its chat subscriptions.
    /// The connection itself stays registered and may authenticate again.
    pub async fn clear_identity(&self, id: ConnectionId) -> Result<Identity, RegistryError> {
        let mut state = self.inner.write().await;
        if !state.clients.contains_key(&id) {
            return Err(RegistryError::NotRegistered(id));
        }
        let identity = state
            .identities
            .remove(&id)
            .ok_or(RegistryError::NotAuthenticated(id))?;
        state.unsubscribe_all(id);
        info!(conn = %id, user = %identity.user_id, "identity cleared");
        Ok(identity)
    }

    /// Remove a connection from every view.
    ///
    /// Repeating the call for a connection that was already removed succeeds;
    /// an id that was never registered, or was removed long enough ago to
    /// have aged out of the retired set, is an error.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let mut state = self.inner.write().await;
        if !state.clients.contains_key(&id) {
            if state.retired.contains(&id) {
                return Ok(());
            }
            return Err(RegistryError::NotRegistered(id));
        }
        state.unsubscribe_all(id);
        state.identities.remove(&id);
        state.clients.remove(&id);
        state.retire(id, self.retired_limit);
        debug!(conn = %id, total = state.clients.len(), "connection unregistered");
        Ok(())
    }

    /// Snapshot of the connections subscribed to a chat.
    pub async fn subscribers(&self, chat_id: ChatId) -> Vec<ConnectionId> {
        let state = self.inner.read().await;
        state
            .subscribers
            .get(&chat_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Create the subscriber set for a new chat from every authenticated
    /// connection whose user is a member. Returns the connections added.
    pub async fn register_chat(&self, chat: &Chat) -> Result<Vec<ConnectionId>, RegistryError> {
        let mut state = self.inner.write().await;
        if state.subscribers.contains_key(&chat.id) {
            return Err(RegistryError::ChatAlreadyRegistered(chat.id));
        }
        let members: Vec<ConnectionId> = state
            .identities
            .iter()
            .filter(|(_, identity)| chat.has_member(&identity.user_id))
            .map(|(id, _)| *id)
            .collect();
        state.subscribers.insert(chat.id, HashSet::new());
        for id in &members {
            state.subscribe(*id, chat.id);
        }
        debug!(chat = %chat.id, subscribers = members.len(), "chat registered");
        Ok(members)
    }

    /// Resolve connection ids to their send handles, skipping any that are gone.
    pub async fn senders(&self, ids: &[ConnectionId]) -> Vec<ConnectionSender> {
        let state = self.inner.read().await;
        ids.iter()
            .filter_map(|id| state.clients.get(id).map(|entry| entry.sender.clone()))
            .collect()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn client() -> (ConnectionId, ConnectionSender, mpsc::Sender<Vec<u8>>) {
        let id = ConnectionId::generate();
        let (tx, _rx) = mpsc::channel(8);
        let sender = ConnectionSender::new(id, &tx, Duration::from_millis(50));
        (id, sender, tx)
    }

    fn sorted(mut ids: Vec<ConnectionId>) -> Vec<ConnectionId> {
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = ClientRegistry::new();
        let (id, sender, _tx) = client();

        registry.register(id, sender.clone()).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(
            registry.register(id, sender.clone()).await,
            Err(RegistryError::AlreadyRegistered(id))
        );

        registry.unregister(id).await.unwrap();
        assert_eq!(registry.len().await, 0);
        // Repeated removal is a no-op; re-registering a retired id is not allowed.
        registry.unregister(id).await.unwrap();
        assert_eq!(
            registry.register(id, sender).await,
            Err(RegistryError::AlreadyRegistered(id))
        );
    }

    #[tokio::test]
    async fn retired_ids_are_capped() {
        let registry = ClientRegistry::with_retired_limit(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (id, sender, _tx) = client();
            registry.register(id, sender).await.unwrap();
            registry.unregister(id).await.unwrap();
            ids.push(id);
        }
        // The oldest id aged out; the two most recent are still remembered.
        assert_eq!(
            registry.unregister(ids[0]).await,
            Err(RegistryError::NotRegistered(ids[0]))
        );
        assert_eq!(registry.unregister(ids[1]).await, Ok(()));
        assert_eq!(registry.unregister(ids[2]).await, Ok(()));
        assert_eq!(registry.inner.read().await.retired.len(), 2);
    }

    #[tokio::test]
    async fn unregister_unknown_fails() {
        let registry = ClientRegistry::new();
        let id = ConnectionId::generate();
        assert_eq!(
            registry.unregister(id).await,
            Err(RegistryError::NotRegistered(id))
        );
    }

    #[tokio::test]
    async fn bind_identity_subscribes_initial_chats() {
        let registry = ClientRegistry::new();
        let (id, sender, _tx) = client();
        let user = UserId::random();
        let (c1, c2) = (ChatId::random(), ChatId::random());

        assert_eq!(
            registry.bind_identity(id, user, "t".into(), &[c1]).await,
            Err(RegistryError::NotRegistered(id))
        );

        registry.register(id, sender).await.unwrap();
        registry
            .bind_identity(id, user, "t".into(), &[c1, c2])
            .await
            .unwrap();

        let identity = registry.identity(id).await.unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.token, "t");
        assert_eq!(registry.subscribers(c1).await, vec![id]);
        assert_eq!(registry.subscribers(c2).await, vec![id]);

        assert_eq!(
            registry.bind_identity(id, user, "t".into(), &[]).await,
            Err(RegistryError::AlreadyAuthenticated(id))
        );
    }

    #[tokio::test]
    async fn second_login_adds_to_existing_chat() {
        let registry = ClientRegistry::new();
        let chat = ChatId::random();
        let (a, sa, _ta) = client();
        let (b, sb, _tb) = client();
        registry.register(a, sa).await.unwrap();
        registry.register(b, sb).await.unwrap();

        registry
            .bind_identity(a, UserId::random(), "a".into(), &[chat])
            .await
            .unwrap();
        registry
            .bind_identity(b, UserId::random(), "b".into(), &[chat])
            .await
            .unwrap();

        assert_eq!(sorted(registry.subscribers(chat).await), sorted(vec![a, b]));
    }

    #[tokio::test]
    async fn unregister_removes_from_every_view() {
        let registry = ClientRegistry::new();
        let chat = ChatId::random();
        let (a, sa, _ta) = client();
        let (b, sb, _tb) = client();
        registry.register(a, sa).await.unwrap();
        registry.register(b, sb).await.unwrap();
        registry
            .bind_identity(a, UserId::random(), "a".into(), &[chat])
            .await
            .unwrap();
        registry
            .bind_identity(b, UserId::random(), "b".into(), &[chat])
            .await
            .unwrap();

        registry.unregister(a).await.unwrap();

        assert_eq!(registry.subscribers(chat).await, vec![b]);
        assert_eq!(
            registry.identity(a).await,
            Err(RegistryError::NotRegistered(a))
        );
        let senders = registry.senders(&[a, b]).await;
        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].id(), b);
    }

    #[tokio::test]
    async fn identity_of_anonymous_connection() {
        let registry = ClientRegistry::new();
        let (id, sender, _tx) = client();
        registry.register(id, sender).await.unwrap();
        assert_eq!(
            registry.identity(id).await,
            Err(RegistryError::NotAuthenticated(id))
        );
    }

    #[tokio::test]
    async fn clear_identity_revokes_subscriptions() {
        let registry = ClientRegistry::new();
        let chat = ChatId::random();
        let user = UserId::random();
        let (id, sender, _tx) = client();
        registry.register(id, sender).await.unwrap();
        registry
            .bind_identity(id, user, "t".into(), &[chat])
            .await
            .unwrap();

        let cleared = registry.clear_identity(id).await.unwrap();
        assert_eq!(cleared.user_id, user);
        assert!(registry.subscribers(chat).await.is_empty());
        assert_eq!(
            registry.identity(id).await,
            Err(RegistryError::NotAuthenticated(id))
        );
        assert_eq!(
            registry.clear_identity(id).await,
            Err(RegistryError::NotAuthenticated(id))
        );

        // The connection may log in again.
        registry
            .bind_identity(id, user, "t2".into(), &[chat])
            .await
            .unwrap();
        assert_eq!(registry.subscribers(chat).await, vec![id]);
    }

    #[tokio::test]
    async fn register_chat_subscribes_members_only() {
        let registry = ClientRegistry::new();
        let (alice, bob, carol) = (UserId::random(), UserId::random(), UserId::random());
        let (a1, s1, _t1) = client();
        let (a2, s2, _t2) = client();
        let (b1, s3, _t3) = client();
        let (c1, s4, _t4) = client();
        let (anon, s5, _t5) = client();
        for (id, sender) in [(a1, s1), (a2, s2), (b1, s3), (c1, s4), (anon, s5)] {
            registry.register(id, sender).await.unwrap();
        }
        registry.bind_identity(a1, alice, "a".into(), &[]).await.unwrap();
        registry.bind_identity(a2, alice, "a".into(), &[]).await.unwrap();
        registry.bind_identity(b1, bob, "b".into(), &[]).await.unwrap();
        registry.bind_identity(c1, carol, "c".into(), &[]).await.unwrap();

        let chat = Chat::personal(ChatId::random(), alice, bob);
        let added = registry.register_chat(&chat).await.unwrap();
        assert_eq!(sorted(added), sorted(vec![a1, a2, b1]));
        assert_eq!(
            sorted(registry.subscribers(chat.id).await),
            sorted(vec![a1, a2, b1])
        );

        assert_eq!(
            registry.register_chat(&chat).await,
            Err(RegistryError::ChatAlreadyRegistered(chat.id))
        );

        // Reverse index is updated: unregistering drops the chat subscription.
        registry.unregister(b1).await.unwrap();
        assert_eq!(
            sorted(registry.subscribers(chat.id).await),
            sorted(vec![a1, a2])
        );
    }

    #[tokio::test]
    async fn register_chat_with_no_online_members() {
        let registry = ClientRegistry::new();
        let chat = Chat::personal(ChatId::random(), UserId::random(), UserId::random());
        assert!(registry.register_chat(&chat).await.unwrap().is_empty());
        assert!(registry.subscribers(chat.id).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_register_unregister() {
        let registry = Arc::new(ClientRegistry::new());
        let chat = ChatId::random();
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (id, sender, _tx) = client();
                registry.register(id, sender).await.unwrap();
                registry
                    .bind_identity(id, UserId::random(), "t".into(), &[chat])
                    .await
                    .unwrap();
                registry.unregister(id).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len().await, 0);
        assert!(registry.subscribers(chat).await.is_empty());
    }
}
