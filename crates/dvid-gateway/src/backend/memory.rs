//! In-process backend: users, credentials, chats and message history held in
//! memory. State is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use dvid_core::{create_token, verify_token, Chat, ChatId, ChatMessage, MessageId, User, UserId};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    AuthService, BackendError, BackendResult, BoxFuture, ChatService, EventSink, Services,
    UserService,
};

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn password_digest(user_id: &UserId, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

struct Credentials {
    user_id: UserId,
    digest: [u8; 32],
}

/// Email/password store issuing HMAC session tokens.
pub struct MemoryAuth {
    secret: Vec<u8>,
    token_ttl_secs: u64,
    credentials: RwLock<HashMap<String, Credentials>>,
}

impl MemoryAuth {
    pub fn new(secret: Vec<u8>, token_ttl_secs: u64) -> Self {
        Self {
            secret,
            token_ttl_secs,
            credentials: RwLock::new(HashMap::new()),
        }
    }
}

impl AuthService for MemoryAuth {
    fn login<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            let credentials = self.credentials.read().await;
            let entry = credentials
                .get(email)
                .ok_or(BackendError::InvalidCredentials)?;
            if password_digest(&entry.user_id, password) != entry.digest {
                return Err(BackendError::InvalidCredentials);
            }
            Ok(create_token(&self.secret, &entry.user_id, self.token_ttl_secs))
        })
    }

    fn register<'a>(
        &'a self,
        user_id: UserId,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let mut credentials = self.credentials.write().await;
            if credentials.contains_key(email) {
                return Err(BackendError::UserExists(email.to_string()));
            }
            credentials.insert(
                email.to_string(),
                Credentials {
                    user_id,
                    digest: password_digest(&user_id, password),
                },
            );
            Ok(())
        })
    }

    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, BackendResult<UserId>> {
        Box::pin(async move {
            verify_token(&self.secret, token).map_err(|e| {
                debug!(error = %e, "token rejected");
                BackendError::InvalidCredentials
            })
        })
    }
}

#[derive(Default)]
pub struct MemoryUsers {
    users: RwLock<HashMap<UserId, User>>,
}

impl MemoryUsers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserService for MemoryUsers {
    fn create<'a>(&'a self, email: &'a str, bio: &'a str) -> BoxFuture<'a, BackendResult<User>> {
        Box::pin(async move {
            let mut users = self.users.write().await;
            if users.values().any(|u| u.email == email) {
                return Err(BackendError::UserExists(email.to_string()));
            }
            let user = User {
                id: UserId::random(),
                email: email.to_string(),
                bio: bio.to_string(),
            };
            users.insert(user.id, user.clone());
            Ok(user)
        })
    }

    fn get(&self, user_id: UserId) -> BoxFuture<'_, BackendResult<User>> {
        Box::pin(async move {
            self.users
                .read()
                .await
                .get(&user_id)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(format!("user {user_id}")))
        })
    }

    fn list(&self) -> BoxFuture<'_, BackendResult<Vec<User>>> {
        Box::pin(async move {
            let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
            users.sort_by(|a, b| a.email.cmp(&b.email));
            Ok(users)
        })
    }
}

#[derive(Default)]
struct ChatState {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<ChatId, Vec<ChatMessage>>,
}

/// Personal chats and their message history. New chats and messages are
/// reported to the event sink after they are stored.
pub struct MemoryChats {
    state: RwLock<ChatState>,
    events: Arc<dyn EventSink>,
}

impl MemoryChats {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            state: RwLock::new(ChatState::default()),
            events,
        }
    }
}

impl ChatService for MemoryChats {
    fn create(&self, from: UserId, to: UserId) -> BoxFuture<'_, BackendResult<Chat>> {
        Box::pin(async move {
            let chat = {
                let mut state = self.state.write().await;
                let exists = state
                    .chats
                    .values()
                    .any(|c| c.has_member(&from) && c.has_member(&to));
                if exists {
                    return Err(BackendError::ChatExists);
                }
                let chat = Chat::personal(ChatId::random(), from, to);
                state.chats.insert(chat.id, chat.clone());
                state.messages.insert(chat.id, Vec::new());
                chat
            };
            self.events.new_chat(chat.clone());
            Ok(chat)
        })
    }

    fn get(&self, chat_id: ChatId) -> BoxFuture<'_, BackendResult<Chat>> {
        Box::pin(async move {
            self.state
                .read()
                .await
                .chats
                .get(&chat_id)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(format!("chat {chat_id}")))
        })
    }

    fn list_for_user(&self, user_id: UserId) -> BoxFuture<'_, BackendResult<Vec<Chat>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .chats
                .values()
                .filter(|c| c.has_member(&user_id))
                .cloned()
                .collect())
        })
    }

    fn send_message<'a>(
        &'a self,
        chat_id: ChatId,
        user_id: UserId,
        text: &'a str,
    ) -> BoxFuture<'a, BackendResult<ChatMessage>> {
        Box::pin(async move {
            let message = {
                let mut state = self.state.write().await;
                let is_member = state
                    .chats
                    .get(&chat_id)
                    .is_some_and(|c| c.has_member(&user_id));
                if !is_member {
                    return Err(BackendError::NotFound(format!("chat {chat_id}")));
                }
                let message = ChatMessage {
                    id: MessageId::random(),
                    chat_id,
                    user_id,
                    text: text.to_string(),
                    timestamp: now_millis(),
                };
                state
                    .messages
                    .entry(chat_id)
                    .or_default()
                    .push(message.clone());
                message
            };
            self.events.new_message(message.clone());
            Ok(message)
        })
    }

    fn messages(&self, chat_id: ChatId) -> BoxFuture<'_, BackendResult<Vec<ChatMessage>>> {
        Box::pin(async move {
            self.state
                .read()
                .await
                .messages
                .get(&chat_id)
                .cloned()
                .ok_or_else(|| BackendError::NotFound(format!("chat {chat_id}")))
        })
    }
}

/// Wire a complete in-memory backend reporting events to `events`.
pub fn services(secret: Vec<u8>, token_ttl_secs: u64, events: Arc<dyn EventSink>) -> Services {
    Services {
        auth: Arc::new(MemoryAuth::new(secret, token_ttl_secs)),
        users: Arc::new(MemoryUsers::new()),
        chats: Arc::new(MemoryChats::new(events)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<ChatMessage>>,
        chats: Mutex<Vec<Chat>>,
    }

    impl EventSink for RecordingSink {
        fn new_message(&self, message: ChatMessage) {
            self.messages.lock().unwrap().push(message);
        }

        fn new_chat(&self, chat: Chat) {
            self.chats.lock().unwrap().push(chat);
        }
    }

    #[tokio::test]
    async fn login_issues_verifiable_token() {
        let auth = MemoryAuth::new(b"secret".to_vec(), 60);
        let uid = UserId::random();
        auth.register(uid, "a@x", "pw").await.unwrap();

        let token = auth.login("a@x", "pw").await.unwrap();
        assert_eq!(auth.verify(&token).await.unwrap(), uid);

        assert_eq!(
            auth.login("a@x", "wrong").await,
            Err(BackendError::InvalidCredentials)
        );
        assert_eq!(
            auth.login("b@x", "pw").await,
            Err(BackendError::InvalidCredentials)
        );
        assert_eq!(
            auth.verify("deadbeef").await,
            Err(BackendError::InvalidCredentials)
        );
        assert!(matches!(
            auth.register(UserId::random(), "a@x", "pw").await,
            Err(BackendError::UserExists(_))
        ));
    }

    #[tokio::test]
    async fn users_are_unique_by_email() {
        let users = MemoryUsers::new();
        let bob = users.create("bob@x", "hi").await.unwrap();
        users.create("alice@x", "").await.unwrap();
        assert!(matches!(
            users.create("bob@x", "").await,
            Err(BackendError::UserExists(_))
        ));

        assert_eq!(users.get(bob.id).await.unwrap(), bob);
        assert!(matches!(
            users.get(UserId::random()).await,
            Err(BackendError::NotFound(_))
        ));

        let emails: Vec<String> = users.list().await.unwrap().into_iter().map(|u| u.email).collect();
        assert_eq!(emails, vec!["alice@x", "bob@x"]);
    }

    #[tokio::test]
    async fn chat_lifecycle_raises_events() {
        let sink = Arc::new(RecordingSink::default());
        let chats = MemoryChats::new(sink.clone());
        let (a, b, c) = (UserId::random(), UserId::random(), UserId::random());

        let chat = chats.create(a, b).await.unwrap();
        assert_eq!(chats.create(b, a).await, Err(BackendError::ChatExists));
        assert_eq!(sink.chats.lock().unwrap().as_slice(), &[chat.clone()]);

        assert_eq!(chats.list_for_user(a).await.unwrap(), vec![chat.clone()]);
        assert!(chats.list_for_user(c).await.unwrap().is_empty());

        let msg = chats.send_message(chat.id, a, "hello").await.unwrap();
        assert_eq!(msg.chat_id, chat.id);
        assert_eq!(msg.user_id, a);
        assert!(msg.timestamp > 0);
        assert_eq!(sink.messages.lock().unwrap().as_slice(), &[msg.clone()]);
        assert_eq!(chats.messages(chat.id).await.unwrap(), vec![msg]);

        // Outsiders cannot post, and unknown chats are not found.
        assert!(matches!(
            chats.send_message(chat.id, c, "hi").await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            chats.messages(ChatId::random()).await,
            Err(BackendError::NotFound(_))
        ));
        assert_eq!(sink.messages.lock().unwrap().len(), 1);
    }
}
