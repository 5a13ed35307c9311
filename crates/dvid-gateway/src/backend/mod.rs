//! Collaborator interfaces the gateway calls out to.
//!
//! The gateway owns no domain state. Credentials, users, chats and message
//! history live behind these traits; the bundled [`memory`] implementation
//! keeps everything in process for development and tests.

pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dvid_core::{Chat, ChatId, ChatMessage, User, UserId};
use thiserror::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("chat already exists")]
    ChatExists,

    /// The collaborator could not be reached or failed internally. The
    /// in-memory backend never returns it; networked implementations do.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Credential checks and session token issuance.
pub trait AuthService: Send + Sync {
    /// Check credentials and issue a session token.
    fn login<'a>(&'a self, email: &'a str, password: &'a str) -> BoxFuture<'a, BackendResult<String>>;

    /// Store credentials for a newly created user.
    fn register<'a>(
        &'a self,
        user_id: UserId,
        email: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, BackendResult<()>>;

    /// Resolve a session token to the user it was issued for.
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, BackendResult<UserId>>;
}

pub trait UserService: Send + Sync {
    fn create<'a>(&'a self, email: &'a str, bio: &'a str) -> BoxFuture<'a, BackendResult<User>>;

    fn get(&self, user_id: UserId) -> BoxFuture<'_, BackendResult<User>>;

    fn list(&self) -> BoxFuture<'_, BackendResult<Vec<User>>>;
}

pub trait ChatService: Send + Sync {
    /// Create a personal chat between `from` and `to`.
    fn create(&self, from: UserId, to: UserId) -> BoxFuture<'_, BackendResult<Chat>>;

    fn get(&self, chat_id: ChatId) -> BoxFuture<'_, BackendResult<Chat>>;

    fn list_for_user(&self, user_id: UserId) -> BoxFuture<'_, BackendResult<Vec<Chat>>>;

    /// Store a message from `user_id`, who must be a member of the chat.
    fn send_message<'a>(
        &'a self,
        chat_id: ChatId,
        user_id: UserId,
        text: &'a str,
    ) -> BoxFuture<'a, BackendResult<ChatMessage>>;

    /// Message history of a chat, oldest first.
    fn messages(&self, chat_id: ChatId) -> BoxFuture<'_, BackendResult<Vec<ChatMessage>>>;
}

/// Receiver of domain events raised by the backend.
///
/// Calls must not block: implementations enqueue and return.
pub trait EventSink: Send + Sync {
    fn new_message(&self, message: ChatMessage);

    fn new_chat(&self, chat: Chat);
}

/// The set of backend services the handlers are wired against.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthService>,
    pub users: Arc<dyn UserService>,
    pub chats: Arc<dyn ChatService>,
}
