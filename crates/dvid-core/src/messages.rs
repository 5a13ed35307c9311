// dvid frontend protocol: type tags, error codes and inner payloads.
//
// The outer envelope (see `codec`) carries one of these payloads as an
// opaque CBOR blob; the discriminator picks the concrete type.

use serde::{Deserialize, Serialize};

use crate::model::{Chat, ChatId, ChatMessage, User, UserId};

/// Numeric request type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum UpstreamType {
    Echo = 1,
    Login = 2,
    Logout = 3,
    InfoInit = 4,
    CurUser = 5,
    GetUser = 6,
    GetUsers = 7,
    RegUser = 8,
    GetUserChats = 9,
    GetChat = 10,
    CreateChat = 11,
    SendMessage = 12,
    ChatMessages = 13,
}

impl From<UpstreamType> for u32 {
    fn from(t: UpstreamType) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for UpstreamType {
    type Error = String;
    fn try_from(v: u32) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Echo),
            2 => Ok(Self::Login),
            3 => Ok(Self::Logout),
            4 => Ok(Self::InfoInit),
            5 => Ok(Self::CurUser),
            6 => Ok(Self::GetUser),
            7 => Ok(Self::GetUsers),
            8 => Ok(Self::RegUser),
            9 => Ok(Self::GetUserChats),
            10 => Ok(Self::GetChat),
            11 => Ok(Self::CreateChat),
            12 => Ok(Self::SendMessage),
            13 => Ok(Self::ChatMessages),
            _ => Err(format!("unknown upstream type: {v}")),
        }
    }
}

/// Numeric response and push type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum DownstreamType {
    Unspecified = 0,
    Echo = 1,
    Login = 2,
    Logout = 3,
    InfoInit = 4,
    CurUser = 5,
    GetUser = 6,
    GetUsers = 7,
    RegUser = 8,
    GetUserChats = 9,
    GetChat = 10,
    CreateChat = 11,
    SendMessage = 12,
    ChatMessages = 13,

    NewMessage = 14,
    NewChat = 15,
}

impl From<DownstreamType> for u32 {
    fn from(t: DownstreamType) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for DownstreamType {
    type Error = String;
    fn try_from(v: u32) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Unspecified),
            1 => Ok(Self::Echo),
            2 => Ok(Self::Login),
            3 => Ok(Self::Logout),
            4 => Ok(Self::InfoInit),
            5 => Ok(Self::CurUser),
            6 => Ok(Self::GetUser),
            7 => Ok(Self::GetUsers),
            8 => Ok(Self::RegUser),
            9 => Ok(Self::GetUserChats),
            10 => Ok(Self::GetChat),
            11 => Ok(Self::CreateChat),
            12 => Ok(Self::SendMessage),
            13 => Ok(Self::ChatMessages),
            14 => Ok(Self::NewMessage),
            15 => Ok(Self::NewChat),
            _ => Err(format!("unknown downstream type: {v}")),
        }
    }
}

/// Error codes carried by a failed downstream envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    Internal = 1,
    Timeout = 2,
    Unauthorized = 3,
    BadLogin = 4,
    UnknownType = 5,
}

impl From<ErrorCode> for u8 {
    fn from(c: ErrorCode) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Internal),
            2 => Ok(Self::Timeout),
            3 => Ok(Self::Unauthorized),
            4 => Ok(Self::BadLogin),
            5 => Ok(Self::UnknownType),
            _ => Err(format!("unknown error code: {v}")),
        }
    }
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogoutRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfoInitRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurUserRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetUserRequest {
    pub uid: UserId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetUsersRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegUserRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetUserChatsRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetChatRequest {
    pub cid: ChatId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub uid: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub cid: ChatId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagesRequest {
    pub cid: ChatId,
}

// ── Response / push payloads ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogoutResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoInitResponse {
    pub user: User,
    #[serde(default)]
    pub chats: Vec<Chat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsersResponse {
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub chat: Chat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatsResponse {
    #[serde(default)]
    pub chats: Vec<Chat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

// ── Typed variants ────────────────────────────────────────────────────

/// A decoded request payload. The route table picks the variant from the
/// envelope discriminator, so no runtime type inspection is needed.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPayload {
    Echo(EchoRequest),
    Login(LoginRequest),
    Logout(LogoutRequest),
    InfoInit(InfoInitRequest),
    CurUser(CurUserRequest),
    GetUser(GetUserRequest),
    GetUsers(GetUsersRequest),
    RegUser(RegUserRequest),
    GetUserChats(GetUserChatsRequest),
    GetChat(GetChatRequest),
    CreateChat(CreateChatRequest),
    SendMessage(SendMessageRequest),
    ChatMessages(ChatMessagesRequest),
}

/// A response or push payload ready to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamPayload {
    Echo(EchoResponse),
    Login(LoginResponse),
    Logout(LogoutResponse),
    InfoInit(InfoInitResponse),
    User(UserResponse),
    Users(UsersResponse),
    Chat(ChatResponse),
    Chats(ChatsResponse),
    Message(MessageResponse),
    Messages(MessagesResponse),
}

macro_rules! payload_from {
    ($enum:ident { $($variant:ident($ty:ty)),* $(,)? }) => {
        $(
            impl From<$ty> for $enum {
                fn from(p: $ty) -> Self {
                    $enum::$variant(p)
                }
            }
        )*
    };
}

payload_from!(UpstreamPayload {
    Echo(EchoRequest),
    Login(LoginRequest),
    Logout(LogoutRequest),
    InfoInit(InfoInitRequest),
    CurUser(CurUserRequest),
    GetUser(GetUserRequest),
    GetUsers(GetUsersRequest),
    RegUser(RegUserRequest),
    GetUserChats(GetUserChatsRequest),
    GetChat(GetChatRequest),
    CreateChat(CreateChatRequest),
    SendMessage(SendMessageRequest),
    ChatMessages(ChatMessagesRequest),
});

payload_from!(DownstreamPayload {
    Echo(EchoResponse),
    Login(LoginResponse),
    Logout(LogoutResponse),
    InfoInit(InfoInitResponse),
    User(UserResponse),
    Users(UsersResponse),
    Chat(ChatResponse),
    Chats(ChatsResponse),
    Message(MessageResponse),
    Messages(MessagesResponse),
});

impl DownstreamPayload {
    /// CBOR-encode the inner message.
    pub fn encode(&self) -> crate::DvidResult<Vec<u8>> {
        use crate::codec::encode_payload;
        match self {
            Self::Echo(p) => encode_payload(p),
            Self::Login(p) => encode_payload(p),
            Self::Logout(p) => encode_payload(p),
            Self::InfoInit(p) => encode_payload(p),
            Self::User(p) => encode_payload(p),
            Self::Users(p) => encode_payload(p),
            Self::Chat(p) => encode_payload(p),
            Self::Chats(p) => encode_payload(p),
            Self::Message(p) => encode_payload(p),
            Self::Messages(p) => encode_payload(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_tags_round_trip() {
        for v in 1..=13u32 {
            let t = UpstreamType::try_from(v).unwrap();
            assert_eq!(u32::from(t), v);
        }
        assert!(UpstreamType::try_from(0).is_err());
        assert!(UpstreamType::try_from(14).is_err());
    }

    #[test]
    fn push_types_are_downstream_only() {
        assert_eq!(DownstreamType::try_from(14), Ok(DownstreamType::NewMessage));
        assert_eq!(DownstreamType::try_from(15), Ok(DownstreamType::NewChat));
        assert!(UpstreamType::try_from(14).is_err());
    }

    #[test]
    fn error_code_values() {
        assert_eq!(u8::from(ErrorCode::Internal), 1);
        assert_eq!(u8::from(ErrorCode::UnknownType), 5);
        assert!(ErrorCode::try_from(9).is_err());
    }
}
