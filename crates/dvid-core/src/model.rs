//! Domain model shared by the gateway and its backends.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::DvidError;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name([u8; 16]);

        impl $name {
            /// Generate a random identifier.
            pub fn random() -> Self {
                Self(rand::random())
            }

            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = DvidError;

            fn try_from(v: &[u8]) -> Result<Self, DvidError> {
                let bytes: [u8; 16] = v.try_into().map_err(|_| {
                    DvidError::InvalidMessage(format!(
                        "{}: expected 16 bytes, got {}",
                        stringify!($name),
                        v.len()
                    ))
                })?;
                Ok(Self(bytes))
            }
        }

        impl FromStr for $name {
            type Err = DvidError;

            fn from_str(s: &str) -> Result<Self, DvidError> {
                let bytes = hex::decode(s)
                    .map_err(|e| DvidError::InvalidMessage(format!("bad hex id: {e}")))?;
                Self::try_from(bytes.as_slice())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let buf = crate::bytes::ByteBuf::deserialize(deserializer)?.into_vec();
                Self::try_from(buf.as_slice()).map_err(serde::de::Error::custom)
            }
        }
    };
}

id_type!(
    /// Identifier of a registered user.
    UserId
);
id_type!(
    /// Identifier of a chat.
    ChatId
);
id_type!(
    /// Identifier of a stored chat message.
    MessageId
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Personal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    #[serde(default)]
    pub members: Vec<UserId>,
}

impl Chat {
    /// A one-to-one chat between two users.
    pub fn personal(id: ChatId, a: UserId, b: UserId) -> Self {
        Self {
            id,
            kind: ChatKind::Personal,
            members: vec![a, b],
        }
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.contains(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub text: String,
    /// Unix time in milliseconds.
    pub timestamp: i64,
}
