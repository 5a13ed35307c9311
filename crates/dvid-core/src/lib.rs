//! dvid-core: shared protocol library for the dvid messenger gateway.
//!
//! Provides the CBOR envelope codec, typed request/response payloads, the
//! domain model, and HMAC session tokens.

mod bytes;
pub mod codec;
pub mod error;
pub mod messages;
pub mod model;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{
    decode_downstream, decode_payload, decode_upstream, encode_downstream, encode_payload,
    encode_upstream, Downstream, DownstreamError, Upstream,
};
pub use error::{DvidError, DvidResult};
pub use messages::{DownstreamPayload, DownstreamType, ErrorCode, UpstreamPayload, UpstreamType};
pub use model::{Chat, ChatId, ChatKind, ChatMessage, MessageId, User, UserId};
pub use token::{create_token, generate_secret, verify_token};
