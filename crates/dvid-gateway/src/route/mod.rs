//! Route table: request type tag → payload decoder, handler and response tag.

mod middleware;

pub use middleware::AuthMiddleware;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dvid_core::{
    decode_payload, encode_downstream, DownstreamError, DownstreamPayload, DownstreamType,
    DvidResult, ErrorCode, UpstreamPayload, UpstreamType, UserId,
};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::connection::ConnectionId;

/// A decoded request handed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub connection_id: ConnectionId,
    /// Set by [`AuthMiddleware`] before an authenticated handler runs.
    pub user_id: Option<UserId>,
    pub payload: UpstreamPayload,
    /// When the dispatcher stops waiting for the response.
    pub deadline: Instant,
}

/// Outcome of a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Payload(DownstreamPayload),
    Error { code: ErrorCode, desc: String },
}

impl Response {
    pub fn ok(payload: impl Into<DownstreamPayload>) -> Self {
        Self::Payload(payload.into())
    }

    pub fn error(code: ErrorCode, desc: impl Into<String>) -> Self {
        Self::Error {
            code,
            desc: desc.into(),
        }
    }

    pub fn internal() -> Self {
        Self::error(ErrorCode::Internal, "internal error")
    }

    pub fn timeout() -> Self {
        Self::error(ErrorCode::Timeout, "request timed out")
    }

    pub fn unauthorized() -> Self {
        Self::error(ErrorCode::Unauthorized, "unauthorized")
    }

    pub fn bad_login() -> Self {
        Self::error(ErrorCode::BadLogin, "invalid email or password")
    }

    pub fn unknown_type(msg_type: u32) -> Self {
        Self::error(ErrorCode::UnknownType, format!("unknown message type {msg_type}"))
    }

    /// Encode into a downstream envelope tagged `msg_type`.
    ///
    /// A payload that fails to encode is reported as an internal error.
    pub fn into_frame(self, msg_type: u32) -> DvidResult<Vec<u8>> {
        match self {
            Response::Payload(payload) => match payload.encode() {
                Ok(bytes) => encode_downstream(msg_type, Some(bytes), None),
                Err(e) => {
                    error!(msg_type, error = %e, "failed to encode response payload");
                    Response::internal().into_frame(msg_type)
                }
            },
            Response::Error { code, desc } => {
                encode_downstream(msg_type, None, Some(DownstreamError::new(code, desc)))
            }
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Asynchronous request handler.
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// Decodes the opaque payload bytes of one request type.
pub type PayloadDecoder = fn(&[u8]) -> DvidResult<UpstreamPayload>;

/// Wrap an async function as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req| -> HandlerFuture { Box::pin(f(req)) })
}

/// Payload decoder for request type `T`.
pub fn decode_as<T>(data: &[u8]) -> DvidResult<UpstreamPayload>
where
    T: DeserializeOwned + Into<UpstreamPayload>,
{
    decode_payload::<T>(data).map(Into::into)
}

pub struct RouteEntry {
    pub response_type: DownstreamType,
    pub decode: PayloadDecoder,
    pub handler: Handler,
    pub requires_auth: bool,
}

/// Maps each request type to exactly one route. Populated once at startup.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<UpstreamType, RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route reachable without authentication.
    /// Returns false if the request type already has a route.
    pub fn register(
        &mut self,
        request_type: UpstreamType,
        response_type: DownstreamType,
        decode: PayloadDecoder,
        handler: Handler,
    ) -> bool {
        self.insert(request_type, response_type, decode, handler, false)
    }

    /// Register a route guarded by `auth`.
    pub fn register_authenticated(
        &mut self,
        request_type: UpstreamType,
        response_type: DownstreamType,
        decode: PayloadDecoder,
        handler: Handler,
        auth: &AuthMiddleware,
    ) -> bool {
        self.insert(
            request_type,
            response_type,
            decode,
            auth.require_auth(handler),
            true,
        )
    }

    fn insert(
        &mut self,
        request_type: UpstreamType,
        response_type: DownstreamType,
        decode: PayloadDecoder,
        handler: Handler,
        requires_auth: bool,
    ) -> bool {
        if self.routes.contains_key(&request_type) {
            warn!(?request_type, "route already registered");
            return false;
        }
        self.routes.insert(
            request_type,
            RouteEntry {
                response_type,
                decode,
                handler,
                requires_auth,
            },
        );
        true
    }

    /// Find the route for a raw discriminator.
    pub fn lookup(&self, msg_type: u32) -> Option<&RouteEntry> {
        let request_type = UpstreamType::try_from(msg_type).ok()?;
        self.routes.get(&request_type)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
