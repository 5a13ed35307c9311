//! Request dispatch: envelope decode, route lookup, deadline-bounded handler
//! execution and response encoding.
//!
//! Every inbound frame yields exactly one response frame.

use std::sync::Arc;
use std::time::Duration;

use dvid_core::{decode_upstream, DownstreamType, DvidResult};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::connection::ConnectionId;
use crate::route::{Request, Response, RouteTable};

pub struct Dispatcher {
    routes: Arc<RouteTable>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(routes: RouteTable, request_timeout: Duration) -> Self {
        Self {
            routes: Arc::new(routes),
            request_timeout,
        }
    }

    /// Handle one inbound frame and return the encoded response.
    ///
    /// The handler runs on its own task. When the deadline passes the caller
    /// gets a TIMEOUT response; the handler task is left to finish on its own
    /// and its result is discarded.
    pub async fn dispatch(&self, connection_id: ConnectionId, frame: &[u8]) -> DvidResult<Vec<u8>> {
        let upstream = match decode_upstream(frame) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(conn = %connection_id, error = %e, "malformed request envelope");
                return Response::internal().into_frame(DownstreamType::Unspecified.into());
            }
        };

        let Some(route) = self.routes.lookup(upstream.msg_type) else {
            debug!(conn = %connection_id, msg_type = upstream.msg_type, "unknown message type");
            return Response::unknown_type(upstream.msg_type).into_frame(upstream.msg_type);
        };
        let response_type = u32::from(route.response_type);

        let payload = match (route.decode)(&upstream.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    conn = %connection_id,
                    msg_type = upstream.msg_type,
                    error = %e,
                    "failed to decode request payload"
                );
                return Response::internal().into_frame(response_type);
            }
        };

        debug!(
            conn = %connection_id,
            msg_type = upstream.msg_type,
            auth = route.requires_auth,
            "dispatching request"
        );
        let request = Request {
            connection_id,
            user_id: None,
            payload,
            deadline: Instant::now() + self.request_timeout,
        };
        let task = tokio::spawn((route.handler)(request));

        let response = match tokio::time::timeout(self.request_timeout, task).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(conn = %connection_id, msg_type = upstream.msg_type, error = %e, "handler task failed");
                Response::internal()
            }
            Err(_) => {
                warn!(
                    conn = %connection_id,
                    msg_type = upstream.msg_type,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "request timed out"
                );
                Response::timeout()
            }
        };

        response.into_frame(response_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{decode_as, handler};
    use dvid_core::messages::{EchoRequest, EchoResponse, LogoutRequest};
    use dvid_core::{
        decode_downstream, decode_payload, encode_payload, encode_upstream, DownstreamType,
        ErrorCode, UpstreamPayload, UpstreamType,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn dispatcher(timeout: Duration, finished: Arc<AtomicBool>) -> Dispatcher {
        let mut routes = RouteTable::new();
        routes.register(
            UpstreamType::Echo,
            DownstreamType::Echo,
            decode_as::<EchoRequest>,
            handler(|req: Request| async move {
                match req.payload {
                    UpstreamPayload::Echo(echo) => Response::ok(EchoResponse {
                        content: echo.content,
                    }),
                    _ => Response::internal(),
                }
            }),
        );
        routes.register(
            UpstreamType::Logout,
            DownstreamType::Logout,
            decode_as::<LogoutRequest>,
            handler(move |_req: Request| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    finished.store(true, Ordering::SeqCst);
                    Response::internal()
                }
            }),
        );
        routes.register(
            UpstreamType::CurUser,
            DownstreamType::CurUser,
            decode_as::<dvid_core::messages::CurUserRequest>,
            handler(|_req: Request| async move {
                let missing: Option<Response> = None;
                missing.expect("handler bug")
            }),
        );
        Dispatcher::new(routes, timeout)
    }

    fn frame(msg_type: u32, payload: &[u8]) -> Vec<u8> {
        encode_upstream(msg_type, payload).unwrap()
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let payload = encode_payload(&EchoRequest {
            content: "hello".into(),
        })
        .unwrap();
        let out = d
            .dispatch(ConnectionId::generate(), &frame(1, &payload))
            .await
            .unwrap();
        let down = decode_downstream(&out).unwrap();
        assert_eq!(down.msg_type, u32::from(DownstreamType::Echo));
        assert!(!down.is_error());
        let echo: EchoResponse = decode_payload(&down.payload.unwrap()).unwrap();
        assert_eq!(echo.content, "hello");
    }

    #[tokio::test]
    async fn unknown_type() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        for msg_type in [0u32, 7, 999] {
            let out = d
                .dispatch(ConnectionId::generate(), &frame(msg_type, &[]))
                .await
                .unwrap();
            let down = decode_downstream(&out).unwrap();
            assert_eq!(down.msg_type, msg_type);
            assert_eq!(down.error.unwrap().code, ErrorCode::UnknownType);
        }
    }

    #[tokio::test]
    async fn malformed_envelope() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let out = d
            .dispatch(ConnectionId::generate(), &[0xff, 0x01])
            .await
            .unwrap();
        let down = decode_downstream(&out).unwrap();
        assert_eq!(down.msg_type, u32::from(DownstreamType::Unspecified));
        assert_eq!(down.error.unwrap().code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn undecodable_payload() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let out = d
            .dispatch(ConnectionId::generate(), &frame(1, &[0xa0]))
            .await
            .unwrap();
        let down = decode_downstream(&out).unwrap();
        assert_eq!(down.msg_type, u32::from(DownstreamType::Echo));
        assert_eq!(down.error.unwrap().code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn slow_handler_times_out_but_keeps_running() {
        let finished = Arc::new(AtomicBool::new(false));
        let d = dispatcher(Duration::from_millis(30), finished.clone());

        let out = d
            .dispatch(ConnectionId::generate(), &frame(3, &[]))
            .await
            .unwrap();
        let down = decode_downstream(&out).unwrap();
        assert_eq!(down.msg_type, u32::from(DownstreamType::Logout));
        assert_eq!(down.error.unwrap().code, ErrorCode::Timeout);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_handler_is_internal_error() {
        let d = dispatcher(Duration::from_secs(1), Arc::default());
        let out = d
            .dispatch(ConnectionId::generate(), &frame(5, &[]))
            .await
            .unwrap();
        let down = decode_downstream(&out).unwrap();
        assert_eq!(down.msg_type, u32::from(DownstreamType::CurUser));
        assert_eq!(down.error.unwrap().code, ErrorCode::Internal);
    }
}
