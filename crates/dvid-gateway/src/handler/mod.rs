//! Request handlers, grouped by concern, and their route registration.

mod auth;
mod chat;
mod info;
mod system;
mod user;

use std::future::Future;
use std::sync::Arc;

use dvid_core::ErrorCode;
use tracing::error;

use crate::backend::{BackendError, Services};
use crate::registry::ClientRegistry;
use crate::route::{handler, AuthMiddleware, Handler, Request, Response, RouteTable};

/// Install every request route.
pub fn register_routes(routes: &mut RouteTable, registry: Arc<ClientRegistry>, services: &Services) {
    let auth = AuthMiddleware::new(registry.clone());
    system::register(routes);
    auth::register(routes, &auth, registry, services);
    user::register(routes, &auth, services);
    chat::register(routes, &auth, services);
    info::register(routes, &auth, services);
}

/// Bind a handler method to a cloneable handler state.
fn bind<H, F, Fut>(state: &H, f: F) -> Handler
where
    H: Clone + Send + Sync + 'static,
    F: Fn(H, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let state = state.clone();
    handler(move |req| f(state.clone(), req))
}

/// Map a backend failure to a client-facing response.
fn backend_failure(op: &'static str, err: BackendError) -> Response {
    match &err {
        BackendError::NotFound(what) => Response::error(ErrorCode::Internal, format!("{what} not found")),
        BackendError::UserExists(_) => Response::error(ErrorCode::Internal, "user already exists"),
        BackendError::ChatExists => Response::error(ErrorCode::Internal, "chat already exists"),
        BackendError::InvalidCredentials => Response::unauthorized(),
        BackendError::Unavailable(_) => {
            error!(op, error = %err, "backend call failed");
            Response::internal()
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Harness driving handlers through the dispatcher with an in-memory backend.

    use std::sync::Arc;
    use std::time::Duration;

    use dvid_core::{
        decode_downstream, decode_payload, encode_payload, encode_upstream, Downstream,
        DownstreamType, UpstreamType,
    };
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use tokio::sync::mpsc;

    use crate::backend::{memory, Services};
    use crate::connection::{ConnectionId, ConnectionSender};
    use crate::dispatcher::Dispatcher;
    use crate::notifier::{Notifier, NotifierHandle};
    use crate::registry::ClientRegistry;
    use crate::route::RouteTable;

    pub struct Harness {
        pub registry: Arc<ClientRegistry>,
        pub services: Services,
        pub dispatcher: Dispatcher,
        _events: NotifierHandle,
    }

    pub struct TestClient {
        pub id: ConnectionId,
        pub rx: mpsc::Receiver<Vec<u8>>,
        _tx: mpsc::Sender<Vec<u8>>,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_services(|_| {})
        }

        /// Harness whose in-memory services are adjusted by `customize` before
        /// the routes are wired.
        pub fn with_services(customize: impl FnOnce(&mut Services)) -> Self {
            let registry = Arc::new(ClientRegistry::new());
            let (events, _task) = Notifier::new(registry.clone()).start();
            let mut services =
                memory::services(b"test-secret".to_vec(), 3600, Arc::new(events.clone()));
            customize(&mut services);
            let mut routes = RouteTable::new();
            super::register_routes(&mut routes, registry.clone(), &services);
            Self {
                registry,
                services,
                dispatcher: Dispatcher::new(routes, Duration::from_secs(1)),
                _events: events,
            }
        }

        pub async fn connect(&self) -> TestClient {
            let id = ConnectionId::generate();
            let (tx, rx) = mpsc::channel(16);
            self.registry
                .register(id, ConnectionSender::new(id, &tx, Duration::from_millis(100)))
                .await
                .unwrap();
            TestClient { id, rx, _tx: tx }
        }

        pub async fn call<T: Serialize>(
            &self,
            client: &TestClient,
            msg_type: UpstreamType,
            request: &T,
        ) -> Downstream {
            let payload = encode_payload(request).unwrap();
            let frame = encode_upstream(msg_type.into(), &payload).unwrap();
            let out = self.dispatcher.dispatch(client.id, &frame).await.unwrap();
            decode_downstream(&out).unwrap()
        }

        /// Create a user and log `client` in as them.
        pub async fn sign_in(&self, client: &TestClient, email: &str) -> dvid_core::User {
            use dvid_core::messages::{LoginRequest, RegUserRequest, UserResponse};
            let reg = self
                .call(
                    client,
                    UpstreamType::RegUser,
                    &RegUserRequest {
                        email: email.into(),
                        password: "pw".into(),
                        bio: String::new(),
                    },
                )
                .await;
            let user: UserResponse = payload(&reg);
            let login = self
                .call(
                    client,
                    UpstreamType::Login,
                    &LoginRequest {
                        email: email.into(),
                        password: "pw".into(),
                    },
                )
                .await;
            assert!(!login.is_error(), "login failed: {:?}", login.error);
            user.user
        }
    }

    pub fn payload<T: DeserializeOwned>(down: &Downstream) -> T {
        assert!(!down.is_error(), "unexpected error: {:?}", down.error);
        decode_payload(down.payload.as_deref().unwrap_or_default()).unwrap()
    }

    pub fn assert_type(down: &Downstream, expected: DownstreamType) {
        assert_eq!(down.msg_type, u32::from(expected));
    }
}
