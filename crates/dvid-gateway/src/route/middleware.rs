use std::sync::Arc;

use tracing::debug;

use super::{Handler, HandlerFuture, Request, Response};
use crate::registry::ClientRegistry;

/// Rejects requests from connections without a bound identity and injects
/// the authenticated user id into the rest.
#[derive(Clone)]
pub struct AuthMiddleware {
    registry: Arc<ClientRegistry>,
}

impl AuthMiddleware {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn require_auth(&self, inner: Handler) -> Handler {
        let registry = self.registry.clone();
        Arc::new(move |mut req: Request| -> HandlerFuture {
            let registry = registry.clone();
            let inner = inner.clone();
            Box::pin(async move {
                match registry.identity(req.connection_id).await {
                    Ok(identity) => {
                        req.user_id = Some(identity.user_id);
                        inner(req).await
                    }
                    Err(e) => {
                        debug!(conn = %req.connection_id, error = %e, "rejected unauthenticated request");
                        Response::unauthorized()
                    }
                }
            })
        })
    }
}
