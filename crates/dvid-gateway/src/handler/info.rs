use std::sync::Arc;

use dvid_core::messages::{InfoInitRequest, InfoInitResponse};
use dvid_core::{DownstreamType, UpstreamType};

use super::{backend_failure, bind};
use crate::backend::{ChatService, Services, UserService};
use crate::route::{decode_as, AuthMiddleware, Request, Response, RouteTable};

/// Initial snapshot for a freshly logged-in client: its user and chats.
#[derive(Clone)]
struct InfoHandler {
    users: Arc<dyn UserService>,
    chats: Arc<dyn ChatService>,
}

pub(super) fn register(routes: &mut RouteTable, mw: &AuthMiddleware, services: &Services) {
    let h = InfoHandler {
        users: services.users.clone(),
        chats: services.chats.clone(),
    };
    routes.register_authenticated(
        UpstreamType::InfoInit,
        DownstreamType::InfoInit,
        decode_as::<InfoInitRequest>,
        bind(&h, InfoHandler::info_init),
        mw,
    );
}

impl InfoHandler {
    async fn info_init(self, req: Request) -> Response {
        let Some(user_id) = req.user_id else {
            return Response::unauthorized();
        };
        let lookups = async {
            tokio::join!(self.users.get(user_id), self.chats.list_for_user(user_id))
        };
        let Ok((user, chats)) = tokio::time::timeout_at(req.deadline, lookups).await else {
            return Response::timeout();
        };
        let user = match user {
            Ok(user) => user,
            Err(e) => return backend_failure("user.get", e),
        };
        let chats = match chats {
            Ok(chats) => chats,
            Err(e) => return backend_failure("chat.list_for_user", e),
        };
        Response::ok(InfoInitResponse { user, chats })
    }
}
