//! Login, logout and user registration.

use std::sync::Arc;

use dvid_core::messages::{
    LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, RegUserRequest, UserResponse,
};
use dvid_core::{ChatId, DownstreamType, UpstreamPayload, UpstreamType};
use tracing::{debug, error, info, warn};

use super::{backend_failure, bind};
use crate::backend::{AuthService, BackendError, ChatService, Services, UserService};
use crate::registry::ClientRegistry;
use crate::route::{decode_as, AuthMiddleware, Request, Response, RouteTable};

#[derive(Clone)]
struct AuthHandler {
    registry: Arc<ClientRegistry>,
    auth: Arc<dyn AuthService>,
    users: Arc<dyn UserService>,
    chats: Arc<dyn ChatService>,
}

pub(super) fn register(
    routes: &mut RouteTable,
    mw: &AuthMiddleware,
    registry: Arc<ClientRegistry>,
    services: &Services,
) {
    let h = AuthHandler {
        registry,
        auth: services.auth.clone(),
        users: services.users.clone(),
        chats: services.chats.clone(),
    };
    routes.register(
        UpstreamType::Login,
        DownstreamType::Login,
        decode_as::<LoginRequest>,
        bind(&h, AuthHandler::login),
    );
    routes.register(
        UpstreamType::RegUser,
        DownstreamType::RegUser,
        decode_as::<RegUserRequest>,
        bind(&h, AuthHandler::reg_user),
    );
    routes.register_authenticated(
        UpstreamType::Logout,
        DownstreamType::Logout,
        decode_as::<LogoutRequest>,
        bind(&h, AuthHandler::logout),
        mw,
    );
}

impl AuthHandler {
    async fn login(self, req: Request) -> Response {
        let UpstreamPayload::Login(login) = req.payload else {
            return Response::internal();
        };

        let token = match self.auth.login(&login.email, &login.password).await {
            Ok(token) => token,
            Err(BackendError::InvalidCredentials) => {
                debug!(conn = %req.connection_id, email = %login.email, "bad login");
                return Response::bad_login();
            }
            Err(e) => return backend_failure("auth.login", e),
        };

        let user_id = match self.auth.verify(&token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                error!(conn = %req.connection_id, error = %e, "freshly issued token rejected");
                return Response::internal();
            }
        };

        let chats = match self.chats.list_for_user(user_id).await {
            Ok(chats) => chats,
            Err(e) => return backend_failure("chat.list_for_user", e),
        };
        let chat_ids: Vec<ChatId> = chats.iter().map(|c| c.id).collect();

        if let Err(e) = self
            .registry
            .bind_identity(req.connection_id, user_id, token.clone(), &chat_ids)
            .await
        {
            warn!(conn = %req.connection_id, error = %e, "failed to bind identity");
            return Response::internal();
        }

        info!(conn = %req.connection_id, user = %user_id, "user logged in");
        Response::ok(LoginResponse { token })
    }

    async fn logout(self, req: Request) -> Response {
        match self.registry.clear_identity(req.connection_id).await {
            Ok(identity) => {
                info!(conn = %req.connection_id, user = %identity.user_id, "user logged out");
                Response::ok(LogoutResponse {})
            }
            Err(e) => {
                debug!(conn = %req.connection_id, error = %e, "logout without identity");
                Response::unauthorized()
            }
        }
    }

    async fn reg_user(self, req: Request) -> Response {
        let UpstreamPayload::RegUser(reg) = req.payload else {
            return Response::internal();
        };

        let user = match self.users.create(&reg.email, &reg.bio).await {
            Ok(user) => user,
            Err(e) => return backend_failure("user.create", e),
        };
        if let Err(e) = self.auth.register(user.id, &reg.email, &reg.password).await {
            return backend_failure("auth.register", e);
        }

        info!(user = %user.id, email = %user.email, "user registered");
        Response::ok(UserResponse { user })
    }
}
