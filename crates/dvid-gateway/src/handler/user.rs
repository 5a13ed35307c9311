use std::sync::Arc;

use dvid_core::messages::{
    CurUserRequest, GetUserRequest, GetUsersRequest, UserResponse, UsersResponse,
};
use dvid_core::{DownstreamType, UpstreamPayload, UpstreamType};

use super::{backend_failure, bind};
use crate::backend::{Services, UserService};
use crate::route::{decode_as, AuthMiddleware, Request, Response, RouteTable};

#[derive(Clone)]
struct UserHandler {
    users: Arc<dyn UserService>,
}

pub(super) fn register(routes: &mut RouteTable, mw: &AuthMiddleware, services: &Services) {
    let h = UserHandler {
        users: services.users.clone(),
    };
    routes.register_authenticated(
        UpstreamType::CurUser,
        DownstreamType::CurUser,
        decode_as::<CurUserRequest>,
        bind(&h, UserHandler::cur_user),
        mw,
    );
    routes.register_authenticated(
        UpstreamType::GetUser,
        DownstreamType::GetUser,
        decode_as::<GetUserRequest>,
        bind(&h, UserHandler::get_user),
        mw,
    );
    routes.register_authenticated(
        UpstreamType::GetUsers,
        DownstreamType::GetUsers,
        decode_as::<GetUsersRequest>,
        bind(&h, UserHandler::get_users),
        mw,
    );
}

impl UserHandler {
    async fn cur_user(self, req: Request) -> Response {
        let Some(user_id) = req.user_id else {
            return Response::unauthorized();
        };
        match self.users.get(user_id).await {
            Ok(user) => Response::ok(UserResponse { user }),
            Err(e) => backend_failure("user.get", e),
        }
    }

    async fn get_user(self, req: Request) -> Response {
        let UpstreamPayload::GetUser(get) = req.payload else {
            return Response::internal();
        };
        match self.users.get(get.uid).await {
            Ok(user) => Response::ok(UserResponse { user }),
            Err(e) => backend_failure("user.get", e),
        }
    }

    async fn get_users(self, _req: Request) -> Response {
        match self.users.list().await {
            Ok(users) => Response::ok(UsersResponse { users }),
            Err(e) => backend_failure("user.list", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult, BoxFuture};
    use crate::handler::testing::{assert_type, payload, Harness};
    use dvid_core::{ErrorCode, User, UserId};

    /// User store whose listing endpoint is down.
    struct ListingDown {
        inner: Arc<dyn UserService>,
    }

    impl UserService for ListingDown {
        fn create<'a>(&'a self, email: &'a str, bio: &'a str) -> BoxFuture<'a, BackendResult<User>> {
            self.inner.create(email, bio)
        }

        fn get(&self, user_id: UserId) -> BoxFuture<'_, BackendResult<User>> {
            self.inner.get(user_id)
        }

        fn list(&self) -> BoxFuture<'_, BackendResult<Vec<User>>> {
            Box::pin(async { Err(BackendError::Unavailable("user store offline".into())) })
        }
    }

    #[tokio::test]
    async fn user_queries() {
        let h = Harness::new();
        let a = h.connect().await;
        let b = h.connect().await;
        let ann = h.sign_in(&a, "ann@example.com").await;
        let bob = h.sign_in(&b, "bob@example.com").await;

        let down = h.call(&a, UpstreamType::CurUser, &CurUserRequest {}).await;
        assert_type(&down, DownstreamType::CurUser);
        assert_eq!(payload::<UserResponse>(&down).user, ann);

        let down = h
            .call(&a, UpstreamType::GetUser, &GetUserRequest { uid: bob.id })
            .await;
        assert_type(&down, DownstreamType::GetUser);
        assert_eq!(payload::<UserResponse>(&down).user, bob);

        let down = h.call(&a, UpstreamType::GetUsers, &GetUsersRequest {}).await;
        assert_eq!(payload::<UsersResponse>(&down).users, vec![ann, bob]);

        let down = h
            .call(
                &a,
                UpstreamType::GetUser,
                &GetUserRequest {
                    uid: UserId::random(),
                },
            )
            .await;
        assert_eq!(down.error.unwrap().code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn queries_require_login() {
        let h = Harness::new();
        let anon = h.connect().await;
        let down = h.call(&anon, UpstreamType::GetUsers, &GetUsersRequest {}).await;
        assert_type(&down, DownstreamType::GetUsers);
        assert_eq!(down.error.unwrap().code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn unavailable_backend_is_internal_error() {
        let h = Harness::with_services(|services| {
            services.users = Arc::new(ListingDown {
                inner: services.users.clone(),
            });
        });
        let a = h.connect().await;
        h.sign_in(&a, "ann@example.com").await;

        let down = h.call(&a, UpstreamType::GetUsers, &GetUsersRequest {}).await;
        assert_type(&down, DownstreamType::GetUsers);
        let err = down.error.unwrap();
        assert_eq!(err.code, ErrorCode::Internal);
        // Collaborator details stay in the log.
        assert_eq!(err.desc, "internal error");
    }
}
