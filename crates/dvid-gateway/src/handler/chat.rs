//! Chat listing, creation and messaging.
//!
//! Members only: a chat that the caller does not belong to is reported as
//! not found.

use std::sync::Arc;

use dvid_core::messages::{
    ChatMessagesRequest, ChatResponse, ChatsResponse, CreateChatRequest, GetChatRequest,
    GetUserChatsRequest, MessageResponse, MessagesResponse, SendMessageRequest,
};
use dvid_core::{Chat, ChatId, DownstreamType, ErrorCode, UpstreamPayload, UpstreamType, UserId};

use super::{backend_failure, bind};
use crate::backend::{BackendError, ChatService, Services, UserService};
use crate::route::{decode_as, AuthMiddleware, Request, Response, RouteTable};

#[derive(Clone)]
struct ChatHandler {
    users: Arc<dyn UserService>,
    chats: Arc<dyn ChatService>,
}

pub(super) fn register(routes: &mut RouteTable, mw: &AuthMiddleware, services: &Services) {
    let h = ChatHandler {
        users: services.users.clone(),
        chats: services.chats.clone(),
    };
    routes.register_authenticated(
        UpstreamType::GetUserChats,
        DownstreamType::GetUserChats,
        decode_as::<GetUserChatsRequest>,
        bind(&h, ChatHandler::get_user_chats),
        mw,
    );
    routes.register_authenticated(
        UpstreamType::GetChat,
        DownstreamType::GetChat,
        decode_as::<GetChatRequest>,
        bind(&h, ChatHandler::get_chat),
        mw,
    );
    routes.register_authenticated(
        UpstreamType::CreateChat,
        DownstreamType::CreateChat,
        decode_as::<CreateChatRequest>,
        bind(&h, ChatHandler::create_chat),
        mw,
    );
    routes.register_authenticated(
        UpstreamType::SendMessage,
        DownstreamType::SendMessage,
        decode_as::<SendMessageRequest>,
        bind(&h, ChatHandler::send_message),
        mw,
    );
    routes.register_authenticated(
        UpstreamType::ChatMessages,
        DownstreamType::ChatMessages,
        decode_as::<ChatMessagesRequest>,
        bind(&h, ChatHandler::chat_messages),
        mw,
    );
}

impl ChatHandler {
    async fn member_chat(&self, chat_id: ChatId, user_id: UserId) -> Result<Chat, BackendError> {
        let chat = self.chats.get(chat_id).await?;
        if !chat.has_member(&user_id) {
            return Err(BackendError::NotFound(format!("chat {chat_id}")));
        }
        Ok(chat)
    }

    async fn get_user_chats(self, req: Request) -> Response {
        let Some(user_id) = req.user_id else {
            return Response::unauthorized();
        };
        match self.chats.list_for_user(user_id).await {
            Ok(chats) => Response::ok(ChatsResponse { chats }),
            Err(e) => backend_failure("chat.list_for_user", e),
        }
    }

    async fn get_chat(self, req: Request) -> Response {
        let (Some(user_id), UpstreamPayload::GetChat(get)) = (req.user_id, req.payload) else {
            return Response::internal();
        };
        match self.member_chat(get.cid, user_id).await {
            Ok(chat) => Response::ok(ChatResponse { chat }),
            Err(e) => backend_failure("chat.get", e),
        }
    }

    async fn create_chat(self, req: Request) -> Response {
        let (Some(user_id), UpstreamPayload::CreateChat(create)) = (req.user_id, req.payload) else {
            return Response::internal();
        };
        if create.uid == user_id {
            return Response::error(ErrorCode::Internal, "cannot create a chat with yourself");
        }
        if let Err(e) = self.users.get(create.uid).await {
            return backend_failure("user.get", e);
        }
        match self.chats.create(user_id, create.uid).await {
            Ok(chat) => Response::ok(ChatResponse { chat }),
            Err(e) => backend_failure("chat.create", e),
        }
    }

    async fn send_message(self, req: Request) -> Response {
        let (Some(user_id), UpstreamPayload::SendMessage(send)) = (req.user_id, req.payload) else {
            return Response::internal();
        };
        match self.chats.send_message(send.cid, user_id, &send.text).await {
            Ok(message) => Response::ok(MessageResponse { message }),
            Err(e) => backend_failure("chat.send_message", e),
        }
    }

    async fn chat_messages(self, req: Request) -> Response {
        let (Some(user_id), UpstreamPayload::ChatMessages(list)) = (req.user_id, req.payload) else {
            return Response::internal();
        };
        if let Err(e) = self.member_chat(list.cid, user_id).await {
            return backend_failure("chat.get", e);
        }
        match self.chats.messages(list.cid).await {
            Ok(messages) => Response::ok(MessagesResponse { messages }),
            Err(e) => backend_failure("chat.messages", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testing::{assert_type, payload, Harness};
    use dvid_core::{decode_downstream, decode_payload};
    use std::time::Duration;

    #[tokio::test]
    async fn create_chat_and_exchange_messages() {
        let h = Harness::new();
        let mut a = h.connect().await;
        let mut b = h.connect().await;
        let carol_conn = h.connect().await;
        let _ann = h.sign_in(&a, "ann@example.com").await;
        let bob = h.sign_in(&b, "bob@example.com").await;
        let _carol = h.sign_in(&carol_conn, "carol@example.com").await;

        let down = h
            .call(&a, UpstreamType::CreateChat, &CreateChatRequest { uid: bob.id })
            .await;
        assert_type(&down, DownstreamType::CreateChat);
        let chat = payload::<ChatResponse>(&down).chat;
        assert!(chat.has_member(&bob.id));

        // Both members are told about the chat.
        for client in [&mut a, &mut b] {
            let push = tokio::time::timeout(Duration::from_secs(1), client.rx.recv())
                .await
                .unwrap()
                .unwrap();
            let push = decode_downstream(&push).unwrap();
            assert_type(&push, DownstreamType::NewChat);
            let pushed: ChatResponse = decode_payload(push.payload.as_deref().unwrap()).unwrap();
            assert_eq!(pushed.chat, chat);
        }

        let down = h
            .call(
                &b,
                UpstreamType::SendMessage,
                &SendMessageRequest {
                    cid: chat.id,
                    text: "hello ann".into(),
                },
            )
            .await;
        assert_type(&down, DownstreamType::SendMessage);
        let sent = payload::<MessageResponse>(&down).message;
        assert_eq!(sent.user_id, bob.id);

        let push = tokio::time::timeout(Duration::from_secs(1), a.rx.recv())
            .await
            .unwrap()
            .unwrap();
        let push = decode_downstream(&push).unwrap();
        assert_type(&push, DownstreamType::NewMessage);
        let pushed: MessageResponse = decode_payload(push.payload.as_deref().unwrap()).unwrap();
        assert_eq!(pushed.message, sent);

        let down = h
            .call(&a, UpstreamType::ChatMessages, &ChatMessagesRequest { cid: chat.id })
            .await;
        assert_eq!(payload::<MessagesResponse>(&down).messages, vec![sent]);

        let down = h.call(&a, UpstreamType::GetUserChats, &GetUserChatsRequest {}).await;
        assert_eq!(payload::<ChatsResponse>(&down).chats, vec![chat.clone()]);

        // Non-members can neither read nor post.
        let down = h
            .call(&carol_conn, UpstreamType::GetChat, &GetChatRequest { cid: chat.id })
            .await;
        assert_eq!(down.error.unwrap().code, ErrorCode::Internal);
        let down = h
            .call(
                &carol_conn,
                UpstreamType::SendMessage,
                &SendMessageRequest {
                    cid: chat.id,
                    text: "hi".into(),
                },
            )
            .await;
        assert_eq!(down.error.unwrap().code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn duplicate_chat_is_rejected() {
        let h = Harness::new();
        let a = h.connect().await;
        let b = h.connect().await;
        let ann = h.sign_in(&a, "ann@example.com").await;
        let bob = h.sign_in(&b, "bob@example.com").await;

        let first = h
            .call(&a, UpstreamType::CreateChat, &CreateChatRequest { uid: bob.id })
            .await;
        assert!(!first.is_error());
        let second = h
            .call(&b, UpstreamType::CreateChat, &CreateChatRequest { uid: ann.id })
            .await;
        assert_eq!(second.error.unwrap().code, ErrorCode::Internal);

        let down = h
            .call(&a, UpstreamType::CreateChat, &CreateChatRequest { uid: ann.id })
            .await;
        assert!(down.is_error());
    }
}
