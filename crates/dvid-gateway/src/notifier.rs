//! Push fanout of backend events to subscribed connections.
//!
//! Events are queued by [`NotifierHandle`] and drained by a single task, so
//! they are delivered in the order the backend raised them. Pushes never wait
//! on a recipient: a connection whose queue is full is closed, and the rest
//! of the fanout carries on.

use std::sync::Arc;

use dvid_core::messages::{ChatResponse, MessageResponse};
use dvid_core::{encode_downstream, Chat, ChatMessage, DownstreamPayload, DownstreamType, DvidResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::EventSink;
use crate::connection::ConnectionId;
use crate::registry::{ClientRegistry, RegistryError};

#[derive(Debug, Clone)]
pub enum ChatEvent {
    NewMessage(ChatMessage),
    NewChat(Chat),
}

pub struct Notifier {
    registry: Arc<ClientRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Push a new message to every connection subscribed to its chat.
    /// Returns the number of connections it was delivered to.
    pub async fn on_new_message(&self, message: &ChatMessage) -> usize {
        let recipients = self.registry.subscribers(message.chat_id).await;
        if recipients.is_empty() {
            debug!(chat = %message.chat_id, "no subscribers for new message");
            return 0;
        }
        let frame = match push_frame(
            DownstreamType::NewMessage,
            MessageResponse {
                message: message.clone(),
            }
            .into(),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(chat = %message.chat_id, error = %e, "failed to encode message push");
                return 0;
            }
        };
        self.fanout(&recipients, frame).await
    }

    /// Register a new chat and push it to the members' connections.
    pub async fn on_new_chat(&self, chat: &Chat) -> usize {
        let recipients = match self.registry.register_chat(chat).await {
            Ok(recipients) => recipients,
            Err(RegistryError::ChatAlreadyRegistered(id)) => {
                debug!(chat = %id, "chat already registered, skipping push");
                return 0;
            }
            Err(e) => {
                warn!(chat = %chat.id, error = %e, "failed to register chat");
                return 0;
            }
        };
        if recipients.is_empty() {
            return 0;
        }
        let frame = match push_frame(
            DownstreamType::NewChat,
            ChatResponse { chat: chat.clone() }.into(),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(chat = %chat.id, error = %e, "failed to encode chat push");
                return 0;
            }
        };
        self.fanout(&recipients, frame).await
    }

    async fn fanout(&self, recipients: &[ConnectionId], frame: Vec<u8>) -> usize {
        let senders = self.registry.senders(recipients).await;
        let mut delivered = 0;
        for sender in &senders {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(conn = %sender.id(), error = %e, "push not delivered"),
            }
        }
        delivered
    }

    async fn handle(&self, event: ChatEvent) {
        match event {
            ChatEvent::NewMessage(message) => {
                let delivered = self.on_new_message(&message).await;
                debug!(chat = %message.chat_id, delivered, "new message pushed");
            }
            ChatEvent::NewChat(chat) => {
                let delivered = self.on_new_chat(&chat).await;
                debug!(chat = %chat.id, delivered, "new chat pushed");
            }
        }
    }

    /// Spawn the event loop. It runs until every handle is dropped.
    pub fn start(self) -> (NotifierHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChatEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(event).await;
            }
            info!("notifier stopped");
        });
        (NotifierHandle { tx }, task)
    }
}

fn push_frame(msg_type: DownstreamType, payload: DownstreamPayload) -> DvidResult<Vec<u8>> {
    encode_downstream(msg_type.into(), Some(payload.encode()?), None)
}

/// Non-blocking [`EventSink`] feeding the notifier loop.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl NotifierHandle {
    fn enqueue(&self, event: ChatEvent) {
        if self.tx.send(event).is_err() {
            warn!("notifier stopped, dropping event");
        }
    }
}

impl EventSink for NotifierHandle {
    fn new_message(&self, message: ChatMessage) {
        self.enqueue(ChatEvent::NewMessage(message));
    }

    fn new_chat(&self, chat: Chat) {
        self.enqueue(ChatEvent::NewChat(chat));
    }
}
