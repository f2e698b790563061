use std::{sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use codec::{
    address::PeerAddress,
    id::Id160,
    message::{Command, Message, MessageType},
};
use parking_lot::RwLock;

/// A per-command request handler registered for one peer identity.
///
/// Handlers run concurrently on the worker group; nothing serializes calls
/// for the same peer, so implementations must tolerate interleaving.
pub trait RequestHandler: Send + Sync {
    /// Validity predicate checked before [`RequestHandler::handle`]. A
    /// rejected message answers with an `Exception`-typed response.
    fn check_message(&self, _message: &Message) -> bool {
        true
    }

    /// Produce the response sent back on the same transport.
    fn handle(&self, message: &Message) -> Result<Message, HandlerError>;
}

#[derive(Debug)]
pub struct HandlerError(pub String);

impl std::error::Error for HandlerError {}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Routes a decoded inbound message to the handler registered for its
/// recipient identity and command.
///
/// The table is two-level: peer id first, then command. Removing a peer id
/// drops all of its handlers at once, which is what peer shutdown does.
pub struct Dispatcher {
    version: u32,
    heartbeat: Duration,
    handlers: RwLock<HashMap<Id160, HashMap<Command, Arc<dyn RequestHandler>>>>,
}

impl Dispatcher {
    pub fn new(version: u32, heartbeat: Duration) -> Self {
        Self {
            version,
            heartbeat,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The liveness interval handlers may use to pace keepalives.
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    pub fn register(&self, peer: Id160, commands: &[Command], handler: Arc<dyn RequestHandler>) {
        let mut handlers = self.handlers.write();
        let table = handlers.entry(peer).or_insert_with(HashMap::new);
        for command in commands {
            table.insert(*command, handler.clone());
        }
    }

    /// Drop every handler of the given peer. Returns whether the peer was
    /// registered at all.
    pub fn remove(&self, peer: &Id160) -> bool {
        self.handlers.write().remove(peer).is_some()
    }

    pub fn is_registered(&self, peer: &Id160) -> bool {
        self.handlers.read().contains_key(peer)
    }

    /// Route one inbound request and produce the response to send back, if
    /// any. Responses to our own requests never come through here; the
    /// transport completes the pending future directly.
    pub fn dispatch(&self, message: &Message) -> Option<Message> {
        if message.version() != self.version {
            log::debug!(
                "dropping message from another overlay: version={:#010x}, id={}",
                message.version(),
                message.id()
            );

            return None;
        }

        if !message.kind().is_request() {
            return None;
        }

        let recipient = message.recipient().id;
        let handler = self
            .handlers
            .read()
            .get(&recipient)
            .and_then(|table| table.get(&message.command()))
            .cloned();

        let Some(handler) = handler else {
            log::debug!(
                "no handler registered: recipient={}, command={:?}",
                recipient,
                message.command()
            );

            return Some(Message::response_to(
                message,
                MessageType::UnknownId,
                PeerAddress::from_id(recipient),
            ));
        };

        if !handler.check_message(message) {
            log::debug!(
                "message rejected by handler: recipient={}, command={:?}, id={}",
                recipient,
                message.command(),
                message.id()
            );

            return Some(Message::response_to(
                message,
                MessageType::Exception,
                PeerAddress::from_id(recipient),
            ));
        }

        match handler.handle(message) {
            Ok(response) => Some(response),
            Err(error) => {
                log::warn!(
                    "handler failed: recipient={}, command={:?}, error={}",
                    recipient,
                    message.command(),
                    error
                );

                Some(Message::response_to(
                    message,
                    MessageType::Exception,
                    PeerAddress::from_id(recipient),
                ))
            }
        }
    }
}
