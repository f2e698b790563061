use crate::{
    TrackerStorage,
    dispatcher::{HandlerError, RequestHandler},
    peer::PeerBean,
};

use std::sync::Arc;

use codec::message::{Command, Message, MessageType, Payload};

/// Commands this handler registers for.
pub const COMMANDS: &[Command] = &[Command::TrackerAdd, Command::TrackerGet];

/// Tracker operations over the external storage collaborator.
///
/// An add carries the location/domain key pair in slot one and the peers
/// with their data in slot two; a get carries only the key pair and is
/// answered with the stored map or `NotFound`.
pub struct TrackerRpc {
    bean: Arc<PeerBean>,
    storage: Arc<dyn TrackerStorage>,
}

impl TrackerRpc {
    pub fn new(bean: Arc<PeerBean>, storage: Arc<dyn TrackerStorage>) -> Self {
        Self { bean, storage }
    }
}

impl RequestHandler for TrackerRpc {
    fn check_message(&self, message: &Message) -> bool {
        let payloads = message.payloads();
        match message.command() {
            Command::TrackerAdd => {
                matches!(payloads.first(), Some(Payload::KeyKey(..)))
                    && matches!(payloads.get(1), Some(Payload::MapPeerData(..)))
            }
            Command::TrackerGet => matches!(payloads.first(), Some(Payload::KeyKey(..))),
            _ => false,
        }
    }

    fn handle(&self, message: &Message) -> Result<Message, HandlerError> {
        let payloads = message.payloads();
        let Some(Payload::KeyKey(location, domain)) = payloads.first() else {
            return Err(HandlerError::from("missing location and domain keys"));
        };

        match message.command() {
            Command::TrackerAdd => {
                let Some(Payload::MapPeerData(entries)) = payloads.get(1) else {
                    return Err(HandlerError::from("missing peer data map"));
                };

                let mut stored = 0u32;
                for (peer, data) in entries {
                    if self
                        .storage
                        .put(location, domain, peer, message.public_key(), data)
                    {
                        stored += 1;
                    }
                }

                let mut response =
                    Message::response_to(message, MessageType::Ok, self.bean.address());
                response
                    .add_payload(Payload::Integer(stored))
                    .map_err(|error| HandlerError(error.to_string()))?;

                Ok(response)
            }
            Command::TrackerGet => match self.storage.get(location, domain) {
                Some(entries) if !entries.is_empty() => {
                    let mut response =
                        Message::response_to(message, MessageType::Ok, self.bean.address());
                    response
                        .add_payload(Payload::MapPeerData(entries))
                        .map_err(|error| HandlerError(error.to_string()))?;

                    Ok(response)
                }
                _ => Ok(Message::response_to(
                    message,
                    MessageType::NotFound,
                    self.bean.address(),
                )),
            },
            command => Err(HandlerError(format!("unexpected command: {:?}", command))),
        }
    }
}
