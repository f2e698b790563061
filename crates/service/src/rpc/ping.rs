use crate::{
    dispatcher::{HandlerError, RequestHandler},
    peer::PeerBean,
    sender::{RequestError, Sender, Transport},
};

use std::sync::Arc;

use codec::{
    address::PeerAddress,
    message::{Command, Message, MessageType},
};

/// Liveness handler: every ping request answers `Ok` with the peer's
/// current published address.
pub struct PingRpc {
    bean: Arc<PeerBean>,
}

impl PingRpc {
    pub fn new(bean: Arc<PeerBean>) -> Self {
        Self { bean }
    }
}

impl RequestHandler for PingRpc {
    fn handle(&self, message: &Message) -> Result<Message, HandlerError> {
        Ok(Message::response_to(
            message,
            MessageType::Ok,
            self.bean.address(),
        ))
    }
}

/// Ping one peer and wait for its `Ok`.
pub async fn ping(
    sender: &Sender,
    own: PeerAddress,
    target: PeerAddress,
    transport: Transport,
) -> Result<(), RequestError> {
    let message = Message::request(Command::Ping, own, target);
    let response = sender.send(message, transport).await?.response().await?;

    match response.kind() {
        MessageType::Ok => Ok(()),
        kind => Err(RequestError::Rejected(kind)),
    }
}
