use crate::{
    dispatcher::{HandlerError, RequestHandler},
    peer::PeerBean,
    relay::{PeerConnection, RelayConfig, RelayConnector, RelayError},
    rpc::ping,
    sender::{Sender, Transport},
};

use std::{sync::Arc, time::Duration};

use ahash::{HashSet, HashSetExt};
use async_trait::async_trait;
use codec::{
    address::PeerAddress,
    id::Id160,
    message::{Command, Message, MessageType},
};
use parking_lot::Mutex;

/// Client side of the relay setup handshake.
///
/// A successful handshake yields a [`PeerConnection`] kept alive by a
/// heartbeat; when the relay stops answering, the connection's close signal
/// fires and the relay manager replaces it.
pub struct RelayRpc {
    sender: Arc<Sender>,
    bean: Arc<PeerBean>,
    heartbeat: Duration,
}

impl RelayRpc {
    pub fn new(sender: Arc<Sender>, bean: Arc<PeerBean>, heartbeat: Duration) -> Self {
        Self {
            sender,
            bean,
            heartbeat,
        }
    }

    fn keepalive(&self, connection: PeerConnection) {
        let sender = self.sender.clone();
        let bean = self.bean.clone();
        let heartbeat = self.heartbeat;

        tokio::spawn(async move {
            let mut closed = connection.close_signal();
            loop {
                if *closed.borrow() {
                    break;
                }

                tokio::select! {
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(heartbeat) => {
                        let target = connection.address().clone();
                        if let Err(error) =
                            ping::ping(&sender, bean.address(), target, Transport::Udp).await
                        {
                            log::debug!(
                                "relay heartbeat failed: peer={}, error={:?}",
                                connection.address().id,
                                error
                            );

                            connection.close();
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RelayConnector for RelayRpc {
    async fn send_setup_message(
        &self,
        candidate: &PeerAddress,
        _config: &RelayConfig,
    ) -> Result<PeerConnection, RelayError> {
        let message = Message::request(Command::RelaySetup, self.bean.address(), candidate.clone());
        let response = self
            .sender
            .send(message, Transport::Tcp)
            .await?
            .response()
            .await?;

        match response.kind() {
            MessageType::Ok => {
                let connection = PeerConnection::new(candidate.clone());
                self.keepalive(connection.clone());
                Ok(connection)
            }
            _ => Err(RelayError::Denied),
        }
    }
}

/// Server side: accept relay setup requests from unreachable peers, up to a
/// client budget.
pub struct RelayServerRpc {
    bean: Arc<PeerBean>,
    max_clients: usize,
    clients: Mutex<HashSet<Id160>>,
}

impl RelayServerRpc {
    pub fn new(bean: Arc<PeerBean>, max_clients: usize) -> Self {
        Self {
            bean,
            max_clients,
            clients: Mutex::new(HashSet::new()),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl RequestHandler for RelayServerRpc {
    fn check_message(&self, message: &Message) -> bool {
        // A peer that itself rents relays cannot forward for others.
        message.command() == Command::RelaySetup && !message.sender().flags.relayed
    }

    fn handle(&self, message: &Message) -> Result<Message, HandlerError> {
        let client = message.sender().id;
        let mut clients = self.clients.lock();

        if clients.len() >= self.max_clients && !clients.contains(&client) {
            log::debug!("relay budget exhausted: client={}", client);
            return Ok(Message::response_to(
                message,
                MessageType::Denied,
                self.bean.address(),
            ));
        }

        clients.insert(client);
        log::info!("relay client accepted: client={}", client);

        Ok(Message::response_to(
            message,
            MessageType::Ok,
            self.bean.address(),
        ))
    }
}
