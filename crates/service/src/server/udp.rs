use crate::server::ServerContext;

use std::{net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use codec::{HEADER_BYTES, decoder::MessageDecoder, encoder::MessageEncoder};
use tokio::{net::UdpSocket, sync::watch};

/// The UDP receive loop.
///
/// Reads datagrams off the shared socket and hands each one to the worker
/// group; replies go back to the address the socket observed, which is the
/// only address a NATed sender is reachable at.
pub(crate) async fn listener(
    socket: Arc<UdpSocket>,
    context: Arc<ServerContext>,
    mtu: usize,
    mut closing: watch::Receiver<bool>,
    active: watch::Sender<u32>,
) {
    let local = socket.local_addr().ok();
    let mut buffer = vec![0u8; mtu.max(HEADER_BYTES) * 2];

    loop {
        tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() || *closing.borrow() {
                    break;
                }
            }
            result = socket.recv_from(&mut buffer) => {
                let (size, source) = match result {
                    Ok(it) => it,
                    Err(error) => {
                        log::warn!("udp socket receive error: {:?}", error);
                        continue;
                    }
                };

                // Nothing shorter than a header can be a message.
                if size < HEADER_BYTES {
                    continue;
                }

                let worker = context.worker.clone();
                worker.spawn(process(
                    buffer[..size].to_vec(),
                    source,
                    socket.clone(),
                    context.clone(),
                ));
            }
        }
    }

    active.send_modify(|count| *count -= 1);
    log::info!("udp listener closed: interface={:?}", local);
}

async fn process(
    bytes: Vec<u8>,
    source: SocketAddr,
    socket: Arc<UdpSocket>,
    context: Arc<ServerContext>,
) {
    let message = match MessageDecoder::decode(&bytes, Some(source)) {
        Ok(message) => message,
        Err(error) => {
            log::debug!(
                "discarding malformed datagram: source={}, error={:?}",
                source,
                error
            );

            return;
        }
    };

    if message.kind().is_request() {
        let Some(response) = context.dispatcher.dispatch(&message) else {
            return;
        };

        let mut bytes = BytesMut::with_capacity(1500);
        match MessageEncoder::default().encode(&response, &mut bytes) {
            Ok(()) => {
                if let Err(error) = socket.send_to(&bytes, source).await {
                    log::warn!("udp socket send error: target={}, error={:?}", source, error);
                }
            }
            Err(error) => log::warn!("response encoding failed: error={:?}", error),
        }
    } else {
        let id = message.id();
        if !context.pending.complete(id, message) {
            log::debug!("unmatched response: source={}, id={}", source, id);
        }
    }
}
