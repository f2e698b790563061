use crate::{MAX_MESSAGE_BYTES, sender::RequestError, server::ServerContext};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use codec::{
    HEADER_BYTES, decoder::MessageDecoder, encoder::MessageEncoder, message::Message,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
};

/// A connection holding no traffic for this long is closed so it cannot
/// occupy a worker slot forever.
const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// The TCP accept loop. Each accepted connection gets its own worker task.
pub(crate) async fn listener(
    listener: TcpListener,
    context: Arc<ServerContext>,
    mut closing: watch::Receiver<bool>,
    active: watch::Sender<u32>,
) {
    let local = listener.local_addr().ok();

    loop {
        tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() || *closing.borrow() {
                    break;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        let worker = context.worker.clone();
                        worker.spawn(connection(
                            stream,
                            source,
                            context.clone(),
                            closing.clone(),
                        ));
                    }
                    Err(error) => log::warn!("tcp accept error: {:?}", error),
                }
            }
        }
    }

    active.send_modify(|count| *count -= 1);
    log::info!("tcp listener closed: interface={:?}", local);
}

/// One inbound connection: length-framed messages in, responses out on the
/// same stream.
async fn connection(
    mut stream: TcpStream,
    source: SocketAddr,
    context: Arc<ServerContext>,
    mut closing: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            changed = closing.changed() => {
                if changed.is_err() || *closing.borrow() {
                    break;
                }

                continue;
            }
            result = tokio::time::timeout(IDLE_TIMEOUT, read_frame(&mut stream, source)) => {
                match result {
                    Err(_) => break,
                    Ok(Err(RequestError::Io(error)))
                        if error.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break;
                    }
                    Ok(Err(error)) => {
                        log::debug!(
                            "discarding malformed stream: source={}, error={:?}",
                            source,
                            error
                        );

                        break;
                    }
                    Ok(Ok(message)) => message,
                }
            }
        };

        if message.kind().is_request() {
            let Some(response) = context.dispatcher.dispatch(&message) else {
                continue;
            };

            let mut bytes = BytesMut::with_capacity(1500);
            match MessageEncoder::default().encode(&response, &mut bytes) {
                Ok(()) => {
                    if let Err(error) = stream.write_all(&bytes).await {
                        log::debug!(
                            "tcp response write failed: target={}, error={:?}",
                            source,
                            error
                        );

                        break;
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
}

async fn read_frame(stream: &mut TcpStream, source: SocketAddr) -> Result<Message, RequestError> {
    let mut buffer = vec![0u8; HEADER_BYTES];
    stream.read_exact(&mut buffer).await?;

    let total = MessageDecoder::message_size(&buffer)?;
    if total > MAX_MESSAGE_BYTES {
        return Err(RequestError::Codec(codec::Error::BadLength(
            "content length",
        )));
    }

    buffer.resize(total, 0);
    stream.read_exact(&mut buffer[HEADER_BYTES..]).await?;

    Ok(MessageDecoder::decode(&buffer, Some(source))?)
}
