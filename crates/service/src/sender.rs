use crate::MAX_MESSAGE_BYTES;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use ahash::HashMap;
use bytes::BytesMut;
use codec::{
    HEADER_BYTES, decoder::MessageDecoder, encoder::MessageEncoder, message::Message,
    message::MessageType,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::{OwnedSemaphorePermit, Semaphore, oneshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Debug)]
pub enum RequestError {
    /// No response arrived inside the request window.
    Timeout,
    /// The request was cancelled, usually by shutdown.
    Cancelled,
    /// The transport is gone.
    Closed,
    /// The remote answered with an unexpected typed response.
    Rejected(MessageType),
    Io(std::io::Error),
    Codec(codec::Error),
}

impl std::error::Error for RequestError {}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for RequestError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<codec::Error> for RequestError {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

type Response = Result<Message, RequestError>;

/// Outstanding requests keyed by message id.
///
/// The transport completes an entry when a response with a matching
/// correlator arrives; everything left over is failed with `Cancelled` on
/// shutdown, exactly once.
#[derive(Default)]
pub struct Pending {
    map: Mutex<HashMap<u32, oneshot::Sender<Response>>>,
}

impl Pending {
    fn insert(&self, id: u32, tx: oneshot::Sender<Response>) {
        self.map.lock().insert(id, tx);
    }

    /// Complete the matching request. Returns false when nobody is waiting
    /// for this correlator.
    pub fn complete(&self, id: u32, message: Message) -> bool {
        match self.map.lock().remove(&id) {
            Some(tx) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    fn fail(&self, id: u32, error: RequestError) {
        if let Some(tx) = self.map.lock().remove(&id) {
            let _ = tx.send(Err(error));
        }
    }

    fn discard(&self, id: u32) {
        self.map.lock().remove(&id);
    }

    fn fail_all(&self) {
        let drained = std::mem::take(&mut *self.map.lock());
        for (_, tx) in drained {
            let _ = tx.send(Err(RequestError::Cancelled));
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// The response future of one sent request.
///
/// Dropping it abandons the request; [`RequestFuture::cancel`] additionally
/// releases the reservation slot right away instead of at drop time.
pub struct RequestFuture {
    id: u32,
    rx: oneshot::Receiver<Response>,
    pending: Arc<Pending>,
    permit: Option<OwnedSemaphorePermit>,
    timeout: Duration,
}

impl RequestFuture {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Give up on the request: the pending entry is removed and the
    /// reservation slot freed.
    pub fn cancel(mut self) {
        self.pending.discard(self.id);
        self.permit.take();
    }

    /// Wait for the matching response, the request timeout, or
    /// cancellation, whichever comes first.
    pub async fn response(mut self) -> Result<Message, RequestError> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Err(_) => {
                self.pending.discard(self.id);
                Err(RequestError::Timeout)
            }
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Ok(Ok(response)) => response,
        }
    }
}

pub struct SenderOptions {
    pub version: u32,
    pub timeout: Duration,
    pub reservations: usize,
}

/// Sends requests and hands back a future per request.
///
/// Every send takes a slot from the reservation semaphore, bounding the
/// number of requests in flight; the slot travels with the returned future
/// and is released when it resolves, is cancelled or is dropped.
pub struct Sender {
    version: u32,
    timeout: Duration,
    pending: Arc<Pending>,
    reservations: Arc<Semaphore>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    next_id: AtomicU32,
}

impl Sender {
    pub fn new(options: SenderOptions, pending: Arc<Pending>, udp: Arc<UdpSocket>) -> Self {
        Self {
            version: options.version,
            timeout: options.timeout,
            pending,
            reservations: Arc::new(Semaphore::new(options.reservations)),
            udp: Mutex::new(Some(udp)),
            next_id: AtomicU32::new(rand::random()),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn pending(&self) -> &Arc<Pending> {
        &self.pending
    }

    /// Send a request and register a pending entry for its response. The
    /// version and correlator of `message` are assigned here.
    pub async fn send(
        &self,
        mut message: Message,
        transport: Transport,
    ) -> Result<RequestFuture, RequestError> {
        let permit = self
            .reservations
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RequestError::Cancelled)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        message.set_id(id);
        message.set_version(self.version);

        let mut bytes = BytesMut::with_capacity(1500);
        MessageEncoder::default().encode(&message, &mut bytes)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        match transport {
            Transport::Udp => {
                let target = message.recipient().udp_socket();
                let socket = match self.udp.lock().clone() {
                    Some(socket) => socket,
                    None => {
                        self.pending.discard(id);
                        return Err(RequestError::Closed);
                    }
                };

                if let Err(error) = socket.send_to(&bytes, target).await {
                    self.pending.discard(id);
                    return Err(RequestError::Io(error));
                }
            }
            Transport::Tcp => {
                let target = message.recipient().tcp_socket();
                let pending = self.pending.clone();
                tokio::spawn(async move {
                    if let Err(error) = exchange_tcp(&bytes, target, &pending).await {
                        log::debug!("tcp request failed: id={}, target={}, error={:?}", id, target, error);
                        pending.fail(id, error);
                    }
                });
            }
        }

        Ok(RequestFuture {
            id,
            rx,
            pending: self.pending.clone(),
            permit: Some(permit),
            timeout: self.timeout,
        })
    }

    /// Stop accepting sends, drain the reservation pool and fail every
    /// outstanding request with `Cancelled`.
    pub fn close(&self) {
        self.reservations.close();
        self.udp.lock().take();
        self.pending.fail_all();
    }
}

/// One request/response exchange on a fresh TCP connection.
async fn exchange_tcp(
    bytes: &[u8],
    target: SocketAddr,
    pending: &Pending,
) -> Result<(), RequestError> {
    let mut stream = TcpStream::connect(target).await?;
    stream.write_all(bytes).await?;

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

    let remote = stream.peer_addr().ok();
    let message = MessageDecoder::decode(&buffer, remote)?;
    pending.complete(message.id(), message);

    Ok(())
}
