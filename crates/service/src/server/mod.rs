mod tcp;
mod udp;

use crate::{dispatcher::Dispatcher, pool::Pool, sender::Pending};

use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::watch,
};

pub struct ServerOptions {
    pub tcp_listen: SocketAddr,
    pub udp_listen: SocketAddr,
    pub mtu: usize,
}

/// Shared state of the transport loops.
pub(crate) struct ServerContext {
    pub dispatcher: Arc<Dispatcher>,
    pub pending: Arc<Pending>,
    pub worker: Arc<Pool>,
}

/// The bound transport endpoints of a master peer: one TCP listener and one
/// UDP socket.
///
/// The accept and receive loops run on the boss group; every inbound frame
/// is handed to the worker group for decode, dispatch and reply. Failing to
/// bind either port fails construction, there is no degraded mode.
pub struct ChannelServer {
    udp: Mutex<Option<Arc<UdpSocket>>>,
    tcp_local: SocketAddr,
    udp_local: SocketAddr,
    closing: watch::Sender<bool>,
    active: watch::Sender<u32>,
}

impl ChannelServer {
    pub async fn bind(
        options: ServerOptions,
        dispatcher: Arc<Dispatcher>,
        pending: Arc<Pending>,
        worker: Arc<Pool>,
        boss: &Pool,
    ) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(options.tcp_listen).await?;
        let udp = Arc::new(UdpSocket::bind(options.udp_listen).await?);

        let tcp_local = tcp.local_addr()?;
        let udp_local = udp.local_addr()?;

        let context = Arc::new(ServerContext {
            dispatcher,
            pending,
            worker,
        });

        let (closing, _) = watch::channel(false);
        let (active, _) = watch::channel(2u32);

        boss.spawn(tcp::listener(
            tcp,
            context.clone(),
            closing.subscribe(),
            active.clone(),
        ));

        boss.spawn(udp::listener(
            udp.clone(),
            context,
            options.mtu,
            closing.subscribe(),
            active.clone(),
        ));

        log::info!(
            "channel server listening: tcp={}, udp={}",
            tcp_local,
            udp_local
        );

        Ok(Self {
            udp: Mutex::new(Some(udp)),
            tcp_local,
            udp_local,
            closing,
            active,
        })
    }

    pub fn tcp_local(&self) -> SocketAddr {
        self.tcp_local
    }

    pub fn udp_local(&self) -> SocketAddr {
        self.udp_local
    }

    /// The shared UDP socket, used for outbound requests so responses come
    /// back to the advertised port. Gone once the server closed.
    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.lock().clone()
    }

    /// Stop both loops and wait until they exited, then release the
    /// sockets. Idempotent.
    pub async fn close(&self) {
        let _ = self.closing.send(true);

        let mut active = self.active.subscribe();
        loop {
            if *active.borrow() == 0 {
                break;
            }

            if active.changed().await.is_err() {
                break;
            }
        }

        self.udp.lock().take();
        log::info!(
            "channel server closed: tcp={}, udp={}",
            self.tcp_local,
            self.udp_local
        );
    }
}
