use crate::{
    NatHelper, NoNat, RelayListener,
    dispatcher::Dispatcher,
    pool::Pool,
    rpc::ping::PingRpc,
    sender::{Pending, Sender, SenderOptions},
    server::{ChannelServer, ServerOptions},
};

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use codec::{address::PeerAddress, crypto::PrivateKey, id::Id160, message::Command};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, task::JoinSet};

#[derive(Debug)]
pub enum PeerError {
    /// Could not obtain the configured ports.
    Bind(std::io::Error),
    /// No externally visible interface could be discovered.
    NotListening,
}

impl std::error::Error for PeerError {}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(error) => write!(f, "bind failed: {}", error),
            Self::NotListening => write!(f, "not listening to anything"),
        }
    }
}

pub struct PeerOptions {
    pub id: Id160,
    pub private_key: PrivateKey,
    pub version: u32,
    pub tcp_listen: SocketAddr,
    pub udp_listen: SocketAddr,
    /// Externally visible coordinates when a NAT forwards the ports; the
    /// bound ones are advertised otherwise.
    pub external_ip: Option<IpAddr>,
    pub external_tcp_port: Option<u16>,
    pub external_udp_port: Option<u16>,
    pub firewalled_tcp: bool,
    pub firewalled_udp: bool,
    pub reservations: usize,
    pub timeout: Duration,
    pub heartbeat: Duration,
    pub mtu: usize,
    pub nat: Arc<dyn NatHelper>,
}

impl PeerOptions {
    pub fn new(id: Id160, private_key: PrivateKey) -> Self {
        Self {
            id,
            private_key,
            version: 1,
            tcp_listen: SocketAddr::from(([0, 0, 0, 0], 7700)),
            udp_listen: SocketAddr::from(([0, 0, 0, 0], 7700)),
            external_ip: None,
            external_tcp_port: None,
            external_udp_port: None,
            firewalled_tcp: false,
            firewalled_udp: false,
            reservations: 64,
            timeout: Duration::from_secs(5),
            heartbeat: Duration::from_secs(30),
            mtu: 1500,
            nat: Arc::new(NoNat),
        }
    }
}

/// The shared I/O bundle of a master/slave tree.
///
/// The master owns it; slaves hold the `Arc` and must never tear any of it
/// down themselves. Master shutdown is the sole releaser.
pub struct ConnectionBean {
    pub dispatcher: Arc<Dispatcher>,
    pub sender: Arc<Sender>,
    pub server: ChannelServer,
    pub worker: Arc<Pool>,
    pub boss: Arc<Pool>,
    pub timer: Arc<Pool>,
    pub nat: Arc<dyn NatHelper>,
}

/// Per-peer state: the published address, the key pair and the relay
/// listeners.
pub struct PeerBean {
    address: RwLock<PeerAddress>,
    private_key: PrivateKey,
    relay_listeners: RwLock<Vec<Arc<dyn RelayListener>>>,
}

impl PeerBean {
    pub fn new(address: PeerAddress, private_key: PrivateKey) -> Self {
        Self {
            address: RwLock::new(address),
            private_key,
            relay_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.address.read().clone()
    }

    /// Install a new published address. This is how the rest of the peer
    /// learns it should announce itself differently, relays included.
    pub fn publish_address(&self, address: PeerAddress) {
        log::debug!(
            "publishing address: id={}, relayed={}, relays={}",
            address.id,
            address.flags.relayed,
            address.relays.len()
        );

        *self.address.write() = address;
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn add_relay_listener(&self, listener: Arc<dyn RelayListener>) {
        self.relay_listeners.write().push(listener);
    }

    pub fn relay_added(&self, relay: &PeerAddress) {
        for listener in self.relay_listeners.read().iter() {
            listener.relay_added(relay);
        }
    }

    pub fn relay_removed(&self, relay: &PeerAddress) {
        for listener in self.relay_listeners.read().iter() {
            listener.relay_removed(relay);
        }
    }
}

/// One logical peer.
///
/// A master owns the transport; slaves share it and differ in identity
/// only. Shutdown is idempotent, strictly ordered and completes the
/// peer's done-signal exactly once.
pub struct Peer {
    master: bool,
    bean: Arc<PeerBean>,
    connection: Arc<ConnectionBean>,
    parent: Option<Weak<Peer>>,
    children: Mutex<Vec<Arc<Peer>>>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
    done: watch::Sender<bool>,
}

impl Peer {
    pub fn id(&self) -> Id160 {
        self.bean.address().id
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn address(&self) -> PeerAddress {
        self.bean.address()
    }

    pub fn bean(&self) -> &Arc<PeerBean> {
        &self.bean
    }

    pub fn connection(&self) -> &Arc<ConnectionBean> {
        &self.connection
    }

    pub fn register_handler(
        &self,
        commands: &[Command],
        handler: Arc<dyn crate::dispatcher::RequestHandler>,
    ) {
        self.connection.dispatcher.register(self.id(), commands, handler);
    }

    /// Track a maintenance task whose lifetime is bound to this peer; it is
    /// aborted early in shutdown.
    pub fn spawn_maintenance<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().spawn(future);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until shutdown has completed, no matter who initiated it.
    pub async fn closed(&self) {
        let mut done = self.done.subscribe();
        loop {
            if *done.borrow() {
                return;
            }

            if done.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.closed().await;
            return;
        }

        // No new requests for this identity from here on.
        self.connection.dispatcher.remove(&self.id());

        // Per-peer maintenance and replication schedulers.
        self.tasks.lock().abort_all();

        // Children go down before anything they share with us.
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            Box::pin(child.shutdown()).await;
        }

        if self.master {
            self.connection.timer.shutdown().await;
            self.connection.sender.close();
            self.connection.server.close().await;
            self.connection.worker.shutdown().await;
            self.connection.boss.shutdown().await;

            // The port-mapping release blocks, keep it off the runtime
            // threads.
            let nat = self.connection.nat.clone();
            let _ = tokio::task::spawn_blocking(move || nat.shutdown()).await;
        } else if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            let id = self.id();
            parent.children.lock().retain(|child| child.id() != id);
        }

        let _ = self.done.send(true);
        log::info!("peer shut down: id={}, master={}", self.id(), self.master);
    }
}

/// Construction of master and slave peers.
pub struct PeerCreator;

impl PeerCreator {
    /// Build a master: bind the transports, stand up the worker and boss
    /// groups, the dispatcher and the sender, and determine the externally
    /// visible address.
    pub async fn master(options: PeerOptions) -> Result<Arc<Peer>, PeerError> {
        let worker = Arc::new(Pool::new());
        let boss = Arc::new(Pool::new());
        let timer = Arc::new(Pool::new());

        let dispatcher = Arc::new(Dispatcher::new(options.version, options.heartbeat));
        let pending = Arc::new(Pending::default());

        let server = ChannelServer::bind(
            ServerOptions {
                tcp_listen: options.tcp_listen,
                udp_listen: options.udp_listen,
                mtu: options.mtu,
            },
            dispatcher.clone(),
            pending.clone(),
            worker.clone(),
            &boss,
        )
        .await
        .map_err(PeerError::Bind)?;

        let udp_socket = server.udp_socket().ok_or(PeerError::NotListening)?;
        let sender = Arc::new(Sender::new(
            SenderOptions {
                version: options.version,
                timeout: options.timeout,
                reservations: options.reservations,
            },
            pending,
            udp_socket,
        ));

        let ip = options
            .external_ip
            .or_else(|| discover_ip(server.udp_local()))
            .ok_or(PeerError::NotListening)?;

        let mut address = PeerAddress::new(
            options.id,
            ip,
            options.external_tcp_port.unwrap_or(server.tcp_local().port()),
            options.external_udp_port.unwrap_or(server.udp_local().port()),
        );
        address.flags.firewalled_tcp = options.firewalled_tcp;
        address.flags.firewalled_udp = options.firewalled_udp;

        let bean = Arc::new(PeerBean::new(address, options.private_key));
        let connection = Arc::new(ConnectionBean {
            dispatcher,
            sender,
            server,
            worker,
            boss,
            timer,
            nat: options.nat,
        });

        let peer = Arc::new(Peer {
            master: true,
            bean,
            connection,
            parent: None,
            children: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            done: watch::channel(false).0,
        });

        peer.register_handler(
            &[Command::Ping],
            Arc::new(PingRpc::new(peer.bean.clone())),
        );

        log::info!(
            "master peer started: id={}, address={}:{}/{}",
            peer.id(),
            peer.address().ip,
            peer.address().tcp_port,
            peer.address().udp_port
        );

        Ok(peer)
    }

    /// Attach a slave to a running parent. It reuses every shared resource
    /// and publishes the parent's coordinates under its own identity.
    pub fn slave(parent: &Arc<Peer>, id: Id160, private_key: PrivateKey) -> Arc<Peer> {
        let bean = Arc::new(PeerBean::new(parent.address().with_id(id), private_key));

        let peer = Arc::new(Peer {
            master: false,
            bean,
            connection: parent.connection.clone(),
            parent: Some(Arc::downgrade(parent)),
            children: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
            done: watch::channel(false).0,
        });

        peer.register_handler(
            &[Command::Ping],
            Arc::new(PingRpc::new(peer.bean.clone())),
        );

        parent.children.lock().push(peer.clone());
        log::info!("slave peer attached: id={}, parent={}", id, parent.id());

        peer
    }
}

/// Probe for an externally visible interface: the bound address when it is
/// concrete, otherwise the interface the OS would route outward traffic
/// through. Connecting a datagram socket sends nothing.
fn discover_ip(udp_local: SocketAddr) -> Option<IpAddr> {
    if !udp_local.ip().is_unspecified() {
        return Some(udp_local.ip());
    }

    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    probe.connect(("8.8.8.8", 53)).ok()?;

    let ip = probe.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
