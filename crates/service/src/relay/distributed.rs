use crate::{
    Routing,
    peer::PeerBean,
    relay::{ExpiringSet, PeerConnection, RelayConfig, RelayConnector},
};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::HashMap;
use codec::address::{PeerAddress, PeerSocketAddress};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Pause before retrying manual relays, which are exempt from the failure
/// quarantine and would otherwise spin.
const MANUAL_RETRY: Duration = Duration::from_secs(2);

pub enum RelayEvent {
    /// Attempt to fill the next free relay slot.
    TryFill,
    /// A live relay connection closed.
    Lost(PeerAddress),
}

/// Keeps up to `max_relays` outbound relay connections alive for a peer
/// that may be unreachable, replacing lost ones and rewriting the peer's
/// published address as the set changes.
///
/// All state transitions run on one event-loop task fed by a bounded
/// channel; the locks below only cover readers on other tasks.
pub struct DistributedRelay {
    bean: Arc<PeerBean>,
    routing: Arc<dyn Routing>,
    connector: Arc<dyn RelayConnector>,
    config: RelayConfig,
    active: Mutex<HashMap<PeerAddress, PeerConnection>>,
    failed: Mutex<ExpiringSet>,
    activity: AtomicUsize,
    shutdown: AtomicBool,
    done: watch::Sender<bool>,
    events: mpsc::Sender<RelayEvent>,
}

impl DistributedRelay {
    pub fn start(
        bean: Arc<PeerBean>,
        routing: Arc<dyn Routing>,
        connector: Arc<dyn RelayConnector>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let (events, receiver) = mpsc::channel(64);
        let failure_ttl = config.failure_ttl;

        let this = Arc::new(Self {
            bean,
            routing,
            connector,
            config,
            active: Mutex::new(HashMap::default()),
            failed: Mutex::new(ExpiringSet::new(failure_ttl)),
            activity: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            done: watch::channel(false).0,
            events,
        });

        this.try_fill();
        tokio::spawn(Self::run(this.clone(), receiver));

        this
    }

    async fn run(self: Arc<Self>, mut events: mpsc::Receiver<RelayEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::TryFill => self.fill().await,
                RelayEvent::Lost(peer) => self.lost(peer),
            }

            if *self.done.borrow() {
                break;
            }
        }
    }

    /// The relays currently connected, in no particular order.
    pub fn relays(&self) -> Vec<PeerAddress> {
        self.active.lock().keys().cloned().collect()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }

    /// One setup cycle: pick a candidate, attempt the handshake, account
    /// for the outcome and queue the next cycle.
    async fn fill(&self) {
        self.activity.fetch_add(1, Ordering::SeqCst);

        if self.shutdown.load(Ordering::SeqCst) {
            self.finish();
            return;
        }

        let candidate = {
            let active = self.active.lock();
            if active.len() >= self.config.max_relays {
                None
            } else {
                self.candidates(&active).into_iter().next()
            }
        };

        let Some(candidate) = candidate else {
            self.finish();
            return;
        };

        match self
            .connector
            .send_setup_message(&candidate, &self.config)
            .await
        {
            Ok(connection) => {
                self.active
                    .lock()
                    .insert(candidate.clone(), connection.clone());

                self.republish();
                self.bean.relay_added(&candidate);
                self.watch_connection(candidate.clone(), connection.clone());
                self.try_fill();

                log::info!("relay established: peer={}", candidate.id);

                // A setup racing shutdown still lands in the active map;
                // closing it here routes cleanup through the usual path.
                if self.shutdown.load(Ordering::SeqCst) {
                    connection.close();
                }
            }
            Err(error) => {
                log::debug!(
                    "relay setup failed: peer={}, error={:?}",
                    candidate.id,
                    error
                );

                self.failed.lock().insert(candidate.clone());
                self.bean.relay_removed(&candidate);

                if self.config.manual_relays.is_empty() {
                    self.try_fill();
                } else {
                    self.try_fill_later();
                }
            }
        }

        self.finish();
    }

    fn lost(&self, peer: PeerAddress) {
        let removed = self.active.lock().remove(&peer).is_some();
        if removed {
            self.failed.lock().insert(peer.clone());
            self.republish();
            self.bean.relay_removed(&peer);
            log::info!("relay lost: peer={}", peer.id);
        }

        if self.shutdown.load(Ordering::SeqCst) {
            self.complete_if_idle();
        } else if removed {
            self.try_fill();
        }
    }

    /// Candidate pool under the active lock, so a concurrent cycle cannot
    /// pick a peer that just became active.
    fn candidates(&self, active: &HashMap<PeerAddress, PeerConnection>) -> Vec<PeerAddress> {
        if !self.config.manual_relays.is_empty() {
            return self
                .config
                .manual_relays
                .iter()
                .filter(|peer| !active.contains_key(peer))
                .cloned()
                .collect();
        }

        let mut failed = self.failed.lock();
        self.routing
            .neighbors()
            .into_iter()
            .filter(|peer| !peer.flags.relayed)
            .filter(|peer| !active.contains_key(peer))
            .filter(|peer| !failed.contains(peer))
            .collect()
    }

    /// Rebuild the published address from the current relay set: one relay
    /// socket per active relay, the firewalled flags cleared exactly when
    /// relays exist, and the slow bit when the relay type asks for it.
    fn republish(&self) {
        let current = self.bean.address();

        let relays: Vec<PeerSocketAddress> = self
            .active
            .lock()
            .keys()
            .take(self.config.max_relays)
            .map(|peer| PeerSocketAddress {
                ip: peer.ip,
                tcp_port: peer.tcp_port,
                udp_port: peer.udp_port,
            })
            .collect();

        let has_relays = !relays.is_empty();
        let mut flags = current.flags;
        flags.firewalled_tcp = !has_relays;
        flags.firewalled_udp = !has_relays;
        flags.relayed = has_relays;
        flags.slow = has_relays && self.config.slow;

        self.bean
            .publish_address(current.with_relays(relays).with_flags(flags));
    }

    fn watch_connection(&self, peer: PeerAddress, connection: PeerConnection) {
        let events = self.events.clone();
        tokio::spawn(async move {
            connection.wait_closed().await;
            let _ = events.send(RelayEvent::Lost(peer)).await;
        });
    }

    fn try_fill(&self) {
        let _ = self.events.try_send(RelayEvent::TryFill);
    }

    fn try_fill_later(&self) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MANUAL_RETRY).await;
            let _ = events.send(RelayEvent::TryFill).await;
        });
    }

    fn finish(&self) {
        self.activity.fetch_sub(1, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            self.complete_if_idle();
        }
    }

    fn complete_if_idle(&self) {
        if self.activity.load(Ordering::SeqCst) == 0
            && self.active.lock().is_empty()
            && !*self.done.borrow()
        {
            let _ = self.done.send(true);
        }
    }

    /// Close every live relay connection and wait until the last one has
    /// been accounted for. The done-signal fires exactly once.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let connections: Vec<PeerConnection> = self.active.lock().values().cloned().collect();
        if connections.is_empty() {
            self.complete_if_idle();
        } else {
            for connection in connections {
                connection.close();
            }
        }

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
}
