//! Channel abstractions and the in-process bus

use crate::message::{Args, ChannelKind, Inbound, PeerId};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

/// Stream of messages arriving on a channel
pub type InboundStream = mpsc::UnboundedReceiver<Inbound>;

/// One named, unreliable message channel as seen from one side
///
/// Sends are fire-and-forget: `Ok` means the frame was handed to the
/// transport, not that anyone received it.
pub trait Channel: Send + Sync + 'static {
    /// Initiator side: send to the responder
    fn send_to_peer(&self, args: Args) -> Result<()>;

    /// Responder side: send to one initiator
    fn send_to_target(&self, target: &PeerId, args: Args) -> Result<()>;

    /// Responder side: send to every connected initiator
    fn send_to_all(&self, args: Args) -> Result<()>;

    /// Initiators currently known to this channel
    fn peers(&self) -> Vec<PeerId>;

    /// Open a new stream of inbound messages
    fn inbound(&self) -> Result<InboundStream>;
}

/// The notify and invoke channels backing one endpoint
#[derive(Clone)]
pub struct ChannelPair {
    pub notify: Arc<dyn Channel>,
    pub invoke: Arc<dyn Channel>,
}

/// Resolves endpoint names to channel pairs once they exist
#[async_trait]
pub trait ChannelProvider: Send + Sync + 'static {
    /// Wait until both channels for `name` are available
    ///
    /// Concurrent calls for the same name resolve to the same channels.
    async fn discover(&self, name: &str) -> Result<ChannelPair>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Side {
    Responder,
    Initiator(PeerId),
}

struct BusInner {
    wires: DashMap<String, Arc<WirePair>>,
    peers: RwLock<BTreeSet<PeerId>>,
    /// Bumped whenever a channel pair is declared
    declared: watch::Sender<u64>,
}

struct WirePair {
    notify: Arc<Wire>,
    invoke: Arc<Wire>,
}

/// Shared state of one named channel
struct Wire {
    name: String,
    kind: ChannelKind,
    bus: Weak<BusInner>,
    receivers: Mutex<HashMap<Side, Vec<mpsc::UnboundedSender<Inbound>>>>,
}

impl Wire {
    fn deliver(&self, to: &Side, inbound: Inbound) -> usize {
        let mut receivers = self.receivers.lock();
        let Some(list) = receivers.get_mut(to) else {
            tracing::trace!("No receiver on {}/{:?} for {:?}, dropped", self.name, self.kind, to);
            return 0;
        };
        list.retain(|tx| tx.send(inbound.clone()).is_ok());
        list.len()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.bus
            .upgrade()
            .map(|bus| bus.peers.read().iter().cloned().collect())
            .unwrap_or_default()
    }

    fn drop_side(&self, side: &Side) {
        self.receivers.lock().remove(side);
    }
}

/// In-process bus handing out channel pairs by name
///
/// Pairs become discoverable only after [`LocalBus::declare`], which lets
/// tests and embedders reproduce channels that show up after the endpoint
/// was created. Frames addressed to a side with no open stream are dropped.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (declared, _) = watch::channel(0);
        Self {
            inner: Arc::new(BusInner {
                wires: DashMap::new(),
                peers: RwLock::new(BTreeSet::new()),
                declared,
            }),
        }
    }

    /// Make the channel pair for `name` available; idempotent
    pub fn declare(&self, name: &str) {
        let mut created = false;
        self.inner.wires.entry(name.to_string()).or_insert_with(|| {
            created = true;
            let wire = |kind| {
                Arc::new(Wire {
                    name: name.to_string(),
                    kind,
                    bus: Arc::downgrade(&self.inner),
                    receivers: Mutex::new(HashMap::new()),
                })
            };
            Arc::new(WirePair {
                notify: wire(ChannelKind::Notify),
                invoke: wire(ChannelKind::Invoke),
            })
        });

        if created {
            tracing::debug!("Declared channel pair {}", name);
            self.inner.declared.send_modify(|version| *version += 1);
        }
    }

    /// Provider for the responder side
    pub fn responder(&self) -> LocalProvider {
        LocalProvider {
            bus: self.inner.clone(),
            side: Side::Responder,
        }
    }

    /// Register a new initiator and return its provider
    pub fn connect(&self) -> (PeerId, LocalProvider) {
        let peer = PeerId::random();
        let provider = self.connect_as(peer.clone());
        (peer, provider)
    }

    /// Register an initiator under a chosen identity
    pub fn connect_as(&self, peer: PeerId) -> LocalProvider {
        self.inner.peers.write().insert(peer.clone());
        tracing::debug!("Peer {} connected", peer);
        LocalProvider {
            bus: self.inner.clone(),
            side: Side::Initiator(peer),
        }
    }

    /// Forget an initiator and close its inbound streams
    pub fn disconnect(&self, peer: &PeerId) {
        self.inner.peers.write().remove(peer);
        let side = Side::Initiator(peer.clone());
        for pair in self.inner.wires.iter() {
            pair.notify.drop_side(&side);
            pair.invoke.drop_side(&side);
        }
        tracing::debug!("Peer {} disconnected", peer);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.read().iter().cloned().collect()
    }
}

/// One side's view of a [`LocalBus`]
#[derive(Clone)]
pub struct LocalProvider {
    bus: Arc<BusInner>,
    side: Side,
}

impl LocalProvider {
    fn pair(&self, wires: &WirePair) -> ChannelPair {
        ChannelPair {
            notify: Arc::new(LocalChannel {
                wire: wires.notify.clone(),
                side: self.side.clone(),
            }),
            invoke: Arc::new(LocalChannel {
                wire: wires.invoke.clone(),
                side: self.side.clone(),
            }),
        }
    }
}

#[async_trait]
impl ChannelProvider for LocalProvider {
    async fn discover(&self, name: &str) -> Result<ChannelPair> {
        let mut declared = self.bus.declared.subscribe();
        loop {
            if let Some(wires) = self.bus.wires.get(name) {
                return Ok(self.pair(&wires));
            }
            declared
                .changed()
                .await
                .map_err(|_| Error::connection_msg("local bus closed"))?;
        }
    }
}

/// Channel handle backed by a [`LocalBus`] wire
pub struct LocalChannel {
    wire: Arc<Wire>,
    side: Side,
}

impl LocalChannel {
    fn initiator(&self) -> Option<&PeerId> {
        match &self.side {
            Side::Initiator(peer) => Some(peer),
            Side::Responder => None,
        }
    }

    fn require_responder(&self, operation: &str) -> Result<()> {
        match self.side {
            Side::Responder => Ok(()),
            Side::Initiator(_) => Err(Error::transport_msg(format!(
                "{operation} is only available on the responder side"
            ))),
        }
    }
}

impl Channel for LocalChannel {
    fn send_to_peer(&self, args: Args) -> Result<()> {
        let me = self.initiator().cloned().ok_or_else(|| {
            Error::transport_msg("send_to_peer is only available on the initiator side")
        })?;
        self.wire.deliver(
            &Side::Responder,
            Inbound {
                sender: Some(me),
                args,
            },
        );
        Ok(())
    }

    fn send_to_target(&self, target: &PeerId, args: Args) -> Result<()> {
        self.require_responder("send_to_target")?;
        self.wire.deliver(
            &Side::Initiator(target.clone()),
            Inbound { sender: None, args },
        );
        Ok(())
    }

    fn send_to_all(&self, args: Args) -> Result<()> {
        self.require_responder("send_to_all")?;
        for peer in self.wire.peers() {
            self.wire.deliver(
                &Side::Initiator(peer),
                Inbound {
                    sender: None,
                    args: args.clone(),
                },
            );
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.wire.peers()
    }

    fn inbound(&self) -> Result<InboundStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.wire
            .receivers
            .lock()
            .entry(self.side.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_discover_waits_for_declaration() {
        let bus = LocalBus::new();
        let provider = bus.responder();

        let pending = tokio::spawn(async move { provider.discover("late").await.is_ok() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        bus.declare("late");
        assert!(timeout(Duration::from_secs(2), pending).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_addressing() {
        let bus = LocalBus::new();
        bus.declare("room");
        let server = bus.responder().discover("room").await.unwrap();
        let (alice, alice_provider) = bus.connect();
        let (bob, bob_provider) = bus.connect();
        let alice_ch = alice_provider.discover("room").await.unwrap();
        let bob_ch = bob_provider.discover("room").await.unwrap();

        let mut server_rx = server.notify.inbound().unwrap();
        let mut alice_rx = alice_ch.notify.inbound().unwrap();
        let mut bob_rx = bob_ch.notify.inbound().unwrap();

        alice_ch.notify.send_to_peer(vec![json!("hi")]).unwrap();
        let got = server_rx.recv().await.unwrap();
        assert_eq!(got.sender, Some(alice.clone()));
        assert_eq!(got.args, vec![json!("hi")]);

        server.notify.send_to_target(&bob, vec![json!(1)]).unwrap();
        assert_eq!(bob_rx.recv().await.unwrap().args, vec![json!(1)]);
        assert!(alice_rx.try_recv().is_err());

        server.notify.send_to_all(vec![json!(2)]).unwrap();
        assert_eq!(alice_rx.recv().await.unwrap().args, vec![json!(2)]);
        assert_eq!(bob_rx.recv().await.unwrap().args, vec![json!(2)]);

        let mut peers = server.invoke.peers();
        peers.sort();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(peers, expected);
    }

    #[tokio::test]
    async fn test_wrong_side_sends_are_rejected() {
        let bus = LocalBus::new();
        bus.declare("x");
        let server = bus.responder().discover("x").await.unwrap();
        let (_, client) = bus.connect();
        let client = client.discover("x").await.unwrap();

        assert!(server.notify.send_to_peer(vec![]).is_err());
        assert!(client.notify.send_to_all(vec![]).is_err());
        assert!(client
            .notify
            .send_to_target(&PeerId::new("someone"), vec![])
            .is_err());
    }

    #[tokio::test]
    async fn test_disconnect_closes_streams() {
        let bus = LocalBus::new();
        bus.declare("x");
        let (peer, provider) = bus.connect();
        let channels = provider.discover("x").await.unwrap();
        let mut rx = channels.invoke.inbound().unwrap();

        bus.disconnect(&peer);
        assert!(rx.recv().await.is_none());
        assert!(bus.peers().is_empty());
    }
}
