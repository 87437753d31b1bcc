//! ipmb-backed channels for cross-process endpoints
//!
//! All endpoints of a process share one bus membership. The responder joins
//! under a well-known label; each initiator joins under its own identity and
//! announces itself with a hello frame so the responder can address it.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use type_uuid::TypeUuid;

use crate::{
    config::IpmbConfig,
    endpoint::Role,
    message::{Args, ChannelKind, Inbound, PeerId, WireFrame},
    transport::{Channel, ChannelPair, ChannelProvider, InboundStream},
    Error, Result,
};

/// ipmb payload wrapping an encoded [`WireFrame`]
#[derive(Debug, Serialize, Deserialize, TypeUuid)]
#[uuid = "3c9f0e52-6a1d-4b7e-9f2a-d81c5e04a6b3"]
struct IpmbFrame {
    bytes: Vec<u8>,
}

type RouteKey = (String, ChannelKind);

/// Demultiplexes frames received on the bus onto per-channel streams
struct FrameRouter {
    role: Role,
    identity: PeerId,
    routes: Mutex<HashMap<RouteKey, Vec<mpsc::UnboundedSender<Inbound>>>>,
    peers: RwLock<BTreeSet<PeerId>>,
}

/// What the bus should do after routing a frame
#[derive(Debug, PartialEq)]
enum RouteOutcome {
    Delivered(usize),
    Ignored,
    /// A responder asked initiators to announce themselves
    AnnounceRequested,
}

impl FrameRouter {
    fn new(role: Role, identity: PeerId) -> Self {
        Self {
            role,
            identity,
            routes: Mutex::new(HashMap::new()),
            peers: RwLock::new(BTreeSet::new()),
        }
    }

    fn open(&self, endpoint: &str, kind: ChannelKind) -> InboundStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .entry((endpoint.to_string(), kind))
            .or_default()
            .push(tx);
        rx
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.read().iter().cloned().collect()
    }

    fn route(&self, frame: WireFrame) -> Result<RouteOutcome> {
        match frame {
            WireFrame::Hello { peer } => {
                match self.role {
                    Role::Initiator if peer.as_str().is_empty() => {
                        Ok(RouteOutcome::AnnounceRequested)
                    }
                    Role::Responder if !peer.as_str().is_empty() => {
                        if self.peers.write().insert(peer.clone()) {
                            tracing::info!("Peer {} joined", peer);
                        }
                        Ok(RouteOutcome::Ignored)
                    }
                    _ => Ok(RouteOutcome::Ignored),
                }
            }
            WireFrame::Goodbye { peer } => {
                if self.peers.write().remove(&peer) {
                    tracing::info!("Peer {} left", peer);
                }
                Ok(RouteOutcome::Ignored)
            }
            WireFrame::Data {
                endpoint,
                channel,
                source,
                body,
            } => {
                // Responders only accept initiator traffic and vice versa.
                match (self.role, &source) {
                    (Role::Responder, Some(peer)) => {
                        self.peers.write().insert(peer.clone());
                    }
                    (Role::Initiator, None) => {}
                    _ => return Ok(RouteOutcome::Ignored),
                }

                let args = WireFrame::decode_body(&body)?;
                let mut routes = self.routes.lock();
                let Some(receivers) = routes.get_mut(&(endpoint.clone(), channel)) else {
                    tracing::trace!("No route for {}/{:?}, dropped", endpoint, channel);
                    return Ok(RouteOutcome::Delivered(0));
                };
                let inbound = Inbound {
                    sender: source,
                    args,
                };
                receivers.retain(|tx| tx.send(inbound.clone()).is_ok());
                Ok(RouteOutcome::Delivered(receivers.len()))
            }
        }
    }
}

struct IpmbBus {
    config: IpmbConfig,
    router: FrameRouter,
    sender: ipmb::EndpointSender<IpmbFrame>,
    channels: DashMap<String, ChannelPair>,
    shutdown: AtomicBool,
}

impl IpmbBus {
    fn send(&self, selector: ipmb::Selector, frame: &WireFrame) -> Result<()> {
        let message = ipmb::Message::new(
            selector,
            IpmbFrame {
                bytes: frame.to_bytes()?,
            },
        );

        match self.sender.send(message) {
            Ok(()) => Ok(()),
            Err(e) => {
                let error_msg = format!("IPMB send failed: {e}");
                // ipmb reports transient socket trouble as "Invalid argument"
                if error_msg.contains("Invalid argument") {
                    tracing::warn!("{} (frame dropped)", error_msg);
                    Ok(())
                } else {
                    Err(Error::transport_msg(error_msg))
                }
            }
        }
    }

    fn to_responder(&self) -> ipmb::Selector {
        ipmb::Selector::unicast(ipmb::LabelOp::from(self.config.responder_label.as_str()))
    }

    fn to_peer(&self, peer: &PeerId) -> ipmb::Selector {
        ipmb::Selector::unicast(ipmb::LabelOp::from(peer.as_str()))
    }

    fn to_everyone(&self) -> ipmb::Selector {
        ipmb::Selector::multicast(ipmb::LabelOp::True)
    }

    fn announce(&self) -> Result<()> {
        let hello = WireFrame::Hello {
            peer: self.router.identity.clone(),
        };
        self.send(self.to_responder(), &hello)
    }
}

/// Channel provider on an ipmb bus
#[derive(Clone)]
pub struct IpmbProvider {
    bus: Arc<IpmbBus>,
}

impl IpmbProvider {
    /// Join the bus as `role`
    pub fn join(role: Role, config: IpmbConfig) -> Result<Self> {
        let (identity, label) = match role {
            Role::Responder => {
                let label = config.responder_label.clone();
                (PeerId::new(label.clone()), label)
            }
            Role::Initiator => {
                let identity = config.identity.clone().unwrap_or_else(PeerId::random);
                let label = identity.as_str().to_string();
                (identity, label)
            }
        };

        let options =
            ipmb::Options::new(config.bus_name.as_str(), ipmb::label!(label.as_str()), "");
        let (sender, receiver) = ipmb::join::<IpmbFrame, IpmbFrame>(options, None)
            .map_err(|e| Error::transport_msg(format!("IPMB join failed: {e}")))?;
        tracing::info!("Joined IPMB bus {} as {} {}", config.bus_name, role, identity);

        let bus = Arc::new(IpmbBus {
            router: FrameRouter::new(role, identity),
            sender,
            channels: DashMap::new(),
            shutdown: AtomicBool::new(false),
            config,
        });

        let reader = bus.clone();
        std::thread::Builder::new()
            .name("dualipc-ipmb-recv".to_string())
            .spawn(move || receive_loop(reader, receiver))?;

        match role {
            // An empty hello asks already running initiators to announce themselves.
            Role::Responder => bus.send(
                bus.to_everyone(),
                &WireFrame::Hello {
                    peer: PeerId::new(""),
                },
            )?,
            Role::Initiator => bus.announce()?,
        }

        Ok(Self { bus })
    }

    pub fn identity(&self) -> &PeerId {
        &self.bus.router.identity
    }

    /// Leave the bus; initiators say goodbye to the responder first
    pub fn leave(&self) -> Result<()> {
        if self.bus.router.role == Role::Initiator {
            let goodbye = WireFrame::Goodbye {
                peer: self.bus.router.identity.clone(),
            };
            self.bus.send(self.bus.to_responder(), &goodbye)?;
        }
        self.bus.shutdown.store(true, Ordering::Relaxed);
        tracing::info!("Leaving IPMB bus {}", self.bus.config.bus_name);
        Ok(())
    }
}

fn receive_loop(bus: Arc<IpmbBus>, mut receiver: ipmb::EndpointReceiver<IpmbFrame>) {
    tracing::debug!("IPMB receive loop started for {}", bus.router.identity);
    while !bus.shutdown.load(Ordering::Relaxed) {
        let message = match receiver.recv(Some(bus.config.poll_interval)) {
            Ok(message) => message,
            Err(e) => {
                // Timeouts surface as errors too; keep polling until shutdown.
                tracing::trace!("IPMB recv: {}", e);
                continue;
            }
        };

        let outcome =
            WireFrame::from_bytes(&message.payload.bytes).and_then(|f| bus.router.route(f));
        match outcome {
            Ok(RouteOutcome::AnnounceRequested) => {
                if let Err(e) = bus.announce() {
                    tracing::warn!("Failed to announce {}: {}", bus.router.identity, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Dropped undecodable IPMB frame: {}", e),
        }
    }
    tracing::debug!("IPMB receive loop stopped for {}", bus.router.identity);
}

#[async_trait]
impl ChannelProvider for IpmbProvider {
    async fn discover(&self, name: &str) -> Result<ChannelPair> {
        let pair = self
            .bus
            .channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelPair {
                notify: Arc::new(IpmbChannel {
                    bus: self.bus.clone(),
                    endpoint: name.to_string(),
                    kind: ChannelKind::Notify,
                }),
                invoke: Arc::new(IpmbChannel {
                    bus: self.bus.clone(),
                    endpoint: name.to_string(),
                    kind: ChannelKind::Invoke,
                }),
            })
            .clone();
        Ok(pair)
    }
}

/// One endpoint channel multiplexed over the shared bus
pub struct IpmbChannel {
    bus: Arc<IpmbBus>,
    endpoint: String,
    kind: ChannelKind,
}

impl IpmbChannel {
    fn frame(&self, args: &Args) -> Result<WireFrame> {
        let source = match self.bus.router.role {
            Role::Initiator => Some(self.bus.router.identity.clone()),
            Role::Responder => None,
        };
        WireFrame::data(&self.endpoint, self.kind, source, args)
    }

    fn require(&self, role: Role, operation: &str) -> Result<()> {
        if self.bus.router.role == role {
            Ok(())
        } else {
            Err(Error::transport_msg(format!(
                "{operation} is not available to the {role} side"
            )))
        }
    }
}

impl Channel for IpmbChannel {
    fn send_to_peer(&self, args: Args) -> Result<()> {
        self.require(Role::Initiator, "send_to_peer")?;
        self.bus.send(self.bus.to_responder(), &self.frame(&args)?)
    }

    fn send_to_target(&self, target: &PeerId, args: Args) -> Result<()> {
        self.require(Role::Responder, "send_to_target")?;
        self.bus.send(self.bus.to_peer(target), &self.frame(&args)?)
    }

    fn send_to_all(&self, args: Args) -> Result<()> {
        self.require(Role::Responder, "send_to_all")?;
        self.bus.send(self.bus.to_everyone(), &self.frame(&args)?)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.bus.router.peers()
    }

    fn inbound(&self) -> Result<InboundStream> {
        Ok(self.bus.router.open(&self.endpoint, self.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(endpoint: &str, kind: ChannelKind, source: Option<&str>, args: Args) -> WireFrame {
        WireFrame::data(endpoint, kind, source.map(PeerId::new), &args).unwrap()
    }

    #[test]
    fn test_responder_routes_and_learns_peers() {
        let router = FrameRouter::new(Role::Responder, PeerId::new("server"));
        let mut rx = router.open("chat", ChannelKind::Notify);

        let outcome = router
            .route(data("chat", ChannelKind::Notify, Some("alice"), vec![json!(1)]))
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered(1));
        let inbound = rx.try_recv().unwrap();
        assert_eq!(inbound.sender, Some(PeerId::new("alice")));
        assert_eq!(inbound.args, vec![json!(1)]);

        router
            .route(WireFrame::Hello {
                peer: PeerId::new("bob"),
            })
            .unwrap();
        assert_eq!(router.peers(), vec![PeerId::new("alice"), PeerId::new("bob")]);

        router
            .route(WireFrame::Goodbye {
                peer: PeerId::new("alice"),
            })
            .unwrap();
        assert_eq!(router.peers(), vec![PeerId::new("bob")]);
    }

    #[test]
    fn test_channels_are_kept_apart() {
        let router = FrameRouter::new(Role::Initiator, PeerId::new("alice"));
        let mut notify = router.open("chat", ChannelKind::Notify);
        let mut invoke = router.open("chat", ChannelKind::Invoke);

        router
            .route(data("chat", ChannelKind::Invoke, None, vec![json!(5), json!(true)]))
            .unwrap();
        assert!(notify.try_recv().is_err());
        assert_eq!(invoke.try_recv().unwrap().args, vec![json!(5), json!(true)]);

        let outcome = router
            .route(data("other", ChannelKind::Notify, None, vec![]))
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered(0));
    }

    #[test]
    fn test_own_side_traffic_is_ignored() {
        let responder = FrameRouter::new(Role::Responder, PeerId::new("server"));
        let _rx = responder.open("chat", ChannelKind::Notify);
        let outcome = responder
            .route(data("chat", ChannelKind::Notify, None, vec![]))
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Ignored);

        let initiator = FrameRouter::new(Role::Initiator, PeerId::new("alice"));
        let outcome = initiator
            .route(data("chat", ChannelKind::Notify, Some("bob"), vec![]))
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Ignored);
    }

    #[test]
    fn test_empty_hello_requests_announcement() {
        let initiator = FrameRouter::new(Role::Initiator, PeerId::new("alice"));
        let outcome = initiator
            .route(WireFrame::Hello {
                peer: PeerId::new(""),
            })
            .unwrap();
        assert_eq!(outcome, RouteOutcome::AnnounceRequested);
    }
}
