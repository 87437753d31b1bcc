//! Endpoint - notify and invoke multiplexed over a pair of channels
//!
//! An endpoint is usable as soon as it is created. Sends issued before a
//! channel is bound are buffered per channel and replayed in order when the
//! channel arrives. Invocations are matched to replies through a correlation
//! table; anything on the invoke channel whose id is not outstanding is
//! treated as a request from the peer.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::{
    config::EndpointConfig,
    correlation::CorrelationTable,
    dispatcher::{panic_message, Dispatcher, Subscription},
    message::{
        Args, ChannelKind, CorrelationId, Inbound, InvokeFrame, Notification, PeerId, Reply,
    },
    pending::{ChannelSlot, Outbound},
    transport::{Channel, ChannelPair, InboundStream},
    Error, Result,
};

/// Which side of the conversation an endpoint speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Talks to a single responder
    Initiator,
    /// Addresses any number of initiators by identity
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers inbound invocations; an `Err` is sent back as a failure reply
pub type ReplyHandler =
    Arc<dyn Fn(Option<PeerId>, Args) -> BoxFuture<'static, anyhow::Result<Args>> + Send + Sync>;

/// A reply handler failure, surfaced locally after the failure reply was sent
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub id: CorrelationId,
    pub caller: Option<PeerId>,
    pub description: String,
}

struct EndpointInner {
    name: String,
    role: Role,
    config: EndpointConfig,
    notify: ChannelSlot,
    invoke: ChannelSlot,
    correlation: CorrelationTable,
    handler: RwLock<Option<ReplyHandler>>,
    notifications: Dispatcher<Notification>,
    handler_failures: Dispatcher<HandlerFailure>,
    /// Number of bound channels, 0..=2
    bound: watch::Sender<u8>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Dual-channel messaging endpoint
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("role", &self.inner.role)
            .field("notify_bound", &self.inner.notify.is_bound())
            .field("invoke_bound", &self.inner.invoke.is_bound())
            .finish()
    }
}

impl Endpoint {
    /// Create an unbound endpoint with default configuration
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self::with_config(name, role, EndpointConfig::default())
    }

    pub fn with_config(name: impl Into<String>, role: Role, config: EndpointConfig) -> Self {
        let (bound, _) = watch::channel(0);
        Self {
            inner: Arc::new(EndpointInner {
                name: name.into(),
                role,
                correlation: CorrelationTable::new(config.collision_retries),
                config,
                notify: ChannelSlot::new(ChannelKind::Notify),
                invoke: ChannelSlot::new(ChannelKind::Invoke),
                handler: RwLock::new(None),
                notifications: Dispatcher::new(),
                handler_failures: Dispatcher::new(),
                bound,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// True once both channels are bound
    pub fn is_bound(&self) -> bool {
        *self.inner.bound.borrow() == 2
    }

    /// Resolve once both channels are bound
    pub async fn wait_bound(&self) {
        let mut bound = self.inner.bound.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = bound.wait_for(|count| *count == 2).await;
    }

    /// Sends buffered while the corresponding channel is unbound
    pub fn pending_sends(&self) -> usize {
        self.inner.notify.pending_len() + self.inner.invoke.pending_len()
    }

    /// Invocations still waiting for a reply
    pub fn outstanding_invocations(&self) -> usize {
        self.inner.correlation.pending_count()
    }

    // ---- binding ----

    /// Bind both channels
    pub fn bind(&self, pair: ChannelPair) -> Result<()> {
        self.bind_notify(pair.notify)?;
        self.bind_invoke(pair.invoke)?;
        Ok(())
    }

    /// Bind the notify channel and replay buffered notifications
    pub fn bind_notify(&self, channel: Arc<dyn Channel>) -> Result<usize> {
        let weak = Arc::downgrade(&self.inner);
        let replayed = self.inner.notify.bind(channel, |channel| {
            let stream = channel.inbound()?;
            self.track(spawn_inbound(stream, weak, EndpointInner::on_notify)?);
            Ok(())
        })?;
        self.mark_bound();
        Ok(replayed)
    }

    /// Bind the invoke channel and replay buffered invocations
    pub fn bind_invoke(&self, channel: Arc<dyn Channel>) -> Result<usize> {
        let weak = Arc::downgrade(&self.inner);
        let replayed = self.inner.invoke.bind(channel, |channel| {
            let stream = channel.inbound()?;
            self.track(spawn_inbound(stream, weak, EndpointInner::on_invoke)?);
            Ok(())
        })?;
        self.mark_bound();
        Ok(replayed)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner.tasks.lock().push(handle);
    }

    fn mark_bound(&self) {
        self.inner.bound.send_modify(|count| *count += 1);
        if self.is_bound() {
            tracing::info!("Endpoint {} ({}) is bound", self.inner.name, self.inner.role);
        }
    }

    /// Stop the inbound loops and detach every listener
    ///
    /// Outstanding invocations stay in the table; their replies can no
    /// longer arrive.
    pub fn close(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.notifications.disconnect_all();
        self.inner.handler_failures.disconnect_all();
        tracing::info!("Endpoint {} closed", self.inner.name);
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<()> {
        if self.inner.role == role {
            Ok(())
        } else {
            Err(Error::role_violation(operation, self.inner.role.as_str()))
        }
    }

    // ---- notifications ----

    /// Initiator: notify the responder
    pub fn notify(&self, args: Args) -> Result<()> {
        self.require(Role::Initiator, "notify")?;
        self.inner.notify.send(Outbound::ToPeer(args))
    }

    /// Responder: notify one initiator
    pub fn notify_one(&self, target: &PeerId, args: Args) -> Result<()> {
        self.require(Role::Responder, "notify_one")?;
        self.inner
            .notify
            .send(Outbound::ToTarget(target.clone(), args))
    }

    /// Responder: notify every connected initiator
    pub fn notify_all(&self, args: Args) -> Result<()> {
        self.require(Role::Responder, "notify_all")?;
        self.inner.notify.send(Outbound::ToAll(args))
    }

    /// Dispatcher fed by inbound notify traffic
    pub fn on_notify(&self) -> &Dispatcher<Notification> {
        &self.inner.notifications
    }

    pub fn subscribe_notify<F>(&self, listener: F) -> Subscription<Notification>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.inner.notifications.subscribe_sync(listener)
    }

    /// Suspend until the next inbound notification
    pub async fn wait_notify(&self) -> Notification {
        self.inner.notifications.wait().await
    }

    // ---- invocations ----

    /// Install the handler answering inbound invocations, replacing any previous one
    pub fn set_reply_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Option<PeerId>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Args>> + Send + 'static,
    {
        let handler: ReplyHandler = Arc::new(move |caller, args| handler(caller, args).boxed());
        *self.inner.handler.write() = Some(handler);
    }

    /// Remove the reply handler; later requests get a "no handler" failure reply
    pub fn clear_reply_handler(&self) {
        self.inner.handler.write().take();
    }

    pub fn has_reply_handler(&self) -> bool {
        self.inner.handler.read().is_some()
    }

    /// Failures raised by the local reply handler
    pub fn handler_failures(&self) -> &Dispatcher<HandlerFailure> {
        &self.inner.handler_failures
    }

    /// Initiator: invoke the responder, delivering the reply to `callback`
    pub fn invoke_with<F>(&self, args: Args, callback: F) -> Result<CorrelationId>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.require(Role::Initiator, "invoke")?;
        self.inner.start_invocation(None, args, Box::new(callback))
    }

    /// Initiator: invoke the responder and wait for the reply
    ///
    /// Resolves with `success == false` when the responder had no handler
    /// or its handler failed; check it before trusting the values.
    pub async fn invoke(&self, args: Args) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.invoke_with(args, move |reply| {
            let _ = tx.send(reply);
        })?;
        await_reply(rx).await
    }

    /// Blocking form of [`Endpoint::invoke`]; must not be called from an async task
    pub fn invoke_blocking(&self, args: Args) -> Result<Reply> {
        futures::executor::block_on(self.invoke(args))
    }

    /// Responder: invoke one initiator, delivering the reply to `callback`
    pub fn invoke_one_with<F>(
        &self,
        target: &PeerId,
        args: Args,
        callback: F,
    ) -> Result<CorrelationId>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        self.require(Role::Responder, "invoke_one")?;
        self.inner
            .start_invocation(Some(target.clone()), args, Box::new(callback))
    }

    /// Responder: invoke one initiator and wait for the reply
    pub async fn invoke_one(&self, target: &PeerId, args: Args) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.invoke_one_with(target, args, move |reply| {
            let _ = tx.send(reply);
        })?;
        await_reply(rx).await
    }

    /// Responder: invoke every known initiator, tagging each reply with its target
    ///
    /// Targets are independent: a target that fails or never answers does
    /// not affect delivery of the others. Returns the targets invoked.
    pub fn invoke_all_with<F>(&self, args: Args, callback: F) -> Result<Vec<PeerId>>
    where
        F: Fn(PeerId, Result<Reply>) + Send + Sync + 'static,
    {
        self.require(Role::Responder, "invoke_all")?;
        let callback = Arc::new(callback);
        let targets = self.inner.peers();

        for target in &targets {
            let tagged = target.clone();
            let on_reply = callback.clone();
            if let Err(e) = self.inner.start_invocation(
                Some(target.clone()),
                args.clone(),
                Box::new(move |reply| on_reply(tagged, reply)),
            ) {
                tracing::warn!("invoke_all could not reach {}: {}", target, e);
                callback(target.clone(), Err(e));
            }
        }

        Ok(targets)
    }

    /// Responder: invoke every known initiator and wait for all replies
    ///
    /// Without an invoke timeout this waits forever on a silent target;
    /// use [`Endpoint::invoke_all_with`] to consume replies as they arrive.
    pub async fn invoke_all(&self, args: Args) -> Result<Vec<(PeerId, Result<Reply>)>> {
        self.require(Role::Responder, "invoke_all")?;
        let targets = self.inner.peers();
        let calls = targets.into_iter().map(|target| {
            let args = args.clone();
            async move {
                let reply = self.invoke_one(&target, args).await;
                (target, reply)
            }
        });
        Ok(futures::future::join_all(calls).await)
    }

    /// Initiators known to the bound channels; empty before binding
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers()
    }
}

async fn await_reply(rx: oneshot::Receiver<Result<Reply>>) -> Result<Reply> {
    rx.await
        .map_err(|_| Error::connection_msg("reply continuation dropped"))?
}

fn spawn_inbound(
    mut stream: InboundStream,
    endpoint: Weak<EndpointInner>,
    on_message: fn(&Arc<EndpointInner>, Inbound),
) -> Result<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::runtime("binding a channel requires a tokio runtime", e))?;

    Ok(handle.spawn(async move {
        while let Some(inbound) = stream.recv().await {
            let Some(inner) = endpoint.upgrade() else {
                break;
            };
            on_message(&inner, inbound);
        }
        tracing::debug!("Inbound loop finished");
    }))
}

impl EndpointInner {
    fn peers(&self) -> Vec<PeerId> {
        self.invoke
            .channel()
            .or_else(|| self.notify.channel())
            .map(|channel| channel.peers())
            .unwrap_or_default()
    }

    fn on_notify(self: &Arc<Self>, inbound: Inbound) {
        tracing::trace!("Notification on {} from {:?}", self.name, inbound.sender);
        self.notifications.broadcast(Notification::from(inbound));
    }

    fn on_invoke(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { sender, args } = inbound;
        let frame = match InvokeFrame::decode(args) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropped malformed invoke frame on {}: {}", self.name, e);
                return;
            }
        };

        let id = frame.id;
        let Some(frame) = self.correlation.complete(frame) else {
            tracing::trace!("Reply {} on {}", id, self.name);
            return;
        };

        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            tracing::debug!("No reply handler on {}, refusing request {}", self.name, frame.id);
            self.reply(sender.as_ref(), InvokeFrame::reply(frame.id, false, Vec::new()));
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            inner.serve(handler, sender, frame).await;
        });
    }

    async fn serve(
        self: Arc<Self>,
        handler: ReplyHandler,
        caller: Option<PeerId>,
        frame: InvokeFrame,
    ) {
        let id = frame.id;
        let call = {
            let caller = caller.clone();
            async move { handler(caller, frame.payload).await }
        };

        let description = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(values)) => {
                self.reply(caller.as_ref(), InvokeFrame::reply(id, true, values));
                return;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
        };

        self.reply(
            caller.as_ref(),
            InvokeFrame::reply(id, false, vec![Value::String(description.clone())]),
        );

        tracing::error!(
            "Reply handler on {} failed for request {}: {}",
            self.name,
            id,
            description
        );
        self.handler_failures.broadcast(HandlerFailure {
            id,
            caller,
            description,
        });
    }

    fn reply(&self, caller: Option<&PeerId>, frame: InvokeFrame) {
        let outbound = match (self.role, caller) {
            (Role::Initiator, _) => Outbound::ToPeer(frame.encode()),
            (Role::Responder, Some(caller)) => Outbound::ToTarget(caller.clone(), frame.encode()),
            (Role::Responder, None) => {
                tracing::warn!(
                    "Request {} on {} has no caller identity, reply dropped",
                    frame.id,
                    self.name
                );
                return;
            }
        };

        if let Err(e) = self.invoke.send(outbound) {
            tracing::warn!("Failed to send reply on {}: {}", self.name, e);
        }
    }

    fn start_invocation(
        self: &Arc<Self>,
        target: Option<PeerId>,
        args: Args,
        continuation: crate::correlation::Continuation,
    ) -> Result<CorrelationId> {
        let id = self.correlation.register(continuation)?;
        let frame = InvokeFrame::request(id, args).encode();
        let outbound = match target {
            Some(target) => Outbound::ToTarget(target, frame),
            None => Outbound::ToPeer(frame),
        };

        if let Err(e) = self.invoke.send(outbound) {
            self.correlation.take(id);
            return Err(e);
        }
        tracing::trace!("Invocation {} sent on {}", id, self.name);

        if let Some(timeout) = self.config.invoke_timeout {
            self.schedule_expiry(id, timeout);
        }
        Ok(id)
    }

    fn schedule_expiry(self: &Arc<Self>, id: CorrelationId, timeout: std::time::Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime, invocation {} will not expire", id);
            return;
        };
        let endpoint = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = endpoint.upgrade() {
                let elapsed_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                inner.correlation.expire(id, elapsed_ms);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn pair(bus: &LocalBus, name: &str) -> (Endpoint, Endpoint, PeerId) {
        use crate::transport::ChannelProvider;
        bus.declare(name);
        let server = Endpoint::new(name, Role::Responder);
        server
            .bind(bus.responder().discover(name).await.unwrap())
            .unwrap();
        let (peer, provider) = bus.connect();
        let client = Endpoint::new(name, Role::Initiator);
        client.bind(provider.discover(name).await.unwrap()).unwrap();
        (server, client, peer)
    }

    #[tokio::test]
    async fn test_role_violations_are_rejected() {
        let client = Endpoint::new("roles", Role::Initiator);
        let server = Endpoint::new("roles", Role::Responder);
        let peer = PeerId::new("p");

        let err = client.notify_all(vec![]).unwrap_err();
        assert!(matches!(
            err,
            Error::RoleViolation {
                operation: "notify_all",
                role: "initiator"
            }
        ));
        assert!(client.notify_one(&peer, vec![]).is_err());
        assert!(client.invoke_one_with(&peer, vec![], |_| {}).is_err());
        assert!(client.invoke_all_with(vec![], |_, _| {}).is_err());
        assert!(server.notify(vec![]).is_err());
        assert!(server.invoke_with(vec![], |_| {}).is_err());
        assert_eq!(server.invoke(vec![]).await.unwrap_err().category(), "role");

        // Nothing was buffered by the rejected calls.
        assert_eq!(client.pending_sends(), 0);
        assert_eq!(server.pending_sends(), 0);
        assert_eq!(client.outstanding_invocations(), 0);
    }

    #[tokio::test]
    async fn test_sum_round_trip() {
        let bus = LocalBus::new();
        let (server, client, peer) = pair(&bus, "math").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.set_reply_handler(move |caller, args| {
            let _ = tx.send(caller);
            async move {
                let a = args.first().and_then(Value::as_i64).unwrap_or_default();
                let b = args.get(1).and_then(Value::as_i64).unwrap_or_default();
                Ok(vec![json!(a + b)])
            }
        });

        let reply = timeout(Duration::from_secs(2), client.invoke(vec![json!(2), json!(2)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Reply::ok(vec![json!(4)]));
        assert_eq!(rx.recv().await.unwrap(), Some(peer));
        assert_eq!(client.outstanding_invocations(), 0);
    }

    #[tokio::test]
    async fn test_rebinding_is_rejected() {
        let bus = LocalBus::new();
        let (server, _client, _) = pair(&bus, "once").await;
        use crate::transport::ChannelProvider;
        let again = bus.responder().discover("once").await.unwrap();
        let err = server.bind_notify(again.notify).unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_wait_bound() {
        let bus = LocalBus::new();
        bus.declare("w");
        let endpoint = Endpoint::new("w", Role::Responder);
        assert!(!endpoint.is_bound());

        let waiter = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.wait_bound().await })
        };
        use crate::transport::ChannelProvider;
        let pair = bus.responder().discover("w").await.unwrap();
        endpoint.bind_notify(pair.notify).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        endpoint.bind_invoke(pair.invoke).unwrap();
        timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(endpoint.is_bound());
    }

    #[tokio::test]
    async fn test_invoke_timeout_evicts_entry() {
        let bus = LocalBus::new();
        bus.declare("slow");
        use crate::transport::ChannelProvider;
        let (_, provider) = bus.connect();
        let config = EndpointConfig::builder()
            .invoke_timeout(Duration::from_millis(30))
            .build();
        let client = Endpoint::with_config("slow", Role::Initiator, config);
        client.bind(provider.discover("slow").await.unwrap()).unwrap();

        // Nobody serves the responder side.
        let err = timeout(Duration::from_secs(2), client.invoke(vec![json!(1)]))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.category(), "timeout");
        assert_eq!(client.outstanding_invocations(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_inbound() {
        let bus = LocalBus::new();
        let (server, client, _) = pair(&bus, "closing").await;
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        server.subscribe_notify(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        server.close();
        client.notify(vec![json!("late")]).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
