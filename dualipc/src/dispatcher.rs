//! Multi-listener dispatcher for inbound notifications
//!
//! Subscriptions live in a singly linked list with head insertion. A
//! broadcast first snapshots every connected node, then starts each listener
//! inline, newest first. A listener that suspends is handed to its own task
//! so a slow or failing listener never holds up the others, while listeners
//! that complete synchronously observe broadcasts in the order issued.
//! Disconnecting unlinks a node from its predecessor but leaves the node's own
//! `next` link alone, which keeps the list walkable while it shrinks.

use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Listener<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
type Link<T> = Option<Arc<Node<T>>>;

struct Node<T> {
    listener: Listener<T>,
    connected: AtomicBool,
    /// Fires at most once, then detaches itself
    once: bool,
    next: Mutex<Link<T>>,
}

struct Inner<T> {
    /// Structural changes to the list are serialized on this lock
    head: Mutex<Link<T>>,
}

impl<T> Inner<T> {
    fn unlink(&self, target: &Arc<Node<T>>) {
        let mut head = self.head.lock();
        let Some(first) = head.clone() else {
            return;
        };
        if Arc::ptr_eq(&first, target) {
            *head = target.next.lock().clone();
            return;
        }

        let mut cursor = Some(first);
        while let Some(node) = cursor {
            let mut next = node.next.lock();
            match next.as_ref() {
                Some(candidate) if Arc::ptr_eq(candidate, target) => {
                    *next = target.next.lock().clone();
                    return;
                }
                _ => {}
            }
            cursor = next.clone();
        }
    }
}

/// Event broadcaster with disconnect-safe subscriptions
pub struct Dispatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Dispatcher<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                head: Mutex::new(None),
            }),
        }
    }

    /// Register an async listener
    pub fn subscribe<F, Fut>(&self, listener: F) -> Subscription<T>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.attach(Arc::new(move |value| listener(value).boxed()), false)
    }

    /// Register a plain closure as a listener
    pub fn subscribe_sync<F>(&self, listener: F) -> Subscription<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        self.attach(
            Arc::new(move |value| {
                let listener = listener.clone();
                async move { listener(value) }.boxed()
            }),
            false,
        )
    }

    fn attach(&self, listener: Listener<T>, once: bool) -> Subscription<T> {
        let mut head = self.inner.head.lock();
        let node = Arc::new(Node {
            listener,
            connected: AtomicBool::new(true),
            once,
            next: Mutex::new(head.take()),
        });
        *head = Some(node.clone());

        Subscription {
            node,
            dispatcher: Arc::downgrade(&self.inner),
        }
    }

    /// Detach every current subscription
    pub fn disconnect_all(&self) {
        let mut head = self.inner.head.lock();
        let mut cursor = head.take();
        while let Some(node) = cursor {
            node.connected.store(false, Ordering::Release);
            cursor = node.next.lock().clone();
        }
    }

    /// Deliver `value` to every connected listener, returning how many were started
    ///
    /// Each listener runs on the calling thread until it first suspends; only
    /// the remainder is moved to a task.
    pub fn broadcast(&self, value: T) -> usize {
        let targets = self.snapshot();
        let delivered = targets.len();
        let mut suspended = 0;

        for node in targets {
            if let Some(rest) = start_listener(&node.listener, value.clone()) {
                spawn_listener(rest);
                suspended += 1;
            }
        }

        tracing::trace!(
            "Broadcast started {} listeners, {} suspended",
            delivered,
            suspended
        );
        delivered
    }

    /// Suspend until the next broadcast and return its value
    ///
    /// Uses a one-shot subscription that detaches the moment it fires. Waits
    /// pending across `disconnect_all` are never resumed.
    pub async fn wait(&self) -> T {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let subscription = self.attach(
            Arc::new(move |value| {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(value);
                }
                futures::future::ready(()).boxed()
            }),
            true,
        );
        let _guard = WaitGuard(subscription);

        match rx.await {
            Ok(value) => value,
            // The sender lives inside the node the guard keeps alive.
            Err(_) => futures::future::pending().await,
        }
    }

    /// Blocking form of [`Dispatcher::wait`]; must not be called from an async task
    pub fn wait_blocking(&self) -> T {
        futures::executor::block_on(self.wait())
    }

    /// Number of connected subscriptions
    pub fn subscription_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.inner.head.lock().clone();
        while let Some(node) = cursor {
            if node.connected.load(Ordering::Acquire) {
                count += 1;
            }
            cursor = node.next.lock().clone();
        }
        count
    }

    fn snapshot(&self) -> Vec<Arc<Node<T>>> {
        let mut targets = Vec::new();
        let mut cursor = self.inner.head.lock().clone();

        while let Some(node) = cursor {
            let live = if node.once {
                node.connected
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            } else {
                node.connected.load(Ordering::Acquire)
            };
            cursor = node.next.lock().clone();

            if live {
                if node.once {
                    self.inner.unlink(&node);
                }
                targets.push(node);
            }
        }

        targets
    }
}

/// Poll a listener once; returns the future if it has not finished
fn start_listener<T>(listener: &Listener<T>, value: T) -> Option<BoxFuture<'static, ()>> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);

    let started = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut task = listener(value);
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(()) => None,
            Poll::Pending => Some(task),
        }
    }));

    match started {
        Ok(rest) => rest,
        Err(panic) => {
            tracing::error!("Listener failed: {}", panic_message(&*panic));
            None
        }
    }
}

fn spawn_listener(task: BoxFuture<'static, ()>) {
    let supervised = async move {
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            tracing::error!("Listener failed: {}", panic_message(&*panic));
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(supervised);
        }
        Err(_) => {
            std::thread::spawn(move || futures::executor::block_on(supervised));
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Handle to a registered listener
///
/// Dropping the handle leaves the listener connected.
pub struct Subscription<T> {
    node: Arc<Node<T>>,
    dispatcher: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    /// Detach the listener; calling this twice is an error
    pub fn disconnect(&self) -> Result<()> {
        if !self.node.connected.swap(false, Ordering::AcqRel) {
            return Err(Error::subscription_error(
                "subscription is already disconnected",
            ));
        }
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.unlink(&self.node);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.node.connected.load(Ordering::Acquire)
    }
}

struct WaitGuard<T>(Subscription<T>);

impl<T> Drop for WaitGuard<T> {
    fn drop(&mut self) {
        if self.0.is_connected() {
            let _ = self.0.disconnect();
        }
    }
}
