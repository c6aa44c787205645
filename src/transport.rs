//! Transport abstraction over the asynchronous message bus.
//!
//! The [`Transport`] trait exposes what the protocol core needs from the
//! bus: fire-and-forget send, request/reply with timeout, durable
//! subscription per connection address, and a broadcast channel for
//! operator control messages. [`InProcessTransport`] binds the trait to
//! tokio channels: one mpsc inbox per address, a oneshot per request.
//!
//! Failure semantics: `request` never fails at the call site. All
//! transport failures surface as a synthesized error envelope carrying the
//! original outgoing envelope for diagnostics, and the returned future
//! resolves exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::error::{SendFailure, classify, error_envelope};

/// Capacity of each per-address inbox.
const INBOX_CAPACITY: usize = 64;

/// One envelope delivered to a subscribed session, with an optional reply
/// channel for request/reply traffic.
#[derive(Debug)]
pub struct Delivery {
  /// The incoming envelope.
  pub envelope: Envelope,
  /// Reply channel; `None` for fire-and-forget sends. Dropping it without
  /// sending surfaces as a recipient failure at the requester.
  pub reply: Option<oneshot::Sender<Envelope>>,
}

/// Abstraction over the asynchronous message bus.
#[async_trait]
pub trait Transport: Send + Sync {
  /// At-most-once, fire-and-forget send. Silently dropped if no session is
  /// bound to the address.
  async fn send(&self, address: &str, envelope: Envelope);

  /// Request/reply with timeout.
  ///
  /// On failure (no handler, timeout, recipient failure) the returned
  /// envelope is a synthesized connection error carrying the original
  /// outgoing envelope as `body.originalMessage`. Resolves exactly once.
  async fn request(&self, address: &str, envelope: Envelope, timeout: Duration) -> Envelope;

  /// Binds a point-to-point subscription to an address, returning its
  /// inbox.
  ///
  /// If an existing binding exists for the address it is replaced: the old
  /// inbox drains its remaining deliveries and then closes
  /// (drain-then-replace, never concurrent double-registration).
  async fn subscribe(&self, address: &str) -> mpsc::Receiver<Delivery>;

  /// Adds a broadcast subscription to an address; every subscriber
  /// receives each published envelope.
  async fn subscribe_broadcast(&self, address: &str) -> mpsc::Receiver<Delivery>;

  /// Publishes an envelope to every broadcast subscriber of the address.
  async fn publish(&self, address: &str, envelope: Envelope);

  /// Releases the point-to-point binding for one address.
  async fn unregister(&self, address: &str);

  /// Releases every binding and broadcast subscription owned by this
  /// process (used on shutdown).
  async fn unregister_all(&self);
}

/// In-process transport over tokio channels.
///
/// Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct InProcessTransport {
  bindings: Arc<RwLock<HashMap<String, mpsc::Sender<Delivery>>>>,
  broadcast: Arc<RwLock<HashMap<String, Vec<mpsc::Sender<Delivery>>>>>,
}

impl InProcessTransport {
  /// Creates an empty bus.
  pub fn new() -> Self {
    Self::default()
  }

  fn failure_reply(failure: &SendFailure, outgoing: Envelope) -> Envelope {
    let mut reply = error_envelope(classify(failure));
    if let Some(body) = reply.body.as_mut() {
      body.original_message = Some(Box::new(outgoing));
    }
    reply
  }
}

#[async_trait]
impl Transport for InProcessTransport {
  async fn send(&self, address: &str, envelope: Envelope) {
    let sender = self.bindings.read().await.get(address).cloned();
    match sender {
      Some(sender) => {
        if sender
          .send(Delivery {
            envelope,
            reply: None,
          })
          .await
          .is_err()
        {
          debug!(address, "send to closed inbox dropped");
        }
      }
      None => trace!(address, "send to unbound address dropped"),
    }
  }

  async fn request(&self, address: &str, envelope: Envelope, timeout: Duration) -> Envelope {
    let sender = self.bindings.read().await.get(address).cloned();
    let Some(sender) = sender else {
      return Self::failure_reply(&SendFailure::NoHandlers, envelope);
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    let delivery = Delivery {
      envelope: envelope.clone(),
      reply: Some(reply_tx),
    };
    if sender.send(delivery).await.is_err() {
      return Self::failure_reply(&SendFailure::NoHandlers, envelope);
    }

    match tokio::time::timeout(timeout, reply_rx).await {
      Ok(Ok(reply)) => reply,
      Ok(Err(_)) => Self::failure_reply(&SendFailure::RecipientFailure, envelope),
      Err(_) => Self::failure_reply(&SendFailure::Timeout, envelope),
    }
  }

  async fn subscribe(&self, address: &str) -> mpsc::Receiver<Delivery> {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let previous = self.bindings.write().await.insert(address.to_string(), tx);
    if previous.is_some() {
      debug!(address, "replaced existing binding; old inbox will drain and close");
    }
    rx
  }

  async fn subscribe_broadcast(&self, address: &str) -> mpsc::Receiver<Delivery> {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    self
      .broadcast
      .write()
      .await
      .entry(address.to_string())
      .or_default()
      .push(tx);
    rx
  }

  async fn publish(&self, address: &str, envelope: Envelope) {
    let subscribers = self
      .broadcast
      .read()
      .await
      .get(address)
      .cloned()
      .unwrap_or_default();
    for subscriber in subscribers {
      let _ = subscriber
        .send(Delivery {
          envelope: envelope.clone(),
          reply: None,
        })
        .await;
    }
  }

  async fn unregister(&self, address: &str) {
    if self.bindings.write().await.remove(address).is_some() {
      debug!(address, "unregistered binding");
    }
  }

  async fn unregister_all(&self) {
    self.bindings.write().await.clear();
    self.broadcast.write().await.clear();
  }
}

impl std::fmt::Debug for InProcessTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InProcessTransport").finish_non_exhaustive()
  }
}
