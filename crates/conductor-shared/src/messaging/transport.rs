//! # Message Transport Providers
//!
//! Enum-dispatch transport seam between the outbox dispatcher and the broker.
//! Concrete broker bindings are external collaborators; the in-memory
//! provider gives tests and single-process loopback deployments a complete
//! implementation with the same contract: publish is fire-and-forget per
//! topic, subscriptions receive every envelope published after they attach.

use std::sync::{Arc, Mutex};

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::envelope::Envelope;

/// Transport-level failure
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Envelope serialization failed: {0}")]
    Serialization(String),
}

impl TransportError {
    /// Whether the dispatcher should leave the row claimed for recovery
    /// (transient) or park it with a large backoff (permanent).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

/// A live subscription to a queue or topic
#[derive(Debug)]
pub struct TransportSubscription {
    pub queue: String,
    pub receiver: mpsc::UnboundedReceiver<Envelope>,
}

/// Messaging transport provider.
///
/// Enum dispatch, no trait objects: call sites stay monomorphic and new
/// broker bindings slot in as variants.
#[derive(Debug, Clone)]
pub enum MessageTransport {
    InMemory(InMemoryTransport),
}

impl MessageTransport {
    /// Create an in-memory loopback transport
    pub fn in_memory() -> Self {
        MessageTransport::InMemory(InMemoryTransport::new())
    }

    /// Create an in-memory transport that records published envelopes
    pub fn in_memory_recording() -> Self {
        MessageTransport::InMemory(InMemoryTransport::recording())
    }

    /// Publish an envelope to a topic
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), TransportError> {
        match self {
            MessageTransport::InMemory(t) => t.publish(topic, envelope),
        }
    }

    /// Subscribe to a queue; every envelope published to it after this call
    /// is delivered to the returned receiver.
    pub fn subscribe(&self, queue: &str) -> TransportSubscription {
        match self {
            MessageTransport::InMemory(t) => t.subscribe(queue),
        }
    }

    /// Provider name for logging and metrics
    pub fn provider_name(&self) -> &'static str {
        match self {
            MessageTransport::InMemory(_) => "in-memory",
        }
    }

    /// Access the in-memory provider, if that is what this transport is
    pub fn as_in_memory(&self) -> Option<&InMemoryTransport> {
        match self {
            MessageTransport::InMemory(t) => Some(t),
        }
    }
}

/// Shared state behind all clones of an [`InMemoryTransport`]
#[derive(Debug)]
struct InMemoryState {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>,
    fail_topics: DashSet<String>,
    recording: bool,
    published: Mutex<Vec<(String, Envelope)>>,
}

/// In-memory topic fan-out transport
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    inner: Arc<InMemoryState>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_recording(false)
    }

    /// A transport that keeps a log of everything published, for assertions
    pub fn recording() -> Self {
        Self::with_recording(true)
    }

    fn with_recording(recording: bool) -> Self {
        Self {
            inner: Arc::new(InMemoryState {
                subscribers: DashMap::new(),
                fail_topics: DashSet::new(),
                recording,
                published: Mutex::new(Vec::new()),
            }),
        }
    }

    fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), TransportError> {
        if self.inner.fail_topics.contains(topic) {
            return Err(TransportError::Unavailable(format!(
                "injected failure for topic {topic}"
            )));
        }

        if self.inner.recording {
            self.inner
                .published
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((topic.to_string(), envelope.clone()));
        }

        match self.inner.subscribers.get_mut(topic) {
            Some(mut senders) => {
                senders.retain(|tx| tx.send(envelope.clone()).is_ok());
            }
            None => {
                debug!(topic = %topic, "No subscribers for topic, envelope dropped");
            }
        }

        Ok(())
    }

    fn subscribe(&self, queue: &str) -> TransportSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        TransportSubscription {
            queue: queue.to_string(),
            receiver: rx,
        }
    }

    /// Make every publish to `topic` fail until cleared
    pub fn inject_failure(&self, topic: &str) {
        self.inner.fail_topics.insert(topic.to_string());
    }

    /// Clear an injected failure
    pub fn clear_failure(&self, topic: &str) {
        self.inner.fail_topics.remove(topic);
    }

    /// Snapshot of recorded publishes (empty unless built with `recording`)
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
