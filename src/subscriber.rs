//! Subscriber channels.
//!
//! The core only knows how to emit an [`Event`] to an opaque
//! [`SubscriberId`]. The transport behind it (a WebSocket, the CLI's stdout)
//! implements [`EventSink`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::pipeline::{Diagnostics, MemoryUsage, Stage};

/// Opaque identifier of a connected subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the core sends to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PipelineStarted {
        run_id: String,
        port: String,
        board: String,
    },
    StageStarted {
        run_id: String,
        stage: Stage,
    },
    Log {
        run_id: String,
        stage: Stage,
        line: String,
    },
    PipelineSucceeded {
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory: Option<MemoryUsage>,
    },
    PipelineFailed {
        run_id: String,
        stage: Stage,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        diagnostics: Option<Diagnostics>,
        hints: Vec<String>,
    },
    SerialData {
        port: String,
        data: String,
    },
    SerialError {
        port: String,
        message: String,
    },
    SerialClosed {
        port: String,
    },
    ShellData {
        data: String,
    },
    ShellClosed,
    Error {
        message: String,
    },
}

impl Event {
    /// True for events that end a pipeline run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::PipelineSucceeded { .. } | Event::PipelineFailed { .. }
        )
    }
}

/// Delivery of events to subscribers.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers `event`, waiting while the subscriber's queue is full.
    ///
    /// Fails when the subscriber has gone away.
    async fn emit(&self, subscriber: &SubscriberId, event: Event) -> Result<()>;
}

/// Emits `event`, giving up once `wait` has passed with the subscriber's
/// queue still full.
pub async fn emit_within(
    sink: &dyn EventSink,
    subscriber: &SubscriberId,
    event: Event,
    wait: Duration,
) -> Result<()> {
    tokio::time::timeout(wait, sink.emit(subscriber, event))
        .await
        .map_err(|_| Error::NotFound(format!("subscriber {} is not draining events", subscriber)))?
}

/// In-process [`EventSink`] with one bounded queue per subscriber.
#[derive(Clone)]
pub struct ChannelHub {
    capacity: usize,
    senders: Arc<Mutex<HashMap<SubscriberId, mpsc::Sender<Event>>>>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a subscriber, replacing any previous registration.
    pub fn register(&self, id: SubscriberId) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        rx
    }

    /// Forgets a subscriber. Later emits to it fail.
    pub fn disconnect(&self, id: &SubscriberId) {
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn is_connected(&self, id: &SubscriberId) -> bool {
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventSink for ChannelHub {
    async fn emit(&self, subscriber: &SubscriberId, event: Event) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subscriber)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("subscriber {}", subscriber)))?;
        sender
            .send(event)
            .await
            .map_err(|_| Error::NotFound(format!("subscriber {}", subscriber)))
    }
}
