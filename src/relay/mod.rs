//! Live telemetry relay.
//!
//! Each relay is a background task moving bytes from one source (a serial
//! port or a shell) to one subscriber. Relays are owned by a
//! [`RelayRegistry`], which holds their stop signal. There is at most one
//! relay per (subscriber, source) pair.

mod serial;
mod shell;

pub use serial::{relay_serial, RelayExit, SerialOpener, SerialPort, TtyOpener, TtyPort};
pub use shell::relay_shell;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SerialConfig;
use crate::error::{Error, Result};
use crate::session::SessionHandle;
use crate::subscriber::{emit_within, Event, EventSink, SubscriberId};

/// Moves the longest decodable prefix out of `buf`.
///
/// An incomplete multi-byte sequence at the end stays in `buf` for the next
/// call. Invalid bytes elsewhere become U+FFFD.
pub fn drain_utf8(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut consumed = 0;
    loop {
        match std::str::from_utf8(&buf[consumed..]) {
            Ok(s) => {
                out.push_str(s);
                consumed = buf.len();
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if let Ok(s) = std::str::from_utf8(&buf[consumed..consumed + valid]) {
                    out.push_str(s);
                }
                consumed += valid;
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        consumed += len;
                    }
                    None => break,
                }
            }
        }
    }
    buf.drain(..consumed);
    out
}

/// How long a stopping relay, or a relay that failed to start, waits for
/// room in the subscriber's queue before dropping its notice.
const CLOSING_GRACE: Duration = Duration::from_millis(100);

/// Outcome of handing one event to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// The subscriber has gone away.
    Gone,
    /// The relay was stopped while the subscriber's queue was full.
    Stopped,
}

/// Emits `event` unless `cancel` fires first.
///
/// A subscriber that stops draining its queue can therefore never keep a
/// relay from stopping. Once `cancel` has fired, the event gets
/// [`CLOSING_GRACE`] to go through.
async fn deliver(
    sink: &Arc<dyn EventSink>,
    subscriber: &SubscriberId,
    event: Event,
    cancel: &CancellationToken,
) -> Delivery {
    let sent = |r: Result<()>| if r.is_ok() { Delivery::Sent } else { Delivery::Gone };
    if cancel.is_cancelled() {
        return match tokio::time::timeout(CLOSING_GRACE, sink.emit(subscriber, event)).await {
            Ok(r) => sent(r),
            Err(_) => {
                tracing::debug!(subscriber = %subscriber, "subscriber backlogged, dropping closing event");
                Delivery::Stopped
            }
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Stopped,
        r = sink.emit(subscriber, event) => sent(r),
    }
}

/// A live output source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// A serial port path.
    Serial(String),
    /// The shell of a user's sandbox.
    Shell(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Serial(port) => write!(f, "serial:{}", port),
            Source::Shell(user) => write!(f, "shell:{}", user),
        }
    }
}

type RelayKey = (SubscriberId, Source);

struct ActiveRelay {
    id: u64,
    cancel: CancellationToken,
    input: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<RelayExit>,
}

/// Owns every running relay.
#[derive(Clone)]
pub struct RelayRegistry {
    sink: Arc<dyn EventSink>,
    opener: Arc<dyn SerialOpener>,
    serial: SerialConfig,
    relays: Arc<Mutex<HashMap<RelayKey, ActiveRelay>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayRegistry {
    pub fn new(sink: Arc<dyn EventSink>, opener: Arc<dyn SerialOpener>, serial: SerialConfig) -> Self {
        Self {
            sink,
            opener,
            serial,
            relays: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Opens `port` and starts relaying it to `subscriber`.
    ///
    /// An existing serial relay of the same pair is stopped first, so the
    /// port is closed before it is opened again.
    pub async fn start_serial(
        &self,
        subscriber: &SubscriberId,
        port: &str,
        baud: Option<u32>,
    ) -> Result<()> {
        let key = (subscriber.clone(), Source::Serial(port.to_string()));
        self.stop_key(&key).await;

        let baud = baud.unwrap_or(self.serial.default_baud);
        let handle = match self.opener.open(port, baud).await {
            Ok(handle) => handle,
            Err(e) => {
                let event = Event::SerialError {
                    port: port.to_string(),
                    message: e.to_string(),
                };
                self.notify(subscriber, event).await;
                return Err(e);
            }
        };

        let (input_tx, input_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let fut = relay_serial(
            port.to_string(),
            handle,
            subscriber.clone(),
            self.sink.clone(),
            input_rx,
            cancel.clone(),
            self.serial.clone(),
        );
        self.spawn(key, cancel, input_tx, fut);
        tracing::info!(subscriber = %subscriber, port = %port, baud, "serial relay started");
        Ok(())
    }

    /// Opens a shell on `session` and starts relaying it to `subscriber`.
    ///
    /// The relay takes ownership of the session. If the shell cannot be
    /// opened, the session is closed and the error is reported once.
    pub async fn start_shell(&self, subscriber: &SubscriberId, mut session: SessionHandle) -> Result<()> {
        let user = session.identity().raw().to_string();
        let key = (subscriber.clone(), Source::Shell(user.clone()));
        self.stop_key(&key).await;

        let shell = match session.open_shell().await {
            Ok(shell) => shell,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(user = %user, error = %close_err, "failed to close session");
                }
                let event = Event::Error {
                    message: e.to_string(),
                };
                self.notify(subscriber, event).await;
                return Err(e);
            }
        };

        let (input_tx, input_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let fut = relay_shell(
            session,
            shell,
            subscriber.clone(),
            self.sink.clone(),
            input_rx,
            cancel.clone(),
        );
        self.spawn(key, cancel, input_tx, fut);
        tracing::info!(subscriber = %subscriber, user = %user, "shell relay started");
        Ok(())
    }

    /// Writes subscriber input to a source.
    pub async fn send(&self, subscriber: &SubscriberId, source: &Source, data: Vec<u8>) -> Result<()> {
        let input = self
            .lock()
            .get(&(subscriber.clone(), source.clone()))
            .map(|r| r.input.clone())
            .ok_or_else(|| Error::NotFound(format!("no {} relay for {}", source, subscriber)))?;
        input
            .send(data)
            .await
            .map_err(|_| Error::NotFound(format!("{} relay for {} has ended", source, subscriber)))
    }

    /// Stops one relay and waits for it to release its source.
    pub async fn stop(&self, subscriber: &SubscriberId, source: &Source) -> bool {
        self.stop_key(&(subscriber.clone(), source.clone())).await
    }

    /// Stops every relay of a disconnected subscriber. Returns how many ran.
    pub async fn stop_subscriber(&self, subscriber: &SubscriberId) -> usize {
        let keys: Vec<RelayKey> = self
            .lock()
            .keys()
            .filter(|(s, _)| s == subscriber)
            .cloned()
            .collect();
        let mut stopped = 0;
        for key in keys {
            if self.stop_key(&key).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Sources currently relayed to `subscriber`.
    pub fn active(&self, subscriber: &SubscriberId) -> Vec<Source> {
        self.lock()
            .keys()
            .filter(|(s, _)| s == subscriber)
            .map(|(_, source)| source.clone())
            .collect()
    }

    async fn notify(&self, subscriber: &SubscriberId, event: Event) {
        if let Err(e) = emit_within(self.sink.as_ref(), subscriber, event, CLOSING_GRACE).await {
            tracing::debug!(subscriber = %subscriber, error = %e, "notice not delivered");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RelayKey, ActiveRelay>> {
        self.relays.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn<F>(&self, key: RelayKey, cancel: CancellationToken, input: mpsc::Sender<Vec<u8>>, fut: F)
    where
        F: std::future::Future<Output = RelayExit> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let relays = Arc::clone(&self.relays);
        let task_key = key.clone();
        // The entry is inserted before the task can finish and remove it.
        let mut map = self.lock();
        let task = tokio::spawn(async move {
            let exit = fut.await;
            let mut map = relays.lock().unwrap_or_else(|e| e.into_inner());
            if map.get(&task_key).is_some_and(|r| r.id == id) {
                map.remove(&task_key);
            }
            exit
        });
        map.insert(
            key,
            ActiveRelay {
                id,
                cancel,
                input,
                task,
            },
        );
    }

    async fn stop_key(&self, key: &RelayKey) -> bool {
        let Some(relay) = self.lock().remove(key) else {
            return false;
        };
        relay.cancel.cancel();
        match relay.task.await {
            Ok(exit) => tracing::debug!(source = %key.1, exit = ?exit, "relay stopped"),
            Err(e) => tracing::error!(source = %key.1, error = %e, "relay task failed"),
        }
        true
    }
}
