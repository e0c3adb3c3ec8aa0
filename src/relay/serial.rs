//! Serial port access and the batching serial relay.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SerialConfig;
use crate::error::{Error, Result};
use crate::process::run_captured;
use crate::subscriber::{Event, EventSink, SubscriberId};

use super::{deliver, drain_utf8, Delivery};

/// An open serial device in non-blocking mode.
pub trait SerialPort: Send {
    /// Reads whatever is available. Returns 0 when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Releases the device. Further calls are no-ops.
    fn close(&mut self) -> std::io::Result<()>;
}

/// Opens serial devices.
#[async_trait]
pub trait SerialOpener: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialPort>>;
}

/// Opens host tty devices, configuring line settings with `stty`.
#[derive(Debug, Clone, Default)]
pub struct TtyOpener;

#[async_trait]
impl SerialOpener for TtyOpener {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
        let serial_err = |reason: String| Error::Serial {
            port: port.to_string(),
            reason,
        };

        let mut stty = Command::new("stty");
        stty.args(["-F", port])
            .arg(baud.to_string())
            .args(["raw", "-echo"]);
        let out = run_captured(&mut stty, Duration::from_secs(5)).await?;
        if !out.success() {
            return Err(serial_err(out.stderr.trim().to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(port)
            .map_err(|e| serial_err(e.to_string()))?;

        tracing::info!(port = %port, baud, "serial port opened");
        Ok(Box::new(TtyPort {
            port: port.to_string(),
            file: Some(file),
        }))
    }
}

/// A host tty opened with `O_NONBLOCK`.
pub struct TtyPort {
    port: String,
    file: Option<File>,
}

impl SerialPort for TtyPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Err(ErrorKind::NotConnected.into());
        };
        match file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(ErrorKind::NotConnected.into());
        };
        file.write_all(data)
    }

    fn close(&mut self) -> std::io::Result<()> {
        if self.file.take().is_some() {
            tracing::info!(port = %self.port, "serial port closed");
        }
        Ok(())
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    Stopped,
    SourceClosed,
    SourceError,
    SubscriberGone,
}

/// Pumps bytes from `port` to `subscriber` until stopped.
///
/// Reads on every poll tick and flushes the accumulated bytes at most once
/// per flush interval. The relay owns `port` and is the only code that
/// closes it. A subscriber that stops draining its queue does not keep the
/// relay from stopping.
pub async fn relay_serial(
    port_name: String,
    mut port: Box<dyn SerialPort>,
    subscriber: SubscriberId,
    sink: Arc<dyn EventSink>,
    mut input: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    config: SerialConfig,
) -> RelayExit {
    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let flush_every = Duration::from_millis(config.flush_interval_ms);
    let mut chunk = vec![0u8; config.read_chunk.max(1)];
    let mut pending: Vec<u8> = Vec::new();
    let mut last_flush = Instant::now();
    let mut input_open = true;
    let out = Outlet {
        port: &port_name,
        subscriber: &subscriber,
        sink: &sink,
        cancel: &cancel,
    };

    let exit = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayExit::Stopped,
            data = input.recv(), if input_open => match data {
                Some(bytes) => {
                    if let Err(e) = port.write(&bytes) {
                        tracing::warn!(port = %port_name, error = %e, "serial write failed");
                        out.error(&e).await;
                        break RelayExit::SourceError;
                    }
                }
                None => input_open = false,
            },
            _ = poll.tick() => {
                match port.read(&mut chunk) {
                    Ok(n) => pending.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        tracing::warn!(port = %port_name, error = %e, "serial read failed");
                        out.flush(&mut pending, true).await;
                        out.error(&e).await;
                        break RelayExit::SourceError;
                    }
                }
                if !pending.is_empty() && last_flush.elapsed() >= flush_every {
                    last_flush = Instant::now();
                    match out.flush(&mut pending, false).await {
                        Delivery::Sent => {}
                        Delivery::Gone => break RelayExit::SubscriberGone,
                        Delivery::Stopped => break RelayExit::Stopped,
                    }
                }
            }
        }
    };

    if exit == RelayExit::Stopped {
        out.flush(&mut pending, true).await;
    }
    if let Err(e) = port.close() {
        tracing::warn!(port = %port_name, error = %e, "failed to close serial port");
    }
    let closed = Event::SerialClosed {
        port: port_name.clone(),
    };
    if deliver(&sink, &subscriber, closed, &cancel).await != Delivery::Sent {
        tracing::debug!(subscriber = %subscriber, port = %port_name, "close notice not delivered");
    }
    tracing::debug!(port = %port_name, subscriber = %subscriber, exit = ?exit, "serial relay finished");
    exit
}

/// Where one serial relay sends its events.
struct Outlet<'a> {
    port: &'a str,
    subscriber: &'a SubscriberId,
    sink: &'a Arc<dyn EventSink>,
    cancel: &'a CancellationToken,
}

impl Outlet<'_> {
    /// Sends the decodable part of `pending`. With `last`, any incomplete
    /// tail is sent lossily too.
    async fn flush(&self, pending: &mut Vec<u8>, last: bool) -> Delivery {
        let mut data = drain_utf8(pending);
        if last && !pending.is_empty() {
            data.push_str(&String::from_utf8_lossy(pending));
            pending.clear();
        }
        if data.is_empty() {
            return Delivery::Sent;
        }
        let event = Event::SerialData {
            port: self.port.to_string(),
            data,
        };
        deliver(self.sink, self.subscriber, event, self.cancel).await
    }

    async fn error(&self, e: &std::io::Error) {
        let event = Event::SerialError {
            port: self.port.to_string(),
            message: e.to_string(),
        };
        if deliver(self.sink, self.subscriber, event, self.cancel).await != Delivery::Sent {
            tracing::debug!(subscriber = %self.subscriber, port = %self.port, "error notice not delivered");
        }
    }
}
