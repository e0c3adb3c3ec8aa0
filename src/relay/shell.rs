//! Interactive shell relay.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionHandle, ShellChannel};
use crate::subscriber::{Event, EventSink, SubscriberId};

use super::{deliver, drain_utf8, Delivery};
use super::serial::RelayExit;

const READ_CHUNK: usize = 4096;

/// Forwards shell output to `subscriber` as soon as it arrives.
///
/// On exit the shell channel and then the session are closed. A subscriber
/// that stops draining its queue does not keep the relay from stopping.
pub async fn relay_shell(
    mut session: SessionHandle,
    shell: Box<dyn ShellChannel>,
    subscriber: SubscriberId,
    sink: Arc<dyn EventSink>,
    mut input: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> RelayExit {
    let user = session.identity().raw().to_string();
    let mut pending: Vec<u8> = Vec::new();
    let mut input_open = true;

    let exit = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayExit::Stopped,
            data = input.recv(), if input_open => match data {
                Some(bytes) => {
                    if let Err(e) = shell.write(&bytes).await {
                        tracing::debug!(user = %user, error = %e, "shell write failed");
                        break RelayExit::SourceError;
                    }
                }
                None => input_open = false,
            },
            read = async {
                let mut buf = vec![0u8; READ_CHUNK];
                shell.read(&mut buf).await.map(|n| {
                    buf.truncate(n);
                    buf
                })
            } => match read {
                Ok(bytes) if bytes.is_empty() => break RelayExit::SourceClosed,
                Ok(bytes) => {
                    pending.extend_from_slice(&bytes);
                    let data = drain_utf8(&mut pending);
                    if data.is_empty() {
                        continue;
                    }
                    match deliver(&sink, &subscriber, Event::ShellData { data }, &cancel).await {
                        Delivery::Sent => {}
                        Delivery::Gone => break RelayExit::SubscriberGone,
                        Delivery::Stopped => break RelayExit::Stopped,
                    }
                }
                Err(e) => {
                    tracing::debug!(user = %user, error = %e, "shell read failed");
                    break RelayExit::SourceError;
                }
            },
        }
    };

    if let Err(e) = shell.close().await {
        tracing::warn!(user = %user, error = %e, "failed to close shell channel");
    }
    if let Err(e) = session.close().await {
        tracing::warn!(user = %user, error = %e, "failed to close session");
    }
    if deliver(&sink, &subscriber, Event::ShellClosed, &cancel).await != Delivery::Sent {
        tracing::debug!(subscriber = %subscriber, user = %user, "close notice not delivered");
    }
    tracing::debug!(user = %user, subscriber = %subscriber, exit = ?exit, "shell relay finished");
    exit
}
