use crate::model::ServerEvent;
use futures::StreamExt;
use log::{debug, info, warn};
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::{runtime::Handle, sync::mpsc::UnboundedSender, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        let initial_delay = initial_delay.max(MIN_RECONNECT_DELAY);
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.saturating_mul(2);
        if next > self.max_delay {
            self.max_delay
        } else {
            next
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Message(ServerEvent),
    Disconnected { reason: String },
}

struct ActiveChannel {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The one WebSocket connection carrying task events from the backend.
/// Reconnects on its own; every new session starts with a fresh
/// `initial_state` from the server, so nothing is replayed client-side.
pub struct TransportChannel {
    runtime: Handle,
    url: Url,
    policy: ReconnectPolicy,
    active: Mutex<Option<ActiveChannel>>,
}

impl TransportChannel {
    pub fn new(runtime: Handle, url: Url, policy: ReconnectPolicy) -> Self {
        Self {
            runtime,
            url,
            policy,
            active: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Starts the connection loop. Returns `false` without doing anything if
    /// a loop is already running.
    pub fn connect(&self, sink: UnboundedSender<ChannelEvent>) -> bool {
        let mut active = self.lock_active();
        if let Some(existing) = active.as_ref() {
            if !existing.handle.is_finished() {
                debug!("Task channel to {} already active", self.url);
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let handle = self.runtime.spawn(run_channel(
            self.url.clone(),
            self.policy,
            sink,
            cancel.clone(),
        ));
        *active = Some(ActiveChannel { cancel, handle });
        true
    }

    pub async fn disconnect(&self) {
        let active = self.lock_active().take();
        let Some(active) = active else {
            return;
        };
        active.cancel.cancel();
        if let Err(err) = active.handle.await {
            if !err.is_cancelled() {
                warn!("Task channel loop ended abnormally: {err}");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_active()
            .as_ref()
            .map(|active| !active.handle.is_finished())
            .unwrap_or(false)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveChannel>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(active) = self.lock_active().take() {
            active.cancel.cancel();
        }
    }
}

enum SessionEnd {
    Cancelled,
    SinkClosed,
    ConnectFailed(String),
    Dropped(String),
}

async fn run_channel(
    url: Url,
    policy: ReconnectPolicy,
    sink: UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let mut delay = policy.initial_delay;
    loop {
        match run_session(&url, &sink, &cancel).await {
            SessionEnd::Cancelled => break,
            SessionEnd::SinkClosed => {
                debug!("Task channel consumer went away; stopping");
                break;
            }
            SessionEnd::ConnectFailed(reason) => {
                warn!("Task channel connect to {url} failed: {reason}");
            }
            SessionEnd::Dropped(reason) => {
                warn!("Task channel to {url} dropped: {reason}");
                delay = policy.initial_delay;
                if sink.send(ChannelEvent::Disconnected { reason }).is_err() {
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = policy.next_delay(delay);
    }
    info!("Task channel to {url} closed");
}

async fn run_session(
    url: &Url,
    sink: &UnboundedSender<ChannelEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        connected = connect_async(url.as_str()) => connected,
    };
    let (mut socket, _) = match connected {
        Ok(value) => value,
        Err(err) => return SessionEnd::ConnectFailed(err.to_string()),
    };

    info!("Task channel connected to {url}");
    if sink.send(ChannelEvent::Connected).is_err() {
        let _ = socket.close(None).await;
        return SessionEnd::SinkClosed;
    }

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                return SessionEnd::Cancelled;
            }
            frame = socket.next() => frame,
        };

        let delivered = match frame {
            Some(Ok(Message::Text(text))) => forward_frame(text.as_str(), sink),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => forward_frame(text, sink),
                Err(_) => {
                    warn!("Dropping non UTF-8 binary frame ({} bytes)", bytes.len());
                    true
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|frame| frame.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "server closed the connection".to_string());
                return SessionEnd::Dropped(reason);
            }
            Some(Ok(_)) => true,
            Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
            None => return SessionEnd::Dropped("connection closed".to_string()),
        };

        if !delivered {
            let _ = socket.close(None).await;
            return SessionEnd::SinkClosed;
        }
    }
}

/// Returns `false` only when the consumer is gone. Malformed frames are
/// logged and skipped.
fn forward_frame(text: &str, sink: &UnboundedSender<ChannelEvent>) -> bool {
    match ServerEvent::parse(text) {
        Ok(event) => sink.send(ChannelEvent::Message(event)).is_ok(),
        Err(err) => {
            warn!("Dropping malformed task frame: {err}");
            true
        }
    }
}
