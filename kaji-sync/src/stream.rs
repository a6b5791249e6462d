//! Revision stream consumer.
//!
//! [`StreamMachine`] holds the pure part: connection state, last-seen
//! revision with gap detection, and reconnect backoff. [`StreamHandle`] runs
//! it against an [`EventTransport`] on a tokio task and hands accepted entity
//! tags to the coalescer.
//!
//! State flow:
//!
//! ```text
//! disconnected → connecting → connected → (error/close) → reconnect-scheduled → connecting → …
//! ```
//!
//! `disconnected` is terminal and only reached through [`StreamHandle::stop`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use kaji_core::{EntityTag, RevisionEvent};

use crate::coalescer::CoalescerHandle;
use crate::error::{MessageError, TransportError};
use crate::sse::{SseDecoder, SseFrame};
use crate::transport::{EventLines, EventTransport};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_TEAM_STATE_CHANGED: &str = "team-state-changed";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamState::Disconnected => "disconnected",
            StreamState::Connecting => "connecting",
            StreamState::Connected => "connected",
            StreamState::ReconnectScheduled => "reconnect-scheduled",
        })
    }
}

/// Snapshot published to observers after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: StreamState,
    /// 0 means "unknown" (nothing observed since the session started).
    pub last_seen: u64,
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect delay: `min`, `2·min`, `4·min`, … capped at `max`.
/// No retry limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min }
    }

    /// Delay for the upcoming attempt; doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self
            .next
            .checked_mul(2)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

// ---------------------------------------------------------------------------
// Revision tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionDecision {
    /// In order: refresh what this entity affects.
    Apply(EntityTag),
    /// Gap or epoch mismatch: local cache may have diverged, refresh everything.
    Resync,
    /// Duplicate or stale.
    Ignore,
}

/// Last-seen revision with gap detection. 0 is the "unknown" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevisionTracker {
    last_seen: u64,
}

impl RevisionTracker {
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Adopt the connect-time revision of a new connection epoch.
    ///
    /// If the previous epoch had a known revision and the server now reports
    /// a different one, changes happened (or the counter moved) while we were
    /// not listening.
    pub fn on_connected(&mut self, revision: u64) -> RevisionDecision {
        let previous = self.last_seen;
        self.last_seen = revision;
        if previous != 0 && revision != previous {
            RevisionDecision::Resync
        } else {
            RevisionDecision::Ignore
        }
    }

    pub fn observe(&mut self, revision: u64, entity: EntityTag) -> RevisionDecision {
        if revision == 0 || (self.last_seen != 0 && revision <= self.last_seen) {
            return RevisionDecision::Ignore;
        }
        let in_order = self.last_seen == 0 || revision == self.last_seen + 1;
        self.last_seen = revision;
        if in_order {
            RevisionDecision::Apply(entity)
        } else {
            RevisionDecision::Resync
        }
    }

    pub fn reset(&mut self) {
        self.last_seen = 0;
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Connected {
        revision: u64,
        team_id: Option<String>,
    },
    Changed(RevisionEvent),
    Heartbeat,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedPayload {
    #[serde(default)]
    revision: Value,
    #[serde(default)]
    team_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangedPayload {
    #[serde(default)]
    revision: Value,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    changed_at: Option<String>,
    #[serde(default)]
    hints: BTreeMap<String, Value>,
}

impl StreamMessage {
    pub fn from_frame(frame: &SseFrame) -> Result<Self, MessageError> {
        match frame.event.as_str() {
            EVENT_CONNECTED => {
                let payload: ConnectedPayload = serde_json::from_str(&frame.data)?;
                let revision =
                    revision_from(&payload.revision).ok_or(MessageError::InvalidRevision)?;
                Ok(StreamMessage::Connected {
                    revision,
                    team_id: payload.team_id,
                })
            }
            EVENT_TEAM_STATE_CHANGED => {
                let payload: ChangedPayload = serde_json::from_str(&frame.data)?;
                let revision = revision_from(&payload.revision)
                    .filter(|revision| *revision > 0)
                    .ok_or(MessageError::InvalidRevision)?;
                let entity = payload
                    .entity
                    .map(EntityTag::from)
                    .unwrap_or(EntityTag::Unknown);
                let hints = payload
                    .hints
                    .into_iter()
                    .filter_map(|(key, value)| match value {
                        Value::String(text) => Some((key, text)),
                        _ => None,
                    })
                    .collect();
                Ok(StreamMessage::Changed(RevisionEvent {
                    revision,
                    entity,
                    team_id: payload.team_id,
                    changed_at: payload
                        .changed_at
                        .as_deref()
                        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                        .map(|at| at.with_timezone(&Utc)),
                    hints,
                }))
            }
            EVENT_HEARTBEAT => Ok(StreamMessage::Heartbeat),
            other => Err(MessageError::UnknownEvent(other.to_string())),
        }
    }
}

/// Non-negative integral revision from a JSON integer or integral float.
fn revision_from(value: &Value) -> Option<u64> {
    if let Some(revision) = value.as_u64() {
        return Some(revision);
    }
    let revision = value.as_f64()?;
    (revision.is_finite() && revision >= 0.0 && revision.fract() == 0.0 && revision < u64::MAX as f64)
        .then_some(revision as u64)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Side effect requested by the machine; executed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Invalidate(EntityTag),
    ResyncAll,
}

#[derive(Debug, Clone)]
pub struct StreamMachine {
    state: StreamState,
    tracker: RevisionTracker,
    backoff: Backoff,
}

impl StreamMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: StreamState::Disconnected,
            tracker: RevisionTracker::default(),
            backoff,
        }
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            state: self.state,
            last_seen: self.tracker.last_seen(),
        }
    }

    pub fn begin_connect(&mut self) {
        self.state = StreamState::Connecting;
    }

    pub fn on_message(&mut self, message: &StreamMessage) -> Option<StreamAction> {
        match message {
            StreamMessage::Connected { revision, team_id } => {
                self.state = StreamState::Connected;
                self.backoff.reset();
                let previous = self.tracker.last_seen();
                let decision = self.tracker.on_connected(*revision);
                tracing::info!(
                    revision,
                    previous,
                    team_id = team_id.as_deref().unwrap_or(""),
                    "event stream connected",
                );
                (decision == RevisionDecision::Resync).then(|| {
                    tracing::info!(previous, revision, "revision moved while disconnected; full resync");
                    StreamAction::ResyncAll
                })
            }
            StreamMessage::Changed(event) => {
                let previous = self.tracker.last_seen();
                match self.tracker.observe(event.revision, event.entity) {
                    RevisionDecision::Apply(entity) => {
                        tracing::debug!(revision = event.revision, entity = %entity, "team state changed");
                        Some(StreamAction::Invalidate(entity))
                    }
                    RevisionDecision::Resync => {
                        tracing::info!(
                            expected = previous + 1,
                            observed = event.revision,
                            "revision gap detected; full resync",
                        );
                        Some(StreamAction::ResyncAll)
                    }
                    RevisionDecision::Ignore => {
                        tracing::debug!(revision = event.revision, last_seen = previous, "stale revision ignored");
                        None
                    }
                }
            }
            StreamMessage::Heartbeat => None,
        }
    }

    /// Connection dropped: schedule the next attempt and return its delay.
    pub fn on_disconnect(&mut self) -> Duration {
        self.state = StreamState::ReconnectScheduled;
        self.backoff.next_delay()
    }

    /// Terminal teardown: back to the never-started state.
    pub fn stop(&mut self) {
        self.state = StreamState::Disconnected;
        self.tracker.reset();
        self.backoff.reset();
    }
}

// ---------------------------------------------------------------------------
// Task adapter
// ---------------------------------------------------------------------------

enum ConnectionEnd {
    Shutdown,
    Closed,
    Failed(TransportError),
}

/// Owner of a running stream consumer task.
pub struct StreamHandle {
    shutdown: broadcast::Sender<()>,
    status: watch::Receiver<StreamStatus>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn spawn(
        transport: Arc<dyn EventTransport>,
        coalescer: CoalescerHandle,
        backoff: Backoff,
    ) -> Self {
        let machine = StreamMachine::new(backoff);
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let join = tokio::spawn(stream_task(
            transport,
            coalescer,
            machine,
            status_tx,
            shutdown_rx,
        ));
        Self {
            shutdown: shutdown_tx,
            status: status_rx,
            join: Some(join),
        }
    }

    pub fn status(&self) -> StreamStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.status.clone()
    }

    /// Close the connection and cancel any pending reconnect. Safe to call
    /// repeatedly.
    pub async fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.shutdown.send(());
        if let Err(err) = join.await {
            tracing::warn!(error = %err, "event stream task join failure");
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

async fn stream_task(
    transport: Arc<dyn EventTransport>,
    coalescer: CoalescerHandle,
    mut machine: StreamMachine,
    status_tx: watch::Sender<StreamStatus>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut decoder = SseDecoder::new();

    loop {
        machine.begin_connect();
        status_tx.send_replace(machine.status());

        let opened = tokio::select! {
            _ = shutdown_rx.recv() => break,
            opened = transport.open() => opened,
        };
        match opened {
            Ok(mut lines) => {
                decoder.reset();
                let end = pump_connection(
                    lines.as_mut(),
                    &mut decoder,
                    &mut machine,
                    &coalescer,
                    &status_tx,
                    &mut shutdown_rx,
                )
                .await;
                match end {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::Closed => tracing::info!("event stream closed by server"),
                    ConnectionEnd::Failed(err) => {
                        tracing::warn!(error = %err, "event stream failed")
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "event stream connect failed"),
        }

        let delay = machine.on_disconnect();
        status_tx.send_replace(machine.status());
        tracing::warn!(delay_ms = delay.as_millis() as u64, "event stream reconnect scheduled");

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    machine.stop();
    status_tx.send_replace(machine.status());
    tracing::debug!("event stream consumer stopped");
}

async fn pump_connection(
    lines: &mut dyn EventLines,
    decoder: &mut SseDecoder,
    machine: &mut StreamMachine,
    coalescer: &CoalescerHandle,
    status_tx: &watch::Sender<StreamStatus>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> ConnectionEnd {
    loop {
        let line = tokio::select! {
            _ = shutdown_rx.recv() => return ConnectionEnd::Shutdown,
            line = lines.next_line() => line,
        };
        let line = match line {
            None => return ConnectionEnd::Closed,
            Some(Err(err)) => return ConnectionEnd::Failed(err),
            Some(Ok(line)) => line,
        };
        let Some(frame) = decoder.push_line(&line) else {
            continue;
        };

        let message = match StreamMessage::from_frame(&frame) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(event = %frame.event, error = %err, "dropping malformed stream message");
                continue;
            }
        };
        match machine.on_message(&message) {
            Some(StreamAction::Invalidate(entity)) => coalescer.enqueue(entity),
            Some(StreamAction::ResyncAll) => coalescer.resync_all(),
            None => {}
        }
        status_tx.send_replace(machine.status());
    }
}
