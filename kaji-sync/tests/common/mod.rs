//! Scripted transports and a recording cache shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use kaji_core::CacheRegion;
use kaji_sync::{
    CacheInvalidator, EventLines, EventTransport, HttpRequest, HttpResponse, HttpTransport,
    TransportError,
};

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Replies from a queue and records every request that reached the wire.
#[derive(Default)]
pub struct ScriptedHttp {
    replies: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, status: u16, etag: Option<&str>, body: &str) -> &Self {
        self.replies.lock().unwrap().push_back(Ok(HttpResponse {
            status,
            etag: etag.map(str::to_string),
            body: body.to_string(),
        }));
        self
    }

    pub fn fail(&self, err: TransportError) -> &Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedHttp {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("no scripted reply left".into())))
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Line(String),
    Pause(Duration),
}

#[derive(Debug, Clone, Copy, Default)]
pub enum End {
    Close,
    Fail,
    #[default]
    HoldOpen,
}

/// Lines one accepted connection will deliver, with optional pauses.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: VecDeque<Step>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// One SSE frame written the way the server does (`event:name`, no space).
    pub fn event(mut self, name: &str, data: &str) -> Self {
        self.steps.push_back(Step::Line(format!("event:{name}")));
        self.steps.push_back(Step::Line(format!("data:{data}")));
        self.steps.push_back(Step::Line(String::new()));
        self
    }

    pub fn connected(self, revision: u64) -> Self {
        self.event(
            "connected",
            &format!(r#"{{"teamId":"team-1","revision":{revision},"changedAt":"2026-10-16T09:00:00Z"}}"#),
        )
    }

    pub fn changed(self, revision: u64, entity: &str) -> Self {
        self.event(
            "team-state-changed",
            &format!(
                r#"{{"teamId":"team-1","entity":"{entity}","revision":{revision},"changedAt":"2026-10-16T09:00:00Z","hints":{{}}}}"#
            ),
        )
    }

    pub fn raw(mut self, line: &str) -> Self {
        self.steps.push_back(Step::Line(line.to_string()));
        self
    }

    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push_back(Step::Pause(duration));
        self
    }

    pub fn then_close(self) -> Connection {
        Connection::Open(self, End::Close)
    }

    pub fn then_fail(self) -> Connection {
        Connection::Open(self, End::Fail)
    }

    pub fn then_hold(self) -> Connection {
        Connection::Open(self, End::HoldOpen)
    }
}

pub enum Connection {
    Refused,
    Open(Script, End),
}

/// Hands out scripted connections in order; refuses once the script runs out.
#[derive(Default)]
pub struct ScriptedEvents {
    connections: Mutex<VecDeque<Connection>>,
    opens: Mutex<Vec<Instant>>,
}

impl ScriptedEvents {
    pub fn new(connections: impl IntoIterator<Item = Connection>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(connections.into_iter().collect()),
            opens: Mutex::default(),
        })
    }

    /// Instants at which `open` was called, refused attempts included.
    pub fn opens(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }

    /// Whole seconds between consecutive connection attempts.
    pub fn gaps_secs(&self) -> Vec<u64> {
        self.opens()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_secs_f64().round() as u64)
            .collect()
    }
}

#[async_trait]
impl EventTransport for ScriptedEvents {
    async fn open(&self) -> Result<Box<dyn EventLines>, TransportError> {
        self.opens.lock().unwrap().push(Instant::now());
        match self.connections.lock().unwrap().pop_front() {
            Some(Connection::Open(script, end)) => Ok(Box::new(ScriptedLines {
                steps: script.steps,
                end: Some(end),
            })),
            Some(Connection::Refused) | None => {
                Err(TransportError::Connect("connection refused".into()))
            }
        }
    }
}

struct ScriptedLines {
    steps: VecDeque<Step>,
    end: Option<End>,
}

#[async_trait]
impl EventLines for ScriptedLines {
    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::Line(line) => return Some(Ok(line)),
                Step::Pause(duration) => tokio::time::sleep(duration).await,
            }
        }
        match self.end.take() {
            Some(End::Close) | None => None,
            Some(End::Fail) => Some(Err(TransportError::Io("connection reset by peer".into()))),
            Some(End::HoldOpen) => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Region(CacheRegion),
    All,
}

#[derive(Default)]
pub struct RecordingCache {
    calls: Mutex<Vec<Refresh>>,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Refresh> {
        self.calls.lock().unwrap().clone()
    }

    pub fn full_refreshes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == Refresh::All)
            .count()
    }
}

#[async_trait]
impl CacheInvalidator for RecordingCache {
    async fn invalidate(&self, region: CacheRegion) {
        self.calls.lock().unwrap().push(Refresh::Region(region));
    }

    async fn invalidate_all(&self) {
        self.calls.lock().unwrap().push(Refresh::All);
    }
}

pub const TASK_REGIONS: [Refresh; 3] = [
    Refresh::Region(CacheRegion::Home),
    Refresh::Region(CacheRegion::Tasks),
    Refresh::Region(CacheRegion::MonthlySummary),
];
