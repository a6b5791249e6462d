//! Network seams: one-shot HTTP requests and the long-lived event stream.
//!
//! The engine only talks to [`HttpTransport`] and [`EventTransport`]; tests
//! substitute scripted fakes, production uses [`UreqTransport`].

use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kaji_core::SyncConfig;

use crate::error::TransportError;

pub const IF_MATCH: &str = "If-Match";
pub const ETAG: &str = "ETag";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Anything other than a pure read.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!(
                "unsupported method '{other}'; expected: GET, POST, PUT, PATCH, DELETE"
            )),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level request, after the client has decided on headers.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/v1/tasks`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Wire-level response. Non-2xx statuses are responses, not transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Raw text lines of one open push connection.
#[async_trait]
pub trait EventLines: Send {
    /// `None` once the server closed the stream in an orderly way.
    async fn next_line(&mut self) -> Option<Result<String, TransportError>>;
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open one credentialed connection to the team event stream.
    async fn open(&self) -> Result<Box<dyn EventLines>, TransportError>;
}

// ---------------------------------------------------------------------------
// ureq adapter
// ---------------------------------------------------------------------------

/// Production transport on top of blocking `ureq` agents.
#[derive(Clone)]
pub struct UreqTransport {
    api: ureq::Agent,
    stream: ureq::Agent,
    base_url: String,
    events_path: String,
    cookie: Option<String>,
    origin: Option<String>,
}

impl UreqTransport {
    pub fn new(config: &SyncConfig) -> Self {
        let api = ureq::AgentBuilder::new()
            .timeout(config.request_timeout())
            .build();
        // No read timeout: a dead stream surfaces through its own error/close.
        let stream = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            api,
            stream,
            base_url: config.base_url().to_string(),
            events_path: config.events_path.clone(),
            cookie: config.session_cookie(),
            origin: config.origin.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl HttpTransport for UreqTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = self.api.clone();
        let url = self.url(&request.path);
        let cookie = self.cookie.clone();
        let origin = self.origin.clone();
        tokio::task::spawn_blocking(move || execute_blocking(&agent, &url, request, cookie, origin))
            .await
            .map_err(|err| TransportError::Connect(format!("request task join error: {err}")))?
    }
}

#[async_trait]
impl EventTransport for UreqTransport {
    async fn open(&self) -> Result<Box<dyn EventLines>, TransportError> {
        let agent = self.stream.clone();
        let url = self.url(&self.events_path);
        let cookie = self.cookie.clone();
        let reader = tokio::task::spawn_blocking(move || open_blocking(&agent, &url, cookie))
            .await
            .map_err(|err| TransportError::Connect(format!("stream task join error: {err}")))??;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("kaji-event-stream".to_string())
            .spawn(move || pump_lines(reader, line_tx))?;
        Ok(Box::new(ChannelLines { rx: line_rx }))
    }
}

fn execute_blocking(
    agent: &ureq::Agent,
    url: &str,
    request: HttpRequest,
    cookie: Option<String>,
    origin: Option<String>,
) -> Result<HttpResponse, TransportError> {
    let mut call = agent
        .request(request.method.as_str(), url)
        .set("Accept", "application/json");
    if let Some(cookie) = &cookie {
        call = call.set("Cookie", cookie);
    }
    if request.method.is_mutating() {
        if let Some(origin) = &origin {
            call = call.set("Origin", origin);
        }
    }
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let result = match &request.body {
        Some(body) => call.send_json(body),
        None => call.call(),
    };
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(ureq::Error::Transport(err)) => return Err(TransportError::Connect(err.to_string())),
    };

    let status = response.status();
    let etag = response.header(ETAG).map(str::to_string);
    let body = response.into_string()?;
    Ok(HttpResponse { status, etag, body })
}

fn open_blocking(
    agent: &ureq::Agent,
    url: &str,
    cookie: Option<String>,
) -> Result<Box<dyn Read + Send + Sync + 'static>, TransportError> {
    let mut call = agent
        .get(url)
        .set("Accept", "text/event-stream")
        .set("Cache-Control", "no-cache");
    if let Some(cookie) = &cookie {
        call = call.set("Cookie", cookie);
    }
    match call.call() {
        Ok(response) => Ok(response.into_reader()),
        Err(ureq::Error::Status(status, _)) => Err(TransportError::Status(status)),
        Err(ureq::Error::Transport(err)) => Err(TransportError::Connect(err.to_string())),
    }
}

/// Runs on a dedicated thread until EOF, a read error, or the consumer
/// dropping its receiver (noticed on the next line, at worst the next
/// server heartbeat).
///
/// Lines are decoded lossily: a payload with invalid UTF-8 reaches the SSE
/// decoder as a malformed frame and is dropped there, the connection stays up.
fn pump_lines(
    reader: Box<dyn Read + Send + Sync + 'static>,
    line_tx: mpsc::UnboundedSender<Result<String, TransportError>>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let item = match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
            Err(err) => Err(TransportError::from(err)),
        };
        let failed = item.is_err();
        if line_tx.send(item).is_err() || failed {
            return;
        }
    }
}

struct ChannelLines {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl EventLines for ChannelLines {
    async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_get_is_a_pure_read() {
        assert!(!Method::Get.is_mutating());
        for method in [Method::Post, Method::Put, Method::Patch, Method::Delete] {
            assert!(method.is_mutating(), "{method} should be mutating");
        }
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("patch".parse::<Method>().unwrap(), Method::Patch);
        assert!("TRACE".parse::<Method>().is_err());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let request = HttpRequest {
            method: Method::Post,
            path: "/v1/tasks".into(),
            headers: vec![(IF_MATCH.into(), "v1".into())],
            body: None,
        };
        assert_eq!(request.header("if-match"), Some("v1"));
        assert_eq!(request.header("ETag"), None);
    }

    #[tokio::test]
    async fn pump_lines_forwards_until_eof() {
        let body: Box<dyn Read + Send + Sync> =
            Box::new(std::io::Cursor::new(b"event:connected\ndata:{\"revision\":1}\n\n".to_vec()));
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || pump_lines(body, tx));

        let mut lines = ChannelLines { rx };
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await {
            seen.push(line.expect("line"));
        }
        assert_eq!(seen, vec!["event:connected", "data:{\"revision\":1}", ""]);
    }

    #[tokio::test]
    async fn pump_lines_keeps_going_past_invalid_utf8() {
        let mut raw = b"event:team-state-changed\ndata:{\"bad\":\"".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe]);
        raw.extend_from_slice(b"\"}\n\nevent:team-state-changed\ndata:{\"revision\":2}\n\n");
        let body: Box<dyn Read + Send + Sync> = Box::new(std::io::Cursor::new(raw));
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || pump_lines(body, tx));

        let mut lines = ChannelLines { rx };
        let mut seen = Vec::new();
        while let Some(line) = lines.next_line().await {
            seen.push(line.expect("invalid bytes must not fail the stream"));
        }
        assert_eq!(seen.len(), 6);
        assert!(seen[1].starts_with("data:{\"bad\":\""));
        assert_eq!(&seen[3..], ["event:team-state-changed", "data:{\"revision\":2}", ""]);
    }
}
