//! Conditional request client: optimistic concurrency over HTTP.
//!
//! Every mutating request carries the held [`ConcurrencyToken`] as
//! `If-Match`. Writes with no token fail locally with
//! [`ApiError::PreconditionRequired`] before touching the network. The held
//! token follows the latest version marker the server reports, whether the
//! response succeeded (`ETag` header) or was a conflict (`currentEtag` body
//! field).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use kaji_core::ConcurrencyToken;

use crate::error::ApiError;
use crate::token::TokenStore;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method, IF_MATCH};

/// One API call as the application sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Caller-supplied precondition used instead of the held token.
    pub if_match: Option<ConcurrencyToken>,
    /// `false` for writes outside the team state (e.g. session exchange).
    pub conditional: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            if_match: None,
            conditional: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_if_match(mut self, token: impl Into<ConcurrencyToken>) -> Self {
        self.if_match = Some(token.into());
        self
    }

    pub fn unconditional(mut self) -> Self {
        self.conditional = false;
        self
    }

    fn requires_precondition(&self) -> bool {
        self.conditional && self.method.is_mutating()
    }
}

/// Successful (2xx) response. `data` is `Value::Null` for empty bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: Option<String>,
    code: Option<String>,
    current_etag: Option<String>,
}

/// Request client bound to one [`TokenStore`].
#[derive(Clone)]
pub struct ConditionalClient {
    transport: Arc<dyn HttpTransport>,
    tokens: TokenStore,
}

impl ConditionalClient {
    pub fn new(transport: Arc<dyn HttpTransport>, tokens: TokenStore) -> Self {
        Self { transport, tokens }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut headers = Vec::new();
        if request.requires_precondition() {
            let Some(token) = request.if_match.clone().or_else(|| self.tokens.get()) else {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    "write refused locally: no concurrency token held",
                );
                return Err(ApiError::PreconditionRequired);
            };
            headers.push((IF_MATCH.to_string(), token.0));
        }

        let method = request.method;
        let path = request.path;
        let response = self
            .transport
            .execute(HttpRequest {
                method,
                path: path.clone(),
                headers,
                body: request.body,
            })
            .await?;
        tracing::debug!(method = %method, path = %path, status = response.status, "api request completed");

        if response.is_success() {
            self.adopt_header_token(&response);
            let data = parse_success_body(&response)?;
            return Ok(ApiResponse {
                status: response.status,
                data,
            });
        }
        Err(self.failure(method, &path, response))
    }

    /// Read a singleton resource where 404 means "does not exist yet"
    /// (e.g. no active invite), not an error.
    pub async fn get_optional(&self, path: impl Into<String>) -> Result<Option<ApiResponse>, ApiError> {
        match self.send(ApiRequest::get(path)).await {
            Ok(response) => Ok(Some(response)),
            Err(ApiError::Request { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn adopt_header_token(&self, response: &HttpResponse) {
        if let Some(token) = response.etag.as_deref().and_then(ConcurrencyToken::parse) {
            self.tokens.set(token);
        }
    }

    fn failure(&self, method: Method, path: &str, response: HttpResponse) -> ApiError {
        let status = response.status;
        let body: ErrorBody = serde_json::from_str(&response.body).unwrap_or_default();

        let current_etag = body
            .current_etag
            .as_deref()
            .and_then(ConcurrencyToken::parse);
        if let Some(token) = &current_etag {
            self.tokens.set(token.clone());
        }

        let message = body
            .message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("request failed: {status}"));

        match status {
            401 => ApiError::Unauthorized { message },
            409 | 412 => {
                tracing::warn!(
                    method = %method,
                    path = %path,
                    status,
                    code = body.code.as_deref().unwrap_or(""),
                    adopted = current_etag.is_some(),
                    "write rejected: team state changed concurrently",
                );
                ApiError::PreconditionFailed {
                    status,
                    message,
                    code: body.code,
                    current_etag,
                }
            }
            428 => ApiError::PreconditionRequired,
            _ => ApiError::Request {
                status,
                message,
                code: body.code,
            },
        }
    }
}

fn parse_success_body(response: &HttpResponse) -> Result<Value, ApiError> {
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body).map_err(|source| ApiError::UnexpectedBody {
        status: response.status,
        source,
    })
}
