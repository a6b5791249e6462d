//! # kaji-sync
//!
//! Client-side team-state sync engine.
//!
//! - [`client`]: conditional writes guarded by the held concurrency token
//! - [`stream`]: revision stream consumer with gap detection and reconnect backoff
//! - [`coalescer`]: debounced, per-region cache invalidation
//! - [`lifecycle`]: starts and stops all of the above with the session
//!
//! Network access goes through the traits in [`transport`]; [`UreqTransport`]
//! is the production implementation.

pub mod client;
pub mod coalescer;
pub mod error;
pub mod lifecycle;
pub mod sse;
pub mod stream;
pub mod token;
pub mod transport;

pub use client::{ApiRequest, ApiResponse, ConditionalClient};
pub use coalescer::{CacheInvalidator, Coalescer, CoalescerHandle, RefreshPlan};
pub use error::{ApiError, ApiErrorKind, MessageError, TransportError};
pub use lifecycle::{SyncController, SyncNotice, SyncSettings};
pub use stream::{Backoff, StreamHandle, StreamMessage, StreamState, StreamStatus};
pub use token::TokenStore;
pub use transport::{
    EventLines, EventTransport, HttpRequest, HttpResponse, HttpTransport, Method, UreqTransport,
};
