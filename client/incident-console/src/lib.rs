//! Incident Console state-synchronization engine.
//!
//! Keeps a normalized, authenticated, realtime-updated view of security
//! incidents: bearer-token auth with single-flight refresh and client-side
//! login rate limiting, a REST snapshot plus SSE push stream feeding one
//! incident table, pure filter/sort/paginate views, and optimistic status
//! changes with rollback.
//!
//! No UI; the binary drives it over stdin/stdout JSON lines.

pub mod auth;
pub mod config;
pub mod console;
pub mod error;
pub mod gateway;
pub mod optimistic;
pub mod query;
pub mod realtime;
pub mod storage;
pub mod store;
pub mod token;
pub mod types;
pub mod view;

pub use auth::{AuthApi, AuthSession, AuthState, RateLimitPolicy};
pub use config::Config;
pub use console::{Console, RetryOutcome};
pub use error::ConsoleError;
pub use gateway::{HttpGateway, IncidentApi};
pub use realtime::{ManagerState, RealtimeManager, SseTransport, Transport, TransportEvent};
pub use store::{IncidentStore, SharedStore};
pub use types::{ConnectionStatus, Incident, Severity, Status};
pub use view::{FilterState, IncidentView, SortBy, SortOrder, SummaryCounts};
