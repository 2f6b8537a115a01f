//! Outbound FHIR client pool with per-source OAuth2 authentication.
//!
//! A [`FhirClientPool`] multiplexes CRUD against one or more named FHIR
//! servers. Each source owns its token lifecycle (client credentials or
//! RS256 JWT assertion) behind a per-source refresh latch; connection use
//! is bounded by a process-wide cap with per-source keepalive reuse; and
//! every operation reports to the host's event dispatcher.

pub mod auth;
pub mod client;
pub mod context;
pub mod pool;
pub mod source;

pub use auth::{TokenFreshness, TokenManager};
pub use client::{ClientStatus, FhirClientPool, SourceAuthStatus};
pub use context::ScopeOutcome;
pub use pool::{ConnectionPool, PoolConfig, PoolStatus};
pub use source::{AuthMode, DEFAULT_SCOPE, SourceConfig};
