//! Real-time collaborative editing core.
//!
//! Exposes a local TCP endpoint speaking the v1 JSONL session protocol.
//! Clients join spreadsheets, submit optimistic row mutations, and receive
//! every committed mutation for their joined spreadsheets in commit order.
//!
//! Shape of the system:
//!
//! - one gateway thread per connection (socket I/O only),
//! - one coordinator thread per spreadsheet (the single writer that gives the
//!   system its ordering and lost-update guarantees),
//! - a connection registry fanning committed mutations out through bounded
//!   per-session queues.
//!
//! A slow consumer can only overflow its own queue; it is then disconnected
//! and must re-fetch state through the ordinary read path. Nothing a client
//! does can stall a coordinator or another session.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod gateway;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;

pub use auth::{generate_token, Authenticator, StaticAuthenticator, StoreAuthenticator};
pub use config::ServerConfig;
pub use coordinator::{CommittedMutation, CoordinatorPool, MutateRequest, MutationReject};
pub use gateway::SessionServer;
pub use metrics::ServerMetrics;
pub use registry::ConnectionRegistry;
