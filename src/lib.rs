//! # skyclaw
//!
//! A decentralized compute-orchestration layer:
//! - A cluster of equal-peer coordinators holding a replicated job queue and
//!   host/service registry (no leader election; quorum snapshot replication)
//! - A host daemon that registers, heartbeats, claims and executes work
//! - A federated gateway that routes HTTP traffic to running service replicas
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  snapshot push / sync  ┌───────────────┐
//! │ Coordinator A │◄──────────────────────►│ Coordinator B │
//! │ queue+registry│                        │ queue+registry│
//! └──────┬────────┘                        └───────┬───────┘
//!        │ register / heartbeat / claim / complete │
//!   ┌────┴─────┐                            ┌──────┴───┐
//!   │  Host 1  │                            │  Host 2  │
//!   │ (shell)  │                            │(openclaw)│
//!   └──────────┘                            └──────────┘
//!              ▲
//!              │ /v1/services poll
//!        ┌─────┴─────┐
//!        │  Gateway  │──► running service endpoints
//!        └───────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a coordinator
//! ```bash
//! skyclaw-coord serve \
//!   --port 7070 \
//!   --db ./coord.db \
//!   --public-url http://10.0.0.1:7070 \
//!   --peers http://10.0.0.2:7070,http://10.0.0.3:7070
//! ```
//!
//! ### Start a host daemon
//! ```bash
//! skyclaw-host run \
//!   --name openclaw-a \
//!   --capabilities shell,openclaw \
//!   --coordinators http://10.0.0.1:7070,http://10.0.0.2:7070
//! ```
//!
//! ### Start a gateway
//! ```bash
//! skyclaw-gateway serve --bind 0.0.0.0:8080 --coordinators http://10.0.0.1:7070
//! ```

pub mod common;
pub mod coordinator;
pub mod gateway;
pub mod host;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
