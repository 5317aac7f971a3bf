//! fh-core: Shared foundations for the FleetHub ecosystem
//!
//! Domain identifiers, the error taxonomy, configuration loading, and time
//! helpers used by both the server and the agent.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::{ConfigError, ConnectionError, DirectoryError, HubError, SessionError};
pub use types::{AgentId, AgentRecord, OperatorId, PresenceStatus, ReplicaId};
