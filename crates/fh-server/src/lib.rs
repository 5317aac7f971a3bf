//! FleetHub server library
//!
//! One `fh-server` process is one replica. Replicas share a Presence
//! Directory so any of them can locate and reach any connected agent; the
//! connection hub owns local agent transports and the session broker
//! splices operator terminals onto them, crossing replicas when needed.

pub mod auth;
pub mod broker;
pub mod directory;
pub mod hub;
pub mod snapshot;
pub mod state;
pub mod ws;

pub use state::ServerState;
