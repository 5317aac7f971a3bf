//! Inventory snapshot schema and payload limits

use serde::{Deserialize, Serialize};

/// Maximum accepted size of an encoded inventory frame.
///
/// Oversized inventories are rejected with `error{invalid_message}` but do
/// NOT close the transport; the agent keeps heartbeating.
pub const MAX_INVENTORY_BYTES: usize = 1024 * 1024;

/// Maximum raw PTY bytes carried by one `terminal_output` frame.
///
/// Larger reads are split at the producer before base64 encoding.
pub const TERMINAL_CHUNK_BYTES: usize = 64 * 1024;

/// A point-in-time description of an agent host.
///
/// Canonical fields are flat; platform-specific detail (per-disk breakdown,
/// per-NIC detail, kernel facts, BMC probes) rides in `extensions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub arch: String,
    /// Unix seconds at collection time
    pub collected_at: i64,

    pub cpu_count: u32,
    pub cpu_model: String,

    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_free: u64,

    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_free: u64,

    pub ip_addresses: Vec<String>,
    pub mac_addresses: Vec<String>,

    /// Opaque platform-specific detail
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl InventorySnapshot {
    /// Whether this snapshot differs from `previous` in any of the fields
    /// that drive history retention.
    pub fn changed_from(&self, previous: &InventorySnapshot) -> bool {
        self.hostname != previous.hostname
            || self.os != previous.os
            || self.cpu_count != previous.cpu_count
            || self.memory_total != previous.memory_total
            || self.disk_total != previous.disk_total
    }
}

/// Split raw PTY output into wire-sized chunks.
///
/// The split happens on the raw bytes; each chunk is base64-encoded
/// separately by the caller. Ordering is the caller's responsibility via
/// the per-session sequence counter.
pub fn chunk_terminal_output(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(TERMINAL_CHUNK_BYTES)
}
