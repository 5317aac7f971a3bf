//! System inventory collection
//!
//! Gathers the canonical snapshot fields from the host via sysinfo, and
//! files platform detail (per-disk breakdown, per-NIC addresses, kernel
//! facts) under the extensions map. BMC and other out-of-band probes
//! plug into the same extensions seam.

use serde_json::json;
use sysinfo::{Disks, Networks, System};

use fh_core::time::current_time_secs;
use fh_protocol::InventorySnapshot;

/// Collects inventory snapshots from the local host
pub struct InventoryCollector {
    system: System,
}

impl InventoryCollector {
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
        }
    }

    /// Gather a fresh snapshot
    pub fn collect(&mut self) -> InventorySnapshot {
        self.system.refresh_all();

        let mut snapshot = InventorySnapshot {
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: std::env::consts::OS.to_string(),
            platform: System::name().unwrap_or_else(|| "unknown".to_string()),
            arch: std::env::consts::ARCH.to_string(),
            collected_at: current_time_secs(),
            cpu_count: self.system.cpus().len() as u32,
            cpu_model: self
                .system
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            memory_total: self.system.total_memory(),
            memory_used: self.system.used_memory(),
            memory_free: self.system.free_memory(),
            ..Default::default()
        };

        self.collect_disks(&mut snapshot);
        self.collect_networks(&mut snapshot);

        snapshot.extensions.insert(
            "host".to_string(),
            json!({
                "kernel_version": System::kernel_version(),
                "os_version": System::os_version(),
                "uptime_s": System::uptime(),
                "boot_time_s": System::boot_time(),
                "load_average": {
                    "one": System::load_average().one,
                    "five": System::load_average().five,
                    "fifteen": System::load_average().fifteen,
                },
            }),
        );

        snapshot
    }

    fn collect_disks(&self, snapshot: &mut InventorySnapshot) {
        let disks = Disks::new_with_refreshed_list();
        let mut details = Vec::new();

        for disk in disks.list() {
            let total = disk.total_space();
            let free = disk.available_space();
            snapshot.disk_total += total;
            snapshot.disk_free += free;
            snapshot.disk_used += total.saturating_sub(free);

            details.push(json!({
                "name": disk.name().to_string_lossy(),
                "mount_point": disk.mount_point().to_string_lossy(),
                "file_system": disk.file_system().to_string_lossy(),
                "total": total,
                "available": free,
            }));
        }

        snapshot
            .extensions
            .insert("disks".to_string(), json!(details));
    }

    fn collect_networks(&self, snapshot: &mut InventorySnapshot) {
        let networks = Networks::new_with_refreshed_list();
        let mut details = Vec::new();

        for (name, data) in networks.iter() {
            // Loopback carries no fleet-relevant addressing
            if name == "lo" {
                continue;
            }

            let mac = data.mac_address().to_string();
            if mac != "00:00:00:00:00:00" {
                snapshot.mac_addresses.push(mac.clone());
            }

            let ips: Vec<String> = data
                .ip_networks()
                .iter()
                .map(|ip| ip.addr.to_string())
                .collect();
            snapshot.ip_addresses.extend(ips.iter().cloned());

            details.push(json!({
                "name": name,
                "mac": mac,
                "addresses": ips,
            }));
        }

        snapshot
            .extensions
            .insert("networks".to_string(), json!(details));
    }
}

impl Default for InventoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_fills_canonical_fields() {
        let mut collector = InventoryCollector::new();
        let snapshot = collector.collect();

        assert!(!snapshot.hostname.is_empty());
        assert!(!snapshot.os.is_empty());
        assert!(!snapshot.arch.is_empty());
        assert!(snapshot.collected_at > 0);
        assert!(snapshot.cpu_count > 0);
        assert!(snapshot.memory_total > 0);
    }

    #[test]
    fn test_collect_records_extensions() {
        let mut collector = InventoryCollector::new();
        let snapshot = collector.collect();

        assert!(snapshot.extensions.contains_key("host"));
        assert!(snapshot.extensions.contains_key("disks"));
        assert!(snapshot.extensions.contains_key("networks"));
    }

    #[test]
    fn test_snapshot_stays_under_wire_cap() {
        let mut collector = InventoryCollector::new();
        let snapshot = collector.collect();

        let encoded = serde_json::to_string(&snapshot).unwrap();
        assert!(encoded.len() < fh_protocol::MAX_INVENTORY_BYTES);
    }
}
