//! Network counters over a session window: fan-out, byte volume, port
//! distribution, internal/external split.

use crate::normalizer::SessionEvent;
use std::collections::HashMap;
use std::net::IpAddr;

/// RFC 1918 ranges plus loopback and link-local count as internal.
pub(crate) fn is_internal_addr(addr: &str) -> bool {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

#[derive(Debug, Default)]
pub struct NetworkAccum {
    destinations: HashMap<String, u32>,
    ports: HashMap<u16, u32>,
    port_total: u64,
    pub bytes: u64,
    internal: u32,
    external: u32,
}

impl NetworkAccum {
    pub fn add(&mut self, event: &SessionEvent) {
        if let Some(dest) = &event.dest_ip {
            *self.destinations.entry(dest.clone()).or_insert(0) += 1;
            if is_internal_addr(dest) {
                self.internal += 1;
            } else {
                self.external += 1;
            }
        }
        if let Some(port) = event.dest_port {
            *self.ports.entry(port).or_insert(0) += 1;
            self.port_total += 1;
        }
        self.bytes += event.bytes_transferred;
    }

    pub fn remove(&mut self, event: &SessionEvent) {
        if let Some(dest) = &event.dest_ip {
            if let Some(count) = self.destinations.get_mut(dest) {
                *count -= 1;
                if *count == 0 {
                    self.destinations.remove(dest);
                }
            }
            if is_internal_addr(dest) {
                self.internal = self.internal.saturating_sub(1);
            } else {
                self.external = self.external.saturating_sub(1);
            }
        }
        if let Some(port) = event.dest_port {
            if let Some(count) = self.ports.get_mut(&port) {
                *count -= 1;
                if *count == 0 {
                    self.ports.remove(&port);
                }
            }
            self.port_total = self.port_total.saturating_sub(1);
        }
        self.bytes = self.bytes.saturating_sub(event.bytes_transferred);
    }

    pub fn unique_destinations(&self) -> usize {
        self.destinations.len()
    }

    /// Shannon entropy (log base 2) over the destination-port distribution.
    /// Zero when no ports were touched.
    pub fn port_entropy(&self) -> f64 {
        if self.port_total == 0 {
            return 0.0;
        }
        let total = self.port_total as f64;
        let mut entropy = 0.0;
        for &count in self.ports.values() {
            let p = f64::from(count) / total;
            entropy -= p * p.log2();
        }
        entropy.max(0.0)
    }

    /// Internal-destination fraction; 0 when no destinations were observed.
    pub fn internal_ratio(&self) -> f64 {
        let total = self.internal + self.external;
        if total == 0 {
            0.0
        } else {
            f64::from(self.internal) / f64::from(total)
        }
    }
}
