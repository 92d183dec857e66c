//! Connection admission: IP allow-list and connection cap.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Why a connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    IpNotAllowed,
    ServerFull,
}

/// Decides which peers may connect and tracks how many are live.
pub struct AdmissionPolicy {
    allow_all: bool,
    allowed: HashSet<IpAddr>,
    max_connections: usize,
    live: AtomicUsize,
}

impl AdmissionPolicy {
    /// Build a policy from textual IPs.
    ///
    /// An empty list or an entry of `0.0.0.0` admits every address.
    /// `max_connections == 0` means no cap. Unparseable entries are skipped.
    pub fn new(allowed_ips: &[String], max_connections: usize) -> Self {
        let mut allow_all = allowed_ips.is_empty();
        let mut allowed = HashSet::new();
        for entry in allowed_ips {
            match entry.trim().parse::<IpAddr>() {
                Ok(ip) if ip.is_unspecified() && ip.is_ipv4() => allow_all = true,
                Ok(ip) => {
                    allowed.insert(ip.to_canonical());
                }
                Err(_) => tracing::warn!("ignoring invalid allowed IP {entry:?}"),
            }
        }
        Self {
            allow_all,
            allowed,
            max_connections,
            live: AtomicUsize::new(0),
        }
    }

    /// Whether `ip` passes the allow-list. IPv4-mapped IPv6 compares as IPv4.
    pub fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        self.allow_all || self.allowed.contains(&ip.to_canonical())
    }

    /// Whether one more connection would exceed the cap right now.
    pub fn is_full(&self) -> bool {
        self.max_connections > 0 && self.live() >= self.max_connections
    }

    /// Check `ip` and atomically reserve a slot for it.
    ///
    /// The slot is released when the returned guard drops.
    pub fn admit(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionSlot, Rejection> {
        if !self.is_ip_allowed(ip) {
            return Err(Rejection::IpNotAllowed);
        }
        let max = self.max_connections;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|_| Rejection::ServerFull)?;
        Ok(ConnectionSlot {
            policy: Arc::clone(self),
        })
    }

    /// Connections currently holding a slot.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// A reserved connection slot.
pub struct ConnectionSlot {
    policy: Arc<AdmissionPolicy>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.policy.live.fetch_sub(1, Ordering::AcqRel);
    }
}
