//! Scheme (C4): a listening endpoint and its defaults, owning the brokers
//! accepted through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::broker::Broker;
use crate::error::{Error, ErrorKind};
use crate::socket::Transport;

static NEXT_SCHEME_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_scheme_id() -> u64 {
    NEXT_SCHEME_ID.fetch_add(1, Ordering::Relaxed)
}

/// Address family a scheme listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    Ipv4,
    Ipv6,
    Ipc,
}

/// `{cnt, idle, intvl}` TCP keepalive tuple.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KeepAlive {
    pub cnt: u32,
    pub idle: u32,
    pub intvl: u32,
}

/// Per-scheme defaults applied to every broker it accepts.
#[derive(Debug, Clone)]
pub struct SchemeDefaults {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub wait_message_secs: u64,
    pub keep_alive: KeepAlive,
    /// Strictly enforced total-connections cap.
    pub total: usize,
    pub ipv6_only: bool,
}

impl Default for SchemeDefaults {
    fn default() -> Self {
        Self {
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            connect_timeout_ms: 0,
            wait_message_secs: 0,
            keep_alive: KeepAlive::default(),
            total: usize::MAX,
            ipv6_only: false,
        }
    }
}

/// A listening endpoint (host/port or IPC path) plus its brokers.
pub struct Scheme {
    pub id: u64,
    pub family: Family,
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub defaults: SchemeDefaults,
    pub brokers: HashMap<u64, Broker>,
    pub listening: bool,
}

impl Scheme {
    pub fn new(family: Family, transport: Transport, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: next_scheme_id(),
            family,
            transport,
            host: host.into(),
            port,
            defaults: SchemeDefaults::default(),
            brokers: HashMap::new(),
            listening: false,
        }
    }

    /// Enforces the `total` cap at accept time: the broker count for this
    /// scheme never exceeds its configured maximum at any observable instant.
    pub fn check_total_cap(&self) -> Result<(), Error> {
        if self.brokers.len() >= self.defaults.total {
            return Err(Error::TotalCapExceeded {
                kind: ErrorKind::Accept,
                scheme_id: self.id,
                limit: self.defaults.total,
            });
        }
        Ok(())
    }

    pub fn insert_broker(&mut self, broker: Broker) -> u64 {
        let id = broker.id;
        self.brokers.insert(id, broker);
        id
    }

    pub fn remove_broker(&mut self, broker_id: u64) -> Option<Broker> {
        self.brokers.remove(&broker_id)
    }

    /// Drains and returns every broker owned by this scheme, in
    /// unspecified order, as `remove(sid)` requires ("closing every
    /// broker it owns in arbitrary order").
    pub fn drain_brokers(&mut self) -> Vec<Broker> {
        self.brokers.drain().map(|(_, b)| b).collect()
    }

    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_cap_zero_rejects_every_accept() {
        let mut scheme = Scheme::new(Family::Ipv4, Transport::Tcp, "127.0.0.1", 0);
        scheme.defaults.total = 0;
        let err = scheme.check_total_cap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Accept);
        assert!(err.to_string().contains("cannot exceed maximum"));
    }

    #[test]
    fn ids_increase_monotonically() {
        let a = Scheme::new(Family::Ipv4, Transport::Tcp, "h", 1);
        let b = Scheme::new(Family::Ipv4, Transport::Tcp, "h", 2);
        assert!(b.id > a.id);
    }
}
