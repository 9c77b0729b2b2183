//! Local port pool for tunnel sessions
//!
//! One lease per port in the configured range. Every lease change happens
//! under a single mutex, so two sessions can never be handed the same port.
//! The table is rebuilt from persisted sessions at startup via [`PortAllocator::restore`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::TunnelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Free,
    /// Handed to a session that is still being set up
    Reserved,
    /// Backing a live session
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortLease {
    pub port: u16,
    pub state: LeaseState,
    /// Session id holding the lease
    pub held_by: Option<String>,
}

struct LeaseTable {
    leases: BTreeMap<u16, PortLease>,
    /// Next port to try; rotates so a released port is not reused right away
    cursor: u16,
}

pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    verify_os_ports: bool,
    table: Mutex<LeaseTable>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Result<Self, TunnelError> {
        if range_start == 0 || range_start > range_end {
            return Err(TunnelError::InvalidInput(format!(
                "Invalid port range {}-{}",
                range_start, range_end
            )));
        }

        let leases = (range_start..=range_end)
            .map(|port| {
                (
                    port,
                    PortLease {
                        port,
                        state: LeaseState::Free,
                        held_by: None,
                    },
                )
            })
            .collect();

        Ok(Self {
            range_start,
            range_end,
            verify_os_ports: false,
            table: Mutex::new(LeaseTable {
                leases,
                cursor: range_start,
            }),
        })
    }

    /// Also skip free ports that another process is already listening on
    pub fn with_os_check(mut self, verify_os_ports: bool) -> Self {
        self.verify_os_ports = verify_os_ports;
        self
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.range_end - self.range_start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.range_start..=self.range_end).contains(&port)
    }

    fn lock(&self) -> MutexGuard<'_, LeaseTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if a port is actually available at the OS level
    fn is_port_available(port: u16) -> bool {
        std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    /// Reserve a free port for `session_id`
    pub fn acquire(&self, session_id: &str) -> Result<u16, TunnelError> {
        let mut table = self.lock();
        let span = self.capacity();
        let start = table.cursor;

        for offset in 0..span {
            let port = self.range_start
                + ((usize::from(start - self.range_start) + offset) % span) as u16;

            let is_free = table
                .leases
                .get(&port)
                .is_some_and(|lease| lease.state == LeaseState::Free);
            if !is_free {
                continue;
            }
            if self.verify_os_ports && !Self::is_port_available(port) {
                warn!(port, "Pool port is in use by another process, skipping");
                continue;
            }

            if let Some(lease) = table.leases.get_mut(&port) {
                lease.state = LeaseState::Reserved;
                lease.held_by = Some(session_id.to_string());
            }
            table.cursor = if port == self.range_end {
                self.range_start
            } else {
                port + 1
            };

            debug!(port, session_id, "Reserved port");
            return Ok(port);
        }

        warn!(
            range_start = self.range_start,
            range_end = self.range_end,
            "Port pool exhausted"
        );
        Err(TunnelError::PoolExhausted {
            range_start: self.range_start,
            range_end: self.range_end,
        })
    }

    /// Promote a reservation to a bound lease once the session is live
    pub fn bind(&self, port: u16, session_id: &str) -> Result<(), TunnelError> {
        let mut table = self.lock();
        match table.leases.get_mut(&port) {
            Some(lease) if lease.held_by.as_deref() == Some(session_id) => {
                lease.state = LeaseState::Bound;
                Ok(())
            }
            Some(lease) => Err(TunnelError::InvalidInput(format!(
                "Port {} is not reserved for session {} (held by {:?})",
                port, session_id, lease.held_by
            ))),
            None => Err(TunnelError::InvalidInput(format!(
                "Port {} is outside the pool",
                port
            ))),
        }
    }

    /// Re-create a bound lease for a session that survived a restart
    pub fn restore(&self, port: u16, session_id: &str) -> Result<(), TunnelError> {
        let mut table = self.lock();
        let lease = table.leases.get_mut(&port).ok_or_else(|| {
            TunnelError::InvalidInput(format!("Port {} is outside the pool", port))
        })?;

        match lease.held_by.as_deref() {
            Some(holder) if holder != session_id => Err(TunnelError::InvalidInput(format!(
                "Port {} is already leased to session {}",
                port, holder
            ))),
            _ => {
                lease.state = LeaseState::Bound;
                lease.held_by = Some(session_id.to_string());
                info!(port, session_id, "Restored port lease");
                Ok(())
            }
        }
    }

    /// Free `port` if it is held by `session_id`; returns whether it was released
    pub fn release(&self, port: u16, session_id: &str) -> bool {
        let mut table = self.lock();
        match table.leases.get_mut(&port) {
            Some(lease) if lease.held_by.as_deref() == Some(session_id) => {
                lease.state = LeaseState::Free;
                lease.held_by = None;
                debug!(port, session_id, "Released port");
                true
            }
            _ => false,
        }
    }

    pub fn lease(&self, port: u16) -> Option<PortLease> {
        self.lock().leases.get(&port).cloned()
    }

    /// Leases currently held by a session, in port order
    pub fn held(&self) -> Vec<PortLease> {
        self.lock()
            .leases
            .values()
            .filter(|lease| lease.state != LeaseState::Free)
            .cloned()
            .collect()
    }

    pub fn available(&self) -> usize {
        self.lock()
            .leases
            .values()
            .filter(|lease| lease.state == LeaseState::Free)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_range() {
        assert!(PortAllocator::new(8200, 8100).is_err());
        assert!(PortAllocator::new(0, 10).is_err());
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let allocator = PortAllocator::new(8100, 8102).unwrap();

        let ports: Vec<u16> = ["s1", "s2", "s3"]
            .iter()
            .map(|id| allocator.acquire(id).unwrap())
            .collect();
        assert_eq!(ports, vec![8100, 8101, 8102]);
        assert_eq!(allocator.available(), 0);

        assert!(matches!(
            allocator.acquire("s4"),
            Err(TunnelError::PoolExhausted {
                range_start: 8100,
                range_end: 8102
            })
        ));

        assert!(allocator.release(8101, "s2"));
        assert_eq!(allocator.acquire("s4").unwrap(), 8101);
    }

    #[test]
    fn test_cursor_rotates_past_released_port() {
        let allocator = PortAllocator::new(8100, 8104).unwrap();
        let first = allocator.acquire("s1").unwrap();
        assert!(allocator.release(first, "s1"));

        // The next reservation moves on instead of reusing 8100
        assert_eq!(allocator.acquire("s2").unwrap(), 8101);
    }

    #[test]
    fn test_release_requires_holder() {
        let allocator = PortAllocator::new(8100, 8101).unwrap();
        let port = allocator.acquire("s1").unwrap();

        assert!(!allocator.release(port, "someone-else"));
        assert_eq!(allocator.lease(port).unwrap().state, LeaseState::Reserved);
    }

    #[test]
    fn test_bind_and_restore() {
        let allocator = PortAllocator::new(8100, 8110).unwrap();
        let port = allocator.acquire("s1").unwrap();
        allocator.bind(port, "s1").unwrap();
        assert_eq!(allocator.lease(port).unwrap().state, LeaseState::Bound);
        assert!(allocator.bind(port, "s2").is_err());

        allocator.restore(8105, "s9").unwrap();
        let lease = allocator.lease(8105).unwrap();
        assert_eq!(lease.state, LeaseState::Bound);
        assert_eq!(lease.held_by.as_deref(), Some("s9"));

        assert!(allocator.restore(8105, "s10").is_err());
        assert!(allocator.restore(9000, "s11").is_err());
        assert_eq!(allocator.held().len(), 2);
    }
}
