use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

/// Why a port could not be handed out.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} is unavailable")]
    Unavailable(u16),
    #[error("no available ports found starting from {0}")]
    Exhausted(u16),
}

/// Checks whether a port can be bound on both loopback addresses.
///
/// kubectl binds the IPv4 loopback, and on some systems the IPv6 loopback as
/// well; a port only counts as available if both binds succeed, so a spawn
/// never fails on the bind that was not probed.
pub fn is_available(port: u16) -> bool {
    let v4 = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(_) => return false,
    };
    // A host with no IPv6 loopback at all cannot have the port taken there.
    let v6_taken = match TcpListener::bind(("::1", port)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(e) => matches!(
            e.kind(),
            std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
        ),
    };
    drop(v4);
    !v6_taken
}

/// Hands out local TCP ports that are free on the host *and* not already
/// reserved by another service of this supervisor. Two services racing for
/// the same port is resolved here, not at bind time.
#[derive(Debug, Default)]
pub struct PortRegistry {
    reserved: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `desired` iff the OS can bind it and no other holder
    /// reserved it already.
    pub fn try_acquire(&self, desired: u16) -> Result<u16, PortError> {
        let mut reserved = self.reserved.lock().expect("port registry poisoned");
        if reserved.contains(&desired) || !is_available(desired) {
            return Err(PortError::Unavailable(desired));
        }
        reserved.insert(desired);
        Ok(desired)
    }

    /// Scans upward from `start` and reserves the first qualifying port.
    /// The scan is atomic with respect to concurrent acquirers.
    pub fn acquire_from(&self, start: u16) -> Result<u16, PortError> {
        let mut reserved = self.reserved.lock().expect("port registry poisoned");
        for port in start..=u16::MAX {
            if reserved.contains(&port) {
                continue;
            }
            if is_available(port) {
                reserved.insert(port);
                return Ok(port);
            }
        }
        Err(PortError::Exhausted(start))
    }

    /// Returns a port to the free pool. Releasing a port that was never
    /// reserved is a no-op.
    pub fn release(&self, port: u16) {
        self.reserved
            .lock()
            .expect("port registry poisoned")
            .remove(&port);
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().expect("port registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_restores_the_free_pool() {
        let registry = PortRegistry::new();
        let port = registry.acquire_from(24800).expect("acquire");
        assert_eq!(registry.reserved_count(), 1);
        registry.release(port);
        assert_eq!(registry.reserved_count(), 0);
        // The same port qualifies again after release.
        assert_eq!(registry.try_acquire(port), Ok(port));
    }

    #[test]
    fn a_reserved_port_is_not_handed_out_twice() {
        let registry = PortRegistry::new();
        let port = registry.acquire_from(24850).expect("acquire");
        assert_eq!(registry.try_acquire(port), Err(PortError::Unavailable(port)));
        let next = registry.acquire_from(port).expect("scan past reservation");
        assert!(next > port);
    }

    #[test]
    fn try_acquire_refuses_a_port_bound_elsewhere() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let registry = PortRegistry::new();
        assert_eq!(registry.try_acquire(port), Err(PortError::Unavailable(port)));
    }

    #[test]
    fn is_available_reports_a_bound_port_as_taken() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(!is_available(port));
    }

    #[test]
    fn scan_at_the_top_of_the_range_reports_exhausted() {
        let registry = PortRegistry::new();
        // Reserve the last port in-process so the scan has nowhere to go,
        // whatever the host happens to have bound.
        registry
            .reserved
            .lock()
            .expect("lock")
            .insert(u16::MAX);
        assert_eq!(
            registry.acquire_from(u16::MAX),
            Err(PortError::Exhausted(u16::MAX))
        );
    }

    #[test]
    fn release_of_an_unreserved_port_is_a_no_op() {
        let registry = PortRegistry::new();
        registry.release(24999);
        assert_eq!(registry.reserved_count(), 0);
    }
}
