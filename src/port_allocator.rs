//! Hands out TCP ports within a configured inclusive range and recycles
//! them on release. Guarded by a plain `std::sync::Mutex` — critical
//! sections are pure bookkeeping, never held across an `.await`.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use crate::error::PortAllocatorError;

struct State {
    free: BTreeSet<u16>,
    next: u16,
    range_start: u16,
    range_end: u16,
}

pub struct PortAllocator {
    state: Mutex<State>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        let free = (range_start..=range_end).collect();
        Self {
            state: Mutex::new(State {
                free,
                next: range_start,
                range_start,
                range_end,
            }),
        }
    }

    /// Returns a free port not currently held by another instance. Before
    /// returning, probes that nothing else on the host is already bound to
    /// it; if bound, the port is skipped and retried.
    pub fn acquire(&self) -> Result<u16, PortAllocatorError> {
        let mut state = self.state.lock().unwrap();
        let attempts = (state.range_end - state.range_start + 1) as usize;
        for _ in 0..attempts {
            let candidate = state.next;
            state.next = if state.next >= state.range_end {
                state.range_start
            } else {
                state.next + 1
            };
            if state.free.remove(&candidate) {
                if port_is_free(candidate) {
                    return Ok(candidate);
                }
                // Bound by something outside our bookkeeping: drop it
                // permanently from this cycle rather than hand it out.
                continue;
            }
        }
        Err(PortAllocatorError::Exhausted)
    }

    /// Idempotent: releasing an already-free port is a no-op.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        if port >= state.range_start && port <= state.range_end {
            state.free.insert(port);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_restores_free_set() {
        let allocator = PortAllocator::new(20000, 20010);
        let before = allocator.free_count();
        let port = allocator.acquire().unwrap();
        assert_eq!(allocator.free_count(), before - 1);
        allocator.release(port);
        assert_eq!(allocator.free_count(), before);
    }

    #[test]
    fn release_is_idempotent() {
        let allocator = PortAllocator::new(20100, 20105);
        let port = allocator.acquire().unwrap();
        allocator.release(port);
        let before = allocator.free_count();
        allocator.release(port);
        assert_eq!(allocator.free_count(), before);
    }

    #[test]
    fn exhaustion_is_reported() {
        let allocator = PortAllocator::new(20200, 20201);
        let a = allocator.acquire().unwrap();
        let b = allocator.acquire().unwrap();
        assert!(allocator.acquire().is_err());
        allocator.release(a);
        allocator.release(b);
    }

    #[test]
    fn no_two_instances_share_a_port() {
        let allocator = PortAllocator::new(20300, 20310);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..11 {
            let p = allocator.acquire().unwrap();
            assert!(seen.insert(p), "port {p} handed out twice");
        }
    }
}
