/// Shared hop routing table
///
/// The single source of truth for circuit forwarding at this relay. Every
/// connection reader consults it for each RELAY cell; extension tasks and
/// teardown mutate it. One mutex guards the whole map, which is plenty for
/// the per-cell work involved, and makes claim/extend/remove linearizable
/// with respect to concurrent lookups.

use crate::circuit::origin::OriginCircuit;
use crate::conn::ConnId;
use crate::relay::exit::ExitCircuit;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

/// One directed half of a circuit segment as seen locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hop {
    pub conn: ConnId,
    pub circuit: u16,
}

impl Hop {
    pub fn new(conn: ConnId, circuit: u16) -> Self {
        Self { conn, circuit }
    }
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/circuit {}", self.conn, self.circuit)
    }
}

/// What an inbound hop maps to
#[derive(Clone)]
pub enum HopEntry {
    /// Middle relay: rewrite the circuit id and pass cells through
    Forward(Hop),

    /// This relay is the circuit's terminal hop
    Exit(Arc<ExitCircuit>),

    /// This node originated the circuit; cells flow back to local streams
    Origin(Arc<OriginCircuit>),
}

impl std::fmt::Debug for HopEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward(next) => write!(f, "Forward({})", next),
            Self::Exit(_) => write!(f, "Exit"),
            Self::Origin(_) => write!(f, "Origin"),
        }
    }
}

pub struct HopTable {
    entries: StdMutex<HashMap<Hop, HopEntry>>,
}

impl HopTable {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, hop: Hop) -> Option<HopEntry> {
        self.entries
            .lock()
            .expect("hop table poisoned")
            .get(&hop)
            .cloned()
    }

    /// Claim a hop as a fresh, not-yet-extended terminal. Exactly one of
    /// any number of concurrent claims on the same hop succeeds; a
    /// duplicate CREATE must be answered with CREATE_FAILED.
    pub fn claim(&self, hop: Hop) -> Option<Arc<ExitCircuit>> {
        let mut entries = self.entries.lock().expect("hop table poisoned");
        if entries.contains_key(&hop) {
            return None;
        }
        let exit = Arc::new(ExitCircuit::new());
        entries.insert(hop, HopEntry::Exit(exit.clone()));
        Some(exit)
    }

    /// Promote a terminal hop to a forwarding entry after a successful
    /// extension, installing both directions of the new segment
    /// atomically. Fails if `hop` is no longer terminal (e.g. destroyed
    /// while the extension was in flight) or `next` is already taken.
    pub fn extend(&self, hop: Hop, next: Hop) -> bool {
        let mut entries = self.entries.lock().expect("hop table poisoned");
        match entries.get(&hop) {
            Some(HopEntry::Exit(_)) => {}
            _ => return false,
        }
        if entries.contains_key(&next) {
            return false;
        }
        entries.insert(hop, HopEntry::Forward(next));
        entries.insert(next, HopEntry::Forward(hop));
        true
    }

    /// Record a locally originated circuit's first hop.
    pub fn install_origin(&self, hop: Hop, origin: Arc<OriginCircuit>) -> bool {
        let mut entries = self.entries.lock().expect("hop table poisoned");
        if entries.contains_key(&hop) {
            return false;
        }
        entries.insert(hop, HopEntry::Origin(origin));
        true
    }

    pub fn remove(&self, hop: Hop) -> Option<HopEntry> {
        self.entries
            .lock()
            .expect("hop table poisoned")
            .remove(&hop)
    }

    /// Drain every entry keyed by a hop on the given connection; used when
    /// that connection dies.
    pub fn remove_connection(&self, conn: ConnId) -> Vec<(Hop, HopEntry)> {
        let mut entries = self.entries.lock().expect("hop table poisoned");
        let doomed: Vec<Hop> = entries
            .keys()
            .filter(|hop| hop.conn == conn)
            .copied()
            .collect();
        doomed
            .into_iter()
            .filter_map(|hop| entries.remove(&hop).map(|entry| (hop, entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("hop table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HopTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(conn: u64, circuit: u16) -> Hop {
        Hop::new(ConnId(conn), circuit)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let table = Arc::new(HopTable::new());
        let target = hop(1, 7);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || table.claim(target).is_some()));
        }

        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_extend_installs_both_directions() {
        let table = HopTable::new();
        let inbound = hop(1, 7);
        let outbound = hop(2, 42);

        assert!(table.claim(inbound).is_some());
        assert!(table.extend(inbound, outbound));

        assert!(matches!(
            table.lookup(inbound),
            Some(HopEntry::Forward(next)) if next == outbound
        ));
        assert!(matches!(
            table.lookup(outbound),
            Some(HopEntry::Forward(back)) if back == inbound
        ));
    }

    #[test]
    fn test_extend_requires_terminal() {
        let table = HopTable::new();
        let inbound = hop(1, 7);
        let outbound = hop(2, 42);

        // never claimed
        assert!(!table.extend(inbound, outbound));

        // already forwarding
        assert!(table.claim(inbound).is_some());
        assert!(table.extend(inbound, outbound));
        assert!(!table.extend(inbound, hop(3, 9)));

        // target hop occupied
        let other = hop(4, 1);
        assert!(table.claim(other).is_some());
        let fresh = hop(5, 2);
        assert!(table.claim(fresh).is_some());
        assert!(!table.extend(fresh, other));
    }

    #[test]
    fn test_remove_connection_drains_only_matching() {
        let table = HopTable::new();
        assert!(table.claim(hop(1, 2)).is_some());
        assert!(table.claim(hop(1, 4)).is_some());
        assert!(table.claim(hop(2, 2)).is_some());

        let drained = table.remove_connection(ConnId(1));
        assert_eq!(drained.len(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.lookup(hop(2, 2)).is_some());
    }
}
