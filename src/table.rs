// src/table.rs
use std::sync::{Arc, Mutex};

use crate::conn::Connection;

// matches the initial allocation of the connection list
const INITIAL_CAPACITY: usize = 1000;

/// Mutex-guarded table of live connections.
///
/// Capacity grows geometrically and never shrinks. Removal is
/// swap-with-last, so iteration order is not stable across removals; ids,
/// not positions, identify connections.
pub(crate) struct ConnectionTable {
    conns: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(Vec::with_capacity(INITIAL_CAPACITY)),
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.lock().unwrap().push(conn);
    }

    pub fn find(&self, id: u64) -> Option<Arc<Connection>> {
        self.conns
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        let mut conns = self.conns.lock().unwrap();
        let pos = conns.iter().position(|c| c.id() == id)?;
        Some(conns.swap_remove(pos))
    }

    /// Pull out every connection that is neither mid-send nor dispatched to
    /// a read task. The caller closes them outside the lock.
    pub fn take_idle(&self) -> Vec<Arc<Connection>> {
        let mut conns = self.conns.lock().unwrap();
        let mut idle = Vec::new();
        let mut i = 0;
        while i < conns.len() {
            if conns[i].is_sending() || conns[i].is_busy() {
                i += 1;
            } else {
                idle.push(conns.swap_remove(i));
            }
        }
        idle
    }

    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.conns.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}
