use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::network::Connection;
use crate::{AppError, AppResult};

/// Bounded map of active connections, shared by the accept loop and business
/// code. The count never exceeds the cap; a connection that reached Closed is
/// no longer present.
pub struct ConnRegistry {
    conns: DashMap<u64, Arc<Connection>>,
    count: AtomicUsize,
    max_conn: usize,
}

impl ConnRegistry {
    pub fn new(max_conn: usize) -> Self {
        ConnRegistry {
            conns: DashMap::new(),
            count: AtomicUsize::new(0),
            max_conn,
        }
    }

    /// Claims a slot and registers the connection. The caller closes the
    /// underlying socket when this fails.
    pub fn add(&self, conn: Arc<Connection>) -> AppResult<()> {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current >= self.max_conn {
                return Err(AppError::MaxConnectionsExceeded);
            }
            if self
                .count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.conns.insert(conn.id(), conn);
        Ok(())
    }

    pub fn remove(&self, conn_id: u64) -> Option<Arc<Connection>> {
        let removed = self.conns.remove(&conn_id).map(|(_, conn)| conn);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.conns.get(&conn_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every registered connection.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for entry in self.conns.iter() {
            f(entry.value());
        }
    }

    /// Snapshot of the current connections, for iteration that may call back
    /// into the registry.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_enforced() {
        let registry = ConnRegistry::new(2);
        let a = Connection::mock();
        let b = Connection::mock();
        let c = Connection::mock();

        registry.add(a.clone()).unwrap();
        registry.add(b).unwrap();
        assert!(matches!(
            registry.add(c.clone()),
            Err(AppError::MaxConnectionsExceeded)
        ));
        assert_eq!(registry.len(), 2);

        registry.remove(a.id());
        registry.add(c).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ConnRegistry::new(4);
        let conn = Connection::mock();
        registry.add(conn.clone()).unwrap();
        assert!(registry.remove(conn.id()).is_some());
        assert!(registry.remove(conn.id()).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_get_and_snapshot() {
        let registry = ConnRegistry::new(4);
        let conn = Connection::mock();
        registry.add(conn.clone()).unwrap();
        assert_eq!(registry.get(conn.id()).unwrap().id(), conn.id());
        assert_eq!(registry.snapshot().len(), 1);
        assert!(registry.get(conn.id() + 1).is_none());
    }
}
