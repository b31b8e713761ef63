use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::rendezvous::tunnel::handle::{ConnectionHandle, ConnectionId};

pub const FIRST_ADDRESS: u16 = 0x0001;
pub const LAST_ADDRESS: u16 = 0xFFFE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("address space exhausted")]
    Exhausted,
    #[error("connection already bound at address {0}")]
    AlreadyBound(u16),
}

/// A client connection attached to a server session.
#[derive(Debug, Clone)]
pub struct ClientBinding {
    pub handle: ConnectionHandle,
    pub client_uuid: Uuid,
    pub client_name: String,
    pub bound_at_unix_ms: u64,
}

/// Per-session map from 16-bit socket address to client connection.
///
/// Addresses are issued from a monotonic counter and are not reused for the
/// lifetime of the session.
#[derive(Debug)]
pub struct AddressRegistry {
    next: u32,
    by_address: BTreeMap<u16, ClientBinding>,
    by_connection: HashMap<ConnectionId, u16>,
}

impl Default for AddressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self {
            next: u32::from(FIRST_ADDRESS),
            by_address: BTreeMap::new(),
            by_connection: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, binding: ClientBinding) -> Result<u16, RegistryError> {
        let conn = binding.handle.id();
        if let Some(&addr) = self.by_connection.get(&conn) {
            return Err(RegistryError::AlreadyBound(addr));
        }
        if self.next > u32::from(LAST_ADDRESS) {
            return Err(RegistryError::Exhausted);
        }
        let addr = self.next as u16;
        self.next += 1;
        self.by_address.insert(addr, binding);
        self.by_connection.insert(conn, addr);
        Ok(addr)
    }

    pub fn release(&mut self, address: u16) -> Option<ClientBinding> {
        let b = self.by_address.remove(&address)?;
        self.by_connection.remove(&b.handle.id());
        Some(b)
    }

    pub fn release_connection(&mut self, conn: ConnectionId) -> Option<(u16, ClientBinding)> {
        let addr = self.by_connection.remove(&conn)?;
        let b = self.by_address.remove(&addr)?;
        Some((addr, b))
    }

    pub fn lookup(&self, address: u16) -> Option<&ClientBinding> {
        self.by_address.get(&address)
    }

    pub fn address_of(&self, conn: ConnectionId) -> Option<u16> {
        self.by_connection.get(&conn).copied()
    }

    pub fn contains_client(&self, client_uuid: &Uuid) -> bool {
        self.by_address.values().any(|b| &b.client_uuid == client_uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &ClientBinding)> {
        self.by_address.iter().map(|(a, b)| (*a, b))
    }

    pub fn drain(&mut self) -> Vec<(u16, ClientBinding)> {
        self.by_connection.clear();
        std::mem::take(&mut self.by_address).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(n: u64) -> ClientBinding {
        let (handle, _rx) = ConnectionHandle::new(ConnectionId(n), None, "test");
        ClientBinding {
            handle,
            client_uuid: Uuid::new_v4(),
            client_name: format!("client-{n}"),
            bound_at_unix_ms: 0,
        }
    }

    #[test]
    fn allocates_monotonically_without_reuse() {
        let mut r = AddressRegistry::new();
        assert_eq!(r.allocate(binding(1)).unwrap(), 1);
        assert_eq!(r.allocate(binding(2)).unwrap(), 2);
        assert!(r.release(1).is_some());
        assert!(r.release(1).is_none());
        assert_eq!(r.allocate(binding(3)).unwrap(), 3);
        assert_eq!(r.len(), 2);
        assert!(r.lookup(1).is_none());
        assert_eq!(r.lookup(3).unwrap().client_name, "client-3");
    }

    #[test]
    fn reverse_index_follows_releases() {
        let mut r = AddressRegistry::new();
        let b = binding(7);
        let uuid = b.client_uuid;
        let addr = r.allocate(b).unwrap();
        assert_eq!(r.address_of(ConnectionId(7)), Some(addr));
        assert!(r.contains_client(&uuid));
        assert_eq!(r.allocate(binding(7)).unwrap_err(), RegistryError::AlreadyBound(addr));

        let (released, _) = r.release_connection(ConnectionId(7)).unwrap();
        assert_eq!(released, addr);
        assert_eq!(r.address_of(ConnectionId(7)), None);
        assert!(!r.contains_client(&uuid));
        assert!(r.is_empty());
    }

    #[test]
    fn exhausts_after_last_address() {
        let mut r = AddressRegistry::new();
        r.next = u32::from(LAST_ADDRESS);
        assert_eq!(r.allocate(binding(1)).unwrap(), LAST_ADDRESS);
        assert_eq!(r.allocate(binding(2)).unwrap_err(), RegistryError::Exhausted);
        // Releasing does not make room; addresses are never recycled.
        r.release(LAST_ADDRESS);
        assert_eq!(r.allocate(binding(3)).unwrap_err(), RegistryError::Exhausted);
    }

    #[test]
    fn drain_empties_both_indexes() {
        let mut r = AddressRegistry::new();
        for n in 1..=3 {
            r.allocate(binding(n)).unwrap();
        }
        let drained = r.drain();
        assert_eq!(drained.iter().map(|(a, _)| *a).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(r.is_empty());
        assert_eq!(r.address_of(ConnectionId(2)), None);
    }
}
