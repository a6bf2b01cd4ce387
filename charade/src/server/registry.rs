//! Live client connections keyed by descriptor.
//!
//! A `BTreeMap` keeps iteration order stable within a poll cycle, so the
//! interest set and the ready list always line up.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::os::fd::RawFd;

use super::connection::Connection;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<RawFd, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection. Returns its key.
    pub fn insert(&mut self, connection: Connection) -> RawFd {
        let fd = connection.fd();
        // The kernel never hands out a descriptor that is still open.
        debug_assert!(!self.connections.contains_key(&fd));
        self.connections.insert(fd, connection);
        fd
    }

    /// Stop tracking `fd`. Dropping the returned value closes the socket.
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.connections.remove(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, RawFd, Connection> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection, discarding anything in flight.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::bridge::codec::FrameCodec;

    #[test]
    fn insert_remove_and_ordering() {
        let mut registry = ConnectionRegistry::new();
        let mut peers = Vec::new();
        let mut keys = Vec::new();
        for _ in 0..3 {
            let (ours, theirs) = UnixStream::pair().unwrap();
            keys.push(registry.insert(Connection::new(ours, FrameCodec::default()).unwrap()));
            peers.push(theirs);
        }
        assert_eq!(registry.len(), 3);

        let order: Vec<RawFd> = registry.iter().map(|(fd, _)| *fd).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(order, sorted);

        let removed = registry.remove(keys[1]).unwrap();
        assert_eq!(removed.fd(), keys[1]);
        assert!(registry.get_mut(keys[1]).is_none());
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }
}
