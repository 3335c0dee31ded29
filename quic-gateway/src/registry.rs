// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! The connection table the UDP loop demultiplexes datagrams against (spec
//! component J). Connections live in a [`slab::Slab`] for stable, reusable
//! indices (matching the corpus's preference for slab-backed tables over
//! growing-and-shrinking `Vec`s of optional entries); a `ConnectionId ->
//! slab key` index supports lookup both by the original DCID a client's
//! first Initial carries and by the server-chosen CID the client switches
//! to afterward (see [`Connection::server_cid`]).

use std::collections::HashMap;
use std::time::Instant;

use quic_core::cid::ConnectionId;
use quic_core::connection::Connection;
use snafu::Snafu;
use snafu_cli_debug::SnafuCliDebug;
use tracing::debug;

#[derive(Snafu, SnafuCliDebug)]
pub enum RegistryError {
    #[snafu(display("connection table is at its configured capacity of {max_connections}"))]
    Full { max_connections: usize },
}

/// Hashes a connection ID down to a shard number, per spec §5: "shard
/// connections across loops by DCID hash; a connection is bound to a single
/// loop for its lifetime." This single-loop gateway only ever asks for
/// shard 0 of 1, but the function is exposed so a multi-loop deployment can
/// reuse the same placement rule every loop agrees on.
pub fn shard_for(dcid: &ConnectionId, num_shards: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    dcid.as_slice().hash(&mut hasher);
    (hasher.finish() as usize) % num_shards.max(1)
}

pub struct ConnectionRegistry {
    connections: slab::Slab<Connection>,
    index: HashMap<ConnectionId, usize>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self { connections: slab::Slab::new(), index: HashMap::new(), max_connections }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Inserts a freshly created connection, indexed under both the
    /// client's original DCID and the server's own chosen CID. Fails once
    /// the table is at `max_connections` (spec §6 `max_connections`).
    pub fn insert(&mut self, original_dcid: ConnectionId, server_cid: ConnectionId, connection: Connection) -> Result<(), RegistryError> {
        if self.connections.len() >= self.max_connections {
            return FullSnafu { max_connections: self.max_connections }.fail();
        }
        let key = self.connections.insert(connection);
        self.index.insert(original_dcid, key);
        self.index.insert(server_cid, key);
        Ok(())
    }

    pub fn get_mut(&mut self, dcid: &ConnectionId) -> Option<&mut Connection> {
        let key = *self.index.get(dcid)?;
        self.connections.get_mut(key)
    }

    pub fn contains(&self, dcid: &ConnectionId) -> bool {
        self.index.contains_key(dcid)
    }

    /// Checks every connection's timeouts and removes the ones that have
    /// expired, freeing their slab slot and both index entries. Called on
    /// the spec §4.G ten-second cleanup cadence, not per datagram.
    pub fn scavenge(&mut self, now: Instant) {
        let mut dead = Vec::new();
        for (key, connection) in self.connections.iter_mut() {
            if connection.check_timeout(now).unwrap_or(true) {
                dead.push((key, connection.original_dcid, connection.server_cid));
            }
        }
        for (key, original_dcid, server_cid) in dead {
            debug!(dcid = %original_dcid, "scavenging connection");
            self.connections.remove(key);
            self.index.remove(&original_dcid);
            self.index.remove(&server_cid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quic_core::connection::Connection;
    use quic_core::key_schedule::{initial_keys, Side};
    use quic_core::tls::MockEngine;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4433)
    }

    fn test_connection(dcid: &ConnectionId, server_cid: ConnectionId) -> Connection {
        let directional = initial_keys(dcid.as_slice(), Side::Server).unwrap();
        let keys = quic_core::connection::EpochKeys { local: directional.local, remote: directional.remote };
        Connection::new_server(*dcid, server_cid, addr(), keys, Box::new(MockEngine::new(false)), Instant::now())
    }

    #[test]
    fn finds_connection_by_either_cid() {
        let mut registry = ConnectionRegistry::new(16);
        let dcid = ConnectionId::new(&[1, 2, 3, 4]).unwrap();
        let server_cid = ConnectionId::new(&[9, 9, 9, 9, 9, 9, 9, 9]).unwrap();
        registry.insert(dcid, server_cid, test_connection(&dcid, server_cid)).unwrap();

        assert!(registry.get_mut(&dcid).is_some());
        assert!(registry.get_mut(&server_cid).is_some());
    }

    #[test]
    fn rejects_insert_past_capacity() {
        let mut registry = ConnectionRegistry::new(1);
        let dcid_a = ConnectionId::new(&[1]).unwrap();
        let server_cid_a = ConnectionId::new(&[2]).unwrap();
        registry.insert(dcid_a, server_cid_a, test_connection(&dcid_a, server_cid_a)).unwrap();

        let dcid_b = ConnectionId::new(&[3]).unwrap();
        let server_cid_b = ConnectionId::new(&[4]).unwrap();
        assert!(registry.insert(dcid_b, server_cid_b, test_connection(&dcid_b, server_cid_b)).is_err());
    }

    #[test]
    fn shard_for_is_stable_for_the_same_id() {
        let dcid = ConnectionId::new(&[1, 2, 3]).unwrap();
        assert_eq!(shard_for(&dcid, 4), shard_for(&dcid, 4));
    }
}
