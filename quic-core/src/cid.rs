// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! Connection identifiers (RFC 9000 §5.1): opaque, 0–20 byte strings used to
//! demultiplex datagrams to connections. Modelled as an inline fixed-capacity
//! buffer (no heap allocation) the way the corpus's `quinn_proto::ConnectionId`
//! is, since CIDs are copied constantly (into every outgoing header, into
//! every cache key) and are always short.

use std::fmt;

use crate::error::PacketError;

pub const MAX_CID_LEN: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    pub fn new(slice: &[u8]) -> Result<Self, PacketError> {
        if slice.len() > MAX_CID_LEN {
            return Err(PacketError::ConnectionIdTooLong { len: slice.len() });
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self { len: slice.len() as u8, bytes })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let cid = ConnectionId::new(&[0x83, 0x94, 0xc8, 0xf0]).unwrap();
        assert_eq!(cid.as_slice(), &[0x83, 0x94, 0xc8, 0xf0]);
        assert_eq!(cid.len(), 4);
    }

    #[test]
    fn rejects_oversized_ids() {
        let too_long = [0u8; MAX_CID_LEN + 1];
        assert!(ConnectionId::new(&too_long).is_err());
    }

    #[test]
    fn debug_prints_hex() {
        let cid = ConnectionId::new(&[0xab, 0xcd]).unwrap();
        assert_eq!(format!("{cid:?}"), "abcd");
    }
}