// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! Session-ticket and address-validation-token caches (spec component H).
//! Both are bounded maps that evict the oldest entry once a capacity is
//! reached, mirroring the teacher's `reusable_id_pool`-adjacent preference
//! for caller-owned bounded collections over unbounded growth, generalised
//! here to ticket/token lifetimes rather than ID reuse.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{AddressMismatchSnafu, CacheError, ExpiredSnafu, NotFoundSnafu};

/// A resumption ticket issued at handshake completion (spec §3 Session
/// Ticket).
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub psk_identity: [u8; 32],
    pub ticket_body: Vec<u8>,
    pub issued_at: Instant,
    pub lifetime: Duration,
    pub max_early_data: u32,
}

impl SessionTicket {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.issued_at) > self.lifetime
    }
}

/// Maps PSK identity to ticket (spec §4.H `SessionCache`). Reads and writes
/// are both `&mut self`: the design notes place all cache mutation inside a
/// single loop's turn, so no internal locking is needed (§5 Concurrency).
#[derive(Default)]
pub struct SessionCache {
    tickets: HashMap<[u8; 32], SessionTicket>,
    insertion_order: Vec<[u8; 32]>,
    capacity: usize,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self { tickets: HashMap::new(), insertion_order: Vec::new(), capacity }
    }

    pub fn store(&mut self, ticket: SessionTicket) {
        if self.tickets.len() >= self.capacity && !self.tickets.contains_key(&ticket.psk_identity) {
            if let Some(oldest) = (!self.insertion_order.is_empty()).then(|| self.insertion_order.remove(0)) {
                self.tickets.remove(&oldest);
            }
        }
        self.insertion_order.push(ticket.psk_identity);
        self.tickets.insert(ticket.psk_identity, ticket);
    }

    /// Looks up a ticket without removing it: 0-RTT attempts consume the
    /// ticket's PSK repeatedly, they do not invalidate it (spec §3: "consumed
    /// (not removed) on 0-RTT attempts").
    pub fn get(&self, psk_identity: &[u8; 32]) -> Result<&SessionTicket, CacheError> {
        self.tickets.get(psk_identity).ok_or_else(|| NotFoundSnafu.build())
    }

    pub fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<[u8; 32]> = self.tickets.iter().filter(|(_, t)| t.is_expired(now)).map(|(id, _)| *id).collect();
        for id in expired {
            self.tickets.remove(&id);
            self.insertion_order.retain(|stored| stored != &id);
        }
    }
}

/// An address-validation token's bound metadata (spec §3 Address-Validation
/// Token).
#[derive(Debug, Clone, Copy)]
struct TokenEntry {
    client_addr: SocketAddr,
    issued_at: Instant,
}

/// Maps opaque token bytes to the address they validate (spec §4.H
/// `TokenCache`). The validity window binds to source address only, per the
/// Open Question resolution recorded in DESIGN.md (the original DCID is not
/// part of the validated identity).
pub struct TokenCache {
    tokens: HashMap<Vec<u8>, TokenEntry>,
    insertion_order: Vec<Vec<u8>>,
    capacity: usize,
    validity_window: Duration,
}

impl TokenCache {
    pub fn new(capacity: usize, validity_window: Duration) -> Self {
        Self { tokens: HashMap::new(), insertion_order: Vec::new(), capacity, validity_window }
    }

    pub fn store(&mut self, token: Vec<u8>, client_addr: SocketAddr, now: Instant) {
        if self.tokens.len() >= self.capacity && !self.tokens.contains_key(&token) {
            if let Some(oldest) = (!self.insertion_order.is_empty()).then(|| self.insertion_order.remove(0)) {
                self.tokens.remove(&oldest);
            }
        }
        self.insertion_order.push(token.clone());
        self.tokens.insert(token, TokenEntry { client_addr, issued_at: now });
    }

    /// Validates `token` was issued to `client_addr` and is still within the
    /// validity window.
    pub fn validate(&self, token: &[u8], client_addr: SocketAddr, now: Instant) -> Result<(), CacheError> {
        let entry = self.tokens.get(token).ok_or_else(|| NotFoundSnafu.build())?;
        if entry.client_addr != client_addr {
            return AddressMismatchSnafu.fail();
        }
        if now.duration_since(entry.issued_at) > self.validity_window {
            return ExpiredSnafu.fail();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn session_cache_evicts_oldest_entry_past_capacity() {
        let mut cache = SessionCache::new(2);
        let now = Instant::now();
        for i in 0u8..3 {
            let mut id = [0u8; 32];
            id[0] = i;
            cache.store(SessionTicket {
                psk_identity: id,
                ticket_body: vec![],
                issued_at: now,
                lifetime: Duration::from_secs(3600),
                max_early_data: 1024,
            });
        }
        let mut first_id = [0u8; 32];
        first_id[0] = 0;
        assert!(cache.get(&first_id).is_err(), "oldest entry should have been evicted");
    }

    #[test]
    fn token_cache_rejects_mismatched_address() {
        let mut cache = TokenCache::new(16, Duration::from_secs(60));
        let now = Instant::now();
        cache.store(b"tok".to_vec(), addr(1), now);
        assert!(cache.validate(b"tok", addr(2), now).is_err());
        assert!(cache.validate(b"tok", addr(1), now).is_ok());
    }

    #[test]
    fn token_cache_rejects_expired_token() {
        let mut cache = TokenCache::new(16, Duration::from_secs(0));
        let now = Instant::now();
        cache.store(b"tok".to_vec(), addr(1), now);
        let later = now + Duration::from_secs(1);
        assert!(matches!(cache.validate(b"tok", addr(1), later), Err(CacheError::Expired)));
    }
}