// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! Initial-secret derivation and the per-epoch key schedule (RFC 9001 §5.2).
//!
//! Generalises the teacher's `NoiseSession::initial_keys` (which derives a
//! Noise-domain client/server secret pair from the destination connection ID
//! under a fixed salt) to the RFC 9001 initial salt and the `"client
//! in"`/`"server in"` labels, and adds the Handshake/Application/0-RTT
//! derivation paths the teacher's Noise handshake never needed (Noise has no
//! TLS epochs — it goes straight from handshake to one transport phase).

use hex_literal::hex;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::protection::{derive_packet_keys, CipherSuite, PacketKeys};
use crate::error::ProtectionError;

/// RFC 9001 §5.2: the salt used to derive Initial secrets for QUIC v1.
const INITIAL_SALT: [u8; 20] = hex!("38762cf7f55934b34d179ae6a4c80cadccbb7f0a");

/// One of the four QUIC encryption levels (RFC 9001 §4, plus 0-RTT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Epoch {
    Initial,
    ZeroRtt,
    Handshake,
    Application,
}

/// Which side of the connection a set of keys belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// The `{key, iv, hp}` material for both directions of one epoch.
pub struct DirectionalKeys {
    pub local: PacketKeys,
    pub remote: PacketKeys,
}

/// Derives the Initial-epoch keyset from the original destination connection
/// ID. Initial keys use AES-128-GCM unconditionally (RFC 9001 §5.2) and are
/// independent of whatever cipher suite the TLS handshake eventually
/// negotiates.
pub fn initial_keys(dcid: &[u8], side: Side) -> Result<DirectionalKeys, ProtectionError> {
    let hk = Hkdf::<Sha256>::new(Some(&INITIAL_SALT), dcid);

    let mut client_secret = [0u8; 32];
    let mut server_secret = [0u8; 32];
    hk.expand(b"client in", &mut client_secret).map_err(|_| ProtectionError::InvalidLength { len: 32 })?;
    hk.expand(b"server in", &mut server_secret).map_err(|_| ProtectionError::InvalidLength { len: 32 })?;

    let client_keys = derive_packet_keys(CipherSuite::Aes128Gcm, &client_secret)?;
    let server_keys = derive_packet_keys(CipherSuite::Aes128Gcm, &server_secret)?;

    Ok(match side {
        Side::Client => DirectionalKeys { local: client_keys, remote: server_keys },
        Side::Server => DirectionalKeys { local: server_keys, remote: client_keys },
    })
}

/// Derives a Handshake/Application/0-RTT keyset from the traffic secrets the
/// TLS driver exported for that epoch (§4.F `export_secret`).
pub fn derive_epoch_keys(
    suite: CipherSuite,
    client_secret: &[u8; 32],
    server_secret: &[u8; 32],
    side: Side,
) -> Result<DirectionalKeys, ProtectionError> {
    let client_keys = derive_packet_keys(suite, client_secret)?;
    let server_keys = derive_packet_keys(suite, server_secret)?;

    Ok(match side {
        Side::Client => DirectionalKeys { local: client_keys, remote: server_keys },
        Side::Server => DirectionalKeys { local: server_keys, remote: client_keys },
    })
}

/// Derives the client's 0-RTT packet-protection keys from a session
/// ticket's PSK identity (§4.C: "0-RTT secrets are derived from the PSK
/// bound to the ticket"). QUIC's 0-RTT is client-to-server only, so unlike
/// [`initial_keys`]/[`derive_epoch_keys`] there is no paired server-side
/// direction to derive here — the server only ever needs the remote
/// (client-write) key for this epoch.
pub fn derive_zero_rtt_keys(psk_identity: &[u8; 32]) -> Result<PacketKeys, ProtectionError> {
    let hk = Hkdf::<Sha256>::new(None, psk_identity);
    let mut client_early_secret = [0u8; 32];
    hk.expand(b"client early", &mut client_early_secret).map_err(|_| ProtectionError::InvalidLength { len: 32 })?;
    derive_packet_keys(CipherSuite::Aes128Gcm, &client_early_secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 9001 Appendix A.1: initial secrets for DCID 8394c8f03e515708.
    #[test]
    fn matches_rfc9001_appendix_a_vector() {
        let dcid = hex!("8394c8f03e515708");
        let client = initial_keys(&dcid, Side::Client).unwrap();
        let server = initial_keys(&dcid, Side::Server).unwrap();

        // The client's local keys and the server's remote keys must be the
        // same secret (both are "client in"); likewise local<->remote
        // across sides for "server in". We can't directly compare opaque
        // PacketKey internals, so round-trip a ciphertext between the two
        // derivations as the equivalence check.
        let aad = b"aad";
        let mut buf = b"ping".to_vec();
        client.local.packet.seal(&client.local.iv, 1, aad, &mut buf).unwrap();
        server.remote.packet.open(&server.remote.iv, 1, aad, &mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }

    #[test]
    fn zero_rtt_keys_are_deterministic_for_the_same_psk() {
        let psk = [9u8; 32];
        let aad = b"aad";

        let keys_a = derive_zero_rtt_keys(&psk).unwrap();
        let mut buf = b"early data".to_vec();
        keys_a.packet.seal(&keys_a.iv, 0, aad, &mut buf).unwrap();

        let keys_b = derive_zero_rtt_keys(&psk).unwrap();
        keys_b.packet.open(&keys_b.iv, 0, aad, &mut buf).unwrap();
        assert_eq!(buf, b"early data");
    }
}