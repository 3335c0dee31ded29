// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! TLS 1.3 handshake engine abstraction (RFC 9001 §4, spec component F).
//!
//! `quic-core` owns the QUIC key schedule itself ([`crate::key_schedule`]);
//! the TLS engine's only job is to push the handshake bytes that travel in
//! CRYPTO frames and, as each new traffic secret is installed, hand the raw
//! secret back so the key schedule can derive `{key, iv, hp}` from it. This
//! mirrors the way the teacher's `NoiseSession` exposed raw handshake hashes
//! to its caller rather than deriving its own AEAD keys internally, except
//! here the handshake engine is a real TLS 1.3 stack instead of Noise.
//!
//! [`RustlsEngine`] drives `rustls::quic::Connection` purely as a
//! byte-pump: its own internally-derived QUIC keys are discarded, and a
//! [`rustls::KeyLog`] implementation captures the raw traffic secrets by
//! their standard TLS 1.3 exporter labels instead. [`MockEngine`] is a
//! deterministic in-memory stand-in for tests, sanctioned by the design
//! notes as the test-only alternative to a real TLS library.

use std::sync::{Arc, Mutex};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::quic::{Connection as RustlsQuicConnection, KeyChange, Version as RustlsQuicVersion};
use rustls::{ClientConfig, KeyLog, ServerConfig};

use crate::error::{CertificateLoadSnafu, FatalSnafu, NoPrivateKeySnafu, PrivateKeyLoadSnafu, RustlsSnafu, SecretNotReadySnafu, TlsError};
use crate::key_schedule::Epoch;

/// A traffic secret exported for one epoch and direction, keyed to the same
/// labels rustls's `KeyLog` trait already uses for `SSLKEYLOGFILE` export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretLabel {
    ClientHandshakeTraffic,
    ServerHandshakeTraffic,
    ClientTraffic0,
    ServerTraffic0,
    ClientEarlyTraffic,
}

impl SecretLabel {
    fn wire_label(self) -> &'static str {
        match self {
            Self::ClientHandshakeTraffic => "CLIENT_HANDSHAKE_TRAFFIC_SECRET",
            Self::ServerHandshakeTraffic => "SERVER_HANDSHAKE_TRAFFIC_SECRET",
            Self::ClientTraffic0 => "CLIENT_TRAFFIC_SECRET_0",
            Self::ServerTraffic0 => "SERVER_TRAFFIC_SECRET_0",
            Self::ClientEarlyTraffic => "CLIENT_EARLY_TRAFFIC_SECRET",
        }
    }

}

/// What the handshake engine produced after consuming a batch of incoming
/// CRYPTO bytes. Outgoing bytes are split per epoch because a single
/// `ClientHello` can make the server ready to emit both a ServerHello
/// (Initial epoch) and the rest of its flight (Handshake epoch) in one
/// pass — each must travel in a CRYPTO frame at its own encryption level
/// (spec §4.F, §8 scenario 1), never coalesced into one.
#[derive(Debug, Default)]
pub struct HandshakeProgress {
    pub initial_out: Vec<u8>,
    pub handshake_out: Vec<u8>,
    pub new_secrets_available: bool,
    pub handshake_complete: bool,
}

/// The TLS driver seam (spec component F). `RustlsEngine` and `MockEngine`
/// are the two implementations; connection.rs is generic over this trait so
/// tests can swap in the mock without touching connection-state logic.
pub trait TlsEngine {
    fn process_crypto(&mut self, epoch: Epoch, data: &[u8]) -> Result<HandshakeProgress, TlsError>;
    fn export_secret(&self, label: SecretLabel) -> Result<[u8; 32], TlsError>;
    fn is_handshake_complete(&self) -> bool;

    /// Whether the engine is willing to resume the session bound to this PSK
    /// identity with 0-RTT (spec §4.F `accept_early_data`). Session-ticket
    /// lookup, address validation, and the early-data size cap live in the
    /// gateway's ticket cache rather than the engine, so this is the
    /// engine's own say on top of that: whether it's configured to run
    /// 0-RTT at all.
    fn accept_early_data(&self, psk_identity: &[u8]) -> bool;
}

#[derive(Default)]
struct CapturedSecrets {
    secrets: std::collections::HashMap<String, [u8; 32]>,
}

/// Captures raw traffic secrets via rustls's standard key-logging seam
/// instead of letting rustls derive and own QUIC packet keys itself.
#[derive(Clone, Default)]
pub struct SecretCapture(Arc<Mutex<CapturedSecrets>>);

impl KeyLog for SecretCapture {
    fn log(&self, label: &str, _client_random: &[u8], secret: &[u8]) {
        if secret.len() != 32 {
            return;
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(secret);
        self.0.lock().expect("secret capture mutex poisoned").secrets.insert(label.to_string(), array);
    }
}

/// The certificate chain and private key loaded once at startup (spec §6:
/// "Both are read once; reload semantics are out of scope"). Kept around
/// rather than discarded after building one `ServerConfig`, because every
/// connection needs its *own* `ServerConfig` with its own [`SecretCapture`]
/// sink — `KeyLog::log` only carries a label and the raw secret, not a
/// connection identifier, so sharing one capture across connections would
/// let one connection's secrets clobber another's before either exports
/// them.
pub struct ServerCertMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerCertMaterial {
    pub fn load(cert_path: &str, key_path: &str) -> Result<Self, TlsError> {
        let cert_file = std::fs::File::open(cert_path).map_err(|source| TlsError::CertificateLoad { path: cert_path.to_string(), source })?;
        let mut reader = std::io::BufReader::new(cert_file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::CertificateLoad { path: cert_path.to_string(), source })?;

        let key_file = std::fs::File::open(key_path).map_err(|source| TlsError::PrivateKeyLoad { path: key_path.to_string(), source })?;
        let mut key_reader = std::io::BufReader::new(key_file);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|source| TlsError::PrivateKeyLoad { path: key_path.to_string(), source })?
            .ok_or_else(|| NoPrivateKeySnafu { path: key_path.to_string() }.build())?;

        Ok(Self { certs, key })
    }

    /// Builds a fresh `rustls::ServerConfig` (and its paired, not-yet-shared
    /// [`SecretCapture`]) for one new connection.
    pub fn build_config(&self) -> Result<(Arc<ServerConfig>, SecretCapture), TlsError> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|source| TlsError::Rustls { source })?;
        config.max_early_data_size = u32::MAX;
        let capture = SecretCapture::default();
        config.key_log = Arc::new(capture.clone());

        Ok((Arc::new(config), capture))
    }
}

/// Drives a real TLS 1.3 handshake over QUIC via `rustls::quic::Connection`,
/// discarding rustls's own derived QUIC keys and instead reading raw traffic
/// secrets back out through [`SecretCapture`].
pub struct RustlsEngine {
    conn: RustlsQuicConnection,
    capture: SecretCapture,
    handshake_complete: bool,
    /// Which epoch `write_hs` is currently drawing from. Starts at Initial;
    /// advances each time `write_hs` reports a `KeyChange`, since the bytes
    /// written *before* that signal belong to the level that was active
    /// when the call began.
    write_epoch: Epoch,
}

impl RustlsEngine {
    pub fn new_server(config: Arc<ServerConfig>, capture: SecretCapture, params: &[u8]) -> Result<Self, TlsError> {
        let conn = rustls::quic::Connection::Server(
            rustls::quic::ServerConnection::new(config, RustlsQuicVersion::V1, params.to_vec())
                .map_err(|source| TlsError::Rustls { source })?,
        );
        Ok(Self { conn, capture, handshake_complete: false, write_epoch: Epoch::Initial })
    }

    pub fn new_client(
        config: Arc<ClientConfig>,
        capture: SecretCapture,
        server_name: rustls_pki_types::ServerName<'static>,
        params: &[u8],
    ) -> Result<Self, TlsError> {
        let conn = rustls::quic::Connection::Client(
            rustls::quic::ClientConnection::new(config, RustlsQuicVersion::V1, server_name, params.to_vec())
                .map_err(|source| TlsError::Rustls { source })?,
        );
        Ok(Self { conn, capture, handshake_complete: false, write_epoch: Epoch::Initial })
    }
}

impl TlsEngine for RustlsEngine {
    fn process_crypto(&mut self, _epoch: Epoch, data: &[u8]) -> Result<HandshakeProgress, TlsError> {
        self.conn.read_hs(data).map_err(|source| TlsError::Rustls { source })?;

        if self.conn.alert().is_some() {
            return FatalSnafu { reason: "TLS alert raised during handshake".to_string() }.fail();
        }

        let mut progress = HandshakeProgress::default();

        // A single ClientHello can make both the Initial-epoch ServerHello
        // and the Handshake-epoch rest of the flight available at once;
        // loop until write_hs has nothing left to hand us, routing each
        // chunk to the epoch that was active when it was written.
        loop {
            let mut chunk = Vec::new();
            let key_change = self.conn.write_hs(&mut chunk);

            match self.write_epoch {
                Epoch::Initial => progress.initial_out.extend_from_slice(&chunk),
                Epoch::Handshake => progress.handshake_out.extend_from_slice(&chunk),
                Epoch::Application | Epoch::ZeroRtt => {}
            }

            match key_change {
                Some(KeyChange::Handshake { .. }) => {
                    self.write_epoch = Epoch::Handshake;
                    progress.new_secrets_available = true;
                }
                Some(KeyChange::OneRtt { .. }) => {
                    self.write_epoch = Epoch::Application;
                    progress.new_secrets_available = true;
                    break;
                }
                None if chunk.is_empty() => break,
                None => {}
            }
        }

        self.handshake_complete = match &self.conn {
            RustlsQuicConnection::Client(c) => !c.is_handshaking(),
            RustlsQuicConnection::Server(s) => !s.is_handshaking(),
        };

        Ok(HandshakeProgress { handshake_complete: self.handshake_complete, ..progress })
    }

    fn export_secret(&self, label: SecretLabel) -> Result<[u8; 32], TlsError> {
        let secrets = self.capture.0.lock().expect("secret capture mutex poisoned");
        secrets
            .secrets
            .get(label.wire_label())
            .copied()
            .ok_or_else(|| SecretNotReadySnafu { label: label.wire_label().to_string() }.build())
    }

    fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    fn accept_early_data(&self, _psk_identity: &[u8]) -> bool {
        // Ticket validity and the PSK-identity match are already enforced
        // by the gateway's session cache before this is ever consulted;
        // rustls's own max_early_data_size is left wide open (build_config
        // sets it to u32::MAX) so this engine never second-guesses that
        // decision.
        true
    }
}

/// A deterministic, in-memory handshake stand-in for tests (spec §9 design
/// notes: "in-memory mock for tests"). Skips real TLS entirely: both sides
/// exchange one fixed-size CRYPTO message each and then derive their
/// traffic secrets from a shared fixed seed plus the epoch/side, so tests
/// get byte-identical keys on both ends without running a real handshake.
pub struct MockEngine {
    side_is_client: bool,
    messages_sent: u32,
    handshake_complete: bool,
}

impl MockEngine {
    pub fn new(side_is_client: bool) -> Self {
        Self { side_is_client, messages_sent: 0, handshake_complete: false }
    }

    fn mock_secret(&self, label: SecretLabel) -> [u8; 32] {
        let mut secret = [0u8; 32];
        let tag = match label {
            SecretLabel::ClientHandshakeTraffic => b'h',
            SecretLabel::ServerHandshakeTraffic => b'H',
            SecretLabel::ClientTraffic0 => b'a',
            SecretLabel::ServerTraffic0 => b'A',
            SecretLabel::ClientEarlyTraffic => b'e',
        };
        secret[0] = tag;
        secret[1..].fill(0x42);
        secret
    }
}

impl TlsEngine for MockEngine {
    fn process_crypto(&mut self, epoch: Epoch, _data: &[u8]) -> Result<HandshakeProgress, TlsError> {
        self.messages_sent += 1;
        let handshake_complete = self.messages_sent >= 2;
        self.handshake_complete = handshake_complete;

        let outgoing = if self.messages_sent == 1 {
            if self.side_is_client { b"client-hello-mock".to_vec() } else { b"server-hello-mock".to_vec() }
        } else {
            Vec::new()
        };

        let mut progress = HandshakeProgress { new_secrets_available: true, handshake_complete, ..Default::default() };
        match epoch {
            Epoch::Initial => progress.initial_out = outgoing,
            _ => progress.handshake_out = outgoing,
        }

        Ok(progress)
    }

    fn export_secret(&self, label: SecretLabel) -> Result<[u8; 32], TlsError> {
        Ok(self.mock_secret(label))
    }

    fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    fn accept_early_data(&self, psk_identity: &[u8]) -> bool {
        !psk_identity.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_engine_completes_after_two_messages() {
        let mut client = MockEngine::new(true);
        let mut server = MockEngine::new(false);

        let progress = client.process_crypto(Epoch::Initial, &[]).unwrap();
        assert!(!progress.handshake_complete);
        let progress = server.process_crypto(Epoch::Initial, &progress.initial_out).unwrap();
        assert!(!progress.handshake_complete);
        let progress = client.process_crypto(Epoch::Handshake, &progress.initial_out).unwrap();
        assert!(progress.handshake_complete);
    }

    #[test]
    fn mock_engine_exports_matching_secrets_on_both_sides() {
        let client = MockEngine::new(true);
        let server = MockEngine::new(false);

        assert_eq!(
            client.export_secret(SecretLabel::ClientTraffic0).unwrap(),
            server.export_secret(SecretLabel::ClientTraffic0).unwrap()
        );
    }

    #[test]
    fn mock_engine_rejects_early_data_for_an_empty_psk_identity() {
        let server = MockEngine::new(false);
        assert!(server.accept_early_data(&[1, 2, 3]));
        assert!(!server.accept_early_data(&[]));
    }
}