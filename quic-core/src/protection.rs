// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! HKDF-Expand-Label, AEAD packet protection, and header protection (RFC 9001
//! §5). Generalises the teacher's `TransportHeaderKey`/`TransportPacketKey`
//! pair (which derived QUIC key material from a Noise cipherstate key via a
//! raw `HKDF-Expand`) to the two real QUIC/TLS cipher suites, and to the full
//! TLS 1.3 `HKDF-Expand-Label` wire form the teacher's Noise handshake never
//! needed (Noise has no `Context` argument to carry).

use aead::{generic_array::GenericArray, AeadInPlace, KeyInit};
use aes::cipher::BlockEncrypt;
use aes_gcm::Aes128Gcm;
use chacha20::{
    cipher::{typenum::U10, KeyIvInit, StreamCipherCore, StreamCipherSeekCore},
    ChaChaCore,
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{AeadAuthFailedSnafu, InvalidLengthSnafu, ProtectionError, SampleOutOfBoundsSnafu};

/// Which AEAD/header-protection suite a connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128Gcm,
    Chacha20Poly1305,
}

impl CipherSuite {
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Chacha20Poly1305 => 32,
        }
    }

    pub const fn iv_len(self) -> usize {
        12
    }

    pub const fn hp_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Chacha20Poly1305 => 32,
        }
    }

    pub const fn tag_len(self) -> usize {
        16
    }
}

/// Implements RFC 8446 §7.1's `HKDF-Expand-Label`, wire-encoding the label as
/// `u16 total_length || u8 label_len || "tls13 " ++ label || u8 ctx_len || ctx`
/// and using it as the `info` argument to `HKDF-Expand`.
pub fn hkdf_expand_label(
    secret: &[u8; 32],
    label: &str,
    context: &[u8],
    out: &mut [u8],
) -> Result<(), ProtectionError> {
    let full_label = format!("tls13 {label}");
    if full_label.len() > 255 || context.len() > 255 || out.len() > u16::MAX as usize {
        return InvalidLengthSnafu { len: out.len() }.fail();
    }

    let mut hkdf_label = Vec::with_capacity(2 + 1 + full_label.len() + 1 + context.len());
    hkdf_label.extend_from_slice(&(out.len() as u16).to_be_bytes());
    hkdf_label.push(full_label.len() as u8);
    hkdf_label.extend_from_slice(full_label.as_bytes());
    hkdf_label.push(context.len() as u8);
    hkdf_label.extend_from_slice(context);

    let hk = Hkdf::<Sha256>::from_prk(secret).map_err(|_| ProtectionError::InvalidLength { len: secret.len() })?;
    hk.expand(&hkdf_label, out).map_err(|_| ProtectionError::InvalidLength { len: out.len() })
}

/// Derives the QUIC-specific `key`/`iv`/`hp` triplet from a per-epoch secret
/// via the plain (non-TLS-1.3-wire) `"quic key"`/`"quic iv"`/`"quic hp"`
/// labels used by RFC 9001 §5.1, which QUIC defines via `HKDF-Expand-Label`
/// with an empty context.
pub fn derive_packet_keys(suite: CipherSuite, secret: &[u8; 32]) -> Result<PacketKeys, ProtectionError> {
    let mut key = vec![0u8; suite.key_len()];
    let mut iv = [0u8; 12];
    let mut hp = vec![0u8; suite.hp_len()];

    hkdf_expand_label(secret, "quic key", &[], &mut key)?;
    hkdf_expand_label(secret, "quic iv", &[], &mut iv)?;
    hkdf_expand_label(secret, "quic hp", &[], &mut hp)?;

    let packet = PacketKey::new(suite, &key);
    let header = HeaderProtectionKey::new(suite, &hp);

    key.zeroize();
    hp.zeroize();

    Ok(PacketKeys { packet, header, iv })
}

/// The `{key, iv, hp}` triplet for one direction of one epoch.
pub struct PacketKeys {
    pub packet: PacketKey,
    pub header: HeaderProtectionKey,
    pub iv: [u8; 12],
}

/// AEAD payload protection. Nonce is the per-epoch IV XORed with the
/// left-padded packet number, as RFC 9001 §5.3 specifies.
pub enum PacketKey {
    Aes128Gcm(Box<Aes128Gcm>),
    Chacha20Poly1305(Box<ChaCha20Poly1305>),
}

impl PacketKey {
    fn new(suite: CipherSuite, key: &[u8]) -> Self {
        match suite {
            CipherSuite::Aes128Gcm => Self::Aes128Gcm(Box::new(Aes128Gcm::new(GenericArray::from_slice(key)))),
            CipherSuite::Chacha20Poly1305 => {
                Self::Chacha20Poly1305(Box::new(ChaCha20Poly1305::new(GenericArray::from_slice(key))))
            }
        }
    }

    pub fn tag_len(&self) -> usize {
        16
    }

    fn nonce(iv: &[u8; 12], packet_number: u64) -> [u8; 12] {
        let mut nonce = *iv;
        let pn_bytes = packet_number.to_be_bytes();
        for (n, p) in nonce.iter_mut().rev().zip(pn_bytes.iter().rev()) {
            *n ^= p;
        }
        nonce
    }

    /// Encrypts `plaintext` in place, appending the 16-byte tag. `buf` must
    /// have `plaintext.len() + 16` bytes of capacity already accounted for by
    /// the caller (it is resized here).
    pub fn seal(&self, iv: &[u8; 12], packet_number: u64, aad: &[u8], buf: &mut Vec<u8>) -> Result<(), ProtectionError> {
        let nonce = Self::nonce(iv, packet_number);
        let result = match self {
            Self::Aes128Gcm(k) => k.encrypt_in_place(GenericArray::from_slice(&nonce), aad, buf),
            Self::Chacha20Poly1305(k) => k.encrypt_in_place(GenericArray::from_slice(&nonce), aad, buf),
        };
        result.map_err(|_| ProtectionError::AeadAuthFailed)
    }

    /// Decrypts `buf` (ciphertext + trailing tag) in place, truncating it to
    /// the plaintext length on success.
    pub fn open(&self, iv: &[u8; 12], packet_number: u64, aad: &[u8], buf: &mut Vec<u8>) -> Result<(), ProtectionError> {
        let nonce = Self::nonce(iv, packet_number);
        let result = match self {
            Self::Aes128Gcm(k) => k.decrypt_in_place(GenericArray::from_slice(&nonce), aad, buf),
            Self::Chacha20Poly1305(k) => k.decrypt_in_place(GenericArray::from_slice(&nonce), aad, buf),
        };
        result.map_err(|_| AeadAuthFailedSnafu.build())
    }
}

/// Header protection mask derivation and application (RFC 9001 §5.4).
pub enum HeaderProtectionKey {
    Aes128(Box<aes::Aes128>),
    Chacha20([u8; 32]),
}

impl HeaderProtectionKey {
    fn new(suite: CipherSuite, hp: &[u8]) -> Self {
        match suite {
            CipherSuite::Aes128Gcm => Self::Aes128(Box::new(aes::Aes128::new(GenericArray::from_slice(hp)))),
            CipherSuite::Chacha20Poly1305 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(hp);
                Self::Chacha20(key)
            }
        }
    }

    pub const fn sample_len(&self) -> usize {
        16
    }

    fn mask(&self, sample: &[u8; 16]) -> [u8; 5] {
        match self {
            Self::Aes128(cipher) => {
                let mut block = GenericArray::clone_from_slice(sample);
                cipher.encrypt_block(&mut block);
                let mut mask = [0u8; 5];
                mask.copy_from_slice(&block[..5]);
                mask
            }
            Self::Chacha20(key) => {
                let counter = u32::from_le_bytes(sample[..4].try_into().expect("4 bytes"));
                let nonce = &sample[4..16];
                let mut core = ChaChaCore::<U10>::new(key.into(), nonce.into());
                core.set_block_pos(counter);
                let mut mask = [0u8; 5];
                core.apply_keystream_partial((&mut mask[..]).into());
                mask
            }
        }
    }

    fn sample(pn_offset: usize, packet: &[u8]) -> Result<[u8; 16], ProtectionError> {
        let start = pn_offset.checked_add(4).ok_or(ProtectionError::SampleOutOfBounds {
            pn_offset,
            needed: 20,
            available: packet.len().saturating_sub(pn_offset),
        })?;
        let end = start.checked_add(16).ok_or(ProtectionError::SampleOutOfBounds {
            pn_offset,
            needed: 20,
            available: packet.len().saturating_sub(pn_offset),
        })?;
        let slice = packet.get(start..end).ok_or_else(|| {
            SampleOutOfBoundsSnafu { pn_offset, needed: 20usize, available: packet.len().saturating_sub(pn_offset) }.build()
        })?;
        Ok(slice.try_into().expect("checked length above"))
    }

    /// Applies header protection to an outgoing packet. `pn_offset` is the
    /// byte offset of the (still-cleartext) packet number field.
    pub fn encrypt(&self, pn_offset: usize, packet: &mut [u8]) -> Result<(), ProtectionError> {
        let sample = Self::sample(pn_offset, packet)?;
        let mask = self.mask(&sample);

        let first = packet.get_mut(0).ok_or(ProtectionError::SampleOutOfBounds { pn_offset, needed: 1, available: 0 })?;
        let pn_len = (*first & 0x03) as usize + 1;
        if *first & 0x80 != 0 {
            *first ^= mask[0] & 0x0f;
        } else {
            *first ^= mask[0] & 0x1f;
        }

        let pn_end = pn_offset + pn_len;
        for (b, m) in packet[pn_offset..pn_end].iter_mut().zip(&mask[1..1 + pn_len]) {
            *b ^= m;
        }
        Ok(())
    }

    /// Removes header protection from an incoming packet. `pn_offset` is the
    /// byte offset immediately after the still-protected Length field (i.e.
    /// where the PN field starts once unmasked). Must be called before the
    /// PN length (low two bits of byte 0) or the PN bytes are interpreted.
    pub fn decrypt(&self, pn_offset: usize, packet: &mut [u8]) -> Result<(), ProtectionError> {
        let sample = Self::sample(pn_offset, packet)?;
        let mask = self.mask(&sample);

        let first = packet.get_mut(0).ok_or(ProtectionError::SampleOutOfBounds { pn_offset, needed: 1, available: 0 })?;
        if *first & 0x80 != 0 {
            *first ^= mask[0] & 0x0f;
        } else {
            *first ^= mask[0] & 0x1f;
        }
        let pn_len = (*first & 0x03) as usize + 1;

        let pn_end = pn_offset + pn_len;
        for (b, m) in packet[pn_offset..pn_end].iter_mut().zip(&mask[1..1 + pn_len]) {
            *b ^= m;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trips_for_both_suites() {
        for suite in [CipherSuite::Aes128Gcm, CipherSuite::Chacha20Poly1305] {
            let secret = [7u8; 32];
            let keys = derive_packet_keys(suite, &secret).unwrap();
            let aad = b"header bytes up to and including pn";
            let plaintext = b"CRYPTO frame payload".to_vec();

            let mut buf = plaintext.clone();
            keys.packet.seal(&keys.iv, 42, aad, &mut buf).unwrap();
            assert_eq!(buf.len(), plaintext.len() + 16);

            keys.packet.open(&keys.iv, 42, aad, &mut buf).unwrap();
            assert_eq!(buf, plaintext);
        }
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let keys = derive_packet_keys(CipherSuite::Aes128Gcm, &[1u8; 32]).unwrap();
        let mut buf = b"hello".to_vec();
        keys.packet.seal(&keys.iv, 0, b"aad", &mut buf).unwrap();
        *buf.last_mut().unwrap() ^= 0xff;
        assert!(keys.packet.open(&keys.iv, 0, b"aad", &mut buf).is_err());
    }

    #[test]
    fn header_protection_is_an_involution() {
        for suite in [CipherSuite::Aes128Gcm, CipherSuite::Chacha20Poly1305] {
            let keys = derive_packet_keys(suite, &[3u8; 32]).unwrap();
            let pn_offset = 10;
            let mut packet = vec![0x80u8; 64];
            packet[0] = 0xc3; // long header, 4-byte PN
            let original = packet.clone();

            keys.header.encrypt(pn_offset, &mut packet).unwrap();
            assert_ne!(packet, original);
            keys.header.decrypt(pn_offset, &mut packet).unwrap();
            assert_eq!(packet, original);
        }
    }

    #[test]
    fn hkdf_expand_label_matches_wire_form_length() {
        let secret = [9u8; 32];
        let mut out = [0u8; 32];
        hkdf_expand_label(&secret, "c hs traffic", &[], &mut out).unwrap();
        assert_ne!(out, [0u8; 32]);
    }
}