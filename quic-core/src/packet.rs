// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! Long- and short-header packet parsing and construction (RFC 9000 §17),
//! including header protection removal/application via the keys derived in
//! [`crate::protection`] and [`crate::key_schedule`].
//!
//! Header protection and AEAD sealing must be applied in the order RFC 9001
//! §5.4.1 mandates: the packet number length and value are themselves
//! protected, so a receiver must remove header protection *before* it can
//! even find out how long the packet number field is, let alone decrypt the
//! payload. [`Packet::decode`] follows this order exactly: find the PN
//! offset assuming the worst case, sample, unmask, re-read the real PN
//! length, then decrypt.

use crate::cid::ConnectionId;
use crate::error::{PacketError, UnknownVersionSnafu};
use crate::protection::{HeaderProtectionKey, PacketKey};
use crate::varint::VarInt;

/// The only QUIC version this core speaks.
pub const VERSION_1: u32 = 0x0000_0001;

/// Long-header packet types (RFC 9000 §17.2), distinguished by the low two
/// bits of the first byte when the long-header form bit is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
}

impl LongPacketType {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b00 => Some(Self::Initial),
            0b01 => Some(Self::ZeroRtt),
            0b10 => Some(Self::Handshake),
            _ => None,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Initial => 0b00,
            Self::ZeroRtt => 0b01,
            Self::Handshake => 0b10,
        }
    }
}

/// A decoded, decrypted packet header plus its (still opaque) payload.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    pub packet_type: PacketSpace,
    pub packet_number: u64,
    pub payload: Vec<u8>,
    /// The address-validation token carried by an Initial packet (§4.K.1);
    /// empty for every other packet type.
    pub token: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSpace {
    Initial,
    ZeroRtt,
    Handshake,
    Application,
}

impl From<LongPacketType> for PacketSpace {
    fn from(t: LongPacketType) -> Self {
        match t {
            LongPacketType::Initial => PacketSpace::Initial,
            LongPacketType::ZeroRtt => PacketSpace::ZeroRtt,
            LongPacketType::Handshake => PacketSpace::Handshake,
        }
    }
}

/// Minimum UDP datagram size for a client Initial packet (RFC 9000 §14.1):
/// the whole datagram, not just the QUIC packet, must reach 1200 bytes.
pub const MIN_INITIAL_DATAGRAM_SIZE: usize = 1200;

/// Decodes and decrypts one packet at the start of `datagram`, returning the
/// packet and the number of bytes it occupied (so callers can step past it
/// to find any coalesced packets that follow).
///
/// `hp_key` and `pn_and_payload_key` must already be the keys for this
/// packet's epoch; the caller is responsible for picking them based on the
/// first byte's header form and type before calling this, deriving Initial
/// keys from the observed DCID on first sight if necessary.
pub fn decode(
    datagram: &[u8],
    dcid_len_hint: usize,
    hp_key: &HeaderProtectionKey,
    packet_key: &PacketKey,
    iv: &[u8; 12],
    largest_acked: u64,
) -> Result<(DecodedPacket, usize), PacketError> {
    let first = *datagram.first().ok_or(PacketError::Truncated)?;

    if first & 0x80 != 0 {
        decode_long(datagram, hp_key, packet_key, iv, largest_acked)
    } else {
        decode_short(datagram, dcid_len_hint, hp_key, packet_key, iv, largest_acked)
    }
}

/// The connection-identifying fields a receiver can read straight off the
/// wire, before any keys exist to remove header protection. This is what
/// the UDP loop (spec component J) uses to demultiplex a datagram to a
/// connection and decide which epoch's keys `decode` needs.
#[derive(Debug, Clone)]
pub struct PeekedHeader {
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    pub packet_type: Option<LongPacketType>,
    pub version: Option<u32>,
}

/// Reads the DCID (and, for a long header, the SCID/type/version) without
/// touching header protection or the PN field. `short_dcid_len` is the
/// fixed DCID length this deployment uses for its own short-header
/// packets (spec §4.D: "taken at a fixed length agreed per connection").
pub fn peek_header(datagram: &[u8], short_dcid_len: usize) -> Result<PeekedHeader, PacketError> {
    let first = *datagram.first().ok_or(PacketError::Truncated)?;

    if first & 0x80 == 0 {
        let dcid = ConnectionId::new(datagram.get(1..1 + short_dcid_len).ok_or(PacketError::Truncated)?)?;
        return Ok(PeekedHeader { dcid, scid: None, packet_type: None, version: None });
    }

    if datagram.len() < 6 {
        return Err(PacketError::Truncated);
    }
    let version = u32::from_be_bytes(datagram[1..5].try_into().expect("4 bytes"));
    let packet_type = LongPacketType::from_bits((datagram[0] >> 4) & 0x03);

    let mut pos = 5;
    let dcid_len = *datagram.get(pos).ok_or(PacketError::Truncated)? as usize;
    pos += 1;
    let dcid = ConnectionId::new(datagram.get(pos..pos + dcid_len).ok_or(PacketError::Truncated)?)?;
    pos += dcid_len;

    let scid_len = *datagram.get(pos).ok_or(PacketError::Truncated)? as usize;
    pos += 1;
    let scid = ConnectionId::new(datagram.get(pos..pos + scid_len).ok_or(PacketError::Truncated)?)?;

    Ok(PeekedHeader { dcid, scid: Some(scid), packet_type, version })
}

/// Reads a 0-RTT packet's address-validation token ahead of having any
/// keys to remove header protection — the token field sits before the
/// HP-protected Length/PN fields and is itself sent in the clear. Real RFC
/// 9000 only carries a token on Initial packets and relies on
/// Initial+0-RTT coalescing to deliver one per flight; this core instead
/// expects every standalone 0-RTT packet to carry its own token (spec
/// §4.K), so the UDP loop can validate and resolve a PSK identity before
/// deriving 0-RTT keys.
pub fn peek_zero_rtt_token(datagram: &[u8]) -> Result<Vec<u8>, PacketError> {
    if datagram.len() < 6 {
        return Err(PacketError::Truncated);
    }
    let mut pos = 5;
    let dcid_len = *datagram.get(pos).ok_or(PacketError::Truncated)? as usize;
    pos += 1 + dcid_len;
    let scid_len = *datagram.get(pos).ok_or(PacketError::Truncated)? as usize;
    pos += 1 + scid_len;

    let (token_len, n) =
        VarInt::decode(datagram.get(pos..).ok_or(PacketError::Truncated)?).map_err(|source| PacketError::Varint { source })?;
    pos += n;
    let token_len = token_len.get() as usize;
    Ok(datagram.get(pos..pos + token_len).ok_or(PacketError::Truncated)?.to_vec())
}

fn decode_long(
    datagram: &[u8],
    hp_key: &HeaderProtectionKey,
    packet_key: &PacketKey,
    iv: &[u8; 12],
    largest_acked: u64,
) -> Result<(DecodedPacket, usize), PacketError> {
    if datagram.len() < 6 {
        return Err(PacketError::Truncated);
    }
    if datagram[0] & 0x40 == 0 {
        return Err(PacketError::InvalidFirstByte { byte: datagram[0] });
    }

    let version = u32::from_be_bytes(datagram[1..5].try_into().expect("4 bytes"));
    if version != VERSION_1 {
        return UnknownVersionSnafu { version }.fail();
    }

    let packet_type = LongPacketType::from_bits((datagram[0] >> 4) & 0x03)
        .ok_or(PacketError::InvalidFirstByte { byte: datagram[0] })?;

    let mut pos = 5;
    let dcid_len = *datagram.get(pos).ok_or(PacketError::Truncated)? as usize;
    pos += 1;
    let dcid = ConnectionId::new(datagram.get(pos..pos + dcid_len).ok_or(PacketError::Truncated)?)?;
    pos += dcid_len;

    let scid_len = *datagram.get(pos).ok_or(PacketError::Truncated)? as usize;
    pos += 1;
    let scid = ConnectionId::new(datagram.get(pos..pos + scid_len).ok_or(PacketError::Truncated)?)?;
    pos += scid_len;

    let mut token = Vec::new();
    if packet_type == LongPacketType::Initial || packet_type == LongPacketType::ZeroRtt {
        let (token_len, n) = VarInt::decode(datagram.get(pos..).ok_or(PacketError::Truncated)?)
            .map_err(|source| PacketError::Varint { source })?;
        pos += n;
        let token_len = token_len.get() as usize;
        token = datagram.get(pos..pos + token_len).ok_or(PacketError::Truncated)?.to_vec();
        pos += token_len;
    }

    let (length, n) =
        VarInt::decode(datagram.get(pos..).ok_or(PacketError::Truncated)?).map_err(|source| PacketError::Varint { source })?;
    pos += n;
    let length = length.get() as usize;

    let pn_offset = pos;
    let packet_end = pn_offset.checked_add(length).ok_or(PacketError::Truncated)?;
    if packet_end > datagram.len() {
        return Err(PacketError::Truncated);
    }

    let mut buf = datagram[..packet_end].to_vec();
    hp_key.decrypt(pn_offset, &mut buf).map_err(|source| PacketError::Protection { source })?;

    let pn_len = (buf[0] & 0x03) as usize + 1;
    let pn_bytes = &buf[pn_offset..pn_offset + pn_len];
    let truncated_pn = decode_pn_bytes(pn_bytes);
    let packet_number = decode_packet_number(truncated_pn, pn_len, largest_acked);

    let header_len = pn_offset + pn_len;
    let (header, ciphertext) = buf.split_at_mut(header_len);
    let mut payload = ciphertext.to_vec();
    packet_key
        .open(iv, packet_number, header, &mut payload)
        .map_err(|_| PacketError::AeadAuthFailed)?;

    Ok((
        DecodedPacket {
            dcid,
            scid: Some(scid),
            packet_type: packet_type.into(),
            packet_number,
            payload,
            token,
        },
        packet_end,
    ))
}

fn decode_short(
    datagram: &[u8],
    dcid_len: usize,
    hp_key: &HeaderProtectionKey,
    packet_key: &PacketKey,
    iv: &[u8; 12],
    largest_acked: u64,
) -> Result<(DecodedPacket, usize), PacketError> {
    if datagram[0] & 0x40 == 0 {
        return Err(PacketError::InvalidFirstByte { byte: datagram[0] });
    }

    let pn_offset = 1 + dcid_len;
    let dcid = ConnectionId::new(datagram.get(1..pn_offset).ok_or(PacketError::Truncated)?)?;

    let mut buf = datagram.to_vec();
    hp_key.decrypt(pn_offset, &mut buf).map_err(|source| PacketError::Protection { source })?;

    let pn_len = (buf[0] & 0x03) as usize + 1;
    let pn_bytes = &buf[pn_offset..pn_offset + pn_len];
    let truncated_pn = decode_pn_bytes(pn_bytes);
    let packet_number = decode_packet_number(truncated_pn, pn_len, largest_acked);

    let header_len = pn_offset + pn_len;
    let (header, ciphertext) = buf.split_at_mut(header_len);
    let mut payload = ciphertext.to_vec();
    packet_key
        .open(iv, packet_number, header, &mut payload)
        .map_err(|_| PacketError::AeadAuthFailed)?;

    Ok((
        DecodedPacket {
            dcid,
            scid: None,
            packet_type: PacketSpace::Application,
            packet_number,
            payload,
            token: Vec::new(),
        },
        buf.len(),
    ))
}

fn decode_pn_bytes(bytes: &[u8]) -> u32 {
    let mut padded = [0u8; 4];
    padded[4 - bytes.len()..].copy_from_slice(bytes);
    u32::from_be_bytes(padded)
}

/// Packet number decoding (RFC 9000 §17.1, Appendix A): reconstructs the
/// full packet number closest to `largest_acked + 1` that is consistent
/// with the truncated value on the wire.
fn decode_packet_number(truncated: u32, pn_len: usize, largest_acked: u64) -> u64 {
    let pn_nbits = pn_len as u32 * 8;
    let expected = largest_acked + 1;
    let win = 1u64 << pn_nbits;
    let half_win = win / 2;
    let pn_hi = expected & !(win - 1);
    let candidate = pn_hi | (truncated as u64);

    if candidate + half_win <= expected && candidate + win < (1u64 << 62) {
        candidate + win
    } else if candidate > expected + half_win && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Encodes the smallest number of bytes (1-4) needed to represent
/// `packet_number` unambiguously given `largest_acked` (RFC 9000 §17.1).
pub fn encode_pn_length(packet_number: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(la) => packet_number.saturating_sub(la),
        None => packet_number + 1,
    };
    let bits = 64 - (num_unacked * 2 + 1).leading_zeros();
    (bits as usize).div_ceil(8).clamp(1, 4)
}

/// Builds a long-header packet (Initial/0-RTT/Handshake), applies AEAD
/// protection to the payload and header protection to the header, and pads
/// Initial packets up to [`MIN_INITIAL_DATAGRAM_SIZE`] as RFC 9000 §14.1
/// requires.
#[allow(clippy::too_many_arguments)]
pub fn encode_long(
    packet_type: LongPacketType,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    packet_number: u64,
    pn_len: usize,
    payload: &[u8],
    packet_key: &PacketKey,
    iv: &[u8; 12],
    hp_key: &HeaderProtectionKey,
    pad_to_min_datagram: bool,
) -> Result<Vec<u8>, PacketError> {
    let mut header = Vec::with_capacity(32);
    let first_byte = 0xc0 | (packet_type.to_bits() << 4) | (pn_len as u8 - 1);
    header.push(first_byte);
    header.extend_from_slice(&VERSION_1.to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid.as_slice());
    header.push(scid.len() as u8);
    header.extend_from_slice(scid.as_slice());
    if packet_type == LongPacketType::Initial || packet_type == LongPacketType::ZeroRtt {
        header.extend_from_slice(&VarInt::try_from(token.len()).map_err(|source| PacketError::Varint { source })?.to_vec());
        header.extend_from_slice(token);
    }

    let mut inner_payload = payload.to_vec();
    if pad_to_min_datagram && packet_type == LongPacketType::Initial {
        let tag_len = packet_key.tag_len();
        let unpadded_total = header.len()
            + VarInt::try_from(inner_payload.len() + pn_len + tag_len).unwrap().encoded_len()
            + pn_len
            + inner_payload.len()
            + tag_len;
        if unpadded_total < MIN_INITIAL_DATAGRAM_SIZE {
            inner_payload.resize(inner_payload.len() + (MIN_INITIAL_DATAGRAM_SIZE - unpadded_total), 0);
        }
    }

    let length = pn_len + inner_payload.len() + packet_key.tag_len();
    header.extend_from_slice(&VarInt::try_from(length).map_err(|source| PacketError::Varint { source })?.to_vec());

    let pn_offset = header.len();
    let pn_bytes = packet_number.to_be_bytes();
    header.extend_from_slice(&pn_bytes[8 - pn_len..]);

    let mut buf = inner_payload;
    packet_key
        .seal(iv, packet_number, &header, &mut buf)
        .map_err(|_| PacketError::AeadAuthFailed)?;

    let mut datagram = header;
    datagram.append(&mut buf);
    hp_key.encrypt(pn_offset, &mut datagram).map_err(|source| PacketError::Protection { source })?;

    Ok(datagram)
}

/// Builds a short-header (1-RTT) packet.
pub fn encode_short(
    dcid: &ConnectionId,
    packet_number: u64,
    pn_len: usize,
    spin_bit: bool,
    key_phase: bool,
    payload: &[u8],
    packet_key: &PacketKey,
    iv: &[u8; 12],
    hp_key: &HeaderProtectionKey,
) -> Result<Vec<u8>, PacketError> {
    let mut header = Vec::with_capacity(8 + dcid.len());
    let mut first_byte = 0x40 | (pn_len as u8 - 1);
    if spin_bit {
        first_byte |= 0x20;
    }
    if key_phase {
        first_byte |= 0x04;
    }
    header.push(first_byte);
    header.extend_from_slice(dcid.as_slice());

    let pn_offset = header.len();
    let pn_bytes = packet_number.to_be_bytes();
    header.extend_from_slice(&pn_bytes[8 - pn_len..]);

    let mut buf = payload.to_vec();
    packet_key
        .seal(iv, packet_number, &header, &mut buf)
        .map_err(|_| PacketError::AeadAuthFailed)?;

    let mut datagram = header;
    datagram.append(&mut buf);
    hp_key.encrypt(pn_offset, &mut datagram).map_err(|source| PacketError::Protection { source })?;

    Ok(datagram)
}
