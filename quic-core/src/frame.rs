// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! QUIC frame parsing and emission (RFC 9000 §19), restricted to the subset
//! this core needs: PADDING, PING, ACK (emit-only), CRYPTO, and a single
//! bidirectional STREAM (stream 0, carrying HTTP/3). Frame-type dispatch
//! follows the byte-range-match style the retrieval pack's other from-scratch
//! QUIC parser uses for its `FrameType` enum, generalised to return a typed
//! `Frame` with its payload already parsed rather than a raw `(type, bytes)`
//! pair.

use crate::error::{FrameError, TruncatedSnafu, UnknownFrameSnafu, UnsupportedStreamSnafu, VarintSnafu};
use crate::varint::VarInt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack { largest_acknowledged: u64, ack_delay: u64 },
    Crypto { offset: u64, data: Vec<u8> },
    Stream { stream_id: u64, offset: u64, data: Vec<u8>, fin: bool },
}

impl Frame {
    /// Parses one frame from the start of `buf`, returning it and the number
    /// of bytes consumed. `PADDING` frames are coalesced: a run of zero bytes
    /// parses as a single `Frame::Padding` covering the whole run, since
    /// RFC 9000 §19.1 defines PADDING as "a single byte" that callers
    /// typically find in long runs.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        let (frame_type, type_len) = VarInt::decode(buf).map_err(|source| FrameError::Varint { source })?;
        let frame_type = frame_type.get();

        match frame_type {
            0x00 => {
                let mut consumed = type_len;
                while buf.get(consumed) == Some(&0x00) {
                    consumed += 1;
                }
                Ok((Frame::Padding, consumed))
            }
            0x01 => Ok((Frame::Ping, type_len)),
            0x02 | 0x03 => {
                let mut pos = type_len;
                let (largest, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                let (delay, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                let (range_count, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                let (first_range, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                for _ in 0..range_count.get() {
                    let (gap, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                    pos += n;
                    let (len, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                    pos += n;
                    let _ = (gap, len);
                }
                let _ = first_range;
                Ok((Frame::Ack { largest_acknowledged: largest.get(), ack_delay: delay.get() }, pos))
            }
            0x06 => {
                let mut pos = type_len;
                let (offset, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                let (length, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                let len = length.get() as usize;
                let data = buf.get(pos..pos + len).ok_or(FrameError::Truncated { what: "CRYPTO data" })?.to_vec();
                pos += len;
                Ok((Frame::Crypto { offset: offset.get(), data }, pos))
            }
            0x08..=0x0f => {
                let mut pos = type_len;
                let has_offset = frame_type & 0x04 != 0;
                let has_length = frame_type & 0x02 != 0;
                let fin = frame_type & 0x01 != 0;

                let (stream_id, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                pos += n;
                if stream_id.get() != 0 {
                    return UnsupportedStreamSnafu { stream_id: stream_id.get() }.fail();
                }

                let offset = if has_offset {
                    let (offset, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                    pos += n;
                    offset.get()
                } else {
                    0
                };

                let data = if has_length {
                    let (length, n) = VarInt::decode(&buf[pos..]).map_err(|source| FrameError::Varint { source })?;
                    pos += n;
                    let len = length.get() as usize;
                    let slice = buf.get(pos..pos + len).ok_or(FrameError::Truncated { what: "STREAM data" })?;
                    pos += len;
                    slice.to_vec()
                } else {
                    let slice = &buf[pos..];
                    pos += slice.len();
                    slice.to_vec()
                };

                Ok((Frame::Stream { stream_id: stream_id.get(), offset, data, fin }, pos))
            }
            other => UnknownFrameSnafu { frame_type: other }.fail(),
        }
    }

    /// Parses every frame in `buf` until it is exhausted.
    pub fn parse_all(mut buf: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while !buf.is_empty() {
            let (frame, consumed) = Frame::parse(buf)?;
            frames.push(frame);
            buf = &buf[consumed..];
        }
        Ok(frames)
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        match self {
            Frame::Padding => out.push(0x00),
            Frame::Ping => out.push(0x01),
            Frame::Ack { largest_acknowledged, ack_delay } => {
                out.extend_from_slice(&VarInt::new(0x02).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::new(*largest_acknowledged).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::new(*ack_delay).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::new(0).map_err(|source| FrameError::Varint { source })?.to_vec()); // ack range count
                out.extend_from_slice(&VarInt::new(0).map_err(|source| FrameError::Varint { source })?.to_vec()); // first ack range
            }
            Frame::Crypto { offset, data } => {
                out.extend_from_slice(&VarInt::new(0x06).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::new(*offset).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::try_from(data.len()).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(data);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let frame_type = 0x08 | 0x04 /* offset present */ | 0x02 /* length present */ | if *fin { 0x01 } else { 0 };
                out.extend_from_slice(&VarInt::new(frame_type).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::new(*stream_id).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::new(*offset).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(&VarInt::try_from(data.len()).map_err(|source| FrameError::Varint { source })?.to_vec());
                out.extend_from_slice(data);
            }
        }
        Ok(())
    }

    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Padding)
    }
}
