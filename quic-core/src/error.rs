// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

// Error types for every stage of the transport core, one `snafu` enum per
// concern, following the teacher's convention of scoping errors to the
// module that raises them rather than a single crate-wide error type.

use snafu::Snafu;
use snafu_cli_debug::SnafuCliDebug;

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum VarIntError {
    #[snafu(display("buffer of {len} bytes too short to decode a {width}-byte varint"))]
    Truncated { len: usize, width: usize },

    #[snafu(display("value {value} does not fit in the QUIC varint range (0..2^62)"))]
    OutOfRange { value: u64 },
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum ProtectionError {
    #[snafu(display("HKDF output length {len} is invalid for the requested key material"))]
    InvalidLength { len: usize },

    #[snafu(display("AEAD seal/open failed"))]
    AeadAuthFailed,

    #[snafu(display("header protection sample out of bounds: packet has {available} bytes after PN offset {pn_offset}, needed {needed}"))]
    SampleOutOfBounds {
        pn_offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum PacketError {
    #[snafu(display("packet shorter than its header or length field indicated"))]
    Truncated,

    #[snafu(display("first byte {byte:#04x} has an invalid header form or fixed bit"))]
    InvalidFirstByte { byte: u8 },

    #[snafu(display("unsupported QUIC version {version:#010x}"))]
    UnknownVersion { version: u32 },

    #[snafu(display("AEAD authentication failed while decrypting the packet payload"))]
    AeadAuthFailed,

    #[snafu(display("connection ID length {len} exceeds the 20-byte maximum"))]
    ConnectionIdTooLong { len: usize },

    #[snafu(display("varint in packet header was malformed"))]
    Varint { source: VarIntError },

    #[snafu(display("header protection removal failed"))]
    Protection { source: ProtectionError },
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    #[snafu(display("frame buffer ended in the middle of a {what} field"))]
    Truncated { what: &'static str },

    #[snafu(display("unknown frame type {frame_type:#04x}"))]
    UnknownFrame { frame_type: u64 },

    #[snafu(display("STREAM frame referenced stream id {stream_id}, only stream 0 is supported"))]
    UnsupportedStream { stream_id: u64 },

    #[snafu(display("varint in frame body was malformed"))]
    Varint { source: VarIntError },
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum TlsError {
    #[snafu(display("TLS engine reported a fatal error: {reason}"))]
    Fatal { reason: String },

    #[snafu(display("requested secret '{label}' is not available yet"))]
    SecretNotReady { label: String },

    #[snafu(display("failed to load certificate chain from {path}"))]
    CertificateLoad {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("failed to load private key from {path}"))]
    PrivateKeyLoad {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("PEM file {path} contained no usable private key"))]
    NoPrivateKey { path: String },

    #[snafu(display("rustls rejected the configuration: {source}"))]
    Rustls { source: rustls::Error },
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum ConnectionError {
    #[snafu(display("handshake did not complete within the configured timeout"))]
    HandshakeTimeout,

    #[snafu(display("connection was idle past the configured timeout"))]
    IdleTimeout,

    #[snafu(display("TLS driver failed: {source}"))]
    Tls { source: TlsError },

    #[snafu(display("packet codec failed: {source}"))]
    Packet { source: PacketError },

    #[snafu(display("frame codec failed: {source}"))]
    Frame { source: FrameError },

    #[snafu(display("a second HTTP/3 request arrived before the first completed"))]
    RequestInFlight,
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    #[snafu(display("token did not match the stored client address"))]
    AddressMismatch,

    #[snafu(display("token has expired"))]
    Expired,

    #[snafu(display("no entry found for the given key"))]
    NotFound,
}

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum H3Error {
    #[snafu(display("QPACK reference to dynamic table entry {index} is not supported"))]
    DynamicTableReference { index: u64 },

    #[snafu(display("QPACK static table has no entry {index}"))]
    StaticTableOutOfRange { index: u64 },

    #[snafu(display("HEADERS frame is missing the required pseudo-header {name}"))]
    MissingPseudoHeader { name: &'static str },

    #[snafu(display("frame codec failed: {source}"))]
    Frame { source: FrameError },

    #[snafu(display("varint in QPACK field section was malformed"))]
    Varint { source: VarIntError },
}