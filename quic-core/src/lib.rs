// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! QUIC/HTTP-3 transport core: varint and frame codecs, packet protection,
//! the per-epoch key schedule, a TLS 1.3 handshake driver seam, the
//! connection state machine, session/token caches, and a static-QPACK
//! HTTP/3 layer. The UDP I/O loop that drives this crate lives in the
//! `quic-gateway` binary.

pub mod cache;
pub mod cid;
pub mod connection;
pub mod error;
pub mod frame;
pub mod h3;
pub mod key_schedule;
pub mod packet;
pub mod protection;
pub mod tls;
pub mod varint;

pub use cid::ConnectionId;
pub use connection::{Connection, ConnectionState};
pub use key_schedule::{Epoch, Side};
