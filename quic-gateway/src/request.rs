// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! The `on_request` callback surface (spec §6): the only way an external
//! HTTP application layer plugs a response into this transport core. A
//! `None` handler falls back to the static 200 the spec requires.

use quic_core::h3::{Request, Response};

pub type RequestHandler = dyn Fn(&str, &str) -> Response + Send + Sync;

/// The fixed fallback response spec §6 mandates when no handler is
/// installed: `{"protocol":"h3"}` as `application/json`, matching the
/// happy-path scenario in spec.md §8.
pub fn default_handler(_method: &str, _path: &str) -> Response {
    Response { status: 200, content_type: "application/json".to_string(), body: br#"{"protocol":"h3"}"#.to_vec() }
}

pub fn dispatch(handler: Option<&RequestHandler>, request: &Request) -> Response {
    match handler {
        Some(handler) => handler(&request.method, &request.path),
        None => default_handler(&request.method, &request.path),
    }
}
