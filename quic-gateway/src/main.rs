// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! Command-line entry point (spec component N): loads the TOML config and
//! certificate material named on the command line, then runs the UDP loop
//! until the socket errors fatally.

use std::env;

use quic_core::error::TlsError;
use quic_core::tls::ServerCertMaterial;
use snafu::prelude::*;

mod config;
mod registry;
mod request;
mod server;

use config::{ConfigError, GatewayConfig};
use server::{Gateway, GatewayError};

#[derive(Debug, Snafu)]
enum MainError {
    #[snafu(display("usage: quic-gateway <config.toml>"))]
    MissingConfigArg,

    #[snafu(display("failed to load configuration: {source}"), context(false))]
    Config { source: ConfigError },

    #[snafu(display("failed to load certificate material: {source}"), context(false))]
    Tls { source: TlsError },

    #[snafu(display("gateway failed: {source}"), context(false))]
    Gateway { source: GatewayError },
}

#[snafu::report]
fn main() -> Result<(), MainError> {
    tracing_subscriber::fmt::init();

    let config_path = env::args().nth(1).ok_or(MainError::MissingConfigArg)?;
    let config = GatewayConfig::load(&config_path)?;
    let cert_material = ServerCertMaterial::load(&config.cert_path, &config.key_path)?;

    let mut gateway = Gateway::bind(config, cert_material, None)?;
    gateway.run()?;
    Ok(())
}
