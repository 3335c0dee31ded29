// Copyright 2026 The quic-core Authors.
// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration (spec component N): a TOML file, loaded once at
//! startup, naming the options spec.md §6 enumerates. Unknown keys are
//! rejected so a typo'd option fails fast instead of silently doing nothing.

use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use snafu_cli_debug::SnafuCliDebug;

#[derive(Snafu, SnafuCliDebug)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {path}"))]
    Read { path: String, source: std::io::Error },

    #[snafu(display("failed to parse config file {path} as TOML"))]
    Parse { path: String, source: toml::de::Error },
}

fn default_listen_port() -> u16 {
    8443
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    4096
}

fn default_enable_0rtt() -> bool {
    true
}

fn default_max_early_data() -> u32 {
    16 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    pub cert_path: String,
    pub key_path: String,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_enable_0rtt")]
    pub enable_0rtt: bool,

    #[serde(default = "default_max_early_data")]
    pub max_early_data: u32,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let contents = std::fs::read_to_string(path).context(ReadSnafu { path: path_str.clone() })?;
        toml::from_str(&contents).context(ParseSnafu { path: path_str })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_in_defaults_for_omitted_fields() {
        let toml = r#"
            cert_path = "cert.pem"
            key_path = "key.pem"
        "#;
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_port, 8443);
        assert_eq!(config.handshake_timeout_ms, 30_000);
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert!(config.enable_0rtt);
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml = r#"
            cert_path = "cert.pem"
            key_path = "key.pem"
            bogus_option = true
        "#;
        assert!(toml::from_str::<GatewayConfig>(toml).is_err());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let toml = r#"
            listen_port = 9000
        "#;
        assert!(toml::from_str::<GatewayConfig>(toml).is_err());
    }
}
