//! Configuration surface.
//!
//! [`Config`] is the serialized form consumed from disk or a frontend;
//! [`ProtocolConfig`] is the validated runtime view the dial/accept state
//! machines take, with the puzzle table already built and shared.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::obfs::Table;

/// AEAD cipher selection for the record framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadMethod {
    /// ChaCha20-Poly1305 (default).
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// AES-128-GCM.
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    /// Verbatim passthrough. Test-only; provides no confidentiality.
    #[serde(rename = "none")]
    None,
}

impl AeadMethod {
    /// Parse the configuration string form.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "chacha20-poly1305" => Ok(AeadMethod::ChaCha20Poly1305),
            "aes-128-gcm" => Ok(AeadMethod::Aes128Gcm),
            "none" => Ok(AeadMethod::None),
            other => Err(Error::cipher_setup(format!("unsupported aead {other:?}"))),
        }
    }
}

/// Puzzle table character-class preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableMode {
    /// Codewords and padding drawn from printable ASCII ranges.
    #[serde(rename = "prefer_ascii")]
    PreferAscii,
    /// Codewords drawn from a low-bit class, padding from its complement.
    #[serde(rename = "prefer_entropy")]
    PreferEntropy,
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Serialized configuration, as loaded from JSON.
///
/// Mirrors the surface the surrounding application provides; the tunnel
/// core consumes it, it does not own flag parsing or file discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `"client"` or `"server"`.
    pub mode: String,
    /// Address of the tunnel server, `host:port`.
    #[serde(default)]
    pub server_address: String,
    /// Where a failed server handshake is replayed to, `host:port`.
    #[serde(default)]
    pub fallback_address: String,
    /// Shared seed, or a hex-encoded edwards25519 scalar (client side).
    pub key: String,
    /// AEAD cipher name.
    pub aead: AeadMethod,
    /// `"fallback"` forwards suspicious connections, `"silent"` drops them.
    #[serde(default)]
    pub suspicious_action: String,
    /// Lower padding-rate bound, percent in `[0, 100]`.
    pub padding_min: u8,
    /// Upper padding-rate bound, percent in `[0, 100]`.
    pub padding_max: u8,
    /// Puzzle table mode.
    pub ascii: TableMode,
    /// Server-side handshake deadline, seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
    /// Whether the client skips the HTTP masquerade header.
    #[serde(default)]
    pub disable_http_mask: bool,
    /// Whether the downlink may upgrade to the high-bandwidth codec.
    #[serde(default = "default_true")]
    pub enable_downlink_boost: bool,
}

impl Config {
    /// Load a JSON config from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| Error::config(e.to_string()))
    }

    /// Write the config to disk as indented JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let data = serde_json::to_vec_pretty(self).map_err(|e| Error::config(e.to_string()))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// Validated runtime configuration with the puzzle table built.
#[derive(Clone)]
pub struct ProtocolConfig {
    /// Shared puzzle table, immutable after construction.
    pub table: Arc<Table>,
    /// Shared seed (or scalar hex) as configured.
    pub key: String,
    /// AEAD cipher for the record framer.
    pub aead: AeadMethod,
    /// Lower padding-rate bound, percent.
    pub padding_min: u8,
    /// Upper padding-rate bound, percent.
    pub padding_max: u8,
    /// Server-side handshake deadline.
    pub handshake_timeout: Duration,
    /// Skip the HTTP masquerade on the client.
    pub disable_http_mask: bool,
    /// Allow the downlink boost upgrade.
    pub enable_downlink_boost: bool,
}

impl ProtocolConfig {
    /// Build a runtime config from the serialized surface, constructing
    /// the puzzle table from the key and mode.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let pc = Self {
            table: Arc::new(Table::new(&cfg.key, cfg.ascii)),
            key: cfg.key.clone(),
            aead: cfg.aead,
            padding_min: cfg.padding_min,
            padding_max: cfg.padding_max,
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_seconds),
            disable_http_mask: cfg.disable_http_mask,
            enable_downlink_boost: cfg.enable_downlink_boost,
        };
        pc.validate()?;
        Ok(pc)
    }

    /// Check invariants shared by client and server.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::config("key must not be empty"));
        }
        if self.padding_min > 100 || self.padding_max > 100 {
            return Err(Error::config("padding bounds must be within [0, 100]"));
        }
        if self.padding_min > self.padding_max {
            return Err(Error::config("padding_min must not exceed padding_max"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            mode: "server".into(),
            server_address: "0.0.0.0:8443".into(),
            fallback_address: "127.0.0.1:80".into(),
            key: "shared-seed".into(),
            aead: AeadMethod::ChaCha20Poly1305,
            suspicious_action: "fallback".into(),
            padding_min: 10,
            padding_max: 30,
            ascii: TableMode::PreferEntropy,
            handshake_timeout_seconds: 10,
            disable_http_mask: false,
            enable_downlink_boost: true,
        }
    }

    #[test]
    fn aead_names_round_trip() {
        assert_eq!(
            AeadMethod::parse("chacha20-poly1305").unwrap(),
            AeadMethod::ChaCha20Poly1305
        );
        assert_eq!(AeadMethod::parse("aes-128-gcm").unwrap(), AeadMethod::Aes128Gcm);
        assert_eq!(AeadMethod::parse("none").unwrap(), AeadMethod::None);
        assert!(AeadMethod::parse("invalid").is_err());
    }

    #[test]
    fn json_round_trip() {
        let cfg = sample();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("chacha20-poly1305"));
        assert!(json.contains("prefer_entropy"));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, cfg.key);
        assert_eq!(back.aead, cfg.aead);
    }

    #[test]
    fn defaults_apply_when_fields_missing() {
        let json = r#"{
            "mode": "client",
            "key": "k",
            "aead": "none",
            "padding_min": 0,
            "padding_max": 0,
            "ascii": "prefer_ascii"
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.enable_downlink_boost);
        assert_eq!(cfg.handshake_timeout_seconds, 10);
        assert!(!cfg.disable_http_mask);
    }

    #[test]
    fn validation_rejects_inverted_padding() {
        let mut cfg = sample();
        cfg.padding_min = 50;
        cfg.padding_max = 10;
        assert!(ProtocolConfig::from_config(&cfg).is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = std::env::temp_dir().join("hbtun-config-test");
        let path = dir.join("config.json");
        let cfg = sample();
        cfg.save(&path).unwrap();
        let back = Config::load(&path).unwrap();
        assert_eq!(back.key, cfg.key);
        std::fs::remove_dir_all(&dir).ok();
    }
}
