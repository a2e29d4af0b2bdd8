//! Emulator configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SPIBRIDGE_CONFIG)
//! 3. Environment variables

use crate::error::EmuError;
use crate::flash::{EmulatedFlash, FlashConfig, MAX_FLASH_SIZE, MIN_FLASH_SIZE};
use serde::{Deserialize, Serialize};
use spibridge_protocol::DEFAULT_BRIDGE_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Emulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Emulated chip.
    pub flash: FlashSettings,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SPIBRIDGE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.flash.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.flash.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BRIDGE_PORT)),
            max_connections: 16,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SPIBRIDGE_BIND") {
            match addr.parse() {
                Ok(parsed) => self.bind_addr = parsed,
                Err(_) => tracing::warn!("Ignoring invalid SPIBRIDGE_BIND '{}'", addr),
            }
        }

        if let Ok(max) = std::env::var("SPIBRIDGE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Emulated chip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashSettings {
    /// Array size, e.g. `16M`, `512K` or a plain byte count.
    pub size: String,
    /// JEDEC id as six hex digits, e.g. `EF4018`.
    pub jedec_id: String,
    /// Unique id as sixteen hex digits.
    pub unique_id: Option<String>,
    /// Raw image loaded at address 0 on startup.
    pub image: Option<PathBuf>,
}

impl Default for FlashSettings {
    fn default() -> Self {
        let defaults = FlashConfig::default();
        Self {
            size: "16M".to_string(),
            jedec_id: hex::encode_upper(defaults.jedec_id),
            unique_id: None,
            image: None,
        }
    }
}

impl FlashSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("SPIBRIDGE_FLASH_SIZE") {
            self.size = size;
        }
        if let Ok(id) = std::env::var("SPIBRIDGE_JEDEC_ID") {
            self.jedec_id = id;
        }
        if let Ok(path) = std::env::var("SPIBRIDGE_IMAGE") {
            self.image = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flash_config().map(|_| ())
    }

    /// Resolves these settings into a chip description.
    pub fn flash_config(&self) -> Result<FlashConfig, ConfigError> {
        let size = parse_size(&self.size)?;
        if !size.is_power_of_two() || !(MIN_FLASH_SIZE..=MAX_FLASH_SIZE).contains(&size) {
            return Err(ConfigError::Validation(format!(
                "flash size {} must be a power of two between {} and {} bytes",
                size, MIN_FLASH_SIZE, MAX_FLASH_SIZE
            )));
        }

        let mut config = FlashConfig {
            jedec_id: parse_hex_id(&self.jedec_id, "jedec_id")?,
            size,
            ..FlashConfig::default()
        };
        if let Some(uid) = &self.unique_id {
            config.unique_id = parse_hex_id(uid, "unique_id")?;
        }
        Ok(config)
    }

    /// Builds the chip, loading the image if one is configured.
    pub fn build(&self) -> Result<EmulatedFlash, EmuError> {
        let config = self.flash_config()?;
        match &self.image {
            Some(path) => {
                let image =
                    std::fs::read(path).map_err(|e| ConfigError::Io(path.clone(), e))?;
                tracing::info!("Loaded {} byte image from {}", image.len(), path.display());
                Ok(EmulatedFlash::with_image(config, &image)?)
            }
            None => Ok(EmulatedFlash::new(config)),
        }
    }
}

/// Parses `1234`, `64K`, `16M` (binary multiples, case-insensitive).
pub fn parse_size(s: &str) -> Result<usize, ConfigError> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1024),
        Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::Validation(format!("invalid size '{}'", s)))
}

fn parse_hex_id<const N: usize>(s: &str, field: &str) -> Result<[u8; N], ConfigError> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| ConfigError::Validation(format!("{} '{}': {}", field, s, e)))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        ConfigError::Validation(format!(
            "{} '{}' must be {} bytes, got {}",
            field,
            s,
            N,
            bytes.len()
        ))
    })
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 7420);
        assert!(config.validate().is_ok());

        let flash = config.flash.flash_config().unwrap();
        assert_eq!(flash.size, 16 * 1024 * 1024);
        assert_eq!(flash.jedec_id, [0xEF, 0x40, 0x18]);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size(" 16M ").unwrap(), 16 * 1024 * 1024);
        assert!(parse_size("M").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_flash_size_validation() {
        let settings = FlashSettings {
            size: "100000".to_string(),
            ..FlashSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Validation(_))
        ));

        let settings = FlashSettings {
            size: "32M".to_string(),
            ..FlashSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_hex_ids() {
        let settings = FlashSettings {
            jedec_id: "c2 20 17".to_string(),
            unique_id: Some("0011223344556677".to_string()),
            ..FlashSettings::default()
        };
        let flash = settings.flash_config().unwrap();
        assert_eq!(flash.jedec_id, [0xC2, 0x20, 0x17]);
        assert_eq!(flash.unique_id[7], 0x77);

        let settings = FlashSettings {
            jedec_id: "EF40".to_string(),
            ..FlashSettings::default()
        };
        assert!(settings.flash_config().is_err());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\nflash:\n  size: 1M\n  jedec_id: C84014"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.max_connections, 16);
        assert_eq!(config.flash.flash_config().unwrap().size, 1024 * 1024);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/spibridge.yaml");
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_build_with_image() {
        let mut image = NamedTempFile::new().unwrap();
        image.write_all(&[0x11, 0x22, 0x33]).unwrap();

        let settings = FlashSettings {
            size: "64K".to_string(),
            image: Some(image.path().to_path_buf()),
            ..FlashSettings::default()
        };
        let flash = settings.build().unwrap();
        assert_eq!(&flash.contents()[..4], &[0x11, 0x22, 0x33, 0xFF]);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.flash.jedec_id, "EF4018");
    }
}
