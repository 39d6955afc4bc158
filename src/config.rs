//! Configuration management for the relay
//!
//! Loaded from TOML with CLI overrides. The `[variant]` section selects one
//! of the sixteen pipeline shapes (incoming format x outgoing format x
//! transport x inference); the listener port follows from it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Payload format on either side of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    Jpg,
    H264,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Jpg => write!(f, "JPG"),
            Format::H264 => write!(f, "H264"),
        }
    }
}

/// Ingest transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp => write!(f, "UDP"),
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub variant: VariantConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tuning: TuningConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub shm: ShmConfig,
}

/// Pipeline variant selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantConfig {
    #[serde(default = "default_incoming")]
    pub incoming: Format,

    #[serde(default = "default_outgoing")]
    pub outgoing: Format,

    #[serde(default = "default_transport")]
    pub transport: Transport,

    #[serde(default = "default_inference")]
    pub inference: bool,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self {
            incoming: default_incoming(),
            outgoing: default_outgoing(),
            transport: default_transport(),
            inference: default_inference(),
        }
    }
}

/// Listener addresses and the control-plane secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// HTTP control + subscriber plane.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Shared secret for `/reset_stream`.
    #[serde(default = "default_auth_secret")]
    pub auth_secret: String,

    /// Ingest port per variant: UDP JPG / UDP H264 / TCP JPG / TCP H264.
    #[serde(default = "default_udp_port_jpg")]
    pub udp_port_jpg: u16,
    #[serde(default = "default_udp_port_h264")]
    pub udp_port_h264: u16,
    #[serde(default = "default_tcp_port_jpg")]
    pub tcp_port_jpg: u16,
    #[serde(default = "default_tcp_port_h264")]
    pub tcp_port_h264: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            http_port: default_http_port(),
            auth_secret: default_auth_secret(),
            udp_port_jpg: default_udp_port_jpg(),
            udp_port_h264: default_udp_port_h264(),
            tcp_port_jpg: default_tcp_port_jpg(),
            tcp_port_h264: default_tcp_port_h264(),
        }
    }
}

/// Transport and pipeline timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Sender retransmission window (in-flight chunks).
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Per-chunk retransmission timeout, milliseconds.
    #[serde(default = "default_retransmit_timeout_ms")]
    pub retransmit_timeout_ms: u64,

    /// Reassembly entry eviction age, milliseconds.
    #[serde(default = "default_reassembly_timeout_ms")]
    pub reassembly_timeout_ms: u64,

    /// Ordered-dispatch bounded wait, milliseconds.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Ordered-dispatch poll interval, milliseconds.
    #[serde(default = "default_dispatch_poll_ms")]
    pub dispatch_poll_ms: u64,

    /// Subscribers drop frames older than this, milliseconds.
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,

    /// Target SO_RCVBUF / SO_SNDBUF.
    #[serde(default = "default_socket_buffer_bytes")]
    pub socket_buffer_bytes: usize,

    /// Drop frames whose chunks failed the CRC check instead of delivering
    /// them with a warning.
    #[serde(default)]
    pub drop_on_crc_mismatch: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            retransmit_timeout_ms: default_retransmit_timeout_ms(),
            reassembly_timeout_ms: default_reassembly_timeout_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            dispatch_poll_ms: default_dispatch_poll_ms(),
            freshness_ms: default_freshness_ms(),
            socket_buffer_bytes: default_socket_buffer_bytes(),
            drop_on_crc_mismatch: false,
        }
    }
}

/// Codec stage parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// H.264 target bitrate, bits per second.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// JPEG re-encode quality (1-100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Hardware device type to try first ("cuda", "vaapi", ...). Software
    /// fallback on any initialization failure.
    #[serde(default)]
    pub hw_device: Option<String>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            bitrate: default_bitrate(),
            jpeg_quality: default_jpeg_quality(),
            hw_device: None,
        }
    }
}

/// Shared-memory ring parameters for the inference bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Slots per ring.
    #[serde(default = "default_shm_capacity")]
    pub capacity: usize,

    /// Segment name prefix; the input/output rings append a suffix.
    #[serde(default = "default_shm_prefix")]
    pub name_prefix: String,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            capacity: default_shm_capacity(),
            name_prefix: default_shm_prefix(),
        }
    }
}

// Default value functions
fn default_incoming() -> Format {
    Format::Jpg
}
fn default_outgoing() -> Format {
    Format::Jpg
}
fn default_transport() -> Transport {
    Transport::Udp
}
fn default_inference() -> bool {
    true
}
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_auth_secret() -> String {
    "BAYU".to_string()
}
fn default_udp_port_jpg() -> u16 {
    8085
}
fn default_udp_port_h264() -> u16 {
    8086
}
fn default_tcp_port_jpg() -> u16 {
    8087
}
fn default_tcp_port_h264() -> u16 {
    8088
}
fn default_window_size() -> usize {
    30
}
fn default_retransmit_timeout_ms() -> u64 {
    100
}
fn default_reassembly_timeout_ms() -> u64 {
    500
}
fn default_dispatch_timeout_ms() -> u64 {
    400
}
fn default_dispatch_poll_ms() -> u64 {
    30
}
fn default_freshness_ms() -> u64 {
    200
}
fn default_socket_buffer_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_bitrate() -> u32 {
    2_000_000
}
fn default_jpeg_quality() -> u8 {
    70
}
fn default_shm_capacity() -> usize {
    600
}
fn default_shm_prefix() -> String {
    "framelink".to_string()
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// The ingest port for the configured variant.
    pub fn ingest_port(&self) -> u16 {
        match (self.variant.transport, self.variant.incoming) {
            (Transport::Udp, Format::Jpg) => self.server.udp_port_jpg,
            (Transport::Udp, Format::H264) => self.server.udp_port_h264,
            (Transport::Tcp, Format::Jpg) => self.server.tcp_port_jpg,
            (Transport::Tcp, Format::H264) => self.server.tcp_port_h264,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tuning.window_size == 0 {
            return Err(ConfigError::Invalid(
                "window_size must be > 0".to_string(),
            ));
        }
        if self.tuning.dispatch_poll_ms == 0
            || self.tuning.dispatch_poll_ms > self.tuning.dispatch_timeout_ms
        {
            return Err(ConfigError::Invalid(format!(
                "dispatch_poll_ms must be in 1..=dispatch_timeout_ms, got {}",
                self.tuning.dispatch_poll_ms
            )));
        }
        if self.codec.width == 0 || self.codec.height == 0 {
            return Err(ConfigError::Invalid(
                "width and height must be > 0".to_string(),
            ));
        }
        if self.codec.width % 2 != 0 || self.codec.height % 2 != 0 {
            return Err(ConfigError::Invalid(
                "width and height must be even for 4:2:0 chroma".to_string(),
            ));
        }
        if self.codec.fps == 0 || self.codec.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "fps must be between 1 and 120, got {}",
                self.codec.fps
            )));
        }
        if self.codec.jpeg_quality == 0 || self.codec.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.codec.jpeg_quality
            )));
        }
        if self.shm.capacity == 0 {
            return Err(ConfigError::Invalid(
                "shm capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tuning.window_size, 30);
        assert_eq!(config.tuning.freshness_ms, 200);
        assert_eq!(config.ingest_port(), 8085);
        assert!(!config.tuning.drop_on_crc_mismatch);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[variant]
incoming = "H264"
outgoing = "JPG"
transport = "TCP"
inference = false

[server]
http_port = 9000
auth_secret = "sekrit"

[tuning]
window_size = 16
reassembly_timeout_ms = 250
drop_on_crc_mismatch = true

[codec]
width = 1280
height = 720
fps = 25
        "#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.variant.incoming, Format::H264);
        assert_eq!(config.variant.outgoing, Format::Jpg);
        assert_eq!(config.variant.transport, Transport::Tcp);
        assert!(!config.variant.inference);
        assert_eq!(config.server.http_port, 9000);
        assert_eq!(config.tuning.window_size, 16);
        assert!(config.tuning.drop_on_crc_mismatch);
        assert_eq!(config.codec.width, 1280);
        assert_eq!(config.ingest_port(), 8088);
    }

    #[test]
    fn test_port_table() {
        let mut config = Config::default();
        config.variant.transport = Transport::Udp;
        config.variant.incoming = Format::Jpg;
        assert_eq!(config.ingest_port(), 8085);
        config.variant.incoming = Format::H264;
        assert_eq!(config.ingest_port(), 8086);
        config.variant.transport = Transport::Tcp;
        config.variant.incoming = Format::Jpg;
        assert_eq!(config.ingest_port(), 8087);
        config.variant.incoming = Format::H264;
        assert_eq!(config.ingest_port(), 8088);
    }

    #[test]
    fn test_invalid_odd_dimensions() {
        let toml = r#"
[codec]
width = 641
height = 480
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_poll_interval() {
        let toml = r#"
[tuning]
dispatch_timeout_ms = 100
dispatch_poll_ms = 400
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml(&toml_str).unwrap();
        assert_eq!(config.tuning.window_size, parsed.tuning.window_size);
        assert_eq!(config.variant.incoming, parsed.variant.incoming);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.server.http_port = 9999;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.http_port, 9999);
    }
}
