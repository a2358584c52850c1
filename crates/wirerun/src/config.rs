//! Server and client configuration, loaded from TOML.
//!
//! Every key is optional; omitted keys take the values of `Default`.
//!
//! ```toml
//! bind = "0.0.0.0:7878"
//! max_in_flight = 64
//!
//! [services]
//! Mail = "Service"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Default upper bound on a single frame body: 8 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

pub const DEFAULT_BIND: &str = "127.0.0.1:7878";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the listener binds to. Port 0 picks a free port.
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Per-connection bound on concurrently executing requests.
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Exposed service name to registered service name.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_frame_len: default_max_frame_len(),
            max_in_flight: None,
            services: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&read(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_len == 0 {
            return Err(Error::Invalid("max_frame_len must be positive".into()));
        }
        if self.max_in_flight == Some(0) {
            return Err(Error::Invalid("max_in_flight must be positive when set".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_bind")]
    pub addr: String,

    /// Zero disables the connect timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default limit for `call`. Absent means calls wait indefinitely.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: default_bind(),
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: None,
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into(), ..Self::default() }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&read(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_len == 0 {
            return Err(Error::Invalid("max_frame_len must be positive".into()));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(Error::Invalid("call_timeout_ms must be positive when set".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Read { path: path.to_path_buf(), source })
}
