//! Configuration file handling for mockmail.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A user or group, given by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Principal {
    Id(u32),
    Name(String),
}

/// mockmail configuration. Missing keys take their defaults, unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind the SMTP port on; empty for all interfaces.
    #[serde(default)]
    pub smtpaddr: String,
    #[serde(default = "Config::default_smtpport")]
    pub smtpport: u16,
    /// Address of the web interface. The default lets anyone read your mail.
    #[serde(default)]
    pub httpaddr: String,
    #[serde(default = "Config::default_httpport")]
    pub httpport: u16,
    #[serde(default)]
    pub chroot: Option<PathBuf>,
    /// Create the chroot directory if it does not exist.
    #[serde(default)]
    pub chroot_mkdir: bool,
    #[serde(default)]
    pub dropuser: Option<Principal>,
    /// Defaults to the primary group of `dropuser`.
    #[serde(default)]
    pub dropgroup: Option<Principal>,
    /// Re-read templates and static files on every request.
    #[serde(default)]
    pub static_dev: bool,
    #[serde(default)]
    pub daemonize: bool,
    /// Relative to the chroot, if any.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub resourcedir: Option<PathBuf>,
    /// Look up host data that is unreachable after chroot before entering it.
    #[serde(default = "Config::default_workarounds")]
    pub workarounds: bool,
    #[serde(default)]
    pub static_cache_secs: u64,
    /// Seconds to wait before retrying a failed SMTP bind.
    #[serde(default)]
    pub smtp_grace_period: Option<u64>,
    #[serde(default = "Config::default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smtpaddr: String::new(),
            smtpport: Self::default_smtpport(),
            httpaddr: String::new(),
            httpport: Self::default_httpport(),
            chroot: None,
            chroot_mkdir: false,
            dropuser: None,
            dropgroup: None,
            static_dev: false,
            daemonize: false,
            pidfile: None,
            resourcedir: None,
            workarounds: Self::default_workarounds(),
            static_cache_secs: 0,
            smtp_grace_period: None,
            max_message_size: Self::default_max_message_size(),
        }
    }
}

/// Formats a `host:port` pair for binding, an empty host meaning all interfaces.
fn bind_address(host: &str, port: u16) -> String {
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, Error> {
        serde_json::from_str(content).map_err(Error::Config)
    }

    /// Pretty-printed JSON of the whole configuration.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn smtp_bind_address(&self) -> String {
        bind_address(&self.smtpaddr, self.smtpport)
    }

    pub fn http_bind_address(&self) -> String {
        bind_address(&self.httpaddr, self.httpport)
    }

    pub fn smtp_grace_period(&self) -> Option<Duration> {
        self.smtp_grace_period.map(Duration::from_secs)
    }

    /// The pid file as seen from outside the chroot, made absolute.
    pub fn effective_pidfile(&self) -> Option<PathBuf> {
        let pidfile = self.pidfile.as_ref()?;
        let path = match &self.chroot {
            Some(root) => root.join(pidfile.strip_prefix("/").unwrap_or(pidfile)),
            None => pidfile.clone(),
        };
        Some(std::path::absolute(&path).unwrap_or(path))
    }

    // Following are needed since serde does not support default literals.

    const fn default_smtpport() -> u16 {
        2525
    }
    const fn default_httpport() -> u16 {
        2580
    }
    const fn default_workarounds() -> bool {
        true
    }
    const fn default_max_message_size() -> usize {
        31457280
    }
}
