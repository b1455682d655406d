//! Configuration document
//!
//! The raw, serde-deserialized shape of a trapmux configuration, plus
//! loading (filesystem or HTTP) and override precedence. Turning a raw
//! document into a runnable engine snapshot is the assembler's job in
//! [`crate::snapshot`].

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation failure. Every variant names the offending
/// field and value; filter errors carry the filter's position in its list.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported or invalid value ({0}) for general:ignore_versions")]
    BadVersionToken(String),

    #[error("all three SNMP versions are ignored -- there will be no traps to process")]
    AllVersionsIgnored,

    #[error("invalid IP address ({ip}) in ipset: {ipset}")]
    BadIpSetAddress { ipset: String, ip: String },

    #[error("unsupported or invalid value ({0}) for snmpv3:msg_flags")]
    BadMsgFlags(String),

    #[error("invalid value for snmpv3:auth_protocol: {0}")]
    BadAuthProtocol(String),

    #[error("invalid value for snmpv3:privacy_protocol: {0}")]
    BadPrivacyProtocol(String),

    #[error("no auth protocol set when snmpv3:msg_flags specifies an Auth mode")]
    AuthProtocolRequired,

    #[error("no privacy protocol set when snmpv3:msg_flags specifies an AuthPriv mode")]
    PrivacyProtocolRequired,

    #[error("unable to decode secret for {field}")]
    Secret {
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("filter {index}: unsupported or invalid SNMP version ({token})")]
    FilterVersion { index: usize, token: String },

    #[error("filter {index}: invalid IP set name for {field}: {name}")]
    UnknownIpSet {
        index: usize,
        field: &'static str,
        name: String,
    },

    #[error("filter {index}: unable to compile regular expression for {field}: {pattern}")]
    BadRegex {
        index: usize,
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("filter {index}: invalid IP/CIDR for {field}: {value}")]
    BadCidr {
        index: usize,
        field: &'static str,
        value: String,
    },

    #[error("filter {index}: missing NAT argument")]
    MissingNatArg { index: usize },

    #[error("filter {index}: invalid NAT address: {value}")]
    BadNatArg { index: usize, value: String },

    #[error("filter {index}: unknown action: {name}")]
    UnknownAction { index: usize, name: String },

    #[error("filter {index}: unable to configure plugin {name}")]
    PluginConfigure {
        index: usize,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown reporting plugin: {0}")]
    UnknownReporter(String),

    #[error("unable to configure reporting plugin {name}")]
    ReporterConfigure {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Raw configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub general: GeneralSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default, rename = "snmpv3")]
    pub snmp_v3: SnmpV3Section,

    /// List of `{name: [address, ...]}` stanzas
    #[serde(default)]
    pub ipsets: Vec<HashMap<String, Vec<String>>>,

    /// Ordered filter chain
    #[serde(default)]
    pub filters: Vec<FilterSection>,

    /// Filters whose actions run when a plugin action fails
    #[serde(default)]
    pub plugin_error_actions: Vec<FilterSection>,

    /// Metric reporting plugins
    #[serde(default)]
    pub reporting: Vec<ReportingSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSection {
    /// Hostname stamped on every trap; empty means use the OS hostname
    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// SNMP versions to drop at the door (`v1`, `v2c`, `v3` and their
    /// numeric spellings)
    #[serde(default)]
    pub ignore_versions: Vec<String>,

    /// Serve Prometheus metrics over HTTP
    #[serde(default)]
    pub prometheus_enabled: bool,

    #[serde(default = "default_prometheus_ip")]
    pub prometheus_ip: String,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            ignore_versions: Vec::new(),
            prometheus_enabled: false,
            prometheus_ip: default_prometheus_ip(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Rotation threshold for file-logging actions, in megabytes
    #[serde(default = "default_log_size_max")]
    pub log_size_max: u64,

    /// Numbered backups kept by file-logging actions
    #[serde(default = "default_log_backups_max")]
    pub log_backups_max: u32,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_size_max: default_log_size_max(),
            log_backups_max: default_log_backups_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpV3Section {
    /// NoAuthNoPriv, AuthNoPriv or AuthPriv
    #[serde(default = "default_msg_flags")]
    pub msg_flags: String,

    #[serde(default)]
    pub username: String,

    /// NoAuth, SHA or MD5
    #[serde(default = "default_auth_protocol")]
    pub auth_protocol: String,

    /// Plaintext or a secret reference
    #[serde(default)]
    pub auth_password: String,

    /// NoPriv, AES or DES
    #[serde(default = "default_privacy_protocol")]
    pub privacy_protocol: String,

    /// Plaintext or a secret reference
    #[serde(default)]
    pub privacy_password: String,
}

impl Default for SnmpV3Section {
    fn default() -> Self {
        Self {
            msg_flags: default_msg_flags(),
            username: String::new(),
            auth_protocol: default_auth_protocol(),
            auth_password: String::new(),
            privacy_protocol: default_privacy_protocol(),
            privacy_password: String::new(),
        }
    }
}

/// One filter stanza. Wildcards: an empty string for IP/OID fields, `-1`
/// for the trap type fields, an empty list for SNMP versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSection {
    #[serde(default)]
    pub snmp_versions: Vec<String>,

    #[serde(default)]
    pub source_ip: String,

    #[serde(default)]
    pub agent_address: String,

    #[serde(default = "default_trap_type")]
    pub generic_type: i32,

    #[serde(default = "default_trap_type")]
    pub specific_type: i32,

    #[serde(default)]
    pub enterprise_oid: String,

    /// `break`, `drop`, `nat`, or a plugin name
    pub action_name: String,

    #[serde(default)]
    pub action_args: HashMap<String, String>,

    #[serde(default)]
    pub break_after: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingSection {
    pub plugin: String,

    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// Where the configuration document comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Path(String),
    Url(String),
}

impl ConfigSource {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("http") {
            ConfigSource::Url(uri.to_string())
        } else {
            ConfigSource::Path(uri.to_string())
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            ConfigSource::Path(p) => p,
            ConfigSource::Url(u) => u,
        }
    }
}

/// Fetch and parse a configuration document. YAML and JSON are both
/// accepted; JSON documents parse through the YAML front end.
pub async fn load_document(source: &ConfigSource) -> Result<RawConfig> {
    let text = match source {
        ConfigSource::Url(url) => reqwest::get(url)
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("unable to fetch configuration from {url}"))?
            .text()
            .await
            .with_context(|| format!("unable to read configuration body from {url}"))?,
        ConfigSource::Path(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("unable to read configuration file {path}"))?,
    };

    serde_yaml::from_str(&text)
        .with_context(|| format!("unable to parse configuration from {}", source.describe()))
}

/// Overrides gathered from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind_addr: Option<String>,
    pub listen_port: Option<u16>,
    pub debug: bool,
}

/// Apply precedence: environment beats CLI beats file beats default.
/// A hostname left empty falls back to the OS hostname, then `_undefined`.
pub fn apply_overrides(config: &mut RawConfig, overrides: &Overrides) {
    if let Ok(addr) = std::env::var("TRAPMUX_LISTEN_ADDRESS") {
        config.general.listen_address = addr;
    } else if let Some(addr) = &overrides.bind_addr {
        config.general.listen_address = addr.clone();
    }

    match std::env::var("TRAPMUX_LISTEN_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
    {
        Some(port) => config.general.listen_port = port,
        None => {
            if let Some(port) = overrides.listen_port {
                config.general.listen_port = port;
            }
        }
    }

    if overrides.debug {
        config.logging.level = "debug".to_string();
    }

    if let Ok(name) = std::env::var("TRAPMUX_HOSTNAME") {
        config.general.hostname = name;
    } else if config.general.hostname.is_empty() {
        config.general.hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "_undefined".to_string());
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    162
}

fn default_prometheus_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_prometheus_port() -> u16 {
    9162
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_size_max() -> u64 {
    1024
}

fn default_log_backups_max() -> u32 {
    7
}

fn default_msg_flags() -> String {
    "NoAuthNoPriv".to_string()
}

fn default_auth_protocol() -> String {
    "NoAuth".to_string()
}

fn default_privacy_protocol() -> String {
    "NoPriv".to_string()
}

fn default_trap_type() -> i32 {
    -1
}
