//! Snapshot assembly
//!
//! Turns a raw configuration document into a fully linked engine snapshot:
//! validates every field, compiles regexes and CIDRs, resolves secret
//! references, builds IP sets and binds (and configures) action plugins.
//! Assembly either produces a complete snapshot or a descriptive error; a
//! partially built snapshot is never published, and the previously
//! published one is never touched.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::actions::{MetricPlugin, PluginRegistry};
use crate::config::{ConfigError, FilterSection, LoggingSection, RawConfig};
use crate::counters::{CounterId, COUNTER_DEFS};
use crate::filter::{Filter, FilterAction};
use crate::ipset::IpSetRegistry;
use crate::matcher::{MatchKind, Matcher, TrapField};
use crate::secrets::{merge_secrets, SecretResolver};
use crate::trap::SnmpVersion;

/// SNMPv3 message security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFlags {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl MsgFlags {
    pub fn requires_auth(&self) -> bool {
        matches!(self, MsgFlags::AuthNoPriv | MsgFlags::AuthPriv)
    }

    pub fn requires_privacy(&self) -> bool {
        matches!(self, MsgFlags::AuthPriv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    NoAuth,
    Sha,
    Md5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyProtocol {
    NoPriv,
    Aes,
    Des,
}

/// Validated SNMPv3 security parameters with resolved passwords.
#[derive(Debug, Clone)]
pub struct V3Security {
    pub msg_flags: MsgFlags,
    pub username: String,
    pub auth_protocol: AuthProtocol,
    pub auth_password: String,
    pub privacy_protocol: PrivacyProtocol,
    pub privacy_password: String,
}

/// Listener-facing parameters of a snapshot.
#[derive(Debug, Clone)]
pub struct ListenerParams {
    pub bind_addr: String,
    pub port: u16,
    pub ignored_versions: Vec<SnmpVersion>,
    pub v3: V3Security,
    pub hostname: String,
}

impl ListenerParams {
    pub fn is_ignored(&self, version: SnmpVersion) -> bool {
        self.ignored_versions.contains(&version)
    }
}

/// The atomic reload unit: everything dispatch needs, immutable once
/// published.
pub struct EngineSnapshot {
    pub filters: Vec<Filter>,
    pub ipsets: IpSetRegistry,
    pub plugin_error_filters: Vec<Filter>,
    pub reporting: Vec<Box<dyn MetricPlugin>>,
    pub listener: ListenerParams,
    pub logging: LoggingSection,
}

impl std::fmt::Debug for EngineSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSnapshot")
            .field("filters", &self.filters)
            .field("ipsets", &self.ipsets)
            .field("plugin_error_filters", &self.plugin_error_filters)
            .field("reporting_count", &self.reporting.len())
            .field("listener", &self.listener)
            .field("logging", &self.logging)
            .finish()
    }
}

impl EngineSnapshot {
    /// A snapshot with no filters and no plugins; used as the terminal
    /// state swapped in at shutdown.
    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
            ipsets: IpSetRegistry::default(),
            plugin_error_filters: Vec::new(),
            reporting: Vec::new(),
            listener: ListenerParams {
                bind_addr: String::new(),
                port: 0,
                ignored_versions: Vec::new(),
                v3: V3Security {
                    msg_flags: MsgFlags::NoAuthNoPriv,
                    username: String::new(),
                    auth_protocol: AuthProtocol::NoAuth,
                    auth_password: String::new(),
                    privacy_protocol: PrivacyProtocol::NoPriv,
                    privacy_password: String::new(),
                },
                hostname: String::new(),
            },
            logging: LoggingSection::default(),
        }
    }

    /// Fan a counter increment out to every reporting plugin.
    pub fn report_inc(&self, id: CounterId) {
        for reporter in &self.reporting {
            reporter.inc(id);
        }
    }

    /// Close every bound plugin exactly once. Per-plugin failures are
    /// logged and do not abort the teardown.
    pub async fn close(&self) {
        for filter in self.filters.iter().chain(&self.plugin_error_filters) {
            if let FilterAction::Plugin(plugin) = &filter.action {
                if let Err(err) = plugin.close().await {
                    warn!(
                        plugin = %filter.action_name,
                        error = %err,
                        "unable to perform close operation"
                    );
                }
            }
        }
        for reporter in &self.reporting {
            if let Err(err) = reporter.close().await {
                warn!(error = %err, "unable to close reporting plugin");
            }
        }
    }
}

/// Assemble a snapshot from a raw document. The input has already had CLI
/// and environment overrides applied.
pub async fn build_snapshot(
    config: &RawConfig,
    registry: &PluginRegistry,
    secrets: &dyn SecretResolver,
) -> Result<EngineSnapshot, ConfigError> {
    let ignored_versions = validate_ignore_versions(&config.general.ignore_versions)?;
    let v3 = validate_v3(&config.snmp_v3, secrets)?;
    let ipsets = IpSetRegistry::from_stanzas(&config.ipsets)?;

    let mut filters = Vec::with_capacity(config.filters.len());
    for (index, section) in config.filters.iter().enumerate() {
        filters.push(build_filter(section, index, &ipsets, registry, secrets, &config.logging).await?);
    }
    info!(num_filters = filters.len(), "configured filter conditions");

    let mut plugin_error_filters = Vec::with_capacity(config.plugin_error_actions.len());
    for (index, section) in config.plugin_error_actions.iter().enumerate() {
        plugin_error_filters
            .push(build_filter(section, index, &ipsets, registry, secrets, &config.logging).await?);
    }
    if !plugin_error_filters.is_empty() {
        info!(
            num_filters = plugin_error_filters.len(),
            "configured plugin error conditions"
        );
    }

    let mut reporting = Vec::with_capacity(config.reporting.len());
    for section in &config.reporting {
        let mut plugin = registry
            .build_metric(&section.plugin)
            .ok_or_else(|| ConfigError::UnknownReporter(section.plugin.clone()))?;
        let mut args = section.args.clone();
        merge_secrets(&mut args, secrets).map_err(|source| ConfigError::Secret {
            field: format!("reporting plugin {} args", section.plugin),
            source,
        })?;
        plugin
            .configure(&args, COUNTER_DEFS)
            .await
            .map_err(|source| ConfigError::ReporterConfigure {
                name: section.plugin.clone(),
                source,
            })?;
        reporting.push(plugin);
    }
    if !reporting.is_empty() {
        info!(num_reporters = reporting.len(), "configured metric reporting plugins");
    }

    Ok(EngineSnapshot {
        filters,
        ipsets,
        plugin_error_filters,
        reporting,
        listener: ListenerParams {
            bind_addr: config.general.listen_address.clone(),
            port: config.general.listen_port,
            ignored_versions,
            v3,
            hostname: config.general.hostname.clone(),
        },
        logging: config.logging.clone(),
    })
}

/// Normalize and dedup the ignored-version tokens. Rejecting all three
/// happens after deduplication, so `[v1, 1, v1]` counts as one version.
fn validate_ignore_versions(tokens: &[String]) -> Result<Vec<SnmpVersion>, ConfigError> {
    let mut ignored = Vec::new();
    for token in tokens {
        let version = SnmpVersion::from_token(token)
            .ok_or_else(|| ConfigError::BadVersionToken(token.clone()))?;
        if !ignored.contains(&version) {
            ignored.push(version);
        }
    }
    if ignored.len() > 2 {
        return Err(ConfigError::AllVersionsIgnored);
    }
    Ok(ignored)
}

fn validate_v3(
    section: &crate::config::SnmpV3Section,
    secrets: &dyn SecretResolver,
) -> Result<V3Security, ConfigError> {
    let msg_flags = match section.msg_flags.to_lowercase().as_str() {
        "noauthnopriv" | "" => MsgFlags::NoAuthNoPriv,
        "authnopriv" => MsgFlags::AuthNoPriv,
        "authpriv" => MsgFlags::AuthPriv,
        _ => return Err(ConfigError::BadMsgFlags(section.msg_flags.clone())),
    };

    let auth_protocol = match section.auth_protocol.to_lowercase().as_str() {
        "noauth" | "" => AuthProtocol::NoAuth,
        "sha" => AuthProtocol::Sha,
        "md5" => AuthProtocol::Md5,
        _ => return Err(ConfigError::BadAuthProtocol(section.auth_protocol.clone())),
    };

    let auth_password =
        secrets
            .resolve(&section.auth_password)
            .map_err(|source| ConfigError::Secret {
                field: "snmpv3:auth_password".to_string(),
                source,
            })?;

    let privacy_protocol = match section.privacy_protocol.to_lowercase().as_str() {
        "nopriv" | "" => PrivacyProtocol::NoPriv,
        "aes" => PrivacyProtocol::Aes,
        "des" => PrivacyProtocol::Des,
        _ => {
            return Err(ConfigError::BadPrivacyProtocol(
                section.privacy_protocol.clone(),
            ))
        }
    };

    let privacy_password =
        secrets
            .resolve(&section.privacy_password)
            .map_err(|source| ConfigError::Secret {
                field: "snmpv3:privacy_password".to_string(),
                source,
            })?;

    if msg_flags.requires_auth() && auth_protocol == AuthProtocol::NoAuth {
        return Err(ConfigError::AuthProtocolRequired);
    }
    if msg_flags.requires_privacy() && privacy_protocol == PrivacyProtocol::NoPriv {
        return Err(ConfigError::PrivacyProtocolRequired);
    }

    Ok(V3Security {
        msg_flags,
        username: section.username.clone(),
        auth_protocol,
        auth_password,
        privacy_protocol,
        privacy_password,
    })
}

async fn build_filter(
    section: &FilterSection,
    index: usize,
    ipsets: &IpSetRegistry,
    registry: &PluginRegistry,
    secrets: &dyn SecretResolver,
    logging: &LoggingSection,
) -> Result<Filter, ConfigError> {
    let mut matchers = Vec::new();

    for token in &section.snmp_versions {
        let version = SnmpVersion::from_token(token).ok_or_else(|| ConfigError::FilterVersion {
            index,
            token: token.clone(),
        })?;
        matchers.push(Matcher::new(TrapField::Version, MatchKind::VersionEq(version)));
    }

    if let Some(kind) = build_ip_kind(&section.source_ip, index, TrapField::SourceIp, ipsets)? {
        matchers.push(Matcher::new(TrapField::SourceIp, kind));
    }
    if let Some(kind) = build_ip_kind(&section.agent_address, index, TrapField::AgentAddr, ipsets)? {
        matchers.push(Matcher::new(TrapField::AgentAddr, kind));
    }

    if section.generic_type != -1 {
        matchers.push(Matcher::new(
            TrapField::GenericType,
            MatchKind::IntEq(section.generic_type),
        ));
    }
    if section.specific_type != -1 {
        matchers.push(Matcher::new(
            TrapField::SpecificType,
            MatchKind::IntEq(section.specific_type),
        ));
    }

    if !section.enterprise_oid.is_empty() {
        let re = Regex::new(&section.enterprise_oid).map_err(|source| ConfigError::BadRegex {
            index,
            field: TrapField::EnterpriseOid.name(),
            pattern: section.enterprise_oid.clone(),
            source,
        })?;
        matchers.push(Matcher::new(TrapField::EnterpriseOid, MatchKind::Regex(re)));
    }

    let match_all = matchers.is_empty();
    let action = bind_action(section, index, registry, secrets, logging).await?;

    Ok(Filter {
        index,
        matchers,
        match_all,
        action_name: section.action_name.clone(),
        action,
        break_after: section.break_after,
    })
}

/// Compile one IP-field entry. `ipset:NAME` is a set reference, a leading
/// `/` marks a regex, a `/` anywhere else a CIDR, anything else a literal.
fn build_ip_kind(
    entry: &str,
    index: usize,
    field: TrapField,
    ipsets: &IpSetRegistry,
) -> Result<Option<MatchKind>, ConfigError> {
    if entry.is_empty() {
        return Ok(None);
    }
    if let Some(name) = entry.strip_prefix("ipset:") {
        let set = ipsets.get(name).ok_or_else(|| ConfigError::UnknownIpSet {
            index,
            field: field.name(),
            name: name.to_string(),
        })?;
        return Ok(Some(MatchKind::IpSet(name.to_string(), set)));
    }
    if let Some(pattern) = entry.strip_prefix('/') {
        let re = Regex::new(pattern).map_err(|source| ConfigError::BadRegex {
            index,
            field: field.name(),
            pattern: pattern.to_string(),
            source,
        })?;
        return Ok(Some(MatchKind::Regex(re)));
    }
    if entry.contains('/') {
        let net = entry.parse().map_err(|_| ConfigError::BadCidr {
            index,
            field: field.name(),
            value: entry.to_string(),
        })?;
        return Ok(Some(MatchKind::Cidr(net)));
    }
    Ok(Some(MatchKind::Literal(entry.to_string())))
}

async fn bind_action(
    section: &FilterSection,
    index: usize,
    registry: &PluginRegistry,
    secrets: &dyn SecretResolver,
    logging: &LoggingSection,
) -> Result<FilterAction, ConfigError> {
    match section.action_name.as_str() {
        "break" | "drop" => Ok(FilterAction::Drop),
        "nat" => {
            let arg = section
                .action_args
                .get("natIp")
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingNatArg { index })?;
            let ip: Ipv4Addr = arg.parse().map_err(|_| ConfigError::BadNatArg {
                index,
                value: arg.clone(),
            })?;
            Ok(FilterAction::Nat(ip))
        }
        name => {
            let mut plugin =
                registry
                    .build_action(name)
                    .ok_or_else(|| ConfigError::UnknownAction {
                        index,
                        name: name.to_string(),
                    })?;
            let mut args = section.action_args.clone();
            merge_secrets(&mut args, secrets).map_err(|source| ConfigError::Secret {
                field: format!("filter {index} action args"),
                source,
            })?;
            if name == "logfile" {
                apply_logging_defaults(&mut args, logging);
            }
            plugin
                .configure(&args)
                .await
                .map_err(|source| ConfigError::PluginConfigure {
                    index,
                    name: name.to_string(),
                    source,
                })?;
            Ok(FilterAction::Plugin(Arc::from(plugin)))
        }
    }
}

/// The logfile action inherits its rotation parameters from the logging
/// section unless the filter overrides them.
fn apply_logging_defaults(args: &mut HashMap<String, String>, logging: &LoggingSection) {
    args.entry("max_size_mb".to_string())
        .or_insert_with(|| logging.log_size_max.to_string());
    args.entry("max_backups".to_string())
        .or_insert_with(|| logging.log_backups_max.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::SnmpV3Section;
    use crate::secrets::EnvSecrets;

    fn filter_section(action: &str) -> FilterSection {
        FilterSection {
            snmp_versions: Vec::new(),
            source_ip: String::new(),
            agent_address: String::new(),
            generic_type: -1,
            specific_type: -1,
            enterprise_oid: String::new(),
            action_name: action.to_string(),
            action_args: HashMap::new(),
            break_after: false,
        }
    }

    fn base_config() -> RawConfig {
        let mut config = RawConfig::default();
        config.general.hostname = "test-host".to_string();
        config
    }

    async fn build(config: &RawConfig) -> Result<EngineSnapshot, ConfigError> {
        build_snapshot(config, &PluginRegistry::builtin(), &EnvSecrets).await
    }

    #[tokio::test]
    async fn test_empty_config_builds() {
        let snapshot = build(&base_config()).await.unwrap();
        assert!(snapshot.filters.is_empty());
        assert_eq!(snapshot.listener.hostname, "test-host");
    }

    #[tokio::test]
    async fn test_ignore_versions_dedup_before_check() {
        let mut config = base_config();
        config.general.ignore_versions =
            vec!["v1".to_string(), "1".to_string(), "V1".to_string(), "2c".to_string()];
        let snapshot = build(&config).await.unwrap();
        assert_eq!(
            snapshot.listener.ignored_versions,
            vec![SnmpVersion::V1, SnmpVersion::V2c]
        );
    }

    #[tokio::test]
    async fn test_all_versions_ignored_rejected() {
        let mut config = base_config();
        config.general.ignore_versions =
            vec!["v1".to_string(), "v2c".to_string(), "v3".to_string()];
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::AllVersionsIgnored
        ));
    }

    #[tokio::test]
    async fn test_unknown_version_token_rejected() {
        let mut config = base_config();
        config.general.ignore_versions = vec!["v4".to_string()];
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::BadVersionToken(_)
        ));
    }

    #[tokio::test]
    async fn test_v3_auth_mode_requires_auth_protocol() {
        let mut config = base_config();
        config.snmp_v3 = SnmpV3Section {
            msg_flags: "AuthNoPriv".to_string(),
            ..SnmpV3Section::default()
        };
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::AuthProtocolRequired
        ));
    }

    #[tokio::test]
    async fn test_v3_authpriv_requires_privacy_protocol() {
        let mut config = base_config();
        config.snmp_v3 = SnmpV3Section {
            msg_flags: "AuthPriv".to_string(),
            auth_protocol: "SHA".to_string(),
            ..SnmpV3Section::default()
        };
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::PrivacyProtocolRequired
        ));
    }

    #[tokio::test]
    async fn test_v3_authpriv_accepted_when_complete() {
        let mut config = base_config();
        config.snmp_v3 = SnmpV3Section {
            msg_flags: "AuthPriv".to_string(),
            username: "observer".to_string(),
            auth_protocol: "SHA".to_string(),
            auth_password: "authpass".to_string(),
            privacy_protocol: "AES".to_string(),
            privacy_password: "privpass".to_string(),
        };
        let snapshot = build(&config).await.unwrap();
        assert_eq!(snapshot.listener.v3.msg_flags, MsgFlags::AuthPriv);
        assert_eq!(snapshot.listener.v3.auth_protocol, AuthProtocol::Sha);
        assert_eq!(snapshot.listener.v3.privacy_protocol, PrivacyProtocol::Aes);
        assert_eq!(snapshot.listener.v3.auth_password, "authpass");
    }

    #[tokio::test]
    async fn test_v3_bad_msg_flags_rejected() {
        let mut config = base_config();
        config.snmp_v3.msg_flags = "AuthOnly".to_string();
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::BadMsgFlags(_)
        ));
    }

    #[tokio::test]
    async fn test_wildcard_filter_is_match_all() {
        let mut config = base_config();
        config.filters.push(filter_section("drop"));
        let snapshot = build(&config).await.unwrap();
        assert!(snapshot.filters[0].match_all);
        assert!(snapshot.filters[0].matchers.is_empty());
    }

    #[tokio::test]
    async fn test_filter_emits_only_present_fields() {
        let mut config = base_config();
        let mut section = filter_section("drop");
        section.snmp_versions = vec!["v1".to_string()];
        section.generic_type = 6;
        config.filters.push(section);
        let snapshot = build(&config).await.unwrap();
        let filter = &snapshot.filters[0];
        assert!(!filter.match_all);
        assert_eq!(filter.matchers.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_ipset_reference_rejected() {
        let mut config = base_config();
        let mut section = filter_section("drop");
        section.source_ip = "ipset:missing".to_string();
        config.filters.push(section);
        let err = build(&config).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownIpSet { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_bad_regex_names_filter() {
        let mut config = base_config();
        let mut section = filter_section("drop");
        section.enterprise_oid = "((".to_string();
        config.filters.push(filter_section("drop"));
        config.filters.push(section);
        let err = build(&config).await.unwrap_err();
        match err {
            ConfigError::BadRegex { index, field, .. } => {
                assert_eq!(index, 1);
                assert_eq!(field, "enterprise_oid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bad_cidr_rejected() {
        let mut config = base_config();
        let mut section = filter_section("drop");
        section.source_ip = "10.0.0.0/99".to_string();
        config.filters.push(section);
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::BadCidr { .. }
        ));
    }

    #[tokio::test]
    async fn test_nat_requires_argument() {
        let mut config = base_config();
        config.filters.push(filter_section("nat"));
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::MissingNatArg { index: 0 }
        ));
    }

    #[tokio::test]
    async fn test_nat_rejects_malformed_address() {
        let mut config = base_config();
        let mut section = filter_section("nat");
        section
            .action_args
            .insert("natIp".to_string(), "not-an-ip".to_string());
        config.filters.push(section);
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::BadNatArg { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let mut config = base_config();
        config.filters.push(filter_section("clickhouse"));
        let err = build(&config).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAction { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_plugin_configure_failure_surfaces() {
        let mut config = base_config();
        // logfile without a file argument fails configure
        config.filters.push(filter_section("logfile"));
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::PluginConfigure { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_reporter_rejected() {
        let mut config = base_config();
        config.reporting.push(crate::config::ReportingSection {
            plugin: "statsd".to_string(),
            args: HashMap::new(),
        });
        assert!(matches!(
            build(&config).await.unwrap_err(),
            ConfigError::UnknownReporter(_)
        ));
    }

    #[tokio::test]
    async fn test_assembly_is_idempotent() {
        let mut config = base_config();
        config.ipsets.push({
            let mut m = HashMap::new();
            m.insert("trusted".to_string(), vec!["1.2.3.4".to_string()]);
            m
        });
        let mut section = filter_section("drop");
        section.snmp_versions = vec!["v1".to_string()];
        section.source_ip = "ipset:trusted".to_string();
        section.agent_address = "10.0.0.0/8".to_string();
        section.enterprise_oid = r"^1\.3\.6\.".to_string();
        config.filters.push(section);

        let a = build(&config).await.unwrap();
        let b = build(&config).await.unwrap();
        assert_eq!(a.filters, b.filters);
        assert_eq!(a.listener.ignored_versions, b.listener.ignored_versions);
    }
}
