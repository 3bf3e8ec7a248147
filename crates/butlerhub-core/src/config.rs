use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ButlerError, Result};

/// Default scheduler tick period, seconds. A value of 0 or negative is
/// rejected at startup (see [`SchedulerConfig::validate`]).
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
/// Default per-thread-affinity-entry TTL, days.
pub const DEFAULT_THREAD_AFFINITY_TTL_DAYS: i64 = 14;
/// Default pending-action expiry, hours.
pub const DEFAULT_APPROVAL_EXPIRY_HOURS: i64 = 24;
/// Eligibility sweep cadence (cron), Switchboard only.
pub const ELIGIBILITY_SWEEP_CRON: &str = "*/5 * * * *";

/// Top-level configuration (`butlerhub.toml` + `BUTLERHUB_*` env overrides).
///
/// Every butler process loads one of these; which sub-sections apply depends
/// on which modules that butler imports (a butler with no `approval` section
/// simply never installs the gate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerConfig {
    pub butler_name: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub approval: Option<ApprovalConfig>,
    #[serde(default)]
    pub thread_affinity: ThreadAffinityConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Inbound webhook ingress — populated on the Switchboard, which is the
    /// only role that mounts `/webhooks/{source}`.
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    /// Identities allowed to call this butler's `route.execute`. Checked
    /// against `request_context.source_endpoint_identity`.
    #[serde(default = "default_trusted_route_callers")]
    pub trusted_route_callers: Vec<String>,
    /// Base URLs for peer butlers this process may call `route.execute` on,
    /// keyed by butler name. Populated on the Switchboard; unused elsewhere.
    #[serde(default)]
    pub peer_butlers: std::collections::HashMap<String, String>,
}

fn default_trusted_route_callers() -> Vec<String> {
    vec!["switchboard".to_string()]
}

impl Default for ButlerConfig {
    fn default() -> Self {
        Self {
            butler_name: "general".to_string(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            approval: None,
            thread_affinity: ThreadAffinityConfig::default(),
            channels: ChannelsConfig::default(),
            http: HttpConfig::default(),
            webhooks: WebhooksConfig::default(),
            trusted_route_callers: default_trusted_route_callers(),
            peer_butlers: std::collections::HashMap::new(),
        }
    }
}

impl ButlerConfig {
    pub fn is_trusted_route_caller(&self, source_endpoint_identity: &str) -> bool {
        self.trusted_route_callers
            .iter()
            .any(|id| id == source_endpoint_identity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding one SQLite file per butler plus `shared.db`.
    /// Simulates Postgres per-butler-schema isolation: each butler opens
    /// only its own file read-write and attaches `shared.db` read-only.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.butlerhub/data")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: DEFAULT_TICK_INTERVAL_SECS,
        }
    }
}

impl SchedulerConfig {
    /// A tick interval of 0 or negative is rejected at startup.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_seconds == 0 {
            return Err(ButlerError::Validation(
                "scheduler.tick_interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}

/// Risk tier attached to each gated tool; purely descriptive (relayed to the
/// caller in the `pending_approval` response), carries no automatic behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRiskTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatedToolConfig {
    pub tool_name: String,
    #[serde(default = "default_risk_tier")]
    pub risk_tier: ApprovalRiskTier,
    #[serde(default = "default_approval_expiry_hours")]
    pub expiry_hours: i64,
}

fn default_risk_tier() -> ApprovalRiskTier {
    ApprovalRiskTier::Medium
}

fn default_approval_expiry_hours() -> i64 {
    DEFAULT_APPROVAL_EXPIRY_HOURS
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub gated_tools: Vec<GatedToolConfig>,
    /// Deterministic standing-rule precedence: specificity, then
    /// bounded-before-unbounded, then newest-first, then id.
    #[serde(default = "default_rule_precedence")]
    pub rule_precedence: Vec<String>,
}

fn default_rule_precedence() -> Vec<String> {
    vec![
        "specificity".to_string(),
        "bounded_scope".to_string(),
        "newest_first".to_string(),
        "id_tiebreak".to_string(),
    ]
}

impl ApprovalConfig {
    pub fn get_effective_expiry(&self, tool_name: &str) -> i64 {
        self.gated_tools
            .iter()
            .find(|t| t.tool_name == tool_name)
            .map(|t| t.expiry_hours)
            .unwrap_or(DEFAULT_APPROVAL_EXPIRY_HOURS)
    }

    pub fn get_effective_risk_tier(&self, tool_name: &str) -> ApprovalRiskTier {
        self.gated_tools
            .iter()
            .find(|t| t.tool_name == tool_name)
            .map(|t| t.risk_tier)
            .unwrap_or(ApprovalRiskTier::Medium)
    }

    pub fn is_gated(&self, tool_name: &str) -> bool {
        self.enabled && self.gated_tools.iter().any(|t| t.tool_name == tool_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadAffinityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: i64,
}

impl Default for ThreadAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_days: DEFAULT_THREAD_AFFINITY_TTL_DAYS,
        }
    }
}

fn default_ttl_days() -> i64 {
    DEFAULT_THREAD_AFFINITY_TTL_DAYS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_email_api_base")]
    pub api_base: String,
    pub api_key: String,
    pub from_address: String,
}

fn default_email_api_base() -> String {
    "https://api.sendgrid.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub email: Option<EmailConfig>,
}

/// How a webhook source authenticates inbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAuthMode {
    HmacSha256,
    BearerToken,
    None,
}

/// One external webhook source the Switchboard's `/webhooks/{source}`
/// endpoint accepts, mapped onto an `ingest.v1` `(channel, provider,
/// endpoint_identity)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    pub name: String,
    pub channel: String,
    pub provider: String,
    pub endpoint_identity: String,
    #[serde(default = "default_webhook_auth_mode")]
    pub auth_mode: WebhookAuthMode,
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_webhook_auth_mode() -> WebhookAuthMode {
    WebhookAuthMode::None
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

impl WebhooksConfig {
    pub fn find(&self, name: &str) -> Option<&WebhookSourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

fn default_port() -> u16 {
    8089
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl ButlerConfig {
    /// Load config from a TOML file with `BUTLERHUB_*` env var overrides
    /// (nested keys split on `_`, e.g. `BUTLERHUB_SCHEDULER_TICK_INTERVAL_SECONDS`).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ButlerConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BUTLERHUB_").split("_"))
            .extract()
            .map_err(|e| ButlerError::Validation(format!("config: {e}")))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.butlerhub/butlerhub.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_rejects_zero_interval() {
        let cfg = SchedulerConfig {
            tick_interval_seconds: 0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn trusted_route_callers_defaults_to_switchboard_only() {
        let cfg = ButlerConfig::default();
        assert!(cfg.is_trusted_route_caller("switchboard"));
        assert!(!cfg.is_trusted_route_caller("health"));
    }

    #[test]
    fn approval_gated_tools_respect_enabled_flag() {
        let cfg = ApprovalConfig {
            enabled: false,
            gated_tools: vec![GatedToolConfig {
                tool_name: "telegram_send_message".to_string(),
                risk_tier: ApprovalRiskTier::High,
                expiry_hours: 12,
            }],
            rule_precedence: default_rule_precedence(),
        };
        assert!(!cfg.is_gated("telegram_send_message"));
    }
}
