//! Configuration management for tgrelay

use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default archive database file name
pub const DEFAULT_DB_PATH: &str = "tgrelay.sqlite3";

/// Default media/scratch directory name
pub const DEFAULT_MEDIA_DIR: &str = "media";

/// Default batch size for message fetching
pub const DEFAULT_BATCH: u32 = 500;

/// Default time window for time-based grouping (seconds)
pub const DEFAULT_GROUPING_WINDOW_SECS: u32 = 300;

/// Session name prefix given to accounts imported from foreign credential files
pub const IMPORTED_SESSION_PREFIX: &str = "relay_auto_";

/// Key under which foreign credential imports arrive; consumed at load,
/// never written back
const IMPORT_ACCOUNTS_KEY: &str = "telesmasher_accounts";

/// Telegram account credentials and session identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Session artifact name on local disk (also the account's identifier)
    pub session_name: String,

    /// Telegram API ID (get from my.telegram.org)
    pub api_id: i32,

    /// Telegram API hash (32 lowercase hex chars)
    pub api_hash: String,

    /// Phone number in E.164 form, for authentication
    #[serde(default)]
    pub phone_number: Option<String>,

    /// 2FA password, if the account has one
    #[serde(default)]
    pub password: Option<String>,
}

impl AccountConfig {
    /// True when either identifier matches (session name or phone number).
    pub fn matches(&self, identifier: &str) -> bool {
        self.session_name == identifier
            || self.phone_number.as_deref() == Some(identifier)
    }
}

/// Proxy type for upstream connections
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Socks5,
    Socks4,
    Http,
}

impl ProxyType {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyType::Socks5 => "socks5",
            ProxyType::Socks4 => "socks4",
            ProxyType::Http => "http",
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "type", default = "default_proxy_type")]
    pub proxy_type: ProxyType,

    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_proxy_type() -> ProxyType {
    ProxyType::Socks5
}

impl ProxyConfig {
    /// Render as a proxy URL for the transport layer. Credentials are
    /// embedded only here and never logged.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.proxy_type.scheme(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.proxy_type.scheme(), self.host, self.port),
        }
    }
}

/// Forwarding behaviour toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Skip groups whose files were already seen
    pub enable_deduplication: bool,

    /// Extra destination that receives only non-duplicate groups
    #[serde(default)]
    pub secondary_unique_destination: Option<String>,

    /// Prepend an origin header to forwarded messages
    pub forward_with_attribution: bool,

    /// Fan each forwarded group out to every account's Saved Messages
    #[serde(default)]
    pub forward_to_all_saved_messages: bool,

    /// Forum topic to post into at the destination
    #[serde(default)]
    pub destination_topic_id: Option<i32>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        ForwardingConfig {
            enable_deduplication: true,
            secondary_unique_destination: None,
            forward_with_attribution: true,
            forward_to_all_saved_messages: false,
            destination_topic_id: None,
        }
    }
}

/// Scope of duplicate lookups
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Match against every recorded file
    Global,
    /// Match only files already seen in the origin channel
    Channel,
}

/// Near-duplicate detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationConfig {
    /// Run perceptual/fuzzy passes in addition to exact SHA-256
    pub enable_near_duplicates: bool,

    /// Similarity percentage at or above which two fuzzy hashes match (0..100)
    pub fuzzy_hash_similarity_threshold: u32,

    /// Hamming distance at or below which two perceptual hashes match (0..64)
    pub perceptual_hash_distance_threshold: u32,

    /// Whether duplicate lookups are global or per origin channel
    #[serde(default = "default_dedup_scope")]
    pub scope: DedupScope,
}

fn default_dedup_scope() -> DedupScope {
    DedupScope::Global
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        DeduplicationConfig {
            enable_near_duplicates: false,
            fuzzy_hash_similarity_threshold: 90,
            perceptual_hash_distance_threshold: 5,
            scope: DedupScope::Global,
        }
    }
}

/// Message grouping strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupingStrategy {
    None,
    Filename,
    Time,
}

/// Message grouping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    pub strategy: GroupingStrategy,

    /// Max gap between consecutive messages of one time group
    pub time_window_seconds: u32,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        GroupingConfig {
            strategy: GroupingStrategy::None,
            time_window_seconds: DEFAULT_GROUPING_WINDOW_SECS,
        }
    }
}

/// Attribution header configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Header template; recognized fields: {sender_name} {sender_id}
    /// {source_channel_name} {source_channel_id} {message_id} {timestamp}
    pub template: String,

    /// strftime-style timestamp format
    pub timestamp_format: String,

    /// Destination ids that never receive attribution headers
    #[serde(default)]
    pub disable_attribution_for_groups: Vec<i64>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        AttributionConfig {
            template: "[Forwarded from {source_channel_name} (ID: {source_channel_id})]"
                .to_string(),
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            disable_attribution_for_groups: Vec::new(),
        }
    }
}

/// Scheduler and queue-drain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Aggregate soft cap on throttled transfers; 0 disables throttling
    pub bandwidth_limit_kbps: u64,

    /// Max schedules forwarding at once
    pub max_concurrent_forwards: usize,

    /// Cron poll interval; jitter is applied on top
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            bandwidth_limit_kbps: 0,
            max_concurrent_forwards: 4,
            poll_interval_seconds: 60,
        }
    }
}

/// Retry policy for upstream operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    /// Symmetric jitter fraction applied to every delay
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 300.0,
            jitter_factor: 0.3,
        }
    }
}

/// Cloud onboarding behaviour (invitation pacing for pooled accounts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub auto_invite_accounts: bool,
    pub invitation_min_seconds: u64,
    pub invitation_max_seconds: u64,
    pub invitation_variance: f64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            auto_invite_accounts: true,
            invitation_min_seconds: 120,
            invitation_max_seconds: 600,
            invitation_variance: 0.3,
        }
    }
}

/// Remote sync target for archived media
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: String,
    pub remote_base_path: String,
}

impl Default for VpsConfig {
    fn default() -> Self {
        VpsConfig {
            enabled: false,
            host: String::new(),
            port: 22,
            username: String::new(),
            key_path: "~/.ssh/id_rsa".to_string(),
            remote_base_path: "/data/tgrelay".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account pool; at least one required to talk upstream
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    #[serde(default = "default_true")]
    pub download_media: bool,

    #[serde(default = "default_batch")]
    pub batch: u32,

    #[serde(default = "default_sleep_between_batches")]
    pub sleep_between_batches: f64,

    /// Timeout for single upstream verbs; iteration is unbounded but
    /// cancelable between items
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,

    #[serde(default)]
    pub forwarding: ForwardingConfig,

    #[serde(default)]
    pub deduplication: DeduplicationConfig,

    #[serde(default)]
    pub grouping: GroupingConfig,

    #[serde(default)]
    pub attribution: AttributionConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub vps: VpsConfig,

    /// Unknown keys are preserved across load/save cycles
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_media_dir() -> String {
    DEFAULT_MEDIA_DIR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch() -> u32 {
    DEFAULT_BATCH
}

fn default_sleep_between_batches() -> f64 {
    1.0
}

fn default_upstream_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Config {
            accounts: Vec::new(),
            proxy: None,
            db_path: default_db_path(),
            media_dir: default_media_dir(),
            download_media: true,
            batch: DEFAULT_BATCH,
            sleep_between_batches: default_sleep_between_batches(),
            upstream_timeout_seconds: default_upstream_timeout(),
            forwarding: ForwardingConfig::default(),
            deduplication: DeduplicationConfig::default(),
            grouping: GroupingConfig::default(),
            attribution: AttributionConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            cloud: CloudConfig::default(),
            vps: VpsConfig::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, merge defaults, import foreign
    /// credentials, and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            field: "path".to_string(),
            reason: format!("failed to read {}: {}", path.as_ref().display(), e),
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| Error::Config {
            field: "json".to_string(),
            reason: format!("failed to parse config: {}", e),
        })?;

        config.import_foreign_accounts();
        config.apply_env_overrides();

        let warnings = config.validate()?;
        for w in warnings {
            warn!("config: {}", w);
        }
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db_path) = std::env::var("TGRELAY_DB_PATH") {
            let db_path = db_path.trim().to_string();
            if !db_path.is_empty() {
                self.db_path = db_path;
            }
        }
        if let Ok(media_dir) = std::env::var("TGRELAY_MEDIA_DIR") {
            let media_dir = media_dir.trim().to_string();
            if !media_dir.is_empty() {
                self.media_dir = media_dir;
            }
        }
    }

    /// Consume the process-private foreign-credential key into the account
    /// pool. The key is removed so it never reaches disk again.
    fn import_foreign_accounts(&mut self) {
        let Some(value) = self.extra.remove(IMPORT_ACCOUNTS_KEY) else {
            return;
        };
        let Some(entries) = value.as_array() else {
            warn!("config: {} is not an array, ignoring", IMPORT_ACCOUNTS_KEY);
            return;
        };

        let mut known: std::collections::HashSet<(i32, String)> = self
            .accounts
            .iter()
            .map(|a| (a.api_id, a.api_hash.clone()))
            .collect();

        let mut imported = 0usize;
        for (idx, entry) in entries.iter().enumerate() {
            let (Some(phone), Some(api_id), Some(api_hash)) = (
                entry.get("phone_number").and_then(|v| v.as_str()),
                entry.get("api_id").and_then(|v| v.as_i64()),
                entry.get("api_hash").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let api_id = api_id as i32;
            if !known.insert((api_id, api_hash.to_string())) {
                continue;
            }
            let bare_phone = phone.replace('+', "");
            self.accounts.push(AccountConfig {
                session_name: format!("{}{}_{}", IMPORTED_SESSION_PREFIX, bare_phone, idx),
                api_id,
                api_hash: api_hash.to_string(),
                phone_number: Some(phone.to_string()),
                password: entry
                    .get("password")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            });
            imported += 1;
        }
        if imported > 0 {
            info!("Imported {} account(s) from foreign credential file", imported);
        }
    }

    /// Save configuration as 2-space-indented JSON. The foreign-credential
    /// import key is stripped (it is consumed at load, but a caller may have
    /// re-inserted it).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut copy = self.clone();
        copy.extra.remove(IMPORT_ACCOUNTS_KEY);

        let content = serde_json::to_string_pretty(&copy).map_err(|e| Error::Config {
            field: "json".to_string(),
            reason: format!("failed to serialize config: {}", e),
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| Error::Config {
            field: "path".to_string(),
            reason: format!("failed to write {}: {}", path.as_ref().display(), e),
        })?;

        Ok(())
    }

    /// Validate schema ranges and security constraints. Returns non-fatal
    /// warnings (default-looking credentials).
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.accounts.is_empty() {
            return Err(Error::Config {
                field: "accounts".to_string(),
                reason: "at least one account is required".to_string(),
            });
        }

        for (idx, account) in self.accounts.iter().enumerate() {
            let field = format!("accounts[{}]", idx);
            if account.api_id < 1 {
                return Err(Error::Config {
                    field: format!("{}.api_id", field),
                    reason: "must be a positive integer".to_string(),
                });
            }
            if !is_valid_api_hash(&account.api_hash) {
                return Err(Error::Config {
                    field: format!("{}.api_hash", field),
                    reason: "must be 32 lowercase hex characters".to_string(),
                });
            }
            if !is_valid_session_name(&account.session_name) {
                return Err(Error::Config {
                    field: format!("{}.session_name", field),
                    reason: "must match ^[a-zA-Z0-9_.-]{1,255}$".to_string(),
                });
            }
            if let Some(phone) = &account.phone_number {
                if !is_valid_phone_number(phone) {
                    return Err(Error::Config {
                        field: format!("{}.phone_number", field),
                        reason: "must be an E.164 number".to_string(),
                    });
                }
            }
            if account.api_id == 123456
                || crate::recovery::credentials_match(
                    &account.api_hash,
                    "0123456789abcdef0123456789abcdef",
                )
            {
                warnings.push(format!(
                    "account '{}' carries default-looking credentials",
                    account.session_name
                ));
            }
        }

        for (field, value) in [("db_path", &self.db_path), ("media_dir", &self.media_dir)] {
            if !is_safe_path(value) {
                return Err(Error::Config {
                    field: field.to_string(),
                    reason: format!("unsafe path: {}", value),
                });
            }
        }

        if !(1..=10_000).contains(&self.batch) {
            return Err(Error::Config {
                field: "batch".to_string(),
                reason: "must be within 1..10000".to_string(),
            });
        }
        if !(0.0..=3600.0).contains(&self.sleep_between_batches) {
            return Err(Error::Config {
                field: "sleep_between_batches".to_string(),
                reason: "must be within 0..3600".to_string(),
            });
        }
        if self.deduplication.fuzzy_hash_similarity_threshold > 100 {
            return Err(Error::Config {
                field: "deduplication.fuzzy_hash_similarity_threshold".to_string(),
                reason: "must be within 0..100".to_string(),
            });
        }
        if self.deduplication.perceptual_hash_distance_threshold > 64 {
            return Err(Error::Config {
                field: "deduplication.perceptual_hash_distance_threshold".to_string(),
                reason: "must be within 0..64".to_string(),
            });
        }
        if !(1..=86_400).contains(&self.grouping.time_window_seconds) {
            return Err(Error::Config {
                field: "grouping.time_window_seconds".to_string(),
                reason: "must be within 1..86400".to_string(),
            });
        }
        if self.scheduler.max_concurrent_forwards == 0 {
            return Err(Error::Config {
                field: "scheduler.max_concurrent_forwards".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(dest) = &self.forwarding.secondary_unique_destination {
            if !is_valid_entity(dest) {
                return Err(Error::Config {
                    field: "forwarding.secondary_unique_destination".to_string(),
                    reason: format!("invalid entity reference: {}", dest),
                });
            }
        }

        Ok(warnings)
    }

    /// Accounts eligible for automatic selection. Imported accounts are
    /// preferred; the full pool is the fallback.
    pub fn active_accounts(&self) -> Vec<&AccountConfig> {
        let imported: Vec<&AccountConfig> = self
            .accounts
            .iter()
            .filter(|a| a.session_name.starts_with(IMPORTED_SESSION_PREFIX))
            .collect();
        if imported.is_empty() {
            self.accounts.iter().collect()
        } else {
            imported
        }
    }

    /// Pick an account: by identifier when given, otherwise a random member
    /// of the active subset, otherwise the first configured account.
    pub fn pick_account(&self, prefer: Option<&str>) -> Result<&AccountConfig> {
        if let Some(identifier) = prefer {
            return self
                .accounts
                .iter()
                .find(|a| a.matches(identifier))
                .ok_or_else(|| Error::AccountNotFound(identifier.to_string()));
        }

        let active = self.active_accounts();
        if let Some(account) = active.choose(&mut rand::thread_rng()).copied() {
            return Ok(account);
        }
        self.accounts
            .first()
            .ok_or_else(|| Error::AccountNotFound("no accounts configured".to_string()))
    }

    /// Account lookup by session name or phone number.
    pub fn find_account(&self, identifier: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.matches(identifier))
    }

    /// Directory holding session artifacts, derived from the config location.
    pub fn session_dir(config_path: &Path) -> PathBuf {
        config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Entity references are @handles, bare names, or signed integer ids.
pub fn is_valid_entity(entity: &str) -> bool {
    if entity.parse::<i64>().is_ok() {
        return true;
    }
    let re = regex::Regex::new(r"^[@a-zA-Z0-9_.-]{1,500}$").unwrap();
    re.is_match(entity)
}

/// Session names become file names; keep them boring.
pub fn is_valid_session_name(name: &str) -> bool {
    let re = regex::Regex::new(r"^[a-zA-Z0-9_.-]{1,255}$").unwrap();
    re.is_match(name)
}

pub fn is_valid_api_hash(hash: &str) -> bool {
    let re = regex::Regex::new(r"^[a-f0-9]{32}$").unwrap();
    re.is_match(hash)
}

pub fn is_valid_phone_number(phone: &str) -> bool {
    let re = regex::Regex::new(r"^\+?[0-9]{10,15}$").unwrap();
    re.is_match(phone)
}

/// Reject traversal and system-directory targets.
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.len() > 4096 || path.contains("..") {
        return false;
    }
    const DANGEROUS: [&str; 4] = ["/etc", "/sys", "/proc", "/dev"];
    !DANGEROUS.iter().any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountConfig {
        AccountConfig {
            session_name: "relay_1".to_string(),
            api_id: 987654,
            api_hash: "fedcba9876543210fedcba9876543210".to_string(),
            phone_number: Some("+15551234567".to_string()),
            password: None,
        }
    }

    fn config_with_account() -> Config {
        Config {
            accounts: vec![account()],
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = config_with_account();
        assert!(config.validate().unwrap().is_empty());
        assert_eq!(config.batch, DEFAULT_BATCH);
        assert!(config.forwarding.enable_deduplication);
        assert_eq!(config.deduplication.scope, DedupScope::Global);
    }

    #[test]
    fn test_no_accounts_is_rejected() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(Error::Config { field, .. }) if field == "accounts"
        ));
    }

    #[test]
    fn test_bad_api_hash_is_rejected() {
        let mut config = config_with_account();
        config.accounts[0].api_hash = "UPPERCASE".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_credentials_warn() {
        let mut config = config_with_account();
        config.accounts[0].api_id = 123456;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        for bad in ["../up", "/etc/passwd", "/sys/kernel", "/proc/1", "/dev/sda"] {
            let mut config = config_with_account();
            config.db_path = bad.to_string();
            assert!(config.validate().is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_entity_sanitization() {
        assert!(is_valid_entity("@some_channel"));
        assert!(is_valid_entity("-1001234567890"));
        assert!(is_valid_entity("plain.name-ok"));
        assert!(!is_valid_entity("has space"));
        assert!(!is_valid_entity("semi;colon"));
        assert!(!is_valid_entity(""));
    }

    #[test]
    fn test_session_name_sanitization() {
        assert!(is_valid_session_name("relay_1"));
        assert!(!is_valid_session_name("../escape"));
        assert!(!is_valid_session_name("a/b"));
        assert!(!is_valid_session_name(&"x".repeat(256)));
    }

    #[test]
    fn test_pick_account_by_identifier() {
        let config = config_with_account();
        assert_eq!(
            config.pick_account(Some("relay_1")).unwrap().api_id,
            987654
        );
        assert_eq!(
            config.pick_account(Some("+15551234567")).unwrap().api_id,
            987654
        );
        assert!(config.pick_account(Some("missing")).is_err());
    }

    #[test]
    fn test_pick_account_prefers_imported() {
        let mut config = config_with_account();
        let mut imported = account();
        imported.session_name = format!("{}15550000000_0", IMPORTED_SESSION_PREFIX);
        imported.api_id = 111111;
        imported.api_hash = "abcdefabcdefabcdefabcdefabcdefab".to_string();
        config.accounts.push(imported);

        for _ in 0..8 {
            let picked = config.pick_account(None).unwrap();
            assert!(picked.session_name.starts_with(IMPORTED_SESSION_PREFIX));
        }
    }

    #[test]
    fn test_foreign_accounts_imported_and_stripped() {
        let raw = serde_json::json!({
            "accounts": [{
                "session_name": "relay_1",
                "api_id": 987654,
                "api_hash": "fedcba9876543210fedcba9876543210"
            }],
            "telesmasher_accounts": [
                {"phone_number": "+15550000001", "api_id": 222, "api_hash": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"},
                {"phone_number": "+15550000002", "api_id": 987654, "api_hash": "fedcba9876543210fedcba9876543210"}
            ],
            "unknown_key": {"kept": true}
        });
        let mut config: Config = serde_json::from_value(raw).unwrap();
        config.import_foreign_accounts();

        // one new account; the (api_id, api_hash) duplicate is skipped
        assert_eq!(config.accounts.len(), 2);
        assert!(config.accounts[1]
            .session_name
            .starts_with(IMPORTED_SESSION_PREFIX));
        assert!(!config.extra.contains_key("telesmasher_accounts"));
        assert!(config.extra.contains_key("unknown_key"));
    }

    #[test]
    fn test_save_round_trip_preserves_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = config_with_account();
        config
            .extra
            .insert("dashboard".to_string(), serde_json::json!({"port": 8080}));
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(
            reloaded.extra.get("dashboard"),
            config.extra.get("dashboard")
        );
    }

    #[test]
    fn test_proxy_url_rendering() {
        let proxy = ProxyConfig {
            enabled: true,
            proxy_type: ProxyType::Socks5,
            host: "127.0.0.1".to_string(),
            port: 9050,
            username: None,
            password: None,
        };
        assert_eq!(proxy.url(), "socks5://127.0.0.1:9050");
    }
}
