use crate::api::{AnonymizeSettings, ApiConfig, EntityType, DEFAULT_BASE_URL};
use crate::db::Database;
use crate::stream::controller::DEFAULT_IDLE_TIMEOUT;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

pub const API_BASE_URL: &str = "api_base_url";
pub const ENABLED_RULES: &str = "enabled_rules";
pub const MASK_CHAR: &str = "mask_char";
pub const KEEP_PREFIX: &str = "keep_prefix";
pub const KEEP_SUFFIX: &str = "keep_suffix";
pub const IDLE_TIMEOUT_SECS: &str = "idle_timeout_secs";
pub const SESSION_ID: &str = "session_id";

const SETTING_KEYS: &[&str] = &[
    API_BASE_URL,
    ENABLED_RULES,
    MASK_CHAR,
    KEEP_PREFIX,
    KEEP_SUFFIX,
    IDLE_TIMEOUT_SECS,
    SESSION_ID,
];

pub const ENV_API_URL: &str = "REDACT_DESK_API_URL";
pub const ENV_DATA_DIR: &str = "REDACT_DESK_DATA_DIR";
pub const ENV_IDLE_TIMEOUT: &str = "REDACT_DESK_IDLE_TIMEOUT_SECS";

/// Upper bound for the kept prefix/suffix lengths.
pub const MAX_KEEP: u32 = 32;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Unknown setting key: {0}")]
    UnknownKey(String),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

fn invalid(key: &str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

pub fn parse_rules(value: &str) -> Result<BTreeSet<EntityType>, String> {
    let rules = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<EntityType>)
        .collect::<Result<BTreeSet<_>, _>>()?;
    if rules.is_empty() {
        return Err("at least one rule is required".into());
    }
    Ok(rules)
}

pub fn parse_mask_char(value: &str) -> Result<char, String> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_whitespace() => Ok(c),
        _ => Err("must be exactly one visible character".into()),
    }
}

pub fn parse_keep(value: &str) -> Result<u32, String> {
    let n: u32 = value
        .trim()
        .parse()
        .map_err(|_| "must be a non-negative integer".to_string())?;
    if n > MAX_KEEP {
        return Err(format!("must be at most {}", MAX_KEEP));
    }
    Ok(n)
}

fn parse_base_url(value: &str) -> Result<String, String> {
    let url = value.trim().trim_end_matches('/');
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("must start with http:// or https://".into());
    }
    Ok(url.to_string())
}

fn parse_idle_secs(value: &str) -> Result<u64, String> {
    value
        .trim()
        .parse()
        .map_err(|_| "must be a whole number of seconds".to_string())
}

/// Check a value for `key` and return the form it is stored in.
pub fn normalize(key: &str, value: &str) -> Result<String, SettingsError> {
    let normalized = match key {
        API_BASE_URL => parse_base_url(value),
        ENABLED_RULES => parse_rules(value).map(|rules| {
            rules
                .iter()
                .map(EntityType::as_str)
                .collect::<Vec<_>>()
                .join(",")
        }),
        MASK_CHAR => parse_mask_char(value).map(String::from),
        KEEP_PREFIX | KEEP_SUFFIX => parse_keep(value).map(|n| n.to_string()),
        IDLE_TIMEOUT_SECS => parse_idle_secs(value).map(|n| n.to_string()),
        SESSION_ID if !value.trim().is_empty() => Ok(value.trim().to_string()),
        SESSION_ID => Err("must not be empty".into()),
        other => return Err(SettingsError::UnknownKey(other.to_string())),
    };
    normalized.map_err(|reason| invalid(key, reason))
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), SettingsError> {
    let value = normalize(key, value)?;
    db.set_setting(key, &value)?;
    tracing::debug!(key, "setting stored");
    Ok(())
}

pub fn unset_setting(db: &Database, key: &str) -> Result<(), SettingsError> {
    if !SETTING_KEYS.contains(&key) {
        return Err(SettingsError::UnknownKey(key.to_string()));
    }
    db.delete_setting(key)?;
    Ok(())
}

/// Stored settings for display. The session id is shortened.
pub fn get_settings(db: &Database) -> Result<BTreeMap<String, String>, SettingsError> {
    let mut map = BTreeMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key)? {
            let chars: Vec<char> = value.chars().collect();
            if *key == SESSION_ID && chars.len() > 8 {
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                map.insert(key.to_string(), format!("{}...{}", head, tail));
            } else {
                map.insert(key.to_string(), value);
            }
        }
    }
    Ok(map)
}

/// Masking options from the store, falling back to the defaults per field.
pub fn load_anonymize_settings(db: &Database) -> Result<AnonymizeSettings, SettingsError> {
    let mut settings = AnonymizeSettings::default();
    if let Some(value) = db.get_setting(ENABLED_RULES)? {
        settings.enabled_rules = parse_rules(&value).map_err(|r| invalid(ENABLED_RULES, r))?;
    }
    if let Some(value) = db.get_setting(MASK_CHAR)? {
        settings.mask_char = parse_mask_char(&value).map_err(|r| invalid(MASK_CHAR, r))?;
    }
    if let Some(value) = db.get_setting(KEEP_PREFIX)? {
        settings.keep_prefix = parse_keep(&value).map_err(|r| invalid(KEEP_PREFIX, r))?;
    }
    if let Some(value) = db.get_setting(KEEP_SUFFIX)? {
        settings.keep_suffix = parse_keep(&value).map_err(|r| invalid(KEEP_SUFFIX, r))?;
    }
    Ok(settings)
}

/// Connection settings for one run of the client.
#[derive(Debug, Clone)]
pub struct DeskConfig {
    pub api: ApiConfig,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub session_id: Option<String>,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Environment first, then the store, then built-in defaults.
pub fn resolve_config(db: &Database) -> Result<DeskConfig, SettingsError> {
    let base_url = match env_value(ENV_API_URL) {
        Some(url) => parse_base_url(&url).map_err(|r| invalid(ENV_API_URL, r))?,
        None => db
            .get_setting(API_BASE_URL)?
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
    };

    let idle_secs = match env_value(ENV_IDLE_TIMEOUT) {
        Some(secs) => Some(parse_idle_secs(&secs).map_err(|r| invalid(ENV_IDLE_TIMEOUT, r))?),
        None => db
            .get_setting(IDLE_TIMEOUT_SECS)?
            .map(|secs| parse_idle_secs(&secs).map_err(|r| invalid(IDLE_TIMEOUT_SECS, r)))
            .transpose()?,
    };
    let idle_timeout = match idle_secs {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(DEFAULT_IDLE_TIMEOUT),
    };

    Ok(DeskConfig {
        api: ApiConfig { base_url },
        idle_timeout,
        session_id: db.get_setting(SESSION_ID)?,
    })
}

/// Where the local store lives.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = env_value(ENV_DATA_DIR) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|path| path.join("redact-desk"))
        .unwrap_or_else(|| PathBuf::from(".redact-desk"))
}
