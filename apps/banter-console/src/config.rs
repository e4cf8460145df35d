//! Environment-backed configuration for `banter-console`.

use std::{env, error::Error, fmt};

use chat_core::RuntimeConfig;
use chat_runtime::RuntimeOptions;
use chrono::FixedOffset;

const DEFAULT_USER_ID: &str = "alice";
const DEFAULT_USER_NAME: &str = "Alice";
const DEFAULT_CONVERSATION_ID: &str = "general";
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

/// Runtime configuration used by the console driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanterConfig {
    /// Local user the demo session runs as.
    pub user_id: String,
    /// Display name published with typing facts.
    pub user_name: String,
    /// Conversation opened by the demo.
    pub conversation_id: String,
    /// Runtime tuning forwarded to the conversation actor.
    pub runtime: RuntimeConfig,
    /// Fixed offset for day dividers. Host local time when unset.
    pub utc_offset: Option<FixedOffset>,
}

impl BanterConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("BANTER_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());
        let user_name = optional_trimmed_env("BANTER_USER_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_NAME.to_owned());
        let conversation_id = optional_trimmed_env("BANTER_CONVERSATION_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_owned());

        let defaults = RuntimeConfig::default();
        let timeline_max_items =
            parse_optional::<usize, _>("BANTER_TIMELINE_MAX_ITEMS", &mut lookup)?
                .unwrap_or(defaults.timeline_max_items);
        let open_limit = parse_optional::<u16, _>("BANTER_OPEN_LIMIT", &mut lookup)?
            .unwrap_or(defaults.open_limit);
        let page_limit_cap = parse_optional::<u16, _>("BANTER_PAGE_LIMIT_CAP", &mut lookup)?
            .unwrap_or(defaults.page_limit_cap);
        let typing_expiry_ms = parse_optional::<u64, _>("BANTER_TYPING_EXPIRY_MS", &mut lookup)?
            .unwrap_or(defaults.typing_expiry_ms);

        reject_zero("BANTER_TIMELINE_MAX_ITEMS", timeline_max_items as u64)?;
        reject_zero("BANTER_OPEN_LIMIT", u64::from(open_limit))?;
        reject_zero("BANTER_PAGE_LIMIT_CAP", u64::from(page_limit_cap))?;
        reject_zero("BANTER_TYPING_EXPIRY_MS", typing_expiry_ms)?;

        let utc_offset = parse_optional::<i32, _>("BANTER_UTC_OFFSET_MINUTES", &mut lookup)?
            .map(utc_offset_from_minutes)
            .transpose()?;

        Ok(Self {
            user_id,
            user_name,
            conversation_id,
            runtime: RuntimeConfig {
                timeline_max_items,
                open_limit,
                page_limit_cap,
                typing_expiry_ms,
                ..defaults
            },
            utc_offset,
        })
    }

    /// Options for `spawn_conversation_runtime`.
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            config: self.runtime.clone(),
            utc_offset: self.utc_offset,
        }
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn utc_offset_from_minutes(minutes: i32) -> Result<FixedOffset, ConfigError> {
    if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(ConfigError::InvalidValue {
            key: "BANTER_UTC_OFFSET_MINUTES",
            value: minutes.to_string(),
            reason: format!("must be within +/-{MAX_UTC_OFFSET_MINUTES} minutes"),
        });
    }
    FixedOffset::east_opt(minutes * 60).ok_or_else(|| ConfigError::InvalidValue {
        key: "BANTER_UTC_OFFSET_MINUTES",
        value: minutes.to_string(),
        reason: "not a representable offset".to_owned(),
    })
}

fn reject_zero(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<BanterConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        BanterConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = config_from_pairs(&[]).expect("empty config should parse");
        assert_eq!(cfg.user_id, DEFAULT_USER_ID);
        assert_eq!(cfg.user_name, DEFAULT_USER_NAME);
        assert_eq!(cfg.conversation_id, DEFAULT_CONVERSATION_ID);
        assert_eq!(cfg.runtime, RuntimeConfig::default());
        assert_eq!(cfg.utc_offset, None);
    }

    #[test]
    fn parses_identity_and_tuning() {
        let cfg = config_from_pairs(&[
            ("BANTER_USER_ID", "  bob "),
            ("BANTER_USER_NAME", "Bob"),
            ("BANTER_CONVERSATION_ID", "ops"),
            ("BANTER_TIMELINE_MAX_ITEMS", "200"),
            ("BANTER_OPEN_LIMIT", "15"),
            ("BANTER_PAGE_LIMIT_CAP", "40"),
            ("BANTER_TYPING_EXPIRY_MS", "1500"),
            ("BANTER_UTC_OFFSET_MINUTES", "-300"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.user_id, "bob");
        assert_eq!(cfg.conversation_id, "ops");
        assert_eq!(cfg.runtime.timeline_max_items, 200);
        assert_eq!(cfg.runtime.open_limit, 15);
        assert_eq!(cfg.runtime.page_limit_cap, 40);
        assert_eq!(cfg.runtime.typing_expiry_ms, 1_500);
        assert_eq!(
            cfg.utc_offset,
            Some(FixedOffset::west_opt(5 * 3_600).expect("valid offset"))
        );

        let options = cfg.runtime_options();
        assert_eq!(options.config.open_limit, 15);
        assert_eq!(options.utc_offset, cfg.utc_offset);
    }

    #[test]
    fn rejects_zero_limits() {
        let err = config_from_pairs(&[("BANTER_OPEN_LIMIT", "0")])
            .expect_err("zero open limit should fail");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "BANTER_OPEN_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
        );

        assert!(config_from_pairs(&[("BANTER_TIMELINE_MAX_ITEMS", "0")]).is_err());
    }

    #[test]
    fn rejects_unparseable_numbers_and_offsets() {
        let err = config_from_pairs(&[("BANTER_PAGE_LIMIT_CAP", "lots")])
            .expect_err("non-numeric cap should fail");
        assert!(err.to_string().starts_with("invalid BANTER_PAGE_LIMIT_CAP='lots'"));

        let err = config_from_pairs(&[("BANTER_UTC_OFFSET_MINUTES", "2000")])
            .expect_err("offset beyond a day should fail");
        assert!(err.to_string().contains("BANTER_UTC_OFFSET_MINUTES"));
    }
}
