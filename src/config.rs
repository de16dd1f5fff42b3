use config::ConfigError;
use secrecy::Secret;
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_DISCORD_API_URL: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // Guild REST API
    pub discord_api_url: String,
    pub discord_bot_token: Secret<String>,

    // Bearer token required by the HTTP front-end
    pub api_token: Secret<String>,

    // Front-end rate limit, per (guild, member)
    pub rate_limit_requests: u32,
    pub rate_limit_period_secs: u64,

    pub engine: EngineSettings,
}

/// Tunables shared by the revocation/restoration executors and the scheduler loop.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Candidate marker roles; the first one that exists in a guild is used.
    pub marker_role_ids: Vec<i64>,
    /// Scheduler period. Also the width of the near-due window.
    pub tick_interval: Duration,
    /// Wait between the role change and the channel overrides.
    pub grace_period: Duration,
    /// How long a finished record is kept past its end time.
    pub retention: chrono::Duration,
    /// How long past its end time a record may wait for a departed member.
    pub abandon_after: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            marker_role_ids: Vec::new(),
            tick_interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            retention: chrono::Duration::days(7),
            abandon_after: chrono::Duration::days(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let engine = EngineSettings::from_config(&config)?;

        let rate_limit_requests = match positive(&config, "rate_limit_requests")? {
            Some(requests) => u32::try_from(requests)
                .map_err(|_| ConfigError::Message("rate_limit_requests is too large".to_string()))?,
            None => 5,
        };

        Ok(Self {
            database_url: config.get("database_url")?,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port")?,

            discord_api_url: config
                .get("discord_api_url")
                .unwrap_or_else(|_| DEFAULT_DISCORD_API_URL.to_string()),
            discord_bot_token: Secret::new(config.get("discord_bot_token")?),

            api_token: Secret::new(config.get("api_token")?),

            rate_limit_requests,
            rate_limit_period_secs: positive(&config, "rate_limit_period_secs")?.unwrap_or(20),

            engine,
        })
    }
}

impl EngineSettings {
    /// Reads the engine keys. Unset keys take their default; set keys must
    /// parse, and every period except the grace period must be non-zero.
    pub fn from_config(config: &config::Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            marker_role_ids: parse_id_list(&config.get::<String>("marker_role_ids")?)?,
            tick_interval: positive(config, "tick_interval_secs")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.tick_interval),
            grace_period: optional::<u64>(config, "grace_period_secs")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace_period),
            retention: positive(config, "retention_days")?
                .map(|days| days_to_duration("retention_days", days))
                .transpose()?
                .unwrap_or(defaults.retention),
            abandon_after: positive(config, "abandon_after_days")?
                .map(|days| days_to_duration("abandon_after_days", days))
                .transpose()?
                .unwrap_or(defaults.abandon_after),
        })
    }
}

/// `Ok(None)` when `key` is unset; a value that does not parse is an error.
fn optional<T: DeserializeOwned>(config: &config::Config, key: &str) -> Result<Option<T>, ConfigError> {
    match config.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn positive(config: &config::Config, key: &str) -> Result<Option<u64>, ConfigError> {
    match optional::<u64>(config, key)? {
        Some(0) => Err(ConfigError::Message(format!("{key} must be greater than zero"))),
        value => Ok(value),
    }
}

fn days_to_duration(key: &str, days: u64) -> Result<chrono::Duration, ConfigError> {
    i64::try_from(days)
        .ok()
        .and_then(chrono::Duration::try_days)
        .ok_or_else(|| ConfigError::Message(format!("{key} is too large")))
}

/// Parses a comma separated list of snowflake ids, e.g. `"1234,5678"`.
fn parse_id_list(raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_err(|e| ConfigError::Message(format!("invalid role id {part:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_id_list("").unwrap(), Vec::<i64>::new());
        assert_eq!(parse_id_list("42,").unwrap(), vec![42]);
    }

    #[test]
    fn test_parse_id_list_rejects_garbage() {
        assert!(parse_id_list("12,abc").is_err());
    }

    #[test]
    fn test_engine_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.tick_interval, Duration::from_secs(10));
        assert_eq!(settings.grace_period, Duration::from_secs(2));
        assert_eq!(settings.retention, chrono::Duration::days(7));
    }

    fn engine_config(overrides: &[(&str, &str)]) -> config::Config {
        let mut builder = config::Config::builder()
            .set_override("marker_role_ids", "3")
            .unwrap();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value).unwrap();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_engine_settings_from_config() {
        let config = engine_config(&[
            ("tick_interval_secs", "30"),
            ("grace_period_secs", "0"),
            ("retention_days", "14"),
        ]);

        let settings = EngineSettings::from_config(&config).unwrap();

        assert_eq!(settings.marker_role_ids, vec![3]);
        assert_eq!(settings.tick_interval, Duration::from_secs(30));
        assert_eq!(settings.grace_period, Duration::ZERO);
        assert_eq!(settings.retention, chrono::Duration::days(14));
        assert_eq!(settings.abandon_after, chrono::Duration::days(30));
    }

    #[test]
    fn test_zero_periods_are_rejected() {
        for key in ["tick_interval_secs", "retention_days", "abandon_after_days"] {
            let config = engine_config(&[(key, "0")]);
            let err = EngineSettings::from_config(&config).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
        assert!(positive(&engine_config(&[("rate_limit_period_secs", "0")]), "rate_limit_period_secs").is_err());
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let config = engine_config(&[("tick_interval_secs", "ten")]);
        assert!(EngineSettings::from_config(&config).is_err());

        let config = engine_config(&[("grace_period_secs", "-1")]);
        assert!(EngineSettings::from_config(&config).is_err());
    }

    #[test]
    fn test_unset_values_take_defaults() {
        let settings = EngineSettings::from_config(&engine_config(&[])).unwrap();
        assert_eq!(settings.tick_interval, Duration::from_secs(10));
        assert_eq!(positive(&engine_config(&[]), "rate_limit_requests").unwrap(), None);
    }
}
