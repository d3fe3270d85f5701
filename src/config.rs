use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "settings.toml";
const MAX_BATCH_SIZE: u32 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub encryption_key: Option<KeyMaterial>,
    pub gmail: GmailSettings,
    pub sync: SyncSettings,
    pub queue: QueueSettings,
    pub shutdown_grace_seconds: u64,
}

/// Base64 vault key. Kept out of `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyMaterial(pub String);

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub recency_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: u32,
    pub schedule_seconds: u64,
    pub concurrency: usize,
    /// Upper bound on one provider fetch or send.
    pub provider_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub keep_completed: u32,
    pub keep_failed: u32,
    pub visibility_seconds: u64,
    pub poll_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:inbox.db?mode=rwc".to_string(),
            encryption_key: None,
            gmail: GmailSettings::default(),
            sync: SyncSettings::default(),
            queue: QueueSettings::default(),
            shutdown_grace_seconds: 30,
        }
    }
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            recency_days: 14,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            schedule_seconds: 300,
            concurrency: 5,
            provider_timeout_seconds: 120,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "account_sync".to_string(),
            attempts: 3,
            backoff_ms: 1000,
            keep_completed: 100,
            keep_failed: 500,
            visibility_seconds: 600,
            poll_millis: 1000,
        }
    }
}

impl Config {
    /// Reads `settings.toml` (or `$INBOX_SYNC_CONFIG`) when present, then
    /// applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("INBOX_SYNC_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path)),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = present("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(key) = present("ENCRYPTION_KEY") {
            self.encryption_key = Some(KeyMaterial(key));
        }
        if let Some(id) = present("GMAIL_CLIENT_ID") {
            self.gmail.client_id = Some(id);
        }
        if let Some(secret) = present("GMAIL_CLIENT_SECRET") {
            self.gmail.client_secret = Some(secret);
        }
        if let Some(size) = present("SYNC_BATCH_SIZE") {
            self.sync.batch_size = size
                .trim()
                .parse()
                .context("SYNC_BATCH_SIZE must be a positive integer")?;
        }
        if let Some(secs) = present("SYNC_SCHEDULE_SECONDS") {
            self.sync.schedule_seconds = secs
                .trim()
                .parse()
                .context("SYNC_SCHEDULE_SECONDS must be a positive integer")?;
        }
        if let Some(workers) = present("SYNC_CONCURRENCY") {
            self.sync.concurrency = workers
                .trim()
                .parse()
                .context("SYNC_CONCURRENCY must be a positive integer")?;
        }
        if let Some(secs) = present("SYNC_PROVIDER_TIMEOUT_SECONDS") {
            self.sync.provider_timeout_seconds = secs
                .trim()
                .parse()
                .context("SYNC_PROVIDER_TIMEOUT_SECONDS must be a positive integer")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 || self.sync.batch_size > MAX_BATCH_SIZE {
            bail!(
                "sync.batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE,
                self.sync.batch_size
            );
        }
        if self.sync.schedule_seconds == 0 {
            bail!("sync.schedule_seconds must be positive");
        }
        if self.sync.concurrency == 0 {
            bail!("sync.concurrency must be positive");
        }
        if self.sync.provider_timeout_seconds == 0 {
            bail!("sync.provider_timeout_seconds must be positive");
        }
        if self.queue.attempts == 0 {
            bail!("queue.attempts must be positive");
        }
        Ok(())
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.sync.schedule_seconds)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.provider_timeout_seconds)
    }

    /// How often a running job renews its queue lease.
    pub fn lease_refresh(&self) -> Duration {
        Duration::from_millis((self.queue.visibility_seconds.max(1) * 1000) / 3)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_worker_expectations() {
        let config = Config::default();
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.schedule_seconds, 300);
        assert_eq!(config.sync.concurrency, 5);
        assert_eq!(config.queue.attempts, 3);
        assert_eq!(config.queue.backoff_ms, 1000);
        assert_eq!(config.gmail.recency_days, 14);
        assert_eq!(config.provider_timeout(), Duration::from_secs(120));
        assert_eq!(config.lease_refresh(), Duration::from_secs(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_sections_are_partial() {
        let config = Config::from_toml(
            r#"
            database_url = "sqlite::memory:"

            [sync]
            batch_size = 50

            [gmail]
            client_id = "id.apps.googleusercontent.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.concurrency, 5);
        assert_eq!(
            config.gmail.client_id.as_deref(),
            Some("id.apps.googleusercontent.com")
        );
        assert!(config.gmail.client_secret.is_none());
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite:other.db"),
            ("ENCRYPTION_KEY", "a2V5"),
            ("SYNC_BATCH_SIZE", "10"),
            ("GMAIL_CLIENT_SECRET", "   "),
            ("SYNC_PROVIDER_TIMEOUT_SECONDS", "15"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_url, "sqlite:other.db");
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.provider_timeout_seconds, 15);
        assert!(config.encryption_key.is_some());
        assert!(config.gmail.client_secret.is_none());
    }

    #[test]
    fn rejects_out_of_range_batch_size() {
        let mut config = Config::default();
        config.sync.batch_size = 201;
        assert!(config.validate().is_err());
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_provider_timeout() {
        let mut config = Config::default();
        config.sync.provider_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_numeric_override_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(|k| {
            (k == "SYNC_SCHEDULE_SECONDS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn debug_output_hides_key() {
        let mut config = Config::default();
        config.encryption_key = Some(KeyMaterial("c2VjcmV0".to_string()));
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("c2VjcmV0"));
    }
}
