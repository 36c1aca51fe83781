use crate::error::{Result, SyncError};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration parsed from the YAML config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub watch: WatchConfig,
    pub store: StoreConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Directory to observe (not recursive).
    pub path: PathBuf,
    #[serde(default = "default_target_file_name")]
    pub target_file_name: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub connection_string: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_table")]
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub from: String,
    pub to: String,
    /// `{date}` is replaced with the current local date.
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// How reports leave the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Pipe the message into a mail submission program.
    Sendmail {
        #[serde(default = "default_sendmail_program")]
        program: String,
        #[serde(default = "default_sendmail_args")]
        args: Vec<String>,
    },
    /// Drop `.eml` files into a relay's pickup directory.
    Pickup { dir: PathBuf },
    /// Only log the message.
    Log,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Sendmail {
            program: default_sendmail_program(),
            args: default_sendmail_args(),
        }
    }
}

fn default_target_file_name() -> String {
    "Vericelusers.txt".into()
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_table() -> String {
    crate::store::DEFAULT_TABLE.into()
}
fn default_subject() -> String {
    "Employee sync report for {date}".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_queue_capacity() -> usize {
    16
}
fn default_sendmail_program() -> String {
    "sendmail".into()
}
fn default_sendmail_args() -> Vec<String> {
    vec!["-t".into(), "-i".into()]
}

impl SyncConfig {
    /// Load, expand `${VAR}` secrets, and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content, |var| std::env::var(var).ok())
    }

    /// Parse config YAML, resolving `${VAR}` placeholders through `lookup`.
    pub fn from_yaml_str<F>(content: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: SyncConfig = serde_yaml::from_str(content)?;
        config.expand_secrets(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn expand_secrets<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.store.connection_string = expand_vars(&self.store.connection_string, lookup)?;
        self.notify.from = expand_vars(&self.notify.from, lookup)?;
        self.notify.to = expand_vars(&self.notify.to, lookup)?;
        if let TransportConfig::Sendmail { args, .. } = &mut self.notify.transport {
            for arg in args.iter_mut() {
                *arg = expand_vars(arg, lookup)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let target = &self.watch.target_file_name;
        if target.is_empty() || target.contains('/') || target.contains('\\') {
            return Err(SyncError::Config(format!(
                "watch.target_file_name must be a bare file name, got {target:?}"
            )));
        }
        if self.store.connection_string.trim().is_empty() {
            return Err(SyncError::Config("store.connection_string is empty".into()));
        }
        if self.notify.from.trim().is_empty() || self.notify.to.trim().is_empty() {
            return Err(SyncError::Config(
                "notify.from and notify.to are required".into(),
            ));
        }
        if self.notify.max_attempts == 0 {
            return Err(SyncError::Config("notify.max_attempts must be at least 1".into()));
        }
        if self.notify.queue_capacity == 0 {
            return Err(SyncError::Config(
                "notify.queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Full path of the file whose modifications trigger a pass.
    pub fn target_path(&self) -> PathBuf {
        self.path.join(&self.target_file_name)
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl NotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Replace every `${NAME}` in `input`. A name `lookup` cannot resolve is an error.
pub fn expand_vars<F>(input: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| SyncError::Other(format!("Regex error: {e}")))?;

    let mut missing = None;
    let expanded = re.replace_all(input, |caps: &Captures| {
        let var = &caps[1];
        match lookup(var) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(SyncError::MissingSecret { var }),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
watch:
  path: /srv/exports
store:
  connection_string: "file:/srv/db/peaches.db?mode=rwc"
notify:
  from: sync@example.com
  to: ops@example.com
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = SyncConfig::from_yaml_str(MINIMAL, env(&[])).unwrap();
        assert_eq!(config.watch.target_file_name, "Vericelusers.txt");
        assert_eq!(config.watch.debounce(), Duration::from_millis(100));
        assert_eq!(config.store.table, "employees");
        assert_eq!(config.store.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.notify.max_attempts, 3);
        assert_eq!(config.notify.transport, TransportConfig::default());
        assert_eq!(
            config.watch.target_path(),
            PathBuf::from("/srv/exports/Vericelusers.txt")
        );
    }

    #[test]
    fn test_secrets_expanded_from_environment() {
        let yaml = r#"
watch:
  path: /srv/exports
store:
  connection_string: "${DB_PATH}"
notify:
  from: "${MAIL_FROM}"
  to: ops@example.com
  transport:
    kind: sendmail
    program: msmtp
    args: ["--user=${SMTP_USER}", "-t"]
"#;
        let config = SyncConfig::from_yaml_str(
            yaml,
            env(&[
                ("DB_PATH", "/var/lib/peaches.db"),
                ("MAIL_FROM", "sync@example.com"),
                ("SMTP_USER", "relay"),
            ]),
        )
        .unwrap();
        assert_eq!(config.store.connection_string, "/var/lib/peaches.db");
        assert_eq!(config.notify.from, "sync@example.com");
        assert_eq!(
            config.notify.transport,
            TransportConfig::Sendmail {
                program: "msmtp".into(),
                args: vec!["--user=relay".into(), "-t".into()],
            }
        );
    }

    #[test]
    fn test_missing_secret_fails_fast() {
        let yaml = MINIMAL.replace("file:/srv/db/peaches.db?mode=rwc", "${DB_PASSWORD_URI}");
        let err = SyncConfig::from_yaml_str(&yaml, env(&[])).unwrap_err();
        match err {
            SyncError::MissingSecret { var } => assert_eq!(var, "DB_PASSWORD_URI"),
            other => panic!("expected MissingSecret, got {other:?}"),
        }
    }

    #[test]
    fn test_target_must_be_bare_file_name() {
        let yaml = MINIMAL.replace(
            "path: /srv/exports",
            "path: /srv/exports\n  target_file_name: sub/Vericelusers.txt",
        );
        let err = SyncConfig::from_yaml_str(&yaml, env(&[])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_pickup_transport() {
        let yaml = format!("{MINIMAL}  transport:\n    kind: pickup\n    dir: /var/spool/pickup\n");
        let config = SyncConfig::from_yaml_str(&yaml, env(&[])).unwrap();
        assert_eq!(
            config.notify.transport,
            TransportConfig::Pickup {
                dir: PathBuf::from("/var/spool/pickup")
            }
        );
    }

    #[test]
    fn test_expand_vars_leaves_plain_text() {
        assert_eq!(expand_vars("no secrets $HOME", &env(&[])).unwrap(), "no secrets $HOME");
    }
}
