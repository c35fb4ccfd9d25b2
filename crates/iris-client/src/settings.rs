//! Client settings with layered loading.
//!
//! Loading flow:
//! 1. Start with compiled [`IrisSettings::default()`]
//! 2. Deep-merge the settings file, if present
//! 3. Deep-merge a broker config file into `mq` and a user profile file into
//!    `user`, when given
//! 4. Apply environment variable overrides (highest priority)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_broker::BrokerConfig;
use iris_core::{deep_merge, UserProfile};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::SettingsError;

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Name of the broker user entry the client authenticates as.
pub const MQ_USER_ENTRY: &str = "mq_handler";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrisSettings {
    pub mq: MqSettings,
    pub client: ClientSettings,
    /// Profile seeded into every new session.
    pub user: UserProfile,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqSettings {
    pub server: String,
    pub port: u16,
    pub vhost: String,
    pub users: BTreeMap<String, MqUser>,
    pub request_queue: String,
    pub error_queue: String,
    /// Shared response queue. When unset each client consumes a queue named
    /// after its routing identity.
    pub response_queue: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for MqSettings {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: 5672,
            vhost: "/neon_chat_api".into(),
            users: BTreeMap::new(),
            request_queue: "neon_chat_api_request".into(),
            error_queue: "neon_chat_api_error".into(),
            response_queue: None,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqUser {
    pub user: String,
    pub password: String,
}

impl MqSettings {
    pub fn broker_config(&self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        let (username, password) = match self.users.get(MQ_USER_ENTRY) {
            Some(entry) => (entry.user.clone(), SecretString::from(entry.password.clone())),
            None => (defaults.username.clone(), defaults.password.clone()),
        };
        BrokerConfig {
            server: self.server.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            username,
            password,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

/// What to do with a delivery whose body cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeFailurePolicy {
    /// Drop it and acknowledge.
    #[default]
    Ack,
    /// Drop it without acknowledging so the broker redelivers.
    Nack,
}

impl DecodeFailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "ack" => Some(Self::Ack),
            "nack" | "reject" => Some(Self::Nack),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub client_name: String,
    pub client: String,
    pub response_timeout_ms: u64,
    pub decode_failure: DecodeFailurePolicy,
    pub default_lang: String,
    pub languages: Vec<String>,
    pub audio_cache_dir: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_name: "unknown".into(),
            client: "mq_api".into(),
            response_timeout_ms: 30_000,
            decode_failure: DecodeFailurePolicy::Ack,
            default_lang: "en-us".into(),
            languages: vec!["en-us".into()],
            audio_cache_dir: None,
        }
    }
}

impl ClientSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Configured cache directory, else `$XDG_CACHE_HOME/neon/neon_iris`,
    /// else `~/.cache/neon/neon_iris`.
    pub fn audio_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.audio_cache_dir {
            return dir.clone();
        }
        let base = std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".cache"));
        base.join("neon").join("neon_iris")
    }

    /// Languages offered to front ends; never empty.
    pub fn supported_languages(&self) -> Vec<String> {
        if self.languages.is_empty() {
            vec![self.default_lang.clone()]
        } else {
            self.languages.clone()
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Resolve the default settings path (`$XDG_CONFIG_HOME/neon/neon_iris/settings.json`).
pub fn settings_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"));
    base.join("neon").join("neon_iris").join("settings.json")
}

/// Files named on the command line. Every path given must exist.
#[derive(Clone, Debug, Default)]
pub struct SettingsSources {
    pub settings: Option<PathBuf>,
    pub mq: Option<PathBuf>,
    pub user: Option<PathBuf>,
}

pub fn load_layered(sources: &SettingsSources) -> Result<IrisSettings> {
    let mut merged = serde_json::to_value(IrisSettings::default())?;
    match &sources.settings {
        Some(path) => merged = deep_merge(merged, read_json(path)?),
        None => {
            let path = settings_path();
            if path.exists() {
                merged = deep_merge(merged, read_json(&path)?);
            }
        }
    }
    if let Some(path) = &sources.mq {
        merged = deep_merge(merged, wrap("mq", read_json(path)?));
    }
    if let Some(path) = &sources.user {
        merged = deep_merge(merged, wrap("user", read_json(path)?));
    }
    let mut settings: IrisSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn wrap(section: &str, value: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(section.to_string(), value);
    Value::Object(map)
}

/// Reject settings no client could run with.
pub fn validate(settings: &IrisSettings) -> Result<()> {
    if settings.client.response_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "client.response_timeout_ms must be positive".into(),
        ));
    }
    if settings.mq.request_queue.is_empty() {
        return Err(SettingsError::InvalidValue("mq.request_queue is empty".into()));
    }
    if settings.mq.error_queue.is_empty() {
        return Err(SettingsError::InvalidValue("mq.error_queue is empty".into()));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut IrisSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
pub fn apply_overrides(settings: &mut IrisSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("IRIS_MQ_SERVER") {
        settings.mq.server = v;
    }
    if let Some(v) = read("IRIS_MQ_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.mq.port = port,
            None => warn!(key = "IRIS_MQ_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("IRIS_MQ_VHOST") {
        settings.mq.vhost = v;
    }
    if let Some(v) = read("IRIS_RESPONSE_TIMEOUT_MS") {
        match parse_u64_range(&v, 1, 3_600_000) {
            Some(ms) => settings.client.response_timeout_ms = ms,
            None => warn!(key = "IRIS_RESPONSE_TIMEOUT_MS", value = %v, "invalid timeout env var, ignoring"),
        }
    }
    if let Some(v) = read("IRIS_DEFAULT_LANG") {
        settings.client.default_lang = v;
    }
    if let Some(v) = read("IRIS_AUDIO_CACHE_DIR") {
        settings.client.audio_cache_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = read("IRIS_DECODE_FAILURE") {
        match DecodeFailurePolicy::parse(&v) {
            Some(policy) => settings.client.decode_failure = policy,
            None => warn!(key = "IRIS_DECODE_FAILURE", value = %v, "invalid policy env var, ignoring"),
        }
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use std::collections::HashMap;

    fn write(dir: &Path, name: &str, value: Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let settings = IrisSettings::default();
        assert_eq!(settings.mq.vhost, "/neon_chat_api");
        assert_eq!(settings.mq.request_queue, "neon_chat_api_request");
        assert_eq!(settings.mq.error_queue, "neon_chat_api_error");
        assert_eq!(settings.client.client, "mq_api");
        assert_eq!(settings.client.response_timeout(), Duration::from_secs(30));
        assert_eq!(settings.client.decode_failure, DecodeFailurePolicy::Ack);
    }

    fn from_file(path: &Path) -> Result<IrisSettings> {
        load_layered(&SettingsSources {
            settings: Some(path.to_path_buf()),
            ..Default::default()
        })
    }

    #[test]
    fn missing_named_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            from_file(&dir.path().join("nope.json")),
            Err(SettingsError::Io(_))
        ));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "settings.json",
            json!({"client": {"client_name": "cli", "response_timeout_ms": 5000}}),
        );
        let settings = from_file(&path).unwrap();
        assert_eq!(settings.client.client_name, "cli");
        assert_eq!(settings.client.response_timeout_ms, 5000);
        assert_eq!(settings.client.default_lang, "en-us");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            from_file(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn mq_config_file_in_original_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mq = write(
            dir.path(),
            "mq.json",
            json!({
                "server": "mq.example.org",
                "port": 25672,
                "users": {"mq_handler": {"user": "neon_api", "password": "s3cret"}}
            }),
        );
        let settings = load_layered(&SettingsSources {
            settings: Some(write(dir.path(), "empty.json", json!({}))),
            mq: Some(mq),
            user: None,
        })
        .unwrap();
        assert_eq!(settings.mq.server, "mq.example.org");
        assert_eq!(settings.mq.vhost, "/neon_chat_api");
        let broker = settings.mq.broker_config();
        assert_eq!(broker.port, 25672);
        assert_eq!(broker.username, "neon_api");
        assert_eq!(broker.password.expose_secret(), "s3cret");
    }

    #[test]
    fn user_config_file_seeds_profile() {
        let dir = tempfile::tempdir().unwrap();
        let user = write(
            dir.path(),
            "user.json",
            json!({"user": {"username": "alice"}, "speech": {"stt_language": "de-de"}}),
        );
        let settings = load_layered(&SettingsSources {
            settings: Some(write(dir.path(), "empty.json", json!({}))),
            mq: None,
            user: Some(user),
        })
        .unwrap();
        assert_eq!(settings.user.username(), "alice");
        assert_eq!(settings.user.speech.stt_language, "de-de");
        assert_eq!(settings.user.speech.tts_language, "en-us");
    }

    #[test]
    fn named_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_layered(&SettingsSources {
            settings: Some(dir.path().join("missing.json")),
            ..Default::default()
        });
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }

    #[test]
    fn overrides_apply_and_invalid_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("IRIS_MQ_SERVER", "broker.local"),
            ("IRIS_MQ_PORT", "70000"),
            ("IRIS_RESPONSE_TIMEOUT_MS", "1500"),
            ("IRIS_DECODE_FAILURE", "NACK"),
            ("IRIS_AUDIO_CACHE_DIR", "/var/cache/iris"),
        ]
        .into_iter()
        .collect();
        let mut settings = IrisSettings::default();
        apply_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.mq.server, "broker.local");
        assert_eq!(settings.mq.port, 5672);
        assert_eq!(settings.client.response_timeout_ms, 1500);
        assert_eq!(settings.client.decode_failure, DecodeFailurePolicy::Nack);
        assert_eq!(
            settings.client.audio_cache_dir(),
            PathBuf::from("/var/cache/iris")
        );
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let mut settings = IrisSettings::default();
        settings.client.response_timeout_ms = 0;
        assert!(matches!(
            validate(&settings),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("10", 1, 10), Some(10));
        assert_eq!(parse_u16_range("abc", 1, 10), None);
        assert_eq!(DecodeFailurePolicy::parse("reject"), Some(DecodeFailurePolicy::Nack));
        assert_eq!(DecodeFailurePolicy::parse("drop"), None);
    }

    #[test]
    fn supported_languages_fall_back_to_default() {
        let mut client = ClientSettings::default();
        client.languages.clear();
        client.default_lang = "fr-fr".into();
        assert_eq!(client.supported_languages(), vec!["fr-fr".to_string()]);
    }
}
