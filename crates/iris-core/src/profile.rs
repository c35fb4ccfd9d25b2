//! User profiles and the JSON deep-merge used to apply partial updates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Recursive merge of `source` over `target`.
///
/// Objects merge per key, arrays and scalars in `source` replace the target,
/// and `null` in `source` leaves the target value untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut merged), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    continue;
                }
                let next = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (_, source) => source,
    }
}

/// Per-user preferences sent along with every request.
///
/// Sections the client does not interpret are carried in `extra` so a
/// profile pushed by the service round-trips unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub user: UserInfo,
    pub speech: SpeechPrefs,
    pub units: UnitPrefs,
    pub location: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub username: String,
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub preferred_name: String,
    pub email: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechPrefs {
    pub stt_language: String,
    pub tts_language: String,
    pub secondary_tts_language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SpeechPrefs {
    fn default() -> Self {
        Self {
            stt_language: "en-us".into(),
            tts_language: "en-us".into(),
            secondary_tts_language: None,
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitPrefs {
    /// 12 or 24 hour clock.
    pub time: u8,
    /// One of MDY, YMD, DMY, YDM.
    pub date: String,
    /// `imperial` or `metric`.
    pub measure: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for UnitPrefs {
    fn default() -> Self {
        Self {
            time: 12,
            date: "MDY".into(),
            measure: "imperial".into(),
            extra: Map::new(),
        }
    }
}

impl UserProfile {
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.user.username = username.into();
        self
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    /// Return a copy of this profile with `patch` deep-merged over it.
    pub fn merged(&self, patch: &Value) -> Result<UserProfile, serde_json::Error> {
        let current = serde_json::to_value(self)?;
        serde_json::from_value(deep_merge(current, patch.clone()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
