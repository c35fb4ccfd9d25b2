use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
    ($name:ident, $prefix:expr) => {
        branded_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(RoutingIdentity, "iris");
branded_id!(RequestId);

impl RequestId {
    /// Timestamp-derived request id (`<epoch seconds>.<micros>-<suffix>`).
    ///
    /// The suffix comes from the random tail of a v7 uuid so two requests
    /// issued within the same microsecond still differ.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let uuid = Uuid::now_v7().simple().to_string();
        let suffix = &uuid[uuid.len() - 8..];
        Self(format!(
            "{}.{:06}-{}",
            now.as_secs(),
            now.subsec_micros(),
            suffix
        ))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn routing_identity_has_prefix() {
        let id = RoutingIdentity::new();
        assert!(id.as_str().starts_with("iris_"), "got: {id}");
    }

    #[test]
    fn routing_identities_are_unique() {
        let a = RoutingIdentity::new();
        let b = RoutingIdentity::new();
        assert_ne!(a, b);
    }

    #[test]
    fn request_id_is_timestamp_derived() {
        let id = RequestId::new();
        let (stamp, suffix) = id.as_str().split_once('-').unwrap();
        let secs: f64 = stamp.parse().unwrap();
        assert!(secs > 1_600_000_000.0, "got: {id}");
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn request_ids_differ_in_tight_loop() {
        let ids: Vec<RequestId> = (0..200).map(|_| RequestId::new()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = SessionId::from_raw("alice");
        assert_eq!(id.as_str(), "alice");
        let parsed: SessionId = "alice".parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("sess_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_1\"");
    }
}
