use std::time::Duration;

use secrecy::SecretString;

/// Where and how to reach the broker.
#[derive(Clone)]
pub struct BrokerConfig {
    pub server: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: SecretString,
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: 5672,
            vhost: "/".into(),
            username: "guest".into(),
            password: SecretString::from("guest"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Connection URL without the password, for logs.
    pub fn display_url(&self) -> String {
        let vhost = self.vhost.trim_start_matches('/');
        format!(
            "amqp://{}@{}:{}/{}",
            self.username, self.server, self.port, vhost
        )
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_password() {
        let config = BrokerConfig {
            password: SecretString::from("hunter2"),
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("localhost"));
    }

    #[test]
    fn display_url_omits_password() {
        let config = BrokerConfig {
            server: "mq.example.org".into(),
            vhost: "/neon_chat_api".into(),
            username: "neon".into(),
            ..Default::default()
        };
        assert_eq!(
            config.display_url(),
            "amqp://neon@mq.example.org:5672/neon_chat_api"
        );
    }
}
