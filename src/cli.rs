use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use iris_client::SettingsSources;

/// Iris: Interactive Relay for Intelligence Systems.
#[derive(Parser, Debug)]
#[command(name = "iris", version, about = "Iris: Interactive Relay for Intelligence Systems")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a broker client session and chat from the terminal.
    StartClient(StartClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartClientArgs {
    /// Settings file (defaults to `$XDG_CONFIG_HOME/neon/neon_iris/settings.json`).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Broker config file (`server`, `port`, `users.mq_handler`).
    #[arg(long = "mq-config", short = 'm')]
    pub mq_config: Option<PathBuf>,

    /// User profile file.
    #[arg(long = "user-config", short = 'u')]
    pub user_config: Option<PathBuf>,

    /// Language to accept input in.
    #[arg(long, short = 'l')]
    pub lang: Option<String>,

    /// Play audio responses.
    #[arg(long, short = 'a')]
    pub audio: bool,

    /// Talk to a built-in echo service instead of a broker.
    #[arg(long)]
    pub loopback: bool,

    #[arg(long, default_value = "warn")]
    pub log_level: String,

    #[arg(long)]
    pub json_logs: bool,
}

impl StartClientArgs {
    pub fn sources(&self) -> SettingsSources {
        SettingsSources {
            settings: self.config.clone(),
            mq: self.mq_config.clone(),
            user: self.user_config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_client_defaults() {
        let cli = Cli::try_parse_from(["iris", "start-client"]).unwrap();
        let Command::StartClient(args) = cli.command;
        assert!(!args.audio);
        assert!(!args.loopback);
        assert_eq!(args.log_level, "warn");
        assert!(args.lang.is_none());
        assert!(args.sources().settings.is_none());
    }

    #[test]
    fn start_client_flags() {
        let cli = Cli::try_parse_from([
            "iris",
            "start-client",
            "-m",
            "/etc/mq.json",
            "--user-config",
            "/etc/user.json",
            "-l",
            "fr-fr",
            "-a",
            "--loopback",
        ])
        .unwrap();
        let Command::StartClient(args) = cli.command;
        assert_eq!(args.mq_config, Some(PathBuf::from("/etc/mq.json")));
        assert_eq!(args.sources().user, Some(PathBuf::from("/etc/user.json")));
        assert_eq!(args.lang.as_deref(), Some("fr-fr"));
        assert!(args.audio && args.loopback);
    }
}
