//! The interactive prompt.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use iris_client::{IrisClient, Outcome};
use iris_core::SessionId;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::playback;

pub const BANNER: &str = "Enter '!{lang}' to change language\n\
Enter '!quit' to quit.\n\
Enter '!mute' or '!unmute' to change audio playback";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Quit,
    Mute,
    Unmute,
    SendAudio(PathBuf),
    Language(String),
    Utterance(String),
    Empty,
}

/// Parse one input line. `!<path>` sends audio when `is_file` accepts the
/// expanded path; any other `!<word>` switches the response language.
pub fn parse(line: &str, is_file: impl Fn(&Path) -> bool) -> ReplCommand {
    let line = line.trim();
    let Some(command) = line.strip_prefix('!') else {
        return if line.is_empty() {
            ReplCommand::Empty
        } else {
            ReplCommand::Utterance(line.to_string())
        };
    };
    match command {
        "quit" => ReplCommand::Quit,
        "mute" => ReplCommand::Mute,
        "unmute" => ReplCommand::Unmute,
        other => {
            let path = expand_home(other);
            if is_file(&path) {
                ReplCommand::SendAudio(path)
            } else {
                match other.split_whitespace().next() {
                    Some(lang) => ReplCommand::Language(lang.to_string()),
                    None => ReplCommand::Empty,
                }
            }
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|_| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}

pub struct Repl {
    pub client: Arc<IrisClient>,
    pub session: SessionId,
    pub lang: String,
    pub audio: bool,
}

impl Repl {
    pub async fn run(mut self) -> Result<()> {
        println!("{BANNER}");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("Query: ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if !self.execute(parse(&line, Path::is_file)).await {
                break;
            }
        }
        Ok(())
    }

    /// Run one command. Returns false when the prompt should exit.
    pub async fn execute(&mut self, command: ReplCommand) -> bool {
        match command {
            ReplCommand::Quit => return false,
            ReplCommand::Empty => {}
            ReplCommand::Mute => {
                println!("Disabling Audio Playback");
                self.audio = false;
            }
            ReplCommand::Unmute => {
                println!("Enabling Audio Playback");
                self.audio = true;
            }
            ReplCommand::Language(lang) => {
                let patch = json!({"speech": {"secondary_tts_language": lang}});
                match self.client.update_profile(&self.session, &patch) {
                    Ok(_) => {
                        println!("Language set to {lang}");
                        self.lang = lang;
                    }
                    Err(e) => println!("{e}"),
                }
            }
            ReplCommand::SendAudio(path) => {
                let outcome = self
                    .client
                    .send_audio_file(&self.session, &path, Some(&self.lang))
                    .await;
                self.report(&path.display().to_string(), outcome).await;
            }
            ReplCommand::Utterance(text) => {
                let outcome = self
                    .client
                    .send_utterance(&self.session, &text, Some(&self.lang))
                    .await;
                self.report(&text, outcome).await;
            }
        }
        true
    }

    async fn report(&self, input: &str, outcome: Result<Outcome, iris_client::ClientError>) {
        match outcome {
            Ok(Outcome::Response(reply)) => {
                if self.audio {
                    for artifact in reply.artifacts() {
                        if let Err(e) = playback::play(artifact).await {
                            warn!(path = %artifact.display(), error = %e, "playback failed");
                        }
                    }
                }
            }
            Ok(Outcome::TimedOut { .. }) => println!("No response to: {input}"),
            Ok(Outcome::Api(reply)) => println!("{}: {}", reply.msg_type, serde_json::Value::Object(reply.data)),
            // Printed by the front end as the reply arrived.
            Ok(Outcome::NoIntentMatch) | Ok(Outcome::Error(_)) => {}
            Err(e) => println!("{e}"),
        }
    }
}
