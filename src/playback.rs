use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Player command for an audio file.
pub fn player_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("mp3") => "mpg123",
        _ => "paplay",
    }
}

/// Play `path` and wait for the player to exit.
pub async fn play(path: &Path) -> std::io::Result<()> {
    let player = player_for(path);
    let status = Command::new(player)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    debug!(player, path = %path.display(), %status, "playback finished");
    Ok(())
}
