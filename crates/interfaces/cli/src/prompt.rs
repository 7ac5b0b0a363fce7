use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use explorer_sync::FolderPicker;

/// Asks for the shared folder on the terminal.  An empty answer, EOF or a
/// non-interactive stdin counts as cancelling.
pub struct PromptPicker;

#[async_trait]
impl FolderPicker for PromptPicker {
    async fn pick_folder(&self, current: Option<&Path>) -> Option<PathBuf> {
        let current = current.map(Path::to_path_buf);
        match tokio::task::spawn_blocking(move || ask(current.as_deref())).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "folder prompt failed");
                None
            }
        }
    }
}

fn ask(current: Option<&Path>) -> Option<PathBuf> {
    if !io::stdin().is_terminal() {
        return None;
    }

    match current {
        Some(current) => print!("Shared folder [{}]: ", current.display()),
        None => print!("Shared folder: "),
    }
    io::stdout().flush().ok()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    parse_answer(&line, current)
}

fn parse_answer(line: &str, current: Option<&Path>) -> Option<PathBuf> {
    let answer = line.trim();
    if answer.is_empty() {
        return current.map(Path::to_path_buf);
    }
    if answer == "-" {
        return None;
    }
    Some(PathBuf::from(answer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_answer_keeps_current_folder() {
        let current = Path::new("/shared");
        assert_eq!(parse_answer("\n", Some(current)), Some(PathBuf::from("/shared")));
        assert_eq!(parse_answer("  \n", None), None);
    }

    #[test]
    fn dash_cancels() {
        assert_eq!(parse_answer("-\n", Some(Path::new("/shared"))), None);
    }

    #[test]
    fn answer_is_trimmed() {
        assert_eq!(
            parse_answer("  /mnt/team  \n", None),
            Some(PathBuf::from("/mnt/team"))
        );
    }
}
