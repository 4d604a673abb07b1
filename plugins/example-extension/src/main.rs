//! Minimal extension: reads operations from stdin, answers with publish
//! messages on stdout. Set `EXAMPLE_WATCH` to a file path to also refresh
//! whenever that file changes.

use std::io::Write;

use statushub::daemon::ExtensionMessage;
use statushub::extension::{ClickAction, Operation, Reason, StatusPayload};
use tokio::io::{AsyncBufReadExt, BufReader};

fn emit(message: &ExtensionMessage) -> std::io::Result<()> {
    let line = serde_json::to_string(message)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()
}

fn status(count: u64, reason: Reason) -> StatusPayload {
    StatusPayload::visible(count.to_string())
        .with_title(format!("Refreshed {} times", count))
        .with_body(format!("Last reason: {}", reason))
        .with_click_action(ClickAction::new("https://example.com/statushub"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let identity = std::env::var("STATUSHUB_EXTENSION").unwrap_or_default();
    eprintln!("example extension started as {}", identity);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0u64;

    while let Some(line) = lines.next_line().await? {
        let operation: Operation = match serde_json::from_str(&line) {
            Ok(op) => op,
            Err(e) => {
                eprintln!("ignoring '{}': {}", line, e);
                continue;
            }
        };

        let reason = match operation {
            Operation::Initialize { reconnect } => {
                if !reconnect {
                    if let Ok(path) = std::env::var("EXAMPLE_WATCH") {
                        emit(&ExtensionMessage::Watch { uris: vec![path] })?;
                    }
                    emit(&ExtensionMessage::ScreenOn { enabled: true })?;
                }
                Reason::Initial
            }
            Operation::Refresh { reason } => reason,
        };

        count += 1;
        emit(&ExtensionMessage::Publish {
            payload: Some(status(count, reason)),
        })?;
    }
    Ok(())
}
