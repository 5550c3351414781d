//! Produce-action adapter.
//!
//! Reads one JSON parameter object per stdin line and prints one JSON
//! result per line, so the action platform's invoker (or a shell) can drive
//! it directly. The producer cache lives for the life of the process, which
//! is what makes repeated invocations cheap.

use feedbridge::{ProduceAction, Settings};
use std::io::{self, BufRead, Write};

#[tokio::main]
async fn main() -> io::Result<()> {
    let action = ProduceAction::new(Settings::from_env());

    let stdin = io::stdin();
    let stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let result = match serde_json::from_str(&line) {
            Ok(params) => action.run(params).await,
            Err(err) => serde_json::json!({ "error": format!("invalid parameters: {err}") }),
        };

        let mut out = stdout.lock();
        writeln!(out, "{result}")?;
        out.flush()?;
    }

    Ok(())
}
