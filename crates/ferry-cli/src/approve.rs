use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use ferry_common::{Error, Result};
use ferry_relay::Approver;

/// Asks on the terminal before an origin is added to the allow-list.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptApprover;

#[async_trait]
impl Approver for PromptApprover {
    async fn approve(&self, origin: &str) -> Result<bool> {
        let question = format!("Allow {origin} to receive transfers? [y/N] ");
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut stderr = io::stderr();
            write!(stderr, "{question}")?;
            stderr.flush()?;
            let mut answer = String::new();
            io::stdin().lock().read_line(&mut answer)?;
            Ok(parse_answer(&answer))
        })
        .await
        .map_err(|e| Error::internal(format!("approval prompt failed: {e}")))?
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
