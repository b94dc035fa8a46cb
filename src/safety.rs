use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use tracing::warn;

/// Decides whether a flagged action may run. Called once per pending check.
#[async_trait]
pub trait SafetyGate: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
}

#[async_trait]
impl<F> SafetyGate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    async fn confirm(&self, message: &str) -> bool {
        self(message)
    }
}

/// Acknowledges every check without asking.
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoAcknowledge;

#[async_trait]
impl SafetyGate for AutoAcknowledge {
    async fn confirm(&self, message: &str) -> bool {
        warn!("auto-acknowledging safety check: {}", message);
        true
    }
}

/// Interactive y/n prompt on the terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleGate;

#[async_trait]
impl SafetyGate for ConsoleGate {
    async fn confirm(&self, message: &str) -> bool {
        let message = message.to_string();
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stdout = io::stdout();
            write!(
                stdout,
                "Safety Check Warning: {message}\nDo you want to acknowledge and proceed? (y/n): "
            )?;
            stdout.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => is_yes(&line),
            Ok(Err(e)) => {
                warn!("safety prompt failed: {}", e);
                false
            }
            Err(e) => {
                warn!("safety prompt task failed: {}", e);
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_are_gates() {
        let deny_deletes = |m: &str| !m.contains("delete");
        assert!(deny_deletes.confirm("open a tab").await);
        assert!(!deny_deletes.confirm("This will delete files").await);
    }

    #[test]
    fn only_y_acknowledges() {
        assert!(is_yes("y\n"));
        assert!(is_yes("  Y "));
        assert!(!is_yes("yes"));
        assert!(!is_yes(""));
    }
}
