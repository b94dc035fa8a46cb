use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::computer::{perform, Computer, ComputerError};
use crate::items::{Action, CallOutcome, Conversation, Item, Observation, PendingSafetyCheck};
use crate::safety::SafetyGate;

/// What happens to the rest of a batch after the gate vetoes one action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Every later action in the batch is recorded as rejected without running.
    #[default]
    AbortBatch,
    /// Only the vetoed action is skipped.
    SkipAction,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TurnReport {
    pub executed: usize,
    pub failed: usize,
    pub unsupported: usize,
    pub rejected: usize,
    pub observations: usize,
    pub cancelled: bool,
}

impl TurnReport {
    /// Actions that got past the safety gate, whatever their result.
    pub fn attempted(&self) -> usize {
        self.executed + self.failed + self.unsupported
    }

    pub fn absorb(&mut self, other: &TurnReport) {
        self.executed += other.executed;
        self.failed += other.failed;
        self.unsupported += other.unsupported;
        self.rejected += other.rejected;
        self.observations += other.observations;
        self.cancelled |= other.cancelled;
    }
}

pub struct TurnExecutor {
    gate: Arc<dyn SafetyGate>,
    policy: RejectionPolicy,
    cancel: CancellationToken,
}

impl TurnExecutor {
    pub fn new(gate: Arc<dyn SafetyGate>) -> Self {
        Self { gate, policy: RejectionPolicy::default(), cancel: CancellationToken::new() }
    }

    pub fn with_policy(mut self, policy: RejectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one model response against the computer, appending every proposed
    /// item and its result to the conversation in order.
    pub async fn execute(
        &self,
        computer: &mut dyn Computer,
        proposed: Vec<Item>,
        conversation: &mut Conversation,
    ) -> TurnReport {
        let mut report = TurnReport::default();
        let mut batch_vetoed = false;

        for item in proposed {
            let Item::ComputerCall { call_id, action, pending_safety_checks, .. } = &item else {
                if let Item::Message { text, .. } = &item {
                    info!("assistant: {}", text.trim());
                }
                conversation.push(item);
                continue;
            };
            let call_id = call_id.clone();
            let action = action.clone();
            let checks = pending_safety_checks.clone();
            conversation.push(item);

            if batch_vetoed {
                report.rejected += 1;
                conversation.push(rejected(call_id, "not executed: an earlier action in this batch was rejected"));
                continue;
            }

            if let Some(check) = self.first_declined(&checks).await {
                warn!(call_id = %call_id, action = action.kind(), "safety check declined: {}", check.message);
                report.rejected += 1;
                conversation.push(rejected(call_id, &format!("rejected by user: {}", check.message)));
                batch_vetoed = self.policy == RejectionPolicy::AbortBatch;
                continue;
            }

            match self.run_action(computer, &action).await {
                Ok(obs) => {
                    report.executed += 1;
                    report.observations += 1;
                    debug!(call_id = %call_id, action = action.kind(), url = %obs.location, "action observed");
                    conversation.push(Item::ComputerCallOutput {
                        call_id,
                        acknowledged_safety_checks: checks,
                        outcome: CallOutcome::Observed {
                            screenshot_base64: B64.encode(&obs.screenshot),
                            current_url: obs.location,
                        },
                    });
                }
                Err(err) => {
                    match err {
                        ComputerError::Unsupported { .. } => report.unsupported += 1,
                        ComputerError::Cancelled => {
                            report.failed += 1;
                            report.cancelled = true;
                        }
                        _ => report.failed += 1,
                    }
                    warn!(call_id = %call_id, action = action.kind(), "action failed: {}", err);
                    conversation.push(Item::ComputerCallOutput {
                        call_id,
                        acknowledged_safety_checks: checks,
                        outcome: CallOutcome::Failed { error: err.to_string() },
                    });
                }
            }
        }
        report
    }

    async fn first_declined<'a>(&self, checks: &'a [PendingSafetyCheck]) -> Option<&'a PendingSafetyCheck> {
        for check in checks {
            if !self.gate.confirm(&check.message).await {
                return Some(check);
            }
        }
        None
    }

    async fn run_action(
        &self,
        computer: &mut dyn Computer,
        action: &Action,
    ) -> Result<Observation, ComputerError> {
        if self.cancel.is_cancelled() {
            return Err(ComputerError::Cancelled);
        }
        info!(action = action.kind(), backend = %computer.descriptor().kind, "executing");
        match action {
            Action::Wait { .. } => {
                tokio::select! {
                    res = perform(computer, action) => res?,
                    _ = self.cancel.cancelled() => return Err(ComputerError::Cancelled),
                }
            }
            _ => perform(computer, action).await?,
        }
        let screenshot = computer.screenshot().await?;
        let location = computer
            .current_location()
            .await
            .map_err(|e| ComputerError::Capture(e.to_string()))?;
        Ok(Observation { screenshot, location })
    }
}

fn rejected(call_id: String, message: &str) -> Item {
    Item::ComputerCallOutput {
        call_id,
        acknowledged_safety_checks: vec![],
        outcome: CallOutcome::Rejected { message: message.to_string() },
    }
}
