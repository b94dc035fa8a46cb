use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::computer::{Computer, ComputerError, ScopedComputer};
use crate::cua::Model;
use crate::items::{Conversation, Item};
use crate::safety::SafetyGate;
use crate::turn::{RejectionPolicy, TurnExecutor, TurnReport};

// ========================= Core Types =========================

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("environment could not be acquired: {0}")]
    Provisioning(ComputerError),
    #[error("model error: {0}")]
    Model(String),
    #[error("input error: {0}")]
    Input(String),
    #[error("environment release failed: {0}")]
    Teardown(ComputerError),
}

#[derive(Clone, Debug, Default)]
pub struct AgentConfig {
    /// Cap on model rounds run without new user input. `None` keeps going
    /// for as long as the model proposes actions.
    pub max_rounds: Option<usize>,
    pub rejection_policy: RejectionPolicy,
}

/// Source of human turns. `None` ends the session.
#[async_trait]
pub trait UserInput: Send {
    async fn next_input(&mut self) -> anyhow::Result<Option<String>>;
}

#[async_trait]
impl UserInput for VecDeque<String> {
    async fn next_input(&mut self) -> anyhow::Result<Option<String>> {
        Ok(self.pop_front())
    }
}

/// Reads turns from stdin. EOF or `exit` ends the session.
#[derive(Clone, Debug, Default)]
pub struct ConsoleInput {
    initial: Option<String>,
}

impl ConsoleInput {
    /// `initial` is used for the first turn instead of prompting.
    pub fn new(initial: Option<String>) -> Self {
        Self { initial: initial.filter(|s| !s.trim().is_empty()) }
    }
}

#[async_trait]
impl UserInput for ConsoleInput {
    async fn next_input(&mut self) -> anyhow::Result<Option<String>> {
        if let Some(first) = self.initial.take() {
            return Ok(Some(first));
        }
        let line = tokio::task::spawn_blocking(|| -> io::Result<Option<String>> {
            let mut stdout = io::stdout();
            write!(stdout, "> ")?;
            stdout.flush()?;
            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line)? == 0 {
                return Ok(None);
            }
            Ok(Some(line))
        })
        .await??;
        Ok(line.and_then(|l| end_of_session(&l)))
    }
}

fn end_of_session(line: &str) -> Option<String> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("exit") {
        None
    } else {
        Some(line.to_string())
    }
}

// ========================= Agent Core =========================

pub struct Agent<M: Model> {
    model: M,
    executor: TurnExecutor,
    cfg: AgentConfig,
}

impl<M: Model> Agent<M> {
    pub fn new(model: M, gate: Arc<dyn SafetyGate>, cfg: AgentConfig) -> Self {
        let executor = TurnExecutor::new(gate).with_policy(cfg.rejection_policy);
        Self { model, executor, cfg }
    }

    /// Share a token that stops pending waits and autonomous rounds.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(token);
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.executor.cancellation().clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Query the model and execute what it proposes until a response carries
    /// no action that got past the safety gate.
    pub async fn run_full_turn(
        &self,
        computer: &mut dyn Computer,
        conversation: &mut Conversation,
    ) -> Result<TurnReport, AgentError> {
        let mut total = TurnReport::default();
        let mut round = 0usize;
        loop {
            round += 1;
            let env = computer.descriptor().clone();
            info!(round, items = conversation.len(), backend = %env.kind, "querying model");
            let proposed = self
                .model
                .respond(&env, conversation.items())
                .await
                .map_err(|e| AgentError::Model(format!("{e:#}")))?;

            let report = self.executor.execute(computer, proposed, conversation).await;
            total.absorb(&report);
            info!(
                round,
                executed = report.executed,
                failed = report.failed,
                unsupported = report.unsupported,
                rejected = report.rejected,
                "round finished"
            );

            if report.attempted() == 0 {
                break;
            }
            if report.cancelled || self.executor.cancellation().is_cancelled() {
                warn!(round, "cancelled; handing control back");
                break;
            }
            if self.cfg.max_rounds.is_some_and(|max| round >= max) {
                warn!(round, "round limit reached; handing control back");
                break;
            }
        }
        Ok(total)
    }

    /// Alternate between user turns and model rounds until input runs out.
    pub async fn run(
        &self,
        computer: &mut dyn Computer,
        input: &mut dyn UserInput,
        conversation: &mut Conversation,
    ) -> Result<(), AgentError> {
        while let Some(text) = input
            .next_input()
            .await
            .map_err(|e| AgentError::Input(format!("{e:#}")))?
        {
            if text.trim().is_empty() {
                continue;
            }
            conversation.push(Item::user(text));
            self.run_full_turn(computer, conversation).await?;
            if self.executor.cancellation().is_cancelled() {
                break;
            }
        }
        info!(items = conversation.len(), "session ended");
        Ok(())
    }

    /// Acquire the environment, run the session and release it on every path.
    pub async fn run_session(
        &self,
        computer: Box<dyn Computer>,
        input: &mut dyn UserInput,
    ) -> Result<Conversation, AgentError> {
        let mut scope = ScopedComputer::acquire(computer).await.map_err(AgentError::Provisioning)?;
        let mut conversation = Conversation::new();
        let outcome = self.run(scope.computer(), input, &mut conversation).await;
        let released = scope.release().await;
        match (outcome, released) {
            (Err(e), Err(teardown)) => {
                warn!("release after failed session: {}", teardown);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(teardown)) => Err(AgentError::Teardown(teardown)),
            (Ok(()), Ok(())) => Ok(conversation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::{Action, CallOutcome, PendingSafetyCheck};
    use crate::safety::AutoAcknowledge;
    use crate::testing::{call, message, Call, FakeComputer, ScriptedModel};

    fn agent(model: ScriptedModel) -> Agent<ScriptedModel> {
        Agent::new(model, Arc::new(AutoAcknowledge), AgentConfig::default())
    }

    fn inputs(lines: &[&str]) -> VecDeque<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn keeps_querying_while_actions_run() {
        let model = ScriptedModel::new(vec![
            vec![call("c1", Action::Click { x: 5, y: 5, button: Default::default() })],
            vec![call("c2", Action::Type { text: "hi".into() })],
            vec![message("finished")],
        ]);
        let agent = agent(model);
        let mut computer = FakeComputer::new();
        let mut conversation = Conversation::new();
        conversation.push(Item::user("go"));

        let report = agent.run_full_turn(&mut computer, &mut conversation).await.unwrap();

        assert_eq!(report.executed, 2);
        // user, then call+output per round, then the closing message
        assert_eq!(agent.model().seen(), vec![1, 3, 5]);
        assert_eq!(conversation.len(), 6);
    }

    #[tokio::test]
    async fn text_only_response_returns_control() {
        let agent = agent(ScriptedModel::new(vec![vec![message("what next?")]]));
        let mut computer = FakeComputer::new();
        let mut conversation = Conversation::new();
        conversation.push(Item::user("hello"));

        let report = agent.run_full_turn(&mut computer, &mut conversation).await.unwrap();

        assert_eq!(report.attempted(), 0);
        assert_eq!(agent.model().seen(), vec![1]);
        assert!(computer.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_batch_waits_for_the_user() {
        let flagged = Item::ComputerCall {
            id: None,
            call_id: "c1".into(),
            action: Action::Keypress { keys: vec!["CTRL".into(), "A".into()] },
            pending_safety_checks: vec![PendingSafetyCheck {
                id: "sc1".into(),
                code: None,
                message: "This will delete files".into(),
            }],
        };
        let model = ScriptedModel::new(vec![vec![flagged], vec![message("ok, stopping")]]);
        let deny: Arc<dyn SafetyGate> = Arc::new(|_: &str| false);
        let agent = Agent::new(model, deny, AgentConfig::default());
        let mut computer = FakeComputer::new();
        let mut conversation = Conversation::new();
        let mut input = inputs(&["clean up", "never mind"]);

        agent.run(&mut computer, &mut input, &mut conversation).await.unwrap();

        // one model call per user turn, none autonomous
        assert_eq!(agent.model().seen(), vec![1, 4]);
        assert!(computer.calls().is_empty());
        assert!(conversation.items().iter().any(|i| matches!(
            i,
            Item::ComputerCallOutput { outcome: CallOutcome::Rejected { .. }, .. }
        )));
    }

    #[tokio::test]
    async fn failed_action_still_continues() {
        let model = ScriptedModel::new(vec![
            vec![call("c1", Action::Click { x: 1, y: 1, button: Default::default() })],
            vec![message("the click failed, giving up")],
        ]);
        let agent = agent(model);
        let mut computer = FakeComputer::new().failing_on("click");
        let mut conversation = Conversation::new();
        conversation.push(Item::user("click it"));

        let report = agent.run_full_turn(&mut computer, &mut conversation).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(agent.model().seen().len(), 2);
    }

    #[tokio::test]
    async fn round_limit_stops_autonomy() {
        let model = ScriptedModel::new(vec![
            vec![call("c1", Action::Screenshot)],
            vec![call("c2", Action::Screenshot)],
            vec![call("c3", Action::Screenshot)],
        ]);
        let cfg = AgentConfig { max_rounds: Some(2), ..Default::default() };
        let agent = Agent::new(model, Arc::new(AutoAcknowledge), cfg);
        let mut computer = FakeComputer::new();
        let mut conversation = Conversation::new();
        conversation.push(Item::user("look"));

        let report = agent.run_full_turn(&mut computer, &mut conversation).await.unwrap();

        assert_eq!(report.executed, 2);
        assert_eq!(agent.model().seen().len(), 2);
    }

    #[tokio::test]
    async fn session_releases_after_input_runs_out() {
        let agent = agent(ScriptedModel::new(vec![]));
        let computer = FakeComputer::new();
        let log = computer.log();
        let mut input = inputs(&["hi", "  ", "bye"]);

        let conversation = agent.run_session(Box::new(computer), &mut input).await.unwrap();

        assert_eq!(agent.model().seen(), vec![1, 3]);
        assert_eq!(conversation.len(), 4);
        let calls = log.lock().unwrap().clone();
        assert_eq!(calls.first(), Some(&Call::Acquire));
        assert_eq!(calls.last(), Some(&Call::Release));
    }

    #[tokio::test]
    async fn failed_acquire_is_released_and_reported() {
        let agent = agent(ScriptedModel::new(vec![]));
        let computer = FakeComputer::new().failing_acquire();
        let log = computer.log();

        let err = agent.run_session(Box::new(computer), &mut inputs(&["hi"])).await.unwrap_err();

        assert!(matches!(err, AgentError::Provisioning(ComputerError::Provisioning(_))));
        assert_eq!(*log.lock().unwrap(), vec![Call::Acquire, Call::Release]);
        assert!(agent.model().seen().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_ends_the_session() {
        let token = CancellationToken::new();
        let model = ScriptedModel::new(vec![vec![call("c1", Action::Wait { ms: 5 })]]);
        let agent = agent(model).with_cancellation(token.clone());
        token.cancel();
        let mut computer = FakeComputer::new();
        let mut conversation = Conversation::new();

        agent.run(&mut computer, &mut inputs(&["wait", "more"]), &mut conversation).await.unwrap();

        assert_eq!(agent.model().seen(), vec![1]);
        assert!(computer.calls().is_empty());
    }

    #[test]
    fn exit_ends_console_sessions() {
        assert_eq!(end_of_session(" Exit \n"), None);
        assert_eq!(end_of_session("open bing\n"), Some("open bing".into()));
    }

    #[tokio::test]
    async fn console_input_uses_initial_turn_first() {
        let mut input = ConsoleInput::new(Some("search for rust".into()));
        assert_eq!(input.next_input().await.unwrap(), Some("search for rust".into()));
    }
}
