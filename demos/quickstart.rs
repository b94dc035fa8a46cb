use anyhow::Result;
use cua_loop::{
    build_computer, Agent, AgentConfig, ConsoleGate, ConsoleInput, ResponsesConfig,
    ResponsesModel, SessionConfig,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // CUA_COMPUTER picks the backend; see SessionConfig for the rest.
    let session = SessionConfig::default();
    let computer = build_computer(&session)?;
    let model = ResponsesModel::new(ResponsesConfig::default())?;
    let agent = Agent::new(model, Arc::new(ConsoleGate), AgentConfig::default());

    let cancel = agent.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // An argument is used as the first turn instead of prompting.
    let initial = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let mut input = ConsoleInput::new(Some(initial));
    let conversation = agent.run_session(computer, &mut input).await?;
    tracing::info!(items = conversation.len(), computer = %session.computer, "done");
    Ok(())
}
