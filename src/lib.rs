pub mod agent;
pub mod computer;
pub mod computers;
pub mod config;
pub mod cua;
pub mod items;
pub mod safety;
pub mod turn;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentConfig, AgentError, ConsoleInput, UserInput};
pub use computer::{
    Computer, ComputerError, EnvironmentDescriptor, EnvironmentKind, LifecycleState,
    ScopedComputer, ScrollCapability,
};
pub use config::{build_computer, ComputerChoice, SessionConfig};
pub use cua::{Model, ResponsesConfig, ResponsesModel};
pub use items::{Action, CallOutcome, Conversation, Item, MouseButton, PendingSafetyCheck, Point};
pub use safety::{AutoAcknowledge, ConsoleGate, SafetyGate};
pub use turn::{RejectionPolicy, TurnExecutor, TurnReport};
