pub mod error;
pub mod runtime;
pub mod spawner;

pub use error::SpawnerError;
pub use runtime::{AgentRuntime, StubRuntime, ToolCall, TurnOutcome, TurnRequest};
pub use spawner::Spawner;
