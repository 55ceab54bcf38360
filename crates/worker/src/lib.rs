pub mod components;
pub mod executors;
pub mod game;
pub mod service;


#[cfg(test)]
mod service_test;

pub use components::{ExecutionPool, Heartbeat, HeartbeatManager, SlotContext};
pub use executors::{HandlerRegistry, TaskHandler, TranscriptionHandler};
pub use game::{GameState, ScenarioHandler, SnakeMoveHandler};
pub use service::{ControlStep, WorkerService, WorkerServiceBuilder};
