//! webpilot — a browser agent that reaches a user-supplied goal by
//! planning coarse tasks, planning concrete actions per task, executing
//! one action at a time, and reviewing each outcome through layered retry
//! budgets (tactical action replans, strategic task replans, human
//! escalation).

pub mod brain;
pub mod dom;
pub mod graph;
pub mod hands;
pub mod nodes;
pub mod routing;
pub mod state;
pub mod types;

pub use brain::{Brain, BrainError, LlmBrain};
pub use graph::Graph;
pub use hands::{ChromeHands, Hands, HandsError};
pub use state::{Patch, RetryLimits, RunState, StateUpdate};
pub use types::*;
