//! The graph driver: wires nodes and routing into one sequential loop and
//! runs it until the state goes terminal.

use anyhow::Result;

use crate::brain::Brain;
use crate::hands::Hands;
use crate::nodes;
use crate::routing::{self, NodeId};
use crate::state::RunState;

/// Hard ceiling on node transitions per run. A healthy run never gets
/// close; hitting it means a routing bug, and a loud error beats a spin.
pub const MAX_TRANSITIONS: usize = 256;

/// The assembled control-flow graph. Owns nothing but references to the
/// two collaborators; the run state stays with the caller.
pub struct Graph<'a> {
    brain: &'a dyn Brain,
    hands: &'a dyn Hands,
}

impl<'a> Graph<'a> {
    pub fn new(brain: &'a dyn Brain, hands: &'a dyn Hands) -> Self {
        Self { brain, hands }
    }

    /// Advance the graph one node at a time until a terminal state
    /// (`is_complete` or `needs_human_intervention`) or a routing dead
    /// end. Strictly sequential: never two nodes in flight for one run.
    pub async fn run(&self, state: &mut RunState) -> Result<()> {
        let mut current = NodeId::MacroPlanner;

        for _ in 0..MAX_TRANSITIONS {
            let update = match current {
                NodeId::MacroPlanner => nodes::macro_planner(state, self.brain).await?,
                NodeId::CaptureForMicro | NodeId::CaptureForReview => {
                    nodes::capture_screen(self.hands).await?
                }
                NodeId::MicroPlanner => nodes::micro_planner(state, self.brain).await,
                NodeId::Executor => nodes::executor(state, self.hands).await,
                NodeId::Reviewer => nodes::reviewer(state, self.brain, self.hands).await,
                NodeId::HumanGateway => nodes::human_gateway(state),
            };

            println!("[{}] {}", current.name(), update.summary());
            tracing::debug!(node = current.name(), ?update, "node finished");
            state.apply(update);

            match routing::next_node(current, state) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }

        anyhow::bail!(
            "run exceeded {MAX_TRANSITIONS} node transitions without reaching a terminal state"
        )
    }
}
