//! Pure routing over the run state: given the node that just ran, pick the
//! next one. No side effects; the retry/escalation policy lives entirely in
//! this table so it can be tested exhaustively.

use crate::state::RunState;
use crate::types::ExecutorType;

/// The nodes of the agent graph. Capture appears twice on purpose: the
/// micro planner and the reviewer both need an equally fresh observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    MacroPlanner,
    CaptureForMicro,
    MicroPlanner,
    Executor,
    CaptureForReview,
    Reviewer,
    HumanGateway,
}

impl NodeId {
    pub fn name(self) -> &'static str {
        match self {
            NodeId::MacroPlanner => "macro_planner",
            NodeId::CaptureForMicro => "capture_screen_pre_micro",
            NodeId::MicroPlanner => "micro_planner",
            NodeId::Executor => "executor",
            NodeId::CaptureForReview => "capture_screen_pre_review",
            NodeId::Reviewer => "reviewer",
            NodeId::HumanGateway => "human_gateway",
        }
    }
}

/// The transition table: node that just ran x run state -> next node.
/// `None` ends the run.
pub fn next_node(after: NodeId, state: &RunState) -> Option<NodeId> {
    match after {
        NodeId::MacroPlanner => route_after_macro(state),
        NodeId::CaptureForMicro => Some(NodeId::MicroPlanner),
        NodeId::MicroPlanner => Some(route_after_micro(state)),
        NodeId::Executor => Some(NodeId::CaptureForReview),
        NodeId::CaptureForReview => Some(NodeId::Reviewer),
        NodeId::Reviewer => Some(route_after_review(state)),
        NodeId::HumanGateway => None,
    }
}

fn route_after_macro(state: &RunState) -> Option<NodeId> {
    if state.is_complete {
        return None;
    }
    let Some(plan) = &state.macro_plan else {
        return None;
    };
    let Some(task) = plan.current_task() else {
        // Cursor past the end without the complete flag: stop rather
        // than run off the plan.
        return None;
    };
    if task.executor == ExecutorType::Human {
        return Some(NodeId::HumanGateway);
    }
    Some(NodeId::CaptureForMicro)
}

fn route_after_micro(state: &RunState) -> NodeId {
    match &state.micro_plan {
        Some(plan) if plan.is_exception => {
            // A replan trigger, subject to the strategic budget: endless
            // exceptional screens must still end at the operator.
            if state.macro_retry_count < state.limits.max_macro_retries {
                NodeId::MacroPlanner
            } else {
                NodeId::HumanGateway
            }
        }
        // A planner that proposes no actions gets no execution step;
        // judge the task as the screen stands. The executor is only ever
        // entered with at least one unexecuted action.
        Some(plan) if !plan.has_remaining_actions() => NodeId::CaptureForReview,
        _ => NodeId::Executor,
    }
}

fn route_after_review(state: &RunState) -> NodeId {
    let Some(review) = &state.last_review_result else {
        return NodeId::MacroPlanner;
    };

    if review.is_success {
        let remaining = state
            .micro_plan
            .as_ref()
            .is_some_and(|m| m.has_remaining_actions());
        if remaining {
            return NodeId::Executor;
        }
        return NodeId::MacroPlanner;
    }

    // Layered retry budget: tactical first, then strategic, then human.
    if state.micro_retry_count < state.limits.max_micro_retries {
        return NodeId::MicroPlanner;
    }
    if state.macro_retry_count < state.limits.max_macro_retries {
        return NodeId::MacroPlanner;
    }
    NodeId::HumanGateway
}
