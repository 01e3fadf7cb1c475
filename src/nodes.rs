//! The discrete processing steps of the agent graph. Each node reads the
//! run state and returns a partial update; only the driver merges updates
//! back in. Planning and capture failures are fatal for the run, every
//! other collaborator failure is converted into a result value and fed to
//! the retry policy.

use anyhow::{Context, Result};

use crate::brain::Brain;
use crate::hands::Hands;
use crate::state::{Patch, RunState, StateUpdate};
use crate::types::{
    ExecutionResult, MacroPlan, MacroTask, MicroPlan, ReviewResult, TaskStatus,
};

/// Macro-plan node: initial plan, advance after a successful review, or
/// replan after a failure. Owns every MacroTask status transition.
pub async fn macro_planner(state: &RunState, brain: &dyn Brain) -> Result<StateUpdate> {
    let Some(plan) = &state.macro_plan else {
        let mut new_plan = brain
            .plan(&state.user_command, "")
            .await
            .context("initial macro planning failed")?;
        if let Some(first) = new_plan.tasks.first_mut() {
            first.status = TaskStatus::Running;
        }
        tracing::info!(tasks = new_plan.tasks.len(), "macro plan created");
        return Ok(StateUpdate {
            macro_plan: Patch::Set(new_plan),
            micro_retry_count: Some(0),
            ..Default::default()
        });
    };

    // An exceptional micro plan re-enters here as a replan trigger even if
    // a stale successful review is still in the state.
    let exceptional_micro = state.micro_plan.as_ref().is_some_and(|m| m.is_exception);
    let advance = !exceptional_micro
        && state
            .last_review_result
            .as_ref()
            .is_some_and(|r| r.is_success);

    if advance {
        return Ok(advance_plan(plan));
    }

    let progress = replan_context(state, plan);
    let mut revised = brain
        .plan(&plan.anchor, &progress)
        .await
        .context("macro replanning failed")?;
    revised.replan_count = plan.replan_count + 1;
    if let Some(first) = revised.tasks.first_mut() {
        first.status = TaskStatus::Running;
    }
    tracing::info!(
        replans = revised.replan_count,
        tasks = revised.tasks.len(),
        "macro plan revised"
    );
    Ok(StateUpdate {
        macro_plan: Patch::Set(revised),
        micro_plan: Patch::Clear,
        micro_retry_count: Some(0),
        macro_retry_count: Some(state.macro_retry_count + 1),
        ..Default::default()
    })
}

/// Mark the current task done and move the cursor. Completing the last
/// task terminates the run.
fn advance_plan(plan: &MacroPlan) -> StateUpdate {
    let mut tasks = plan.tasks.clone();
    if let Some(task) = tasks.get_mut(plan.current_task_index) {
        task.status = TaskStatus::Exit;
    }
    let next = plan.current_task_index + 1;
    debug_assert!(next <= tasks.len(), "task cursor out of bounds");

    if next >= tasks.len() {
        let updated = MacroPlan {
            anchor: plan.anchor.clone(),
            tasks,
            current_task_index: next,
            replan_count: plan.replan_count,
        };
        return StateUpdate {
            macro_plan: Patch::Set(updated),
            is_complete: true,
            ..Default::default()
        };
    }

    tasks[next].status = TaskStatus::Running;
    let updated = MacroPlan {
        anchor: plan.anchor.clone(),
        tasks,
        current_task_index: next,
        replan_count: plan.replan_count,
    };
    // Forward progress: both retry tiers start fresh for the new task.
    StateUpdate {
        macro_plan: Patch::Set(updated),
        micro_plan: Patch::Clear,
        micro_retry_count: Some(0),
        macro_retry_count: Some(0),
        ..Default::default()
    }
}

/// Summarize the run so far for a replanning request.
fn replan_context(state: &RunState, plan: &MacroPlan) -> String {
    let mut lines = Vec::new();
    for task in &plan.tasks {
        match task.status {
            TaskStatus::Exit => lines.push(format!("- done: {}", task.description)),
            TaskStatus::Running => lines.push(format!("- failed: {}", task.description)),
            _ => {}
        }
    }
    if let Some(review) = &state.last_review_result {
        if !review.is_success && !review.rationale.is_empty() {
            lines.push(format!("Last review: {}", review.rationale));
        }
    }
    if let Some(micro) = &state.micro_plan {
        if micro.is_exception {
            lines.push(format!("Unexpected page state: {}", micro.exception_reason));
        }
    }
    lines.join("\n")
}

/// Screen-capture node. Registered twice in the graph (pre-micro and
/// pre-review); both consumers need an equally fresh observation.
pub async fn capture_screen(hands: &dyn Hands) -> Result<StateUpdate> {
    let screen = hands.capture().await.context("screen capture failed")?;
    Ok(StateUpdate {
        current_screen: Some(screen),
        ..Default::default()
    })
}

/// Micro-plan node: current task + current screen -> ordered action list.
/// Collaborator errors and missing preconditions become exceptional plans
/// instead of run failures.
pub async fn micro_planner(state: &RunState, brain: &dyn Brain) -> StateUpdate {
    // A still-present micro plan plus a failed review means this is a
    // tactical retry on the same task.
    let retried = state.micro_plan.is_some()
        && state
            .last_review_result
            .as_ref()
            .is_some_and(|r| !r.is_success);

    let plan = propose_actions(state, brain).await;
    if plan.is_exception {
        tracing::warn!(reason = %plan.exception_reason, "micro planning raised an exception");
    }

    StateUpdate {
        micro_plan: Patch::Set(plan),
        micro_retry_count: retried.then(|| state.micro_retry_count + 1),
        ..Default::default()
    }
}

async fn propose_actions(state: &RunState, brain: &dyn Brain) -> MicroPlan {
    let Some(macro_plan) = &state.macro_plan else {
        return MicroPlan::exceptional(-1, "no macro plan");
    };
    let Some(task) = macro_plan.current_task() else {
        return MicroPlan::exceptional(-1, "task cursor past end of plan");
    };
    let Some(screen) = &state.current_screen else {
        return MicroPlan::exceptional(task.id, "no screen captured");
    };

    match brain
        .decide_actions(task, screen, &state.execution_history)
        .await
    {
        Ok(plan) => plan,
        Err(e) => MicroPlan::exceptional(task.id, format!("action planning failed: {e}")),
    }
}

/// Execution node: run exactly one action, append the result, advance the
/// action cursor. Never decides retry policy.
pub async fn executor(state: &RunState, hands: &dyn Hands) -> StateUpdate {
    let Some(plan) = &state.micro_plan else {
        let result = ExecutionResult::failed("no micro plan");
        return StateUpdate {
            last_execution_result: Some(result.clone()),
            append_executions: vec![result],
            ..Default::default()
        };
    };

    let Some(action) = plan.current_action() else {
        debug_assert!(false, "executor entered with an exhausted micro plan");
        let result = ExecutionResult::failed("action cursor past end of micro plan");
        return StateUpdate {
            last_execution_result: Some(result.clone()),
            append_executions: vec![result],
            ..Default::default()
        };
    };

    tracing::info!(
        action = ?action.action_type,
        description = %action.description,
        "executing action"
    );
    let result = hands.execute(action).await;

    let mut advanced = plan.clone();
    advanced.current_action_index += 1;

    StateUpdate {
        micro_plan: Patch::Set(advanced),
        last_execution_result: Some(result.clone()),
        append_executions: vec![result],
        ..Default::default()
    }
}

/// Reviewer node: judge the current task's expected outcome against the
/// freshly captured screen. Classifies only; never plans.
///
/// Mid-plan (actions remain and the last execution was clean) the node
/// records a progress check in `last_review_result` without appending to
/// the review history; the history holds task-level verdicts only.
pub async fn reviewer(state: &RunState, brain: &dyn Brain, hands: &dyn Hands) -> StateUpdate {
    let task = match state.macro_plan.as_ref().and_then(|p| p.current_task()) {
        Some(task) => task,
        None => {
            let review = ReviewResult::failure("no active macro task to review against", "");
            return StateUpdate {
                last_review_result: Some(review.clone()),
                append_reviews: vec![review],
                ..Default::default()
            };
        }
    };

    let mid_plan = state
        .micro_plan
        .as_ref()
        .is_some_and(|m| m.has_remaining_actions())
        && state
            .last_execution_result
            .as_ref()
            .is_some_and(|r| r.success);

    if mid_plan {
        let remaining = state
            .micro_plan
            .as_ref()
            .map(|m| m.actions.len() - m.current_action_index)
            .unwrap_or(0);
        let review = ReviewResult::success(
            format!("action succeeded, {remaining} actions remaining"),
            &task.expected_outcome.description,
        )
        .with_observed(state.current_screen.clone());
        return StateUpdate {
            last_review_result: Some(review),
            ..Default::default()
        };
    }

    let review = judge_task(task, state, brain, hands).await;
    tracing::info!(success = review.is_success, rationale = %review.rationale, "task reviewed");
    StateUpdate {
        last_review_result: Some(review.clone()),
        append_reviews: vec![review],
        ..Default::default()
    }
}

/// Task-level verdict: structural checks first, planner judgment when no
/// structural check applies. Collaborator errors become failing reviews.
async fn judge_task(
    task: &MacroTask,
    state: &RunState,
    brain: &dyn Brain,
    hands: &dyn Hands,
) -> ReviewResult {
    let criteria = &task.expected_outcome;
    let Some(screen) = &state.current_screen else {
        return ReviewResult::failure("no screen captured to review", &criteria.description);
    };

    if criteria.has_structural_checks() {
        if let Some(fragment) = &criteria.url_contains {
            if !screen.url.contains(fragment.as_str()) {
                return ReviewResult::failure(
                    format!("url '{}' does not contain '{}'", screen.url, fragment),
                    &criteria.description,
                )
                .with_observed(Some(screen.clone()));
            }
        }
        if let Some(text) = &criteria.text_visible {
            match hands.check_text_visible(text).await {
                Ok(true) => {}
                Ok(false) => {
                    return ReviewResult::failure(
                        format!("required text '{text}' is not visible"),
                        &criteria.description,
                    )
                    .with_observed(Some(screen.clone()));
                }
                Err(e) => {
                    return ReviewResult::failure(
                        format!("visibility check failed: {e}"),
                        &criteria.description,
                    );
                }
            }
        }
        return ReviewResult::success("structural checks passed", &criteria.description)
            .with_observed(Some(screen.clone()));
    }

    match brain.evaluate(criteria, screen).await {
        Ok(review) => review,
        Err(e) => ReviewResult::failure(
            format!("review judgment failed: {e}"),
            &criteria.description,
        ),
    }
}

/// Human-gateway node: terminal. Reached for HUMAN-executor tasks and for
/// exhausted retry budgets.
pub fn human_gateway(state: &RunState) -> StateUpdate {
    let reason = escalation_reason(state);
    tracing::warn!(%reason, "escalating to human operator");

    StateUpdate {
        needs_human_intervention: true,
        ..Default::default()
    }
}

fn escalation_reason(state: &RunState) -> String {
    if let Some(task) = state
        .macro_plan
        .as_ref()
        .and_then(|p| p.current_task())
        .filter(|t| t.executor == crate::types::ExecutorType::Human)
    {
        return format!("task '{}' is assigned to a human", task.description);
    }
    if let Some(micro) = state.micro_plan.as_ref().filter(|m| m.is_exception) {
        return format!(
            "retry budgets exhausted; page blocked: {}",
            micro.exception_reason
        );
    }
    "retry budgets exhausted".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RetryLimits;
    use crate::types::{
        ActionType, DomElement, ExecutorType, MicroAction, ScreenState, SuccessCriteria,
    };
    use async_trait::async_trait;
    use crate::brain::BrainError;
    use crate::hands::HandsError;

    struct StubBrain {
        tasks: Vec<MacroTask>,
        actions: Vec<MicroAction>,
        verdict: bool,
    }

    impl StubBrain {
        fn with_tasks(tasks: Vec<MacroTask>) -> Self {
            Self {
                tasks,
                actions: Vec::new(),
                verdict: true,
            }
        }
    }

    #[async_trait]
    impl Brain for StubBrain {
        async fn plan(&self, goal: &str, _progress: &str) -> Result<MacroPlan, BrainError> {
            Ok(MacroPlan::new(goal, self.tasks.clone()))
        }

        async fn decide_actions(
            &self,
            task: &MacroTask,
            _screen: &ScreenState,
            _history: &[crate::types::ExecutionResult],
        ) -> Result<MicroPlan, BrainError> {
            Ok(MicroPlan::new(task.id, self.actions.clone()))
        }

        async fn evaluate(
            &self,
            criteria: &SuccessCriteria,
            _screen: &ScreenState,
        ) -> Result<ReviewResult, BrainError> {
            Ok(if self.verdict {
                ReviewResult::success("looks done", &criteria.description)
            } else {
                ReviewResult::failure("not there yet", &criteria.description)
            })
        }
    }

    struct StubHands {
        text_visible: bool,
    }

    #[async_trait]
    impl Hands for StubHands {
        async fn capture(&self) -> Result<ScreenState, HandsError> {
            Ok(sample_screen())
        }

        async fn execute(&self, _action: &MicroAction) -> ExecutionResult {
            ExecutionResult::ok()
        }

        async fn check_text_visible(&self, _text: &str) -> Result<bool, HandsError> {
            Ok(self.text_visible)
        }

        async fn close(&self) {}
    }

    fn sample_screen() -> ScreenState {
        ScreenState {
            url: "https://example.com/search?q=cats".into(),
            title: "cats - Search".into(),
            elements: vec![DomElement {
                index: 0,
                tag: "input".into(),
                text: String::new(),
                attributes: vec![("type".into(), "text".into())],
                selector: "[data-eid=\"e0\"]".into(),
                is_visible: true,
                is_interactive: true,
            }],
            screenshot: None,
        }
    }

    fn agent_task(id: i64) -> MacroTask {
        MacroTask {
            id,
            description: format!("task {id}"),
            executor: ExecutorType::Agent,
            expected_outcome: SuccessCriteria::described("done"),
            status: TaskStatus::New,
        }
    }

    fn click_action() -> MicroAction {
        MicroAction {
            action_type: ActionType::Click,
            target_index: Some(0),
            value: None,
            description: "click".into(),
            expected_outcome: "clicked".into(),
        }
    }

    fn state_with_plan(tasks: Vec<MacroTask>) -> RunState {
        let mut state = RunState::new("find cats", RetryLimits::default());
        let mut plan = MacroPlan::new("find cats", tasks);
        if let Some(first) = plan.tasks.first_mut() {
            first.status = TaskStatus::Running;
        }
        state.macro_plan = Some(plan);
        state
    }

    #[tokio::test]
    async fn macro_planner_creates_initial_plan() {
        let state = RunState::new("find cats", RetryLimits::default());
        let brain = StubBrain::with_tasks(vec![agent_task(0), agent_task(1)]);

        let update = macro_planner(&state, &brain).await.unwrap();
        let Patch::Set(plan) = update.macro_plan else {
            panic!("expected a new macro plan");
        };
        assert_eq!(plan.current_task_index, 0);
        assert_eq!(plan.tasks[0].status, TaskStatus::Running);
        assert_eq!(plan.tasks[1].status, TaskStatus::New);
        assert_eq!(update.micro_retry_count, Some(0));
    }

    #[tokio::test]
    async fn macro_planner_advances_after_success() {
        let mut state = state_with_plan(vec![agent_task(0), agent_task(1)]);
        state.last_review_result = Some(ReviewResult::success("ok", "done"));
        state.micro_retry_count = 2;
        state.macro_retry_count = 1;
        let brain = StubBrain::with_tasks(Vec::new());

        let update = macro_planner(&state, &brain).await.unwrap();
        let Patch::Set(plan) = &update.macro_plan else {
            panic!("expected an advanced plan");
        };
        assert_eq!(plan.current_task_index, 1);
        assert_eq!(plan.tasks[0].status, TaskStatus::Exit);
        assert_eq!(plan.tasks[1].status, TaskStatus::Running);
        assert!(matches!(update.micro_plan, Patch::Clear));
        assert_eq!(update.micro_retry_count, Some(0));
        assert_eq!(update.macro_retry_count, Some(0));
        assert!(!update.is_complete);
    }

    #[tokio::test]
    async fn macro_planner_completes_on_last_task() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.last_review_result = Some(ReviewResult::success("ok", "done"));
        let brain = StubBrain::with_tasks(Vec::new());

        let update = macro_planner(&state, &brain).await.unwrap();
        assert!(update.is_complete);
        let Patch::Set(plan) = &update.macro_plan else {
            panic!("expected the exited plan");
        };
        assert_eq!(plan.current_task_index, 1);
        assert_eq!(plan.tasks[0].status, TaskStatus::Exit);
    }

    #[tokio::test]
    async fn macro_planner_replans_after_failure() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.last_review_result = Some(ReviewResult::failure("wrong page", "done"));
        state.micro_retry_count = 3;
        let brain = StubBrain::with_tasks(vec![agent_task(0)]);

        let update = macro_planner(&state, &brain).await.unwrap();
        let Patch::Set(plan) = &update.macro_plan else {
            panic!("expected a revised plan");
        };
        assert_eq!(plan.replan_count, 1);
        assert_eq!(plan.current_task_index, 0);
        assert_eq!(update.macro_retry_count, Some(1));
        assert_eq!(update.micro_retry_count, Some(0));
        assert!(matches!(update.micro_plan, Patch::Clear));
    }

    #[tokio::test]
    async fn exceptional_micro_plan_forces_replan_even_after_stale_success() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.last_review_result = Some(ReviewResult::success("stale", "done"));
        state.micro_plan = Some(MicroPlan::exceptional(0, "cookie banner"));
        let brain = StubBrain::with_tasks(vec![agent_task(0)]);

        let update = macro_planner(&state, &brain).await.unwrap();
        assert_eq!(update.macro_retry_count, Some(1));
        assert!(!update.is_complete);
    }

    #[tokio::test]
    async fn micro_planner_without_macro_plan_is_exceptional() {
        let state = RunState::new("find cats", RetryLimits::default());
        let brain = StubBrain::with_tasks(Vec::new());

        let update = micro_planner(&state, &brain).await;
        let Patch::Set(plan) = update.micro_plan else {
            panic!("expected a micro plan");
        };
        assert!(plan.is_exception);
        assert_eq!(plan.macro_task_id, -1);
        assert!(update.micro_retry_count.is_none());
    }

    #[tokio::test]
    async fn micro_planner_counts_tactical_retries() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.current_screen = Some(sample_screen());
        state.micro_plan = Some(MicroPlan::new(0, vec![click_action()]));
        state.last_review_result = Some(ReviewResult::failure("missed", "done"));
        state.micro_retry_count = 1;
        let mut brain = StubBrain::with_tasks(Vec::new());
        brain.actions = vec![click_action()];

        let update = micro_planner(&state, &brain).await;
        assert_eq!(update.micro_retry_count, Some(2));
        let Patch::Set(plan) = update.micro_plan else {
            panic!("expected a fresh micro plan");
        };
        assert!(!plan.is_exception);
        assert_eq!(plan.current_action_index, 0);
    }

    #[tokio::test]
    async fn fresh_micro_plan_after_replan_is_not_a_retry() {
        // The macro planner cleared the micro plan; the stale failed
        // review must not bump the tactical counter.
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.current_screen = Some(sample_screen());
        state.last_review_result = Some(ReviewResult::failure("missed", "done"));
        let brain = StubBrain::with_tasks(Vec::new());

        let update = micro_planner(&state, &brain).await;
        assert!(update.micro_retry_count.is_none());
    }

    #[tokio::test]
    async fn executor_without_micro_plan_fails_softly() {
        let state = RunState::new("find cats", RetryLimits::default());
        let hands = StubHands { text_visible: true };

        let update = executor(&state, &hands).await;
        assert!(matches!(update.micro_plan, Patch::Keep));
        let result = update.last_execution_result.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_message, "no micro plan");
        assert_eq!(update.append_executions.len(), 1);
    }

    #[tokio::test]
    async fn executor_runs_one_action_and_advances_cursor() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.micro_plan = Some(MicroPlan::new(0, vec![click_action(), click_action()]));
        let hands = StubHands { text_visible: true };

        let update = executor(&state, &hands).await;
        let Patch::Set(plan) = update.micro_plan else {
            panic!("expected the advanced micro plan");
        };
        assert_eq!(plan.current_action_index, 1);
        assert!(plan.has_remaining_actions());
        assert!(update.last_execution_result.unwrap().success);
    }

    #[tokio::test]
    async fn reviewer_without_macro_plan_fails() {
        let state = RunState::new("find cats", RetryLimits::default());
        let brain = StubBrain::with_tasks(Vec::new());
        let hands = StubHands { text_visible: true };

        let update = reviewer(&state, &brain, &hands).await;
        let review = update.last_review_result.unwrap();
        assert!(!review.is_success);
        assert_eq!(update.append_reviews.len(), 1);
    }

    #[tokio::test]
    async fn reviewer_mid_plan_progress_check_is_not_appended() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.current_screen = Some(sample_screen());
        state.micro_plan = Some(MicroPlan::new(0, vec![click_action(), click_action()]));
        if let Some(plan) = state.micro_plan.as_mut() {
            plan.current_action_index = 1;
        }
        state.last_execution_result = Some(ExecutionResult::ok());
        let brain = StubBrain::with_tasks(Vec::new());
        let hands = StubHands { text_visible: true };

        let update = reviewer(&state, &brain, &hands).await;
        assert!(update.last_review_result.unwrap().is_success);
        assert!(update.append_reviews.is_empty());
    }

    #[tokio::test]
    async fn reviewer_structural_url_check() {
        let mut task = agent_task(0);
        task.expected_outcome = SuccessCriteria {
            description: "on the results page".into(),
            url_contains: Some("example.com/search".into()),
            text_visible: None,
        };
        let mut state = state_with_plan(vec![task]);
        state.current_screen = Some(sample_screen());
        let mut brain = StubBrain::with_tasks(Vec::new());
        brain.verdict = false; // must not be consulted
        let hands = StubHands { text_visible: true };

        let update = reviewer(&state, &brain, &hands).await;
        assert!(update.last_review_result.unwrap().is_success);
        assert_eq!(update.append_reviews.len(), 1);
    }

    #[tokio::test]
    async fn reviewer_structural_text_check_failure() {
        let mut task = agent_task(0);
        task.expected_outcome = SuccessCriteria {
            description: "order placed".into(),
            url_contains: None,
            text_visible: Some("Order confirmed".into()),
        };
        let mut state = state_with_plan(vec![task]);
        state.current_screen = Some(sample_screen());
        let brain = StubBrain::with_tasks(Vec::new());
        let hands = StubHands {
            text_visible: false,
        };

        let update = reviewer(&state, &brain, &hands).await;
        let review = update.last_review_result.unwrap();
        assert!(!review.is_success);
        assert!(review.rationale.contains("Order confirmed"));
    }

    #[tokio::test]
    async fn reviewer_delegates_without_structural_checks() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.current_screen = Some(sample_screen());
        let mut brain = StubBrain::with_tasks(Vec::new());
        brain.verdict = false;
        let hands = StubHands { text_visible: true };

        let update = reviewer(&state, &brain, &hands).await;
        let review = update.last_review_result.unwrap();
        assert!(!review.is_success);
        assert_eq!(review.rationale, "not there yet");
    }

    #[tokio::test]
    async fn human_gateway_raises_the_flag() {
        let mut task = agent_task(0);
        task.executor = ExecutorType::Human;
        let state = state_with_plan(vec![task]);

        let update = human_gateway(&state);
        assert!(update.needs_human_intervention);
        assert!(escalation_reason(&state).contains("assigned to a human"));
    }

    #[test]
    fn escalation_reason_names_the_blocking_exception() {
        let mut state = state_with_plan(vec![agent_task(0)]);
        state.micro_plan = Some(MicroPlan::exceptional(0, "login wall"));
        let reason = escalation_reason(&state);
        assert!(reason.contains("login wall"));

        state.micro_plan = None;
        assert_eq!(escalation_reason(&state), "retry budgets exhausted");
    }
}
