use crate::types::{ExecutionResult, MacroPlan, MicroPlan, ReviewResult, ScreenState};

/// Retry budgets for one run.
#[derive(Debug, Clone, Copy)]
pub struct RetryLimits {
    pub max_micro_retries: u32,
    pub max_macro_retries: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_micro_retries: 3,
            max_macro_retries: 2,
        }
    }
}

/// The single mutable aggregate threaded through every node.
///
/// Owned by the graph driver. Nodes receive it read-only and hand back a
/// [`StateUpdate`]; only [`RunState::apply`] mutates it.
#[derive(Debug)]
pub struct RunState {
    /// The user's goal. Immutable for the whole run.
    pub user_command: String,

    pub macro_plan: Option<MacroPlan>,
    pub micro_plan: Option<MicroPlan>,
    pub current_screen: Option<ScreenState>,

    pub last_execution_result: Option<ExecutionResult>,
    pub last_review_result: Option<ReviewResult>,

    pub execution_history: Vec<ExecutionResult>,
    pub review_history: Vec<ReviewResult>,

    pub micro_retry_count: u32,
    pub macro_retry_count: u32,
    pub limits: RetryLimits,

    pub needs_human_intervention: bool,
    pub is_complete: bool,
}

impl RunState {
    pub fn new(user_command: impl Into<String>, limits: RetryLimits) -> Self {
        Self {
            user_command: user_command.into(),
            macro_plan: None,
            micro_plan: None,
            current_screen: None,
            last_execution_result: None,
            last_review_result: None,
            execution_history: Vec::new(),
            review_history: Vec::new(),
            micro_retry_count: 0,
            macro_retry_count: 0,
            limits,
            needs_human_intervention: false,
            is_complete: false,
        }
    }

    /// Merge one node's partial update. Replace fields overwrite, `Patch`
    /// fields may also clear, history fields append. This is the only
    /// place run state is mutated.
    pub fn apply(&mut self, update: StateUpdate) {
        match update.macro_plan {
            Patch::Keep => {}
            Patch::Set(plan) => self.macro_plan = Some(plan),
            Patch::Clear => self.macro_plan = None,
        }
        match update.micro_plan {
            Patch::Keep => {}
            Patch::Set(plan) => self.micro_plan = Some(plan),
            Patch::Clear => self.micro_plan = None,
        }
        if let Some(screen) = update.current_screen {
            self.current_screen = Some(screen);
        }
        if let Some(result) = update.last_execution_result {
            self.last_execution_result = Some(result);
        }
        if let Some(review) = update.last_review_result {
            self.last_review_result = Some(review);
        }
        self.execution_history.extend(update.append_executions);
        self.review_history.extend(update.append_reviews);
        if let Some(count) = update.micro_retry_count {
            self.micro_retry_count = count;
        }
        if let Some(count) = update.macro_retry_count {
            self.macro_retry_count = count;
        }
        if update.needs_human_intervention {
            self.needs_human_intervention = true;
        }
        if update.is_complete {
            self.is_complete = true;
        }
    }
}

/// Three-way patch for nullable replace fields where clearing is a real
/// operation (the macro planner clears the micro plan on advance/replan).
#[derive(Debug, Clone)]
pub enum Patch<T> {
    Keep,
    Set(T),
    Clear,
}

// Hand-written so Patch<T> defaults to Keep without requiring T: Default.
impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

/// A node's partial update to the run state.
///
/// Every field carries its merge rule in its type: `Patch` replaces or
/// clears, `Option` replaces when set, `append_*` vectors append, the
/// terminal flags are sticky once raised.
#[derive(Debug, Default)]
pub struct StateUpdate {
    pub macro_plan: Patch<MacroPlan>,
    pub micro_plan: Patch<MicroPlan>,
    pub current_screen: Option<ScreenState>,
    pub last_execution_result: Option<ExecutionResult>,
    pub last_review_result: Option<ReviewResult>,
    pub append_executions: Vec<ExecutionResult>,
    pub append_reviews: Vec<ReviewResult>,
    pub micro_retry_count: Option<u32>,
    pub macro_retry_count: Option<u32>,
    pub needs_human_intervention: bool,
    pub is_complete: bool,
}

impl StateUpdate {
    /// One-line description of what changed, for the per-transition
    /// operator output.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        match &self.macro_plan {
            Patch::Keep => {}
            Patch::Set(plan) => parts.push(format!(
                "macro_plan: {} tasks, cursor {}, replans {}",
                plan.tasks.len(),
                plan.current_task_index,
                plan.replan_count
            )),
            Patch::Clear => parts.push("macro_plan cleared".to_string()),
        }
        match &self.micro_plan {
            Patch::Keep => {}
            Patch::Set(plan) if plan.is_exception => {
                parts.push(format!("micro_plan: exception ({})", plan.exception_reason))
            }
            Patch::Set(plan) => parts.push(format!(
                "micro_plan: {} actions, cursor {}",
                plan.actions.len(),
                plan.current_action_index
            )),
            Patch::Clear => parts.push("micro_plan cleared".to_string()),
        }
        if let Some(screen) = &self.current_screen {
            parts.push(format!(
                "screen: {} ({} elements)",
                screen.url,
                screen.elements.len()
            ));
        }
        if let Some(result) = &self.last_execution_result {
            if result.success {
                parts.push("execution ok".to_string());
            } else {
                parts.push(format!("execution failed: {}", result.error_message));
            }
        }
        if let Some(review) = &self.last_review_result {
            if review.is_success {
                parts.push("review success".to_string());
            } else {
                parts.push(format!("review failure: {}", review.rationale));
            }
        }
        if let Some(count) = self.micro_retry_count {
            parts.push(format!("micro_retry_count: {count}"));
        }
        if let Some(count) = self.macro_retry_count {
            parts.push(format!("macro_retry_count: {count}"));
        }
        if self.needs_human_intervention {
            parts.push("needs_human_intervention".to_string());
        }
        if self.is_complete {
            parts.push("is_complete".to_string());
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}
