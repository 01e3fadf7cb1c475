use serde::{Deserialize, Serialize};

/// Who is expected to carry out a macro task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorType {
    Agent,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Ready,
    Running,
    Blocked,
    Exit,
}

/// One concrete browser-level operation the agent can perform.
///
/// `Done` and `Stuck` are terminal markers: the executor recognizes them
/// and returns a result without dispatching anything to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Click,
    Type,
    Scroll,
    Hover,
    SelectOption,
    PressKey,
    Wait,
    GoToUrl,
    GoBack,
    Done,
    Stuck,
}

/// How the reviewer decides a macro task is finished.
///
/// `url_contains` and `text_visible` are structural checks that can be
/// evaluated without consulting the planner; `description` is the
/// natural-language criterion used when no structural check applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuccessCriteria {
    pub description: String,
    #[serde(default)]
    pub url_contains: Option<String>,
    #[serde(default)]
    pub text_visible: Option<String>,
}

impl SuccessCriteria {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            url_contains: None,
            text_visible: None,
        }
    }

    pub fn has_structural_checks(&self) -> bool {
        self.url_contains.is_some() || self.text_visible.is_some()
    }
}

/// One ordered, human-meaningful step toward the goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroTask {
    /// Sequence number, unique within a plan.
    pub id: i64,
    pub description: String,
    pub executor: ExecutorType,
    pub expected_outcome: SuccessCriteria,
    pub status: TaskStatus,
}

/// The whole task list for one run. Replaced wholesale by the macro-plan
/// node (advance, exit, replan); never partially mutated anywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroPlan {
    /// Immutable final objective. Never rewritten after the run starts.
    pub anchor: String,
    pub tasks: Vec<MacroTask>,
    /// Cursor into `tasks`. `tasks.len()` means every task is done.
    pub current_task_index: usize,
    pub replan_count: u32,
}

impl MacroPlan {
    pub fn new(anchor: impl Into<String>, tasks: Vec<MacroTask>) -> Self {
        Self {
            anchor: anchor.into(),
            tasks,
            current_task_index: 0,
            replan_count: 0,
        }
    }

    /// The task the cursor points at, or None once the plan is exhausted.
    pub fn current_task(&self) -> Option<&MacroTask> {
        self.tasks.get(self.current_task_index)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_task_index >= self.tasks.len()
    }
}

/// One concrete action within a micro plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroAction {
    pub action_type: ActionType,
    /// Index into the most recent DOM snapshot. Required for
    /// element-targeted action types.
    #[serde(default)]
    pub target_index: Option<usize>,
    /// Text / URL / key payload, depending on the action type.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expected_outcome: String,
}

/// Ordered action list serving exactly one macro task. Discarded and
/// rebuilt on retry; only the cursor advances in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroPlan {
    /// Back-reference to the MacroTask this plan serves. -1 for the
    /// defensive exceptional plan produced when no macro plan exists.
    pub macro_task_id: i64,
    pub actions: Vec<MicroAction>,
    pub current_action_index: usize,
    /// Set when the planner saw an unplanned condition (blocking dialog,
    /// error page) instead of something it could act on.
    pub is_exception: bool,
    pub exception_reason: String,
}

impl MicroPlan {
    pub fn new(macro_task_id: i64, actions: Vec<MicroAction>) -> Self {
        Self {
            macro_task_id,
            actions,
            current_action_index: 0,
            is_exception: false,
            exception_reason: String::new(),
        }
    }

    /// An empty plan flagged exceptional, routed back to macro planning.
    pub fn exceptional(macro_task_id: i64, reason: impl Into<String>) -> Self {
        Self {
            macro_task_id,
            actions: Vec::new(),
            current_action_index: 0,
            is_exception: true,
            exception_reason: reason.into(),
        }
    }

    pub fn current_action(&self) -> Option<&MicroAction> {
        self.actions.get(self.current_action_index)
    }

    pub fn has_remaining_actions(&self) -> bool {
        self.current_action_index < self.actions.len()
    }
}

/// One interactable element from a DOM snapshot, tagged with the stable
/// index micro actions use to target it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomElement {
    pub index: usize,
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    /// CSS selector resolving to this element on the live page.
    #[serde(default)]
    pub selector: String,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub is_interactive: bool,
}

fn default_true() -> bool {
    true
}

/// Point-in-time observation of the page. Immutable once captured;
/// superseded by the next capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenState {
    pub url: String,
    pub title: String,
    pub elements: Vec<DomElement>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
}

impl ScreenState {
    /// Compact one-line-per-element rendering fed to the planner, in the
    /// same `[eN] tag "text"` shape the snapshot script produces.
    pub fn llm_representation(&self) -> String {
        let mut lines = Vec::with_capacity(self.elements.len());
        for el in &self.elements {
            let mut line = format!("[e{}] {}", el.index, el.tag);
            if !el.text.is_empty() {
                line.push_str(&format!(" \"{}\"", truncate(&el.text, 60)));
            }
            for (name, value) in &el.attributes {
                line.push_str(&format!(" {}=\"{}\"", name, truncate(value, 40)));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.title.contains(needle) || self.elements.iter().any(|el| el.text.contains(needle))
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Outcome of running one micro action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub screen_after: Option<ScreenState>,
}

impl ExecutionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: String::new(),
            screen_after: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            screen_after: None,
        }
    }
}

/// Outcome of judging a macro task's expected outcome against a freshly
/// captured screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub is_success: bool,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub observed: Option<ScreenState>,
}

impl ReviewResult {
    pub fn success(rationale: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            is_success: true,
            rationale: rationale.into(),
            expected: expected.into(),
            observed: None,
        }
    }

    pub fn failure(rationale: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            is_success: false,
            rationale: rationale.into(),
            expected: expected.into(),
            observed: None,
        }
    }

    pub fn with_observed(mut self, screen: Option<ScreenState>) -> Self {
        self.observed = screen;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_plan_cursor_helpers() {
        let task = MacroTask {
            id: 0,
            description: "open the site".into(),
            executor: ExecutorType::Agent,
            expected_outcome: SuccessCriteria::described("site is open"),
            status: TaskStatus::New,
        };
        let mut plan = MacroPlan::new("goal", vec![task]);
        assert_eq!(plan.current_task().unwrap().id, 0);
        assert!(!plan.is_exhausted());

        plan.current_task_index = 1;
        assert!(plan.current_task().is_none());
        assert!(plan.is_exhausted());
    }

    #[test]
    fn exceptional_micro_plan_is_empty() {
        let plan = MicroPlan::exceptional(-1, "no macro plan");
        assert!(plan.is_exception);
        assert!(plan.actions.is_empty());
        assert!(!plan.has_remaining_actions());
        assert!(plan.current_action().is_none());
    }

    #[test]
    fn screen_state_text_lookup() {
        let screen = ScreenState {
            url: "https://example.com/results".into(),
            title: "Results".into(),
            elements: vec![DomElement {
                index: 0,
                tag: "a".into(),
                text: "cat pictures".into(),
                attributes: vec![("href".into(), "/cats".into())],
                selector: "[data-eid=\"e0\"]".into(),
                is_visible: true,
                is_interactive: true,
            }],
            screenshot: None,
        };
        assert!(screen.contains_text("cat pictures"));
        assert!(!screen.contains_text("dog"));
        let rendered = screen.llm_representation();
        assert!(rendered.contains("[e0] a \"cat pictures\""));
    }

    #[test]
    fn action_type_wire_format() {
        let json = serde_json::to_string(&ActionType::SelectOption).unwrap();
        assert_eq!(json, "\"SELECT_OPTION\"");
        let parsed: ActionType = serde_json::from_str("\"GO_TO_URL\"").unwrap();
        assert_eq!(parsed, ActionType::GoToUrl);
    }
}
