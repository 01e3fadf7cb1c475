use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::types::{
    ExecutionResult, ExecutorType, MacroPlan, MacroTask, MicroAction, MicroPlan, ReviewResult,
    ScreenState, SuccessCriteria, TaskStatus,
};

const MODEL: &str = "gpt-5.2"; // Change to your preferred model
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

/// How many recent execution results the micro planner gets to see.
const HISTORY_WINDOW: usize = 5;

#[derive(Debug, Error)]
pub enum BrainError {
    #[error("OPENAI_API_KEY not set in environment")]
    MissingApiKey,

    #[error("planner request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("planner API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("no content in planner response")]
    MissingContent,

    #[error("malformed planner reply: {0}")]
    MalformedReply(#[from] serde_json::Error),
}

/// The planning collaborator. Turns a goal into a task list, a task plus a
/// screen into an action list, and a screen plus criteria into a verdict.
/// Swapping implementations must not touch the orchestration core.
#[async_trait]
pub trait Brain: Send + Sync {
    /// Decompose the goal into an ordered macro task list. `progress`
    /// carries what already happened, including failure context on replans.
    async fn plan(&self, goal: &str, progress: &str) -> Result<MacroPlan, BrainError>;

    /// Predict the concrete actions that achieve `task` on `screen`.
    async fn decide_actions(
        &self,
        task: &MacroTask,
        screen: &ScreenState,
        history: &[ExecutionResult],
    ) -> Result<MicroPlan, BrainError>;

    /// Judge whether `criteria` is satisfied by `screen`.
    async fn evaluate(
        &self,
        criteria: &SuccessCriteria,
        screen: &ScreenState,
    ) -> Result<ReviewResult, BrainError>;
}

const MACRO_PROMPT: &str = r#"You decompose a browser automation goal into an ordered list of coarse tasks.

Return ONLY a JSON object, no markdown, no explanation:
{"tasks":[{"description":"...","executor":"AGENT","expected_outcome":"...","url_contains":null,"text_visible":null}]}

Rules:
1. Each task is one human-meaningful step (open a site, run a search, fill a form).
2. executor is "AGENT" unless the step genuinely requires a person (solving a captcha, approving a payment), then "HUMAN".
3. expected_outcome describes what the screen looks like when the task is done.
4. Fill url_contains with a URL fragment the done-screen will contain when you can predict one, else null. Same for text_visible with text that must be on screen.
5. Keep the list short. Do not pad with verification-only tasks."#;

const MICRO_PROMPT: &str = r#"You plan concrete browser actions for ONE task, given an indexed snapshot of the current page.

Return ONLY a JSON object, no markdown, no explanation:
{"actions":[{"action_type":"CLICK","target_index":0,"value":null,"description":"...","expected_outcome":"..."}],"is_exception":false,"exception_reason":""}

Available action_type values: CLICK, TYPE, SCROLL, HOVER, SELECT_OPTION, PRESS_KEY, WAIT, GO_TO_URL, GO_BACK.

Rules:
1. target_index is the N from the [eN] element lines in the snapshot. Required for CLICK, TYPE, HOVER, SELECT_OPTION.
2. value holds the text for TYPE, the URL for GO_TO_URL, the key name for PRESS_KEY, the option for SELECT_OPTION, milliseconds for WAIT.
3. If the page shows something unplanned that blocks the task (popup, login wall, error page), return an empty actions list with is_exception true and a short exception_reason instead of guessing.
4. Keep the list minimal. Do not over-navigate."#;

const REVIEW_PROMPT: &str = r#"You judge whether a browser task succeeded. You only classify; you never plan the next action.

Return ONLY a JSON object, no markdown, no explanation:
{"is_success":true,"rationale":"..."}

Compare the expected outcome against the page snapshot and decide. Be strict: a half-loaded page or an error banner is a failure."#;

/// LLM-backed [`Brain`] speaking the OpenAI chat-completions protocol.
pub struct LlmBrain {
    client: Client,
    api_key: String,
    model: String,
}

impl LlmBrain {
    pub fn new() -> Result<Self, BrainError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| BrainError::MissingApiKey)?;
        Ok(Self {
            client: Client::new(),
            api_key,
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| MODEL.to_string()),
        })
    }

    /// One system+user round trip, returning the raw reply text.
    async fn chat(&self, system: &str, user: &str) -> Result<String, BrainError> {
        let response = self
            .client
            .post(OPENAI_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.2,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            return Err(BrainError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(BrainError::MissingContent)?;

        tracing::debug!(reply = content, "planner replied");
        Ok(content.to_string())
    }
}

/// Strip the markdown fences models like to wrap JSON in.
fn strip_fences(reply: &str) -> &str {
    reply
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Deserialize)]
struct TaskReply {
    description: String,
    #[serde(default)]
    executor: Option<ExecutorType>,
    expected_outcome: String,
    #[serde(default)]
    url_contains: Option<String>,
    #[serde(default)]
    text_visible: Option<String>,
}

#[derive(Deserialize)]
struct PlanReply {
    tasks: Vec<TaskReply>,
}

#[derive(Deserialize)]
struct ActionsReply {
    #[serde(default)]
    actions: Vec<MicroAction>,
    #[serde(default)]
    is_exception: bool,
    #[serde(default)]
    exception_reason: String,
}

#[derive(Deserialize)]
struct VerdictReply {
    is_success: bool,
    #[serde(default)]
    rationale: String,
}

fn render_history(history: &[ExecutionResult]) -> String {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .map(|r| {
            if r.success {
                "- ok".to_string()
            } else {
                format!("- failed: {}", r.error_message)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Brain for LlmBrain {
    async fn plan(&self, goal: &str, progress: &str) -> Result<MacroPlan, BrainError> {
        let user = if progress.is_empty() {
            format!("Goal: {goal}")
        } else {
            format!("Goal: {goal}\n\nProgress so far:\n{progress}")
        };

        let reply = self.chat(MACRO_PROMPT, &user).await?;
        let parsed: PlanReply = serde_json::from_str(strip_fences(&reply))?;

        let tasks = parsed
            .tasks
            .into_iter()
            .enumerate()
            .map(|(i, t)| MacroTask {
                id: i as i64,
                description: t.description,
                executor: t.executor.unwrap_or(ExecutorType::Agent),
                expected_outcome: SuccessCriteria {
                    description: t.expected_outcome,
                    url_contains: t.url_contains,
                    text_visible: t.text_visible,
                },
                status: TaskStatus::New,
            })
            .collect();

        Ok(MacroPlan::new(goal, tasks))
    }

    async fn decide_actions(
        &self,
        task: &MacroTask,
        screen: &ScreenState,
        history: &[ExecutionResult],
    ) -> Result<MicroPlan, BrainError> {
        let user = format!(
            "Task: {}\nExpected outcome: {}\n\nPage URL: {}\nTitle: {}\n\nElements:\n{}\n\nRecent results:\n{}",
            task.description,
            task.expected_outcome.description,
            screen.url,
            screen.title,
            screen.llm_representation(),
            render_history(history),
        );

        let reply = self.chat(MICRO_PROMPT, &user).await?;
        let parsed: ActionsReply = serde_json::from_str(strip_fences(&reply))?;

        if parsed.is_exception {
            return Ok(MicroPlan::exceptional(task.id, parsed.exception_reason));
        }
        Ok(MicroPlan::new(task.id, parsed.actions))
    }

    async fn evaluate(
        &self,
        criteria: &SuccessCriteria,
        screen: &ScreenState,
    ) -> Result<ReviewResult, BrainError> {
        let user = format!(
            "Expected outcome: {}\n\nPage URL: {}\nTitle: {}\n\nElements:\n{}",
            criteria.description,
            screen.url,
            screen.title,
            screen.llm_representation(),
        );

        let reply = self.chat(REVIEW_PROMPT, &user).await?;
        let parsed: VerdictReply = serde_json::from_str(strip_fences(&reply))?;

        let result = if parsed.is_success {
            ReviewResult::success(parsed.rationale, &criteria.description)
        } else {
            ReviewResult::failure(parsed.rationale, &criteria.description)
        };
        Ok(result.with_observed(Some(screen.clone())))
    }
}
