//! Ask-user tool: lets the model put a question to the operator.

use async_trait::async_trait;
use std::sync::Arc;
use turnstile_core::error::ToolError;
use turnstile_core::human::HumanInput;
use turnstile_core::tool::{Tool, ToolOutput};

pub struct AskUserTool {
    human: Arc<dyn HumanInput>,
}

impl AskUserTool {
    pub fn new(human: Arc<dyn HumanInput>) -> Self {
        Self { human }
    }
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a question when information or a decision is needed that cannot be obtained otherwise. Returns the user's answer."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let question = arguments["question"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'question' argument".into()))?;

        let answer = self.human.ask(question).await;
        if answer.trim().is_empty() {
            Ok(ToolOutput::ok("The user gave no answer."))
        } else {
            Ok(ToolOutput::ok(format!("User answer:\n{answer}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::testing::ScriptedInput;

    #[tokio::test]
    async fn relays_question_and_answer() {
        let human = Arc::new(ScriptedInput::new().answers(["use port 8080"]));
        let tool = AskUserTool::new(human.clone());

        let result = tool
            .execute(serde_json::json!({"question": "Which port?"}))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.stdout.contains("use port 8080"));
        assert_eq!(human.asked(), vec!["Which port?".to_string()]);
    }

    #[tokio::test]
    async fn blank_answer_is_reported() {
        let tool = AskUserTool::new(Arc::new(ScriptedInput::new()));
        let result = tool
            .execute(serde_json::json!({"question": "Anything?"}))
            .await
            .unwrap();
        assert_eq!(result.stdout, "The user gave no answer.");
    }
}
