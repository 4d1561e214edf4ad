//! Multi-agent routing.
//!
//! Every agent in a [`MultiAgent`] carries a [`SendMessageRouter`] as its
//! last output handler. When an agent sends a message, its run ends with a
//! routed result; the coordinator looks up the recipient and runs it with
//! the message wrapped in a prompt that names the sender.
//!
//! ```text
//! user ──▶ main ──SEND_MESSAGE──▶ reviewer ──SEND_MESSAGE──▶ main ──▶ result
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use turnstile_config::{AgentProfile, AgentSettings, MultiAgentConfig};
use turnstile_core::action::{ActionKind, ParsedResponse, SEND_MESSAGE_TAG};
use turnstile_core::error::{Error, Result};
use turnstile_core::handler::{ActionResult, HandlerOutcome, OutputHandler};

use crate::loop_runner::{Agent, RunOutcome};

/// The `SEND_MESSAGE` output handler.
pub struct SendMessageRouter {
    directory: Vec<(String, String)>,
}

impl SendMessageRouter {
    /// `directory` lists every reachable agent as `(name, description)`.
    pub fn new(directory: Vec<(String, String)>) -> Self {
        Self { directory }
    }

    pub fn from_profiles(profiles: &[AgentProfile]) -> Self {
        Self::new(
            profiles
                .iter()
                .map(|p| (p.name.clone(), p.description.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl OutputHandler for SendMessageRouter {
    fn name(&self) -> &str {
        SEND_MESSAGE_TAG
    }

    fn can_handle(&self, response: &ParsedResponse) -> bool {
        response.count(ActionKind::SendMessage) == 1
    }

    async fn handle(&self, response: &ParsedResponse) -> Result<HandlerOutcome> {
        let message = response
            .messages()
            .first()
            .map(|m| (*m).clone())
            .ok_or_else(|| Error::Handler {
                handler: SEND_MESSAGE_TAG.into(),
                reason: "no message in response".into(),
            })?;
        Ok(HandlerOutcome::Terminate(ActionResult::Message(message)))
    }

    fn prompt(&self) -> String {
        let agents: Vec<String> = self
            .directory
            .iter()
            .map(|(name, description)| format!("- {name}: {description}"))
            .collect();
        format!(
            r#"You are part of a multi-agent system and talk to the other agents through messages.

Each response performs ONE action: either one tool call or one message, never both,
and never more than one message. After sending, wait for the reply.

<SEND_MESSAGE>
to: agent_name
content: |
    message text,
    on as many indented lines as needed
</SEND_MESSAGE>

Available agents:
{}"#,
            agents.join("\n")
        )
    }
}

/// A set of named agents that hand work to each other.
pub struct MultiAgent {
    agents: HashMap<String, Agent>,
    order: Vec<String>,
    main_agent: String,
    max_hops: u32,
}

impl MultiAgent {
    pub fn new(main_agent: impl Into<String>) -> Self {
        Self {
            agents: HashMap::new(),
            order: Vec::new(),
            main_agent: main_agent.into(),
            max_hops: AgentSettings::default().max_hops,
        }
    }

    /// Upper bound on routed messages per run.
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    /// Build every agent in `config`. `build` supplies the model, tools and
    /// operator for a profile; the profile's system prompt, settings and the
    /// message router are applied on top.
    pub fn from_config<F>(config: &MultiAgentConfig, base: &AgentSettings, mut build: F) -> Result<Self>
    where
        F: FnMut(&AgentProfile) -> Result<Agent>,
    {
        config.validate().map_err(|e| Error::Config {
            message: e.to_string(),
        })?;

        let router = Arc::new(SendMessageRouter::from_profiles(&config.agents));
        let mut multi = Self::new(&config.main_agent).with_max_hops(base.max_hops);
        for profile in &config.agents {
            let agent = build(profile)?
                .with_system_prompt(&profile.system_prompt)
                .with_settings(profile_settings(base, profile))
                .with_handler(router.clone());
            multi.add_agent(agent)?;
        }
        Ok(multi)
    }

    /// Add an agent. Names must be unique.
    pub fn add_agent(&mut self, agent: Agent) -> Result<()> {
        let name = agent.name().to_string();
        if self.agents.contains_key(&name) {
            return Err(Error::Config {
                message: format!("duplicate agent name '{name}'"),
            });
        }
        self.order.push(name.clone());
        self.agents.insert(name, agent);
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn agent_names(&self) -> &[String] {
        &self.order
    }

    /// Run `input` on the main agent and relay messages until some agent
    /// finishes without sending one.
    pub async fn run(&mut self, input: &str) -> RunOutcome {
        let mut last = self.main_agent.clone();
        let Some(main) = self.agents.get_mut(&last) else {
            return RunOutcome::Failed(format!("Task failed: main agent '{last}' not found"));
        };
        let mut outcome = main.run(input).await;
        let mut hops = 0u32;

        loop {
            let message = match outcome {
                RunOutcome::Routed(message) => message,
                finished => return finished,
            };

            hops += 1;
            if hops > self.max_hops {
                warn!(max_hops = self.max_hops, from = %last, to = %message.to, "Message routing hit the hop limit");
                return RunOutcome::Failed(format!(
                    "Task failed: message routing exceeded {} hops",
                    self.max_hops
                ));
            }

            let (target, prompt) = if self.agents.contains_key(&message.to) {
                info!(from = %last, to = %message.to, hop = hops, "Routing message");
                let prompt = format!(
                    "\nPlease handle this message:\nfrom: {last}\ncontent: {}\n",
                    message.content
                );
                (message.to, prompt)
            } else {
                warn!(from = %last, to = %message.to, "Message to unknown agent");
                let prompt = format!(
                    "Agent {} not found, available agents: {}",
                    message.to,
                    self.order.join(", ")
                );
                (last.clone(), prompt)
            };

            let Some(agent) = self.agents.get_mut(&target) else {
                return RunOutcome::Failed(format!("Task failed: agent '{target}' not found"));
            };
            outcome = agent.run(&prompt).await;
            last = target;
        }
    }
}

/// Settings for an agent inside a multi-agent set. Methodology priming and
/// final summaries are off for all of them.
fn profile_settings(base: &AgentSettings, profile: &AgentProfile) -> AgentSettings {
    AgentSettings {
        auto_complete: profile.auto_complete,
        execute_tool_confirm: profile.execute_tool_confirm,
        summary_prompt: profile.summary_prompt.clone(),
        use_methodology: false,
        need_summary: false,
        ..base.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::action::RoutedMessage;
    use turnstile_core::testing::{ScriptedInput, ScriptedModel};

    fn send(to: &str, content: &str) -> String {
        format!("<SEND_MESSAGE>\nto: {to}\ncontent: {content}\n</SEND_MESSAGE>")
    }

    fn quiet() -> AgentSettings {
        AgentSettings {
            need_summary: false,
            use_analysis: false,
            use_methodology: false,
            ..AgentSettings::default()
        }
    }

    fn router() -> Arc<SendMessageRouter> {
        Arc::new(SendMessageRouter::new(vec![
            ("main".into(), "Talks to the user".into()),
            ("reviewer".into(), "Reviews code".into()),
        ]))
    }

    fn agent(name: &str, model: Arc<ScriptedModel>) -> Agent {
        Agent::new(name, model)
            .with_human(Arc::new(ScriptedInput::new()))
            .with_settings(quiet())
            .with_handler(router())
    }

    #[test]
    fn router_needs_exactly_one_message() {
        let r = router();
        assert!(r.can_handle(&ParsedResponse::parse(&send("a", "b"))));
        assert!(!r.can_handle(&ParsedResponse::parse("plain")));
        let two = format!("{}{}", send("a", "1"), send("b", "2"));
        assert!(!r.can_handle(&ParsedResponse::parse(&two)));
    }

    #[tokio::test]
    async fn two_messages_get_corrective_feedback() {
        let two = format!("{}\n{}", send("reviewer", "one"), send("main", "two"));
        let model = Arc::new(ScriptedModel::new([two, "ok".to_string()]));
        let human = Arc::new(ScriptedInput::new());
        let mut main = Agent::new("main", model.clone())
            .with_human(human.clone())
            .with_settings(quiet())
            .with_handler(router());

        let outcome = main.run("task").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].starts_with("2 <SEND_MESSAGE> blocks were sent. Please only send one at a time."));
        assert_eq!(human.asked().len(), 1);
    }

    #[tokio::test]
    async fn malformed_message_gets_corrective_feedback() {
        let bad = "<SEND_MESSAGE>\ncontent: no recipient\n</SEND_MESSAGE>".to_string();
        let model = Arc::new(ScriptedModel::new([bad, send("reviewer", "fixed")]));
        let mut main = agent("main", model.clone());

        let outcome = main.run("task").await;

        assert!(matches!(outcome, RunOutcome::Routed(ref m) if m.to == "reviewer"));
        assert!(model.prompts()[1].starts_with("Malformed <SEND_MESSAGE> block: missing 'to'."));
    }

    #[tokio::test]
    async fn router_terminates_with_message() {
        let outcome = router().handle(&ParsedResponse::parse(&send("reviewer", "look"))).await.unwrap();
        assert_eq!(
            outcome,
            HandlerOutcome::Terminate(ActionResult::Message(RoutedMessage {
                to: "reviewer".into(),
                content: "look".into(),
            }))
        );
    }

    #[test]
    fn router_prompt_lists_agents() {
        let prompt = router().prompt();
        assert!(prompt.contains("- main: Talks to the user"));
        assert!(prompt.contains("- reviewer: Reviews code"));
        assert!(prompt.contains("<SEND_MESSAGE>"));
    }

    #[tokio::test]
    async fn messages_are_relayed_between_agents() {
        let main_model = Arc::new(ScriptedModel::new([send("reviewer", "check this"), "Thanks.".into()]));
        let reviewer_model = Arc::new(ScriptedModel::new([send("main", "looks good")]));

        let mut multi = MultiAgent::new("main");
        multi.add_agent(agent("main", main_model.clone())).unwrap();
        multi.add_agent(agent("reviewer", reviewer_model.clone())).unwrap();

        let outcome = multi.run("review my change").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert!(reviewer_model.prompts()[0]
            .starts_with("\nPlease handle this message:\nfrom: main\ncontent: check this\n"));
        assert!(main_model.prompts()[1].contains("from: reviewer\ncontent: looks good"));
    }

    #[tokio::test]
    async fn unknown_target_reinvokes_sender() {
        let main_model = Arc::new(ScriptedModel::new([send("ghost", "boo"), "ok".into()]));
        let reviewer_model = Arc::new(ScriptedModel::new(Vec::<String>::new()));

        let mut multi = MultiAgent::new("main");
        multi.add_agent(agent("main", main_model.clone())).unwrap();
        multi.add_agent(agent("reviewer", reviewer_model.clone())).unwrap();

        let outcome = multi.run("task").await;

        assert_eq!(outcome, RunOutcome::Completed("Task completed".into()));
        assert!(main_model.prompts()[1].starts_with("Agent ghost not found, available agents: main, reviewer"));
        assert_eq!(reviewer_model.call_count(), 0);
    }

    #[tokio::test]
    async fn hop_limit_fails_the_run() {
        let a = Arc::new(ScriptedModel::new([send("b", "ping"), send("b", "ping")]));
        let b = Arc::new(ScriptedModel::new([send("a", "pong"), send("a", "pong")]));

        let mut multi = MultiAgent::new("a").with_max_hops(3);
        multi.add_agent(agent("a", a)).unwrap();
        multi.add_agent(agent("b", b)).unwrap();

        match multi.run("start").await {
            RunOutcome::Failed(text) => assert!(text.contains("exceeded 3 hops")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut multi = MultiAgent::new("main");
        multi.add_agent(agent("main", Arc::new(ScriptedModel::new(["x"])))).unwrap();
        let err = multi.add_agent(agent("main", Arc::new(ScriptedModel::new(["y"]))));
        assert!(matches!(err, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn missing_main_agent_fails() {
        let mut multi = MultiAgent::new("nobody");
        assert!(matches!(multi.run("x").await, RunOutcome::Failed(_)));
    }

    #[test]
    fn from_config_applies_profiles() {
        let config: MultiAgentConfig = toml::from_str(
            r#"
main_agent = "main"

[[agents]]
name = "main"
description = "Talks to the user"
system_prompt = "You coordinate."

[[agents]]
name = "reviewer"
description = "Reviews code"
system_prompt = "You review."
auto_complete = true
"#,
        )
        .unwrap();

        let multi = MultiAgent::from_config(&config, &AgentSettings::default(), |profile| {
            Ok(Agent::new(&profile.name, Arc::new(ScriptedModel::new(Vec::<String>::new()))))
        })
        .unwrap();

        assert_eq!(multi.agent_names(), ["main".to_string(), "reviewer".to_string()]);
        let reviewer = multi.agent("reviewer").unwrap();
        assert_eq!(reviewer.handler_names(), vec!["SEND_MESSAGE"]);
        let system = reviewer.full_system_prompt();
        assert!(system.starts_with("You review."));
        assert!(system.contains("- main: Talks to the user"));
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let config = MultiAgentConfig {
            main_agent: "missing".into(),
            agents: vec![],
        };
        let result = MultiAgent::from_config(&config, &AgentSettings::default(), |p| {
            Ok(Agent::new(&p.name, Arc::new(ScriptedModel::new(Vec::<String>::new()))))
        });
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn profile_settings_disable_priming() {
        let profile = AgentProfile {
            name: "x".into(),
            description: String::new(),
            system_prompt: String::new(),
            summary_prompt: Some("sum".into()),
            auto_complete: true,
            execute_tool_confirm: true,
            model: None,
            max_token_count: None,
            use_tools: vec![],
        };
        let settings = profile_settings(&AgentSettings::default(), &profile);
        assert!(settings.auto_complete);
        assert!(settings.execute_tool_confirm);
        assert!(!settings.use_methodology);
        assert!(!settings.need_summary);
        assert_eq!(settings.summary_prompt.as_deref(), Some("sum"));
    }
}
