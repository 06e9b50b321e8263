//! The LLM call executor.

use std::borrow::Cow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::formatter::TemplateFormatter;
use crate::chat::{ChatOptions, Message, Role};
use crate::errors::FlowError;
use crate::flow::step::{Step, StepExecutor};
use crate::flow::FlowContext;

/// Formats a prompt from the flow context, calls the step's client and
/// writes the assistant reply back into the context text.
///
/// Exactly one of `template` / `template_file` must be configured; the
/// template sees the whole serialized context (`text`, `variables`, `memory`,
/// `think`, `image_urls`). Without a compiled formatter (init bypassed and no
/// template configured) the raw context text is sent as the prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmExecutor {
    pub template: Option<String>,
    pub template_file: Option<String>,
    /// Optional system message sent ahead of the user prompt.
    pub system_message: String,
    /// Request a JSON-formatted reply from the client.
    pub output_json: bool,
    /// Characters stripped from both ends of the reply. Empty disables.
    pub trim: String,
    #[serde(skip)]
    formatter: Option<TemplateFormatter>,
}

impl LlmExecutor {
    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            ..Default::default()
        }
    }

    pub fn with_template_file(path: impl Into<String>) -> Self {
        Self {
            template_file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = system_message.into();
        self
    }

    pub fn with_output_json(mut self, output_json: bool) -> Self {
        self.output_json = output_json;
        self
    }

    /// The compiled formatter, or a transient one when init was bypassed.
    fn resolve_formatter(&self) -> Result<Option<Cow<'_, TemplateFormatter>>, anyhow::Error> {
        if let Some(f) = &self.formatter {
            return Ok(Some(Cow::Borrowed(f)));
        }
        if let Some(t) = &self.template {
            return Ok(Some(Cow::Owned(TemplateFormatter::from_string(t)?)));
        }
        if let Some(p) = &self.template_file {
            return Ok(Some(Cow::Owned(TemplateFormatter::from_file(p)?)));
        }
        Ok(None)
    }

    fn build_messages(&self, prompt: &str, ctx: &FlowContext) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_message.is_empty() {
            messages.push(Message::system(self.system_message.clone()));
        }
        if ctx.image_urls.is_empty() {
            messages.push(Message::user(prompt));
        } else {
            messages.push(Message::with_image_urls(Role::User, prompt, &ctx.image_urls));
        }
        messages
    }
}

#[async_trait]
impl StepExecutor for LlmExecutor {
    fn init(&mut self) -> Result<(), anyhow::Error> {
        match (&self.template, &self.template_file) {
            (Some(_), Some(_)) => Err(anyhow::anyhow!(
                "llm executor accepts only one of template and template_file"
            )),
            (None, None) => Err(anyhow::anyhow!(
                "llm executor requires one of template or template_file"
            )),
            (Some(t), None) => {
                self.formatter = Some(TemplateFormatter::from_string(t)?);
                Ok(())
            }
            (None, Some(p)) => {
                self.formatter = Some(TemplateFormatter::from_file(p)?);
                Ok(())
            }
        }
    }

    async fn run(&self, ctx: &mut FlowContext, step: &Step) -> Result<(), anyhow::Error> {
        let client = step
            .client_override
            .clone()
            .or_else(|| ctx.flow.as_ref().and_then(|f| f.default_client.clone()))
            .ok_or(FlowError::MissingClient {
                step: step.name.clone(),
            })?;

        let prompt = match self.resolve_formatter()? {
            Some(formatter) => {
                let bound = serde_json::to_value(&*ctx)?;
                formatter.format_serializable(&bound)?
            }
            None => ctx.text.clone(),
        };

        let messages = self.build_messages(&prompt, ctx);
        let options = self.output_json.then(ChatOptions::json);

        let (reply, usage) = client.chat(messages, options.as_ref()).await?;
        if let Some(usage) = usage {
            log::debug!(
                "llm step '{}' used {} tokens ({} prompt, {} completion)",
                step.name,
                usage.total_tokens,
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }

        ctx.text = if self.trim.is_empty() {
            reply.content
        } else {
            let strip: Vec<char> = self.trim.chars().collect();
            reply
                .content
                .trim_matches(|c| strip.contains(&c))
                .to_string()
        };
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepExecutor> {
        Box::new(self.clone())
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::flow::Flow;
    use crate::llm::testing::{EchoClient, FailingClient, FixedClient};
    use crate::llm::Client;
    use crate::llm::ClientRef;

    fn step_with_client(client: ClientRef) -> Step {
        Step::new("llm", Box::new(LlmExecutor::default())).with_client(client)
    }

    #[test]
    fn test_init_requires_exactly_one_template_source() {
        let mut neither = LlmExecutor::default();
        assert!(neither.init().is_err());

        let mut both = LlmExecutor::with_template("x");
        both.template_file = Some("y".to_string());
        assert!(both.init().is_err());

        let mut just_template = LlmExecutor::with_template("{{ text }}");
        assert!(just_template.init().is_ok());
        // init is re-entrant.
        assert!(just_template.init().is_ok());
    }

    #[tokio::test]
    async fn test_run_without_client_fails() {
        let mut executor = LlmExecutor::with_template("{{ text }}");
        executor.init().unwrap();
        let step = Step::new("orphan", Box::new(executor.clone()));
        let mut ctx = FlowContext::new("hi");
        let err = executor.run(&mut ctx, &step).await.unwrap_err();
        assert!(err.to_string().contains("no client"));
    }

    #[tokio::test]
    async fn test_templated_prompt_reaches_client() {
        let mut executor = LlmExecutor::with_template("Write: {{ text }}");
        executor.init().unwrap();
        let step = step_with_client(Arc::new(EchoClient));
        let mut ctx = FlowContext::new("moon");
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "Write: moon");
    }

    #[tokio::test]
    async fn test_variables_render_in_prompt() {
        let mut executor =
            LlmExecutor::with_template("{{ variables.product }}: ${{ variables.price }}");
        executor.init().unwrap();
        let step = step_with_client(Arc::new(EchoClient));

        let mut ctx = FlowContext::new("");
        ctx.set_variable("product", serde_json::json!("Laptop"));
        ctx.set_variable("price", serde_json::json!(1299.99));
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "Laptop: $1299.99");
    }

    #[tokio::test]
    async fn test_no_formatter_sends_raw_text() {
        // Construct without init so no formatter is compiled.
        let executor = LlmExecutor::default();
        let step = step_with_client(Arc::new(EchoClient));
        let mut ctx = FlowContext::new("raw passthrough");
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "raw passthrough");
    }

    #[tokio::test]
    async fn test_template_compiles_transiently_when_init_bypassed() {
        let executor = LlmExecutor::with_template("late: {{ text }}");
        let step = step_with_client(Arc::new(EchoClient));
        let mut ctx = FlowContext::new("bind");
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "late: bind");
    }

    #[tokio::test]
    async fn test_trim_strips_reply_edges() {
        let mut executor = LlmExecutor::with_template("{{ text }}");
        executor.trim = "\"\n ".to_string();
        executor.init().unwrap();
        let step = step_with_client(Arc::new(FixedClient::new("\n \"answer\" \n")));
        let mut ctx = FlowContext::new("q");
        executor.run(&mut ctx, &step).await.unwrap();
        assert_eq!(ctx.text, "answer");
    }

    #[tokio::test]
    async fn test_system_message_and_json_options() {
        struct Capture {
            saw_system: std::sync::Mutex<bool>,
            saw_json: std::sync::Mutex<bool>,
        }

        #[async_trait]
        impl Client for Capture {
            async fn chat(
                &self,
                messages: Vec<Message>,
                options: Option<&ChatOptions>,
            ) -> Result<(Message, Option<crate::chat::Usage>), anyhow::Error> {
                *self.saw_system.lock().unwrap() =
                    messages.first().map(|m| m.role) == Some(Role::System);
                *self.saw_json.lock().unwrap() = options.map(|o| o.wants_json()).unwrap_or(false);
                Ok((Message::assistant("{}"), None))
            }
        }

        let capture = Arc::new(Capture {
            saw_system: std::sync::Mutex::new(false),
            saw_json: std::sync::Mutex::new(false),
        });

        let mut executor = LlmExecutor::with_template("{{ text }}")
            .with_system_message("You are terse.")
            .with_output_json(true);
        executor.init().unwrap();
        let step = Step::new("llm", Box::new(executor.clone())).with_client(capture.clone());
        let mut ctx = FlowContext::new("x");
        executor.run(&mut ctx, &step).await.unwrap();

        assert!(*capture.saw_system.lock().unwrap());
        assert!(*capture.saw_json.lock().unwrap());
    }

    #[tokio::test]
    async fn test_image_urls_build_content_parts() {
        struct PartsProbe {
            parts_len: std::sync::Mutex<usize>,
        }

        #[async_trait]
        impl Client for PartsProbe {
            async fn chat(
                &self,
                messages: Vec<Message>,
                _options: Option<&ChatOptions>,
            ) -> Result<(Message, Option<crate::chat::Usage>), anyhow::Error> {
                let user = messages.last().unwrap();
                *self.parts_len.lock().unwrap() =
                    user.content_parts.as_ref().map(|p| p.len()).unwrap_or(0);
                Ok((Message::assistant("seen"), None))
            }
        }

        let probe = Arc::new(PartsProbe {
            parts_len: std::sync::Mutex::new(0),
        });

        let mut executor = LlmExecutor::with_template("describe: {{ text }}");
        executor.init().unwrap();
        let step = Step::new("llm", Box::new(executor.clone())).with_client(probe.clone());
        let mut ctx = FlowContext::new("img").with_image_urls(vec![
            "https://example.com/a.png".to_string(),
            "https://example.com/b.png".to_string(),
        ]);
        executor.run(&mut ctx, &step).await.unwrap();

        // One text part plus one part per image.
        assert_eq!(*probe.parts_len.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_client_error_propagates() {
        let executor = LlmExecutor::default();
        let step = step_with_client(Arc::new(FailingClient));
        let mut ctx = FlowContext::new("q");
        let err = executor.run(&mut ctx, &step).await.unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_flow_default_client_used_when_no_override() {
        let mut executor = LlmExecutor::with_template("via flow: {{ text }}");
        executor.init().unwrap();
        let flow = Arc::new(
            Flow::new("f", vec![Step::new("llm", Box::new(executor))])
                .unwrap()
                .with_client(Arc::new(EchoClient)),
        );
        let ctx = flow.run_with_input("ok").await.unwrap();
        assert_eq!(ctx.text, "via flow: ok");
    }

    #[test]
    fn test_load_config_decodes_fields() {
        let mut executor = LlmExecutor::default();
        executor
            .load_config(&serde_json::json!({
                "template": "T {{ text }}",
                "system_message": "sys",
                "output_json": true,
                "trim": "\n"
            }))
            .unwrap();
        assert_eq!(executor.template.as_deref(), Some("T {{ text }}"));
        assert_eq!(executor.system_message, "sys");
        assert!(executor.output_json);
        assert!(executor.init().is_ok());
    }
}
