//! Prompt rendering for generated responses and secondary messages.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Session, WorkItem};
use crate::io::config::PromptConfig;
use crate::io::generator::SKIP_SENTINEL;

const RESPONSE_TEMPLATE: &str = include_str!("prompts/response.md");
const SECONDARY_TEMPLATE: &str = include_str!("prompts/secondary.md");

#[derive(Debug, Clone, Serialize)]
struct SessionContext<'a> {
    session_id: &'a str,
    source_url: Option<&'a str>,
    title: Option<&'a str>,
    context: Option<&'a str>,
}

impl<'a> SessionContext<'a> {
    fn from_session(session: &'a Session, with_context: bool) -> Self {
        Self {
            session_id: &session.session_id,
            source_url: session.source_url.as_deref(),
            title: non_empty(session.title.as_deref()),
            context: non_empty(session.context.as_deref()).filter(|_| with_context),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ItemContext<'a> {
    item_id: &'a str,
    author: Option<&'a str>,
    content: &'a str,
    profile_url: Option<&'a str>,
}

impl<'a> ItemContext<'a> {
    fn from_item(item: &'a WorkItem) -> Self {
        Self {
            item_id: &item.item_id,
            author: non_empty(item.author.as_deref()),
            content: item.content.trim(),
            profile_url: item.profile_url.as_deref(),
        }
    }
}

/// Template engine wrapper around minijinja.
///
/// Templates come from config when set, otherwise the built-in ones. When a
/// rendered prompt exceeds the byte budget it is re-rendered without the
/// session context, the largest and least item-specific section.
pub struct PromptRenderer {
    env: Environment<'static>,
    response: String,
    secondary: String,
    budget_bytes: usize,
}

impl PromptRenderer {
    /// Build a renderer and check both templates compile.
    pub fn from_config(config: &PromptConfig) -> Result<Self> {
        let renderer = Self {
            env: Environment::new(),
            response: config
                .response
                .clone()
                .unwrap_or_else(|| RESPONSE_TEMPLATE.to_string()),
            secondary: config
                .secondary
                .clone()
                .unwrap_or_else(|| SECONDARY_TEMPLATE.to_string()),
            budget_bytes: usize::MAX,
        };
        renderer
            .env
            .template_from_str(&renderer.response)
            .context("compile response template")?;
        renderer
            .env
            .template_from_str(&renderer.secondary)
            .context("compile secondary template")?;
        Ok(renderer)
    }

    pub fn with_budget(mut self, budget_bytes: usize) -> Self {
        self.budget_bytes = budget_bytes;
        self
    }

    pub fn render_response(&self, session: &Session, item: &WorkItem) -> Result<String> {
        self.render_within_budget("response", &self.response, session, item, None)
    }

    pub fn render_secondary(
        &self,
        session: &Session,
        item: &WorkItem,
        handle: &str,
    ) -> Result<String> {
        self.render_within_budget("secondary", &self.secondary, session, item, Some(handle))
    }

    fn render_within_budget(
        &self,
        name: &str,
        source: &str,
        session: &Session,
        item: &WorkItem,
        handle: Option<&str>,
    ) -> Result<String> {
        let full = self.render(name, source, session, item, handle, true)?;
        if full.len() <= self.budget_bytes {
            return Ok(full);
        }
        debug!(
            template = name,
            bytes = full.len(),
            budget = self.budget_bytes,
            "prompt over budget, dropping session context"
        );
        self.render(name, source, session, item, handle, false)
    }

    fn render(
        &self,
        name: &str,
        source: &str,
        session: &Session,
        item: &WorkItem,
        handle: Option<&str>,
        with_context: bool,
    ) -> Result<String> {
        let rendered = self
            .env
            .render_str(
                source,
                context! {
                    session => SessionContext::from_session(session, with_context),
                    item => ItemContext::from_item(item),
                    handle => handle,
                    skip_sentinel => SKIP_SENTINEL,
                },
            )
            .with_context(|| format!("render {name} prompt"))?;
        Ok(rendered.trim().to_string())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{item, session_with};

    #[test]
    fn default_response_prompt_includes_item_and_sentinel() {
        let renderer = PromptRenderer::from_config(&PromptConfig::default()).expect("renderer");
        let mut session = session_with(vec![item("a")]);
        session.title = Some("Launch day".to_string());
        session.items[0].author = Some("Jane".to_string());

        let prompt = renderer
            .render_response(&session, &session.items[0])
            .expect("render");
        assert!(prompt.contains("Post title: Launch day"));
        assert!(prompt.contains("Comment by Jane:"));
        assert!(prompt.contains("a content"));
        assert!(prompt.contains(SKIP_SENTINEL));
    }

    #[test]
    fn configured_template_receives_handle() {
        let renderer = PromptRenderer::from_config(&PromptConfig {
            response: None,
            secondary: Some("Hi {{ handle }}: {{ item.content }}".to_string()),
        })
        .expect("renderer");
        let session = session_with(vec![item("a")]);

        let prompt = renderer
            .render_secondary(&session, &session.items[0], "jane")
            .expect("render");
        assert_eq!(prompt, "Hi jane: a content");
    }

    #[test]
    fn over_budget_prompt_drops_session_context() {
        let renderer = PromptRenderer::from_config(&PromptConfig {
            response: Some("{{ session.context }}|{{ item.content }}".to_string()),
            secondary: None,
        })
        .expect("renderer")
        .with_budget(40);
        let mut session = session_with(vec![item("a")]);
        session.context = Some("x".repeat(100));

        let prompt = renderer
            .render_response(&session, &session.items[0])
            .expect("render");
        assert!(!prompt.contains("xxxx"));
        assert!(prompt.ends_with("|a content"));
    }

    #[test]
    fn invalid_template_is_rejected() {
        let err = PromptRenderer::from_config(&PromptConfig {
            response: Some("{{ unclosed".to_string()),
            secondary: None,
        })
        .err()
        .expect("invalid template must be rejected");
        assert!(err.to_string().contains("response template"));
    }
}
