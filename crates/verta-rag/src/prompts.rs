//! Prompt templates for the conversation agents
//!
//! Templates use `{name}` placeholders. Rendering is a single pass over the
//! template: text substituted into a placeholder is never scanned again, so
//! braces inside product data or reviews cannot be mistaken for placeholders.
//! Unknown placeholders are left as they are.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use verta_core::{Document, Prompt, Result, VertaError};

const DEFAULT_SUPERVISOR: &str = "\
You are a supervisor tasked with managing a conversation between the following workers: {members}. \
Given a shopper's question about a product, decide which worker should act next to gather the \
information needed to answer it. Each worker returns documents that are shown to you below. \
When the gathered documents are enough to answer the question, or when no worker can help, \
respond with FINISH.";

const DEFAULT_METADATA: &str = "\
You are a product expert. Summarize the product below in a short paragraph that a shopping \
assistant can use as background. Mention what the product is, who sells it, its price, its \
rating and the most important features. Do not invent facts that are not listed.

Category: {main_category}
Title: {title}
Average rating: {average_rating} from {rating_number} ratings
Features: {features}
Description: {description}
Price: {price}
Store: {store}
Categories: {categories}
Details: {details}";

const DEFAULT_GENERATE: &str = "\
You are a helpful shopping assistant answering questions about one product. Use the product \
summary and the customer reviews provided as context. If the context does not contain the \
answer, say so honestly and answer from the product summary where possible. Keep answers \
concise and friendly.

Product summary:
{product}";

const DEFAULT_FOLLOWUP: &str = "\
You help shoppers explore a product. Given the product summary, the shopper's question, the \
answer they received and some customer reviews, suggest up to three short follow-up questions \
the shopper might ask next. Put each question on its own line with no numbering or bullets.

Product summary:
{product}

Question: {question}
Answer: {answer}

Reviews:
{context}";

/// Placeholders each template must contain
const REQUIRED: &[(&str, &[&str])] = &[
    ("supervisor", &["members"]),
    ("metadata", &["title", "details"]),
    ("generate", &["product"]),
    ("followup", &["question", "answer"]),
];

/// System templates for every agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    pub supervisor: String,
    pub metadata: String,
    pub generate: String,
    pub followup: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            supervisor: DEFAULT_SUPERVISOR.to_string(),
            metadata: DEFAULT_METADATA.to_string(),
            generate: DEFAULT_GENERATE.to_string(),
            followup: DEFAULT_FOLLOWUP.to_string(),
        }
    }
}

impl PromptSet {
    /// Load templates from a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VertaError::ConfigError(format!("Failed to read prompts {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse templates from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let prompts: Self = toml::from_str(content)
            .map_err(|e| VertaError::ConfigError(format!("Invalid prompts file: {e}")))?;
        prompts.validate()?;
        Ok(prompts)
    }

    /// Load from `path` if given, otherwise use the built-in templates
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Check that every template still carries its required placeholders
    pub fn validate(&self) -> Result<()> {
        for (name, keys) in REQUIRED {
            let template = match *name {
                "supervisor" => &self.supervisor,
                "metadata" => &self.metadata,
                "generate" => &self.generate,
                _ => &self.followup,
            };
            for key in *keys {
                if !template.contains(&format!("{{{key}}}")) {
                    return Err(VertaError::ConfigError(format!(
                        "Prompt '{name}' is missing placeholder {{{key}}}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Substitute `{key}` placeholders in one pass
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let vars: HashMap<&str, &str> = vars.iter().copied().collect();
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let replaced = after.find('}').and_then(|end| {
            let key = &after[..end];
            vars.get(key).map(|value| (*value, end))
        });

        match replaced {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Number documents as a context block
pub fn format_documents(documents: &[Document]) -> String {
    documents
        .iter()
        .enumerate()
        .map(|(i, doc)| match doc.source() {
            Some(source) => format!("[{}] ({source}) {}", i + 1, doc.page_content),
            None => format!("[{}] {}", i + 1, doc.page_content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt builder for agent calls
#[derive(Debug, Default)]
pub struct PromptBuilder {
    system_instruction: String,
    context_sections: Vec<String>,
    question: String,
    instructions: Vec<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set system instruction
    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Add a context section; empty sections are skipped
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        if !context.trim().is_empty() {
            self.context_sections.push(context);
        }
        self
    }

    /// Set the question
    pub fn question(mut self, q: impl Into<String>) -> Self {
        self.question = q.into();
        self
    }

    /// Add an instruction
    pub fn add_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instructions.push(instruction.into());
        self
    }

    /// Build the final prompt.
    ///
    /// The system instruction becomes the system message; context, question
    /// and instructions make up the user turn.
    pub fn build(self) -> Prompt {
        let mut prompt = String::new();

        if !self.context_sections.is_empty() {
            prompt.push_str("<context>\n");
            for section in &self.context_sections {
                prompt.push_str(section);
                prompt.push_str("\n\n");
            }
            prompt.push_str("</context>\n\n");
        }

        if !self.question.is_empty() {
            prompt.push_str("<question>\n");
            prompt.push_str(&self.question);
            prompt.push_str("\n</question>\n\n");
        }

        if !self.instructions.is_empty() {
            prompt.push_str("<instructions>\n");
            for (i, instruction) in self.instructions.iter().enumerate() {
                prompt.push_str(&format!("{}. {}\n", i + 1, instruction));
            }
            prompt.push_str("</instructions>\n");
        }

        Prompt::with_system(self.system_instruction, prompt.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_keys() {
        let out = render("Hi {name}, {greeting}!", &[("name", "Ana"), ("greeting", "welcome")]);
        assert_eq!(out, "Hi Ana, welcome!");
    }

    #[test]
    fn test_render_is_single_pass() {
        let out = render("A: {a} B: {b}", &[("a", "{b}"), ("b", "x")]);
        assert_eq!(out, "A: {b} B: x");
    }

    #[test]
    fn test_render_keeps_unknown_and_unbalanced_braces() {
        assert_eq!(render("{unknown} {", &[("k", "v")]), "{unknown} {");
        assert_eq!(render("{{k}}", &[("k", "v")]), "{v}");
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(PromptSet::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_override() {
        let prompts = PromptSet::from_toml(
            r#"generate = "Answer using {product} only.""#,
        )
        .unwrap();
        assert_eq!(prompts.generate, "Answer using {product} only.");
        assert_eq!(prompts.supervisor, DEFAULT_SUPERVISOR);
    }

    #[test]
    fn test_override_missing_placeholder_is_rejected() {
        let err = PromptSet::from_toml(r#"followup = "Suggest questions.""#).unwrap_err();
        assert!(matches!(err, VertaError::ConfigError(_)));
    }

    #[test]
    fn test_format_documents() {
        let docs = vec![
            Document::with_source("Great sound", "Review"),
            Document::new("plain"),
        ];
        assert_eq!(format_documents(&docs), "[1] (Review) Great sound\n[2] plain");
        assert_eq!(format_documents(&[]), "");
    }

    #[test]
    fn test_prompt_builder() {
        let prompt = PromptBuilder::new()
            .system("You are a helpful assistant.")
            .add_context("[1] Review A")
            .add_context("   ")
            .question("Is it loud?")
            .add_instruction("Be concise")
            .build();

        assert_eq!(prompt.system.as_deref(), Some("You are a helpful assistant."));
        assert!(prompt.user.starts_with("<context>"));
        assert!(prompt.user.contains("[1] Review A"));
        assert!(!prompt.user.contains("helpful assistant"));
        assert_eq!(prompt.user.matches("\n\n\n").count(), 0);
        assert!(prompt.user.contains("<question>\nIs it loud?\n</question>"));
        assert!(prompt.user.contains("1. Be concise"));
    }
}
