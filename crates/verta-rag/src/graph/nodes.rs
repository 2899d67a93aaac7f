//! Node bodies of the conversation graph
//!
//! Each node reads what it needs from the state and returns its contribution;
//! the runner applies it and emits the completion event.

use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use verta_core::{Answer, Document, LlmClient, Prompt, Result};

use super::events::EventSink;
use super::routing::{parse_route_query, Datasource, NodeId};
use super::state::ConversationState;
use crate::prompts::{format_documents, render, PromptBuilder, PromptSet};

/// Summary used when the metadata agent fails
pub const METADATA_FALLBACK: &str = "Metadata: Unable to generate result";

/// Answer used when the model streams nothing
pub const EMPTY_ANSWER_FALLBACK: &str =
    "I'm sorry, I couldn't come up with an answer to that. Could you try rephrasing your question?";

/// Documents from the end of the list that the followup agent sees
pub const FOLLOWUP_CONTEXT_DOCS: usize = 3;

const NOT_AVAILABLE: &str = "Not available";

/// Summarize the product metadata.
///
/// Never fails: a provider error or an empty reply yields the fallback
/// summary so the rest of the graph still runs.
pub async fn summarize_metadata(
    llm: &dyn LlmClient,
    prompts: &PromptSet,
    state: &ConversationState,
) -> Document {
    let meta = state.meta_data.as_ref();
    let text = |v: &Option<String>| v.clone().unwrap_or_else(|| NOT_AVAILABLE.to_string());

    let average_rating = meta
        .average_rating
        .map(|r| r.to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());
    let rating_number = meta
        .rating_number
        .map(|n| n.to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());
    let details = match meta.details {
        Some(_) => meta.normalized_details(),
        None => NOT_AVAILABLE.to_string(),
    };

    let prompt = Prompt::user(render(
        &prompts.metadata,
        &[
            ("main_category", text(&meta.main_category).as_str()),
            ("title", text(&meta.title).as_str()),
            ("average_rating", average_rating.as_str()),
            ("rating_number", rating_number.as_str()),
            ("features", text(&meta.features).as_str()),
            ("description", text(&meta.description).as_str()),
            ("price", text(&meta.price).as_str()),
            ("store", text(&meta.store).as_str()),
            ("categories", text(&meta.categories).as_str()),
            ("details", details.as_str()),
        ],
    ));

    let content = match llm.generate(&prompt).await {
        Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
        Ok(_) => {
            tracing::warn!(model = llm.model(), "Metadata agent returned an empty summary");
            METADATA_FALLBACK.to_string()
        }
        Err(e) => {
            tracing::warn!(model = llm.model(), error = %e, "Metadata agent failed");
            METADATA_FALLBACK.to_string()
        }
    };

    Document::with_source(content, "Metadata")
}

/// Ask the Supervisor which node acts next.
///
/// The call is constrained to the [`Datasource`] schema; the reply is still
/// decoded strictly since not every provider enforces it.
pub async fn supervise(
    llm: &dyn LlmClient,
    prompts: &PromptSet,
    state: &ConversationState,
) -> Result<Datasource> {
    let members: Vec<&str> = Datasource::members().map(Datasource::label).collect();
    let options = Datasource::options_list();

    let system = render(
        &prompts.supervisor,
        &[("members", members.join(", ").as_str()), ("options", options.as_str())],
    );

    let gathered = if state.documents().is_empty() {
        "Generated Answer from the Agents: none yet".to_string()
    } else {
        format!(
            "Generated Answer from the Agents:\n{}",
            format_documents(state.documents())
        )
    };

    let prompt = PromptBuilder::new()
        .system(system)
        .add_context(gathered)
        .question(state.question())
        .add_instruction(format!(
            "Given the conversation above, who should act next? Or should we FINISH? Select one of: {options}"
        ))
        .add_instruction(r#"Reply with only a JSON object of the form {"datasource": "<choice>"}"#)
        .build();

    let reply = llm
        .generate_structured(&prompt, &Datasource::response_schema())
        .await?;
    let decision = parse_route_query(&reply)?;
    tracing::debug!(datasource = %decision.datasource, "Supervisor decision");
    Ok(decision.datasource)
}

/// Run the retriever and append its results to the state.
///
/// Returns the newly retrieved documents.
pub async fn retrieve(state: &mut ConversationState, k: usize) -> Result<Vec<Document>> {
    let documents = state.retriever.similarity_search(state.question(), k).await?;
    tracing::debug!(retrieved = documents.len(), "Retrieved review documents");
    state.append_documents(documents.iter().cloned());
    Ok(documents)
}

/// Generate the answer, forwarding each streamed chunk to `sink`
pub async fn generate(
    llm: &dyn LlmClient,
    prompts: &PromptSet,
    state: &ConversationState,
    sink: &EventSink,
) -> Result<Answer> {
    let started = Instant::now();

    let system = render(&prompts.generate, &[("product", state.meta_summary_text())]);
    let prompt = PromptBuilder::new()
        .system(system)
        .add_context(format_documents(state.documents()))
        .question(state.question())
        .build();

    let mut stream = llm.generate_stream(&prompt).await?;
    let mut content = String::new();
    let mut token_count = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        content.push_str(&chunk);
        token_count += 1;
        sink.token(NodeId::Generate, chunk).await?;
    }

    if content.trim().is_empty() {
        tracing::warn!(model = llm.model(), "Model produced an empty answer");
        content = EMPTY_ANSWER_FALLBACK.to_string();
    }

    Ok(Answer {
        content,
        token_count,
        elapsed_ms: started.elapsed().as_millis() as u64,
        generated_at: Utc::now(),
    })
}

/// Suggest follow-up questions from the answer and the latest documents
pub async fn followup(
    llm: &dyn LlmClient,
    prompts: &PromptSet,
    state: &ConversationState,
    answer: &Answer,
) -> Result<Vec<String>> {
    let documents = state.documents();
    let recent = &documents[documents.len().saturating_sub(FOLLOWUP_CONTEXT_DOCS)..];

    let prompt = Prompt::user(render(
        &prompts.followup,
        &[
            ("product", state.meta_summary_text()),
            ("question", state.question()),
            ("answer", answer.content.as_str()),
            ("context", format_documents(recent).as_str()),
        ],
    ));

    let reply = llm.generate(&prompt).await?;
    Ok(split_followups(&reply))
}

/// One question per line; escaped newlines count as line breaks
pub fn split_followups(reply: &str) -> Vec<String> {
    reply
        .replace("\\n", "\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
