//! Conversation graph
//!
//! ```text
//! Metadata -> supervisor -+-> Review-Vectorstore -> supervisor -> ...
//!                         +-> (FINISH) generate -> final -> done
//! ```
//!
//! Nodes run strictly one after another for a request. The Supervisor may
//! send the run through retrieval any number of times; `max_steps` bounds
//! the loop.

pub mod events;
pub mod nodes;
pub mod routing;
pub mod state;

pub use events::{EventSink, GraphEvent, NodeOutput};
pub use routing::{
    parse_route_query, route, route_label, Datasource, NodeId, RouteQuery, ROUTING_TABLE,
};
pub use state::ConversationState;

use std::sync::Arc;

use serde::Serialize;
use verta_core::{Answer, Document, LlmClient, LlmConfig, ProductMetadata, Result, Retriever, VertaError};

use crate::llm::create_llm_client;
use crate::prompts::PromptSet;

/// Default bound on node executions per run
pub const DEFAULT_MAX_STEPS: usize = 12;

/// Default number of reviews fetched per retrieval
pub const DEFAULT_RETRIEVAL_K: usize = 4;

/// One language model client per agent
#[derive(Clone)]
pub struct AgentClients {
    pub metadata: Arc<dyn LlmClient>,
    pub supervisor: Arc<dyn LlmClient>,
    pub generate: Arc<dyn LlmClient>,
    pub followup: Arc<dyn LlmClient>,
}

impl AgentClients {
    /// Build clients for the models configured per agent
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            metadata: create_llm_client(config, &config.models.metadata)?,
            supervisor: create_llm_client(config, &config.models.supervisor)?,
            generate: create_llm_client(config, &config.models.base)?,
            followup: create_llm_client(config, &config.models.followup)?,
        })
    }

    /// Use the same client for every agent
    pub fn uniform(client: Arc<dyn LlmClient>) -> Self {
        Self {
            metadata: Arc::clone(&client),
            supervisor: Arc::clone(&client),
            generate: Arc::clone(&client),
            followup: client,
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct GraphOutput {
    pub question: String,
    pub answer: Answer,
    pub followup_questions: Vec<String>,
    pub meta_summary: Document,
    pub documents: Vec<Document>,
    /// Node executions, including the final node
    pub steps: usize,
}

/// The agent state machine
pub struct ConversationGraph {
    agents: AgentClients,
    prompts: Arc<PromptSet>,
    max_steps: usize,
    retrieval_k: usize,
}

impl ConversationGraph {
    pub fn new(agents: AgentClients, prompts: Arc<PromptSet>) -> Self {
        Self {
            agents,
            prompts,
            max_steps: DEFAULT_MAX_STEPS,
            retrieval_k: DEFAULT_RETRIEVAL_K,
        }
    }

    /// Set maximum node executions per run
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set documents fetched per retrieval
    pub fn with_retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = k;
        self
    }

    /// Run to completion without observing events
    pub async fn invoke(
        &self,
        question: &str,
        meta_data: Arc<ProductMetadata>,
        retriever: Arc<dyn Retriever>,
    ) -> Result<GraphOutput> {
        self.run(question, meta_data, retriever, &EventSink::discard())
            .await
    }

    /// Run to completion, reporting tokens and node completions to `sink`.
    ///
    /// State starts empty on every call; nothing carries over between turns.
    #[tracing::instrument(skip_all, fields(question_len = question.len()))]
    pub async fn run(
        &self,
        question: &str,
        meta_data: Arc<ProductMetadata>,
        retriever: Arc<dyn Retriever>,
        sink: &EventSink,
    ) -> Result<GraphOutput> {
        let mut state = ConversationState::new(question, meta_data, retriever);
        let mut node = NodeId::Metadata;
        let mut steps = 0;

        loop {
            steps += 1;
            if steps > self.max_steps {
                return Err(VertaError::RoutingError(format!(
                    "Graph did not finish within {} steps (last node: {node})",
                    self.max_steps
                )));
            }
            tracing::debug!(node = %node, step = steps, "Executing node");

            node = match node {
                NodeId::Metadata => {
                    let summary =
                        nodes::summarize_metadata(self.agents.metadata.as_ref(), &self.prompts, &state)
                            .await;
                    state.meta_summary = Some(summary.clone());
                    sink.completed(node, NodeOutput::MetaSummary(summary)).await?;
                    NodeId::Supervisor
                }
                NodeId::Supervisor => {
                    let datasource =
                        nodes::supervise(self.agents.supervisor.as_ref(), &self.prompts, &state)
                            .await?;
                    state.question_type = Some(datasource);
                    sink.completed(node, NodeOutput::Route { datasource }).await?;
                    route(datasource)?
                }
                NodeId::ReviewVectorstore => {
                    let documents = nodes::retrieve(&mut state, self.retrieval_k).await?;
                    sink.completed(node, NodeOutput::Documents { documents }).await?;
                    NodeId::Supervisor
                }
                NodeId::Generate => {
                    let answer =
                        nodes::generate(self.agents.generate.as_ref(), &self.prompts, &state, sink)
                            .await?;
                    state.answer = Some(answer.clone());
                    sink.completed(node, NodeOutput::Answer(answer)).await?;
                    NodeId::Final
                }
                NodeId::Final => break,
            };
        }

        // Final node: followups, answer passed through unchanged.
        let answer = state
            .answer
            .clone()
            .ok_or_else(|| VertaError::RoutingError("Reached final without an answer".to_string()))?;
        let followup_questions =
            nodes::followup(self.agents.followup.as_ref(), &self.prompts, &state, &answer).await?;
        state.followup_questions = Some(followup_questions.clone());

        sink.completed(
            NodeId::Final,
            NodeOutput::Final {
                answer: answer.clone(),
                followup_questions: followup_questions.clone(),
            },
        )
        .await?;

        tracing::info!(
            steps,
            documents = state.documents().len(),
            followups = followup_questions.len(),
            "Graph run complete"
        );

        Ok(GraphOutput {
            question: state.question().to_string(),
            answer,
            followup_questions,
            meta_summary: state.meta_summary.clone().unwrap_or_default(),
            documents: state.documents().to_vec(),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{numbered_reviews, StubLlm, StubRetriever};

    fn graph(
        metadata: Arc<StubLlm>,
        supervisor: Arc<StubLlm>,
        generate: Arc<StubLlm>,
        followup: Arc<StubLlm>,
    ) -> ConversationGraph {
        ConversationGraph::new(
            AgentClients {
                metadata,
                supervisor,
                generate,
                followup,
            },
            Arc::new(PromptSet::default()),
        )
    }

    #[tokio::test]
    async fn test_full_run_visits_retrieval_then_finishes() {
        let supervisor = StubLlm::sequence(&[
            r#"{"datasource": "Review-Vectorstore"}"#,
            r#"{"datasource": "FINISH"}"#,
        ]);
        let retriever = StubRetriever::new(vec![numbered_reviews(2)]);
        let g = graph(
            StubLlm::replying("A lamp."),
            supervisor.clone(),
            StubLlm::streaming(&["Very ", "bright."]),
            StubLlm::replying("Does it dim?\nHow tall is it?"),
        );

        let out = g
            .invoke("Is it bright?", Arc::new(ProductMetadata::new("B0001")), retriever.clone())
            .await
            .unwrap();

        assert_eq!(out.answer.content, "Very bright.");
        assert_eq!(out.followup_questions, ["Does it dim?", "How tall is it?"]);
        assert_eq!(out.documents.len(), 2);
        assert_eq!(out.meta_summary.page_content, "A lamp.");
        assert_eq!(supervisor.calls(), 2);
        assert_eq!(retriever.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Metadata, supervisor, retrieval, supervisor, generate, final
        assert_eq!(out.steps, 6);
    }

    #[tokio::test]
    async fn test_events_reach_sink_in_order() {
        let g = graph(
            StubLlm::replying("A lamp."),
            StubLlm::replying("FINISH"),
            StubLlm::streaming(&["a", "b"]),
            StubLlm::replying("Q?"),
        );
        let (sink, mut rx) = EventSink::channel(32);

        g.run("Hi", Arc::new(ProductMetadata::default()), StubRetriever::empty(), &sink)
            .await
            .unwrap();
        drop(sink);

        let mut trace = Vec::new();
        while let Some(event) = rx.recv().await {
            trace.push(match event {
                GraphEvent::Token { content, .. } => format!("token:{content}"),
                GraphEvent::NodeCompleted { node, .. } => format!("done:{node}"),
            });
        }
        assert_eq!(
            trace,
            [
                "done:Metadata",
                "done:supervisor",
                "token:a",
                "token:b",
                "done:generate",
                "done:final"
            ]
        );
    }

    #[tokio::test]
    async fn test_metadata_failure_does_not_stop_run() {
        let g = graph(
            StubLlm::failing(),
            StubLlm::replying("FINISH"),
            StubLlm::replying("Answer"),
            StubLlm::replying(""),
        );

        let out = g
            .invoke("Hi", Arc::new(ProductMetadata::default()), StubRetriever::empty())
            .await
            .unwrap();
        assert_eq!(out.meta_summary.page_content, nodes::METADATA_FALLBACK);
        assert_eq!(out.answer.content, "Answer");
    }

    #[tokio::test]
    async fn test_hello_with_no_context_still_answers() {
        let g = graph(
            StubLlm::replying(""),
            StubLlm::sequence(&["Review-Vectorstore", "FINISH"]),
            StubLlm::replying(""),
            StubLlm::replying(""),
        );

        let out = g
            .invoke("Hello", Arc::new(ProductMetadata::default()), StubRetriever::empty())
            .await
            .unwrap();
        assert!(!out.answer.content.is_empty());
        assert!(out.documents.is_empty());
        assert!(out.followup_questions.is_empty());
    }

    #[tokio::test]
    async fn test_supervisor_loop_is_bounded() {
        let g = graph(
            StubLlm::replying("A lamp."),
            StubLlm::replying("Review-Vectorstore"),
            StubLlm::replying("unused"),
            StubLlm::replying("unused"),
        )
        .with_max_steps(5);

        let err = g
            .invoke("Hi", Arc::new(ProductMetadata::default()), StubRetriever::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, VertaError::RoutingError(_)));
    }

    #[tokio::test]
    async fn test_invalid_route_fails_run() {
        let generate = StubLlm::replying("unused");
        let g = graph(
            StubLlm::replying("A lamp."),
            StubLlm::replying(r#"{"datasource": "Web"}"#),
            generate.clone(),
            StubLlm::replying("unused"),
        );

        let err = g
            .invoke("Hi", Arc::new(ProductMetadata::default()), StubRetriever::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, VertaError::RoutingError(_)));
        assert_eq!(generate.calls(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels_run() {
        let followup = StubLlm::replying("Q?");
        let g = graph(
            StubLlm::replying("A lamp."),
            StubLlm::replying("FINISH"),
            StubLlm::streaming(&["a", "b", "c"]),
            followup.clone(),
        );
        let (sink, rx) = EventSink::channel(1);
        drop(rx);

        let err = g
            .run("Hi", Arc::new(ProductMetadata::default()), StubRetriever::empty(), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, VertaError::Cancelled(_)));
        assert_eq!(followup.calls(), 0);
    }
}
