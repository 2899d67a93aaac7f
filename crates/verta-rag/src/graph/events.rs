//! Typed notifications emitted while the graph runs
//!
//! The graph calls the sink at two points: when a node produces a token and
//! when a node completes. Consumers match on the variant instead of filtering
//! a generic event stream by name.

use serde::Serialize;
use tokio::sync::mpsc;
use verta_core::{Answer, Document, Result, VertaError};

use super::routing::{Datasource, NodeId};

/// What a node produced
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutput {
    MetaSummary(Document),
    Route { datasource: Datasource },
    Documents { documents: Vec<Document> },
    Answer(Answer),
    Final {
        answer: Answer,
        followup_questions: Vec<String>,
    },
}

/// Notification from a running graph
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// Incremental model output, in the order the model produced it
    Token { node: NodeId, content: String },
    /// A node finished and its output was applied to the state
    NodeCompleted { node: NodeId, output: NodeOutput },
}

/// Receiving side for graph events.
///
/// A discarding sink accepts everything. A channel sink fails with
/// `Cancelled` once the receiver has been dropped, which stops the run.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<GraphEvent>>,
}

impl EventSink {
    /// Bounded channel pair
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GraphEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self::default()
    }

    pub async fn emit(&self, event: GraphEvent) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| VertaError::Cancelled("event receiver closed".to_string())),
            None => Ok(()),
        }
    }

    pub async fn token(&self, node: NodeId, content: impl Into<String>) -> Result<()> {
        self.emit(GraphEvent::Token {
            node,
            content: content.into(),
        })
        .await
    }

    pub async fn completed(&self, node: NodeId, output: NodeOutput) -> Result<()> {
        self.emit(GraphEvent::NodeCompleted { node, output }).await
    }
}
