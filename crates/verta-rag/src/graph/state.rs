//! Per-request conversation state

use std::sync::Arc;

use verta_core::{Answer, Document, ProductMetadata, Retriever};

use super::routing::Datasource;

/// State threaded through the graph for one question.
///
/// Owned by a single request. The question is fixed at construction and
/// `documents` only ever grows.
pub struct ConversationState {
    question: String,
    pub meta_data: Arc<ProductMetadata>,
    pub retriever: Arc<dyn Retriever>,
    pub meta_summary: Option<Document>,
    pub question_type: Option<Datasource>,
    documents: Vec<Document>,
    pub answer: Option<Answer>,
    pub followup_questions: Option<Vec<String>>,
}

impl ConversationState {
    pub fn new(
        question: impl Into<String>,
        meta_data: Arc<ProductMetadata>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        Self {
            question: question.into(),
            meta_data,
            retriever,
            meta_summary: None,
            question_type: None,
            documents: Vec::new(),
            answer: None,
            followup_questions: None,
        }
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    /// Documents gathered so far, in arrival order
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Append retrieved documents after the existing ones
    pub fn append_documents(&mut self, documents: impl IntoIterator<Item = Document>) {
        self.documents.extend(documents);
    }

    /// Summary text, or empty before the Metadata node has run
    pub fn meta_summary_text(&self) -> &str {
        self.meta_summary
            .as_ref()
            .map(|d| d.page_content.as_str())
            .unwrap_or_default()
    }
}
