//! Question answering handlers
//!
//! `/dev-invoke` returns the finished answer as JSON. `/dev-stream` answers
//! over server-sent events:
//!
//! ```text
//! data: {"type":"token","content":"..."}      zero or more, generate node only
//! data: {"type":"message","content":{...}}    once, after the final node
//! data: {"type":"error","content":"..."}      only if the run failed mid-stream
//! data: [DONE]
//! ```

use crate::error::AppError;
use crate::feedback::{FeedbackSink, TraceRecord};
use crate::state::AppState;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;
use verta_core::VertaError;
use verta_rag::{CacheKey, EventSink, GraphEvent, GraphOutput, NodeId, NodeOutput};

/// Buffered graph events per streaming request
const EVENT_BUFFER: usize = 64;

/// Question about a product
#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatRequest {
    /// User's question
    #[schema(example = "Is this kettle loud?")]
    pub query: String,
    /// Product parent ASIN
    #[schema(example = "B07XJ8C8F5")]
    pub parent_asin: String,
    pub user_id: String,
    /// Record the run as a Langfuse trace so `/score` can attach to it
    #[serde(default, deserialize_with = "flag")]
    pub log_langfuse: bool,
    /// Send token frames while the answer is generated
    #[serde(default = "default_true", deserialize_with = "flag")]
    #[schema(default = true)]
    pub stream_tokens: bool,
}

fn default_true() -> bool {
    true
}

/// Accept `true`/`false` as well as `1`/`0`
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Answer to a question
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatResponse {
    /// Id to attach feedback to via `/score`
    pub run_id: String,
    pub question: String,
    pub answer: String,
    pub followup_questions: Vec<String>,
}

/// One SSE payload
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
enum StreamFrame<'a> {
    Token(&'a str),
    Message(&'a ChatResponse),
    Error(String),
}

impl StreamFrame<'_> {
    fn into_event(self) -> Event {
        match serde_json::to_string(&self) {
            Ok(json) => Event::default().data(json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode stream frame");
                Event::default().data(r#"{"type":"error","content":"encoding failed"}"#)
            }
        }
    }
}

/// Handle synchronous question requests
#[utoipa::path(
    post,
    path = "/dev-invoke",
    tag = "chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Answer generated", body = ChatResponse),
        (status = 400, description = "Retriever or metadata not initialized", body = crate::error::ApiError),
        (status = 401, description = "Invalid or missing token", body = crate::error::ApiError),
        (status = 500, description = "Agent failure", body = crate::error::ApiError),
        (status = 504, description = "Request timed out", body = crate::error::ApiError)
    )
)]
pub async fn invoke_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let run_id = Uuid::new_v4().to_string();
    tracing::info!(
        %run_id,
        asin = %req.parent_asin,
        user_id = %req.user_id,
        log_langfuse = req.log_langfuse,
        "Invoking agent"
    );

    let output = state
        .chat
        .invoke(&req.query, &req.parent_asin, &req.user_id)
        .await
        .map_err(|e| {
            tracing::error!(%run_id, user_id = %req.user_id, error = %e, "Error invoking agent");
            AppError::from(e)
        })?;

    if req.log_langfuse {
        let session_id = CacheKey::new(&req.user_id, &req.parent_asin)?.to_string();
        let trace = RunTrace {
            run_id: &run_id,
            user_id: &req.user_id,
            parent_asin: &req.parent_asin,
            session_id,
        };
        trace.record(state.feedback.as_ref(), &output).await;
    }

    Ok(Json(ChatResponse {
        run_id,
        question: output.question,
        answer: output.answer.content,
        followup_questions: output.followup_questions,
    }))
}

/// Handle streaming question requests
#[utoipa::path(
    post,
    path = "/dev-stream",
    tag = "chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Event stream of token and message frames ending in [DONE]"),
        (status = 400, description = "Retriever or metadata not initialized", body = crate::error::ApiError),
        (status = 401, description = "Invalid or missing token", body = crate::error::ApiError)
    )
)]
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let run_id = Uuid::new_v4().to_string();
    tracing::info!(
        %run_id,
        asin = %req.parent_asin,
        user_id = %req.user_id,
        stream_tokens = req.stream_tokens,
        "Starting event stream"
    );

    // Resolve before the stream starts so a missing retriever is still a JSON 400.
    let context = state.chat.prepare(&req.parent_asin, &req.user_id).await?;

    let session_id = context.entry.key.to_string();
    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let chat = Arc::clone(&state.chat);
    let question = req.query.clone();
    let task = tokio::spawn(async move { chat.stream(&question, context, sink).await });

    let framer = Framer {
        run_id: run_id.clone(),
        question: req.query,
        stream_tokens: req.stream_tokens,
    };
    let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) })
        .filter_map(move |event| future::ready(framer.frame(event)));

    let feedback = Arc::clone(&state.feedback);
    let log_langfuse = req.log_langfuse;
    let user_id = req.user_id;
    let parent_asin = req.parent_asin;

    let outcome = stream::once(async move {
        match task.await {
            Ok(Ok(output)) => {
                if log_langfuse {
                    let trace = RunTrace {
                        run_id: &run_id,
                        user_id: &user_id,
                        parent_asin: &parent_asin,
                        session_id,
                    };
                    trace.record(feedback.as_ref(), &output).await;
                }
                None
            }
            Ok(Err(VertaError::Cancelled(reason))) => {
                tracing::info!(%run_id, %reason, "Stream cancelled");
                None
            }
            Ok(Err(e)) => {
                tracing::error!(%run_id, error = %e, "Error during event stream");
                Some(StreamFrame::Error(e.to_string()).into_event())
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Stream task aborted");
                Some(StreamFrame::Error("Internal server error".to_string()).into_event())
            }
        }
    })
    .filter_map(future::ready);

    let done = stream::once(future::ready(Event::default().data("[DONE]")));

    let body = frames.chain(outcome).chain(done).map(Ok::<_, Infallible>);

    Ok(Sse::new(body).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// Identity of a run opted into tracing
struct RunTrace<'a> {
    run_id: &'a str,
    user_id: &'a str,
    parent_asin: &'a str,
    session_id: String,
}

impl RunTrace<'_> {
    /// Record the finished run; a tracing backend failure never fails the request
    async fn record(self, sink: &dyn FeedbackSink, output: &GraphOutput) {
        let trace = TraceRecord::answered(
            self.run_id,
            self.user_id,
            self.session_id,
            self.parent_asin,
            &output.question,
            &output.answer.content,
            &output.followup_questions,
        );
        if let Err(e) = sink.record_trace(&trace).await {
            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to record trace");
        }
    }
}

/// Turns graph events into SSE frames for one request
struct Framer {
    run_id: String,
    question: String,
    stream_tokens: bool,
}

impl Framer {
    fn frame(&self, event: GraphEvent) -> Option<Event> {
        match event {
            GraphEvent::Token {
                node: NodeId::Generate,
                content,
            } if self.stream_tokens && !content.is_empty() => {
                Some(StreamFrame::Token(&content).into_event())
            }
            GraphEvent::NodeCompleted {
                node: NodeId::Final,
                output:
                    NodeOutput::Final {
                        answer,
                        followup_questions,
                    },
            } => {
                let message = ChatResponse {
                    run_id: self.run_id.clone(),
                    question: self.question.clone(),
                    answer: answer.content,
                    followup_questions,
                };
                tracing::info!(run_id = %self.run_id, "Yielding final response");
                Some(StreamFrame::Message(&message).into_event())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encoding() {
        let token = serde_json::to_string(&StreamFrame::Token("Hi")).unwrap();
        assert_eq!(token, r#"{"type":"token","content":"Hi"}"#);

        let message = ChatResponse {
            run_id: "r".to_string(),
            question: "q".to_string(),
            answer: "a".to_string(),
            followup_questions: vec![],
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&StreamFrame::Message(&message)).unwrap())
                .unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"]["run_id"], "r");
        assert_eq!(json["content"]["answer"], "a");
    }

    #[test]
    fn test_request_flags_accept_integers() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"query":"q","parent_asin":"B1","user_id":"7","log_langfuse":1,"stream_tokens":0}"#,
        )
        .unwrap();
        assert!(req.log_langfuse);
        assert!(!req.stream_tokens);

        let defaults: ChatRequest =
            serde_json::from_str(r#"{"query":"q","parent_asin":"B1","user_id":"7"}"#).unwrap();
        assert!(!defaults.log_langfuse);
        assert!(defaults.stream_tokens);
    }
}
