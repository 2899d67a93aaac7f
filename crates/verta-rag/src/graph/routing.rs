//! Node identities and Supervisor routing
//!
//! The set of routes is declared once in [`Datasource::ALL`]. The Supervisor
//! prompt lists exactly these labels, the structured-output schema sent with
//! the Supervisor call enumerates them, and [`ROUTING_TABLE`] maps each of
//! them to the node that handles it. Adding a retrieval source means adding a
//! `Datasource` variant, a `NodeId` variant and one table row.

use std::fmt;

use serde::{Deserialize, Serialize};
use verta_core::{ResponseSchema, Result, VertaError};

/// Nodes of the conversation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    #[serde(rename = "Metadata")]
    Metadata,
    #[serde(rename = "supervisor")]
    Supervisor,
    #[serde(rename = "Review-Vectorstore")]
    ReviewVectorstore,
    #[serde(rename = "generate")]
    Generate,
    #[serde(rename = "final")]
    Final,
}

impl NodeId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "Metadata",
            Self::Supervisor => "supervisor",
            Self::ReviewVectorstore => "Review-Vectorstore",
            Self::Generate => "generate",
            Self::Final => "final",
        }
    }

    /// Whether the node contributes documents and hands back to the Supervisor
    pub fn is_retrieval(self) -> bool {
        matches!(self, Self::ReviewVectorstore)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels the Supervisor may choose from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Datasource {
    #[serde(rename = "Review-Vectorstore")]
    ReviewVectorstore,
    #[serde(rename = "FINISH")]
    Finish,
}

impl Datasource {
    /// Every route, retrieval sources first and `FINISH` last
    pub const ALL: &'static [Datasource] = &[Datasource::ReviewVectorstore, Datasource::Finish];

    pub fn label(self) -> &'static str {
        match self {
            Self::ReviewVectorstore => "Review-Vectorstore",
            Self::Finish => "FINISH",
        }
    }

    /// Parse an exact label
    pub fn from_label(label: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.label() == label)
            .ok_or_else(|| VertaError::RoutingError(format!("Unknown route: {label:?}")))
    }

    /// Retrieval sources the Supervisor can delegate to
    pub fn members() -> impl Iterator<Item = Datasource> {
        Self::ALL.iter().copied().filter(|d| *d != Self::Finish)
    }

    /// All labels rendered as a list for prompts, e.g. `["A", "FINISH"]`
    pub fn options_list() -> String {
        let labels: Vec<String> = Self::ALL.iter().map(|d| format!("\"{}\"", d.label())).collect();
        format!("[{}]", labels.join(", "))
    }

    /// JSON Schema of a [`RouteQuery`], restricted to [`Datasource::ALL`]
    pub fn response_schema() -> ResponseSchema {
        let labels: Vec<&str> = Self::ALL.iter().map(|d| d.label()).collect();
        ResponseSchema {
            name: "route_query".to_string(),
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "datasource": {
                        "type": "string",
                        "enum": labels,
                        "description": "Worker that acts next, or FINISH when the gathered documents are enough"
                    }
                },
                "required": ["datasource"],
                "additionalProperties": false
            }),
        }
    }
}

impl fmt::Display for Datasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Supervisor decision as emitted by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteQuery {
    pub datasource: Datasource,
}

/// Where each Supervisor decision leads
pub const ROUTING_TABLE: &[(Datasource, NodeId)] = &[
    (Datasource::ReviewVectorstore, NodeId::ReviewVectorstore),
    (Datasource::Finish, NodeId::Generate),
];

/// Next node for a Supervisor decision
pub fn route(datasource: Datasource) -> Result<NodeId> {
    ROUTING_TABLE
        .iter()
        .find(|(d, _)| *d == datasource)
        .map(|(_, node)| *node)
        .ok_or_else(|| VertaError::RoutingError(format!("No route for {datasource}")))
}

/// Next node for a raw label; anything outside the closed set is an error
pub fn route_label(label: &str) -> Result<NodeId> {
    route(Datasource::from_label(label)?)
}

/// Decode the Supervisor's reply.
///
/// Accepts a JSON object `{"datasource": "..."}`, optionally surrounded by
/// prose or a code fence, or a bare label (quotes allowed). Anything else,
/// including an object with an unknown label, is a `RoutingError`.
pub fn parse_route_query(raw: &str) -> Result<RouteQuery> {
    let trimmed = raw.trim();

    if let Ok(datasource) = Datasource::from_label(trimmed.trim_matches(|c: char| c == '"' || c == '`')) {
        return Ok(RouteQuery { datasource });
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return serde_json::from_str::<RouteQuery>(&trimmed[start..=end]).map_err(|e| {
                VertaError::RoutingError(format!("Invalid supervisor decision {trimmed:?}: {e}"))
            });
        }
    }

    Err(VertaError::RoutingError(format!(
        "Supervisor returned no decision: {trimmed:?}"
    )))
}
