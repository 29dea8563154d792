//! Response types and provenance tags

use serde::{Deserialize, Serialize};

/// Completed, non-streaming upstream response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    /// Response carrying only text content.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Reason the model stopped generating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Where a served response came from.
///
/// The boundary layer reports this to clients (e.g. as an `X-Cache`
/// header) so cache, merge and dedup hits are distinguishable from misses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Computed by a fresh upstream execution.
    Upstream,
    /// Shared the outcome of an identical request already in flight.
    Deduplicated,
    /// Served from the deduplicator's short-lived memo of the same request.
    Recent,
    /// Served from a similar request's group response.
    Merged,
    /// Exact match in the response cache.
    ExactHit,
    /// Match in the predictive cache; `confidence` is 1.0 for exact keys.
    PredictiveHit { confidence: f64 },
    /// Not eligible for any tier (streaming); sent straight upstream.
    Passthrough,
}

impl Provenance {
    /// Cache tag value for the boundary layer.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            Provenance::Upstream => "MISS",
            Provenance::Deduplicated => "DEDUPE-JOIN",
            Provenance::Recent => "DEDUPE-HIT",
            Provenance::Merged => "MERGED",
            Provenance::ExactHit => "HIT",
            Provenance::PredictiveHit { .. } => "PREDICTIVE-HIT",
            Provenance::Passthrough => "BYPASS",
        }
    }

    /// Whether the response avoided a new upstream execution.
    pub fn is_hit(&self) -> bool {
        !matches!(self, Provenance::Upstream | Provenance::Passthrough)
    }
}

/// A response together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Served {
    pub response: CompletionResponse,
    pub provenance: Provenance,
}

impl Served {
    pub fn new(response: CompletionResponse, provenance: Provenance) -> Self {
        Self {
            response,
            provenance,
        }
    }
}
