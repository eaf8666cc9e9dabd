use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::{AnalysisId, SongId};

/// One stored version of a song's analysis.
///
/// Versions sharing an `original_analysis_id` form a chain; the first
/// version's `original_analysis_id` is its own `id`. `ai_response` is kept as
/// the raw stored text because older rows are not guaranteed to hold JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: AnalysisId,
    pub song_id: SongId,
    pub version: i64,
    pub ai_response: String,
    /// Snapshot copied from the previous version when this row was created,
    /// plus views recorded directly against this row since.
    pub view_count: i64,
    pub original_analysis_id: AnalysisId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Analysis {
    /// Parses the stored response as an [`AnalysisPayload`].
    pub fn payload(&self) -> Result<AnalysisPayload, serde_json::Error> {
        serde_json::from_str(&self.ai_response)
    }

    /// Parses the stored response as untyped JSON.
    pub fn payload_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.ai_response)
    }

    /// True when this row is the first version of its chain.
    pub fn is_chain_origin(&self) -> bool {
        self.id == self.original_analysis_id
    }
}

/// Commentary for one section of a song (verse, chorus, bridge...).
///
/// `quotedLines` arrives either as one string or as a list of lines, so it
/// is kept as raw JSON. Unknown fields land in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionAnalysis {
    #[serde(default)]
    pub section_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verse_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_lines: Option<Value>,
    #[serde(default)]
    pub analysis: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SectionAnalysis {
    /// Quoted lines as display text; list entries are joined with " / ".
    pub fn quoted_lines_text(&self) -> Option<String> {
        self.quoted_lines.as_ref().and_then(display_text)
    }

    pub fn verse_summary_text(&self) -> Option<String> {
        self.verse_summary.as_ref().and_then(display_text)
    }
}

fn display_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => {
            let lines: Vec<String> = items.iter().filter_map(display_text).collect();
            (!lines.is_empty()).then(|| lines.join(" / "))
        }
        other => Some(other.to_string()),
    }
}

/// Structured analysis as produced by the analysis provider.
///
/// Fields this crate does not know about are kept in `extra` so that a
/// payload survives a read/modify/write cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    pub overall_headline: String,
    pub introduction: String,
    #[serde(default)]
    pub section_analyses: Vec<SectionAnalysis>,
    pub conclusion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_art: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
