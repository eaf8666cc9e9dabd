//! Errors raised by the versioned-analysis workflow.

use thiserror::Error;

use crate::models::AnalysisId;
use crate::provider::ProviderError;

/// Errors that can occur while producing a new analysis version.
#[derive(Debug, Error)]
pub enum ReanalysisError {
    /// A song, analysis, or comment the workflow needs does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The analysis provider failed or returned an unusable body.
    #[error("Analysis provider failed: {0}")]
    Upstream(#[from] ProviderError),

    /// Reading from or writing to the store failed.
    #[error("Database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// The head version's stored response is not valid JSON.
    #[error("Stored analysis {analysis_id} is not valid JSON: {source}")]
    CorruptAnalysis {
        analysis_id: AnalysisId,
        #[source]
        source: serde_json::Error,
    },

    /// Another reanalysis stored this version number first.
    #[error("Version {version} of analysis chain {original_analysis_id} already exists")]
    VersionConflict {
        original_analysis_id: AnalysisId,
        version: i64,
    },
}

impl ReanalysisError {
    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        ReanalysisError::NotFound { entity, id }
    }

    /// Whether running the same reanalysis again later can succeed.
    ///
    /// A version conflict is retryable: the next attempt reads the new head.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReanalysisError::Upstream(e) => e.is_transient(),
            ReanalysisError::Persistence(_) | ReanalysisError::VersionConflict { .. } => true,
            ReanalysisError::NotFound { .. } | ReanalysisError::CorruptAnalysis { .. } => false,
        }
    }
}
