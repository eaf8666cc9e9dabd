/// Lyrics/analysis provider client module.
///
/// This module provides a blocking HTTP client for the external service that
/// searches lyrics, produces first analyses, and merges comments into
/// existing analyses.
mod client;

pub use client::{
    AnalysisProvider, LyricsAnalysis, MIN_SEARCH_QUERY_LEN, ProviderClient,
    ProviderClientBuilder, ProviderError, ReanalysisRequest, SearchResponse, retry_with_backoff,
    validate_search_query,
};
