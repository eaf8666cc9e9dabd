//! First-analysis retrieval for songs that have never been analyzed.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::models::{Analysis, Song};
use crate::provider::AnalysisProvider;
use crate::service::SongService;

/// Fetches and stores version 1 of a song's analysis on first request.
pub struct AnalysisIngestor {
    provider: Arc<dyn AnalysisProvider>,
}

impl AnalysisIngestor {
    pub fn new(provider: Arc<dyn AnalysisProvider>) -> Self {
        Self { provider }
    }

    /// Returns the song's head version, analyzing the song first if it has
    /// no analysis yet.
    ///
    /// The boolean is `true` when a new analysis was stored.
    pub fn ensure_analysis(
        &self,
        service: &SongService,
        artist: &str,
        track: &str,
    ) -> Result<(Song, Analysis, bool)> {
        if let Some((song, head)) = service.latest_analysis_for(artist, track)? {
            return Ok((song, head, false));
        }

        let fetched = self
            .provider
            .analyze(artist, track)
            .with_context(|| format!("Failed to analyze {} - {}", artist.trim(), track.trim()))?;
        let ai_response = serde_json::to_string(&fetched.analysis)?;

        let song = service.get_or_create_song(artist, track)?;
        let analysis = service.create_initial_analysis(song.id, &ai_response)?;
        info!(
            song_id = %song.id,
            analysis_id = %analysis.id,
            lyrics_len = fetched.lyrics.len(),
            "Stored first analysis"
        );

        Ok((song, analysis, true))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Database;
    use crate::models::AnalysisPayload;
    use crate::provider::{LyricsAnalysis, ProviderError, ReanalysisRequest, SearchResponse};

    struct CountingProvider {
        analyze_calls: Mutex<u32>,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self {
                analyze_calls: Mutex::new(0),
                fail,
            }
        }
    }

    impl AnalysisProvider for CountingProvider {
        fn search(&self, _query: &str) -> Result<SearchResponse, ProviderError> {
            Ok(SearchResponse { results: vec![] })
        }

        fn analyze(&self, _artist: &str, _track: &str) -> Result<LyricsAnalysis, ProviderError> {
            *self.analyze_calls.lock().unwrap() += 1;
            if self.fail {
                return Err(ProviderError::Http { status: 500 });
            }
            Ok(serde_json::from_value(serde_json::json!({
                "analysis": {
                    "overallHeadline": "A song about leaving",
                    "introduction": "i",
                    "sectionAnalyses": [{"sectionName": "Chorus", "analysis": "a", "themes": ["loss"]}],
                    "conclusion": "c",
                    "coverArt": "https://img.example/a.jpg"
                },
                "lyrics": "la la la"
            }))
            .unwrap())
        }

        fn re_analyze(&self, _request: &ReanalysisRequest) -> Result<AnalysisPayload, ProviderError> {
            Err(ProviderError::Http { status: 500 })
        }
    }

    #[test]
    fn first_request_stores_version_one() {
        let service = SongService::new(Database::in_memory().unwrap());
        let provider = Arc::new(CountingProvider::new(false));
        let ingestor = AnalysisIngestor::new(provider.clone());

        let (song, analysis, created) = ingestor
            .ensure_analysis(&service, " Fake Artist ", "Fake Track")
            .unwrap();

        assert!(created);
        assert_eq!(song.artist, "Fake Artist");
        assert_eq!(analysis.version, 1);
        assert!(analysis.is_chain_origin());
        let payload = analysis.payload().unwrap();
        assert_eq!(payload.overall_headline, "A song about leaving");
        assert_eq!(payload.cover_art.as_deref(), Some("https://img.example/a.jpg"));
        assert_eq!(analysis.payload_value().unwrap()["sectionAnalyses"][0]["themes"][0], "loss");
        assert_eq!(*provider.analyze_calls.lock().unwrap(), 1);
    }

    #[test]
    fn existing_head_is_returned_without_calling_provider() {
        let service = SongService::new(Database::in_memory().unwrap());
        let provider = Arc::new(CountingProvider::new(false));
        let ingestor = AnalysisIngestor::new(provider.clone());

        let (_, first, _) = ingestor
            .ensure_analysis(&service, "Fake Artist", "Fake Track")
            .unwrap();
        let (_, again, created) = ingestor
            .ensure_analysis(&service, "Fake Artist", "Fake Track")
            .unwrap();

        assert!(!created);
        assert_eq!(first.id, again.id);
        assert_eq!(*provider.analyze_calls.lock().unwrap(), 1);
    }

    #[test]
    fn provider_failure_creates_no_song() {
        let service = SongService::new(Database::in_memory().unwrap());
        let ingestor = AnalysisIngestor::new(Arc::new(CountingProvider::new(true)));

        let err = ingestor
            .ensure_analysis(&service, "Fake Artist", "Fake Track")
            .unwrap_err();

        assert!(err.to_string().contains("Failed to analyze"));
        assert!(service.find_song("Fake Artist", "Fake Track").unwrap().is_none());
    }
}
