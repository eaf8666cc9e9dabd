//! Threshold-triggered reanalysis of a song's analysis chain.
//!
//! [`ReanalysisManager`] reads the head version of a song, merges a highly
//! upvoted comment into it through the [`AnalysisProvider`], and appends the
//! result as the next version of the chain.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, ffi, params};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::Database;
use crate::error::ReanalysisError;
use crate::models::{Analysis, AnalysisId, AnalysisPayload, CommentId, Song, SongId};
use crate::provider::{AnalysisProvider, ProviderError, ReanalysisRequest};
use crate::service::{ANALYSIS_COLUMNS, analysis_from_row};

/// Upvotes a comment needs before it is merged into the analysis.
pub const REANALYSIS_THRESHOLD: i64 = 10;

/// A version appended by [`ReanalysisManager::trigger_reanalysis`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewVersion {
    pub analysis_id: AnalysisId,
    pub song_id: SongId,
    pub version: i64,
    pub original_analysis_id: AnalysisId,
    /// Copied from the previous head at the time of the call.
    pub view_count: i64,
    pub payload: AnalysisPayload,
}

/// Builder for [`ReanalysisManager`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use scalpel::provider::ProviderClientBuilder;
/// use scalpel::reanalysis::ReanalysisManagerBuilder;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ProviderClientBuilder::new()
///     .base_url("http://localhost:8000")
///     .build()?;
///
/// let manager = ReanalysisManagerBuilder::new()
///     .provider(Arc::new(client))
///     .build()
///     .ok_or("provider not set")?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ReanalysisManagerBuilder {
    provider: Option<Arc<dyn AnalysisProvider>>,
    threshold: Option<i64>,
}

impl ReanalysisManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: Arc<dyn AnalysisProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Overrides [`REANALYSIS_THRESHOLD`] for the execution-time guard.
    pub fn threshold(mut self, threshold: i64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Builds the manager. Returns `None` when no provider was set.
    #[must_use]
    pub fn build(self) -> Option<ReanalysisManager> {
        Some(ReanalysisManager {
            provider: self.provider?,
            threshold: self.threshold.unwrap_or(REANALYSIS_THRESHOLD),
        })
    }
}

/// Produces new versions of a song's analysis from upvoted comments.
pub struct ReanalysisManager {
    provider: Arc<dyn AnalysisProvider>,
    threshold: i64,
}

impl ReanalysisManager {
    #[must_use]
    pub fn new(provider: Arc<dyn AnalysisProvider>) -> Self {
        Self {
            provider,
            threshold: REANALYSIS_THRESHOLD,
        }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Merges a comment into the latest analysis of the song that owns
    /// `old_analysis_id` and stores the result as the next version.
    ///
    /// `old_analysis_id` may be any version of the chain; the head is always
    /// resolved fresh. Returns `Ok(None)` without calling the provider when
    /// the comment's current upvote count is below the threshold.
    ///
    /// The new row carries the head's `original_analysis_id` and a snapshot
    /// of its `view_count`. Earlier versions and the comment are not touched.
    ///
    /// # Errors
    ///
    /// - [`ReanalysisError::NotFound`] if the analysis, its song's head, or
    ///   the comment is missing
    /// - [`ReanalysisError::CorruptAnalysis`] if the head's stored response
    ///   is not JSON
    /// - [`ReanalysisError::Upstream`] if the provider call fails
    /// - [`ReanalysisError::VersionConflict`] if another reanalysis stored
    ///   the same version first
    /// - [`ReanalysisError::Persistence`] on any other store failure
    pub fn trigger_reanalysis(
        &self,
        db: &Database,
        old_analysis_id: AnalysisId,
        comment_id: CommentId,
    ) -> Result<Option<NewVersion>, ReanalysisError> {
        let result = self.run(db.connection(), old_analysis_id, comment_id);
        if let Err(e) = &result {
            error!(
                analysis_id = %old_analysis_id,
                comment_id = %comment_id,
                error = %e,
                "Reanalysis failed"
            );
        }
        result
    }

    fn run(
        &self,
        conn: &Connection,
        old_analysis_id: AnalysisId,
        comment_id: CommentId,
    ) -> Result<Option<NewVersion>, ReanalysisError> {
        let (song, head) = head_of_song_owning(conn, old_analysis_id)?;
        let (comment_text, upvote_count) = comment_for_trigger(conn, comment_id)?;

        if upvote_count < self.threshold {
            info!(
                comment_id = %comment_id,
                upvote_count,
                threshold = self.threshold,
                "Upvote count below threshold, skipping reanalysis"
            );
            return Ok(None);
        }

        let old_analysis = head
            .payload_value()
            .map_err(|source| ReanalysisError::CorruptAnalysis {
                analysis_id: head.id,
                source,
            })?;
        let request = ReanalysisRequest {
            old_analysis,
            new_comment: comment_text,
            artist: song.artist.clone(),
            track: song.track.clone(),
        };

        let mut payload = self.provider.re_analyze(&request)?;
        let version = head.version + 1;
        payload.version = Some(version);
        let ai_response = serde_json::to_string(&payload).map_err(ProviderError::Serialization)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let insert = conn.execute(
            "INSERT INTO analyses (song_id, version, ai_response, view_count, original_analysis_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                song.id.get(),
                version,
                ai_response,
                head.view_count,
                head.original_analysis_id.get(),
                now
            ],
        );
        match insert {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                warn!(
                    original_analysis_id = %head.original_analysis_id,
                    version,
                    "Version already stored by a concurrent reanalysis"
                );
                return Err(ReanalysisError::VersionConflict {
                    original_analysis_id: head.original_analysis_id,
                    version,
                });
            }
            Err(e) => return Err(e.into()),
        }
        let analysis_id = AnalysisId::new(conn.last_insert_rowid());

        info!(
            analysis_id = %analysis_id,
            original_analysis_id = %head.original_analysis_id,
            comment_id = %comment_id,
            version,
            "Stored new analysis version"
        );

        Ok(Some(NewVersion {
            analysis_id,
            song_id: song.id,
            version,
            original_analysis_id: head.original_analysis_id,
            view_count: head.view_count,
            payload,
        }))
    }
}

/// Resolves the song owning `analysis_id` and that song's highest version.
fn head_of_song_owning(
    conn: &Connection,
    analysis_id: AnalysisId,
) -> Result<(Song, Analysis), ReanalysisError> {
    let song_id: i64 = conn
        .query_row(
            "SELECT song_id FROM analyses WHERE analysis_id = ?1",
            [analysis_id.get()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ReanalysisError::not_found("analysis", analysis_id.get()))?;

    let sql = format!(
        "SELECT s.song_id, s.artist, s.track, {ANALYSIS_COLUMNS}
         FROM songs s JOIN analyses a ON a.song_id = s.song_id
         WHERE s.song_id = ?1
         ORDER BY a.version DESC LIMIT 1"
    );
    conn.query_row(&sql, [song_id], |row| {
        let song = Song {
            id: SongId::new(row.get(0)?),
            artist: row.get(1)?,
            track: row.get(2)?,
        };
        Ok((song, analysis_from_row(row, 3)?))
    })
    .optional()?
    .ok_or_else(|| ReanalysisError::not_found("song", song_id))
}

fn comment_for_trigger(
    conn: &Connection,
    comment_id: CommentId,
) -> Result<(String, i64), ReanalysisError> {
    conn.query_row(
        "SELECT text, upvote_count FROM comments WHERE comment_id = ?1",
        [comment_id.get()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| ReanalysisError::not_found("comment", comment_id.get()))
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
