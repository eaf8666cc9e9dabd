use anyhow::{Result, bail};
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::models::{
    Analysis, AnalysisId, Comment, CommentId, NewComment, Song, SongId, VoteDirection,
    VoteOutcome, nest_replies,
};
use crate::queue;
use crate::reanalysis::REANALYSIS_THRESHOLD;
use crate::Database;

/// Default number of rows returned by the ranking queries.
pub const DEFAULT_RANKING_LIMIT: usize = 9;

/// Window used by [`SongService::trending`].
pub const TRENDING_WINDOW: Duration = Duration::days(7);

pub(crate) const ANALYSIS_COLUMNS: &str = "a.analysis_id, a.song_id, a.version, a.ai_response, \
     a.view_count, a.original_analysis_id, a.created_at";

const COMMENT_COLUMNS: &str = "c.comment_id, c.analysis_id, c.text, c.upvote_count, \
     c.parent_comment_id, c.user_id, c.ip_address, c.created_at, c.updated_at";

/// Cover art of the song's head version, NULL when absent or not a string.
const HEAD_COVER_ART: &str = "(SELECT CASE WHEN json_valid(h.ai_response) THEN
         CASE WHEN json_type(h.ai_response, '$.coverArt') = 'text'
              THEN json_extract(h.ai_response, '$.coverArt') END
       END
     FROM analyses h WHERE h.song_id = s.song_id
     ORDER BY h.version DESC LIMIT 1)";

/// One row of a trending / most-viewed / most-discussed listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SongRanking {
    pub artist: String,
    pub track: String,
    pub cover_art: Option<String>,
    /// Views or comments, depending on the listing.
    pub count: i64,
}

/// Service layer for songs, analysis versions, views, and comments.
///
/// SongService owns a Database instance. It never calls the analysis
/// provider; see [`crate::ingest`] and [`crate::reanalysis`] for that.
///
/// # Examples
///
/// ```
/// use scalpel::{Database, SongService};
///
/// # fn main() -> anyhow::Result<()> {
/// let service = SongService::new(Database::in_memory()?);
/// let song = service.get_or_create_song("Fake Artist", "Fake Track")?;
/// let analysis = service.create_initial_analysis(song.id, r#"{"overallHeadline":"h"}"#)?;
/// assert_eq!(analysis.version, 1);
/// assert_eq!(analysis.original_analysis_id, analysis.id);
/// # Ok(())
/// # }
/// ```
pub struct SongService {
    db: Database,
}

impl SongService {
    /// Creates a new SongService with the given database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns a reference to the underlying database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Returns the song for an artist/track pair, creating it if needed.
    ///
    /// Both names are trimmed before lookup and insert.
    pub fn get_or_create_song(&self, artist: &str, track: &str) -> Result<Song> {
        let (artist, track) = (artist.trim(), track.trim());
        if artist.is_empty() || track.is_empty() {
            bail!("Artist and track cannot be empty");
        }

        if let Some(song) = self.find_song(artist, track)? {
            return Ok(song);
        }

        self.db.connection().execute(
            "INSERT INTO songs (artist, track) VALUES (?1, ?2)",
            (artist, track),
        )?;
        let id = SongId::new(self.db.connection().last_insert_rowid());
        info!(song_id = %id, artist, track, "Created song");

        Ok(Song::new(id, artist, track))
    }

    /// Looks up a song by artist and track (trimmed, exact match).
    pub fn find_song(&self, artist: &str, track: &str) -> Result<Option<Song>> {
        let song = self
            .db
            .connection()
            .query_row(
                "SELECT song_id, artist, track FROM songs WHERE artist = ?1 AND track = ?2",
                (artist.trim(), track.trim()),
                song_from_row,
            )
            .optional()?;
        Ok(song)
    }

    pub fn get_song(&self, id: SongId) -> Result<Option<Song>> {
        let song = self
            .db
            .connection()
            .query_row(
                "SELECT song_id, artist, track FROM songs WHERE song_id = ?1",
                [id.get()],
                song_from_row,
            )
            .optional()?;
        Ok(song)
    }

    /// Stores version 1 of a song's analysis.
    ///
    /// The new row becomes the origin of its chain: its
    /// `original_analysis_id` is its own id. Fails if the song already has
    /// an analysis.
    pub fn create_initial_analysis(&self, song_id: SongId, ai_response: &str) -> Result<Analysis> {
        let tx = self.db.connection().unchecked_transaction()?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM analyses WHERE song_id = ?1)",
            [song_id.get()],
            |row| row.get(0),
        )?;
        if exists {
            bail!("Song {song_id} already has an analysis");
        }

        tx.execute(
            "INSERT INTO analyses (song_id, version, ai_response, view_count, original_analysis_id, created_at)
             VALUES (?1, 1, ?2, 0, NULL, ?3)",
            params![song_id.get(), ai_response, now],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE analyses SET original_analysis_id = ?1 WHERE analysis_id = ?1",
            [id],
        )?;
        tx.commit()?;

        info!(analysis_id = id, song_id = %song_id, "Stored first analysis version");
        self.get_analysis(AnalysisId::new(id))?
            .ok_or_else(|| anyhow::anyhow!("Analysis {id} vanished after insert"))
    }

    pub fn get_analysis(&self, id: AnalysisId) -> Result<Option<Analysis>> {
        let sql = format!("SELECT {ANALYSIS_COLUMNS} FROM analyses a WHERE a.analysis_id = ?1");
        let analysis = self
            .db
            .connection()
            .query_row(&sql, [id.get()], |row| analysis_from_row(row, 0))
            .optional()?;
        Ok(analysis)
    }

    /// Returns the highest version stored for a song.
    pub fn latest_analysis_for_song(&self, song_id: SongId) -> Result<Option<Analysis>> {
        let sql = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses a
             WHERE a.song_id = ?1 ORDER BY a.version DESC LIMIT 1"
        );
        let analysis = self
            .db
            .connection()
            .query_row(&sql, [song_id.get()], |row| analysis_from_row(row, 0))
            .optional()?;
        Ok(analysis)
    }

    /// Song details lookup: the song and its head version.
    pub fn latest_analysis_for(&self, artist: &str, track: &str) -> Result<Option<(Song, Analysis)>> {
        let sql = format!(
            "SELECT s.song_id, s.artist, s.track, {ANALYSIS_COLUMNS}
             FROM songs s JOIN analyses a ON a.song_id = s.song_id
             WHERE s.artist = ?1 AND s.track = ?2
             ORDER BY a.version DESC LIMIT 1"
        );
        let found = self
            .db
            .connection()
            .query_row(&sql, (artist.trim(), track.trim()), |row| {
                Ok((song_from_row(row)?, analysis_from_row(row, 3)?))
            })
            .optional()?;
        Ok(found)
    }

    /// Returns every version of a chain, oldest first.
    pub fn analysis_chain(&self, original_analysis_id: AnalysisId) -> Result<Vec<Analysis>> {
        let sql = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses a
             WHERE a.original_analysis_id = ?1 ORDER BY a.version ASC"
        );
        let conn = self.db.connection();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([original_analysis_id.get()], |row| analysis_from_row(row, 0))?;

        let mut chain = Vec::new();
        for row in rows {
            chain.push(row?);
        }
        Ok(chain)
    }

    /// Records one page view of an analysis version.
    ///
    /// Appends to the view log and bumps the row's own `view_count`.
    /// Returns `false` when the analysis does not exist.
    pub fn record_view(&self, analysis_id: AnalysisId) -> Result<bool> {
        self.record_view_at(analysis_id, OffsetDateTime::now_utc())
    }

    /// [`record_view`](Self::record_view) with an explicit timestamp.
    pub fn record_view_at(&self, analysis_id: AnalysisId, viewed_at: OffsetDateTime) -> Result<bool> {
        let tx = self.db.connection().unchecked_transaction()?;

        let updated = tx.execute(
            "UPDATE analyses SET view_count = view_count + 1 WHERE analysis_id = ?1",
            [analysis_id.get()],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO analysis_view_logs (analysis_id, viewed_at) VALUES (?1, ?2)",
            (analysis_id.get(), viewed_at.unix_timestamp()),
        )?;
        tx.commit()?;

        debug!(analysis_id = %analysis_id, "Recorded view");
        Ok(true)
    }

    /// Total views logged against every version of a chain.
    ///
    /// Computed from the append-only log on each call, unlike the
    /// per-row `view_count` snapshot.
    pub fn chain_view_count(&self, original_analysis_id: AnalysisId) -> Result<i64> {
        let count = self.db.connection().query_row(
            "SELECT COUNT(*) FROM analysis_view_logs v
             JOIN analyses a ON v.analysis_id = a.analysis_id
             WHERE a.original_analysis_id = ?1",
            [original_analysis_id.get()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Songs ranked by views logged in the last seven days.
    pub fn trending(&self, limit: usize) -> Result<Vec<SongRanking>> {
        self.trending_since(OffsetDateTime::now_utc() - TRENDING_WINDOW, limit)
    }

    /// Songs ranked by views logged at or after `since`.
    pub fn trending_since(&self, since: OffsetDateTime, limit: usize) -> Result<Vec<SongRanking>> {
        let sql = format!(
            "SELECT s.artist, s.track, {HEAD_COVER_ART}, COUNT(*) AS total_views
             FROM analysis_view_logs v
             JOIN analyses a ON v.analysis_id = a.analysis_id
             JOIN songs s ON a.song_id = s.song_id
             WHERE v.viewed_at >= ?1
             GROUP BY s.song_id
             ORDER BY total_views DESC, s.song_id ASC
             LIMIT ?2"
        );
        self.rankings(&sql, params![since.unix_timestamp(), limit as i64])
    }

    /// Songs ranked by all views ever logged across their chain.
    pub fn most_viewed(&self, limit: usize) -> Result<Vec<SongRanking>> {
        let sql = format!(
            "SELECT s.artist, s.track, {HEAD_COVER_ART},
                    (SELECT COUNT(*) FROM analysis_view_logs v
                     JOIN analyses a ON v.analysis_id = a.analysis_id
                     WHERE a.song_id = s.song_id) AS total_views
             FROM songs s
             WHERE EXISTS (SELECT 1 FROM analyses a WHERE a.song_id = s.song_id)
             ORDER BY total_views DESC, s.song_id ASC
             LIMIT ?1"
        );
        self.rankings(&sql, params![limit as i64])
    }

    /// Songs ranked by comment count across their chain.
    ///
    /// Ties go to the song with the higher head version.
    pub fn most_discussed(&self, limit: usize) -> Result<Vec<SongRanking>> {
        let sql = format!(
            "SELECT s.artist, s.track, {HEAD_COVER_ART},
                    (SELECT COUNT(*) FROM comments c
                     JOIN analyses a ON c.analysis_id = a.analysis_id
                     WHERE a.song_id = s.song_id) AS comment_count
             FROM songs s
             WHERE EXISTS (SELECT 1 FROM analyses a WHERE a.song_id = s.song_id)
             ORDER BY comment_count DESC,
                      (SELECT MAX(a.version) FROM analyses a WHERE a.song_id = s.song_id) DESC,
                      s.song_id ASC
             LIMIT ?1"
        );
        self.rankings(&sql, params![limit as i64])
    }

    fn rankings(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<SongRanking>> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(SongRanking {
                artist: row.get(0)?,
                track: row.get(1)?,
                cover_art: row.get(2)?,
                count: row.get(3)?,
            })
        })?;

        let mut rankings = Vec::new();
        for row in rows {
            rankings.push(row?);
        }
        Ok(rankings)
    }

    /// Adds a comment or reply to the latest analysis version of a song.
    ///
    /// Text is trimmed and must not be empty. A reply's parent must exist,
    /// belong to the same song, and be a top-level comment.
    pub fn add_comment(&self, artist: &str, track: &str, input: NewComment) -> Result<Comment> {
        let text = input.text.trim();
        if text.is_empty() {
            bail!("Comment text cannot be empty");
        }

        let Some((song, head)) = self.latest_analysis_for(artist, track)? else {
            bail!(
                "No analysis found for {} - {}",
                artist.trim(),
                track.trim()
            );
        };

        if let Some(parent_id) = input.parent_comment_id {
            self.validate_parent(parent_id, song.id)?;
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO comments (analysis_id, text, upvote_count, parent_comment_id, user_id, ip_address, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?6)",
            params![
                head.id.get(),
                text,
                input.parent_comment_id.map(CommentId::get),
                input.user_id,
                input.ip_address,
                now
            ],
        )?;
        let id = CommentId::new(conn.last_insert_rowid());
        info!(comment_id = %id, analysis_id = %head.id, "Added comment");

        self.get_comment(id)?
            .ok_or_else(|| anyhow::anyhow!("Comment {id} vanished after insert"))
    }

    fn validate_parent(&self, parent_id: CommentId, song_id: SongId) -> Result<()> {
        let parent: Option<(Option<i64>, i64)> = self
            .db
            .connection()
            .query_row(
                "SELECT c.parent_comment_id, a.song_id FROM comments c
                 JOIN analyses a ON c.analysis_id = a.analysis_id
                 WHERE c.comment_id = ?1",
                [parent_id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match parent {
            None => bail!("Parent comment {parent_id} not found"),
            Some((Some(_), _)) => bail!("Cannot reply to a reply (comment {parent_id})"),
            Some((None, parent_song)) if parent_song != song_id.get() => {
                bail!("Parent comment {parent_id} belongs to a different song")
            }
            Some(_) => Ok(()),
        }
    }

    pub fn get_comment(&self, id: CommentId) -> Result<Option<Comment>> {
        let sql = format!("SELECT {COMMENT_COLUMNS} FROM comments c WHERE c.comment_id = ?1");
        let comment = self
            .db
            .connection()
            .query_row(&sql, [id.get()], comment_from_row)
            .optional()?;
        Ok(comment)
    }

    /// Lists the comments on every version of a song, replies nested.
    pub fn list_comments(&self, artist: &str, track: &str) -> Result<Vec<Comment>> {
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM comments c
             JOIN analyses a ON c.analysis_id = a.analysis_id
             JOIN songs s ON a.song_id = s.song_id
             WHERE s.artist = ?1 AND s.track = ?2
             ORDER BY c.comment_id ASC"
        );
        let conn = self.db.connection();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map((artist.trim(), track.trim()), comment_from_row)?;

        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(nest_replies(comments))
    }

    /// Deletes a comment written by `user_id`, along with its replies.
    ///
    /// Returns `false` when there is no such comment by that user.
    pub fn delete_comment(&self, id: CommentId, user_id: i64) -> Result<bool> {
        let deleted = self.db.connection().execute(
            "DELETE FROM comments WHERE comment_id = ?1 AND user_id = ?2",
            (id.get(), user_id),
        )?;
        Ok(deleted > 0)
    }

    /// Applies one vote to a comment.
    ///
    /// The new count and, when an upvote lands exactly on
    /// [`REANALYSIS_THRESHOLD`], a reanalysis task are committed together.
    /// A comment is queued at most once. Returns `None` when the comment
    /// does not exist.
    pub fn vote(&self, id: CommentId, direction: VoteDirection) -> Result<Option<VoteOutcome>> {
        let tx = self.db.connection().unchecked_transaction()?;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        let updated: Option<(i64, i64)> = tx
            .query_row(
                "UPDATE comments
                 SET upvote_count = upvote_count + ?1, updated_at = ?2
                 WHERE comment_id = ?3
                 RETURNING upvote_count, analysis_id",
                params![direction.delta(), now, id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((upvote_count, analysis_id)) = updated else {
            return Ok(None);
        };
        let analysis_id = AnalysisId::new(analysis_id);

        let crossed = direction == VoteDirection::Up && upvote_count == REANALYSIS_THRESHOLD;
        let reanalysis_queued = crossed && queue::enqueue(&tx, id, analysis_id, now)?;

        tx.commit()?;

        if reanalysis_queued {
            info!(
                comment_id = %id,
                analysis_id = %analysis_id,
                upvote_count,
                "Comment reached reanalysis threshold, task queued"
            );
        } else {
            debug!(comment_id = %id, upvote_count, %direction, "Vote applied");
        }

        Ok(Some(VoteOutcome {
            comment_id: id,
            upvote_count,
            analysis_id,
            reanalysis_queued,
        }))
    }
}

fn song_from_row(row: &Row) -> rusqlite::Result<Song> {
    Ok(Song {
        id: SongId::new(row.get(0)?),
        artist: row.get(1)?,
        track: row.get(2)?,
    })
}

/// Maps [`ANALYSIS_COLUMNS`] starting at column `start`.
pub(crate) fn analysis_from_row(row: &Row, start: usize) -> rusqlite::Result<Analysis> {
    let id: i64 = row.get(start)?;
    let original: Option<i64> = row.get(start + 5)?;
    Ok(Analysis {
        id: AnalysisId::new(id),
        song_id: SongId::new(row.get(start + 1)?),
        version: row.get(start + 2)?,
        ai_response: row.get(start + 3)?,
        view_count: row.get(start + 4)?,
        original_analysis_id: AnalysisId::new(original.unwrap_or(id)),
        created_at: timestamp(row, start + 6)?,
    })
}

fn comment_from_row(row: &Row) -> rusqlite::Result<Comment> {
    let parent: Option<i64> = row.get(4)?;
    Ok(Comment {
        id: CommentId::new(row.get(0)?),
        analysis_id: AnalysisId::new(row.get(1)?),
        text: row.get(2)?,
        upvote_count: row.get(3)?,
        parent_comment_id: parent.map(CommentId::new),
        user_id: row.get(5)?,
        ip_address: row.get(6)?,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
        replies: Vec::new(),
    })
}

/// Reads a Unix-seconds column as an `OffsetDateTime`.
pub(crate) fn timestamp(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, Box::new(e))
    })
}
