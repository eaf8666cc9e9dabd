//! Durable queue of threshold-triggered reanalyses.
//!
//! Tasks are written in the same transaction as the vote that crossed the
//! threshold and drained by [`crate::worker::ReanalysisWorker`].

mod retry_policy;

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use time::OffsetDateTime;

use crate::Database;
use crate::models::{AnalysisId, CommentId, TaskId};
use crate::service::timestamp;

pub use retry_policy::RetryPolicy;

/// Lifecycle state of a queued reanalysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    /// The worker's guard declined to act (count fell below threshold).
    Skipped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "skipped" => Ok(TaskStatus::Skipped),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown task status: {other}")),
        }
    }
}

/// A queued reanalysis for one comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReanalysisTask {
    pub id: TaskId,
    pub comment_id: CommentId,
    /// Version the comment was attached to when the task was queued.
    pub analysis_id: AnalysisId,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_attempt_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub result_analysis_id: Option<AnalysisId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub skipped: i64,
    pub failed: i64,
}

const TASK_COLUMNS: &str = "task_id, comment_id, analysis_id, status, attempts, next_attempt_at, \
     last_error, result_analysis_id, created_at, updated_at";

/// Queues a reanalysis for a comment unless one was already queued.
///
/// Runs on the caller's connection so it joins the caller's transaction.
/// Returns `true` when a new task was inserted.
pub(crate) fn enqueue(
    conn: &Connection,
    comment_id: CommentId,
    analysis_id: AnalysisId,
    now: i64,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO reanalysis_tasks
             (comment_id, analysis_id, status, attempts, next_attempt_at, created_at, updated_at)
         VALUES (?1, ?2, 'pending', 0, ?3, ?3, ?3)",
        params![comment_id.get(), analysis_id.get(), now],
    )?;
    Ok(inserted == 1)
}

/// Access to the `reanalysis_tasks` table.
pub struct TaskQueue<'a> {
    conn: &'a Connection,
}

impl<'a> TaskQueue<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Queues a reanalysis outside of a vote. Returns `false` if the
    /// comment already has a task.
    pub fn enqueue(&self, comment_id: CommentId, analysis_id: AnalysisId) -> Result<bool> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Ok(enqueue(self.conn, comment_id, analysis_id, now)?)
    }

    pub fn get(&self, id: TaskId) -> Result<Option<ReanalysisTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM reanalysis_tasks WHERE task_id = ?1");
        let task = self
            .conn
            .query_row(&sql, [id.get()], task_from_row)
            .optional()?;
        Ok(task)
    }

    pub fn get_for_comment(&self, comment_id: CommentId) -> Result<Option<ReanalysisTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM reanalysis_tasks WHERE comment_id = ?1");
        let task = self
            .conn
            .query_row(&sql, [comment_id.get()], task_from_row)
            .optional()?;
        Ok(task)
    }

    /// Pending tasks whose next attempt is due at `now`, oldest first.
    pub fn due_tasks(&self, now: i64, limit: usize) -> Result<Vec<ReanalysisTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM reanalysis_tasks
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY next_attempt_at ASC, task_id ASC
             LIMIT ?2"
        );
        self.query_tasks(&sql, params![now, limit as i64])
    }

    /// Tasks in the given status (all tasks when `None`), newest first.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<ReanalysisTask>> {
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM reanalysis_tasks
                     WHERE status = ?1 ORDER BY task_id DESC LIMIT ?2"
                );
                self.query_tasks(&sql, params![status.as_str(), limit as i64])
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM reanalysis_tasks ORDER BY task_id DESC LIMIT ?1"
                );
                self.query_tasks(&sql, params![limit as i64])
            }
        }
    }

    /// Tasks that exhausted their attempts or failed permanently.
    pub fn failed_tasks(&self, limit: usize) -> Result<Vec<ReanalysisTask>> {
        self.list(Some(TaskStatus::Failed), limit)
    }

    fn query_tasks(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ReanalysisTask>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, task_from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Moves a pending task to running and counts the attempt.
    ///
    /// Returns `false` if another worker claimed it first.
    pub fn claim(&self, id: TaskId, now: i64) -> Result<bool> {
        let claimed = self.conn.execute(
            "UPDATE reanalysis_tasks
             SET status = 'running', attempts = attempts + 1, updated_at = ?2
             WHERE task_id = ?1 AND status = 'pending'",
            params![id.get(), now],
        )?;
        Ok(claimed == 1)
    }

    pub fn mark_done(&self, id: TaskId, result: AnalysisId, now: i64) -> Result<()> {
        self.finish(
            "UPDATE reanalysis_tasks
             SET status = 'done', result_analysis_id = ?2, last_error = NULL, updated_at = ?3
             WHERE task_id = ?1",
            params![id.get(), result.get(), now],
            id,
        )
    }

    pub fn mark_skipped(&self, id: TaskId, reason: &str, now: i64) -> Result<()> {
        self.finish(
            "UPDATE reanalysis_tasks
             SET status = 'skipped', last_error = ?2, updated_at = ?3
             WHERE task_id = ?1",
            params![id.get(), reason, now],
            id,
        )
    }

    /// Puts a task back to pending with a new due time.
    pub fn mark_retry(&self, id: TaskId, next_attempt_at: i64, error: &str, now: i64) -> Result<()> {
        self.finish(
            "UPDATE reanalysis_tasks
             SET status = 'pending', next_attempt_at = ?2, last_error = ?3, updated_at = ?4
             WHERE task_id = ?1",
            params![id.get(), next_attempt_at, error, now],
            id,
        )
    }

    pub fn mark_failed(&self, id: TaskId, error: &str, now: i64) -> Result<()> {
        self.finish(
            "UPDATE reanalysis_tasks
             SET status = 'failed', last_error = ?2, updated_at = ?3
             WHERE task_id = ?1",
            params![id.get(), error, now],
            id,
        )
    }

    fn finish(&self, sql: &str, params: &[&dyn rusqlite::ToSql], id: TaskId) -> Result<()> {
        let updated = self.conn.execute(sql, params)?;
        if updated == 0 {
            return Err(anyhow!("Reanalysis task {id} not found"));
        }
        Ok(())
    }

    /// Resets every failed task to pending with a fresh attempt budget.
    pub fn requeue_failed(&self, now: i64) -> Result<usize> {
        let requeued = self.conn.execute(
            "UPDATE reanalysis_tasks
             SET status = 'pending', attempts = 0, next_attempt_at = ?1, updated_at = ?1
             WHERE status = 'failed'",
            [now],
        )?;
        Ok(requeued)
    }

    /// Returns tasks stuck in running since before `older_than` to pending.
    ///
    /// A worker that dies mid-task leaves its claim behind; this releases it.
    pub fn recover_stale_running(&self, older_than: i64, now: i64) -> Result<usize> {
        let recovered = self.conn.execute(
            "UPDATE reanalysis_tasks
             SET status = 'pending', next_attempt_at = ?2, updated_at = ?2
             WHERE status = 'running' AND updated_at < ?1",
            params![older_than, now],
        )?;
        Ok(recovered)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM reanalysis_tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => stats.pending = count,
                Ok(TaskStatus::Running) => stats.running = count,
                Ok(TaskStatus::Done) => stats.done = count,
                Ok(TaskStatus::Skipped) => stats.skipped = count,
                Ok(TaskStatus::Failed) => stats.failed = count,
                Err(e) => return Err(anyhow!(e)),
            }
        }
        Ok(stats)
    }
}

fn task_from_row(row: &Row) -> rusqlite::Result<ReanalysisTask> {
    let status: String = row.get(3)?;
    let status = status.parse::<TaskStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })?;
    let result: Option<i64> = row.get(7)?;

    Ok(ReanalysisTask {
        id: TaskId::new(row.get(0)?),
        comment_id: CommentId::new(row.get(1)?),
        analysis_id: AnalysisId::new(row.get(2)?),
        status,
        attempts: row.get(4)?,
        next_attempt_at: timestamp(row, 5)?,
        last_error: row.get(6)?,
        result_analysis_id: result.map(AnalysisId::new),
        created_at: timestamp(row, 8)?,
        updated_at: timestamp(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewComment, VoteDirection};
    use crate::service::SongService;

    fn service_with_comment() -> (SongService, CommentId, AnalysisId) {
        let service = SongService::new(Database::in_memory().unwrap());
        let song = service.get_or_create_song("Fake Artist", "Fake Track").unwrap();
        let analysis = service.create_initial_analysis(song.id, "{}").unwrap();
        let comment = service
            .add_comment("Fake Artist", "Fake Track", NewComment::new("insight"))
            .unwrap();
        (service, comment.id, analysis.id)
    }

    #[test]
    fn enqueue_is_once_per_comment() {
        let (service, comment, analysis) = service_with_comment();
        let queue = TaskQueue::new(service.database());

        assert!(queue.enqueue(comment, analysis).unwrap());
        assert!(!queue.enqueue(comment, analysis).unwrap());
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn due_tasks_respects_next_attempt_time() {
        let (service, comment, analysis) = service_with_comment();
        let queue = TaskQueue::new(service.database());
        enqueue(service.database().connection(), comment, analysis, 1_000).unwrap();

        assert!(queue.due_tasks(999, 10).unwrap().is_empty());
        let due = queue.due_tasks(1_000, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].comment_id, comment);
        assert_eq!(due[0].status, TaskStatus::Pending);
        assert_eq!(due[0].attempts, 0);
    }

    #[test]
    fn claim_only_succeeds_once() {
        let (service, comment, analysis) = service_with_comment();
        let queue = TaskQueue::new(service.database());
        queue.enqueue(comment, analysis).unwrap();
        let task = queue.get_for_comment(comment).unwrap().unwrap();

        assert!(queue.claim(task.id, 5).unwrap());
        assert!(!queue.claim(task.id, 5).unwrap());

        let task = queue.get(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn retry_then_fail_records_errors() {
        let (service, comment, analysis) = service_with_comment();
        let queue = TaskQueue::new(service.database());
        queue.enqueue(comment, analysis).unwrap();
        let id = queue.get_for_comment(comment).unwrap().unwrap().id;

        queue.claim(id, 10).unwrap();
        queue.mark_retry(id, 100, "HTTP error: status 503", 10).unwrap();
        let task = queue.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.next_attempt_at.unix_timestamp(), 100);
        assert_eq!(task.last_error.as_deref(), Some("HTTP error: status 503"));

        queue.claim(id, 100).unwrap();
        queue.mark_failed(id, "gave up", 100).unwrap();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(queue.failed_tasks(10).unwrap().len(), 1);
    }

    #[test]
    fn requeue_failed_resets_attempts() {
        let (service, comment, analysis) = service_with_comment();
        let queue = TaskQueue::new(service.database());
        queue.enqueue(comment, analysis).unwrap();
        let id = queue.get_for_comment(comment).unwrap().unwrap().id;
        queue.claim(id, 1).unwrap();
        queue.mark_failed(id, "boom", 1).unwrap();

        assert_eq!(queue.requeue_failed(50).unwrap(), 1);

        let task = queue.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.next_attempt_at.unix_timestamp(), 50);
    }

    #[test]
    fn recover_stale_running_releases_old_claims() {
        let (service, comment, analysis) = service_with_comment();
        let queue = TaskQueue::new(service.database());
        queue.enqueue(comment, analysis).unwrap();
        let id = queue.get_for_comment(comment).unwrap().unwrap().id;
        queue.claim(id, 100).unwrap();

        assert_eq!(queue.recover_stale_running(100, 500).unwrap(), 0);
        assert_eq!(queue.recover_stale_running(101, 500).unwrap(), 1);
        assert_eq!(queue.get(id).unwrap().unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn marking_unknown_task_is_an_error() {
        let service = SongService::new(Database::in_memory().unwrap());
        let queue = TaskQueue::new(service.database());
        assert!(queue.mark_failed(TaskId::new(99), "x", 0).is_err());
    }

    #[test]
    fn tenth_upvote_enqueues_through_vote() {
        let (service, comment, _) = service_with_comment();
        for _ in 0..10 {
            service.vote(comment, VoteDirection::Up).unwrap();
        }

        let queue = TaskQueue::new(service.database());
        let task = queue.get_for_comment(comment).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Done,
            TaskStatus::Skipped,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }
}
