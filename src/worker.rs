//! Background processing of queued reanalyses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::Database;
use crate::queue::{ReanalysisTask, RetryPolicy, TaskQueue};
use crate::reanalysis::ReanalysisManager;

/// Tasks handled per pass of [`ReanalysisWorker::run_once`].
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// A task left in `running` longer than this is assumed abandoned.
pub const STALE_RUNNING_SECS: i64 = 600;

/// Outcome counts for one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub recovered: usize,
    pub processed: usize,
    pub done: usize,
    pub skipped: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Drains the reanalysis queue through a [`ReanalysisManager`].
pub struct ReanalysisWorker {
    manager: ReanalysisManager,
    policy: RetryPolicy,
    batch_size: usize,
}

impl ReanalysisWorker {
    pub fn new(manager: ReanalysisManager, policy: RetryPolicy) -> Self {
        Self {
            manager,
            policy,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Processes every task due at `now` (up to the batch size).
    ///
    /// Each task ends as `done`, `skipped`, back in `pending` with a later
    /// due time, or `failed`. Errors are returned only when the queue
    /// itself cannot be read or updated.
    pub fn run_once(&self, db: &Database, now: i64) -> Result<WorkerReport> {
        let queue = TaskQueue::new(db);
        let mut report = WorkerReport {
            recovered: queue.recover_stale_running(now - STALE_RUNNING_SECS, now)?,
            ..WorkerReport::default()
        };
        if report.recovered > 0 {
            warn!(count = report.recovered, "Recovered abandoned reanalysis tasks");
        }

        for task in queue.due_tasks(now, self.batch_size)? {
            if !queue.claim(task.id, now)? {
                debug!(task_id = %task.id, "Task claimed by another worker");
                continue;
            }
            report.processed += 1;
            self.process(db, &queue, &task, now, &mut report)?;
        }

        Ok(report)
    }

    fn process(
        &self,
        db: &Database,
        queue: &TaskQueue<'_>,
        task: &ReanalysisTask,
        now: i64,
        report: &mut WorkerReport,
    ) -> Result<()> {
        let attempts = task.attempts + 1;

        match self
            .manager
            .trigger_reanalysis(db, task.analysis_id, task.comment_id)
        {
            Ok(Some(version)) => {
                queue.mark_done(task.id, version.analysis_id, now)?;
                report.done += 1;
                info!(
                    task_id = %task.id,
                    analysis_id = %version.analysis_id,
                    version = version.version,
                    "Reanalysis task done"
                );
            }
            Ok(None) => {
                queue.mark_skipped(task.id, "Upvote count below threshold", now)?;
                report.skipped += 1;
            }
            Err(e) if self.policy.should_retry(&e, attempts) => {
                let next_attempt_at = self.policy.next_attempt_at(now, attempts);
                queue.mark_retry(task.id, next_attempt_at, &e.to_string(), now)?;
                report.retried += 1;
                warn!(
                    task_id = %task.id,
                    attempts,
                    next_attempt_at,
                    error = %e,
                    "Reanalysis task will be retried"
                );
            }
            Err(e) => {
                queue.mark_failed(task.id, &e.to_string(), now)?;
                report.failed += 1;
                error!(task_id = %task.id, attempts, error = %e, "Reanalysis task failed");
            }
        }
        Ok(())
    }

    /// Polls the queue until `stop` is raised.
    ///
    /// A pass that fails to touch the queue is logged and retried on the
    /// next poll.
    pub fn run(&self, db: &Database, poll_interval: Duration, stop: &AtomicBool) {
        info!(poll_secs = poll_interval.as_secs(), "Reanalysis worker started");

        while !stop.load(Ordering::SeqCst) {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            match self.run_once(db, now) {
                Ok(report) if report.processed > 0 => {
                    info!(
                        done = report.done,
                        skipped = report.skipped,
                        retried = report.retried,
                        failed = report.failed,
                        "Worker pass finished"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Worker pass failed"),
            }
            sleep_unless_stopped(poll_interval, stop);
        }

        info!("Reanalysis worker stopped");
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && !stop.load(Ordering::SeqCst) {
        let nap = step.min(total - slept);
        thread::sleep(nap);
        slept += nap;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::models::{AnalysisId, AnalysisPayload, CommentId, NewComment, VoteDirection};
    use crate::provider::{
        AnalysisProvider, LyricsAnalysis, ProviderError, ReanalysisRequest, SearchResponse,
    };
    use crate::queue::TaskStatus;
    use crate::service::SongService;

    fn payload() -> AnalysisPayload {
        serde_json::from_str(
            r#"{"overallHeadline":"merged","introduction":"i","sectionAnalyses":[],"conclusion":"c"}"#,
        )
        .unwrap()
    }

    /// Answers reanalysis calls from a script, then succeeds.
    struct ScriptedProvider {
        script: Mutex<VecDeque<ProviderError>>,
        calls: Mutex<usize>,
        stop_after_call: Option<Arc<AtomicBool>>,
    }

    impl ScriptedProvider {
        fn new(errors: Vec<ProviderError>) -> Self {
            Self {
                script: Mutex::new(errors.into()),
                calls: Mutex::new(0),
                stop_after_call: None,
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl AnalysisProvider for ScriptedProvider {
        fn search(&self, _query: &str) -> Result<SearchResponse, ProviderError> {
            Ok(SearchResponse { results: vec![] })
        }

        fn analyze(&self, _artist: &str, _track: &str) -> Result<LyricsAnalysis, ProviderError> {
            Err(ProviderError::Http { status: 404 })
        }

        fn re_analyze(&self, _request: &ReanalysisRequest) -> Result<AnalysisPayload, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(stop) = &self.stop_after_call {
                stop.store(true, Ordering::SeqCst);
            }
            match self.script.lock().unwrap().pop_front() {
                Some(e) => Err(e),
                None => Ok(payload()),
            }
        }
    }

    struct Setup {
        service: SongService,
        original: AnalysisId,
        comment: CommentId,
    }

    fn setup_with(ai_response: &str) -> Setup {
        let service = SongService::new(Database::in_memory().unwrap());
        let song = service.get_or_create_song("Fake Artist", "Fake Track").unwrap();
        let original = service.create_initial_analysis(song.id, ai_response).unwrap().id;
        let comment = service
            .add_comment("Fake Artist", "Fake Track", NewComment::new("great insight"))
            .unwrap()
            .id;
        for _ in 0..10 {
            service.vote(comment, VoteDirection::Up).unwrap();
        }
        Setup {
            service,
            original,
            comment,
        }
    }

    fn setup() -> Setup {
        setup_with(r#"{"overallHeadline":"h","introduction":"i","conclusion":"c"}"#)
    }

    fn later() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp() + 1
    }

    fn task(s: &Setup) -> ReanalysisTask {
        TaskQueue::new(s.service.database())
            .get_for_comment(s.comment)
            .unwrap()
            .unwrap()
    }

    fn worker(provider: Arc<ScriptedProvider>, policy: RetryPolicy) -> ReanalysisWorker {
        ReanalysisWorker::new(ReanalysisManager::new(provider), policy)
    }

    #[test]
    fn successful_task_is_marked_done() {
        let s = setup();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let worker = worker(provider.clone(), RetryPolicy::default());

        let report = worker.run_once(s.service.database(), later()).unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.done, 1);
        let task = task(&s);
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempts, 1);
        let head = s.service.get_analysis(task.result_analysis_id.unwrap()).unwrap().unwrap();
        assert_eq!(head.version, 2);
        assert_eq!(head.original_analysis_id, s.original);

        // Nothing left to do on the next pass.
        let report = worker.run_once(s.service.database(), later()).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn guard_abort_marks_task_skipped() {
        let s = setup();
        s.service.vote(s.comment, VoteDirection::Down).unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let worker = worker(provider.clone(), RetryPolicy::default());

        let report = worker.run_once(s.service.database(), later()).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(task(&s).status, TaskStatus::Skipped);
        assert_eq!(provider.calls(), 0);
        assert_eq!(s.service.analysis_chain(s.original).unwrap().len(), 1);
    }

    #[test]
    fn transient_failure_is_retried_after_backoff() {
        let s = setup();
        let provider = Arc::new(ScriptedProvider::new(vec![ProviderError::Http { status: 503 }]));
        let worker = worker(provider.clone(), RetryPolicy::default());
        let now = later();

        let report = worker.run_once(s.service.database(), now).unwrap();
        assert_eq!(report.retried, 1);
        let pending = task(&s);
        assert_eq!(pending.status, TaskStatus::Pending);
        assert_eq!(pending.attempts, 1);
        assert_eq!(pending.next_attempt_at.unix_timestamp(), now + 30);
        assert!(pending.last_error.unwrap().contains("503"));

        // Not due yet.
        let report = worker.run_once(s.service.database(), now + 29).unwrap();
        assert_eq!(report.processed, 0);

        let report = worker.run_once(s.service.database(), now + 30).unwrap();
        assert_eq!(report.done, 1);
        let done = task(&s);
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.attempts, 2);
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let s = setup();
        let provider = Arc::new(ScriptedProvider::new(vec![
            ProviderError::Http { status: 502 },
            ProviderError::Http { status: 502 },
        ]));
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff_secs: 1,
            ..RetryPolicy::default()
        };
        let worker = worker(provider, policy);
        let now = later();

        assert_eq!(worker.run_once(s.service.database(), now).unwrap().retried, 1);
        assert_eq!(worker.run_once(s.service.database(), now + 1).unwrap().failed, 1);

        let failed = task(&s);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(failed.last_error.is_some());
    }

    #[test]
    fn permanent_upstream_error_fails_immediately() {
        let s = setup();
        let provider = Arc::new(ScriptedProvider::new(vec![ProviderError::Http { status: 422 }]));
        let worker = worker(provider, RetryPolicy::default());

        let report = worker.run_once(s.service.database(), later()).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(task(&s).status, TaskStatus::Failed);
    }

    #[test]
    fn corrupt_analysis_fails_without_retry() {
        let s = setup_with("<html>not json</html>");
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let worker = worker(provider.clone(), RetryPolicy::default());

        let report = worker.run_once(s.service.database(), later()).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(provider.calls(), 0);
        assert!(task(&s).last_error.unwrap().contains("not valid JSON"));
    }

    #[test]
    fn abandoned_running_task_is_recovered() {
        let s = setup();
        let queue = TaskQueue::new(s.service.database());
        let id = task(&s).id;
        let now = later();
        queue.claim(id, now - STALE_RUNNING_SECS - 1).unwrap();

        let worker = worker(Arc::new(ScriptedProvider::new(vec![])), RetryPolicy::default());
        let report = worker.run_once(s.service.database(), now).unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(report.done, 1);
        assert_eq!(task(&s).attempts, 2);
    }

    #[test]
    fn run_returns_once_stop_flag_is_raised() {
        let s = setup();
        let stop = Arc::new(AtomicBool::new(false));
        let provider = Arc::new(ScriptedProvider {
            stop_after_call: Some(stop.clone()),
            ..ScriptedProvider::new(vec![])
        });
        let worker = worker(provider.clone(), RetryPolicy::default());

        worker.run(s.service.database(), Duration::from_millis(10), &stop);

        assert_eq!(provider.calls(), 1);
        assert_eq!(task(&s).status, TaskStatus::Done);
    }

    #[test]
    fn batch_size_is_never_zero() {
        let worker = worker(Arc::new(ScriptedProvider::new(vec![])), RetryPolicy::default())
            .with_batch_size(0);
        assert_eq!(worker.batch_size, 1);
    }
}
