//! Architecture Validation Integration Tests
//!
//! The library must be usable without any CLI context: everything here goes
//! through types exported from the `scalpel::` crate root and its public
//! modules. Nothing from main.rs (clap commands, output formatting) is used.

use anyhow::Result;
use scalpel::{
    Analysis, AnalysisId, CommentId, Database, NewComment, QueueStats, REANALYSIS_THRESHOLD,
    RetryPolicy, SongService, TaskQueue, TaskStatus, VoteDirection,
};

fn create_test_service() -> SongService {
    let db = Database::in_memory().expect("failed to create in-memory database");
    SongService::new(db)
}

#[test]
fn test_songservice_instantiates_without_cli_context() {
    let service = create_test_service();
    let conn = service.database().connection();

    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('songs', 'analyses', 'comments', 'analysis_view_logs', 'reanalysis_tasks')",
            [],
            |row| row.get(0),
        )
        .expect("failed to query schema");

    assert_eq!(count, 5, "all workflow tables should exist");
}

#[test]
fn test_full_comment_flow_through_library_api() -> Result<()> {
    let service = create_test_service();
    let song = service.get_or_create_song("Fake Artist", "Fake Track")?;
    let analysis: Analysis = service.create_initial_analysis(song.id, "{}")?;

    let comment = service.add_comment("Fake Artist", "Fake Track", NewComment::new("hi"))?;
    let outcome = service
        .vote(comment.id, VoteDirection::Up)?
        .expect("comment exists");

    assert_eq!(outcome.analysis_id, analysis.id);
    assert_eq!(outcome.upvote_count, 1);
    Ok(())
}

#[test]
fn test_queue_is_reachable_from_crate_root() -> Result<()> {
    let service = create_test_service();
    let queue = TaskQueue::new(service.database());

    assert_eq!(queue.stats()?, QueueStats::default());
    assert!(queue.due_tasks(i64::MAX, 10)?.is_empty());
    assert_eq!(TaskStatus::Failed.to_string(), "failed");
    Ok(())
}

#[test]
fn test_public_constants_and_defaults() {
    assert_eq!(REANALYSIS_THRESHOLD, 10);
    assert_eq!(RetryPolicy::default().max_attempts, 5);
    assert_eq!(AnalysisId::new(3).get(), 3);
    assert_eq!(CommentId::new(4).to_string(), "4");
}
