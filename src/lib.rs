pub mod config;
pub mod db;
pub mod doctor;
pub mod error;
pub mod ingest;
pub mod models;
pub mod provider;
pub mod queue;
pub mod reanalysis;
pub mod service;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use db::Database;
pub use error::ReanalysisError;
pub use ingest::AnalysisIngestor;
pub use models::{
    Analysis, AnalysisId, AnalysisPayload, Comment, CommentId, NewComment, SectionAnalysis, Song,
    SongId, TaskId, VoteDirection, VoteOutcome,
};
pub use queue::{QueueStats, ReanalysisTask, RetryPolicy, TaskQueue, TaskStatus};
pub use reanalysis::{NewVersion, REANALYSIS_THRESHOLD, ReanalysisManager};
pub use service::{SongRanking, SongService};
pub use worker::{ReanalysisWorker, WorkerReport};
