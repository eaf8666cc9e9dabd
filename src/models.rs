mod analysis;
mod comment;
mod ids;
mod song;
mod vote;

pub use analysis::{Analysis, AnalysisPayload, SectionAnalysis};
pub use comment::{Comment, NewComment, nest_replies};
pub use ids::{AnalysisId, CommentId, SongId, TaskId};
pub use song::Song;
pub use vote::{VoteDirection, VoteOutcome};
