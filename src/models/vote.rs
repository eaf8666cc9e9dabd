use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{AnalysisId, CommentId};

/// Direction of a single vote on a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// The change applied to `upvote_count`.
    pub fn delta(self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteDirection::Up => write!(f, "up"),
            VoteDirection::Down => write!(f, "down"),
        }
    }
}

impl FromStr for VoteDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(VoteDirection::Up),
            "down" => Ok(VoteDirection::Down),
            other => Err(format!("Invalid vote type: {other}")),
        }
    }
}

/// Result of applying a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteOutcome {
    pub comment_id: CommentId,
    pub upvote_count: i64,
    /// The analysis version the comment belongs to.
    pub analysis_id: AnalysisId,
    /// True when this vote enqueued a reanalysis task.
    pub reanalysis_queued: bool,
}
