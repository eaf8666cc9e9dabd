use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{AnalysisId, CommentId};

/// A user comment on one analysis version.
///
/// Top-level comments may carry replies; replies never have replies of their
/// own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub analysis_id: AnalysisId,
    pub text: String,
    /// Net votes. Can go negative.
    pub upvote_count: i64,
    pub parent_comment_id: Option<CommentId>,
    pub user_id: Option<i64>,
    pub ip_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Comment>,
}

impl Comment {
    pub fn is_reply(&self) -> bool {
        self.parent_comment_id.is_some()
    }
}

/// Input for creating a comment or reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewComment {
    pub text: String,
    pub parent_comment_id: Option<CommentId>,
    pub user_id: Option<i64>,
    pub ip_address: Option<String>,
}

impl NewComment {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn reply_to(mut self, parent: CommentId) -> Self {
        self.parent_comment_id = Some(parent);
        self
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

/// Nests replies under their parents, preserving input order.
///
/// Replies whose parent is not in `comments` are dropped.
pub fn nest_replies(comments: Vec<Comment>) -> Vec<Comment> {
    let (mut roots, replies): (Vec<Comment>, Vec<Comment>) =
        comments.into_iter().partition(|c| !c.is_reply());

    for reply in replies {
        if let Some(parent) = roots
            .iter_mut()
            .find(|root| Some(root.id) == reply.parent_comment_id)
        {
            parent.replies.push(reply);
        }
    }
    roots
}
