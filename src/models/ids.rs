use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database row ID.
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the underlying ID value.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

row_id!(
    /// Unique identifier for a song (one per artist/track pair).
    SongId
);

row_id!(
    /// Unique identifier for one analysis version.
    ///
    /// Every version in a chain has its own `AnalysisId`; the chain itself is
    /// identified by the `AnalysisId` of its first version.
    AnalysisId
);

row_id!(
    /// Unique identifier for a comment or reply.
    CommentId
);

row_id!(
    /// Unique identifier for a queued reanalysis task.
    TaskId
);
