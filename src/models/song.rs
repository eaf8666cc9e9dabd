use serde::{Deserialize, Serialize};

use super::SongId;

/// A song, identified by its artist and track title.
///
/// Songs are created the first time an analysis is requested for an
/// artist/track pair and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    pub id: SongId,
    pub artist: String,
    pub track: String,
}

impl Song {
    pub fn new(id: SongId, artist: impl Into<String>, track: impl Into<String>) -> Self {
        Self {
            id,
            artist: artist.into(),
            track: track.into(),
        }
    }

    /// Returns the "Artist - Track" label used in CLI output.
    pub fn label(&self) -> String {
        format!("{} - {}", self.artist, self.track)
    }
}
