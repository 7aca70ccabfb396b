use crate::error::Result;
use crate::repository::ScheduleRepository;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Maximum number of songs kept in memory.
pub const MUSIC_HISTORY_MAX: usize = 1000;

/// A music item that actually started playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayedSong {
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub played_at: Option<NaiveDateTime>,
}

impl PlayedSong {
    pub fn new(path: impl Into<PathBuf>, description: &str, artist: &str) -> Self {
        PlayedSong {
            path: path.into(),
            description: description.to_string(),
            artist: artist.to_string(),
            played_at: None,
        }
    }
}

fn normalize_artist(artist: &str) -> String {
    artist.trim().to_lowercase()
}

/// Recently played music, newest first.
#[derive(Debug, Clone, Default)]
pub struct MusicHistory {
    songs: VecDeque<PlayedSong>,
}

impl MusicHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the in-memory history with what the repository remembers.
    pub fn load(&mut self, repo: &dyn ScheduleRepository) -> Result<()> {
        self.songs = repo.recent_songs(MUSIC_HISTORY_MAX)?.into();
        Ok(())
    }

    /// Record a song that started playing and persist it.
    pub fn song_played(&mut self, repo: &mut dyn ScheduleRepository, song: PlayedSong) -> Result<()> {
        repo.record_song_played(&song)?;
        self.song_played_no_persist(song);
        Ok(())
    }

    /// Record a song in memory only.
    pub fn song_played_no_persist(&mut self, song: PlayedSong) {
        self.songs.push_front(song);
        self.songs.truncate(MUSIC_HISTORY_MAX);
    }

    /// Was `path` among the last `count` songs?
    pub fn played_recently(&self, path: &Path, count: usize) -> bool {
        self.songs.iter().take(count).any(|s| s.path == path)
    }

    /// Did `artist` play within the last `count` songs? Unknown artists never match.
    pub fn artist_played_recently(&self, artist: &str, count: usize) -> bool {
        let artist = normalize_artist(artist);
        if artist.is_empty() {
            return false;
        }
        self.songs
            .iter()
            .take(count)
            .any(|s| normalize_artist(&s.artist) == artist)
    }

    /// Distinct artists, most recent first.
    pub fn recent_artists(&self) -> Vec<String> {
        let mut artists: Vec<String> = Vec::new();
        for song in &self.songs {
            let a = normalize_artist(&song.artist);
            if !artists.contains(&a) {
                artists.push(a);
            }
        }
        artists
    }

    /// Forget everything in memory. The repository copy is untouched.
    pub fn clear(&mut self) {
        self.songs.clear();
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayedSong> {
        self.songs.iter()
    }
}
