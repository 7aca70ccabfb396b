use crate::error::{PlayerError, Result};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::Accessor;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read-only access to media metadata.
pub trait TagReader {
    /// "Artist - Title" style description used in logs and history.
    fn description(&self, path: &Path) -> Result<String>;
    fn artist(&self, path: &Path) -> Result<String>;
    fn length_seconds(&self, path: &Path) -> Result<u64>;
    /// Persist any cached changes. Readers without a cache do nothing.
    fn save_changes(&self) -> Result<()> {
        Ok(())
    }
}

/// Metadata extracted from one media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    pub title: String,
    pub artist: String,
    pub length_secs: u64,
}

impl TagInfo {
    /// Read tags from a file with lofty.
    pub fn read(path: &Path) -> Result<Self> {
        let tagged_file = lofty::read_from_path(path)
            .map_err(|e| PlayerError::Media(format!("Failed to read '{}': {}", path.display(), e)))?;

        let length_secs = tagged_file.properties().duration().as_secs();
        let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

        let title = tag
            .and_then(|t| t.title().map(|s| s.to_string()))
            .unwrap_or_else(|| stem_of(path));
        let artist = tag
            .and_then(|t| t.artist().map(|s| s.to_string()))
            .unwrap_or_default();

        Ok(TagInfo {
            title,
            artist,
            length_secs,
        })
    }

    pub fn description(&self) -> String {
        if self.artist.trim().is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Tag reader backed by lofty with an in-memory cache persisted as JSON.
pub struct LoftyTagReader {
    cache_path: Option<PathBuf>,
    cache: RefCell<HashMap<PathBuf, TagInfo>>,
    dirty: Cell<bool>,
}

impl LoftyTagReader {
    pub fn new() -> Self {
        LoftyTagReader {
            cache_path: None,
            cache: RefCell::new(HashMap::new()),
            dirty: Cell::new(false),
        }
    }

    /// Load the cache file if it exists. A corrupt cache is discarded.
    pub fn with_cache(path: &Path) -> Self {
        let mut reader = Self::new();
        reader.cache_path = Some(path.to_path_buf());
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(cache) => reader.cache = RefCell::new(cache),
                    Err(e) => warn!(path = %path.display(), "corrupt tag cache, starting fresh: {}", e),
                },
                Err(e) => warn!(path = %path.display(), "could not read tag cache: {}", e),
            }
        }
        reader
    }

    pub fn cached_count(&self) -> usize {
        self.cache.borrow().len()
    }

    fn lookup(&self, path: &Path) -> Result<TagInfo> {
        if let Some(info) = self.cache.borrow().get(path) {
            return Ok(info.clone());
        }
        debug!(path = %path.display(), "tag cache miss");
        let info = TagInfo::read(path)?;
        self.cache.borrow_mut().insert(path.to_path_buf(), info.clone());
        self.dirty.set(true);
        Ok(info)
    }
}

impl Default for LoftyTagReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TagReader for LoftyTagReader {
    fn description(&self, path: &Path) -> Result<String> {
        Ok(self.lookup(path)?.description())
    }

    fn artist(&self, path: &Path) -> Result<String> {
        Ok(self.lookup(path)?.artist)
    }

    fn length_seconds(&self, path: &Path) -> Result<u64> {
        Ok(self.lookup(path)?.length_secs)
    }

    fn save_changes(&self) -> Result<()> {
        let Some(path) = &self.cache_path else {
            return Ok(());
        };
        if !self.dirty.get() {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&*self.cache.borrow())?;
        fs::write(path, json)?;
        self.dirty.set(false);
        Ok(())
    }
}

/// Fixed tag table, for fixtures and tests. Unknown files get their stem
/// as the description and no artist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticTagReader {
    pub tags: HashMap<PathBuf, TagInfo>,
}

impl StaticTagReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, artist: &str, title: &str, length_secs: u64) {
        self.tags.insert(
            path.into(),
            TagInfo {
                title: title.to_string(),
                artist: artist.to_string(),
                length_secs,
            },
        );
    }
}

impl TagReader for StaticTagReader {
    fn description(&self, path: &Path) -> Result<String> {
        Ok(self
            .tags
            .get(path)
            .map(TagInfo::description)
            .unwrap_or_else(|| stem_of(path)))
    }

    fn artist(&self, path: &Path) -> Result<String> {
        self.tags
            .get(path)
            .map(|t| t.artist.clone())
            .ok_or_else(|| PlayerError::Media(format!("no tags for '{}'", path.display())))
    }

    fn length_seconds(&self, path: &Path) -> Result<u64> {
        self.tags
            .get(path)
            .map(|t| t.length_secs)
            .ok_or_else(|| PlayerError::Media(format!("no tags for '{}'", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_joins_artist_and_title() {
        let info = TagInfo {
            title: "Song".into(),
            artist: "Band".into(),
            length_secs: 200,
        };
        assert_eq!(info.description(), "Band - Song");
        let anonymous = TagInfo {
            artist: String::new(),
            ..info
        };
        assert_eq!(anonymous.description(), "Song");
    }

    #[test]
    fn lofty_reader_rejects_missing_file() {
        let reader = LoftyTagReader::new();
        assert!(reader.artist(Path::new("nonexistent.mp3")).is_err());
        assert_eq!(reader.cached_count(), 0);
    }

    #[test]
    fn cache_is_loaded_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("tags.json");
        let mut table = HashMap::new();
        table.insert(
            PathBuf::from("/music/a.mp3"),
            TagInfo {
                title: "A".into(),
                artist: "Artist".into(),
                length_secs: 120,
            },
        );
        fs::write(&cache_path, serde_json::to_string(&table).unwrap()).unwrap();

        let reader = LoftyTagReader::with_cache(&cache_path);
        assert_eq!(reader.cached_count(), 1);
        // Served from cache, no file on disk needed.
        assert_eq!(reader.artist(Path::new("/music/a.mp3")).unwrap(), "Artist");
        assert_eq!(reader.length_seconds(Path::new("/music/a.mp3")).unwrap(), 120);
        // Nothing changed, so nothing is rewritten.
        fs::remove_file(&cache_path).unwrap();
        reader.save_changes().unwrap();
        assert!(!cache_path.exists());
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("tags.json");
        fs::write(&cache_path, "{not json").unwrap();
        let reader = LoftyTagReader::with_cache(&cache_path);
        assert_eq!(reader.cached_count(), 0);
    }

    #[test]
    fn static_reader_falls_back_to_stem() {
        let mut tags = StaticTagReader::new();
        tags.insert("/m/one.mp3", "Artist", "One", 100);
        assert_eq!(tags.description(Path::new("/m/one.mp3")).unwrap(), "Artist - One");
        assert_eq!(tags.description(Path::new("/m/two.mp3")).unwrap(), "two");
        assert!(tags.artist(Path::new("/m/two.mp3")).is_err());
    }
}
