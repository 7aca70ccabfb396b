use crate::element::{Category, ProgrammingElement};
use crate::error::{PlayerError, Result};
use crate::history::MusicHistory;
use crate::segment::{LoadSources, Segment, SegmentLoader};
use crate::tags::TagReader;
use tracing::{debug, info, warn};

/// Lower bound on fetch attempts before giving up.
pub const MIN_ATTEMPTS: usize = 100;

/// Repeat windows derived from one version of a segment's element list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub generation: u64,
    /// A song may not repeat within this many music plays.
    pub song_window: usize,
    /// An artist may not repeat within this many music plays.
    pub artist_window: usize,
    pub attempts: usize,
}

impl Thresholds {
    pub fn for_segment(segment: &Segment, tags: &dyn TagReader, percent: u32) -> Self {
        let music = segment.count_items_in_category(Category::Music);
        Thresholds {
            generation: segment.generation(),
            song_window: (music * percent as usize) / 100,
            artist_window: segment.remaining_unique_artists(tags).saturating_sub(1),
            attempts: (segment.elements().len() * 2).max(MIN_ATTEMPTS),
        }
    }
}

/// Keeps recently heard songs and artists from coming back too soon.
#[derive(Debug, Clone, Copy)]
pub struct AntiRepeatSelector {
    percent: u32,
}

impl AntiRepeatSelector {
    pub fn new(repeat_prevention_percent: u32) -> Self {
        AntiRepeatSelector {
            percent: repeat_prevention_percent.min(100),
        }
    }

    /// Fetch the next acceptable item from `segment`.
    ///
    /// When every attempt is rejected the in-memory history is cleared (the
    /// persisted copy is kept) and `NoAcceptableItem` is returned.
    pub fn next_item(
        &self,
        segment: &mut Segment,
        sources: &LoadSources<'_>,
        history: &mut MusicHistory,
    ) -> Result<ProgrammingElement> {
        let found = {
            let loader = sources.loader(history);
            self.search(segment, &loader)?
        };
        match found {
            Some(pe) => Ok(pe),
            None => {
                warn!("forced to clear the in-memory (not persisted) music history");
                history.clear();
                Err(PlayerError::NoAcceptableItem)
            }
        }
    }

    fn search(&self, segment: &mut Segment, loader: &SegmentLoader<'_>) -> Result<Option<ProgrammingElement>> {
        let mut thresholds = Thresholds::for_segment(segment, loader.tags, self.percent);
        let mut attempts_left = thresholds.attempts;

        while attempts_left > 0 {
            let pe = segment.next_item(loader)?;
            if segment.generation() != thresholds.generation {
                thresholds = Thresholds::for_segment(segment, loader.tags, self.percent);
                attempts_left = thresholds.attempts;
                debug!(?thresholds, "playlist changed, recalculated repeat thresholds");
            }

            match rejection(&pe, &thresholds, loader.history, loader.tags) {
                None => return Ok(Some(pe)),
                Some(reason) => {
                    let descr = pe
                        .media
                        .path()
                        .and_then(|p| loader.tags.description(p).ok())
                        .unwrap_or_default();
                    info!(path = %pe.media, "skipping song, {}: \"{}\"", reason, descr);
                    attempts_left -= 1;
                }
            }
        }
        Ok(None)
    }
}

/// Why `pe` may not play now, or `None` if it may.
fn rejection(
    pe: &ProgrammingElement,
    thresholds: &Thresholds,
    history: &MusicHistory,
    tags: &dyn TagReader,
) -> Option<&'static str> {
    if !pe.is_music() || pe.is_line_in() {
        return None;
    }
    let path = pe.media.path()?;
    if history.played_recently(path, thresholds.song_window) {
        return Some("it was played recently");
    }
    // Unknown artists never count against a song.
    if let Ok(artist) = tags.artist(path) {
        if history.artist_played_recently(&artist, thresholds.artist_window) {
            return Some("the artist was heard recently");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlayerConfig;
    use crate::history::PlayedSong;
    use crate::repository::{JsonScheduleStore, ScheduleTables, SegmentRow};
    use crate::tags::StaticTagReader;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        music: PathBuf,
        store: JsonScheduleStore,
        tags: StaticTagReader,
        config: PlayerConfig,
    }

    impl Fixture {
        fn sources(&self) -> LoadSources<'_> {
            LoadSources {
                repo: &self.store,
                tags: &self.tags,
                config: &self.config,
                today: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            }
        }

        fn song(&self, n: usize) -> PathBuf {
            self.music.join(format!("song{:02}.mp3", n))
        }

        fn load(&self, history: &MusicHistory) -> Segment {
            let at = NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap();
            self.sources().loader(history).load(1, at).unwrap()
        }
    }

    fn make_fixture(songs: usize, category: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(&music).unwrap();
        for n in 1..=songs {
            fs::write(music.join(format!("song{:02}.mp3", n)), b"ID3").unwrap();
        }
        let mut config = PlayerConfig::default();
        config.dirs.mp3 = music.clone();
        let mut store = JsonScheduleStore::new(ScheduleTables::default());
        store.tables.segments.push(SegmentRow {
            id: 1,
            fc_id: 1,
            fc_name: String::new(),
            seg_no: 1,
            start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(0, 59, 59).unwrap(),
            category: category.into(),
            sub_cat: music.to_string_lossy().to_string(),
            alt_category: String::new(),
            alt_sub_cat: String::new(),
            sequence: "sequential".into(),
            specific_media: String::new(),
            promos: false,
            music_bed_sub_cat: None,
            crossfading: false,
            max_age: None,
            premature: false,
            repeat: true,
            max_items: None,
        });
        Fixture {
            _dir: dir,
            music,
            store,
            tags: StaticTagReader::new(),
            config,
        }
    }

    fn played(history: &mut MusicHistory, path: &PathBuf, artist: &str) {
        history.song_played_no_persist(PlayedSong::new(path.clone(), "", artist));
    }

    #[test]
    fn recently_played_song_is_skipped() {
        let f = make_fixture(4, "music");
        let mut history = MusicHistory::new();
        played(&mut history, &f.song(1), "");
        let mut seg = f.load(&history);

        let selector = AntiRepeatSelector::new(50);
        let pe = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap();
        assert_eq!(pe.media.path(), Some(f.song(2).as_path()));
    }

    #[test]
    fn song_outside_window_may_repeat() {
        let f = make_fixture(4, "music");
        let mut history = MusicHistory::new();
        played(&mut history, &f.song(1), "");
        played(&mut history, &f.song(3), "");
        played(&mut history, &f.song(4), "");
        let mut seg = f.load(&history);

        // Window is 4 * 50 / 100 = 2 songs: song01 is third back.
        let selector = AntiRepeatSelector::new(50);
        let pe = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap();
        assert_eq!(pe.media.path(), Some(f.song(1).as_path()));
    }

    #[test]
    fn recent_artist_is_skipped() {
        let mut f = make_fixture(4, "music");
        for (n, artist) in [(1, "A"), (2, "A"), (3, "B"), (4, "C")] {
            f.tags.insert(f.song(n), artist, &format!("t{}", n), 100);
        }
        let mut history = MusicHistory::new();
        played(&mut history, &PathBuf::from("/elsewhere/x.mp3"), "a");
        let mut seg = f.load(&history);

        let selector = AntiRepeatSelector::new(0);
        let pe = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap();
        assert_eq!(f.tags.artist(pe.media.path().unwrap()).unwrap(), "B");
    }

    #[test]
    fn unknown_artist_is_never_rejected() {
        let f = make_fixture(2, "music");
        let mut history = MusicHistory::new();
        played(&mut history, &PathBuf::from("/elsewhere/x.mp3"), "");
        let mut seg = f.load(&history);
        let selector = AntiRepeatSelector::new(0);
        let pe = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap();
        assert_eq!(pe.media.path(), Some(f.song(1).as_path()));
    }

    #[test]
    fn non_music_items_are_exempt() {
        let f = make_fixture(1, "news");
        let mut history = MusicHistory::new();
        played(&mut history, &f.song(1), "");
        let mut seg = f.load(&history);
        let selector = AntiRepeatSelector::new(100);
        let pe = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap();
        assert_eq!(pe.category, Category::News);
    }

    #[test]
    fn exhausted_search_clears_history() {
        let f = make_fixture(1, "music");
        let mut history = MusicHistory::new();
        played(&mut history, &f.song(1), "");
        let mut seg = f.load(&history);

        let selector = AntiRepeatSelector::new(100);
        let err = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap_err();
        assert!(matches!(err, PlayerError::NoAcceptableItem));
        assert!(history.is_empty());

        // With history gone the song is acceptable again.
        assert!(selector.next_item(&mut seg, &f.sources(), &mut history).is_ok());
    }

    #[test]
    fn consecutive_draws_do_not_repeat_within_window() {
        let f = make_fixture(8, "music");
        let mut history = MusicHistory::new();
        let mut seg = f.load(&history);
        let selector = AntiRepeatSelector::new(75);
        let window = 8 * 75 / 100;

        let mut drawn: Vec<PathBuf> = Vec::new();
        for _ in 0..24 {
            let pe = selector.next_item(&mut seg, &f.sources(), &mut history).unwrap();
            let path = pe.media.path().unwrap().to_path_buf();
            assert!(!drawn.iter().rev().take(window).any(|p| *p == path));
            played(&mut history, &path, "");
            drawn.push(path);
        }
    }

    #[test]
    fn thresholds_follow_the_playlist() {
        let mut f = make_fixture(10, "music");
        for n in 1..=10 {
            let artist = if n % 2 == 0 { "Even" } else { "Odd" };
            f.tags.insert(f.song(n), artist, &format!("t{}", n), 100);
        }
        let history = MusicHistory::new();
        let seg = f.load(&history);
        let t = Thresholds::for_segment(&seg, &f.tags, 75);
        assert_eq!(t.song_window, 7);
        assert_eq!(t.artist_window, 1);
        assert_eq!(t.attempts, MIN_ATTEMPTS);
        assert_eq!(t.generation, seg.generation());
    }
}
