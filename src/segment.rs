use crate::config::PlayerConfig;
use crate::element::{Category, ProgrammingElement};
use crate::error::{PlayerError, Result};
use crate::history::MusicHistory;
use crate::playlist::{MediaWindow, MusicBedRotation, PlaylistBuilder};
use crate::repository::{ScheduleRepository, SegmentRow};
use crate::tags::TagReader;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Segment id that stands for the default music profile.
pub const MUSIC_PROFILE_SEGMENT: i64 = -1;

const PROFILE_SOURCE: &str = "MusicProfile";

/// Where a segment is currently drawing its items from. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PlaybackState {
    Category,
    Alternate,
    #[default]
    DefaultMusic,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Category => write!(f, "category"),
            PlaybackState::Alternate => write!(f, "alternate category"),
            PlaybackState::DefaultMusic => write!(f, "default music"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sequence {
    #[default]
    Random,
    Sequential,
    Specific,
}

impl Sequence {
    pub fn from_str_loose(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(Sequence::Random),
            "sequential" => Ok(Sequence::Sequential),
            "specific" => Ok(Sequence::Specific),
            _ => Err(PlayerError::Config(format!("Unknown sequence '{}'", s))),
        }
    }
}

/// A segment's sub-category: a repository id, or a literal source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubCategory {
    /// Value as stored on the segment.
    pub raw: String,
    pub name: String,
    pub dir: Option<PathBuf>,
}

impl SubCategory {
    fn id(&self) -> Option<i64> {
        self.raw.trim().parse().ok()
    }
}

/// Why the next fetch will leave the current category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertReason {
    MaxItems(u32),
    OutOfItems,
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertReason::MaxItems(n) => write!(f, "only {} items are allowed in this segment", n),
            RevertReason::OutOfItems => write!(f, "run out of items and repeating is not allowed"),
        }
    }
}

/// The resolved format-clock slot currently governing playback.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub loaded: bool,
    pub fc_id: i64,
    pub fc_name: String,
    pub segment_id: i64,
    pub seg_no: i32,

    pub cat: Category,
    pub sub_cat: SubCategory,
    pub alt_cat: Option<Category>,
    pub alt_sub_cat: SubCategory,

    pub sequence: Sequence,
    pub specific_media: Option<PathBuf>,
    pub promos: bool,
    pub music_bed: bool,
    pub music_bed_sub_cat: Option<i64>,
    pub crossfade: bool,
    pub max_age: Option<i64>,
    pub premature: bool,
    pub repeat: bool,
    pub max_items: Option<u32>,

    pub playback_state: PlaybackState,

    pub scheduled_start: NaiveDateTime,
    pub scheduled_end: NaiveDateTime,
    /// When the segment's first item was due to start.
    pub started_at: NaiveDateTime,
    pub length_secs: i64,

    elements: Vec<ProgrammingElement>,
    cursor: usize,
    first_fetched: bool,
    num_played: u32,
    /// Bumped whenever the element list is replaced.
    generation: u64,
    bed_rotation: Option<MusicBedRotation>,
}

impl Segment {
    pub fn elements(&self) -> &[ProgrammingElement] {
        &self.elements
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn num_played(&self) -> u32 {
        self.num_played
    }

    fn set_elements(&mut self, elements: Vec<ProgrammingElement>) {
        self.elements = elements;
        self.cursor = 0;
        self.generation += 1;
    }

    /// Last second that belongs to this segment.
    pub fn end(&self) -> NaiveDateTime {
        self.started_at
            .checked_add_signed(Duration::seconds(self.length_secs - 1))
            .unwrap_or(NaiveDateTime::MAX)
    }

    /// Has the segment's time budget run out by `at`?
    pub fn expired(&self, at: NaiveDateTime) -> bool {
        at > self.end()
    }

    /// Fetch the next element, reverting down the ladder when the list runs out.
    pub fn next_item(&mut self, loader: &SegmentLoader<'_>) -> Result<ProgrammingElement> {
        if !self.loaded {
            return Err(PlayerError::logic("segment is not loaded"));
        }

        if let Some(max) = self.max_items.filter(|max| self.num_played >= *max) {
            info!(max, "already played the maximum number of items for this segment");
            loader.revert_down(self)?;
        } else if self.first_fetched {
            if self.cursor >= self.elements.len() {
                return Err(PlayerError::logic("segment cursor ran past the end"));
            }
            self.cursor += 1;
            if self.cursor == self.elements.len() {
                if self.repeat {
                    info!("ran out of media, going back to the beginning of the playlist");
                    self.cursor = 0;
                } else {
                    info!("ran out of media for this segment (repeat=false)");
                    loader.revert_down(self)?;
                }
            }
        }

        let pe = self
            .elements
            .get(self.cursor)
            .cloned()
            .ok_or_else(|| PlayerError::logic("segment has no next item"))?;
        self.first_fetched = true;
        Ok(pe)
    }

    /// Would the next [`next_item`](Segment::next_item) call leave this category?
    pub fn next_item_will_revert(&self) -> Option<RevertReason> {
        if let Some(max) = self.max_items.filter(|max| self.num_played >= *max) {
            return Some(RevertReason::MaxItems(max));
        }
        if self.first_fetched && self.cursor + 1 >= self.elements.len() && !self.repeat {
            return Some(RevertReason::OutOfItems);
        }
        None
    }

    pub fn count_items_in_category(&self, cat: Category) -> usize {
        self.elements.iter().filter(|pe| pe.category == cat).count()
    }

    /// Distinct known artists among music items not yet fetched.
    pub fn remaining_unique_artists(&self, tags: &dyn TagReader) -> usize {
        let start = if self.first_fetched { self.cursor + 1 } else { self.cursor };
        self.elements
            .iter()
            .skip(start)
            .filter(|pe| pe.is_music())
            .filter_map(|pe| pe.media.path())
            .filter_map(|p| tags.artist(p).ok())
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect::<HashSet<_>>()
            .len()
    }

    /// An item fetched from this segment actually started playing.
    pub fn item_played(&mut self) {
        self.num_played += 1;
    }

    /// Music bed media for the next element, if the segment has one.
    pub fn next_music_bed(&mut self) -> Option<PathBuf> {
        self.bed_rotation.as_mut().map(MusicBedRotation::next_media)
    }

    fn apply_music_profile(&mut self) {
        self.cat = Category::Music;
        self.sequence = Sequence::Random;
        self.promos = true;
        self.repeat = true;
        self.crossfade = true;
        self.music_bed = false;
        self.bed_rotation = None;
        self.max_items = None;
    }
}

/// Combine the hour of `at` with the minutes and seconds of `time`.
fn in_hour_of(at: NaiveDateTime, time: NaiveTime) -> NaiveDateTime {
    at.date()
        .and_hms_opt(at.hour(), time.minute(), time.second())
        .unwrap_or(at)
}

fn end_of_hour(at: NaiveDateTime) -> NaiveDateTime {
    at.date().and_hms_opt(at.hour(), 59, 59).unwrap_or(at)
}

/// Everything a [`SegmentLoader`] needs except the music history, which
/// callers sometimes have to mutate between loads.
#[derive(Clone, Copy)]
pub struct LoadSources<'a> {
    pub repo: &'a dyn ScheduleRepository,
    pub tags: &'a dyn TagReader,
    pub config: &'a PlayerConfig,
    pub today: NaiveDate,
}

impl<'a> LoadSources<'a> {
    pub fn loader<'h>(&self, history: &'h MusicHistory) -> SegmentLoader<'h>
    where
        'a: 'h,
    {
        SegmentLoader {
            repo: self.repo,
            tags: self.tags,
            history,
            config: self.config,
            today: self.today,
        }
    }
}

/// Builds segments and their element lists from the repository.
pub struct SegmentLoader<'a> {
    pub repo: &'a dyn ScheduleRepository,
    pub tags: &'a dyn TagReader,
    pub history: &'a MusicHistory,
    pub config: &'a PlayerConfig,
    pub today: NaiveDate,
}

impl<'a> SegmentLoader<'a> {
    fn builder(&self, window: MediaWindow) -> PlaylistBuilder<'a> {
        PlaylistBuilder::new(
            self.repo,
            self.tags,
            self.history,
            self.config.music_profile_source(),
            window,
            self.config.repeat_prevention_percent,
        )
    }

    /// Load segment `id` as scheduled at `at`. Id -1 loads the music profile.
    ///
    /// A segment that cannot be loaded falls back to the music profile but
    /// keeps its id, so the resolver does not retry it every cycle.
    pub fn load(&self, id: i64, at: NaiveDateTime) -> Result<Segment> {
        if id == MUSIC_PROFILE_SEGMENT {
            info!("setting up music profile");
            return self.music_profile(at);
        }
        match self.load_row(id, at) {
            Ok(segment) => Ok(segment),
            Err(e) => {
                error!(segment = id, "error while loading the segment details: {}", e);
                info!("reverting to a music profile");
                let mut segment = self.music_profile(at)?;
                segment.segment_id = id;
                Ok(segment)
            }
        }
    }

    fn music_profile(&self, at: NaiveDateTime) -> Result<Segment> {
        let mut segment = Segment {
            segment_id: MUSIC_PROFILE_SEGMENT,
            fc_id: -1,
            scheduled_start: at,
            scheduled_end: end_of_hour(at),
            playback_state: PlaybackState::DefaultMusic,
            ..Default::default()
        };
        segment.apply_music_profile();
        let elements = self.profile_elements()?;
        segment.set_elements(elements);
        segment.loaded = true;
        Ok(segment)
    }

    fn profile_elements(&self) -> Result<Vec<ProgrammingElement>> {
        self.builder(MediaWindow::today(self.today))
            .build(PROFILE_SOURCE, Category::Music, true, None)
            .map_err(|e| {
                PlayerError::NothingToPlay(format!("the default music profile failed: {}", e))
            })
    }

    fn sub_category(&self, raw: &str) -> Result<SubCategory> {
        let mut sub = SubCategory {
            raw: raw.trim().to_string(),
            name: raw.trim().to_string(),
            dir: None,
        };
        if let Some(id) = sub.id() {
            sub.dir = self.repo.sub_category_dir(id)?;
            if sub.dir.is_none() {
                return Err(PlayerError::Config(format!(
                    "sub-category {} is not in the repository",
                    id
                )));
            }
        }
        Ok(sub)
    }

    fn load_row(&self, id: i64, at: NaiveDateTime) -> Result<Segment> {
        let row: SegmentRow = self
            .repo
            .segment(id)?
            .ok_or_else(|| PlayerError::Repository(format!("segment {} not found", id)))?;

        let cat = Category::from_str_loose(&row.category)?;
        let sub_cat = self.sub_category(&row.sub_cat)?;
        let alt_cat = if row.alt_category.trim().is_empty() {
            None
        } else {
            Some(Category::from_str_loose(&row.alt_category)?)
        };
        let alt_sub_cat = match alt_cat {
            Some(_) if row.alt_sub_cat.trim().is_empty() => {
                return Err(PlayerError::Config(
                    "alternative category defined but not the alternative sub-category".into(),
                ));
            }
            Some(_) => self.sub_category(&row.alt_sub_cat)?,
            None => SubCategory::default(),
        };

        let music_bed = row.music_bed_sub_cat.is_some();
        if music_bed && cat == Category::Music {
            return Err(PlayerError::Config(
                "music segments aren't allowed to have music beds".into(),
            ));
        }

        let mut segment = Segment {
            fc_id: row.fc_id,
            fc_name: row.fc_name.clone(),
            segment_id: row.id,
            seg_no: row.seg_no,
            cat,
            sub_cat,
            alt_cat,
            alt_sub_cat,
            sequence: Sequence::from_str_loose(&row.sequence)?,
            specific_media: Some(row.specific_media.trim())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            promos: row.promos,
            music_bed,
            music_bed_sub_cat: row.music_bed_sub_cat,
            crossfade: row.crossfading,
            max_age: row.max_age,
            premature: row.premature,
            repeat: row.repeat || cat == Category::Silence,
            max_items: row.max_items,
            playback_state: PlaybackState::Category,
            scheduled_start: in_hour_of(at, row.start),
            scheduled_end: in_hour_of(at, row.end),
            ..Default::default()
        };

        let sub = segment.sub_cat.clone();
        match self.load_elements(&mut segment, cat, &sub) {
            Ok(elements) => segment.set_elements(elements),
            Err(e) => {
                warn!(segment = id, "could not load the segment's category: {}", e);
                self.revert_down(&mut segment)?;
            }
        }
        segment.loaded = true;
        Ok(segment)
    }

    /// Build the element list for one category of `segment`.
    pub fn load_elements(
        &self,
        segment: &mut Segment,
        cat: Category,
        sub_cat: &SubCategory,
    ) -> Result<Vec<ProgrammingElement>> {
        match cat {
            Category::Silence => return Ok(vec![ProgrammingElement::silence()]),
            Category::MusicBed => {
                warn!("this is a music bed segment");
                return Err(PlayerError::Config(
                    "music bed is not a playable segment category".into(),
                ));
            }
            Category::Unknown => return Err(PlayerError::logic("segment category is unknown")),
            _ => {}
        }

        let (source, shuffle) = if segment.sequence == Sequence::Specific {
            let media = segment
                .specific_media
                .clone()
                .filter(|p| p.is_file())
                .ok_or_else(|| {
                    PlayerError::Media(format!(
                        "segment's specific media not found: {}",
                        segment
                            .specific_media
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default()
                    ))
                })?;
            (media.to_string_lossy().to_string(), false)
        } else {
            if sub_cat.raw.is_empty() {
                return Err(PlayerError::Config("sub-category is not set".into()));
            }
            let source = match sub_cat.id() {
                Some(id) => {
                    let dir = self.repo.sub_category_dir(id)?.ok_or_else(|| {
                        PlayerError::Config(format!("sub-category {} is not in the repository", id))
                    })?;
                    if !dir.is_dir() {
                        return Err(PlayerError::Media(format!(
                            "the sub-category directory is missing: {}",
                            dir.display()
                        )));
                    }
                    dir.to_string_lossy().to_string()
                }
                None => {
                    let keyword = sub_cat.raw.eq_ignore_ascii_case("linein")
                        || sub_cat.raw.eq_ignore_ascii_case(PROFILE_SOURCE);
                    if !keyword && !Path::new(&sub_cat.raw).exists() {
                        return Err(PlayerError::Media(format!(
                            "could not find a file or directory called '{}'",
                            sub_cat.raw
                        )));
                    }
                    sub_cat.raw.clone()
                }
            };
            (source, segment.sequence == Sequence::Random)
        };

        if segment.music_bed {
            let bed_sub = segment
                .music_bed_sub_cat
                .ok_or_else(|| PlayerError::Config("music bed sub-category is not set".into()))?;
            segment.bed_rotation = Some(MusicBedRotation::new(self.repo.music_bed_media(bed_sub)?)?);
        }

        let window = MediaWindow {
            today: self.today,
            premature: segment.premature,
            max_age: segment.max_age,
        };
        let elements = self
            .builder(window)
            .build(&source, cat, shuffle, segment.bed_rotation.as_mut())?;
        info!(source = %source, count = elements.len(), "segment source");
        Ok(elements)
    }

    /// Move `segment` one or more steps down the fallback ladder.
    pub fn revert_down(&self, segment: &mut Segment) -> Result<()> {
        loop {
            segment.set_elements(Vec::new());
            match segment.playback_state {
                PlaybackState::Category => {
                    info!("reverting to the alternative category and sub-category");
                    segment.playback_state = PlaybackState::Alternate;
                    segment.music_bed = false;
                    segment.bed_rotation = None;
                    segment.sequence = Sequence::Random;
                    segment.max_items = None;
                    if segment.alt_cat == Some(Category::Music) {
                        segment.repeat = true;
                    }
                    match segment.alt_cat {
                        None => warn!("alternate category was not defined"),
                        Some(cat) => {
                            let sub = segment.alt_sub_cat.clone();
                            match self.load_elements(segment, cat, &sub) {
                                Ok(elements) => {
                                    segment.set_elements(elements);
                                    return Ok(());
                                }
                                Err(e) => warn!("could not load the alternate category: {}", e),
                            }
                        }
                    }
                }
                PlaybackState::Alternate => {
                    info!("reverting to a music profile");
                    segment.playback_state = PlaybackState::DefaultMusic;
                    segment.apply_music_profile();
                    match self.profile_elements() {
                        Ok(elements) => {
                            segment.set_elements(elements);
                            return Ok(());
                        }
                        Err(e) => warn!("{}", e),
                    }
                }
                PlaybackState::DefaultMusic => {
                    return Err(PlayerError::NothingToPlay(
                        "there was a problem with the default music profile".into(),
                    ));
                }
            }
        }
    }
}
