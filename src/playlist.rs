use crate::element::{Category, MediaRef, MusicBed, ProgrammingElement};
use crate::error::{PlayerError, Result};
use crate::history::{MusicHistory, PlayedSong};
use crate::repository::{MediaRow, ScheduleRepository};
use crate::tags::TagReader;
use chrono::{Days, NaiveDate};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Playlist-of-playlist nesting allowed before recursion stops.
pub const MAX_SOURCE_DEPTH: u32 = 3;
/// Number of shuffle passes over a new playlist.
pub const SHUFFLE_PASSES: usize = 10;
/// Music playlists smaller than this get a low-inventory warning.
pub const LOW_INVENTORY_WARNING: usize = 10;

const PROFILE_KEYWORD: &str = "MusicProfile";

/// Relevance rules for media registered under format-clock sub-categories.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaWindow {
    pub today: NaiveDate,
    /// Ignore "relevant from" dates in the future.
    pub premature: bool,
    /// Maximum age in days, counted from "relevant from".
    pub max_age: Option<i64>,
}

impl MediaWindow {
    pub fn today(today: NaiveDate) -> Self {
        MediaWindow {
            today,
            premature: false,
            max_age: None,
        }
    }
}

/// Is this media row playable today?
///
/// All bounds are inclusive. A missing "relevant until" never expires and a
/// missing "relevant from" is always current. With `max_age = Some(d)` the
/// item is playable on its `relevant_from` day and the `d - 1` days after it.
/// Non-positive ages are ignored.
pub fn media_is_relevant(row: &MediaRow, window: &MediaWindow) -> bool {
    let today = window.today;
    if row.relevant_until.is_some_and(|until| until < today) {
        return false;
    }
    if !window.premature && row.relevant_from.is_some_and(|from| from > today) {
        return false;
    }
    if let (Some(age), Some(from)) = (window.max_age, row.relevant_from) {
        if age > 0 {
            let last_day = from.checked_add_days(Days::new((age - 1) as u64));
            if last_day.is_some_and(|last| last < today) {
                return false;
            }
        }
    }
    true
}

/// Rotating, shuffled list of music-bed media for one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MusicBedRotation {
    media: Vec<PathBuf>,
    cursor: usize,
}

impl MusicBedRotation {
    pub fn new(mut media: Vec<PathBuf>) -> Result<Self> {
        media.retain(|p| {
            let exists = p.is_file();
            if !exists {
                warn!(path = %p.display(), "music bed file not found");
            }
            exists
        });
        if media.is_empty() {
            return Err(PlayerError::NoUsableMedia("music bed".into()));
        }
        fastrand::shuffle(&mut media);
        Ok(MusicBedRotation { media, cursor: 0 })
    }

    /// Next bed file, wrapping around at the end.
    pub fn next_media(&mut self) -> PathBuf {
        let path = self.media[self.cursor % self.media.len()].clone();
        self.cursor = (self.cursor + 1) % self.media.len();
        path
    }

    pub fn len(&self) -> usize {
        self.media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
}

fn multi_pass_shuffle(list: &mut [MediaRef]) {
    for _ in 0..SHUFFLE_PASSES {
        fastrand::shuffle(list);
    }
}

/// Turns a music source into a list of programming elements.
pub struct PlaylistBuilder<'a> {
    repo: &'a dyn ScheduleRepository,
    tags: &'a dyn TagReader,
    history: &'a MusicHistory,
    profile_source: String,
    window: MediaWindow,
    repeat_percent: u32,
}

impl<'a> PlaylistBuilder<'a> {
    pub fn new(
        repo: &'a dyn ScheduleRepository,
        tags: &'a dyn TagReader,
        history: &'a MusicHistory,
        profile_source: String,
        window: MediaWindow,
        repeat_percent: u32,
    ) -> Self {
        PlaylistBuilder {
            repo,
            tags,
            history,
            profile_source,
            window,
            repeat_percent,
        }
    }

    /// Build the playlist for `source`.
    ///
    /// Each element gets the next file from `bed` as its music bed, when one
    /// is given.
    pub fn build(
        &self,
        source: &str,
        category: Category,
        shuffle: bool,
        mut bed: Option<&mut MusicBedRotation>,
    ) -> Result<Vec<ProgrammingElement>> {
        let files = self.list_media(source, shuffle)?;
        let line_in = files.first() == Some(&MediaRef::LineIn);

        let elements: Vec<ProgrammingElement> = files
            .into_iter()
            .map(|media| {
                let mut pe = match media {
                    MediaRef::File(path) => ProgrammingElement::file(category, path),
                    _ => ProgrammingElement::line_in(category),
                };
                if let Some(rotation) = bed.as_deref_mut() {
                    pe.music_bed = Some(MusicBed::new(rotation.next_media()));
                }
                pe
            })
            .collect();

        if elements.is_empty() {
            return Err(PlayerError::NoUsableMedia(source.to_string()));
        }
        if category == Category::Music && !line_in && elements.len() < LOW_INVENTORY_WARNING {
            warn!(
                source,
                count = elements.len(),
                "the new music playlist only has a few songs"
            );
        }
        Ok(elements)
    }

    /// Expand, filter and (optionally) shuffle the media behind `source`.
    pub fn list_media(&self, source: &str, shuffle: bool) -> Result<Vec<MediaRef>> {
        let mut files = Vec::new();
        self.recursive_add(&mut files, source, MAX_SOURCE_DEPTH)?;

        check_line_in(&mut files, source)?;

        files.sort();
        files.dedup();

        let disabled: HashSet<PathBuf> = self.repo.disabled_media()?.into_iter().collect();
        filter_logged(&mut files, "disabled", |m| {
            m.path().is_none_or(|p| !disabled.contains(p))
        });

        let mut names = HashSet::new();
        filter_logged(&mut files, "duplicate (file)", |m| match m.path() {
            Some(p) => names.insert(
                p.file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default(),
            ),
            None => true,
        });

        let mut descriptions = HashSet::new();
        filter_logged(&mut files, "duplicate (description)", |m| match m.path() {
            Some(p) => {
                let descr = self
                    .tags
                    .description(p)
                    .unwrap_or_else(|_| p.to_string_lossy().to_string());
                descriptions.insert(descr.trim().to_lowercase())
            }
            None => true,
        });

        if shuffle {
            multi_pass_shuffle(&mut files);
            let min_repeat = (files.len() * self.repeat_percent as usize) / 100;
            files = alternate_artists(files, self.tags, self.history, min_repeat);
        }
        Ok(files)
    }

    fn recursive_add(&self, list: &mut Vec<MediaRef>, source: &str, depth: u32) -> Result<()> {
        if depth == 0 {
            warn!(source, "playlist nesting is too deep, ignoring source");
            return Ok(());
        }
        let source = source.trim();
        if source.eq_ignore_ascii_case("linein") {
            list.push(MediaRef::LineIn);
            return Ok(());
        }
        if source.eq_ignore_ascii_case(PROFILE_KEYWORD) {
            if self.profile_source.eq_ignore_ascii_case(PROFILE_KEYWORD) {
                return Err(PlayerError::Config(
                    "default music source refers to itself".into(),
                ));
            }
            let profile = self.profile_source.clone();
            return self.recursive_add(list, &profile, depth - 1);
        }

        let path = Path::new(source);
        if path.is_dir() {
            if let Some(sub_cat) = self.repo.sub_category_for_dir(path)? {
                self.add_relevant_media(list, sub_cat)?;
            } else {
                self.add_directory(list, path, depth)?;
            }
        } else if path.is_file() {
            if has_extension(path, "mp3") {
                list.push(MediaRef::File(path.to_path_buf()));
            } else if has_extension(path, "m3u") {
                self.add_m3u(list, path, depth)?;
            } else {
                warn!(source, "unknown media file type, skipping");
            }
        } else {
            warn!(source, "music source not found");
        }
        Ok(())
    }

    fn add_relevant_media(&self, list: &mut Vec<MediaRef>, sub_cat: i64) -> Result<()> {
        for row in self.repo.relevant_media(sub_cat)? {
            if !media_is_relevant(&row, &self.window) {
                debug!(path = %row.path.display(), "media is not relevant today");
                continue;
            }
            if row.path.is_file() {
                list.push(MediaRef::File(row.path));
            } else {
                warn!(path = %row.path.display(), "format clock media file not found");
            }
        }
        Ok(())
    }

    fn add_directory(&self, list: &mut Vec<MediaRef>, dir: &Path, depth: u32) -> Result<()> {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();
        for entry in entries {
            if has_extension(&entry, "mp3") {
                list.push(MediaRef::File(entry));
            } else if has_extension(&entry, "m3u") {
                self.add_m3u(list, &entry, depth)?;
            }
        }
        Ok(())
    }

    fn add_m3u(&self, list: &mut Vec<MediaRef>, m3u: &Path, depth: u32) -> Result<()> {
        let text = fs::read_to_string(m3u)?;
        let base = m3u.parent().unwrap_or(Path::new(""));
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = Path::new(line);
            let resolved = if entry.is_relative() && !line.eq_ignore_ascii_case("linein")
                && !line.eq_ignore_ascii_case(PROFILE_KEYWORD)
            {
                base.join(entry).to_string_lossy().to_string()
            } else {
                line.to_string()
            };
            self.recursive_add(list, &resolved, depth - 1)?;
        }
        Ok(())
    }
}

fn filter_logged(files: &mut Vec<MediaRef>, reason: &str, mut keep: impl FnMut(&MediaRef) -> bool) {
    let before = files.len();
    files.retain(|m| keep(m));
    let removed = before - files.len();
    if removed > 0 {
        debug!(removed, reason, "filtered playlist entries");
    }
}

/// Line input cannot be mixed with files. Duplicate line-in entries collapse.
fn check_line_in(files: &mut Vec<MediaRef>, source: &str) -> Result<()> {
    let line_in = files.iter().filter(|m| **m == MediaRef::LineIn).count();
    if line_in == 0 {
        return Ok(());
    }
    if line_in < files.len() {
        return Err(PlayerError::Config(format!(
            "music source '{}' mixes LineIn with other entries",
            source
        )));
    }
    if line_in > 1 {
        warn!(source, count = line_in, "music source lists LineIn several times");
        files.truncate(1);
    }
    Ok(())
}

/// Reorder a shuffled list so consecutive songs come from different artists.
///
/// Recently heard artists are pushed to the back. Within each artist, songs
/// that did not play within the last `min_repeat` songs are preferred.
pub fn alternate_artists(
    files: Vec<MediaRef>,
    tags: &dyn TagReader,
    history: &MusicHistory,
    min_repeat: usize,
) -> Vec<MediaRef> {
    let artist_of = |m: &MediaRef| -> String {
        m.path()
            .and_then(|p| tags.artist(p).ok())
            .map(|a| a.trim().to_lowercase())
            .unwrap_or_default()
    };

    let mut groups: Vec<(String, Vec<MediaRef>)> = Vec::new();
    for media in files {
        let artist = artist_of(&media);
        match groups.iter_mut().find(|(a, _)| *a == artist) {
            Some((_, songs)) => songs.push(media),
            None => groups.push((artist, vec![media])),
        }
    }

    // Most recent artist ends up last.
    for recent in history.recent_artists().iter().rev() {
        if let Some(pos) = groups.iter().position(|(a, _)| a == recent) {
            let group = groups.remove(pos);
            groups.push(group);
        }
    }

    let mut working = history.clone();
    let mut output = Vec::new();
    let mut problems = 0;
    let mut idx = 0;
    while !groups.is_empty() {
        let (artist, songs) = &mut groups[idx];
        let pick = songs
            .iter()
            .position(|m| m.path().is_none_or(|p| !working.played_recently(p, min_repeat)))
            .unwrap_or_else(|| {
                problems += 1;
                debug!(
                    artist = %artist,
                    slot = output.len() + 1,
                    "no song by this artist that has not played recently"
                );
                0
            });
        let media = songs.remove(pick);
        if let Some(p) = media.path() {
            working.song_played_no_persist(PlayedSong::new(p, "", artist));
        }
        output.push(media);

        if songs.is_empty() {
            groups.remove(idx);
        } else {
            idx += 1;
        }
        if idx >= groups.len() {
            idx = 0;
        }
    }
    if problems > 0 {
        warn!(problems, "had problems while alternating playlist artists");
    }
    output
}
