use crate::clock::Clock;
use crate::element::StoreStatus;
use crate::error::{PlayerError, Result};
use crate::history::PlayedSong;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Rows kept in the database's music history table.
pub const PERSISTED_HISTORY_ROWS: usize = 100;

/// Scheduling state of a waiting announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromoStatus {
    SnsLoaded = 0,
    ListedToPlay = 1,
    Paused = 2,
    Deleted = 3,
    Played = 4,
}

impl Default for PromoStatus {
    fn default() -> Self {
        PromoStatus::SnsLoaded
    }
}

/// A format clock assignment: which clock runs on which day and hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockScheduleRow {
    pub id: i64,
    pub fc_id: i64,
    /// Specific date. Takes precedence over weekday rows.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// 1 = Monday .. 7 = Sunday.
    #[serde(default)]
    pub weekday: Option<u32>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatClockRow {
    pub id: i64,
    pub name: String,
}

/// One segment of a format clock, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub id: i64,
    pub fc_id: i64,
    #[serde(default)]
    pub fc_name: String,
    #[serde(default)]
    pub seg_no: i32,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub category: String,
    #[serde(default)]
    pub sub_cat: String,
    #[serde(default)]
    pub alt_category: String,
    #[serde(default)]
    pub alt_sub_cat: String,
    #[serde(default)]
    pub sequence: String,
    #[serde(default)]
    pub specific_media: String,
    #[serde(default)]
    pub promos: bool,
    #[serde(default)]
    pub music_bed_sub_cat: Option<i64>,
    #[serde(default)]
    pub crossfading: bool,
    #[serde(default)]
    pub max_age: Option<i64>,
    #[serde(default)]
    pub premature: bool,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub max_items: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCategoryRow {
    pub id: i64,
    pub name: String,
    pub dir: PathBuf,
}

/// Media registered under a format-clock sub-category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRow {
    pub sub_cat: i64,
    pub path: PathBuf,
    #[serde(default)]
    pub relevant_from: Option<NaiveDate>,
    #[serde(default)]
    pub relevant_until: Option<NaiveDate>,
}

/// A scheduled announcement slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoRow {
    pub slot_id: i64,
    pub filename: String,
    #[serde(default)]
    pub category: String,
    pub day: NaiveDate,
    pub slot_start: NaiveTime,
    pub slot_end: NaiveTime,
    #[serde(default)]
    pub forced_time: Option<NaiveTime>,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub announcer: String,
    /// Prerecorded announcements must also pass the lifespan table.
    #[serde(default)]
    pub check_lifespan: bool,
    /// Lifespan table key. Empty or absent means the filename is used.
    #[serde(default)]
    pub prerec_mediaref: Option<String>,
    #[serde(default)]
    pub status: PromoStatus,
    #[serde(default)]
    pub played_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub miss_logged: bool,
}

impl PromoRow {
    /// Time the promo wants to play: the forced time if any, else the slot start.
    pub fn play_time(&self) -> NaiveTime {
        self.forced_time.unwrap_or(self.slot_start)
    }
}

/// Expiry information for a prerecorded announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifespanRow {
    pub filename: String,
    #[serde(default)]
    pub global_expiry: Option<NaiveDate>,
    #[serde(default)]
    pub lifespan: Option<NaiveDate>,
}

/// Time window for fetching waiting announcements on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct PromoQuery {
    pub day: NaiveDate,
    pub earliest: NaiveTime,
    pub latest: NaiveTime,
    /// Include promos without a forced time.
    pub include_unforced: bool,
}

/// Synchronous access to the store's schedule database.
pub trait ScheduleRepository {
    /// Format clock scheduled for this moment, if any.
    fn scheduled_format_clock(&self, at: NaiveDateTime) -> Result<Option<i64>>;
    fn format_clock_exists(&self, fc_id: i64) -> Result<bool>;
    /// Newest segment of `fc_id` covering `time`.
    fn format_clock_segment(&self, fc_id: i64, time: NaiveTime) -> Result<Option<i64>>;
    fn segment(&self, id: i64) -> Result<Option<SegmentRow>>;
    fn sub_category_dir(&self, id: i64) -> Result<Option<PathBuf>>;
    /// Sub-category registered for a directory, if any.
    fn sub_category_for_dir(&self, dir: &Path) -> Result<Option<i64>>;
    fn relevant_media(&self, sub_cat: i64) -> Result<Vec<MediaRow>>;
    fn music_bed_media(&self, sub_cat: i64) -> Result<Vec<PathBuf>>;
    fn disabled_media(&self) -> Result<Vec<PathBuf>>;

    /// Loaded announcements inside the query window, ordered by priority,
    /// then play time, then slot id.
    fn waiting_promos(&self, query: &PromoQuery) -> Result<Vec<PromoRow>>;
    fn promo_lifespan(&self, filename: &str) -> Result<Vec<LifespanRow>>;
    fn set_promo_status(&mut self, slot_id: i64, status: PromoStatus, at: NaiveDateTime) -> Result<()>;
    /// Return announcements stuck in "listed to play" to "loaded". Returns the count.
    fn reset_listed_promos(&mut self) -> Result<usize>;
    /// Unplayed announcements from before `earliest` on `today` (or earlier days)
    /// whose miss has not been reported, ordered by filename then slot.
    fn missed_promos(&self, today: NaiveDate, earliest: NaiveTime) -> Result<Vec<PromoRow>>;
    fn mark_miss_logged(&mut self, slot_id: i64) -> Result<()>;

    fn store_status(&self) -> Result<StoreStatus>;
    fn record_song_played(&mut self, song: &PlayedSong) -> Result<()>;
    /// Most recent songs first.
    fn recent_songs(&self, limit: usize) -> Result<Vec<PlayedSong>>;
}

// --- JSON-backed store ---

/// All schedule tables, serialized as one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleTables {
    pub clock_schedule: Vec<ClockScheduleRow>,
    pub format_clocks: Vec<FormatClockRow>,
    pub segments: Vec<SegmentRow>,
    pub sub_categories: Vec<SubCategoryRow>,
    pub media: Vec<MediaRow>,
    pub disabled_media: Vec<PathBuf>,
    pub promos: Vec<PromoRow>,
    pub lifespans: Vec<LifespanRow>,
    pub store_status: StoreStatus,
    pub music_history: Vec<PlayedSong>,
}

/// Schedule repository held in memory and optionally persisted to a JSON file.
pub struct JsonScheduleStore {
    path: Option<PathBuf>,
    pub tables: ScheduleTables,
}

impl JsonScheduleStore {
    pub fn new(tables: ScheduleTables) -> Self {
        JsonScheduleStore { path: None, tables }
    }

    /// Load tables from a JSON file. Writes are saved back to the same file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let tables: ScheduleTables = serde_json::from_str(&data)?;
        Ok(JsonScheduleStore {
            path: Some(path.to_path_buf()),
            tables,
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&self.tables)?;
            fs::write(path, json)?;
        }
        Ok(())
    }

    fn promo_mut(&mut self, slot_id: i64) -> Result<&mut PromoRow> {
        self.tables
            .promos
            .iter_mut()
            .find(|p| p.slot_id == slot_id)
            .ok_or_else(|| PlayerError::Repository(format!("promo slot {} not found", slot_id)))
    }
}

fn schedule_matches(row: &ClockScheduleRow, at: NaiveDateTime) -> bool {
    let time = at.time();
    if time < row.start || time > row.end {
        return false;
    }
    match (row.date, row.weekday) {
        (Some(date), _) => date == at.date(),
        (None, Some(day)) => day == at.weekday().number_from_monday(),
        (None, None) => true,
    }
}

fn schedule_rank(row: &ClockScheduleRow) -> (u8, i64) {
    let specificity = match (row.date, row.weekday) {
        (Some(_), _) => 2,
        (None, Some(_)) => 1,
        (None, None) => 0,
    };
    (specificity, row.id)
}

impl ScheduleRepository for JsonScheduleStore {
    fn scheduled_format_clock(&self, at: NaiveDateTime) -> Result<Option<i64>> {
        Ok(self
            .tables
            .clock_schedule
            .iter()
            .filter(|r| schedule_matches(r, at))
            .max_by_key(|r| schedule_rank(r))
            .map(|r| r.fc_id))
    }

    fn format_clock_exists(&self, fc_id: i64) -> Result<bool> {
        Ok(self.tables.format_clocks.iter().any(|f| f.id == fc_id))
    }

    fn format_clock_segment(&self, fc_id: i64, time: NaiveTime) -> Result<Option<i64>> {
        let matching: Vec<&SegmentRow> = self
            .tables
            .segments
            .iter()
            .filter(|s| s.fc_id == fc_id && s.start <= time && time <= s.end)
            .collect();
        if matching.len() > 1 {
            warn!(
                fc = fc_id,
                count = matching.len(),
                "found several matching segments, using the newest"
            );
        }
        Ok(matching.iter().map(|s| s.id).max())
    }

    fn segment(&self, id: i64) -> Result<Option<SegmentRow>> {
        Ok(self.tables.segments.iter().find(|s| s.id == id).map(|s| {
            let mut row = s.clone();
            if let Some(fc) = self.tables.format_clocks.iter().find(|f| f.id == s.fc_id) {
                row.fc_name = fc.name.clone();
            }
            row
        }))
    }

    fn sub_category_dir(&self, id: i64) -> Result<Option<PathBuf>> {
        Ok(self
            .tables
            .sub_categories
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.dir.clone()))
    }

    fn sub_category_for_dir(&self, dir: &Path) -> Result<Option<i64>> {
        Ok(self
            .tables
            .sub_categories
            .iter()
            .find(|c| c.dir == dir)
            .map(|c| c.id))
    }

    fn relevant_media(&self, sub_cat: i64) -> Result<Vec<MediaRow>> {
        Ok(self
            .tables
            .media
            .iter()
            .filter(|m| m.sub_cat == sub_cat)
            .cloned()
            .collect())
    }

    fn music_bed_media(&self, sub_cat: i64) -> Result<Vec<PathBuf>> {
        Ok(self
            .tables
            .media
            .iter()
            .filter(|m| m.sub_cat == sub_cat)
            .map(|m| m.path.clone())
            .collect())
    }

    fn disabled_media(&self) -> Result<Vec<PathBuf>> {
        Ok(self.tables.disabled_media.clone())
    }

    fn waiting_promos(&self, query: &PromoQuery) -> Result<Vec<PromoRow>> {
        let in_window = |t: NaiveTime| query.earliest <= t && t <= query.latest;
        let mut rows: Vec<PromoRow> = self
            .tables
            .promos
            .iter()
            .filter(|p| p.status == PromoStatus::SnsLoaded && p.day == query.day)
            .filter(|p| match p.forced_time {
                Some(t) => in_window(t),
                None => query.include_unforced && in_window(p.slot_start),
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.play_time().cmp(&b.play_time()))
                .then(a.slot_id.cmp(&b.slot_id))
        });
        Ok(rows)
    }

    fn promo_lifespan(&self, filename: &str) -> Result<Vec<LifespanRow>> {
        Ok(self
            .tables
            .lifespans
            .iter()
            .filter(|l| l.filename.eq_ignore_ascii_case(filename))
            .cloned()
            .collect())
    }

    fn set_promo_status(&mut self, slot_id: i64, status: PromoStatus, at: NaiveDateTime) -> Result<()> {
        let row = self.promo_mut(slot_id)?;
        row.status = status;
        if status == PromoStatus::Played {
            row.played_at = Some(at);
        }
        self.save()
    }

    fn reset_listed_promos(&mut self) -> Result<usize> {
        let mut count = 0;
        for row in self
            .tables
            .promos
            .iter_mut()
            .filter(|p| p.status == PromoStatus::ListedToPlay)
        {
            row.status = PromoStatus::SnsLoaded;
            count += 1;
        }
        if count > 0 {
            self.save()?;
        }
        Ok(count)
    }

    fn missed_promos(&self, today: NaiveDate, earliest: NaiveTime) -> Result<Vec<PromoRow>> {
        let mut rows: Vec<PromoRow> = self
            .tables
            .promos
            .iter()
            .filter(|p| p.status == PromoStatus::SnsLoaded && !p.miss_logged)
            .filter(|p| p.day < today || (p.day == today && p.slot_start < earliest))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.filename.cmp(&b.filename).then(a.slot_id.cmp(&b.slot_id)));
        Ok(rows)
    }

    fn mark_miss_logged(&mut self, slot_id: i64) -> Result<()> {
        self.promo_mut(slot_id)?.miss_logged = true;
        self.save()
    }

    fn store_status(&self) -> Result<StoreStatus> {
        Ok(self.tables.store_status)
    }

    fn record_song_played(&mut self, song: &PlayedSong) -> Result<()> {
        let history = &mut self.tables.music_history;
        history.insert(0, song.clone());
        history.truncate(PERSISTED_HISTORY_ROWS);
        self.save()
    }

    fn recent_songs(&self, limit: usize) -> Result<Vec<PlayedSong>> {
        Ok(self.tables.music_history.iter().take(limit).cloned().collect())
    }
}

// --- Connection retry ---

/// How persistently to retry a lost repository connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl From<&crate::config::RetryConfig> for RetryPolicy {
    fn from(c: &crate::config::RetryConfig) -> Self {
        RetryPolicy {
            delay: Duration::from_millis(c.delay_ms),
            max_attempts: c.max_attempts,
        }
    }
}

type StillAlive = RefCell<Option<Box<dyn FnMut(u32)>>>;

fn with_retry<T>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    still_alive: &StillAlive,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_retryable() => {
                attempt += 1;
                warn!(attempt, "schedule repository connection failed: {}", e);
                if let Some(cb) = still_alive.borrow_mut().as_mut() {
                    cb(attempt);
                }
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(e);
                }
                clock.sleep(policy.delay);
            }
            other => {
                if attempt > 0 {
                    info!(attempt, "schedule repository connection restored");
                }
                return other;
            }
        }
    }
}

/// Wraps a repository and retries connection failures.
///
/// The optional "still alive" callback runs after every failed attempt so
/// the caller can keep audio going while the database is down.
pub struct RetryingRepository<R> {
    inner: R,
    policy: RetryPolicy,
    clock: Box<dyn Clock>,
    still_alive: StillAlive,
}

impl<R: ScheduleRepository> RetryingRepository<R> {
    pub fn new(inner: R, policy: RetryPolicy, clock: Box<dyn Clock>) -> Self {
        RetryingRepository {
            inner,
            policy,
            clock,
            still_alive: RefCell::new(None),
        }
    }

    pub fn on_still_alive(mut self, cb: impl FnMut(u32) + 'static) -> Self {
        self.still_alive = RefCell::new(Some(Box::new(cb)));
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: ScheduleRepository> ScheduleRepository for RetryingRepository<R> {
    fn scheduled_format_clock(&self, at: NaiveDateTime) -> Result<Option<i64>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.scheduled_format_clock(at)
        })
    }

    fn format_clock_exists(&self, fc_id: i64) -> Result<bool> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.format_clock_exists(fc_id)
        })
    }

    fn format_clock_segment(&self, fc_id: i64, time: NaiveTime) -> Result<Option<i64>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.format_clock_segment(fc_id, time)
        })
    }

    fn segment(&self, id: i64) -> Result<Option<SegmentRow>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.segment(id)
        })
    }

    fn sub_category_dir(&self, id: i64) -> Result<Option<PathBuf>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.sub_category_dir(id)
        })
    }

    fn sub_category_for_dir(&self, dir: &Path) -> Result<Option<i64>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.sub_category_for_dir(dir)
        })
    }

    fn relevant_media(&self, sub_cat: i64) -> Result<Vec<MediaRow>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.relevant_media(sub_cat)
        })
    }

    fn music_bed_media(&self, sub_cat: i64) -> Result<Vec<PathBuf>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.music_bed_media(sub_cat)
        })
    }

    fn disabled_media(&self) -> Result<Vec<PathBuf>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.disabled_media()
        })
    }

    fn waiting_promos(&self, query: &PromoQuery) -> Result<Vec<PromoRow>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.waiting_promos(query)
        })
    }

    fn promo_lifespan(&self, filename: &str) -> Result<Vec<LifespanRow>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.promo_lifespan(filename)
        })
    }

    fn set_promo_status(&mut self, slot_id: i64, status: PromoStatus, at: NaiveDateTime) -> Result<()> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.set_promo_status(slot_id, status, at)
        })
    }

    fn reset_listed_promos(&mut self) -> Result<usize> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.reset_listed_promos()
        })
    }

    fn missed_promos(&self, today: NaiveDate, earliest: NaiveTime) -> Result<Vec<PromoRow>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.missed_promos(today, earliest)
        })
    }

    fn mark_miss_logged(&mut self, slot_id: i64) -> Result<()> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.mark_miss_logged(slot_id)
        })
    }

    fn store_status(&self) -> Result<StoreStatus> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.store_status()
        })
    }

    fn record_song_played(&mut self, song: &PlayedSong) -> Result<()> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.record_song_played(song)
        })
    }

    fn recent_songs(&self, limit: usize) -> Result<Vec<PlayedSong>> {
        with_retry(&self.policy, self.clock.as_ref(), &self.still_alive, || {
            self.inner.recent_songs(limit)
        })
    }
}
