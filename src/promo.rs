use crate::config::{Dirs, PlayerConfig};
use crate::element::{ProgrammingElement, VolumeClass};
use crate::error::Result;
use crate::repository::{LifespanRow, PromoQuery, PromoRow, PromoStatus, ScheduleRepository};
use crate::segment::Segment;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Batch lookups run at most once per bucket of this many seconds.
pub const RUN_BUCKET_SECS: i64 = 30;
/// How far past the item start a narrowed window may look.
pub const LOOKAHEAD_MINS: i64 = 10;

/// A scheduled announcement that wants to play soon.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingAnnouncement {
    pub slot_id: i64,
    pub filename: String,
    pub category: String,
    pub day: NaiveDate,
    pub slot_start: NaiveTime,
    pub slot_end: NaiveTime,
    pub forced_time: Option<NaiveTime>,
    pub priority: String,
    pub volume: VolumeClass,
    pub announcer: String,
    pub check_lifespan: bool,
    pub prerec_mediaref: Option<String>,
    /// Actual file on disk, matched case-insensitively. `None` if missing.
    pub path: Option<PathBuf>,
}

impl WaitingAnnouncement {
    pub fn from_row(row: &PromoRow, dirs: &Dirs) -> Self {
        let filename = row.filename.trim().to_lowercase();
        let path = resolve_promo_path(dirs, &filename);
        WaitingAnnouncement {
            slot_id: row.slot_id,
            filename,
            category: row.category.trim().to_lowercase(),
            day: row.day,
            slot_start: row.slot_start,
            slot_end: row.slot_end,
            forced_time: row.forced_time,
            priority: row.priority.clone(),
            volume: VolumeClass::from_promo_field(&row.volume),
            announcer: row.announcer.trim().to_lowercase(),
            check_lifespan: row.check_lifespan,
            prerec_mediaref: row
                .prerec_mediaref
                .as_deref()
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty()),
            path,
        }
    }

    pub fn play_time(&self) -> NaiveTime {
        self.forced_time.unwrap_or(self.slot_start)
    }

    /// Key into the lifespan table: the prerecorded media reference, or the
    /// filename when the slot has none.
    pub fn lifespan_ref(&self) -> &str {
        match self.prerec_mediaref.as_deref() {
            Some(media_ref) => media_ref,
            None => {
                error!(
                    slot = self.slot_id,
                    "lifespan check is set but the prerecorded media reference is empty, using {}",
                    self.filename
                );
                &self.filename
            }
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced_time.is_some()
    }

    fn to_element(&self) -> Option<ProgrammingElement> {
        let path = self.path.as_ref()?;
        Some(ProgrammingElement::promo(
            path.clone(),
            self.volume,
            self.slot_id,
            self.is_forced(),
        ))
    }
}

/// Directory an announcement lives in, picked by its filename prefix.
pub fn promo_dir<'a>(dirs: &'a Dirs, filename: &str) -> &'a Path {
    let prefix: String = filename.chars().take(2).collect::<String>().to_lowercase();
    match prefix.as_str() {
        "ca" => &dirs.announcements,
        "sp" => &dirs.specials,
        "ad" => &dirs.adverts,
        _ => {
            error!("Advert filename {} has an unknown prefix {}", filename, prefix);
            &dirs.mp3
        }
    }
}

/// Find `filename` in its promo directory, ignoring case.
pub fn resolve_promo_path(dirs: &Dirs, filename: &str) -> Option<PathBuf> {
    find_file_ignoring_case(promo_dir(dirs, filename), filename)
}

fn find_file_ignoring_case(dir: &Path, filename: &str) -> Option<PathBuf> {
    let exact = dir.join(filename);
    if exact.is_file() {
        return Some(exact);
    }
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .find(|entry| {
            entry.file_name().to_string_lossy().eq_ignore_ascii_case(filename)
                && entry.path().is_file()
        })
        .map(|entry| entry.path())
}

/// True if a prerecorded announcement may still play on `today`.
pub fn lifespan_ok(rows: &[LifespanRow], filename: &str, today: NaiveDate) -> bool {
    if rows.len() != 1 {
        error!(
            "{} prerecorded items match media reference {}. Cannot play it",
            rows.len(),
            filename
        );
        return false;
    }
    let row = &rows[0];
    if row.global_expiry.is_some_and(|d| d < today) {
        error!("Advert skipped because its global expiry date has passed: {}", filename);
        return false;
    }
    if row.lifespan.is_some_and(|d| d < today) {
        error!("Advert skipped because the period it was purchased for has expired: {}", filename);
        return false;
    }
    true
}

/// Do two consecutive items share a non-empty announcer code?
pub fn has_adjacent_clash(batch: &[WaitingAnnouncement]) -> bool {
    let Some(first) = batch.first() else {
        return false;
    };
    let mut prev = first.announcer.as_str();
    for item in &batch[1..] {
        let code = item.announcer.as_str();
        if !code.is_empty() && code == prev {
            return true;
        }
        prev = code;
    }
    false
}

fn factorial(n: usize) -> u64 {
    (1..=n as u64).fold(1u64, |acc, k| acc.saturating_mul(k))
}

/// Permute `batch` in place by adjacent swaps until no announcer plays twice
/// in a row. Gives up after `n!` orderings and returns false.
pub fn find_non_clashing_order(batch: &mut [WaitingAnnouncement]) -> bool {
    let n = batch.len();
    if n < 2 {
        return true;
    }
    let permutations = factorial(n);
    let mut pos = 0usize;
    let mut forward = true;

    for _ in 0..permutations {
        if !has_adjacent_clash(batch) {
            return true;
        }
        batch.swap(pos, pos + 1);
        if n > 2 {
            if (forward && pos >= n - 2) || (!forward && pos == 0) {
                forward = !forward;
            }
            if forward {
                pos += 1;
            } else {
                pos -= 1;
            }
        }
    }
    false
}

fn duplicates_batch(batch: &[WaitingAnnouncement], candidate: &WaitingAnnouncement) -> bool {
    batch.iter().any(|item| {
        item.filename == candidate.filename
            || (!candidate.category.is_empty() && item.category == candidate.category)
    })
}

/// Accept candidates in order, up to `max`. Items whose announcer matches the
/// last accepted one are returned separately for [`rescue_clashes`].
pub fn accept_batch(
    candidates: Vec<WaitingAnnouncement>,
    max: usize,
    today: NaiveDate,
    repo: &dyn ScheduleRepository,
) -> Result<(Vec<WaitingAnnouncement>, Vec<WaitingAnnouncement>)> {
    let mut batch: Vec<WaitingAnnouncement> = Vec::new();
    let mut clashes: Vec<WaitingAnnouncement> = Vec::new();

    for candidate in candidates {
        if batch.len() >= max {
            break;
        }
        if candidate.path.is_none() {
            error!("Could not find announcement MP3: {}", candidate.filename);
            continue;
        }
        if candidate.check_lifespan {
            let media_ref = candidate.lifespan_ref();
            let rows = repo.promo_lifespan(media_ref)?;
            if !lifespan_ok(&rows, media_ref, today) {
                continue;
            }
        }
        if duplicates_batch(&batch, &candidate) {
            debug!(file = %candidate.filename, "skipping duplicate announcement in batch");
            continue;
        }
        let clash = !candidate.announcer.is_empty()
            && batch.last().is_some_and(|last| last.announcer == candidate.announcer);
        if clash {
            clashes.push(candidate);
        } else {
            batch.push(candidate);
        }
    }
    Ok((batch, clashes))
}

/// Try to fit announcer-clashing items into spare batch capacity by reordering.
pub fn rescue_clashes(
    batch: &mut Vec<WaitingAnnouncement>,
    clashes: &mut Vec<WaitingAnnouncement>,
    max: usize,
) {
    let mut prev_len = None;
    while prev_len != Some(batch.len()) {
        prev_len = Some(batch.len());
        let mut i = 0;
        while i < clashes.len() && batch.len() < max {
            if duplicates_batch(batch, &clashes[i]) {
                i += 1;
                continue;
            }
            let snapshot = batch.clone();
            batch.push(clashes[i].clone());
            if find_non_clashing_order(batch) {
                clashes.remove(i);
            } else {
                *batch = snapshot;
                i += 1;
            }
        }
    }
}

/// Stable priority buckets: due forced items, this segment's slots, later
/// this hour, earlier this hour, then the rest. Forced items not yet due
/// are dropped.
pub fn order_candidates(
    rows: Vec<WaitingAnnouncement>,
    at: NaiveDateTime,
    segment_window: Option<(NaiveTime, NaiveTime)>,
) -> Vec<WaitingAnnouncement> {
    let now = at.time();
    let hour = now.hour();
    let mut buckets: [Vec<WaitingAnnouncement>; 5] = Default::default();

    for row in rows {
        let bucket = if let Some(forced) = row.forced_time {
            if forced > now {
                debug!(file = %row.filename, %forced, "forced announcement is not due yet");
                continue;
            }
            0
        } else if segment_window.is_some_and(|(from, to)| from <= row.slot_start && row.slot_start <= to) {
            1
        } else if row.slot_start.hour() == hour && row.slot_start > now {
            2
        } else if row.slot_start.hour() == hour {
            3
        } else {
            4
        };
        buckets[bucket].push(row);
    }
    buckets.into_iter().flatten().collect()
}

fn time_on(day: NaiveDate, at: NaiveDateTime) -> NaiveTime {
    if at.date() < day {
        NaiveTime::MIN
    } else if at.date() > day {
        NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
    } else {
        at.time()
    }
}

fn hour_start(at: NaiveDateTime) -> NaiveDateTime {
    at.date()
        .and_hms_opt(at.hour(), 0, 0)
        .unwrap_or(at)
}

/// What the caller knows about the moment a promo would start.
#[derive(Debug, Clone, Copy)]
pub struct PromoRequest<'a> {
    pub now: NaiveDateTime,
    /// Milliseconds from `now` until the promo would start.
    pub starts_ms: i64,
    pub segment: &'a Segment,
    pub current: &'a ProgrammingElement,
    /// The promo would cut the current item short.
    pub interrupting: bool,
}

impl PromoRequest<'_> {
    fn starts(&self) -> NaiveDateTime {
        self.now + Duration::milliseconds(self.starts_ms)
    }
}

/// Decides which announcements play next, a batch at a time.
#[derive(Debug, Default)]
pub struct PromoBatchScheduler {
    queue: VecDeque<ProgrammingElement>,
    last_now: Option<NaiveDateTime>,
    last_run: Option<NaiveDateTime>,
    last_batch: Option<NaiveDateTime>,
    last_segment: Option<(i64, i64)>,
}

impl PromoBatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop queued announcements and forget batch timing.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.last_now = None;
        self.last_run = None;
        self.last_batch = None;
        self.last_segment = None;
    }

    /// Pop a queued announcement without looking for a new batch.
    pub fn pop_queued(&mut self) -> Option<ProgrammingElement> {
        self.queue.pop_front()
    }

    /// The next announcement to play, fetching a new batch when due.
    pub fn next_promo(
        &mut self,
        repo: &mut dyn ScheduleRepository,
        config: &PlayerConfig,
        req: &PromoRequest<'_>,
    ) -> Result<Option<ProgrammingElement>> {
        if let Some(pe) = self.queue.pop_front() {
            return Ok(Some(pe));
        }

        let now = req.now;
        if self.last_now.is_some_and(|last| now < last) {
            info!("System clock change detected, recalibrating promo timing...");
            self.last_run = None;
            self.last_batch = None;
        }
        self.last_now = Some(now);

        let segment_key = (req.segment.fc_id, req.segment.segment_id);
        let segment_changed = self.last_segment != Some(segment_key);
        self.last_segment = Some(segment_key);

        let same_bucket = self.last_run.is_some_and(|last| {
            last.and_utc().timestamp().div_euclid(RUN_BUCKET_SECS)
                == now.and_utc().timestamp().div_euclid(RUN_BUCKET_SECS)
        });
        if same_bucket && !segment_changed {
            return Ok(None);
        }
        self.last_run = Some(now);

        let promos = &config.promos;
        let batches_allowed = req.segment.loaded
            && req.segment.promos
            && self
                .last_batch
                .is_none_or(|last| now >= last + Duration::minutes(promos.min_mins_between_batches));
        let held_for_song_end = promos.wait_for_song_end
            && req.interrupting
            && req.current.is_music()
            && !req.current.is_line_in();
        let include_unforced = batches_allowed && !held_for_song_end;
        if !include_unforced {
            debug!(
                batches_allowed,
                held_for_song_end, "only announcements with forced times may play now"
            );
        }

        // The queue is empty, so anything still listed belongs to a batch
        // that was interrupted.
        let corrected = repo.reset_listed_promos()?;
        if corrected > 0 {
            info!(count = corrected, "returned interrupted announcements to the waiting list");
        }

        let query = self.query_window(config, req, include_unforced);
        let rows = repo.waiting_promos(&query)?;
        if rows.is_empty() {
            return Ok(None);
        }

        let candidates: Vec<WaitingAnnouncement> = rows
            .iter()
            .map(|row| WaitingAnnouncement::from_row(row, &config.dirs))
            .collect();
        let window = (config.format_clocks.enabled && req.segment.loaded)
            .then(|| (req.segment.started_at.time(), req.segment.end().time()));
        let ordered = order_candidates(candidates, req.starts(), window);

        let max = promos.max_per_batch;
        let (mut batch, mut clashes) = accept_batch(ordered, max, query.day, repo)?;
        if !clashes.is_empty() && batch.len() < max {
            rescue_clashes(&mut batch, &mut clashes, max);
        }
        for skipped in &clashes {
            info!(
                file = %skipped.filename,
                announcer = %skipped.announcer,
                "announcement held back, same announcer would play twice in a row"
            );
        }
        if batch.is_empty() {
            return Ok(None);
        }

        for item in &batch {
            info!(
                "Announcement to be played: {}, priority: {}, category: \"{}\", volume: {:?}, time: {}, date: {}, db index: {}",
                item.filename,
                item.priority,
                item.category,
                item.volume,
                item.play_time(),
                item.day,
                item.slot_id
            );
            repo.set_promo_status(item.slot_id, PromoStatus::ListedToPlay, now)?;
            if let Some(pe) = item.to_element() {
                self.queue.push_back(pe);
            }
        }

        // Forced-only batches do not hold back the next regular batch.
        if batches_allowed {
            self.last_batch = Some(now);
        }
        Ok(self.queue.pop_front())
    }

    fn query_window(&self, config: &PlayerConfig, req: &PromoRequest<'_>, include_unforced: bool) -> PromoQuery {
        let starts = req.starts();
        let day = starts.date();
        let mut earliest = time_on(day, starts - Duration::minutes(config.promos.mins_to_miss_after));
        let mut latest = starts.time();

        if config.format_clocks.enabled && req.segment.loaded {
            let seg_hour = hour_start(req.segment.started_at);
            earliest = earliest.max(time_on(day, seg_hour));
            let bound = req
                .segment
                .end()
                .min(starts + Duration::minutes(LOOKAHEAD_MINS))
                .min(seg_hour + Duration::seconds(3599));
            latest = latest.max(time_on(day, bound));
        }

        PromoQuery {
            day,
            earliest,
            latest,
            include_unforced,
        }
    }

    /// Record that the announcement in `slot_id` has played.
    pub fn mark_complete(&self, repo: &mut dyn ScheduleRepository, slot_id: i64, at: NaiveDateTime) -> Result<()> {
        debug!(slot = slot_id, "announcement complete");
        repo.set_promo_status(slot_id, PromoStatus::Played, at)
    }
}

/// Log a summary line per announcement file that was never played, then
/// mark those slots so they are reported only once. Returns the slot count.
pub fn report_missed_promos(
    repo: &mut dyn ScheduleRepository,
    now: NaiveDateTime,
    mins_to_miss_after: i64,
) -> Result<usize> {
    let today = now.date();
    let earliest = time_on(today, now - Duration::minutes(mins_to_miss_after));
    let missed = repo.missed_promos(today, earliest)?;

    let mut start = 0;
    while start < missed.len() {
        let filename = &missed[start].filename;
        let end = missed[start..]
            .iter()
            .position(|p| &p.filename != filename)
            .map_or(missed.len(), |n| start + n);
        let group = &missed[start..end];

        let times: Vec<NaiveDateTime> = group.iter().map(|p| p.day.and_time(p.play_time())).collect();
        let first = times.iter().min().copied().unwrap_or(now);
        let last = times.iter().max().copied().unwrap_or(now);
        if group.len() == 1 {
            warn!(
                "Announcement {} (at {}) was missed.",
                filename,
                first.format("%Y-%m-%d %H:%M:%S")
            );
        } else {
            warn!(
                "Announcement {} was missed {} times between {} and {}",
                filename,
                group.len(),
                first.format("%Y-%m-%d %H:%M:%S"),
                last.format("%Y-%m-%d %H:%M:%S")
            );
        }
        start = end;
    }

    for row in &missed {
        repo.mark_miss_logged(row.slot_id)?;
    }
    Ok(missed.len())
}
