use crate::element::Category;
use crate::error::{PlayerError, Result};
use crate::segment::{MUSIC_PROFILE_SEGMENT, Segment, SegmentLoader};
use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use tracing::{debug, info, warn};

/// Music segments are never shortened below this when reclaiming delay.
pub const MIN_RECLAIMED_MUSIC_SECS: i64 = 60;

/// What a call to [`SegmentResolver::resolve`] did to the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveOutcome {
    pub reloaded: bool,
    /// A different format-clock segment is now active.
    pub segment_changed: bool,
}

/// Tracks which format-clock segment governs playback and how far playback
/// has fallen behind its schedule.
#[derive(Debug, Clone, Default)]
pub struct SegmentResolver {
    delay_secs: i64,
    last_checked: Option<NaiveDateTime>,
}

fn hour_of(at: NaiveDateTime) -> (chrono::NaiveDate, u32) {
    (at.date(), at.hour())
}

impl SegmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds by which playback currently lags the format clock.
    pub fn delay_secs(&self) -> i64 {
        self.delay_secs
    }

    pub fn reset(&mut self) {
        self.delay_secs = 0;
        self.last_checked = None;
    }

    fn add_delay(&mut self, secs: i64, max_secs: i64) {
        let mut delay = self.delay_secs + secs;
        if delay > max_secs {
            warn!(
                "dropping {}s of segment playback time, segment delay limit of {}s reached",
                delay - max_secs,
                max_secs
            );
            delay = max_secs;
        }
        if delay != self.delay_secs {
            info!(
                "increasing segment delay factor to {}s (+{}s)",
                delay,
                delay - self.delay_secs
            );
        }
        self.delay_secs = delay;
    }

    /// Make sure `segment` is the one that should govern an item starting
    /// `starts_ms` from `now`, reloading it when needed.
    pub fn resolve(
        &mut self,
        now: NaiveDateTime,
        starts_ms: i64,
        segment: &mut Segment,
        force_reload: &mut bool,
        loader: &SegmentLoader<'_>,
    ) -> Result<ResolveOutcome> {
        let config = loader.config;
        let max_delay = config.max_segment_delay_secs;
        let next_starts = now + Duration::seconds(starts_ms / 1000);

        if segment.loaded {
            let seg_end = segment.end();
            if next_starts > seg_end + Duration::seconds(1) {
                let overrun = (next_starts - seg_end).num_seconds() - 1;
                info!(
                    "current item is going to end {}s after the current segment end",
                    overrun
                );
                self.add_delay(overrun, max_delay);
            }
        }

        if let Some(last) = self.last_checked {
            if hour_of(last) != hour_of(now) && self.delay_secs > 0 {
                if config.format_clocks.enabled {
                    warn!(
                        "hour has changed, resetting segment delay (currently: {}s)",
                        self.delay_secs
                    );
                    warn!(
                        "all segments scheduled between {} and {} will be missed",
                        (next_starts - Duration::seconds(self.delay_secs)).format("%T"),
                        (next_starts - Duration::seconds(1)).format("%T")
                    );
                }
                self.delay_secs = 0;
            }
        }
        self.last_checked = Some(now);

        let mut delayed = next_starts - Duration::seconds(self.delay_secs);
        let segment_id = self.lookup(delayed, loader)?;

        let expired = segment.expired(next_starts);
        let segment_changed = !segment.loaded || segment_id != segment.segment_id;
        if !(segment_changed || *force_reload || expired) {
            debug!(
                segment = segment.segment_id,
                "no segment change, {} segment plays until {}",
                segment.cat,
                segment.end().format("%T")
            );
            return Ok(ResolveOutcome::default());
        }

        *force_reload = false;
        info!(segment = segment_id, "loading format clock segment");
        let mut fresh = loader.load(segment_id, delayed)?;

        let into_segment = (delayed - fresh.scheduled_start).num_seconds();
        if into_segment < 0 {
            return Err(PlayerError::logic(format!(
                "segment {} starts {}s after the time it was loaded for",
                segment_id, -into_segment
            )));
        }
        if into_segment > 0 {
            debug!("currently {}s into the new segment, compensating", into_segment);
            self.add_delay(into_segment, max_delay);
            delayed = next_starts - Duration::seconds(self.delay_secs);
        }

        fresh.started_at = next_starts;
        fresh.length_secs = (fresh.scheduled_end - delayed).num_seconds() + 1;

        if fresh.cat == Category::Music && fresh.length_secs > MIN_RECLAIMED_MUSIC_SECS {
            let new_length = (fresh.length_secs - self.delay_secs).max(MIN_RECLAIMED_MUSIC_SECS);
            let reclaimed = fresh.length_secs - new_length;
            if reclaimed > 0 {
                info!(
                    "reclaiming {}s of segment delay from the current music segment",
                    reclaimed
                );
                self.delay_secs -= reclaimed;
                fresh.length_secs -= reclaimed;
            }
        }

        info!(
            segment = fresh.segment_id,
            "{} segment will play between {} and {} ({}s)",
            fresh.cat,
            fresh.started_at.format("%T"),
            fresh.end().format("%T"),
            fresh.length_secs
        );
        *segment = fresh;
        Ok(ResolveOutcome {
            reloaded: true,
            segment_changed,
        })
    }

    /// Segment id for `at`: scheduled clock, then default clock, then the
    /// music profile.
    fn lookup(&self, at: NaiveDateTime, loader: &SegmentLoader<'_>) -> Result<i64> {
        let clocks = &loader.config.format_clocks;
        if !clocks.enabled {
            debug!("format clocks are disabled, using a music profile");
            return Ok(MUSIC_PROFILE_SEGMENT);
        }

        let repo = loader.repo;
        let in_hour = NaiveTime::from_hms_opt(0, at.minute(), at.second()).unwrap_or(NaiveTime::MIN);
        debug!("fetching format clock and segment scheduled for {}", at.format("%T"));

        match repo.scheduled_format_clock(at)? {
            Some(fc) => match repo.format_clock_segment(fc, in_hour)? {
                Some(id) => return Ok(id),
                None => warn!(fc, "could not find a segment in the format clock, reverting to the default format clock"),
            },
            None => warn!("no format clocks scheduled for this hour, reverting to the default format clock"),
        }

        let fc = clocks.default_clock;
        if fc <= 0 {
            warn!("default format clock is not set, reverting to a music profile");
            return Ok(MUSIC_PROFILE_SEGMENT);
        }
        if !repo.format_clock_exists(fc)? {
            warn!(fc, "could not find the default format clock, reverting to a music profile");
            return Ok(MUSIC_PROFILE_SEGMENT);
        }
        match repo.format_clock_segment(fc, in_hour)? {
            Some(id) => Ok(id),
            None => {
                warn!(fc, "default format clock has no segment for this time, using a music profile");
                Ok(MUSIC_PROFILE_SEGMENT)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlayerConfig;
    use crate::history::MusicHistory;
    use crate::repository::{ClockScheduleRow, FormatClockRow, JsonScheduleStore, ScheduleTables, SegmentRow};
    use crate::tags::StaticTagReader;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: JsonScheduleStore,
        tags: StaticTagReader,
        history: MusicHistory,
        config: PlayerConfig,
    }

    impl Fixture {
        fn loader(&self) -> SegmentLoader<'_> {
            SegmentLoader {
                repo: &self.store,
                tags: &self.tags,
                history: &self.history,
                config: &self.config,
                today: at(10, 0, 0).date(),
            }
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn t(m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(0, m, s).unwrap()
    }

    fn make_segment(id: i64, category: &str, dir: &std::path::Path, start: NaiveTime, end: NaiveTime) -> SegmentRow {
        SegmentRow {
            id,
            fc_id: 1,
            fc_name: String::new(),
            seg_no: id as i32,
            start,
            end,
            category: category.into(),
            sub_cat: dir.to_string_lossy().to_string(),
            alt_category: String::new(),
            alt_sub_cat: String::new(),
            sequence: "random".into(),
            specific_media: String::new(),
            promos: true,
            music_bed_sub_cat: None,
            crossfading: true,
            max_age: None,
            premature: false,
            repeat: true,
            max_items: None,
        }
    }

    /// News for the first ten minutes of every hour, music for the rest.
    fn make_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        let news = dir.path().join("news");
        fs::create_dir_all(&music).unwrap();
        fs::create_dir_all(&news).unwrap();
        for n in 1..=12 {
            fs::write(music.join(format!("song{:02}.mp3", n)), b"ID3").unwrap();
        }
        for n in 1..=3 {
            fs::write(news.join(format!("news{}.mp3", n)), b"ID3").unwrap();
        }

        let mut config = PlayerConfig::default();
        config.dirs.mp3 = music.clone();
        config.format_clocks.enabled = true;

        let mut tables = ScheduleTables::default();
        tables.format_clocks.push(FormatClockRow {
            id: 1,
            name: "Daytime".into(),
        });
        tables.clock_schedule.push(ClockScheduleRow {
            id: 1,
            fc_id: 1,
            date: None,
            weekday: None,
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        });
        tables.segments.push(make_segment(10, "news", &news, t(0, 0), t(9, 59)));
        tables.segments.push(make_segment(11, "music", &music, t(10, 0), t(59, 59)));

        Fixture {
            _dir: dir,
            store: JsonScheduleStore::new(tables),
            tags: StaticTagReader::new(),
            history: MusicHistory::new(),
            config,
        }
    }

    #[test]
    fn disabled_clocks_use_music_profile_until_end_of_hour() {
        let mut f = make_fixture();
        f.config.format_clocks.enabled = false;
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;

        let outcome = resolver
            .resolve(at(10, 20, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert!(outcome.reloaded && outcome.segment_changed);
        assert_eq!(seg.segment_id, MUSIC_PROFILE_SEGMENT);
        assert_eq!(seg.length_secs, 40 * 60);
        assert_eq!(seg.end(), at(10, 59, 59));
        assert!(!seg.elements().is_empty());
    }

    #[test]
    fn unchanged_segment_is_kept() {
        let f = make_fixture();
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;
        resolver
            .resolve(at(10, 20, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        let generation = seg.generation();

        let outcome = resolver
            .resolve(at(10, 25, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert_eq!(outcome, ResolveOutcome::default());
        assert_eq!(seg.generation(), generation);
    }

    #[test]
    fn joining_mid_segment_delays_the_schedule() {
        let f = make_fixture();
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;

        resolver
            .resolve(at(10, 5, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert_eq!(seg.segment_id, 10);
        assert_eq!(resolver.delay_secs(), 300);
        // The news segment gets its full ten minutes.
        assert_eq!(seg.length_secs, 600);
        assert_eq!(seg.end(), at(10, 14, 59));
    }

    #[test]
    fn delay_is_capped() {
        let f = make_fixture();
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;

        resolver
            .resolve(at(10, 9, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert_eq!(resolver.delay_secs(), f.config.max_segment_delay_secs);
        assert_eq!(seg.length_secs, 7 * 60);
    }

    #[test]
    fn overrun_is_reclaimed_by_next_music_segment() {
        let f = make_fixture();
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;
        resolver
            .resolve(at(10, 5, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();

        // The news item runs 30s past the delayed segment end.
        let outcome = resolver
            .resolve(at(10, 15, 30), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert!(outcome.segment_changed);
        assert_eq!(seg.segment_id, 11);
        assert_eq!(resolver.delay_secs(), 0);
        assert_eq!(seg.end(), at(10, 59, 59));
    }

    #[test]
    fn hour_change_resets_delay() {
        let f = make_fixture();
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;
        resolver
            .resolve(at(10, 5, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert!(resolver.delay_secs() > 0);

        resolver
            .resolve(at(11, 0, 10), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert_eq!(seg.segment_id, 10);
        assert_eq!(seg.started_at, at(11, 0, 10));
        // Ten seconds into the new news segment.
        assert_eq!(resolver.delay_secs(), 10);
    }

    #[test]
    fn expired_segment_is_reloaded() {
        let mut f = make_fixture();
        f.config.format_clocks.enabled = false;
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;
        resolver
            .resolve(at(10, 50, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();

        let outcome = resolver
            .resolve(at(10, 59, 0), 90_000, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert!(outcome.reloaded);
        assert!(!outcome.segment_changed);
        assert_eq!(seg.started_at, at(11, 0, 30));
    }

    #[test]
    fn force_reload_is_consumed() {
        let f = make_fixture();
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;
        resolver
            .resolve(at(10, 20, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();

        force = true;
        let outcome = resolver
            .resolve(at(10, 21, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert!(outcome.reloaded);
        assert!(!force);
    }

    #[test]
    fn unscheduled_time_uses_default_clock_then_profile() {
        let mut f = make_fixture();
        f.store.tables.clock_schedule.clear();
        f.config.format_clocks.default_clock = 1;
        let mut resolver = SegmentResolver::new();
        let mut seg = Segment::default();
        let mut force = false;
        resolver
            .resolve(at(10, 20, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert_eq!(seg.segment_id, 11);

        f.config.format_clocks.default_clock = 5;
        let mut seg = Segment::default();
        resolver.reset();
        resolver
            .resolve(at(10, 20, 0), 0, &mut seg, &mut force, &f.loader())
            .unwrap();
        assert_eq!(seg.segment_id, MUSIC_PROFILE_SEGMENT);
    }
}
