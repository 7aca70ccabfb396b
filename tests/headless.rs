//! Headless integration tests for instore_player.
//!
//! These drive `PlaybackScheduler` end to end with in-memory audio sessions,
//! a JSON schedule store and a manual clock. No audio device is needed.

use chrono::{NaiveDate, NaiveTime};
use instore_player::audio::{AudioSession, LineInput, MemoryLineIn, MemorySession};
use instore_player::clock::ManualClock;
use instore_player::config::PlayerConfig;
use instore_player::element::Category;
use instore_player::repository::{
    ClockScheduleRow, FormatClockRow, JsonScheduleStore, PromoRow, PromoStatus, ScheduleTables, SegmentRow,
};
use instore_player::resources::SessionUsage;
use instore_player::scheduler::{PlaybackScheduler, PlayerContext};
use instore_player::segment::PlaybackState;
use instore_player::tags::StaticTagReader;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Station {
    dir: TempDir,
    config: PlayerConfig,
    tables: ScheduleTables,
}

struct Running {
    _dir: TempDir,
    sessions: Vec<MemorySession>,
    line_in: MemoryLineIn,
    scheduler: PlaybackScheduler,
}

fn write_stubs(dir: &Path, prefix: &str, count: usize) {
    fs::create_dir_all(dir).unwrap();
    for n in 1..=count {
        fs::write(dir.join(format!("{}{:02}.mp3", prefix, n)), b"ID3").unwrap();
    }
}

fn make_station(songs: usize) -> Station {
    let dir = TempDir::new().unwrap();
    let mut config = PlayerConfig::default();
    config.dirs.mp3 = dir.path().join("mp3");
    config.dirs.adverts = dir.path().join("adverts");
    config.dirs.announcements = dir.path().join("announcements");
    config.dirs.specials = dir.path().join("specials");
    for d in [&config.dirs.adverts, &config.dirs.announcements, &config.dirs.specials] {
        fs::create_dir_all(d).unwrap();
    }
    write_stubs(&config.dirs.mp3, "song", songs);
    config.repeat_prevention_percent = 0;

    let mut tables = ScheduleTables::default();
    tables.store_status.open = true;
    Station { dir, config, tables }
}

impl Station {
    fn start(self, item_length_ms: i64) -> Running {
        let clock = ManualClock::default();
        let sessions: Vec<MemorySession> = (0..4).map(|_| MemorySession::new(clock.clone())).collect();
        for s in &sessions {
            s.set_default_length(item_length_ms);
        }
        let line_in = MemoryLineIn::new();
        let ctx = PlayerContext::new(
            self.config,
            Box::new(JsonScheduleStore::new(self.tables)),
            Box::new(StaticTagReader::new()),
            Box::new(clock),
            sessions.iter().map(|s| Box::new(s.clone()) as Box<dyn AudioSession>).collect(),
            Box::new(line_in.clone()),
        );
        Running {
            _dir: self.dir,
            sessions,
            line_in,
            scheduler: PlaybackScheduler::new(ctx).unwrap(),
        }
    }

    fn add_promo(&mut self, slot_id: i64, announcer: &str) {
        let filename = format!("ad{}.mp3", slot_id);
        fs::write(self.config.dirs.adverts.join(&filename), b"ID3").unwrap();
        let start = NaiveTime::from_hms_opt(9, 58, 0).unwrap();
        self.tables.promos.push(PromoRow {
            slot_id,
            filename,
            category: String::new(),
            day: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            slot_start: start,
            slot_end: start,
            forced_time: None,
            priority: "B".into(),
            volume: "ADV".into(),
            announcer: announcer.into(),
            check_lifespan: false,
            prerec_mediaref: None,
            status: PromoStatus::SnsLoaded,
            played_at: None,
            miss_logged: false,
        });
    }

    /// One format clock, scheduled all day, with a single hour-long segment.
    fn add_hourly_segment(&mut self, category: &str, sub_cat: &str, alt_category: &str, alt_sub_cat: &str) {
        self.config.format_clocks.enabled = true;
        self.tables.format_clocks.push(FormatClockRow {
            id: 1,
            name: "Weekday".into(),
        });
        self.tables.clock_schedule.push(ClockScheduleRow {
            id: 1,
            fc_id: 1,
            date: None,
            weekday: None,
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        });
        self.tables.segments.push(SegmentRow {
            id: 20,
            fc_id: 1,
            fc_name: String::new(),
            seg_no: 1,
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(0, 59, 59).unwrap(),
            category: category.into(),
            sub_cat: sub_cat.into(),
            alt_category: alt_category.into(),
            alt_sub_cat: alt_sub_cat.into(),
            sequence: "random".into(),
            specific_media: String::new(),
            promos: false,
            music_bed_sub_cat: None,
            crossfading: true,
            max_age: None,
            premature: false,
            repeat: true,
            max_items: None,
        });
    }
}

fn current_path(run: &Running) -> Option<PathBuf> {
    run.scheduler.run_data().current.media.path().map(Path::to_path_buf)
}

// ── Start-up ──────────────────────────────────────────────────────────────

#[test]
fn first_start_plays_music_in_one_cycle() {
    let mut run = make_station(5).start(180_000);
    run.scheduler.run_cycle().unwrap();

    let data = run.scheduler.run_data();
    assert!(data.current.loaded);
    assert!(data.current.is_music());
    assert!(!data.next.loaded);
    let id = data.allocator.find_by_usage(SessionUsage::CurrentForeground).unwrap();
    assert!(run.sessions[id].is_playing().unwrap());
    assert_eq!(run.sessions[id].volume().unwrap(), 80);
    assert_eq!(run.line_in.volume().unwrap(), 0);
    run.scheduler.check_playback_status().unwrap();
}

// ── Transitions ───────────────────────────────────────────────────────────

#[test]
fn songs_crossfade_under_the_safety_margin() {
    let mut run = make_station(6).start(40_000);
    let mut played = Vec::new();
    for _ in 0..150 {
        run.scheduler.run_cycle().unwrap();
        if let Some(path) = current_path(&run) {
            if played.last() != Some(&path) {
                played.push(path);
            }
        }
    }

    assert!(played.len() >= 4, "only played {:?}", played);
    // Crossfades ramp volumes through intermediate levels on some session.
    let ramped = run
        .sessions
        .iter()
        .any(|s| s.volume_log().iter().any(|v| *v > 0 && *v < 80));
    assert!(ramped);
    run.scheduler.check_playback_status().unwrap();
}

// ── Promos ────────────────────────────────────────────────────────────────

#[test]
fn promo_batch_interrupts_music_and_separates_announcers() {
    let mut station = make_station(5);
    station.config.promos.max_per_batch = 4;
    station.add_promo(1, "anna");
    station.add_promo(2, "anna");
    station.add_promo(3, "ben");
    station.add_promo(4, "cleo");
    let mut run = station.start(30_000);

    let mut slots: Vec<i64> = Vec::new();
    for _ in 0..200 {
        run.scheduler.run_cycle().unwrap();
        if let Some(promo) = &run.scheduler.run_data().current.promo {
            if slots.last() != Some(&promo.slot_id) {
                slots.push(promo.slot_id);
            }
        }
    }

    let mut sorted = slots.clone();
    sorted.sort();
    assert_eq!(sorted, vec![1, 2, 3, 4], "played {:?}", slots);
    let by_anna = |slot: i64| slot <= 2;
    for pair in slots.windows(2) {
        assert!(
            !(by_anna(pair[0]) && by_anna(pair[1])),
            "same announcer twice in a row: {:?}",
            slots
        );
    }
    assert_eq!(run.scheduler.run_data().current.category, Category::Music);
}

// ── Fallback ladder ───────────────────────────────────────────────────────

#[test]
fn missing_category_falls_back_to_alternate() {
    let mut station = make_station(5);
    let alt = station.dir.path().join("alt");
    write_stubs(&alt, "alt", 3);
    let missing = station.dir.path().join("no_such_news");
    station.add_hourly_segment(
        "news",
        &missing.to_string_lossy(),
        "music",
        &alt.to_string_lossy(),
    );
    let mut run = station.start(180_000);
    run.scheduler.run_cycle().unwrap();

    let data = run.scheduler.run_data();
    assert_eq!(data.segment.playback_state, PlaybackState::Alternate);
    assert!(current_path(&run).unwrap().starts_with(&alt));
}

#[test]
fn missing_alternate_falls_back_to_default_music() {
    let mut station = make_station(5);
    let music = station.config.dirs.mp3.clone();
    let missing = station.dir.path().join("no_such_news");
    let missing_alt = station.dir.path().join("no_such_alt");
    station.add_hourly_segment(
        "news",
        &missing.to_string_lossy(),
        "music",
        &missing_alt.to_string_lossy(),
    );
    let mut run = station.start(180_000);
    run.scheduler.run_cycle().unwrap();

    let data = run.scheduler.run_data();
    assert_eq!(data.segment.playback_state, PlaybackState::DefaultMusic);
    assert!(data.current.is_music());
    assert!(current_path(&run).unwrap().starts_with(&music));
}

// ── Recovery ──────────────────────────────────────────────────────────────

#[test]
fn failed_cycle_resets_and_playback_recovers() {
    let mut run = make_station(5).start(180_000);
    run.scheduler.run_cycle().unwrap();
    let id = run
        .scheduler
        .run_data()
        .allocator
        .find_by_usage(SessionUsage::CurrentForeground)
        .unwrap();

    // Something outside the player stops the output.
    run.sessions[id].clone().stop().unwrap();
    assert!(run.scheduler.run_cycle().is_err());

    let data = run.scheduler.run_data();
    assert!(!data.current.loaded);
    assert!(!data.next.loaded);
    assert!(data.allocator.usages().iter().all(|u| *u == SessionUsage::Unused));
    assert!(run.sessions.iter().all(|s| !s.is_playing().unwrap()));

    run.scheduler.run_cycle().unwrap();
    assert!(run.scheduler.run_data().current.is_music());
    run.scheduler.check_playback_status().unwrap();
}

#[test]
fn history_survives_a_reset() {
    let mut run = make_station(5).start(180_000);
    run.scheduler.run_cycle().unwrap();
    let before = run.scheduler.run_data().history.len();
    assert_eq!(before, 1);

    run.scheduler.reset_playback();
    assert_eq!(run.scheduler.run_data().history.len(), before);
}
