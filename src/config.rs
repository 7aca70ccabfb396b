use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

pub const DEFAULT_CROSSFADE_MS: i64 = 8000;
pub const MIN_CROSSFADE_MS: i64 = 500;
pub const MAX_CROSSFADE_MS: i64 = 30_000;
pub const DEFAULT_MINS_TO_MISS_PROMOS: i64 = 15;
pub const DEFAULT_MAX_PROMOS_PER_BATCH: usize = 3;
/// Hard ceiling on batch size; the clash search is factorial in it.
pub const MAX_PROMOS_PER_BATCH_CEILING: usize = 10;
pub const DEFAULT_MIN_MINS_BETWEEN_BATCHES: i64 = 4;
pub const DEFAULT_MAX_SEGMENT_DELAY_SECS: i64 = 6 * 60;
pub const DEFAULT_REPEAT_PREVENTION_PERCENT: u32 = 75;

/// Media directories the player reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dirs {
    pub mp3: PathBuf,
    pub adverts: PathBuf,
    pub announcements: PathBuf,
    pub specials: PathBuf,
    pub profiles: PathBuf,
    pub today: PathBuf,
    pub received: PathBuf,
}

impl Default for Dirs {
    fn default() -> Self {
        let root = PathBuf::from("media");
        Dirs {
            mp3: root.join("mp3"),
            adverts: root.join("adverts"),
            announcements: root.join("announcements"),
            specials: root.join("specials"),
            profiles: root.join("profiles"),
            today: root.join("today"),
            received: root.join("received"),
        }
    }
}

/// Announcement frequency capping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromoConfig {
    /// Promos more than this many minutes late are considered missed.
    pub mins_to_miss_after: i64,
    pub max_per_batch: usize,
    pub min_mins_between_batches: i64,
    /// Hold unforced promos until the current song ends.
    pub wait_for_song_end: bool,
}

impl Default for PromoConfig {
    fn default() -> Self {
        PromoConfig {
            mins_to_miss_after: DEFAULT_MINS_TO_MISS_PROMOS,
            max_per_batch: DEFAULT_MAX_PROMOS_PER_BATCH,
            min_mins_between_batches: DEFAULT_MIN_MINS_BETWEEN_BATCHES,
            wait_for_song_end: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatClockConfig {
    pub enabled: bool,
    /// Format clock used when none is scheduled. Values <= 0 mean "none".
    pub default_clock: i64,
}

impl Default for FormatClockConfig {
    fn default() -> Self {
        FormatClockConfig {
            enabled: false,
            default_clock: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            delay_ms: 5000,
            max_attempts: None,
        }
    }
}

/// Player settings, loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub dirs: Dirs,
    /// Source used by the default music profile. Empty means `dirs.mp3`.
    pub default_music_source: String,
    pub promos: PromoConfig,
    pub format_clocks: FormatClockConfig,
    pub crossfade_length_ms: i64,
    pub max_segment_delay_secs: i64,
    pub repeat_prevention_percent: u32,
    pub tag_cache: PathBuf,
    pub retry: RetryConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            dirs: Dirs::default(),
            default_music_source: String::new(),
            promos: PromoConfig::default(),
            format_clocks: FormatClockConfig::default(),
            crossfade_length_ms: DEFAULT_CROSSFADE_MS,
            max_segment_delay_secs: DEFAULT_MAX_SEGMENT_DELAY_SECS,
            repeat_prevention_percent: DEFAULT_REPEAT_PREVENTION_PERCENT,
            tag_cache: PathBuf::from("mp3_tags.json"),
            retry: RetryConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: PlayerConfig = toml::from_str(text)?;
        config.validate();
        Ok(config)
    }

    /// Replace out-of-range settings with their defaults, logging each one.
    pub fn validate(&mut self) {
        let p = &mut self.promos;
        if p.mins_to_miss_after <= 0 || p.mins_to_miss_after >= 10_000 {
            warn!(
                value = p.mins_to_miss_after,
                "promos.mins_to_miss_after is invalid, defaulting to {}", DEFAULT_MINS_TO_MISS_PROMOS
            );
            p.mins_to_miss_after = DEFAULT_MINS_TO_MISS_PROMOS;
        }
        if p.max_per_batch == 0 || p.max_per_batch > MAX_PROMOS_PER_BATCH_CEILING {
            warn!(
                value = p.max_per_batch,
                "promos.max_per_batch is invalid, defaulting to {}", DEFAULT_MAX_PROMOS_PER_BATCH
            );
            p.max_per_batch = DEFAULT_MAX_PROMOS_PER_BATCH;
        }
        if !(0..=60).contains(&p.min_mins_between_batches) {
            warn!(
                value = p.min_mins_between_batches,
                "promos.min_mins_between_batches is invalid, defaulting to {}",
                DEFAULT_MIN_MINS_BETWEEN_BATCHES
            );
            p.min_mins_between_batches = DEFAULT_MIN_MINS_BETWEEN_BATCHES;
        }

        if self.crossfade_length_ms <= 0 {
            warn!(
                value = self.crossfade_length_ms,
                "crossfade_length_ms is invalid, defaulting to {}", DEFAULT_CROSSFADE_MS
            );
            self.crossfade_length_ms = DEFAULT_CROSSFADE_MS;
        } else if !(MIN_CROSSFADE_MS..=MAX_CROSSFADE_MS).contains(&self.crossfade_length_ms) {
            let clamped = self.crossfade_length_ms.clamp(MIN_CROSSFADE_MS, MAX_CROSSFADE_MS);
            warn!(
                value = self.crossfade_length_ms,
                "crossfade_length_ms out of range, clamped to {}", clamped
            );
            self.crossfade_length_ms = clamped;
        }

        if self.max_segment_delay_secs < 0 {
            warn!(
                value = self.max_segment_delay_secs,
                "max_segment_delay_secs is invalid, defaulting to {}", DEFAULT_MAX_SEGMENT_DELAY_SECS
            );
            self.max_segment_delay_secs = DEFAULT_MAX_SEGMENT_DELAY_SECS;
        }

        if self.repeat_prevention_percent > 100 {
            warn!(
                value = self.repeat_prevention_percent,
                "repeat_prevention_percent is invalid, defaulting to {}",
                DEFAULT_REPEAT_PREVENTION_PERCENT
            );
            self.repeat_prevention_percent = DEFAULT_REPEAT_PREVENTION_PERCENT;
        }

        if self.format_clocks.enabled && self.format_clocks.default_clock <= 0 {
            warn!("format clocks are enabled but no default format clock is set");
        }
    }

    /// Log (but do not fail on) media directories that are missing.
    pub fn check_dirs(&self) -> usize {
        let d = &self.dirs;
        let checks = [
            ("mp3", &d.mp3),
            ("adverts", &d.adverts),
            ("announcements", &d.announcements),
            ("specials", &d.specials),
            ("profiles", &d.profiles),
            ("today", &d.today),
            ("received", &d.received),
        ];
        let mut missing = 0;
        for (name, dir) in checks {
            if !dir.is_dir() {
                error!(dir = %dir.display(), "{} directory not found", name);
                missing += 1;
            }
        }
        missing
    }

    /// Source used by the default music profile.
    pub fn music_profile_source(&self) -> String {
        if self.default_music_source.trim().is_empty() {
            self.dirs.mp3.to_string_lossy().to_string()
        } else {
            self.default_music_source.clone()
        }
    }
}
