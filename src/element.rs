use crate::error::{PlayerError, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Source string that selects the store's line input instead of a file.
pub const LINE_IN_MARKER: &str = "LineIn";

/// Content category of a format-clock segment or programming element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Unknown,
    Imaging,
    Music,
    News,
    Sweepers,
    Links,
    Entertainment,
    Promos,
    MusicBed,
    Silence,
}

impl Default for Category {
    fn default() -> Self {
        Category::Unknown
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Unknown => "unknown",
            Category::Imaging => "imaging",
            Category::Music => "music",
            Category::News => "news",
            Category::Sweepers => "sweepers",
            Category::Links => "links",
            Category::Entertainment => "entertainment",
            Category::Promos => "promos",
            Category::MusicBed => "music bed",
            Category::Silence => "silence",
        };
        write!(f, "{}", name)
    }
}

impl Category {
    /// Parse a category name (case-insensitive, as stored in the schedule).
    pub fn from_str_loose(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "imaging" => Ok(Category::Imaging),
            "music" => Ok(Category::Music),
            "news" => Ok(Category::News),
            "sweepers" => Ok(Category::Sweepers),
            "links" => Ok(Category::Links),
            "entertainment" => Ok(Category::Entertainment),
            "promos" => Ok(Category::Promos),
            "music bed" | "musicbed" => Ok(Category::MusicBed),
            "silence" => Ok(Category::Silence),
            _ => Err(PlayerError::Config(format!(
                "Unknown segment category '{}'",
                s
            ))),
        }
    }
}

/// How loud a programming element should play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeClass {
    /// The store's music volume.
    Music,
    /// The store's announcement volume.
    Promo,
    /// A percentage of the announcement volume.
    Percent(u8),
}

impl Default for VolumeClass {
    fn default() -> Self {
        VolumeClass::Music
    }
}

impl VolumeClass {
    /// Interpret the volume column of a waiting announcement.
    pub fn from_promo_field(s: &str) -> Self {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return VolumeClass::Percent(n.clamp(0, 100) as u8);
        }
        match s.to_uppercase().as_str() {
            "MUS" | "MUSIC" => VolumeClass::Music,
            "ADV" | "PROMO" => VolumeClass::Promo,
            _ => VolumeClass::Percent(100),
        }
    }

    /// Actual engine volume (0..100) for this class under the store's levels.
    pub fn resolve(&self, volumes: &StoreVolumes) -> Result<u8> {
        match self {
            VolumeClass::Music => Ok(volumes.music),
            VolumeClass::Promo => Ok(volumes.announce),
            VolumeClass::Percent(p) if *p <= 100 => {
                Ok(((volumes.announce as u32 * *p as u32) / 100) as u8)
            }
            VolumeClass::Percent(p) => Err(PlayerError::Config(format!(
                "Invalid volume percentage {}",
                p
            ))),
        }
    }
}

/// Where an element's audio comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MediaRef {
    /// Nothing to play (silence, or an unloaded slot).
    Nothing,
    File(PathBuf),
    LineIn,
}

impl MediaRef {
    pub fn path(&self) -> Option<&Path> {
        match self {
            MediaRef::File(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaRef::File(p) => write!(f, "{}", p.display()),
            MediaRef::LineIn => write!(f, "{}", LINE_IN_MARKER),
            MediaRef::Nothing => write!(f, "<nothing>"),
        }
    }
}

/// A quieter track layered under a foreground item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicBed {
    pub media: PathBuf,
    pub volume: VolumeClass,
    /// Offset into the foreground item where the bed starts.
    pub start_ms: i64,
    pub length_ms: i64,
    #[serde(default)]
    pub start_handled: bool,
    #[serde(default)]
    pub stop_handled: bool,
}

impl MusicBed {
    pub fn new(media: PathBuf) -> Self {
        MusicBed {
            media,
            volume: VolumeClass::Music,
            start_ms: 0,
            length_ms: 60 * 60 * 1000,
            start_handled: false,
            stop_handled: false,
        }
    }
}

/// Promo bookkeeping carried by an announcement element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoInfo {
    /// Schedule row to mark "played" once the promo starts.
    pub slot_id: i64,
    pub forced: bool,
}

/// One playable unit: a song, announcement, sweeper, silence or line input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgrammingElement {
    pub category: Category,
    pub media: MediaRef,
    pub volume: VolumeClass,
    pub music_bed: Option<MusicBed>,
    pub promo: Option<PromoInfo>,
    pub started_at: Option<NaiveDateTime>,
    pub loaded: bool,
}

impl Default for ProgrammingElement {
    fn default() -> Self {
        ProgrammingElement {
            category: Category::Unknown,
            media: MediaRef::Nothing,
            volume: VolumeClass::Music,
            music_bed: None,
            promo: None,
            started_at: None,
            loaded: false,
        }
    }
}

impl ProgrammingElement {
    /// An element that plays a file, with the volume class its category implies.
    pub fn file(category: Category, path: impl Into<PathBuf>) -> Self {
        ProgrammingElement {
            category,
            media: MediaRef::File(path.into()),
            volume: if category == Category::Music {
                VolumeClass::Music
            } else {
                VolumeClass::Promo
            },
            loaded: true,
            ..Default::default()
        }
    }

    pub fn music(path: impl Into<PathBuf>) -> Self {
        Self::file(Category::Music, path)
    }

    pub fn line_in(category: Category) -> Self {
        ProgrammingElement {
            category,
            media: MediaRef::LineIn,
            volume: VolumeClass::Music,
            loaded: true,
            ..Default::default()
        }
    }

    pub fn silence() -> Self {
        ProgrammingElement {
            category: Category::Silence,
            media: MediaRef::Nothing,
            volume: VolumeClass::Percent(0),
            loaded: true,
            ..Default::default()
        }
    }

    pub fn promo(path: impl Into<PathBuf>, volume: VolumeClass, slot_id: i64, forced: bool) -> Self {
        ProgrammingElement {
            category: Category::Promos,
            media: MediaRef::File(path.into()),
            volume,
            promo: Some(PromoInfo { slot_id, forced }),
            loaded: true,
            ..Default::default()
        }
    }

    pub fn is_line_in(&self) -> bool {
        self.media == MediaRef::LineIn
    }

    pub fn is_silence(&self) -> bool {
        self.category == Category::Silence
    }

    pub fn is_music(&self) -> bool {
        self.category == Category::Music
    }

    pub fn is_promo(&self) -> bool {
        self.category == Category::Promos
    }

    /// True if the element plays through an audio session (not line input or silence).
    pub fn uses_session(&self) -> bool {
        self.loaded && !self.is_silence() && !self.is_line_in()
    }

    /// Same category and media: silence-to-silence, line-in-to-line-in.
    pub fn same_source_as(&self, other: &ProgrammingElement) -> bool {
        self.category == other.category && self.media == other.media
    }

    pub fn reset(&mut self) {
        *self = ProgrammingElement::default();
    }
}

/// Output levels configured for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVolumes {
    pub music: u8,
    pub announce: u8,
    pub line_in: u8,
}

impl Default for StoreVolumes {
    fn default() -> Self {
        StoreVolumes {
            music: 80,
            announce: 100,
            line_in: 80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub open: bool,
    #[serde(default)]
    pub volumes: StoreVolumes,
}

impl Default for StoreStatus {
    fn default() -> Self {
        StoreStatus {
            open: true,
            volumes: StoreVolumes::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!(Category::from_str_loose("MUSIC").unwrap(), Category::Music);
        assert_eq!(Category::from_str_loose("Music Bed").unwrap(), Category::MusicBed);
        assert_eq!(Category::from_str_loose("music_bed").unwrap(), Category::MusicBed);
        assert_eq!(Category::from_str_loose(" silence ").unwrap(), Category::Silence);
        assert!(Category::from_str_loose("jazz").is_err());
    }

    #[test]
    fn promo_volume_field_interpretation() {
        assert_eq!(VolumeClass::from_promo_field("50"), VolumeClass::Percent(50));
        assert_eq!(VolumeClass::from_promo_field("150"), VolumeClass::Percent(100));
        assert_eq!(VolumeClass::from_promo_field("-5"), VolumeClass::Percent(0));
        assert_eq!(VolumeClass::from_promo_field("MUS"), VolumeClass::Music);
        assert_eq!(VolumeClass::from_promo_field("adv"), VolumeClass::Promo);
        assert_eq!(VolumeClass::from_promo_field("loud"), VolumeClass::Percent(100));
    }

    #[test]
    fn volume_resolves_against_store_levels() {
        let v = StoreVolumes { music: 70, announce: 90, line_in: 60 };
        assert_eq!(VolumeClass::Music.resolve(&v).unwrap(), 70);
        assert_eq!(VolumeClass::Promo.resolve(&v).unwrap(), 90);
        assert_eq!(VolumeClass::Percent(50).resolve(&v).unwrap(), 45);
        assert!(VolumeClass::Percent(101).resolve(&v).is_err());
    }

    #[test]
    fn file_element_volume_follows_category() {
        assert_eq!(ProgrammingElement::music("a.mp3").volume, VolumeClass::Music);
        let sweeper = ProgrammingElement::file(Category::Sweepers, "s.mp3");
        assert_eq!(sweeper.volume, VolumeClass::Promo);
        assert!(sweeper.uses_session());
    }

    #[test]
    fn silence_and_line_in_are_distinct() {
        let silence = ProgrammingElement::silence();
        let line_in = ProgrammingElement::line_in(Category::Music);
        assert!(silence.is_silence() && !silence.is_line_in());
        assert!(line_in.is_line_in() && !line_in.is_silence());
        assert!(!silence.uses_session());
        assert!(!line_in.uses_session());
    }

    #[test]
    fn reset_unloads_element() {
        let mut pe = ProgrammingElement::promo("ad.mp3", VolumeClass::Promo, 7, false);
        pe.reset();
        assert!(!pe.loaded);
        assert!(pe.promo.is_none());
    }
}
