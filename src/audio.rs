use crate::clock::{Clock, ManualClock};
use crate::error::{PlayerError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One controllable audio-output channel of the playback engine.
pub trait AudioSession {
    fn play(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn is_paused(&self) -> Result<bool>;
    fn is_playing(&self) -> Result<bool>;
    fn is_running(&self) -> Result<bool>;
    fn set_volume(&mut self, volume: u8) -> Result<()>;
    fn volume(&self) -> Result<u8>;
    fn set_repeat(&mut self, repeat: bool) -> Result<()>;
    fn repeat(&self) -> Result<bool>;
    /// Empty the session's playlist.
    fn clear(&mut self) -> Result<()>;
    fn add_url(&mut self, path: &Path) -> Result<()>;
    fn position_ms(&self) -> Result<i64>;
    fn length_ms(&self) -> Result<i64>;
    fn title(&self) -> Result<String>;
    /// Path of the media currently loaded, if any.
    fn path(&self) -> Result<Option<PathBuf>>;

    /// True for sessions that are stopped rather than playing or paused.
    fn is_stopped(&self) -> Result<bool> {
        Ok(!self.is_playing()? && !self.is_paused()?)
    }
}

/// The store's line-level audio input, controlled only by its mixer level.
pub trait LineInput {
    fn set_volume(&mut self, volume: u8) -> Result<()>;
    fn volume(&self) -> Result<u8>;
}

const PROGRESS_POLL: Duration = Duration::from_millis(100);

/// Confirm a session that claims to be playing is actually moving forward.
///
/// Some engines report "playing" while frozen, so the position is polled
/// until it advances or `timeout` runs out.
pub fn verify_progress(session: &dyn AudioSession, clock: &dyn Clock, timeout: Duration) -> Result<()> {
    if !session.is_playing()? {
        return Err(PlayerError::Audio("session is not playing".into()));
    }
    let deadline = clock.monotonic() + timeout;
    let first = session.position_ms()?;
    while clock.monotonic() < deadline {
        clock.sleep(PROGRESS_POLL);
        if session.position_ms()? > first {
            return Ok(());
        }
    }
    Err(PlayerError::Audio(format!(
        "session reports playing but is frozen at {}ms",
        first
    )))
}

// --- In-memory engine ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug)]
struct MemoryState {
    transport: Transport,
    playlist: Vec<PathBuf>,
    lengths: HashMap<PathBuf, i64>,
    default_length_ms: i64,
    volume: u8,
    repeat: bool,
    /// Position accumulated before the latest play/resume.
    offset_ms: i64,
    /// Monotonic time of the latest play/resume.
    resumed_at: Duration,
    frozen: bool,
    running: bool,
    volume_log: Vec<u8>,
    played: Vec<PathBuf>,
}

/// A scriptable session whose position advances with a [`ManualClock`].
///
/// Clones share state, so a test can keep a handle while the scheduler owns
/// the boxed session.
#[derive(Debug, Clone)]
pub struct MemorySession {
    clock: ManualClock,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySession {
    pub fn new(clock: ManualClock) -> Self {
        MemorySession {
            clock,
            state: Arc::new(Mutex::new(MemoryState {
                transport: Transport::Stopped,
                playlist: Vec::new(),
                lengths: HashMap::new(),
                default_length_ms: 180_000,
                volume: 100,
                repeat: false,
                offset_ms: 0,
                resumed_at: Duration::ZERO,
                frozen: false,
                running: true,
                volume_log: Vec::new(),
                played: Vec::new(),
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Set the reported length of a media file.
    pub fn set_media_length(&self, path: &Path, length_ms: i64) {
        self.with_state(|s| {
            s.lengths.insert(path.to_path_buf(), length_ms);
        });
    }

    pub fn set_default_length(&self, length_ms: i64) {
        self.with_state(|s| s.default_length_ms = length_ms);
    }

    /// Stop the position from advancing while still reporting "playing".
    pub fn freeze(&self) {
        self.with_state(|s| s.frozen = true);
    }

    pub fn set_running(&self, running: bool) {
        self.with_state(|s| s.running = running);
    }

    /// Every volume the session has been set to, in order.
    pub fn volume_log(&self) -> Vec<u8> {
        self.with_state(|s| s.volume_log.clone())
    }

    /// Every file this session has started playing, in order.
    pub fn played(&self) -> Vec<PathBuf> {
        self.with_state(|s| s.played.clone())
    }

    fn current_length(s: &MemoryState) -> i64 {
        s.playlist
            .first()
            .map(|p| s.lengths.get(p).copied().unwrap_or(s.default_length_ms))
            .unwrap_or(0)
    }

    fn raw_position(&self, s: &MemoryState) -> i64 {
        match s.transport {
            Transport::Playing if !s.frozen => {
                let since = self.clock.monotonic().saturating_sub(s.resumed_at);
                s.offset_ms + since.as_millis() as i64
            }
            _ => s.offset_ms,
        }
    }

    fn position(&self, s: &MemoryState) -> i64 {
        self.raw_position(s).min(Self::current_length(s))
    }

    fn finished(&self, s: &MemoryState) -> bool {
        s.transport == Transport::Playing
            && !s.frozen
            && self.raw_position(s) >= Self::current_length(s)
    }
}

impl AudioSession for MemorySession {
    fn play(&mut self) -> Result<()> {
        let now = self.clock.monotonic();
        self.with_state(|s| {
            let Some(first) = s.playlist.first().cloned() else {
                return Err(PlayerError::Audio("nothing queued to play".into()));
            };
            if s.transport == Transport::Stopped {
                s.offset_ms = 0;
                s.played.push(first);
            }
            s.transport = Transport::Playing;
            s.resumed_at = now;
            Ok(())
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.with_state(|s| {
            s.transport = Transport::Stopped;
            s.offset_ms = 0;
        });
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.with_state(|s| {
            if s.transport == Transport::Playing {
                s.offset_ms = self.position(s);
                s.transport = Transport::Paused;
            }
        });
        Ok(())
    }

    fn is_paused(&self) -> Result<bool> {
        Ok(self.with_state(|s| s.transport == Transport::Paused))
    }

    fn is_playing(&self) -> Result<bool> {
        Ok(self.with_state(|s| s.transport == Transport::Playing && !self.finished(s)))
    }

    fn is_running(&self) -> Result<bool> {
        Ok(self.with_state(|s| s.running))
    }

    fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::Audio(format!("invalid volume {}", volume)));
        }
        self.with_state(|s| {
            s.volume = volume;
            s.volume_log.push(volume);
        });
        Ok(())
    }

    fn volume(&self) -> Result<u8> {
        Ok(self.with_state(|s| s.volume))
    }

    fn set_repeat(&mut self, repeat: bool) -> Result<()> {
        self.with_state(|s| s.repeat = repeat);
        Ok(())
    }

    fn repeat(&self) -> Result<bool> {
        Ok(self.with_state(|s| s.repeat))
    }

    fn clear(&mut self) -> Result<()> {
        self.with_state(|s| {
            s.playlist.clear();
            s.transport = Transport::Stopped;
            s.offset_ms = 0;
        });
        Ok(())
    }

    fn add_url(&mut self, path: &Path) -> Result<()> {
        self.with_state(|s| s.playlist.push(path.to_path_buf()));
        Ok(())
    }

    fn position_ms(&self) -> Result<i64> {
        Ok(self.with_state(|s| self.position(s)))
    }

    fn length_ms(&self) -> Result<i64> {
        Ok(self.with_state(|s| Self::current_length(s)))
    }

    fn title(&self) -> Result<String> {
        Ok(self.with_state(|s| {
            s.playlist
                .first()
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        }))
    }

    fn path(&self) -> Result<Option<PathBuf>> {
        Ok(self.with_state(|s| s.playlist.first().cloned()))
    }
}

/// Line input whose level is only remembered.
#[derive(Debug, Clone, Default)]
pub struct MemoryLineIn {
    volume: Arc<Mutex<u8>>,
}

impl MemoryLineIn {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineInput for MemoryLineIn {
    fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::Audio(format!("invalid line-in volume {}", volume)));
        }
        match self.volume.lock() {
            Ok(mut v) => *v = volume,
            Err(poisoned) => *poisoned.into_inner() = volume,
        }
        Ok(())
    }

    fn volume(&self) -> Result<u8> {
        Ok(match self.volume.lock() {
            Ok(v) => *v,
            Err(poisoned) => *poisoned.into_inner(),
        })
    }
}
