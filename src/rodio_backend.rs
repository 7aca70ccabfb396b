use crate::audio::{AudioSession, LineInput};
use crate::error::{PlayerError, Result};
use crate::tags::TagInfo;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// The default audio device. Must outlive every session created from it.
pub struct AudioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl AudioOutput {
    pub fn new() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| PlayerError::Audio(format!("Failed to open audio output: {}", e)))?;
        Ok(AudioOutput {
            _stream: stream,
            handle,
        })
    }

    pub fn session(&self) -> Result<RodioSession> {
        RodioSession::new(self.handle.clone())
    }

    /// `count` independent sessions, boxed for the scheduler.
    pub fn sessions(&self, count: usize) -> Result<Vec<Box<dyn AudioSession>>> {
        (0..count)
            .map(|_| self.session().map(|s| Box::new(s) as Box<dyn AudioSession>))
            .collect()
    }
}

fn new_sink(handle: &OutputStreamHandle) -> Result<Sink> {
    Sink::try_new(handle).map_err(|e| PlayerError::Audio(format!("Failed to create audio sink: {}", e)))
}

fn to_gain(volume: u8) -> f32 {
    volume as f32 / 100.0
}

/// One session backed by a rodio sink. The sink is rebuilt for every play
/// from stopped, so positions always start at zero.
pub struct RodioSession {
    handle: OutputStreamHandle,
    sink: Sink,
    media: Option<PathBuf>,
    title: String,
    length_ms: i64,
    volume: u8,
    repeat: bool,
    started: bool,
}

impl RodioSession {
    fn new(handle: OutputStreamHandle) -> Result<Self> {
        let sink = new_sink(&handle)?;
        Ok(RodioSession {
            handle,
            sink,
            media: None,
            title: String::new(),
            length_ms: 0,
            volume: 100,
            repeat: false,
            started: false,
        })
    }

    fn decode(path: &Path) -> Result<Decoder<BufReader<File>>> {
        let file = File::open(path)
            .map_err(|e| PlayerError::Media(format!("Cannot open '{}': {}", path.display(), e)))?;
        Decoder::new(BufReader::new(file))
            .map_err(|e| PlayerError::Media(format!("Cannot decode '{}': {}", path.display(), e)))
    }
}

impl AudioSession for RodioSession {
    fn play(&mut self) -> Result<()> {
        if self.started && self.sink.is_paused() && !self.sink.empty() {
            self.sink.play();
            return Ok(());
        }
        let path = self
            .media
            .clone()
            .ok_or_else(|| PlayerError::Audio("nothing queued to play".into()))?;
        let source = Self::decode(&path)?;
        if let Some(total) = source.total_duration() {
            self.length_ms = total.as_millis() as i64;
        }
        let sink = new_sink(&self.handle)?;
        sink.set_volume(to_gain(self.volume));
        sink.append(source);
        sink.play();
        self.sink.stop();
        self.sink = sink;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.sink.stop();
        self.started = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.started {
            self.sink.pause();
        }
        Ok(())
    }

    fn is_paused(&self) -> Result<bool> {
        Ok(self.started && self.sink.is_paused() && !self.sink.empty())
    }

    fn is_playing(&self) -> Result<bool> {
        Ok(self.started && !self.sink.is_paused() && !self.sink.empty())
    }

    fn is_running(&self) -> Result<bool> {
        Ok(true)
    }

    fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::Audio(format!("invalid volume {}", volume)));
        }
        self.volume = volume;
        self.sink.set_volume(to_gain(volume));
        Ok(())
    }

    fn volume(&self) -> Result<u8> {
        Ok(self.volume)
    }

    fn set_repeat(&mut self, repeat: bool) -> Result<()> {
        self.repeat = repeat;
        Ok(())
    }

    fn repeat(&self) -> Result<bool> {
        Ok(self.repeat)
    }

    fn clear(&mut self) -> Result<()> {
        self.sink.stop();
        self.started = false;
        self.media = None;
        self.title.clear();
        self.length_ms = 0;
        Ok(())
    }

    fn add_url(&mut self, path: &Path) -> Result<()> {
        // Sessions only ever hold one item.
        if self.media.is_some() {
            return Err(PlayerError::Audio("session already has media queued".into()));
        }
        match TagInfo::read(path) {
            Ok(info) => {
                self.title = info.title;
                self.length_ms = info.length_secs as i64 * 1000;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "no tags for queued media: {}", e);
                self.title = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
            }
        }
        self.media = Some(path.to_path_buf());
        Ok(())
    }

    fn position_ms(&self) -> Result<i64> {
        if !self.started {
            return Ok(0);
        }
        if self.sink.empty() {
            return Ok(self.length_ms);
        }
        Ok(self.sink.get_pos().as_millis() as i64)
    }

    fn length_ms(&self) -> Result<i64> {
        Ok(self.length_ms)
    }

    fn title(&self) -> Result<String> {
        Ok(self.title.clone())
    }

    fn path(&self) -> Result<Option<PathBuf>> {
        Ok(self.media.clone())
    }
}

/// Rodio has no capture path, so the line input is a remembered level that
/// an external mixer can be driven from.
#[derive(Debug, Default)]
pub struct SoftLineIn {
    volume: u8,
}

impl LineInput for SoftLineIn {
    fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > 100 {
            return Err(PlayerError::Audio(format!("invalid LineIn volume {}", volume)));
        }
        self.volume = volume;
        Ok(())
    }

    fn volume(&self) -> Result<u8> {
        Ok(self.volume)
    }
}
