use crate::audio::{AudioSession, verify_progress};
use crate::clock::{Clock, millis_between};
use crate::element::{Category, ProgrammingElement};
use crate::error::{PlayerError, Result};
use crate::history::PlayedSong;
use crate::resources::SessionUsage;
use crate::scheduler::{PlayerContext, RunData};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Events closer than this are handled by a transition rather than by the
/// coarse polling loop.
pub const SAFETY_MARGIN_MS: i64 = 18_000;
/// Volume ramps are split into steps this far apart.
pub const VOLSLIDE_STEP_MS: i64 = 200;
/// Stands in for "no such event". Far enough from overflow to be added to.
pub const NO_EVENT_MS: i64 = i64::MAX / 4;
/// How long a freshly started session may take to show progress.
const START_TIMEOUT: Duration = Duration::from_secs(2);

/// `percent`% of a base volume.
pub fn scale_volume(base: u8, percent: u8) -> u8 {
    ((base as u32 * percent as u32) / 100) as u8
}

/// Which of the two items an event acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Current,
    Next,
}

impl Which {
    fn foreground(self) -> SessionUsage {
        match self {
            Which::Current => SessionUsage::CurrentForeground,
            Which::Next => SessionUsage::NextForeground,
        }
    }

    fn background(self) -> SessionUsage {
        match self {
            Which::Current => SessionUsage::CurrentBackground,
            Which::Next => SessionUsage::NextBackground,
        }
    }
}

impl fmt::Display for Which {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Which::Current => write!(f, "current"),
            Which::Next => write!(f, "next"),
        }
    }
}

/// One step of a scripted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetupNext,
    SetVol(Which, u8),
    NextPlay,
    LogNextStarted,
    StopCurrentItem,
    NextBecomesCurrent,
    MusicBedStart(Which),
    MusicBedStop(Which),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetupNext => write!(f, "setup_next"),
            Command::SetVol(which, percent) => write!(f, "setvol_{} {}", which, percent),
            Command::NextPlay => write!(f, "next_play"),
            Command::LogNextStarted => write!(f, "log_next_started"),
            Command::StopCurrentItem => write!(f, "stop_current_item"),
            Command::NextBecomesCurrent => write!(f, "next_becomes_current"),
            Command::MusicBedStart(which) => write!(f, "{}_music_bed_start", which),
            Command::MusicBedStop(which) => write!(f, "{}_music_bed_stop", which),
        }
    }
}

/// A command and when to run it, in ms from the start of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEvent {
    pub at_ms: i64,
    pub command: Command,
}

impl TransitionEvent {
    pub fn new(at_ms: i64, command: Command) -> Self {
        TransitionEvent { at_ms, command }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at_ms, self.command)
    }
}

/// Queue a volume ramp for `which` from `from`% to `to`% over `len_ms`.
///
/// A step is only queued when the rounded percentage changes, and the
/// final percentage always lands exactly at `when_ms + len_ms`.
pub fn queue_volslide(
    events: &mut Vec<TransitionEvent>,
    which: Which,
    from: u8,
    to: u8,
    when_ms: i64,
    len_ms: i64,
) -> Result<()> {
    if len_ms <= 0 {
        return Err(PlayerError::logic("Fade length cannot be 0!"));
    }
    let (from_i, to_i) = (from as i64, to as i64);
    let mut last: Option<i64> = None;
    let mut pos = 0;
    while pos <= len_ms {
        let delta = (to_i - from_i) * pos;
        // Integer division truncates toward zero, so this rounds half away from it.
        let vol = from_i + (2 * delta + delta.signum() * len_ms) / (2 * len_ms);
        if last != Some(vol) {
            events.push(TransitionEvent::new(when_ms + pos, Command::SetVol(which, vol as u8)));
            last = Some(vol);
        }
        pos += VOLSLIDE_STEP_MS;
    }
    if last != Some(to_i) {
        events.push(TransitionEvent::new(when_ms + len_ms, Command::SetVol(which, to)));
    }
    Ok(())
}

/// Should the handoff from `current` to `next` overlap?
pub fn should_crossfade(
    current: &ProgrammingElement,
    next: &ProgrammingElement,
    segment_category: Category,
    segment_allows_crossfade: bool,
    segment_changed: bool,
    interrupting: bool,
) -> bool {
    if !current.loaded || interrupting {
        return false;
    }
    if current.is_promo() || next.is_promo() {
        return false;
    }
    if current.is_line_in() && next.is_line_in() {
        return false;
    }
    if segment_changed {
        return true;
    }
    let both_match = current.category == segment_category && next.category == segment_category;
    let one_is_music = current.is_music() != next.is_music();
    segment_allows_crossfade && (both_match || one_is_music)
}

/// Upcoming events for the current item, in ms from now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEvents {
    /// Earliest of all the others.
    pub next_ms: i64,
    pub item_ends_ms: i64,
    pub bed_starts_ms: i64,
    pub bed_ends_ms: i64,
    pub promo_interrupt_ms: i64,
    pub reload_interrupt_ms: i64,
}

impl Default for PlaybackEvents {
    fn default() -> Self {
        PlaybackEvents {
            next_ms: NO_EVENT_MS,
            item_ends_ms: NO_EVENT_MS,
            bed_starts_ms: NO_EVENT_MS,
            bed_ends_ms: NO_EVENT_MS,
            promo_interrupt_ms: NO_EVENT_MS,
            reload_interrupt_ms: NO_EVENT_MS,
        }
    }
}

impl PlaybackEvents {
    /// When the current item stops, naturally or by interruption.
    pub fn item_stops_ms(&self) -> i64 {
        self.item_ends_ms
            .min(self.promo_interrupt_ms)
            .min(self.reload_interrupt_ms)
    }

    pub fn interrupting(&self) -> bool {
        self.item_stops_ms() != self.item_ends_ms
    }

    /// Recompute `next_ms` from the individual events.
    pub fn update_next(&mut self) {
        self.next_ms = self
            .item_ends_ms
            .min(self.bed_starts_ms)
            .min(self.bed_ends_ms)
            .min(self.promo_interrupt_ms)
            .min(self.reload_interrupt_ms);
    }
}

/// Inputs for scripting one pass of a transition.
#[derive(Debug, Clone, Copy)]
pub struct QueueTiming {
    pub events: PlaybackEvents,
    pub crossfade: bool,
    pub crossfade_ms: i64,
    /// The line input is currently audible.
    pub line_in_live: bool,
}

/// Queue start/stop events for the current item's music bed that fall
/// inside the safety margin.
fn queue_current_bed(events: &mut Vec<TransitionEvent>, current: &ProgrammingElement, timing: &QueueTiming) {
    let Some(bed) = current.music_bed.as_ref() else {
        return;
    };
    let stops = timing.events.item_stops_ms();
    let mut started = bed.start_handled;
    if !bed.start_handled && timing.events.bed_starts_ms < SAFETY_MARGIN_MS && timing.events.bed_starts_ms < stops {
        events.push(TransitionEvent::new(
            timing.events.bed_starts_ms.max(0),
            Command::MusicBedStart(Which::Current),
        ));
        started = true;
    }
    let bed_stops = timing.events.bed_ends_ms.min(stops);
    if started && !bed.stop_handled && bed_stops < SAFETY_MARGIN_MS {
        events.push(TransitionEvent::new(bed_stops.max(0), Command::MusicBedStop(Which::Current)));
    }
}

/// Script the switch from `current` to `next`.
fn queue_handoff(
    events: &mut Vec<TransitionEvent>,
    current: &ProgrammingElement,
    next: &ProgrammingElement,
    timing: &QueueTiming,
) -> Result<()> {
    let interrupting = timing.events.interrupting();
    let len = timing.crossfade_ms;
    // A fade out needs the full fade length, even from an item with no end.
    let ends = if current.loaded && (timing.crossfade || interrupting) {
        timing.events.item_stops_ms().max(len)
    } else {
        timing.events.item_stops_ms()
    };

    let next_start = if current.loaded && timing.crossfade {
        ends - len + 1
    } else {
        ends + 1
    };

    if current.loaded && (timing.crossfade || interrupting) {
        queue_volslide(events, Which::Current, 100, 0, ends - len, len)?;
        if !timing.crossfade {
            info!("The current item will fade out");
        }
    }

    events.push(TransitionEvent::new(next_start, Command::SetupNext));

    if next.is_music() && (timing.crossfade || !current.is_music()) {
        if next.is_line_in() && timing.line_in_live {
            warn!("LineIn volume was not 0! Will set it to full instead of fading it in");
            events.push(TransitionEvent::new(next_start + 1, Command::SetVol(Which::Next, 100)));
        } else {
            queue_volslide(events, Which::Next, 0, 100, next_start + 1, len)?;
        }
    } else if !timing.crossfade && !interrupting {
        info!("No fades during this transition");
    }

    if !next.is_line_in() {
        events.push(TransitionEvent::new(next_start + 2, Command::NextPlay));
    }
    events.push(TransitionEvent::new(next_start + 3, Command::LogNextStarted));
    if current.loaded {
        events.push(TransitionEvent::new(ends, Command::StopCurrentItem));
    }
    Ok(())
}

/// Build the sorted event queue for one pass of a transition.
///
/// When the current item stops inside the safety margin, the queue ends
/// with `next_becomes_current` one ms after every other event.
pub fn build_queue(
    current: &ProgrammingElement,
    next: &ProgrammingElement,
    timing: &QueueTiming,
) -> Result<Vec<TransitionEvent>> {
    let mut events = Vec::new();
    queue_current_bed(&mut events, current, timing);

    let handoff = timing.events.item_stops_ms() < SAFETY_MARGIN_MS;
    if handoff {
        if !next.loaded {
            return Err(PlayerError::logic("cannot script a handoff without a next item"));
        }
        queue_handoff(&mut events, current, next, timing)?;
    }

    events.sort_by_key(|e| e.at_ms);
    if handoff {
        let last = events.last().map_or(0, |e| e.at_ms);
        events.push(TransitionEvent::new(last + 1, Command::NextBecomesCurrent));
    }
    Ok(events)
}

/// Runs one transition event. May return more events to merge into the
/// queue, timed from the queue start.
pub trait EventHandler {
    fn handle(&mut self, command: Command, elapsed_ms: i64) -> Result<Vec<TransitionEvent>>;
    /// Time source the queue is executed against.
    fn clock(&self) -> &dyn Clock;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub executed: usize,
    /// Total backward wall-clock movement seen while running.
    pub wall_shift_ms: i64,
}

/// Run `queue` in time order. `start` is the monotonic time the offsets are
/// measured from.
///
/// Deadlines are on the monotonic clock, so an administrative change of the
/// wall clock does not bunch up or stall the remaining events. Backward
/// wall-clock movement is still detected and reported.
pub fn execute(
    mut queue: Vec<TransitionEvent>,
    start: Duration,
    handler: &mut dyn EventHandler,
) -> Result<ExecutionSummary> {
    queue.sort_by_key(|e| e.at_ms);
    let mut summary = ExecutionSummary::default();
    let mut prev_wall = handler.clock().now();
    let mut prev_mono = handler.clock().monotonic();
    let mut i = 0;

    while i < queue.len() {
        let clock = handler.clock();
        let wall = clock.now();
        let mono = clock.monotonic();
        let wall_moved = millis_between(prev_wall, wall);
        if wall_moved < 0 {
            let shift = mono.saturating_sub(prev_mono).as_millis() as i64 - wall_moved;
            warn!(
                "Detected: System clock moved back {} ms. Adjusting playback timing by this amount.",
                shift
            );
            summary.wall_shift_ms += shift;
        }
        prev_wall = wall;
        prev_mono = mono;

        let event = queue[i];
        let deadline = start + Duration::from_millis(event.at_ms.max(0) as u64);
        let now = clock.monotonic();
        if deadline > now {
            clock.sleep(deadline - now);
        }

        let elapsed_ms = clock.monotonic().saturating_sub(start).as_millis() as i64;
        debug!("{}", event);
        let extra = handler.handle(event.command, elapsed_ms)?;
        summary.executed += 1;
        i += 1;

        if !extra.is_empty() {
            queue.extend(extra);
            queue[i..].sort_by_key(|e| e.at_ms);
        }
    }
    Ok(summary)
}

fn session_mut(sessions: &mut [Box<dyn AudioSession>], id: usize) -> Result<&mut Box<dyn AudioSession>> {
    sessions
        .get_mut(id)
        .ok_or_else(|| PlayerError::logic(format!("session {} does not exist", id)))
}

fn format_length(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Carries out transition commands against the audio sessions.
pub struct Dispatcher<'a> {
    ctx: &'a mut PlayerContext,
    run: &'a mut RunData,
    crossfade: bool,
    /// Offset of the queue's `next_becomes_current`, if it has one.
    handoff_ms: Option<i64>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(ctx: &'a mut PlayerContext, run: &'a mut RunData, crossfade: bool, queue: &[TransitionEvent]) -> Self {
        let handoff_ms = queue
            .iter()
            .find(|e| e.command == Command::NextBecomesCurrent)
            .map(|e| e.at_ms);
        Dispatcher {
            ctx,
            run,
            crossfade,
            handoff_ms,
        }
    }

    fn item(&self, which: Which) -> &ProgrammingElement {
        match which {
            Which::Current => &self.run.current,
            Which::Next => &self.run.next,
        }
    }

    fn setup_next(&mut self) -> Result<()> {
        let next = &self.run.next;
        if !next.loaded {
            return Err(PlayerError::logic("setup_next without a next item"));
        }
        let alloc = &mut self.run.allocator;
        if alloc.find_by_usage(SessionUsage::NextForeground).is_ok()
            || alloc.find_by_usage(SessionUsage::NextBackground).is_ok()
            || alloc.uses_line_in(SessionUsage::NextForeground)
        {
            return Err(PlayerError::logic("resources were already set up for the next item"));
        }
        if next.is_silence() {
            return Ok(());
        }

        if next.is_line_in() {
            if alloc.line_in_usage() != SessionUsage::Unused {
                info!("LineIn is already used for something, but commandeering it anyway for the next item.");
                alloc.set_line_in_usage(SessionUsage::Unused)?;
            }
            return alloc.set_line_in_usage(SessionUsage::NextForeground);
        }

        let path = next
            .media
            .path()
            .ok_or_else(|| PlayerError::logic("next item has no media file"))?
            .to_path_buf();
        if !path.is_file() {
            return Err(PlayerError::Media(format!("File not found! {}", path.display())));
        }
        let volume = next.volume.resolve(&self.ctx.store_status.volumes)?;
        let id = alloc.allocate_free()?;
        alloc.set_usage(id, SessionUsage::NextForeground)?;

        let session = session_mut(&mut self.ctx.sessions, id)?;
        session.clear()?;
        session.add_url(&path)?;
        session.set_volume(volume)?;
        session.set_repeat(false)?;
        Ok(())
    }

    fn set_volume(&mut self, which: Which, percent: u8) -> Result<()> {
        let item = self.item(which);
        if !item.loaded {
            return Err(PlayerError::logic(format!("setvol_{} without a loaded item", which)));
        }
        if item.is_silence() {
            return Ok(());
        }
        if percent > 100 {
            return Err(PlayerError::logic("Invalid volume!"));
        }
        let volumes = self.ctx.store_status.volumes;
        let alloc = &self.run.allocator;

        if item.is_line_in() {
            if alloc.find_by_usage(which.background()).is_ok() {
                return Err(PlayerError::logic("Music Bed was allocated for LineIn music!"));
            }
            if !alloc.uses_line_in(which.foreground()) {
                return Err(PlayerError::logic("LineIn was not allocated!"));
            }
            self.ctx
                .line_in
                .set_volume(scale_volume(volumes.line_in, percent))?;
        } else {
            let fg = alloc.find_by_usage(which.foreground())?;
            let fg_volume = item.volume.resolve(&volumes)?;
            let bed = match alloc.find_by_usage(which.background()) {
                Ok(id) => {
                    let bed = item
                        .music_bed
                        .as_ref()
                        .ok_or_else(|| PlayerError::logic("music bed session without a music bed"))?;
                    Some((id, bed.volume.resolve(&volumes)?))
                }
                Err(_) => None,
            };
            session_mut(&mut self.ctx.sessions, fg)?
                .set_volume(scale_volume(fg_volume, percent))?;
            if let Some((id, bed_volume)) = bed {
                session_mut(&mut self.ctx.sessions, id)?
                    .set_volume(scale_volume(bed_volume, percent))?;
            }
        }

        match which {
            Which::Current => self.run.vol_current = percent,
            Which::Next => self.run.vol_next = percent,
        }
        Ok(())
    }

    fn next_play(&mut self, elapsed_ms: i64) -> Result<Vec<TransitionEvent>> {
        let next = &self.run.next;
        if next.is_silence() {
            return Ok(Vec::new());
        }
        if !next.loaded {
            return Err(PlayerError::logic("next_play without a next item"));
        }
        if next.is_line_in() {
            return Err(PlayerError::logic("Don't use next_play commands for LineIn!"));
        }
        let id = self.run.allocator.find_by_usage(SessionUsage::NextForeground)?;
        let session = session_mut(&mut self.ctx.sessions, id)?;
        if session.is_playing()? {
            return Err(PlayerError::logic("Don't use next_play when the session is already playing!"));
        }
        session.play()?;
        verify_progress(session.as_ref(), self.ctx.clock.as_ref(), START_TIMEOUT)?;

        // Bed events for the incoming item that land before the handoff.
        let mut extra = Vec::new();
        if let (true, Some(bed), Some(handoff)) = (self.crossfade, next.music_bed.as_ref(), self.handoff_ms) {
            let start = elapsed_ms + 1 + bed.start_ms;
            let stop = elapsed_ms + 2 + bed.start_ms + bed.length_ms;
            if start < handoff {
                extra.push(TransitionEvent::new(start, Command::MusicBedStart(Which::Next)));
                if stop < handoff {
                    extra.push(TransitionEvent::new(stop, Command::MusicBedStop(Which::Next)));
                }
            }
        }
        Ok(extra)
    }

    fn log_next_started(&mut self) -> Result<()> {
        let now = self.ctx.clock.now();
        self.run.next.started_at = Some(now);

        if let Ok(id) = self.run.allocator.find_by_usage(SessionUsage::NextForeground) {
            let volume = self.run.next.volume.resolve(&self.ctx.store_status.volumes)?;
            let session = session_mut(&mut self.ctx.sessions, id)?;
            let length = session.length_ms()?;
            let path = session.path()?.map(|p| p.display().to_string()).unwrap_or_default();
            let ends = now + chrono::Duration::milliseconds(length);
            info!(
                "Playing (session {}: {}%): \"{}\" - \"{}\" ({}. Ends: {})",
                id,
                volume,
                path,
                session.title()?,
                format_length(length),
                ends.format("%H:%M:%S")
            );

            if self.run.next.is_music() {
                if let Some(file) = self.run.next.media.path() {
                    let tags = self.ctx.tags.as_ref();
                    let mut song = PlayedSong::new(
                        file,
                        &tags.description(file).unwrap_or_default(),
                        &tags.artist(file).unwrap_or_default(),
                    );
                    song.played_at = Some(now);
                    self.run.history.song_played(self.ctx.repo.as_mut(), song)?;
                }
            }
        } else if self.run.next.is_line_in() {
            info!("Playing through LineIn ({} category)", self.run.next.category);
        } else if self.run.next.is_silence() {
            info!("Playing silence");
        }

        self.run.segment.item_played();
        Ok(())
    }

    fn stop_current_item(&mut self) -> Result<()> {
        let current = &self.run.current;
        if !current.loaded {
            return Err(PlayerError::logic("stop_current_item without a current item"));
        }
        if !current.uses_session() {
            return Ok(());
        }
        let id = self.run.allocator.find_by_usage(SessionUsage::CurrentForeground)?;
        let session = session_mut(&mut self.ctx.sessions, id)?;
        if session.is_playing()? {
            let remaining = session.length_ms()? - session.position_ms()?;
            debug!("Stopping session {} ({} ms before the media end)", id, remaining);
            session.stop()?;
        } else {
            debug!("Session {} stopped by itself", id);
        }
        self.run.allocator.release(id, session.as_ref())
    }

    fn release_usage(&mut self, usage: SessionUsage) -> Result<()> {
        if let Ok(id) = self.run.allocator.find_by_usage(usage) {
            let session = session_mut(&mut self.ctx.sessions, id)?;
            if !session.is_stopped()? {
                session.stop()?;
            }
            self.run.allocator.release(id, session.as_ref())?;
        }
        Ok(())
    }

    fn next_becomes_current(&mut self) -> Result<()> {
        let run = &mut *self.run;
        if run.current.is_line_in() && !run.next.is_line_in() {
            self.ctx.line_in.set_volume(0)?;
            if run.allocator.uses_line_in(SessionUsage::CurrentForeground) {
                run.allocator.set_line_in_usage(SessionUsage::Unused)?;
            }
        }
        self.release_usage(SessionUsage::CurrentForeground)?;
        self.release_usage(SessionUsage::CurrentBackground)?;

        let run = &mut *self.run;
        run.allocator.promote_next_to_current()?;
        run.current = std::mem::take(&mut run.next);
        run.vol_current = run.vol_next;
        run.vol_next = 100;
        Ok(())
    }

    fn music_bed_start(&mut self, which: Which) -> Result<()> {
        let volumes = self.ctx.store_status.volumes;
        let percent = match which {
            Which::Current => self.run.vol_current,
            Which::Next => self.run.vol_next,
        };
        let alloc = &mut self.run.allocator;
        if alloc.find_by_usage(which.background()).is_ok() {
            return Err(PlayerError::logic(format!("{} item already has a music bed session", which)));
        }
        let item = match which {
            Which::Current => &mut self.run.current,
            Which::Next => &mut self.run.next,
        };
        let bed = item
            .music_bed
            .as_mut()
            .ok_or_else(|| PlayerError::logic(format!("{} item has no music bed", which)))?;

        let id = alloc.allocate_free()?;
        alloc.set_usage(id, which.background())?;
        let base = bed.volume.resolve(&volumes)?;
        let session = session_mut(&mut self.ctx.sessions, id)?;
        session.clear()?;
        session.add_url(&bed.media)?;
        session.set_volume(scale_volume(base, percent))?;
        session.set_repeat(false)?;
        session.play()?;
        info!(
            "Music Bed (session {}: {}%): \"{}\" - \"{}\"",
            id,
            base,
            bed.media.display(),
            session.title()?
        );

        let engine_length = session.length_ms()?;
        if engine_length > 0 && bed.length_ms > engine_length {
            bed.length_ms = engine_length;
        }
        bed.start_handled = true;
        Ok(())
    }

    fn music_bed_stop(&mut self, which: Which) -> Result<()> {
        let id = self.run.allocator.find_by_usage(which.background())?;
        let session = session_mut(&mut self.ctx.sessions, id)?;
        session.stop()?;
        self.run.allocator.release(id, session.as_ref())?;
        let item = match which {
            Which::Current => &mut self.run.current,
            Which::Next => &mut self.run.next,
        };
        if let Some(bed) = item.music_bed.as_mut() {
            bed.stop_handled = true;
        }
        Ok(())
    }
}

impl EventHandler for Dispatcher<'_> {
    fn handle(&mut self, command: Command, elapsed_ms: i64) -> Result<Vec<TransitionEvent>> {
        match command {
            Command::SetupNext => self.setup_next()?,
            Command::SetVol(which, percent) => self.set_volume(which, percent)?,
            Command::NextPlay => return self.next_play(elapsed_ms),
            Command::LogNextStarted => self.log_next_started()?,
            Command::StopCurrentItem => self.stop_current_item()?,
            Command::NextBecomesCurrent => self.next_becomes_current()?,
            Command::MusicBedStart(which) => self.music_bed_start(which)?,
            Command::MusicBedStop(which) => self.music_bed_stop(which)?,
        }
        Ok(Vec::new())
    }

    fn clock(&self) -> &dyn Clock {
        self.ctx.clock.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::element::MusicBed;
    use std::path::PathBuf;

    fn volumes_of(events: &[TransitionEvent], which: Which) -> Vec<(i64, u8)> {
        events
            .iter()
            .filter_map(|e| match e.command {
                Command::SetVol(w, v) if w == which => Some((e.at_ms, v)),
                _ => None,
            })
            .collect()
    }

    fn make_timing(item_ends_ms: i64, crossfade: bool) -> QueueTiming {
        let mut events = PlaybackEvents {
            item_ends_ms,
            ..Default::default()
        };
        events.update_next();
        QueueTiming {
            events,
            crossfade,
            crossfade_ms: 8000,
            line_in_live: false,
        }
    }

    #[test]
    fn command_strings_match_log_format() {
        assert_eq!(Command::SetVol(Which::Next, 50).to_string(), "setvol_next 50");
        assert_eq!(Command::SetVol(Which::Current, 0).to_string(), "setvol_current 0");
        assert_eq!(Command::MusicBedStart(Which::Current).to_string(), "current_music_bed_start");
        assert_eq!(Command::NextBecomesCurrent.to_string(), "next_becomes_current");
    }

    #[test]
    fn short_fade_collapses_to_two_steps() {
        let mut events = Vec::new();
        queue_volslide(&mut events, Which::Current, 100, 0, 1000, 50).unwrap();
        assert_eq!(volumes_of(&events, Which::Current), vec![(1000, 100), (1050, 0)]);
    }

    #[test]
    fn fade_hits_exact_endpoints() {
        let mut events = Vec::new();
        queue_volslide(&mut events, Which::Next, 0, 100, 0, 8000).unwrap();
        let vols = volumes_of(&events, Which::Next);
        assert_eq!(vols.first(), Some(&(0, 0)));
        assert_eq!(vols.last(), Some(&(8000, 100)));
        assert!(vols.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 < w[1].1));
    }

    #[test]
    fn fade_steps_are_rounded() {
        let mut events = Vec::new();
        queue_volslide(&mut events, Which::Next, 0, 100, 0, 600).unwrap();
        assert_eq!(
            volumes_of(&events, Which::Next),
            vec![(0, 0), (200, 33), (400, 67), (600, 100)]
        );
        let mut events = Vec::new();
        queue_volslide(&mut events, Which::Current, 100, 0, 0, 600).unwrap();
        assert_eq!(
            volumes_of(&events, Which::Current),
            vec![(0, 100), (200, 67), (400, 33), (600, 0)]
        );
    }

    #[test]
    fn uneven_fade_still_reaches_target() {
        let mut events = Vec::new();
        queue_volslide(&mut events, Which::Current, 100, 0, 0, 1100).unwrap();
        assert_eq!(volumes_of(&events, Which::Current).last(), Some(&(1100, 0)));
    }

    #[test]
    fn zero_length_fade_is_rejected() {
        let mut events = Vec::new();
        assert!(queue_volslide(&mut events, Which::Current, 100, 0, 0, 0).is_err());
    }

    #[test]
    fn crossfade_eligibility() {
        let song = ProgrammingElement::music("/m/a.mp3");
        let song2 = ProgrammingElement::music("/m/b.mp3");
        let news = ProgrammingElement::file(Category::News, "/n/a.mp3");
        let promo = ProgrammingElement::promo("/ads/ad.mp3", Default::default(), 1, false);
        let line_in = ProgrammingElement::line_in(Category::Music);
        let nothing = ProgrammingElement::default();
        let music = Category::Music;

        assert!(should_crossfade(&song, &song2, music, true, false, false));
        assert!(!should_crossfade(&song, &song2, music, false, false, false));
        assert!(!should_crossfade(&nothing, &song, music, true, false, false));
        assert!(!should_crossfade(&song, &promo, music, true, true, false));
        assert!(!should_crossfade(&line_in, &line_in.clone(), music, true, true, false));
        assert!(!should_crossfade(&song, &song2, music, true, false, true));
        assert!(should_crossfade(&song, &news, Category::News, true, false, false));
        assert!(!should_crossfade(&news, &news.clone(), music, true, false, false));
        assert!(should_crossfade(&news, &news.clone(), music, false, true, false));
    }

    #[test]
    fn crossfade_queue_overlaps_the_items() {
        let current = ProgrammingElement::music("/m/a.mp3");
        let next = ProgrammingElement::music("/m/b.mp3");
        let queue = build_queue(&current, &next, &make_timing(10_000, true)).unwrap();

        assert!(queue.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
        let out = volumes_of(&queue, Which::Current);
        assert_eq!(out.first(), Some(&(2000, 100)));
        assert_eq!(out.last(), Some(&(10_000, 0)));
        let inc = volumes_of(&queue, Which::Next);
        assert_eq!(inc.first(), Some(&(2002, 0)));
        assert_eq!(inc.last(), Some(&(10_002, 100)));

        let at = |cmd: Command| queue.iter().find(|e| e.command == cmd).unwrap().at_ms;
        assert_eq!(at(Command::SetupNext), 2001);
        assert_eq!(at(Command::NextPlay), 2003);
        assert_eq!(at(Command::LogNextStarted), 2004);
        assert_eq!(at(Command::StopCurrentItem), 10_000);
        assert_eq!(queue.last().unwrap().command, Command::NextBecomesCurrent);
        assert_eq!(queue.last().unwrap().at_ms, 10_003);
    }

    #[test]
    fn hard_cut_into_music_fades_in_from_non_music() {
        let current = ProgrammingElement::file(Category::News, "/n/a.mp3");
        let next = ProgrammingElement::music("/m/b.mp3");
        let queue = build_queue(&current, &next, &make_timing(5000, false)).unwrap();
        assert!(volumes_of(&queue, Which::Current).is_empty());
        let inc = volumes_of(&queue, Which::Next);
        assert_eq!(inc.first(), Some(&(5002, 0)));
        assert_eq!(queue.iter().find(|e| e.command == Command::SetupNext).unwrap().at_ms, 5001);
    }

    #[test]
    fn hard_cut_between_songs_has_no_fades() {
        let current = ProgrammingElement::music("/m/a.mp3");
        let next = ProgrammingElement::music("/m/b.mp3");
        let queue = build_queue(&current, &next, &make_timing(5000, false)).unwrap();
        assert!(volumes_of(&queue, Which::Current).is_empty());
        assert!(volumes_of(&queue, Which::Next).is_empty());
    }

    #[test]
    fn interruption_fades_out_current() {
        let current = ProgrammingElement::music("/m/a.mp3");
        let next = ProgrammingElement::promo("/ads/ad.mp3", Default::default(), 1, false);
        let mut timing = make_timing(60_000, false);
        timing.events.promo_interrupt_ms = 9000;
        timing.events.update_next();
        let queue = build_queue(&current, &next, &timing).unwrap();
        let out = volumes_of(&queue, Which::Current);
        assert_eq!(out.first(), Some(&(1000, 100)));
        assert_eq!(out.last(), Some(&(9000, 0)));
        assert_eq!(
            queue.iter().find(|e| e.command == Command::StopCurrentItem).unwrap().at_ms,
            9000
        );
    }

    #[test]
    fn first_item_starts_without_current() {
        let current = ProgrammingElement::default();
        let next = ProgrammingElement::music("/m/b.mp3");
        let queue = build_queue(&current, &next, &make_timing(0, false)).unwrap();
        assert!(!queue.iter().any(|e| e.command == Command::StopCurrentItem));
        assert_eq!(queue[0].command, Command::SetupNext);
        assert_eq!(queue[0].at_ms, 1);
    }

    #[test]
    fn crossfade_from_endless_item_keeps_full_ramp() {
        let current = ProgrammingElement::line_in(Category::Music);
        let next = ProgrammingElement::music("/m/b.mp3");
        let queue = build_queue(&current, &next, &make_timing(0, true)).unwrap();
        assert!(queue.iter().all(|e| e.at_ms >= 0));
        let inc = volumes_of(&queue, Which::Next);
        assert_eq!(inc.first(), Some(&(2, 0)));
        assert_eq!(inc.last(), Some(&(8002, 100)));
    }

    #[test]
    fn line_in_is_not_played_through_a_session() {
        let current = ProgrammingElement::file(Category::News, "/n/a.mp3");
        let next = ProgrammingElement::line_in(Category::Music);
        let mut timing = make_timing(3000, false);
        timing.line_in_live = true;
        let queue = build_queue(&current, &next, &timing).unwrap();
        assert!(!queue.iter().any(|e| e.command == Command::NextPlay));
        assert_eq!(volumes_of(&queue, Which::Next), vec![(3002, 100)]);
    }

    #[test]
    fn current_bed_events_are_queued_inside_margin() {
        let mut current = ProgrammingElement::file(Category::News, "/n/a.mp3");
        current.music_bed = Some(MusicBed::new(PathBuf::from("/beds/b.mp3")));
        let next = ProgrammingElement::music("/m/b.mp3");
        let mut timing = make_timing(12_000, false);
        timing.events.bed_starts_ms = 2000;
        timing.events.bed_ends_ms = 12_000;
        timing.events.update_next();

        let queue = build_queue(&current, &next, &timing).unwrap();
        let bed_start = queue
            .iter()
            .position(|e| e.command == Command::MusicBedStart(Which::Current))
            .unwrap();
        let bed_stop = queue
            .iter()
            .position(|e| e.command == Command::MusicBedStop(Which::Current))
            .unwrap();
        let stop = queue.iter().position(|e| e.command == Command::StopCurrentItem).unwrap();
        assert_eq!(queue[bed_start].at_ms, 2000);
        assert!(bed_stop < stop);
    }

    #[test]
    fn bed_start_alone_does_not_hand_off() {
        let mut current = ProgrammingElement::file(Category::News, "/n/a.mp3");
        current.music_bed = Some(MusicBed::new(PathBuf::from("/beds/b.mp3")));
        let mut timing = make_timing(60_000, false);
        timing.events.bed_starts_ms = 500;
        timing.events.bed_ends_ms = 60_000;
        timing.events.update_next();
        let queue = build_queue(&current, &ProgrammingElement::default(), &timing).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].command, Command::MusicBedStart(Which::Current));
    }

    struct Recorder {
        clock: ManualClock,
        seen: Vec<(Command, i64)>,
        extra: Option<TransitionEvent>,
        jump_after_first: bool,
    }

    impl EventHandler for Recorder {
        fn handle(&mut self, command: Command, elapsed_ms: i64) -> Result<Vec<TransitionEvent>> {
            self.seen.push((command, elapsed_ms));
            if self.jump_after_first && self.seen.len() == 1 {
                self.clock.jump_wall(-30);
            }
            Ok(self.extra.take().into_iter().collect())
        }

        fn clock(&self) -> &dyn Clock {
            &self.clock
        }
    }

    fn make_recorder(clock: &ManualClock) -> Recorder {
        Recorder {
            clock: clock.clone(),
            seen: Vec::new(),
            extra: None,
            jump_after_first: false,
        }
    }

    #[test]
    fn events_run_in_order_at_their_offsets() {
        let clock = ManualClock::default();
        let mut recorder = make_recorder(&clock);
        let queue = vec![
            TransitionEvent::new(500, Command::NextPlay),
            TransitionEvent::new(100, Command::SetupNext),
            TransitionEvent::new(900, Command::NextBecomesCurrent),
        ];
        let start = clock.monotonic();
        let summary = execute(queue, start, &mut recorder).unwrap();
        assert_eq!(summary.executed, 3);
        assert_eq!(
            recorder.seen,
            vec![
                (Command::SetupNext, 100),
                (Command::NextPlay, 500),
                (Command::NextBecomesCurrent, 900)
            ]
        );
    }

    #[test]
    fn late_events_run_immediately() {
        let clock = ManualClock::default();
        let start = clock.monotonic();
        clock.advance(Duration::from_millis(2000));
        let mut recorder = make_recorder(&clock);
        execute(vec![TransitionEvent::new(100, Command::SetupNext)], start, &mut recorder).unwrap();
        assert_eq!(recorder.seen, vec![(Command::SetupNext, 2000)]);
    }

    #[test]
    fn follow_up_events_are_merged_in_order() {
        let clock = ManualClock::default();
        let mut recorder = make_recorder(&clock);
        recorder.extra = Some(TransitionEvent::new(300, Command::MusicBedStart(Which::Next)));
        let queue = vec![
            TransitionEvent::new(100, Command::NextPlay),
            TransitionEvent::new(800, Command::NextBecomesCurrent),
        ];
        execute(queue, clock.monotonic(), &mut recorder).unwrap();
        let order: Vec<Command> = recorder.seen.iter().map(|(c, _)| *c).collect();
        assert_eq!(
            order,
            vec![
                Command::NextPlay,
                Command::MusicBedStart(Which::Next),
                Command::NextBecomesCurrent
            ]
        );
    }

    #[test]
    fn backward_wall_jump_keeps_schedule() {
        let clock = ManualClock::default();
        let mut recorder = make_recorder(&clock);
        recorder.jump_after_first = true;
        let queue = vec![
            TransitionEvent::new(100, Command::SetupNext),
            TransitionEvent::new(600, Command::NextPlay),
        ];
        let summary = execute(queue, clock.monotonic(), &mut recorder).unwrap();
        assert_eq!(summary.wall_shift_ms, 30_000);
        assert_eq!(recorder.seen[1], (Command::NextPlay, 600));
    }
}
