use crate::anti_repeat::AntiRepeatSelector;
use crate::audio::{AudioSession, LineInput};
use crate::clock::Clock;
use crate::config::PlayerConfig;
use crate::element::{ProgrammingElement, StoreStatus, StoreVolumes};
use crate::error::{PlayerError, Result};
use crate::history::MusicHistory;
use crate::promo::{PromoBatchScheduler, PromoRequest, report_missed_promos};
use crate::repository::ScheduleRepository;
use crate::resolver::SegmentResolver;
use crate::resources::{ResourceAllocator, SessionUsage};
use crate::segment::{LoadSources, Segment};
use crate::tags::TagReader;
use crate::transition::{
    self, Command, Dispatcher, NO_EVENT_MS, PlaybackEvents, QueueTiming, SAFETY_MARGIN_MS, scale_volume,
};
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Coarse poll between cycles.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const MISSED_PROMOS_EVERY_SECS: i64 = 30;
pub const STORE_STATUS_EVERY_SECS: i64 = 30;
pub const TAG_CACHE_EVERY_SECS: i64 = 30;
pub const HEARTBEAT_EVERY_SECS: i64 = 60;

/// Everything the scheduler talks to. Built once at startup.
pub struct PlayerContext {
    pub config: PlayerConfig,
    pub repo: Box<dyn ScheduleRepository>,
    pub tags: Box<dyn TagReader>,
    pub clock: Box<dyn Clock>,
    pub sessions: Vec<Box<dyn AudioSession>>,
    pub line_in: Box<dyn LineInput>,
    pub store_status: StoreStatus,
}

impl PlayerContext {
    pub fn new(
        config: PlayerConfig,
        repo: Box<dyn ScheduleRepository>,
        tags: Box<dyn TagReader>,
        clock: Box<dyn Clock>,
        sessions: Vec<Box<dyn AudioSession>>,
        line_in: Box<dyn LineInput>,
    ) -> Self {
        PlayerContext {
            config,
            repo,
            tags,
            clock,
            sessions,
            line_in,
            store_status: StoreStatus::default(),
        }
    }

    fn sources(&self, now: NaiveDateTime) -> LoadSources<'_> {
        LoadSources {
            repo: self.repo.as_ref(),
            tags: self.tags.as_ref(),
            config: &self.config,
            today: now.date(),
        }
    }
}

/// Playback state. Everything here except the music history is thrown away
/// by a playback reset.
#[derive(Debug)]
pub struct RunData {
    pub current: ProgrammingElement,
    pub next: ProgrammingElement,
    pub allocator: ResourceAllocator,
    pub segment: Segment,
    pub resolver: SegmentResolver,
    pub promos: PromoBatchScheduler,
    pub history: MusicHistory,
    /// Percent of the resolved volume each item is currently faded to.
    pub vol_current: u8,
    pub vol_next: u8,
    pub force_reload: bool,
    /// The next item was fetched from a newly loaded segment.
    pub next_segment_changed: bool,
    last_next_check: Option<NaiveDateTime>,
}

impl RunData {
    pub fn new(session_count: usize) -> Self {
        RunData {
            current: ProgrammingElement::default(),
            next: ProgrammingElement::default(),
            allocator: ResourceAllocator::with_sessions(session_count),
            segment: Segment::default(),
            resolver: SegmentResolver::new(),
            promos: PromoBatchScheduler::new(),
            history: MusicHistory::new(),
            vol_current: 100,
            vol_next: 100,
            force_reload: false,
            next_segment_changed: false,
            last_next_check: None,
        }
    }

    fn reset(&mut self) {
        self.current.reset();
        self.next.reset();
        self.allocator.reset();
        self.segment = Segment::default();
        self.resolver.reset();
        self.promos.reset();
        self.vol_current = 100;
        self.vol_next = 100;
        self.force_reload = false;
        self.next_segment_changed = false;
        self.last_next_check = None;
    }
}

/// Fires at most once per `every_secs` bucket of wall-clock time.
#[derive(Debug, Clone, Copy)]
struct TaskTimer {
    every_secs: i64,
    last: Option<NaiveDateTime>,
}

impl TaskTimer {
    fn new(every_secs: i64) -> Self {
        TaskTimer { every_secs, last: None }
    }

    fn bucket(&self, at: NaiveDateTime) -> i64 {
        at.and_utc().timestamp().div_euclid(self.every_secs)
    }

    fn due(&mut self, now: NaiveDateTime) -> bool {
        if self.last.is_some_and(|last| last > now) {
            info!("System clock was set backwards, adjusting logic");
            self.last = None;
        }
        if self.last.is_some_and(|last| self.bucket(last) == self.bucket(now)) {
            return false;
        }
        self.last = Some(now);
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct MaintenanceTimers {
    missed_promos: TaskTimer,
    store_status: TaskTimer,
    tag_cache: TaskTimer,
    heartbeat: TaskTimer,
}

impl Default for MaintenanceTimers {
    fn default() -> Self {
        MaintenanceTimers {
            missed_promos: TaskTimer::new(MISSED_PROMOS_EVERY_SECS),
            store_status: TaskTimer::new(STORE_STATUS_EVERY_SECS),
            tag_cache: TaskTimer::new(TAG_CACHE_EVERY_SECS),
            heartbeat: TaskTimer::new(HEARTBEAT_EVERY_SECS),
        }
    }
}

/// What a session holding `usage` should be playing, and at what volume.
fn expected_playback(
    run: &RunData,
    volumes: &StoreVolumes,
    usage: SessionUsage,
) -> Result<Option<(PathBuf, u8)>> {
    let (item, percent) = match usage {
        SessionUsage::Unused => return Ok(None),
        SessionUsage::CurrentForeground | SessionUsage::CurrentBackground => (&run.current, run.vol_current),
        SessionUsage::NextForeground | SessionUsage::NextBackground => (&run.next, run.vol_next),
    };
    if matches!(usage, SessionUsage::CurrentBackground | SessionUsage::NextBackground) {
        let bed = item
            .music_bed
            .as_ref()
            .ok_or_else(|| PlayerError::logic(format!("{} is held by an item without a music bed", usage)))?;
        return Ok(Some((bed.media.clone(), scale_volume(bed.volume.resolve(volumes)?, percent))));
    }
    let path = item
        .media
        .path()
        .ok_or_else(|| PlayerError::logic(format!("{} is held by an item without a media file", usage)))?;
    Ok(Some((path.to_path_buf(), scale_volume(item.volume.resolve(volumes)?, percent))))
}

fn line_in_level(run: &RunData, volumes: &StoreVolumes) -> u8 {
    match run.allocator.line_in_usage() {
        SessionUsage::Unused => 0,
        u if u.is_current() => scale_volume(volumes.line_in, run.vol_current),
        _ => scale_volume(volumes.line_in, run.vol_next),
    }
}

fn quiet_session(session: &mut dyn AudioSession) -> Result<()> {
    if !session.is_running()? {
        return Err(PlayerError::Audio("session is not running".into()));
    }
    session.stop()?;
    session.set_repeat(false)
}

/// Drives playback: polls once a second, runs maintenance while nothing is
/// due, and scripts transitions when the current item is about to end.
pub struct PlaybackScheduler {
    ctx: PlayerContext,
    run: RunData,
    selector: AntiRepeatSelector,
    timers: MaintenanceTimers,
    handoffs: usize,
}

impl PlaybackScheduler {
    /// Prepares the repository and the audio outputs for a fresh start.
    pub fn new(mut ctx: PlayerContext) -> Result<Self> {
        let reset = ctx.repo.reset_listed_promos()?;
        if reset > 0 {
            info!("{} announcements were listed to play but never played, they are waiting again", reset);
        }
        let now = ctx.clock.now();
        report_missed_promos(ctx.repo.as_mut(), now, ctx.config.promos.mins_to_miss_after)?;

        let mut run = RunData::new(ctx.sessions.len());
        run.history.load(ctx.repo.as_ref())?;
        debug!(songs = run.history.len(), "music history loaded");

        let selector = AntiRepeatSelector::new(ctx.config.repeat_prevention_percent);
        let mut scheduler = PlaybackScheduler {
            ctx,
            run,
            selector,
            timers: MaintenanceTimers::default(),
            handoffs: 0,
        };
        scheduler.load_store_status(true)?;
        scheduler.reset_playback();
        Ok(scheduler)
    }

    pub fn context(&self) -> &PlayerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut PlayerContext {
        &mut self.ctx
    }

    pub fn run_data(&self) -> &RunData {
        &self.run
    }

    /// Number of `next_becomes_current` handoffs executed so far.
    pub fn handoffs(&self) -> usize {
        self.handoffs
    }

    pub fn run(&mut self) -> ! {
        loop {
            // Failures are logged and reset inside the cycle.
            let _ = self.run_cycle();
        }
    }

    /// Run a bounded number of cycles. Returns how many failed.
    pub fn run_for(&mut self, cycles: usize) -> usize {
        (0..cycles).filter(|_| self.run_cycle().is_err()).count()
    }

    /// One poll of the main loop. A failure has already been logged and
    /// playback reset when this returns `Err`.
    pub fn run_cycle(&mut self) -> Result<()> {
        self.ctx.clock.sleep(POLL_INTERVAL);
        let result = self.cycle();
        if let Err(e) = &result {
            error!("An unexpected error occurred: {}", e);
            error!("Playback reset is now required.");
            self.reset_playback();
        }
        result
    }

    fn cycle(&mut self) -> Result<()> {
        self.check_playback_status()?;
        let events = self.playback_events_info(self.ctx.config.crossfade_length_ms)?;
        if events.next_ms > SAFETY_MARGIN_MS {
            self.maintenance(events.next_ms);
            Ok(())
        } else {
            self.playback_transition(events)
        }
    }

    /// Stop every output and forget the current and next items.
    pub fn reset_playback(&mut self) {
        info!("Resetting playback.");
        for (id, session) in self.ctx.sessions.iter_mut().enumerate() {
            if let Err(e) = quiet_session(session.as_mut()) {
                error!(session = id, "audio session is not usable: {}", e);
            }
        }
        if let Err(e) = self.ctx.line_in.set_volume(0) {
            error!("could not silence LineIn: {}", e);
        }
        self.run.reset();
    }

    /// Reload the segment at the next opportunity, even if it has not changed.
    pub fn request_reload(&mut self) {
        info!("segment reload requested");
        self.run.force_reload = true;
    }

    /// Compare what every output should be doing with what it reports.
    pub fn check_playback_status(&self) -> Result<()> {
        let volumes = self.ctx.store_status.volumes;
        for (id, session) in self.ctx.sessions.iter().enumerate() {
            if !session.is_running()? {
                return Err(PlayerError::Audio(format!("audio session {} is not running!", id)));
            }
            let usage = self.run.allocator.usage(id)?;
            let Some((path, volume)) = expected_playback(&self.run, &volumes, usage)? else {
                if !session.is_stopped()? {
                    return Err(PlayerError::Audio(format!(
                        "audio session {} is meant to be in a 'stopped' state!",
                        id
                    )));
                }
                continue;
            };
            if !session.is_playing()? {
                return Err(PlayerError::Audio(format!("audio session {} is meant to be playing!", id)));
            }
            if session.path()?.as_deref() != Some(path.as_path()) {
                return Err(PlayerError::Audio(format!(
                    "audio session {} is playing incorrect media!",
                    id
                )));
            }
            let actual = session.volume()?;
            if actual != volume {
                return Err(PlayerError::Audio(format!(
                    "audio session {} has an incorrect volume! ({}%, expected {}%)",
                    id, actual, volume
                )));
            }
            if session.repeat()? {
                return Err(PlayerError::Audio(format!("audio session {} repeat is turned on!", id)));
            }
        }

        let expected = line_in_level(&self.run, &volumes);
        let level = self.ctx.line_in.volume()?;
        if level != expected {
            return Err(PlayerError::Audio(format!("LineIn is at an incorrect level! ({}%)", level)));
        }
        Ok(())
    }

    /// How long until each upcoming event of the current item.
    ///
    /// If a promo would interrupt the current song it is fetched into the
    /// next slot now and expected to start after `interrupt_delay_ms`.
    pub fn playback_events_info(&mut self, interrupt_delay_ms: i64) -> Result<PlaybackEvents> {
        let mut events = PlaybackEvents::default();
        if !self.run.current.loaded {
            events.next_ms = 0;
            events.item_ends_ms = 0;
            return Ok(events);
        }

        if self.run.current.uses_session() {
            let id = self.run.allocator.find_by_usage(SessionUsage::CurrentForeground)?;
            let session = self
                .ctx
                .sessions
                .get(id)
                .ok_or_else(|| PlayerError::logic(format!("session {} does not exist", id)))?;
            let pos = session.position_ms()?;
            events.item_ends_ms = session.length_ms()? - pos;
            if let Some(bed) = &self.run.current.music_bed {
                if !bed.start_handled {
                    events.bed_starts_ms = bed.start_ms - pos;
                }
                if !bed.stop_handled {
                    events.bed_ends_ms = (bed.start_ms + bed.length_ms - pos).min(events.item_ends_ms);
                }
            }
        }

        if self.run.current.is_music() && !self.run.next.loaded {
            if let Some(promo) = self.next_promo(interrupt_delay_ms, true)? {
                self.run.next = promo;
                events.promo_interrupt_ms = interrupt_delay_ms;
            }
        }

        if self.run.current.is_line_in() || self.run.current.is_silence() {
            self.recheck_next_item(interrupt_delay_ms)?;
            if self.run.next.loaded && self.run.current.same_source_as(&self.run.next) {
                self.run.next.reset();
            }
            if self.run.next.loaded {
                events.item_ends_ms = 0;
            }
        }

        if self.run.force_reload && !self.run.next.loaded {
            events.reload_interrupt_ms = interrupt_delay_ms;
        }

        events.update_next();
        Ok(events)
    }

    /// Line input and silence have no end: look for something else to play
    /// once a minute.
    fn recheck_next_item(&mut self, starts_ms: i64) -> Result<()> {
        if self.run.next.loaded {
            return Ok(());
        }
        let now = self.ctx.clock.now();
        if self.run.last_next_check.is_some_and(|last| last > now) {
            self.run.last_next_check = None;
        }
        let minute = |t: NaiveDateTime| t.and_utc().timestamp().div_euclid(60);
        if self.run.last_next_check.map(minute) == Some(minute(now)) {
            return Ok(());
        }
        self.run.last_next_check = Some(now);
        match self.get_next_item(starts_ms) {
            Ok(pe) => self.run.next = pe,
            Err(e @ PlayerError::Logic(_)) => return Err(e),
            Err(e) => debug!("no next item yet: {}", e),
        }
        Ok(())
    }

    fn next_promo(&mut self, starts_ms: i64, interrupting: bool) -> Result<Option<ProgrammingElement>> {
        let req = PromoRequest {
            now: self.ctx.clock.now(),
            starts_ms,
            segment: &self.run.segment,
            current: &self.run.current,
            interrupting,
        };
        self.run.promos.next_promo(self.ctx.repo.as_mut(), &self.ctx.config, &req)
    }

    /// Decide what plays after the current item, `starts_ms` from now.
    ///
    /// Queued promos come first, then silence while the store is closed,
    /// then a new promo batch, then the format clock.
    pub fn get_next_item(&mut self, starts_ms: i64) -> Result<ProgrammingElement> {
        if self.run.next.loaded {
            return Err(PlayerError::logic("next item is already loaded"));
        }
        let queued = self.run.promos.pop_queued();
        self.refresh_store_status()?;
        if let Some(pe) = queued {
            return Ok(pe);
        }

        if !self.ctx.store_status.open {
            self.run.resolver.reset();
            return Ok(ProgrammingElement::silence());
        }

        if let Some(pe) = self.next_promo(starts_ms, false)? {
            return Ok(pe);
        }
        self.next_from_format_clock(starts_ms)
    }

    fn next_from_format_clock(&mut self, starts_ms: i64) -> Result<ProgrammingElement> {
        let now = self.ctx.clock.now();
        let sources = self.ctx.sources(now);
        let run = &mut self.run;
        let outcome = {
            let loader = sources.loader(&run.history);
            run.resolver
                .resolve(now, starts_ms, &mut run.segment, &mut run.force_reload, &loader)?
        };
        if outcome.segment_changed {
            run.next_segment_changed = true;
        }
        self.selector.next_item(&mut run.segment, &sources, &mut run.history)
    }

    /// Handle every event due within the safety margin, chaining transitions
    /// until the next event is far enough away.
    fn playback_transition(&mut self, mut events: PlaybackEvents) -> Result<()> {
        let crossfade_ms = self.ctx.config.crossfade_length_ms;

        while events.next_ms < SAFETY_MARGIN_MS {
            let queue_start = self.ctx.clock.monotonic();
            let item_stops = events.item_stops_ms();
            let mut crossfade = false;

            if item_stops < SAFETY_MARGIN_MS {
                if let Some(slot) = self.run.current.promo.as_ref().map(|p| p.slot_id) {
                    let now = self.ctx.clock.now();
                    self.run.promos.mark_complete(self.ctx.repo.as_mut(), slot, now)?;
                }
                if !self.run.next.loaded {
                    self.run.next = self.get_next_item(item_stops)?;
                }

                let segment = &self.run.segment;
                crossfade = transition::should_crossfade(
                    &self.run.current,
                    &self.run.next,
                    segment.cat,
                    segment.crossfade,
                    self.run.next_segment_changed,
                    events.interrupting(),
                );
                if crossfade {
                    info!("Will crossfade between this item and the next.");
                } else {
                    info!("Will not crossfade between this and the next item.");
                }
                self.run.next_segment_changed = false;
            }

            let timing = QueueTiming {
                events,
                crossfade,
                crossfade_ms,
                line_in_live: self.ctx.line_in.volume()? != 0,
            };
            let queue = transition::build_queue(&self.run.current, &self.run.next, &timing)?;
            let handoff = queue.iter().any(|e| e.command == Command::NextBecomesCurrent);

            let summary = {
                let mut dispatcher = Dispatcher::new(&mut self.ctx, &mut self.run, crossfade, &queue);
                transition::execute(queue, queue_start, &mut dispatcher)?
            };
            debug!(events = summary.executed, "transition queue done");
            if handoff {
                self.handoffs += 1;
            }

            self.run.vol_current = 100;
            self.run.vol_next = 100;
            events = self.playback_events_info(crossfade_ms)?;
        }
        Ok(())
    }

    /// Low-priority work, each task gated by its own frequency. Nothing
    /// starts once the next playback event is inside the safety margin.
    fn maintenance(&mut self, next_event_ms: i64) {
        let budget_ms = next_event_ms - SAFETY_MARGIN_MS;
        let started = self.ctx.clock.monotonic();
        let within_budget = |ctx: &PlayerContext| {
            (ctx.clock.monotonic().saturating_sub(started).as_millis() as i64) < budget_ms
        };

        let now = self.ctx.clock.now();
        if within_budget(&self.ctx) && self.timers.missed_promos.due(now) {
            let mins = self.ctx.config.promos.mins_to_miss_after;
            if let Err(e) = report_missed_promos(self.ctx.repo.as_mut(), now, mins) {
                warn!("could not check for missed announcements: {}", e);
            }
        }
        if within_budget(&self.ctx) {
            if let Err(e) = self.refresh_store_status() {
                warn!("could not refresh the store status: {}", e);
            }
        }
        if within_budget(&self.ctx) && self.timers.tag_cache.due(now) {
            if let Err(e) = self.ctx.tags.save_changes() {
                warn!("could not save the tag cache: {}", e);
            }
        }
        if within_budget(&self.ctx) && self.timers.heartbeat.due(now) {
            info!("{}", self.heartbeat_line(next_event_ms));
        }
    }

    fn heartbeat_line(&self, next_event_ms: i64) -> String {
        let mut line = String::from("Running... (");
        let current = &self.run.current;
        if current.is_silence() {
            line.push_str("Silence");
        } else if current.is_line_in() {
            let level = self.ctx.line_in.volume().unwrap_or_default();
            line.push_str(&format!("LineIn: {}%", level));
        } else if current.loaded {
            for (usage, label) in [
                (SessionUsage::CurrentForeground, ""),
                (SessionUsage::CurrentBackground, ". Music bed: "),
            ] {
                if let Ok(id) = self.run.allocator.find_by_usage(usage) {
                    let volume = self.ctx.sessions.get(id).and_then(|s| s.volume().ok()).unwrap_or_default();
                    line.push_str(&format!("{}session {}: {}%", label, id, volume));
                }
            }
        } else {
            line.push_str("Idle");
        }
        if next_event_ms < NO_EVENT_MS && next_event_ms < 24 * 60 * 60 * 1000 {
            let secs = next_event_ms / 1000;
            let at = self.ctx.clock.now() + chrono::Duration::seconds(secs);
            line.push_str(&format!(". Next playback event: ~{} ({}s)", at.format("%T"), secs));
        }
        line.push(')');
        line
    }

    fn refresh_store_status(&mut self) -> Result<()> {
        let now = self.ctx.clock.now();
        if !self.timers.store_status.due(now) {
            return Ok(());
        }
        self.load_store_status(false)
    }

    /// Fetch open/closed state and volumes. A closed store plays at 0%.
    fn load_store_status(&mut self, verbose: bool) -> Result<()> {
        let mut status = self.ctx.repo.store_status()?;
        if !status.open {
            status.volumes = StoreVolumes {
                music: 0,
                announce: 0,
                line_in: 0,
            };
        }
        let previous = std::mem::replace(&mut self.ctx.store_status, status);
        if verbose || previous.open != status.open {
            info!("Store is now {}", if status.open { "Open" } else { "Closed" });
        }
        if previous.volumes != status.volumes {
            info!(
                music = status.volumes.music,
                announce = status.volumes.announce,
                line_in = status.volumes.line_in,
                "store volumes changed"
            );
            self.apply_volumes()?;
        }
        Ok(())
    }

    /// Push the current store volumes to every output in use.
    fn apply_volumes(&mut self) -> Result<()> {
        let volumes = self.ctx.store_status.volumes;
        for (id, session) in self.ctx.sessions.iter_mut().enumerate() {
            let usage = self.run.allocator.usage(id)?;
            if let Some((_, volume)) = expected_playback(&self.run, &volumes, usage)? {
                session.set_volume(volume)?;
            }
        }
        if self.run.allocator.line_in_usage() != SessionUsage::Unused {
            self.ctx.line_in.set_volume(line_in_level(&self.run, &volumes))?;
        }
        Ok(())
    }
}
