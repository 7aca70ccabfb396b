use crate::audio::AudioSession;
use crate::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of audio sessions in the pool.
pub const SESSION_COUNT: usize = 4;

/// What an audio session (or the line input) is currently being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionUsage {
    Unused,
    CurrentForeground,
    CurrentBackground,
    NextForeground,
    NextBackground,
}

impl SessionUsage {
    pub fn is_current(&self) -> bool {
        matches!(
            self,
            SessionUsage::CurrentForeground | SessionUsage::CurrentBackground
        )
    }

    /// The usage this value becomes when the next item becomes current.
    fn promoted(&self) -> Result<SessionUsage> {
        match self {
            SessionUsage::Unused => Ok(SessionUsage::Unused),
            SessionUsage::NextForeground => Ok(SessionUsage::CurrentForeground),
            SessionUsage::NextBackground => Ok(SessionUsage::CurrentBackground),
            other => Err(PlayerError::logic(format!(
                "usage {} is still held during handoff",
                other
            ))),
        }
    }
}

impl Default for SessionUsage {
    fn default() -> Self {
        SessionUsage::Unused
    }
}

impl fmt::Display for SessionUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionUsage::Unused => write!(f, "unused"),
            SessionUsage::CurrentForeground => write!(f, "current-foreground"),
            SessionUsage::CurrentBackground => write!(f, "current-background"),
            SessionUsage::NextForeground => write!(f, "next-foreground"),
            SessionUsage::NextBackground => write!(f, "next-background"),
        }
    }
}

/// Tracks ownership of the audio session pool and the line input.
///
/// At most one holder (session or line input) may hold a given non-unused
/// usage. `Current*` usages only appear through [`promote_next_to_current`].
///
/// [`promote_next_to_current`]: ResourceAllocator::promote_next_to_current
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAllocator {
    sessions: Vec<SessionUsage>,
    line_in: SessionUsage,
}

impl ResourceAllocator {
    pub fn new() -> Self {
        Self::with_sessions(SESSION_COUNT)
    }

    pub fn with_sessions(count: usize) -> Self {
        ResourceAllocator {
            sessions: vec![SessionUsage::Unused; count],
            line_in: SessionUsage::Unused,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn usages(&self) -> &[SessionUsage] {
        &self.sessions
    }

    pub fn usage(&self, id: usize) -> Result<SessionUsage> {
        self.sessions
            .get(id)
            .copied()
            .ok_or_else(|| PlayerError::logic(format!("session {} does not exist", id)))
    }

    pub fn line_in_usage(&self) -> SessionUsage {
        self.line_in
    }

    /// Find the first unused session.
    pub fn allocate_free(&self) -> Result<usize> {
        self.sessions
            .iter()
            .position(|u| *u == SessionUsage::Unused)
            .ok_or(PlayerError::NoFreeSession)
    }

    /// Find the session holding `usage`.
    pub fn find_by_usage(&self, usage: SessionUsage) -> Result<usize> {
        self.sessions
            .iter()
            .position(|u| *u == usage)
            .ok_or(PlayerError::UsageNotHeld(usage))
    }

    /// True if the line input holds `usage`.
    pub fn uses_line_in(&self, usage: SessionUsage) -> bool {
        self.line_in == usage
    }

    fn held_elsewhere(&self, usage: SessionUsage) -> bool {
        self.line_in == usage || self.sessions.contains(&usage)
    }

    fn check_transition(&self, existing: SessionUsage, usage: SessionUsage) -> Result<()> {
        if usage == SessionUsage::Unused {
            if existing == SessionUsage::Unused {
                return Err(PlayerError::logic("resource is already free"));
            }
            return Ok(());
        }
        if existing != SessionUsage::Unused {
            return Err(PlayerError::logic(format!(
                "resource is already in use ({}), cannot set {}",
                existing, usage
            )));
        }
        if self.held_elsewhere(usage) {
            return Err(PlayerError::logic(format!(
                "usage {} is already held by another resource",
                usage
            )));
        }
        Ok(())
    }

    /// Assign `usage` to session `id`. Use `Unused` to free it.
    pub fn set_usage(&mut self, id: usize, usage: SessionUsage) -> Result<()> {
        let existing = self.usage(id)?;
        self.check_transition(existing, usage)?;
        self.sessions[id] = usage;
        Ok(())
    }

    /// Assign `usage` to the line input. Line input only carries foreground audio.
    pub fn set_line_in_usage(&mut self, usage: SessionUsage) -> Result<()> {
        if matches!(
            usage,
            SessionUsage::CurrentBackground | SessionUsage::NextBackground
        ) {
            return Err(PlayerError::logic("line input cannot carry a music bed"));
        }
        self.check_transition(self.line_in, usage)?;
        self.line_in = usage;
        Ok(())
    }

    /// Free a session after checking that the engine has really stopped it.
    pub fn release(&mut self, id: usize, session: &dyn AudioSession) -> Result<()> {
        if session.is_playing()? {
            return Err(PlayerError::logic(format!(
                "session {} is still playing, cannot release it",
                id
            )));
        }
        self.set_usage(id, SessionUsage::Unused)
    }

    /// Remap every `Next*` usage onto its `Current*` counterpart.
    ///
    /// Fails if any resource still holds a `Current*` usage: the previous
    /// owner was never released.
    pub fn promote_next_to_current(&mut self) -> Result<()> {
        let promoted = self
            .sessions
            .iter()
            .map(SessionUsage::promoted)
            .collect::<Result<Vec<_>>>()?;
        let line_in = self.line_in.promoted()?;
        self.sessions = promoted;
        self.line_in = line_in;
        Ok(())
    }

    /// Forget all ownership. Used by a full playback reset.
    pub fn reset(&mut self) {
        self.sessions.iter_mut().for_each(|u| *u = SessionUsage::Unused);
        self.line_in = SessionUsage::Unused;
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemorySession;
    use crate::clock::ManualClock;
    use std::path::Path;

    #[test]
    fn allocate_free_returns_first_unused() {
        let mut alloc = ResourceAllocator::new();
        assert_eq!(alloc.allocate_free().unwrap(), 0);
        alloc.set_usage(0, SessionUsage::NextForeground).unwrap();
        assert_eq!(alloc.allocate_free().unwrap(), 1);
    }

    #[test]
    fn allocate_free_fails_when_pool_exhausted() {
        let mut alloc = ResourceAllocator::with_sessions(2);
        alloc.set_usage(0, SessionUsage::NextForeground).unwrap();
        alloc.set_usage(1, SessionUsage::NextBackground).unwrap();
        assert!(matches!(alloc.allocate_free(), Err(PlayerError::NoFreeSession)));
    }

    #[test]
    fn set_then_unset_restores_state() {
        let mut alloc = ResourceAllocator::new();
        let before = alloc.clone();
        alloc.set_usage(2, SessionUsage::NextForeground).unwrap();
        alloc.set_usage(2, SessionUsage::Unused).unwrap();
        assert_eq!(alloc, before);
    }

    #[test]
    fn freeing_an_unused_session_is_a_logic_error() {
        let mut alloc = ResourceAllocator::new();
        assert!(matches!(
            alloc.set_usage(0, SessionUsage::Unused),
            Err(PlayerError::Logic(_))
        ));
    }

    #[test]
    fn double_allocation_is_rejected() {
        let mut alloc = ResourceAllocator::new();
        alloc.set_usage(0, SessionUsage::NextForeground).unwrap();
        // Same session, different usage.
        assert!(alloc.set_usage(0, SessionUsage::NextBackground).is_err());
        // Different session, same usage.
        assert!(alloc.set_usage(1, SessionUsage::NextForeground).is_err());
    }

    #[test]
    fn usage_held_by_line_in_is_rejected_for_sessions() {
        let mut alloc = ResourceAllocator::new();
        alloc.set_line_in_usage(SessionUsage::NextForeground).unwrap();
        assert!(alloc.set_usage(0, SessionUsage::NextForeground).is_err());
        assert!(alloc.uses_line_in(SessionUsage::NextForeground));
    }

    #[test]
    fn line_in_cannot_hold_background_usage() {
        let mut alloc = ResourceAllocator::new();
        assert!(alloc.set_line_in_usage(SessionUsage::NextBackground).is_err());
    }

    #[test]
    fn find_by_usage_reports_missing_usage() {
        let alloc = ResourceAllocator::new();
        assert!(matches!(
            alloc.find_by_usage(SessionUsage::CurrentForeground),
            Err(PlayerError::UsageNotHeld(SessionUsage::CurrentForeground))
        ));
    }

    #[test]
    fn promote_moves_next_to_current() {
        let mut alloc = ResourceAllocator::new();
        alloc.set_usage(1, SessionUsage::NextForeground).unwrap();
        alloc.set_usage(3, SessionUsage::NextBackground).unwrap();
        alloc.promote_next_to_current().unwrap();
        assert_eq!(alloc.find_by_usage(SessionUsage::CurrentForeground).unwrap(), 1);
        assert_eq!(alloc.find_by_usage(SessionUsage::CurrentBackground).unwrap(), 3);
        assert!(alloc.find_by_usage(SessionUsage::NextForeground).is_err());
    }

    #[test]
    fn promote_moves_line_in_to_current() {
        let mut alloc = ResourceAllocator::new();
        alloc.set_line_in_usage(SessionUsage::NextForeground).unwrap();
        alloc.promote_next_to_current().unwrap();
        assert!(alloc.uses_line_in(SessionUsage::CurrentForeground));
    }

    #[test]
    fn promote_with_current_still_held_is_a_logic_error() {
        let mut alloc = ResourceAllocator::new();
        alloc.set_usage(0, SessionUsage::NextForeground).unwrap();
        alloc.promote_next_to_current().unwrap();
        alloc.set_usage(1, SessionUsage::NextForeground).unwrap();
        let before = alloc.clone();
        assert!(matches!(
            alloc.promote_next_to_current(),
            Err(PlayerError::Logic(_))
        ));
        // Nothing was half-applied.
        assert_eq!(alloc, before);
    }

    #[test]
    fn release_refuses_a_playing_session() {
        let clock = ManualClock::default();
        let mut session = MemorySession::new(clock.clone());
        session.set_media_length(Path::new("a.mp3"), 60_000);
        session.add_url(Path::new("a.mp3")).unwrap();
        session.play().unwrap();

        let mut alloc = ResourceAllocator::new();
        alloc.set_usage(0, SessionUsage::NextForeground).unwrap();
        assert!(alloc.release(0, &session).is_err());

        session.stop().unwrap();
        alloc.release(0, &session).unwrap();
        assert_eq!(alloc.usage(0).unwrap(), SessionUsage::Unused);
    }

    #[test]
    fn reset_frees_everything() {
        let mut alloc = ResourceAllocator::new();
        alloc.set_usage(0, SessionUsage::NextForeground).unwrap();
        alloc.set_line_in_usage(SessionUsage::NextBackground).ok();
        alloc.reset();
        assert_eq!(alloc, ResourceAllocator::new());
    }
}
