#![forbid(unsafe_code)]

//! Track queue orchestrator.
//!
//! Walks the selected evidence tracks in canonical order. The cursor moves
//! only on an explicit completion signal, and every transition is written to
//! the session store so a reload resumes at the same track. This is the only
//! writer of the persisted queue state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use custody_contracts::track::{Locale, QueueState, TrackKind};
use custody_contracts::{ContractViolation, UnixTimeMs, Validate};
use custody_engines::track_labels::{notice, track_labels, Notice, NoticeKey, TrackLabels};
use custody_storage::session::{FileSessionStore, SessionStore, SessionStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CustodyConfig;

pub const SESSION_KEY_TRACK_QUEUE: &str = "custody.track_queue";
pub const SESSION_KEY_COMPLETED_TRACKS: &str = "custody.completed_tracks";
pub const SESSION_KEY_TOUCHED_AT: &str = "custody.session_touched_at";

/// Traversal phase.
///
/// There is no separate track-complete phase: `complete_current` closes the
/// active track and moves straight to the next `TrackActive` or to
/// `AllComplete` in the same call, so the in-between state is never observed
/// or persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPhase {
    Idle,
    TrackSelecting,
    TrackActive,
    AllComplete,
}

/// How the active track ended. Every signal advances the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSignal {
    Submitted,
    Queued,
    Skipped,
    /// An external collaborator acknowledged the hand-off.
    HandedOff,
    Failed,
}

impl TrackSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Skipped => "skipped",
            Self::HandedOff => "handed_off",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Next(TrackKind),
    AllComplete,
}

#[derive(Debug, Error)]
pub enum TrackQueueError {
    #[error("no selectable tracks remain in this session")]
    EmptySelection,
    #[error("{op} is not valid while {phase:?}")]
    InvalidTransition { op: &'static str, phase: TrackPhase },
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error("track queue state encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedTrackQueue {
    phase: TrackPhase,
    queue: Option<QueueState>,
}

pub struct TrackQueueOrchestrator {
    store: Arc<dyn SessionStore>,
    locale: Locale,
    phase: TrackPhase,
    queue: Option<QueueState>,
    completed: BTreeSet<TrackKind>,
}

impl std::fmt::Debug for TrackQueueOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackQueueOrchestrator")
            .field("locale", &self.locale)
            .field("phase", &self.phase)
            .field("queue", &self.queue)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl TrackQueueOrchestrator {
    /// Restores the session's traversal, or starts `Idle` when nothing usable is stored.
    pub fn resume(store: Arc<dyn SessionStore>, locale: Locale) -> Result<Self, TrackQueueError> {
        let completed = load_completed(store.as_ref())?;
        let mut this = Self {
            store,
            locale,
            phase: TrackPhase::Idle,
            queue: None,
            completed,
        };

        let Some(raw) = this.store.get(SESSION_KEY_TRACK_QUEUE)? else {
            return Ok(this);
        };
        match decode_persisted(&raw) {
            Some(persisted) => {
                this.phase = persisted.phase;
                this.queue = persisted.queue;
                this.skip_completed()?;
                tracing::debug!(phase = ?this.phase, "track queue resumed");
            }
            None => {
                tracing::warn!("discarding unreadable track queue state");
                this.store.clear(SESSION_KEY_TRACK_QUEUE)?;
            }
        }
        Ok(this)
    }

    /// Like `resume`, but a session idle for longer than `ttl` is discarded
    /// first, completed tracks included. A stored session with no touch stamp
    /// counts as idle.
    pub fn resume_within(
        store: Arc<dyn SessionStore>,
        locale: Locale,
        ttl: Duration,
        now: UnixTimeMs,
    ) -> Result<Self, TrackQueueError> {
        let touched = store
            .get(SESSION_KEY_TOUCHED_AT)?
            .and_then(|raw| raw.trim().parse::<u64>().ok());
        let idle_ms = touched.map(|at| now.0.saturating_sub(at));
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let stale = match idle_ms {
            Some(idle) => idle > ttl_ms,
            None => true,
        };
        if stale {
            let had_state = store.get(SESSION_KEY_TRACK_QUEUE)?.is_some()
                || store.get(SESSION_KEY_COMPLETED_TRACKS)?.is_some();
            if had_state {
                tracing::info!(idle_ms = ?idle_ms, "track session expired; starting fresh");
            }
            clear_session(store.as_ref())?;
        }
        Self::resume(store, locale)
    }

    /// Resumes from the file-backed session store under the configured data
    /// directory, discarding a session idle past the configured TTL.
    pub fn open(config: &CustodyConfig, locale: Locale) -> Result<Self, TrackQueueError> {
        Self::resume_within(
            Arc::new(FileSessionStore::new(config.session_dir())),
            locale,
            config.session_ttl(),
            UnixTimeMs::now(),
        )
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    pub fn snapshot(&self) -> Option<&QueueState> {
        self.queue.as_ref()
    }

    pub fn current(&self) -> Option<TrackKind> {
        match self.phase {
            TrackPhase::TrackActive => self.queue.as_ref().and_then(QueueState::current),
            _ => None,
        }
    }

    pub fn remaining(&self) -> &[TrackKind] {
        match (&self.phase, &self.queue) {
            (TrackPhase::TrackActive, Some(q)) => q.remaining(),
            _ => &[],
        }
    }

    pub fn completed_tracks(&self) -> Vec<TrackKind> {
        self.completed.iter().copied().collect()
    }

    /// Tracks still offered for selection, in canonical order.
    pub fn selectable_tracks(&self) -> Vec<TrackKind> {
        TrackKind::CANONICAL_ORDER
            .into_iter()
            .filter(|t| !self.completed.contains(t))
            .collect()
    }

    pub fn current_labels(&self) -> Option<TrackLabels> {
        self.current().map(|t| track_labels(t, self.locale))
    }

    pub fn begin_selection(&mut self) -> Result<(), TrackQueueError> {
        match self.phase {
            TrackPhase::Idle | TrackPhase::AllComplete => {
                self.phase = TrackPhase::TrackSelecting;
                self.queue = None;
                self.persist_queue()?;
                tracing::info!("track selection started");
                Ok(())
            }
            TrackPhase::TrackSelecting => Ok(()),
            TrackPhase::TrackActive => Err(TrackQueueError::InvalidTransition {
                op: "begin_selection",
                phase: self.phase,
            }),
        }
    }

    /// Fixes the traversal and activates its first track. Tracks already
    /// completed this session are dropped from the selection.
    pub fn confirm_selection(
        &mut self,
        selection: &[TrackKind],
    ) -> Result<TrackKind, TrackQueueError> {
        if self.phase != TrackPhase::TrackSelecting {
            return Err(TrackQueueError::InvalidTransition {
                op: "confirm_selection",
                phase: self.phase,
            });
        }
        let fresh: Vec<TrackKind> = selection
            .iter()
            .copied()
            .filter(|t| !self.completed.contains(t))
            .collect();
        if fresh.is_empty() {
            return Err(TrackQueueError::EmptySelection);
        }
        let queue = QueueState::from_selection(&fresh)?;
        let first = queue.current().ok_or(TrackQueueError::EmptySelection)?;
        self.queue = Some(queue);
        self.phase = TrackPhase::TrackActive;
        self.persist_queue()?;
        tracing::info!(
            tracks = ?self.remaining(),
            first = first.as_str(),
            "track selection confirmed"
        );
        Ok(first)
    }

    /// Closes the active track. Returns `AllComplete` exactly once per traversal.
    pub fn complete_current(&mut self, signal: TrackSignal) -> Result<Advance, TrackQueueError> {
        let track = self.current().ok_or(TrackQueueError::InvalidTransition {
            op: "complete_current",
            phase: self.phase,
        })?;

        self.completed.insert(track);
        self.persist_completed()?;
        if let Some(queue) = self.queue.as_mut() {
            queue.cursor += 1;
        }
        tracing::info!(track = track.as_str(), signal = signal.as_str(), "track complete");

        match self.current() {
            Some(next) => {
                self.persist_queue()?;
                Ok(Advance::Next(next))
            }
            None => {
                self.finish()?;
                Ok(Advance::AllComplete)
            }
        }
    }

    pub fn closing_notice(&self) -> Notice {
        notice(NoticeKey::AllComplete, self.locale)
    }

    /// Forgets the traversal and the completed set. A new session starts `Idle`.
    pub fn end_session(&mut self) -> Result<(), TrackQueueError> {
        clear_session(self.store.as_ref())?;
        self.phase = TrackPhase::Idle;
        self.queue = None;
        self.completed.clear();
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrackQueueError> {
        self.phase = TrackPhase::AllComplete;
        self.queue = None;
        self.store.clear(SESSION_KEY_TRACK_QUEUE)?;
        self.touch()?;
        tracing::info!(completed = self.completed.len(), "all tracks complete");
        Ok(())
    }

    /// A track marked complete before its cursor move was persisted is not shown again.
    fn skip_completed(&mut self) -> Result<(), TrackQueueError> {
        if self.phase != TrackPhase::TrackActive {
            return Ok(());
        }
        let mut moved = false;
        while let Some(track) = self.current() {
            if !self.completed.contains(&track) {
                break;
            }
            if let Some(queue) = self.queue.as_mut() {
                queue.cursor += 1;
                moved = true;
            }
        }
        if self.current().is_none() {
            return self.finish();
        }
        if moved {
            self.persist_queue()?;
        }
        Ok(())
    }

    fn persist_queue(&self) -> Result<(), TrackQueueError> {
        let persisted = PersistedTrackQueue {
            phase: self.phase,
            queue: self.queue.clone(),
        };
        self.store
            .set(SESSION_KEY_TRACK_QUEUE, &serde_json::to_string(&persisted)?)?;
        self.touch()
    }

    fn persist_completed(&self) -> Result<(), TrackQueueError> {
        let completed: Vec<TrackKind> = self.completed.iter().copied().collect();
        self.store
            .set(SESSION_KEY_COMPLETED_TRACKS, &serde_json::to_string(&completed)?)?;
        self.touch()
    }

    fn touch(&self) -> Result<(), TrackQueueError> {
        self.store
            .set(SESSION_KEY_TOUCHED_AT, &UnixTimeMs::now().0.to_string())?;
        Ok(())
    }
}

fn clear_session(store: &dyn SessionStore) -> Result<(), TrackQueueError> {
    store.clear(SESSION_KEY_TRACK_QUEUE)?;
    store.clear(SESSION_KEY_COMPLETED_TRACKS)?;
    store.clear(SESSION_KEY_TOUCHED_AT)?;
    Ok(())
}

fn decode_persisted(raw: &str) -> Option<PersistedTrackQueue> {
    let persisted: PersistedTrackQueue = serde_json::from_str(raw).ok()?;
    let consistent = match (&persisted.phase, &persisted.queue) {
        (TrackPhase::TrackActive, Some(q)) => q.validate().is_ok() && !q.is_exhausted(),
        (TrackPhase::TrackSelecting, None) => true,
        _ => false,
    };
    consistent.then_some(persisted)
}

fn load_completed(store: &dyn SessionStore) -> Result<BTreeSet<TrackKind>, TrackQueueError> {
    let Some(raw) = store.get(SESSION_KEY_COMPLETED_TRACKS)? else {
        return Ok(BTreeSet::new());
    };
    match serde_json::from_str::<Vec<TrackKind>>(&raw) {
        Ok(tracks) => Ok(tracks.into_iter().collect()),
        Err(_) => {
            tracing::warn!("discarding unreadable completed-track set");
            store.clear(SESSION_KEY_COMPLETED_TRACKS)?;
            Ok(BTreeSet::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custody_storage::session::MemorySessionStore;

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(MemorySessionStore::new())
    }

    #[test]
    fn at_track_queue_01_canonical_order_regardless_of_selection_order() {
        let mut o = TrackQueueOrchestrator::resume(store(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        let first = o
            .confirm_selection(&[TrackKind::DirectContact, TrackKind::Digital, TrackKind::Testimony])
            .unwrap();
        assert_eq!(first, TrackKind::Testimony);
        assert_eq!(
            o.complete_current(TrackSignal::Submitted).unwrap(),
            Advance::Next(TrackKind::Digital)
        );
        assert_eq!(
            o.complete_current(TrackSignal::Skipped).unwrap(),
            Advance::Next(TrackKind::DirectContact)
        );
    }

    #[test]
    fn at_track_queue_02_scenario_resume_after_reload() {
        let s = store();
        let mut o = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::DirectContact, TrackKind::Testimony])
            .unwrap();
        o.complete_current(TrackSignal::Submitted).unwrap();
        drop(o);

        let mut reloaded = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        assert_eq!(reloaded.phase(), TrackPhase::TrackActive);
        assert_eq!(reloaded.current(), Some(TrackKind::DirectContact));
        assert_eq!(
            reloaded.complete_current(TrackSignal::HandedOff).unwrap(),
            Advance::AllComplete
        );
        assert_eq!(s.get(SESSION_KEY_TRACK_QUEUE).unwrap(), None);
        assert!(!reloaded.closing_notice().status.is_empty());
    }

    #[test]
    fn at_track_queue_03_all_complete_fires_once() {
        let mut o = TrackQueueOrchestrator::resume(store(), Locale::Uk).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Physical]).unwrap();
        assert_eq!(
            o.complete_current(TrackSignal::Failed).unwrap(),
            Advance::AllComplete
        );
        assert!(matches!(
            o.complete_current(TrackSignal::Submitted),
            Err(TrackQueueError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn at_track_queue_04_completed_tracks_not_resurrected() {
        let s = store();
        let mut o = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Testimony]).unwrap();
        o.complete_current(TrackSignal::Submitted).unwrap();

        let mut o = TrackQueueOrchestrator::resume(s, Locale::En).unwrap();
        assert_eq!(o.phase(), TrackPhase::Idle);
        assert!(!o.selectable_tracks().contains(&TrackKind::Testimony));
        o.begin_selection().unwrap();
        assert!(matches!(
            o.confirm_selection(&[TrackKind::Testimony]),
            Err(TrackQueueError::EmptySelection)
        ));
        assert_eq!(
            o.confirm_selection(&[TrackKind::Testimony, TrackKind::Digital])
                .unwrap(),
            TrackKind::Digital
        );
    }

    #[test]
    fn at_track_queue_05_corrupt_state_discarded() {
        let s = store();
        s.set(SESSION_KEY_TRACK_QUEUE, "{not json").unwrap();
        let o = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        assert_eq!(o.phase(), TrackPhase::Idle);
        assert_eq!(s.get(SESSION_KEY_TRACK_QUEUE).unwrap(), None);

        s.set(
            SESSION_KEY_TRACK_QUEUE,
            r#"{"phase":"track_active","queue":{"tracks":["digital","testimony"],"cursor":0}}"#,
        )
        .unwrap();
        let o = TrackQueueOrchestrator::resume(s, Locale::En).unwrap();
        assert_eq!(o.phase(), TrackPhase::Idle);
    }

    #[test]
    fn at_track_queue_06_completion_only_while_active() {
        let mut o = TrackQueueOrchestrator::resume(store(), Locale::En).unwrap();
        assert!(o.complete_current(TrackSignal::Submitted).is_err());
        assert!(matches!(
            o.confirm_selection(&[TrackKind::Testimony]),
            Err(TrackQueueError::InvalidTransition { .. })
        ));
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Testimony, TrackKind::Physical])
            .unwrap();
        assert!(o.begin_selection().is_err());
        assert_eq!(o.remaining(), &[TrackKind::Testimony, TrackKind::Physical]);
        assert!(o.current_labels().is_some());
    }

    #[test]
    fn at_track_queue_07_file_session_survives_restart() {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        let config = CustodyConfig {
            data_dir: std::env::temp_dir().join(format!("custody-track-queue-test-{suffix}")),
            ..CustodyConfig::default()
        };
        let mut o = TrackQueueOrchestrator::open(&config, Locale::En).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Digital, TrackKind::Physical])
            .unwrap();

        let mut reopened = TrackQueueOrchestrator::open(&config, Locale::En).unwrap();
        assert_eq!(reopened.current(), Some(TrackKind::Physical));
        reopened.end_session().unwrap();
        assert_eq!(
            TrackQueueOrchestrator::open(&config, Locale::En)
                .unwrap()
                .phase(),
            TrackPhase::Idle
        );
        std::fs::remove_dir_all(&config.data_dir).unwrap();
    }

    #[test]
    fn at_track_queue_08_crash_between_writes_skips_completed_track() {
        let s = store();
        s.set(SESSION_KEY_COMPLETED_TRACKS, r#"["testimony"]"#).unwrap();
        s.set(
            SESSION_KEY_TRACK_QUEUE,
            r#"{"phase":"track_active","queue":{"tracks":["testimony","digital"],"cursor":0}}"#,
        )
        .unwrap();
        let o = TrackQueueOrchestrator::resume(s, Locale::En).unwrap();
        assert_eq!(o.current(), Some(TrackKind::Digital));
    }

    fn permutations(items: &[TrackKind]) -> Vec<Vec<TrackKind>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn at_track_queue_09_every_subset_and_order_walks_canonically() {
        let mut walked = 0;
        for mask in 1u8..16 {
            let subset: Vec<TrackKind> = TrackKind::CANONICAL_ORDER
                .into_iter()
                .enumerate()
                .filter(|(i, _)| mask & (1u8 << *i) != 0)
                .map(|(_, t)| t)
                .collect();
            for order in permutations(&subset) {
                let mut o = TrackQueueOrchestrator::resume(store(), Locale::En).unwrap();
                o.begin_selection().unwrap();
                let mut visited = vec![o.confirm_selection(&order).unwrap()];
                let mut all_complete = 0;
                loop {
                    match o.complete_current(TrackSignal::Submitted).unwrap() {
                        Advance::Next(t) => visited.push(t),
                        Advance::AllComplete => {
                            all_complete += 1;
                            break;
                        }
                    }
                }
                assert!(o.complete_current(TrackSignal::Submitted).is_err());
                assert_eq!(visited, subset, "selection order {order:?}");
                assert_eq!(all_complete, 1);
                assert_eq!(o.phase(), TrackPhase::AllComplete);
                walked += 1;
            }
        }
        assert_eq!(walked, 64);
    }

    #[test]
    fn at_track_queue_10_scenario_digital_and_physical_selected() {
        let mut o = TrackQueueOrchestrator::resume(store(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        assert_eq!(
            o.confirm_selection(&[TrackKind::Digital, TrackKind::Physical])
                .unwrap(),
            TrackKind::Physical
        );
        assert_eq!(
            o.complete_current(TrackSignal::Submitted).unwrap(),
            Advance::Next(TrackKind::Digital)
        );
        assert_eq!(o.current(), Some(TrackKind::Digital));
        assert_eq!(
            o.complete_current(TrackSignal::Queued).unwrap(),
            Advance::AllComplete
        );
        assert_eq!(o.phase(), TrackPhase::AllComplete);
        assert_eq!(o.current(), None);
        assert!(matches!(
            o.complete_current(TrackSignal::Submitted),
            Err(TrackQueueError::InvalidTransition { .. })
        ));
        assert_eq!(
            o.completed_tracks(),
            vec![TrackKind::Physical, TrackKind::Digital]
        );
    }

    #[test]
    fn at_track_queue_11_idle_session_expires_with_its_completed_tracks() {
        let s = store();
        let mut o = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Testimony]).unwrap();
        o.complete_current(TrackSignal::Submitted).unwrap();
        drop(o);

        let ttl = Duration::from_secs(60);
        let week_later = UnixTimeMs(UnixTimeMs::now().0 + 7 * 24 * 3_600_000);
        let mut o =
            TrackQueueOrchestrator::resume_within(s.clone(), Locale::En, ttl, week_later).unwrap();
        assert_eq!(o.phase(), TrackPhase::Idle);
        assert!(o.completed_tracks().is_empty());
        assert_eq!(s.get(SESSION_KEY_COMPLETED_TRACKS).unwrap(), None);
        o.begin_selection().unwrap();
        assert_eq!(
            o.confirm_selection(&[TrackKind::Testimony]).unwrap(),
            TrackKind::Testimony
        );
    }

    #[test]
    fn at_track_queue_12_recent_session_resumes_and_unstamped_session_expires() {
        let s = store();
        let mut o = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Testimony, TrackKind::Digital])
            .unwrap();
        o.complete_current(TrackSignal::Submitted).unwrap();
        drop(o);

        let ttl = Duration::from_secs(3_600);
        let o = TrackQueueOrchestrator::resume_within(s.clone(), Locale::En, ttl, UnixTimeMs::now())
            .unwrap();
        assert_eq!(o.current(), Some(TrackKind::Digital));
        assert_eq!(o.completed_tracks(), vec![TrackKind::Testimony]);
        drop(o);

        s.clear(SESSION_KEY_TOUCHED_AT).unwrap();
        let o = TrackQueueOrchestrator::resume_within(s, Locale::En, ttl, UnixTimeMs::now())
            .unwrap();
        assert_eq!(o.phase(), TrackPhase::Idle);
        assert!(o.completed_tracks().is_empty());
    }

    #[test]
    fn at_track_queue_13_completing_a_track_never_persists_an_in_between_phase() {
        let s = store();
        let mut o = TrackQueueOrchestrator::resume(s.clone(), Locale::En).unwrap();
        o.begin_selection().unwrap();
        o.confirm_selection(&[TrackKind::Physical, TrackKind::DirectContact])
            .unwrap();
        o.complete_current(TrackSignal::Skipped).unwrap();
        assert_eq!(o.phase(), TrackPhase::TrackActive);
        let raw = s.get(SESSION_KEY_TRACK_QUEUE).unwrap().unwrap();
        assert!(raw.contains(r#""phase":"track_active""#));
        assert!(raw.contains(r#""cursor":1"#));
    }
}
