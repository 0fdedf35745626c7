//! Streams and their lease sessions.
//!
//! A `Stream` is the cached form of one durable work unit: its identity and
//! cumulative counters. While leased it holds an `ActiveStream`, the session
//! that buffers frames between checkpoints.

use crate::{CoreError, lock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle status, persisted as `"enabled"` / `"disabled"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Enabled,
    /// Terminal: the stream is never leased again.
    Disabled,
}

/// Cumulative, durable counters of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub status: StreamStatus,
    pub committed_frames: u64,
    /// Consecutive zero-frame checkpoints since the last frame-producing one.
    pub checkpoint_version: u64,
    pub error_count: u32,
}

/// Versions a checkpoint commit will write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPlan {
    pub frame_version: u64,
    pub checkpoint_version: u64,
    pub frames_added: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub error_count: u32,
    pub disabled: bool,
}

#[derive(Debug, Default)]
struct StreamState {
    counters: StreamCounters,
    active: Option<Arc<ActiveStream>>,
}

#[derive(Debug)]
pub struct Stream {
    id: String,
    target_id: String,
    state: Mutex<StreamState>,
}

impl Stream {
    pub fn new(id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self::restore(id, target_id, StreamCounters::default())
    }

    /// Rebuild a stream from its persisted counters.
    pub fn restore(
        id: impl Into<String>,
        target_id: impl Into<String>,
        counters: StreamCounters,
    ) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            state: Mutex::new(StreamState {
                counters,
                active: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn counters(&self) -> StreamCounters {
        lock(&self.state).counters
    }

    pub fn is_disabled(&self) -> bool {
        self.counters().status == StreamStatus::Disabled
    }

    /// The current lease, if one is live.
    pub fn active(&self) -> Option<Arc<ActiveStream>> {
        lock(&self.state)
            .active
            .as_ref()
            .filter(|session| !session.is_released())
            .cloned()
    }

    pub fn attach(&self, session: Arc<ActiveStream>) -> Result<(), CoreError> {
        let mut state = lock(&self.state);
        if state.counters.status == StreamStatus::Disabled {
            return Err(CoreError::StreamDisabled(self.id.clone()));
        }
        state.active = Some(session);
        Ok(())
    }

    /// Drop the session if it is still the one identified by `token`.
    pub fn detach(&self, token: &str) -> bool {
        let mut state = lock(&self.state);
        match state.active.as_ref() {
            Some(session) if session.token() == token => {
                state.active = None;
                true
            }
            _ => false,
        }
    }

    pub fn plan_commit(&self, buffered_frames: u64) -> CommitPlan {
        let counters = lock(&self.state).counters;
        if buffered_frames > 0 {
            CommitPlan {
                frame_version: counters.committed_frames + buffered_frames,
                checkpoint_version: 0,
                frames_added: buffered_frames,
            }
        } else {
            CommitPlan {
                frame_version: counters.committed_frames,
                checkpoint_version: counters.checkpoint_version + 1,
                frames_added: 0,
            }
        }
    }

    pub fn apply_commit(&self, plan: &CommitPlan) {
        let mut state = lock(&self.state);
        state.counters.committed_frames = plan.frame_version;
        state.counters.checkpoint_version = plan.checkpoint_version;
    }

    /// Count one failed stop; disable once `max_fails` is reached.
    pub fn record_failure(&self, max_fails: u32) -> FailureOutcome {
        let mut state = lock(&self.state);
        let counters = &mut state.counters;
        if counters.status == StreamStatus::Enabled {
            counters.error_count += 1;
            if counters.error_count >= max_fails {
                counters.status = StreamStatus::Disabled;
            }
        }
        FailureOutcome {
            error_count: counters.error_count,
            disabled: counters.status == StreamStatus::Disabled,
        }
    }
}

/// Mutable per-lease state, guarded by the session lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub donor_progress: f64,
    pub buffered_frames: u64,
    /// Frames committed by checkpoints under this lease.
    pub committed_frames: u64,
    pub last_frame_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub token: String,
    pub user: String,
    pub engine: String,
    pub start_time: DateTime<Utc>,
    pub donor_progress: f64,
    pub committed_frames: u64,
}

/// One lease: a time-bounded, token-authenticated checkout of a stream.
#[derive(Debug)]
pub struct ActiveStream {
    token: String,
    user: String,
    engine: String,
    start_time: DateTime<Utc>,
    released: AtomicBool,
    state: Mutex<SessionState>,
}

impl ActiveStream {
    pub fn new(
        token: impl Into<String>,
        user: impl Into<String>,
        engine: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            user: user.into(),
            engine: engine.into(),
            start_time: Utc::now(),
            released: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Take the session lock for a frame or checkpoint. Fails once the
    /// lease has been released, including when the release happened while
    /// this caller was waiting for the lock.
    pub fn lock(&self) -> Result<MutexGuard<'_, SessionState>, CoreError> {
        let guard = lock(&self.state);
        if self.is_released() {
            return Err(CoreError::NoActiveLease);
        }
        Ok(guard)
    }

    /// Claim the release of this lease. Exactly one caller (explicit stop,
    /// expiration timer, or teardown) wins; every other gets
    /// `NoActiveLease`.
    pub fn begin_release(&self) -> Result<SessionSnapshot, CoreError> {
        let guard = lock(&self.state);
        self.released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CoreError::NoActiveLease)?;
        Ok(self.snapshot_of(&guard))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let guard = lock(&self.state);
        self.snapshot_of(&guard)
    }

    fn snapshot_of(&self, state: &SessionState) -> SessionSnapshot {
        SessionSnapshot {
            token: self.token.clone(),
            user: self.user.clone(),
            engine: self.engine.clone(),
            start_time: self.start_time,
            donor_progress: state.donor_progress,
            committed_frames: state.committed_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_frame_checkpoints_stack_under_same_frame_version() {
        let stream = Stream::new("s-1", "t-1");

        let first = stream.plan_commit(0);
        assert_eq!((first.frame_version, first.checkpoint_version), (0, 1));
        stream.apply_commit(&first);

        let second = stream.plan_commit(0);
        assert_eq!((second.frame_version, second.checkpoint_version), (0, 2));
        stream.apply_commit(&second);

        let with_frames = stream.plan_commit(3);
        assert_eq!(
            (with_frames.frame_version, with_frames.checkpoint_version),
            (3, 0)
        );
        stream.apply_commit(&with_frames);

        let after = stream.plan_commit(0);
        assert_eq!((after.frame_version, after.checkpoint_version), (3, 1));
        assert_eq!(stream.counters().committed_frames, 3);
    }

    #[test]
    fn failures_disable_at_threshold() {
        let stream = Stream::new("s-1", "t-1");
        for expected in 1..3 {
            let outcome = stream.record_failure(3);
            assert_eq!(outcome.error_count, expected);
            assert!(!outcome.disabled);
        }
        let outcome = stream.record_failure(3);
        assert_eq!(outcome.error_count, 3);
        assert!(outcome.disabled);
        assert!(stream.is_disabled());

        // disabled is terminal and stops counting
        assert_eq!(stream.record_failure(3).error_count, 3);
    }

    #[test]
    fn disabled_stream_refuses_sessions() {
        let stream = Stream::new("s-1", "t-1");
        stream.record_failure(1);
        let session = Arc::new(ActiveStream::new("tok", "donor", "openmm"));
        assert_eq!(
            stream.attach(session).unwrap_err(),
            CoreError::StreamDisabled("s-1".to_string())
        );
    }

    #[test]
    fn detach_ignores_stale_tokens() {
        let stream = Stream::new("s-1", "t-1");
        stream
            .attach(Arc::new(ActiveStream::new("new", "donor", "openmm")))
            .expect("attach");
        assert!(!stream.detach("old"));
        assert!(stream.active().is_some());
        assert!(stream.detach("new"));
        assert!(stream.active().is_none());
    }

    #[test]
    fn release_is_won_exactly_once() {
        let session = ActiveStream::new("tok", "donor", "openmm");
        {
            let mut state = session.lock().expect("live session");
            state.donor_progress += 0.5;
            state.committed_frames = 2;
        }
        let snapshot = session.begin_release().expect("first release");
        assert_eq!(snapshot.donor_progress, 0.5);
        assert_eq!(snapshot.committed_frames, 2);
        assert_eq!(session.begin_release().unwrap_err(), CoreError::NoActiveLease);
        assert_eq!(session.lock().unwrap_err(), CoreError::NoActiveLease);
    }
}
