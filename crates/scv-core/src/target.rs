//! Targets: one project's queue of inactive streams plus its live leases.
//!
//! State per stream: Inactive → Active → Inactive on a clean stop or an
//! expiration, Active → retired when the orchestration layer disables it.
//! Everything structural sits behind one mutex per target; the mutex is
//! never held across I/O and never while another target's lock is held.

use crate::queue::{PriorityQueue, QueueEntry};
use crate::stream::{ActiveStream, SessionSnapshot};
use crate::token::{TokenEntry, TokenTable};
use crate::{CoreError, DEFAULT_EXPIRATION_SECONDS, lock};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// How long a lease may go without being stopped before it expires.
    pub expiration: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(DEFAULT_EXPIRATION_SECONDS),
        }
    }
}

/// A granted lease, as returned by `Target::activate_stream`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub token: String,
    pub stream_id: String,
    pub session: Arc<ActiveStream>,
}

/// Notified when a lease is released by its expiration timer rather than by
/// an explicit stop.
pub trait LeaseObserver: Send + Sync {
    fn lease_expired(&self, target_id: &str, stream_id: &str, snapshot: &SessionSnapshot);
}

/// What happens to a stream once its lease is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Back into the inactive queue.
    Requeue,
    /// Out of the target for good.
    Retire,
}

struct ActiveEntry {
    session: Arc<ActiveStream>,
    priority: f64,
    timer: AbortHandle,
}

struct TargetState {
    alive: bool,
    queue: PriorityQueue,
    active: HashMap<String, ActiveEntry>,
}

pub struct Target {
    id: String,
    config: TargetConfig,
    tokens: Arc<TokenTable>,
    runtime: Handle,
    observer: Option<Arc<dyn LeaseObserver>>,
    this: Weak<Target>,
    state: Mutex<TargetState>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("expiration", &self.config.expiration)
            .finish_non_exhaustive()
    }
}

impl Target {
    pub fn new(
        id: impl Into<String>,
        config: TargetConfig,
        tokens: Arc<TokenTable>,
        runtime: Handle,
        observer: Option<Arc<dyn LeaseObserver>>,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|this| Self {
            id,
            config,
            tokens,
            runtime,
            observer,
            this: this.clone(),
            state: Mutex::new(TargetState {
                alive: true,
                queue: PriorityQueue::new(),
                active: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.state).alive
    }

    fn live_state(&self) -> Result<MutexGuard<'_, TargetState>, CoreError> {
        let state = lock(&self.state);
        if !state.alive {
            return Err(CoreError::TargetDead(self.id.clone()));
        }
        Ok(state)
    }

    pub fn add_stream(&self, stream_id: &str, priority: f64) -> Result<(), CoreError> {
        let mut state = self.live_state()?;
        if state.active.contains_key(stream_id) || !state.queue.push(stream_id, priority) {
            return Err(CoreError::DuplicateStream(stream_id.to_string()));
        }
        debug!(target_id = %self.id, stream_id, priority, "stream queued");
        Ok(())
    }

    /// Withdraw a stream from the inactive queue. Leased streams are not
    /// touched; returns whether anything was removed.
    pub fn remove_stream(&self, stream_id: &str) -> Result<bool, CoreError> {
        let mut state = self.live_state()?;
        Ok(state.queue.remove(stream_id))
    }

    /// Lease the highest-priority inactive stream to `user`.
    pub fn activate_stream(&self, user: &str, engine: &str) -> Result<Lease, CoreError> {
        let token = Uuid::new_v4().simple().to_string();
        let session = Arc::new(ActiveStream::new(&token, user, engine));

        let mut state = self.live_state()?;
        let entry = state
            .queue
            .pop()
            .ok_or_else(|| CoreError::NoStreamsAvailable(self.id.clone()))?;
        let stream_id = entry.stream_id;

        // The token table lock is a leaf: taking it under the target lock
        // cannot deadlock because nothing holding it takes another lock.
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                target_id: self.id.clone(),
                stream_id: stream_id.clone(),
                session: session.clone(),
            },
        );
        let timer = self.arm_expiration(&stream_id, &token);
        state.active.insert(
            stream_id.clone(),
            ActiveEntry {
                session: session.clone(),
                priority: entry.priority,
                timer,
            },
        );
        drop(state);

        info!(target_id = %self.id, stream_id = %stream_id, user, engine, "stream activated");
        Ok(Lease {
            token,
            stream_id,
            session,
        })
    }

    /// Release the lease on `stream_id` and put the stream back in the
    /// queue. A no-op when the stream is not leased or its release is
    /// already being performed by someone else.
    pub fn deactivate_stream(&self, stream_id: &str) -> Result<(), CoreError> {
        self.release_current(stream_id, Release::Requeue)
    }

    /// Release the lease on `stream_id` without re-queueing it.
    pub fn retire_stream(&self, stream_id: &str) -> Result<(), CoreError> {
        self.release_current(stream_id, Release::Retire)
    }

    fn release_current(&self, stream_id: &str, release: Release) -> Result<(), CoreError> {
        let session = match self.live_state()?.active.get(stream_id) {
            Some(entry) => entry.session.clone(),
            None => return Ok(()),
        };
        match session.begin_release() {
            Ok(snapshot) => self.complete_release(stream_id, &snapshot, release),
            Err(_) => Ok(()),
        }
    }

    /// Structural half of a release, for callers that already won
    /// `ActiveStream::begin_release`. The re-queue priority is the priority
    /// the stream was leased at minus the frames committed under this
    /// lease. Streams start at 0, so a queued stream always sits at minus
    /// its committed frames and streams that have advanced less go first.
    pub fn complete_release(
        &self,
        stream_id: &str,
        snapshot: &SessionSnapshot,
        release: Release,
    ) -> Result<(), CoreError> {
        let mut state = self.live_state()?;
        let Some(entry) = state.active.remove(stream_id) else {
            return Ok(());
        };
        if entry.session.token() != snapshot.token {
            state.active.insert(stream_id.to_string(), entry);
            return Ok(());
        }
        entry.timer.abort();
        if release == Release::Requeue {
            let priority = entry.priority - snapshot.committed_frames as f64;
            state.queue.push(stream_id, priority);
        }
        self.tokens.remove(&snapshot.token);
        drop(state);

        debug!(target_id = %self.id, stream_id, ?release, "lease released");
        Ok(())
    }

    fn arm_expiration(&self, stream_id: &str, token: &str) -> AbortHandle {
        let this = self.this.clone();
        let stream_id = stream_id.to_string();
        let token = token.to_string();
        let expiration = self.config.expiration;
        self.runtime
            .spawn(async move {
                tokio::time::sleep(expiration).await;
                let Some(target) = this.upgrade() else {
                    return;
                };
                let _ = tokio::task::spawn_blocking(move || target.expire(&stream_id, &token))
                    .await;
            })
            .abort_handle()
    }

    fn expire(&self, stream_id: &str, token: &str) {
        let session = {
            let Ok(state) = self.live_state() else {
                return;
            };
            match state.active.get(stream_id) {
                Some(entry) if entry.session.token() == token => entry.session.clone(),
                _ => return,
            }
        };
        let snapshot = match session.begin_release() {
            Ok(snapshot) => snapshot,
            Err(_) => {
                debug!(target_id = %self.id, stream_id, "expiration lost release race");
                return;
            }
        };
        if self
            .complete_release(stream_id, &snapshot, Release::Requeue)
            .is_err()
        {
            return;
        }
        info!(
            target_id = %self.id,
            stream_id,
            user = %snapshot.user,
            engine = %snapshot.engine,
            "lease expired"
        );
        if let Some(observer) = &self.observer {
            observer.lease_expired(&self.id, stream_id, &snapshot);
        }
    }

    pub fn active_stream(&self, stream_id: &str) -> Result<Arc<ActiveStream>, CoreError> {
        self.live_state()?
            .active
            .get(stream_id)
            .map(|entry| entry.session.clone())
            .ok_or(CoreError::NoActiveLease)
    }

    pub fn active_streams(&self) -> Result<BTreeSet<String>, CoreError> {
        Ok(self.live_state()?.active.keys().cloned().collect())
    }

    pub fn inactive_streams(&self) -> Result<BTreeSet<String>, CoreError> {
        Ok(self.live_state()?.queue.ids().map(str::to_string).collect())
    }

    /// Inactive entries in the order they would be activated.
    pub fn queued(&self) -> Result<Vec<QueueEntry>, CoreError> {
        Ok(self.live_state()?.queue.ordered())
    }

    /// Tear the target down: cancel every timer, revoke every token, and
    /// fail every later call with `TargetDead`.
    pub fn die(&self) {
        let sessions: Vec<Arc<ActiveStream>> = {
            let mut state = lock(&self.state);
            if !state.alive {
                return;
            }
            state.alive = false;
            state.queue.clear();
            state
                .active
                .drain()
                .map(|(_, entry)| {
                    entry.timer.abort();
                    entry.session
                })
                .collect()
        };
        for session in &sessions {
            let _ = session.begin_release();
            self.tokens.remove(session.token());
        }
        info!(target_id = %self.id, revoked = sessions.len(), "target torn down");
    }
}
