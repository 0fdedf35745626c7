//! Request orchestration: the handlers behind every endpoint, wired over
//! the scheduling core, the record store and the blob store.
//!
//! Lock order inside one request is session, then stream, then (briefly)
//! target. Store I/O happens under the session lock only, which is what
//! serialises frame, checkpoint, stop and expiration on one lease.

use crate::SessionError;
use crate::auth::{Authenticator, Principal};
use crate::codec::{decode_base64, decode_payload};
use chrono::Utc;
use scv_core::{
    ActiveStream, CommitPlan, CoreError, DEFAULT_EXPIRATION_SECONDS, DEFAULT_MAX_STREAM_FAILS,
    LeaseObserver, Release, SessionSnapshot, Stream, StreamCounters, StreamStatus, TargetConfig,
    TargetManager, TokenEntry,
};
use scv_store::{
    BlobAddress, BlobStore, LeaseOutcome, LeaseStats, RecordStore, SeedKind, StoreError,
    StreamInfo, StreamRecord, validate_name,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub expiration: Duration,
    /// Failed stops after which a stream is disabled.
    pub max_stream_fails: u32,
    /// Shared secret workers present to activate a stream.
    pub activation_password: String,
}

impl SessionConfig {
    pub fn new(activation_password: impl Into<String>) -> Self {
        Self {
            expiration: Duration::from_secs(DEFAULT_EXPIRATION_SECONDS),
            max_stream_fails: DEFAULT_MAX_STREAM_FAILS,
            activation_password: activation_password.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStreamRequest {
    pub target_id: String,
    /// name → base64 content
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStreamResponse {
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub target_id: String,
    pub engine: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRequest {
    /// name → payload, encoded as the name's suffix says
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Progress made since the previous checkpoint.
    #[serde(default)]
    pub frames: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    pub frame_version: u64,
    pub checkpoint_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopRequest {
    /// Empty on a clean stop.
    #[serde(default)]
    pub error: String,
}

/// Cached `Stream`s keyed by id.
#[derive(Debug, Default)]
struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    fn get(&self, stream_id: &str) -> Option<Arc<Stream>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned()
    }

    fn insert_if_absent(&self, stream: Arc<Stream>) -> bool {
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(stream.id()) {
            return false;
        }
        streams.insert(stream.id().to_string(), stream);
        true
    }

    fn remove(&self, stream_id: &str) {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
    }
}

/// Finishes an expired lease on the session side: the stream forgets the
/// session and the lease is logged like any other.
struct ExpiryRecorder {
    streams: Arc<StreamRegistry>,
    records: Arc<dyn RecordStore>,
}

impl LeaseObserver for ExpiryRecorder {
    fn lease_expired(&self, target_id: &str, stream_id: &str, snapshot: &SessionSnapshot) {
        if let Some(stream) = self.streams.get(stream_id) {
            stream.detach(&snapshot.token);
        }
        let stats = lease_stats(target_id, stream_id, snapshot, LeaseOutcome::Expired, None);
        if let Err(err) = self.records.append_stats(&stats) {
            warn!(target_id, stream_id, error = %err, "failed to record expired lease");
        }
    }
}

fn lease_stats(
    target_id: &str,
    stream_id: &str,
    snapshot: &SessionSnapshot,
    outcome: LeaseOutcome,
    error: Option<String>,
) -> LeaseStats {
    LeaseStats {
        stream_id: stream_id.to_string(),
        target_id: target_id.to_string(),
        user: snapshot.user.clone(),
        engine: snapshot.engine.clone(),
        frames: snapshot.donor_progress,
        start_time: snapshot.start_time.timestamp(),
        end_time: Utc::now().timestamp(),
        outcome,
        error,
    }
}

fn counters_of(record: &StreamRecord) -> StreamCounters {
    StreamCounters {
        status: record.status,
        committed_frames: record.frames,
        checkpoint_version: record.checkpoints,
        error_count: record.error_count,
    }
}

fn frame_digest(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, payload) in files {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(payload.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

fn decode_files(files: &BTreeMap<String, String>) -> Result<Vec<(String, Vec<u8>)>, SessionError> {
    files
        .iter()
        .map(|(name, payload)| {
            let (stored, bytes) = decode_payload(name, payload)?;
            validate_name(&stored).map_err(|e| SessionError::InvalidPayload(e.to_string()))?;
            Ok((stored, bytes))
        })
        .collect()
}

pub struct SessionService {
    config: SessionConfig,
    manager: TargetManager,
    streams: Arc<StreamRegistry>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    auth: Arc<dyn Authenticator>,
}

impl fmt::Debug for SessionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionService")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SessionService {
    /// Lease expiration timers run on `runtime`.
    pub fn new(
        config: SessionConfig,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        auth: Arc<dyn Authenticator>,
        runtime: Handle,
    ) -> Self {
        let streams = Arc::new(StreamRegistry::default());
        let observer = Arc::new(ExpiryRecorder {
            streams: streams.clone(),
            records: records.clone(),
        });
        let manager = TargetManager::new(
            TargetConfig {
                expiration: config.expiration,
            },
            runtime,
        )
        .with_observer(observer);
        Self {
            config,
            manager,
            streams,
            records,
            blobs,
            auth,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn manager(&self) -> &TargetManager {
        &self.manager
    }

    /// Rebuild the cache and the queues from the record store. Enabled
    /// streams are queued at minus their committed frames, the same
    /// priority a live re-queue gives them, so streams that have advanced
    /// less are leased first. Returns how many were queued.
    pub fn hydrate(&self) -> Result<usize, SessionError> {
        let mut queued = 0;
        for record in self.records.records()? {
            let stream = Stream::restore(&record.id, &record.target_id, counters_of(&record));
            if !self.streams.insert_if_absent(Arc::new(stream)) {
                continue;
            }
            let target = self.manager.get_or_create_target(&record.target_id);
            if !record.is_enabled() {
                continue;
            }
            match target.add_stream(&record.id, -(record.frames as f64)) {
                Ok(()) => queued += 1,
                Err(CoreError::DuplicateStream(id)) => {
                    debug!(stream_id = %id, "stream already queued");
                }
                Err(err) => return Err(err.into()),
            }
        }
        info!(queued, targets = self.manager.target_ids().len(), "streams hydrated");
        Ok(queued)
    }

    /// Tear down every target, revoking all outstanding leases.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    fn require_manager(&self, credential: Option<&str>) -> Result<Principal, SessionError> {
        let principal = credential
            .and_then(|credential| self.auth.authenticate(credential))
            .ok_or_else(|| SessionError::Unauthorized("unknown credential".to_string()))?;
        if !principal.manager {
            return Err(SessionError::Unauthorized(format!(
                "{} is not a manager",
                principal.user
            )));
        }
        Ok(principal)
    }

    fn resolve(&self, token: &str) -> Result<(TokenEntry, Arc<Stream>), SessionError> {
        let entry = self.manager.find_lease(token)?;
        let stream = self
            .streams
            .get(&entry.stream_id)
            .ok_or_else(|| CoreError::StreamNotFound(entry.stream_id.clone()))?;
        Ok((entry, stream))
    }

    /// Register a new stream: seed blobs, then its record, then its place
    /// in the target's queue at priority 0. A failure at any step removes
    /// what the earlier steps wrote.
    pub fn create_stream(
        &self,
        credential: Option<&str>,
        request: CreateStreamRequest,
    ) -> Result<CreateStreamResponse, SessionError> {
        let principal = self.require_manager(credential)?;
        if request.target_id.is_empty() {
            return Err(SessionError::InvalidPayload("missing target_id".to_string()));
        }

        let mut seeds = Vec::new();
        for (kind, files) in [
            (SeedKind::Files, &request.files),
            (SeedKind::Tags, &request.tags),
        ] {
            for (name, payload) in files {
                validate_name(name).map_err(|e| SessionError::InvalidPayload(e.to_string()))?;
                seeds.push((kind, name.as_str(), decode_base64(name, payload)?));
            }
        }

        let stream_id = Uuid::new_v4().to_string();
        let persisted = seeds
            .iter()
            .try_for_each(|(kind, name, bytes)| {
                self.blobs.write_seed(&stream_id, *kind, name, bytes)
            })
            .and_then(|()| {
                self.records
                    .insert(StreamRecord::new(&stream_id, &request.target_id, Utc::now()))
            });
        if let Err(err) = persisted {
            warn!(stream_id = %stream_id, error = %err, "stream creation rolled back");
            if let Err(cleanup) = self.blobs.remove_stream(&stream_id) {
                warn!(stream_id = %stream_id, error = %cleanup, "seed cleanup failed");
            }
            return Err(err.into());
        }

        let stream = Stream::new(&stream_id, &request.target_id);
        self.streams.insert_if_absent(Arc::new(stream));
        if let Err(err) = self
            .manager
            .add_stream_to_target(&request.target_id, &stream_id, 0.0)
        {
            warn!(stream_id = %stream_id, error = %err, "stream creation rolled back");
            self.streams.remove(&stream_id);
            if let Err(cleanup) = self.records.remove(&stream_id) {
                warn!(stream_id = %stream_id, error = %cleanup, "record cleanup failed");
            }
            if let Err(cleanup) = self.blobs.remove_stream(&stream_id) {
                warn!(stream_id = %stream_id, error = %cleanup, "seed cleanup failed");
            }
            return Err(err.into());
        }
        info!(
            stream_id = %stream_id,
            target_id = %request.target_id,
            manager = %principal.user,
            "stream created"
        );
        Ok(CreateStreamResponse { stream_id })
    }

    /// Lease the best eligible stream of a target. Disabled streams popped
    /// on the way are retired from the target for good.
    pub fn activate(
        &self,
        credential: Option<&str>,
        request: ActivateRequest,
    ) -> Result<ActivateResponse, SessionError> {
        if credential != Some(self.config.activation_password.as_str()) {
            return Err(SessionError::Unauthorized(
                "bad activation password".to_string(),
            ));
        }
        let target = self
            .manager
            .target(&request.target_id)
            .ok_or_else(|| SessionError::TargetNotFound(request.target_id.clone()))?;

        loop {
            let lease = target.activate_stream(&request.user, &request.engine)?;
            let stream_id = lease.stream_id.as_str();
            let Some(stream) = self.streams.get(stream_id) else {
                warn!(target_id = %request.target_id, stream_id, "queued stream has no record");
                target.retire_stream(stream_id)?;
                continue;
            };
            if stream.attach(lease.session.clone()).is_err() {
                debug!(target_id = %request.target_id, stream_id, "skipping disabled stream");
                target.retire_stream(stream_id)?;
                continue;
            }
            // frames buffered under an earlier lease were never committed
            if let Err(err) = self.blobs.clear_buffer(stream_id) {
                stream.detach(&lease.token);
                target.deactivate_stream(stream_id)?;
                return Err(err.into());
            }
            return Ok(ActivateResponse { token: lease.token });
        }
    }

    pub fn start(&self, token: &str) -> Result<StartResponse, SessionError> {
        let entry = self.manager.find_lease(token)?;
        Ok(StartResponse {
            stream_id: entry.stream_id,
        })
    }

    /// Append one frame to the lease's buffer.
    pub fn post_frame(&self, token: &str, request: FrameRequest) -> Result<(), SessionError> {
        let (entry, _) = self.resolve(token)?;
        if request.files.is_empty() {
            return Err(SessionError::InvalidPayload(
                "frame carries no files".to_string(),
            ));
        }
        let files = decode_files(&request.files)?;
        let digest = frame_digest(&request.files);

        let mut session = entry.session.lock()?;
        if session.last_frame_digest.as_deref() == Some(digest.as_str()) {
            return Err(SessionError::DuplicateFrame);
        }
        self.append_frame(&entry.stream_id, &files)?;
        session.buffered_frames += 1;
        session.last_frame_digest = Some(digest);
        debug!(
            stream_id = %entry.stream_id,
            buffered_frames = session.buffered_frames,
            "frame buffered"
        );
        Ok(())
    }

    /// Append every file of one frame, or none: on failure each buffer
    /// file is cut back to the length it had before.
    fn append_frame(
        &self,
        stream_id: &str,
        files: &[(String, Vec<u8>)],
    ) -> Result<(), SessionError> {
        let mut appended: Vec<(&str, u64)> = Vec::with_capacity(files.len());
        let mut written = Ok(());
        for (name, bytes) in files {
            let len = match self.blobs.buffer_len(stream_id, name) {
                Ok(len) => len,
                Err(err) => {
                    written = Err(err);
                    break;
                }
            };
            appended.push((name.as_str(), len));
            if let Err(err) = self.blobs.append_buffer(stream_id, name, bytes) {
                written = Err(err);
                break;
            }
        }
        let Err(err) = written else {
            return Ok(());
        };

        warn!(stream_id, error = %err, "frame append rolled back");
        for (name, len) in appended {
            if let Err(cleanup) = self.blobs.truncate_buffer(stream_id, name, len) {
                warn!(stream_id, file = name, error = %cleanup, "buffer rollback failed");
            }
        }
        Err(err.into())
    }

    /// Commit the buffer and a checkpoint. Nothing in memory moves unless
    /// the blobs and the record were all written.
    pub fn post_checkpoint(
        &self,
        token: &str,
        request: CheckpointRequest,
    ) -> Result<CheckpointResponse, SessionError> {
        let (entry, stream) = self.resolve(token)?;
        if !request.frames.is_finite() || request.frames < 0.0 {
            return Err(SessionError::InvalidPayload(format!(
                "frames must be a non-negative number, got {}",
                request.frames
            )));
        }
        let files = decode_files(&request.files)?;
        let stream_id = entry.stream_id.as_str();

        let mut session = entry.session.lock()?;
        let plan = stream.plan_commit(session.buffered_frames);
        self.persist_commit(stream_id, &entry.session, &plan, &files)?;

        stream.apply_commit(&plan);
        session.donor_progress += request.frames;
        session.committed_frames += plan.frames_added;
        session.buffered_frames = 0;
        info!(
            stream_id,
            frame_version = plan.frame_version,
            checkpoint_version = plan.checkpoint_version,
            donor_progress = session.donor_progress,
            "checkpoint committed"
        );
        Ok(CheckpointResponse {
            frame_version: plan.frame_version,
            checkpoint_version: plan.checkpoint_version,
        })
    }

    fn persist_commit(
        &self,
        stream_id: &str,
        session: &ActiveStream,
        plan: &CommitPlan,
        files: &[(String, Vec<u8>)],
    ) -> Result<(), SessionError> {
        let with_frames = plan.frames_added > 0;
        if with_frames {
            self.blobs.commit_frames(stream_id, plan.frame_version)?;
        }
        let written = self
            .blobs
            .write_checkpoint(stream_id, plan.frame_version, plan.checkpoint_version, files)
            .and_then(|()| {
                let now = Utc::now();
                self.records
                    .update(stream_id, &mut |record| {
                        record.frames = plan.frame_version;
                        record.checkpoints = plan.checkpoint_version;
                        record.last_user = Some(session.user().to_string());
                        record.last_engine = Some(session.engine().to_string());
                        record.last_commit = Some(now);
                    })
                    .map(|_| ())
            });
        let Err(err) = written else {
            return Ok(());
        };

        warn!(
            stream_id,
            frame_version = plan.frame_version,
            checkpoint_version = plan.checkpoint_version,
            error = %err,
            "checkpoint rolled back"
        );
        // a slot left behind by a failed write was already removed by the store
        if !matches!(err, StoreError::SlotExists(_)) {
            let _ = self.blobs.discard_checkpoint(
                stream_id,
                plan.frame_version,
                plan.checkpoint_version,
            );
        }
        if with_frames {
            if let Err(cleanup) = self.blobs.uncommit_frames(stream_id, plan.frame_version) {
                warn!(stream_id, error = %cleanup, "buffered frames not restored");
            }
        }
        Err(err.into())
    }

    /// Release the lease. A non-empty `error` counts as a failure; the
    /// failure that reaches the limit disables the stream instead of
    /// re-queueing it.
    pub fn stop(&self, token: &str, request: StopRequest) -> Result<(), SessionError> {
        let (entry, stream) = self.resolve(token)?;
        let target = self
            .manager
            .target(&entry.target_id)
            .ok_or_else(|| SessionError::TargetNotFound(entry.target_id.clone()))?;
        let stream_id = entry.stream_id.as_str();

        let snapshot = entry.session.begin_release()?;
        stream.detach(token);

        let failed = !request.error.is_empty();
        let (release, outcome, persisted) = if failed {
            let failure = stream.record_failure(self.config.max_stream_fails);
            let persisted = self
                .records
                .update(stream_id, &mut |record| {
                    record.error_count = failure.error_count;
                    if failure.disabled {
                        record.status = StreamStatus::Disabled;
                    }
                })
                .map(|_| ());
            if failure.disabled {
                warn!(
                    stream_id,
                    error_count = failure.error_count,
                    "stream disabled after repeated failures"
                );
                (Release::Retire, LeaseOutcome::Disabled, persisted)
            } else {
                (Release::Requeue, LeaseOutcome::Failed, persisted)
            }
        } else {
            (Release::Requeue, LeaseOutcome::Stopped, Ok(()))
        };

        target.complete_release(stream_id, &snapshot, release)?;
        let error = failed.then(|| request.error.clone());
        self.records.append_stats(&lease_stats(
            &entry.target_id,
            stream_id,
            &snapshot,
            outcome,
            error,
        ))?;
        if let Err(err) = persisted {
            warn!(stream_id, error = %err, "failure count not persisted");
            return Err(err.into());
        }
        info!(
            stream_id,
            user = %snapshot.user,
            engine = %snapshot.engine,
            ?outcome,
            "lease stopped"
        );
        Ok(())
    }

    /// Bytes at `path` below the stream, see `BlobAddress::parse`.
    pub fn download(
        &self,
        credential: Option<&str>,
        stream_id: &str,
        path: &str,
    ) -> Result<Vec<u8>, SessionError> {
        self.require_manager(credential)?;
        if self.records.find(stream_id)?.is_none() {
            return Err(CoreError::StreamNotFound(stream_id.to_string()).into());
        }
        let address = BlobAddress::parse(path)?;
        Ok(self.blobs.read(stream_id, &address)?)
    }

    pub fn stream_info(&self, stream_id: &str) -> Result<StreamInfo, SessionError> {
        let record = self
            .records
            .find(stream_id)?
            .ok_or_else(|| CoreError::StreamNotFound(stream_id.to_string()))?;
        let active = self
            .streams
            .get(stream_id)
            .is_some_and(|stream| stream.active().is_some());
        Ok(record.info(active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_depends_on_names_and_payloads() {
        let files = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let a = frame_digest(&files(&[("frames.xtc", "A")]));
        assert_eq!(a, frame_digest(&files(&[("frames.xtc", "A")])));
        assert_ne!(a, frame_digest(&files(&[("frames.xtc", "B")])));
        assert_ne!(a, frame_digest(&files(&[("log.txt", "A")])));
        // boundaries between name and payload are unambiguous
        assert_ne!(
            frame_digest(&files(&[("ab", "c")])),
            frame_digest(&files(&[("a", "bc")]))
        );
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn counters_follow_the_record() {
        let mut record = StreamRecord::new("s-1", "t-1", Utc::now());
        record.frames = 7;
        record.checkpoints = 2;
        record.error_count = 3;
        record.status = StreamStatus::Disabled;
        assert_eq!(
            counters_of(&record),
            StreamCounters {
                status: StreamStatus::Disabled,
                committed_frames: 7,
                checkpoint_version: 2,
                error_count: 3,
            }
        );
    }

    #[test]
    fn stop_request_defaults_to_clean() {
        let request: StopRequest = serde_json::from_str("{}").expect("parse");
        assert!(request.error.is_empty());
    }
}
