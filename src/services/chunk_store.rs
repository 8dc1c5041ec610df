//! ChunkStore: durable staging for in-flight upload parts.
//!
//! Parts live at `root/{upload_id}/{part_index}.part`. A process-local
//! registry tracks who opened each session, when it was last written, and
//! whether an assembly currently owns it.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::{MapError, MapResult},
    models::upload::{ChunkDeclaration, ChunkReceipt, SessionState, UploadSession},
};

const PART_EXTENSION: &str = "part";
const MAX_UPLOAD_ID_LEN: usize = 128;

type Registry = Arc<Mutex<HashMap<String, UploadSession>>>;

#[derive(Clone)]
pub struct ChunkStore {
    /// Directory holding one sub-directory per session.
    root: PathBuf,

    /// Ceiling on the bytes accepted across all parts of one session.
    max_session_bytes: u64,

    sessions: Registry,
}

/// Exclusive right to assemble one session.
///
/// Dropping the claim hands the session back to `Receiving` unless it has
/// been removed in the meantime.
#[derive(Debug)]
pub struct AssemblyClaim {
    upload_id: String,
    sessions: Registry,
}

impl AssemblyClaim {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }
}

impl Drop for AssemblyClaim {
    fn drop(&mut self) {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get_mut(&self.upload_id) {
            session.state = SessionState::Receiving;
        }
    }
}

/// Server-issued identifier for sessions the client did not name.
pub fn new_upload_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Reject identifiers that could escape the chunk directory.
pub fn ensure_upload_id_safe(upload_id: &str) -> MapResult<()> {
    if upload_id.is_empty() || upload_id.len() > MAX_UPLOAD_ID_LEN {
        return Err(MapError::Validation(format!(
            "upload id must be between 1 and {} characters",
            MAX_UPLOAD_ID_LEN
        )));
    }
    if !upload_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(MapError::Validation(format!(
            "upload id `{}` may only contain letters, digits, `-` and `_`",
            upload_id
        )));
    }
    Ok(())
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>, max_session_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_session_bytes,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    pub fn part_path(&self, upload_id: &str, part_index: u32) -> PathBuf {
        self.session_dir(upload_id)
            .join(format!("{}.{}", part_index, PART_EXTENSION))
    }

    /// Snapshot of a session's registry entry.
    pub fn session(&self, upload_id: &str) -> Option<UploadSession> {
        lock(&self.sessions).get(upload_id).cloned()
    }

    /// Register a write against the session, creating the entry on first use.
    fn open_for_write(&self, upload_id: &str, declared: &ChunkDeclaration) -> MapResult<()> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .entry(upload_id.to_string())
            .or_insert_with(|| UploadSession::new(upload_id));

        if session.state == SessionState::Assembling {
            return Err(MapError::AssemblyInProgress(upload_id.to_string()));
        }
        match (session.owner_id, declared.owner_id) {
            (Some(owner), Some(writer)) if owner != writer => {
                return Err(MapError::Forbidden(format!(
                    "upload `{}` belongs to another user",
                    upload_id
                )));
            }
            (None, writer) => session.owner_id = writer,
            _ => {}
        }
        if declared.filename.is_some() {
            session.filename = declared.filename.clone();
        }
        if declared.file_type.is_some() {
            session.file_type = declared.file_type;
        }
        session.last_activity = Utc::now();
        Ok(())
    }

    fn touch(&self, upload_id: &str) {
        if let Some(session) = lock(&self.sessions).get_mut(upload_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Stream one part to disk.
    ///
    /// The body goes to a temp file first and is renamed into place, so a
    /// rejected or failed write leaves nothing behind and concurrent writes to
    /// the same index resolve to the last one renamed.
    pub async fn write_chunk<S>(
        &self,
        upload_id: &str,
        part_index: u32,
        declared: ChunkDeclaration,
        stream: S,
    ) -> MapResult<ChunkReceipt>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        ensure_upload_id_safe(upload_id)?;
        self.open_for_write(upload_id, &declared)?;

        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;
        }

        let existing = self.session_bytes_excluding(upload_id, part_index).await?;
        let budget = self.max_session_bytes.saturating_sub(existing);

        let tmp_path = dir.join(format!(".tmp-{}-{}", part_index, Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(MapError::Io(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if size_bytes > budget {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                warn!(
                    upload_id,
                    part_index, "rejecting chunk: session would exceed {} bytes", self.max_session_bytes
                );
                return Err(MapError::SizeLimitExceeded {
                    limit: self.max_session_bytes,
                });
            }
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(MapError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(MapError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(MapError::Io(err));
        }
        drop(file);

        let part_path = self.part_path(upload_id, part_index);
        if let Err(err) = fs::rename(&tmp_path, &part_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&part_path).await?;
                fs::rename(&tmp_path, &part_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(MapError::Io(err));
            }
        }
        self.touch(upload_id);

        debug!(upload_id, part_index, size_bytes, "stored chunk");
        Ok(ChunkReceipt {
            upload_id: upload_id.to_string(),
            part_index,
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            total_bytes: existing + size_bytes,
        })
    }

    /// Total size of the parts already on disk, ignoring `skip_index`.
    async fn session_bytes_excluding(&self, upload_id: &str, skip_index: u32) -> MapResult<u64> {
        let mut total = 0;
        for index in self.list_parts(upload_id).await? {
            if index == skip_index {
                continue;
            }
            match fs::metadata(self.part_path(upload_id, index)).await {
                Ok(meta) => total += meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(MapError::Io(err)),
            }
        }
        Ok(total)
    }

    /// Part indices present for a session, in ascending numeric order.
    ///
    /// A session with no directory simply has no parts.
    pub async fn list_parts(&self, upload_id: &str) -> MapResult<Vec<u32>> {
        ensure_upload_id_safe(upload_id)?;
        let mut entries = match fs::read_dir(self.session_dir(upload_id)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(MapError::Io(err)),
        };

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PART_EXTENSION) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                parts.push(index);
            }
        }
        parts.sort_unstable();
        Ok(parts)
    }

    /// Remove a session's directory and registry entry. Idempotent.
    pub async fn remove_session(&self, upload_id: &str) -> MapResult<()> {
        ensure_upload_id_safe(upload_id)?;
        lock(&self.sessions).remove(upload_id);
        match fs::remove_dir_all(self.session_dir(upload_id)).await {
            Ok(()) => {
                debug!(upload_id, "removed upload session");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MapError::Io(err)),
        }
    }

    /// Take the session for assembly. At most one claim exists per upload id.
    pub fn claim(&self, upload_id: &str) -> MapResult<AssemblyClaim> {
        ensure_upload_id_safe(upload_id)?;
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .entry(upload_id.to_string())
            .or_insert_with(|| UploadSession::new(upload_id));
        if session.state == SessionState::Assembling {
            return Err(MapError::AssemblyInProgress(upload_id.to_string()));
        }
        session.state = SessionState::Assembling;
        Ok(AssemblyClaim {
            upload_id: upload_id.to_string(),
            sessions: self.sessions.clone(),
        })
    }

    /// Give up on a claimed session and delete its parts.
    pub async fn discard(&self, claim: AssemblyClaim) -> MapResult<()> {
        let upload_id = claim.upload_id.clone();
        self.remove_session(&upload_id).await?;
        drop(claim);
        Ok(())
    }

    /// Remove sessions idle for longer than `ttl`.
    ///
    /// Sessions without a registry entry (left over from a previous run) are
    /// aged by their directory's modification time. Sessions being assembled
    /// are never touched.
    pub async fn sweep_expired(&self, ttl: Duration) -> MapResult<usize> {
        let cutoff = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(MapError::Io(err)),
        };

        let mut expired = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(upload_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if ensure_upload_id_safe(&upload_id).is_err() || !entry.file_type().await?.is_dir() {
                continue;
            }
            let known = self
                .session(&upload_id)
                .map(|s| (s.state, s.last_activity));
            let last_activity = match known {
                Some((SessionState::Assembling, _)) => continue,
                Some((_, last_activity)) => last_activity,
                None => match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => DateTime::<Utc>::from(modified),
                    Err(err) => {
                        warn!(upload_id = %upload_id, "cannot read session age: {}", err);
                        continue;
                    }
                },
            };
            if last_activity < cutoff {
                expired.push(upload_id);
            }
        }

        // Registry entries whose directory never materialized.
        {
            let mut sessions = lock(&self.sessions);
            sessions.retain(|id, session| {
                session.state == SessionState::Assembling
                    || session.last_activity >= cutoff
                    || expired.contains(id)
            });
        }

        let mut removed = 0;
        for upload_id in expired {
            let Some(claim) = self.claim_expired(&upload_id, cutoff) else {
                debug!(upload_id = %upload_id, "session became active, not expiring");
                continue;
            };
            match self.discard(claim).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(upload_id = %upload_id, "failed to remove expired session: {}", err),
            }
        }
        Ok(removed)
    }

    /// Claim a session the sweep found expired, unless it was claimed or
    /// written to after the sweep looked at it.
    fn claim_expired(&self, upload_id: &str, cutoff: DateTime<Utc>) -> Option<AssemblyClaim> {
        let mut sessions = lock(&self.sessions);
        if let Some(session) = sessions.get_mut(upload_id) {
            if session.state == SessionState::Assembling || session.last_activity >= cutoff {
                return None;
            }
            session.state = SessionState::Assembling;
        } else {
            let mut session = UploadSession::new(upload_id);
            session.state = SessionState::Assembling;
            sessions.insert(upload_id.to_string(), session);
        }
        Some(AssemblyClaim {
            upload_id: upload_id.to_string(),
            sessions: self.sessions.clone(),
        })
    }

    /// Run `sweep_expired` every `interval` until the runtime shuts down.
    pub fn spawn_sweeper(self, ttl: Duration, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_expired(ttl).await {
                    Ok(0) => {}
                    Ok(count) => info!("expired {} abandoned upload sessions", count),
                    Err(err) => warn!("upload session sweep failed: {}", err),
                }
            }
        })
    }
}

fn lock(sessions: &Registry) -> MutexGuard<'_, HashMap<String, UploadSession>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}
