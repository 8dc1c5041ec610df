//! Represents in-flight upload sessions, their parts, and assembled output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::map_record::FileType;

/// Lifecycle of a staged upload.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Receiving,
    Assembling,
}

/// Registry entry for one logical file being uploaded in parts.
#[derive(Serialize, Clone, Debug)]
pub struct UploadSession {
    /// Identifier that also names the chunk directory.
    pub upload_id: String,

    /// User who wrote the first chunk, if known.
    pub owner_id: Option<i64>,

    /// Original client filename, used when completion omits it.
    pub filename: Option<String>,

    pub file_type: Option<FileType>,

    pub state: SessionState,

    pub created_at: DateTime<Utc>,

    /// Last chunk write; expiry is measured from here.
    pub last_activity: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.into(),
            owner_id: None,
            filename: None,
            file_type: None,
            state: SessionState::Receiving,
            created_at: now,
            last_activity: now,
        }
    }
}

/// What the client declared alongside a chunk.
#[derive(Clone, Debug, Default)]
pub struct ChunkDeclaration {
    pub owner_id: Option<i64>,
    pub filename: Option<String>,
    pub file_type: Option<FileType>,
}

/// Acknowledgement returned for one stored part.
#[derive(Serialize, Clone, Debug)]
pub struct ChunkReceipt {
    pub upload_id: String,
    pub part_index: u32,
    pub size_bytes: u64,
    /// MD5 of the part, hex encoded.
    pub etag: String,
    /// Bytes accepted for the whole session so far.
    pub total_bytes: u64,
}

/// A file reconstructed from its parts.
#[derive(Clone, Debug)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// One session inside a completion request.
#[derive(Deserialize, Clone, Debug)]
pub struct UploadMember {
    pub upload_id: String,
    /// Client filename; defaults to the one declared with the chunks.
    #[serde(default)]
    pub filename: Option<String>,
}
