//! Reconstructs a staged upload into one file.

use std::{
    io::ErrorKind,
    path::Path,
};
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufReader, BufWriter},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chunk_store::{AssemblyClaim, ChunkStore};
use crate::{
    errors::{MapError, MapResult},
    models::upload::AssembledFile,
};

/// Read/write buffer used while concatenating parts (1 MiB).
pub const COPY_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct Assembler {
    chunks: ChunkStore,
}

impl Assembler {
    pub fn new(chunks: ChunkStore) -> Self {
        Self { chunks }
    }

    /// Concatenate the claimed session's parts into `target` in index order.
    ///
    /// The session is removed whether or not assembly succeeds. On failure
    /// no output is left at `target` or beside it.
    pub async fn assemble(&self, claim: AssemblyClaim, target: &Path) -> MapResult<AssembledFile> {
        let upload_id = claim.upload_id().to_string();
        let result = self.concatenate(&upload_id, target).await;

        if let Err(err) = self.chunks.discard(claim).await {
            warn!(upload_id = %upload_id, "failed to remove upload session after assembly: {}", err);
        }

        match &result {
            Ok(file) => info!(
                upload_id = %upload_id,
                path = %file.path.display(),
                size_bytes = file.size_bytes,
                "assembled upload"
            ),
            Err(err) => warn!(upload_id = %upload_id, "assembly failed: {}", err),
        }
        result
    }

    async fn concatenate(&self, upload_id: &str, target: &Path) -> MapResult<AssembledFile> {
        let parts = self.chunks.list_parts(upload_id).await?;
        let missing = missing_indices(&parts);
        if parts.is_empty() || !missing.is_empty() {
            return Err(MapError::MissingChunks {
                upload_id: upload_id.to_string(),
                missing,
            });
        }

        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            MapError::Io(std::io::Error::other("assembly target missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".assemble-{}", Uuid::new_v4()));

        let size_bytes = match self.copy_parts(upload_id, &parts, &tmp_path).await {
            Ok(size) => size,
            Err(err) => {
                remove_if_present(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, target).await {
            remove_if_present(&tmp_path).await;
            return Err(MapError::Io(err));
        }

        Ok(AssembledFile {
            path: target.to_path_buf(),
            size_bytes,
        })
    }

    async fn copy_parts(&self, upload_id: &str, parts: &[u32], out: &Path) -> MapResult<u64> {
        let file = File::create(out).await?;
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_BYTES, file);
        let mut total = 0;
        for &index in parts {
            let part = File::open(self.chunks.part_path(upload_id, index)).await?;
            let mut reader = BufReader::with_capacity(COPY_BUFFER_BYTES, part);
            total += tokio::io::copy_buf(&mut reader, &mut writer).await?;
        }
        writer.flush().await?;
        writer.get_mut().sync_all().await?;
        debug!(upload_id, parts = parts.len(), total, "concatenated parts");
        Ok(total)
    }
}

/// Indices absent from `0..=max(parts)`. `parts` must be sorted.
pub fn missing_indices(parts: &[u32]) -> Vec<u32> {
    let Some(&max) = parts.last() else {
        return Vec::new();
    };
    let mut present = parts.iter().peekable();
    let mut missing = Vec::new();
    for index in 0..=max {
        if present.peek() == Some(&&index) {
            while present.peek() == Some(&&index) {
                present.next();
            }
        } else {
            missing.push(index);
        }
    }
    missing
}

async fn remove_if_present(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}
