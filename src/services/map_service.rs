//! MapService: orchestrates staged uploads into published, recorded map layers.
//!
//! Workflow for a completed upload group:
//! chunks → assemble → validate (geotiff only) → publish → record.
//! Any failure after assembly removes the files it produced, and a failed
//! record insert unpublishes the layer again.

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    collections::HashSet,
    io::{self, BufWriter, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    assembler::Assembler,
    catalog::CatalogClient,
    chunk_store::{AssemblyClaim, ChunkStore, ensure_upload_id_safe, new_upload_id},
    map_records::MapRecordService,
    raster, shapefile,
};
use crate::{
    auth::Caller,
    errors::{MapError, MapResult},
    models::{
        map_record::{FileType, KNOWN_EXTENSIONS, MapMetadata, MapRecord, StorageReference},
        upload::{AssembledFile, ChunkDeclaration, ChunkReceipt, UploadMember},
    },
};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct MapService {
    pub db: Arc<SqlitePool>,
    pub chunks: ChunkStore,
    pub assembler: Assembler,
    pub catalog: CatalogClient,
    pub records: MapRecordService,

    /// Directory holding published files as `{base}.{ext}`.
    pub upload_dir: PathBuf,
}

/// One part as declared by the client.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_id: Option<String>,
    pub part_index: u32,
    pub filename: Option<String>,
    pub file_type: Option<FileType>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct UnremovedFile {
    pub path: String,
    pub error: String,
}

/// Local files touched while removing a layer.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct DeleteOutcome {
    pub removed_files: Vec<String>,
    pub unremoved_files: Vec<UnremovedFile>,
}

/// A zipped shapefile ready to stream to a client.
#[derive(Debug)]
pub struct ShapefileArchive {
    pub filename: String,
    pub len: u64,
    pub file: fs::File,
}

/// A validated group member: which session, and which extension it becomes.
#[derive(Debug)]
struct PlannedMember {
    upload_id: String,
    extension: &'static str,
}

impl MapService {
    pub fn new(
        db: Arc<SqlitePool>,
        chunks: ChunkStore,
        catalog: CatalogClient,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            records: MapRecordService::new(db.clone()),
            assembler: Assembler::new(chunks.clone()),
            db,
            chunks,
            catalog,
            upload_dir: upload_dir.into(),
        }
    }

    /// Stage one part of an upload, issuing an upload id when none is given.
    pub async fn receive_chunk<S>(
        &self,
        caller: &Caller,
        upload: ChunkUpload,
        stream: S,
    ) -> MapResult<ChunkReceipt>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        if let (Some(filename), Some(file_type)) = (&upload.filename, upload.file_type) {
            member_extension(filename, file_type)?;
        }
        let upload_id = upload.upload_id.unwrap_or_else(new_upload_id);
        let declared = ChunkDeclaration {
            owner_id: Some(caller.user_id),
            filename: upload.filename,
            file_type: upload.file_type,
        };
        self.chunks
            .write_chunk(&upload_id, upload.part_index, declared, stream)
            .await
    }

    /// Drop a staged upload and its parts. Unknown sessions are a no-op.
    pub async fn abandon_upload(&self, caller: &Caller, upload_id: &str) -> MapResult<()> {
        ensure_upload_id_safe(upload_id)?;
        if let Some(owner) = self.chunks.session(upload_id).and_then(|s| s.owner_id) {
            if !caller.can_manage(owner) {
                return Err(MapError::Forbidden(format!(
                    "upload `{}` belongs to another user",
                    upload_id
                )));
            }
        }
        let claim = self.chunks.claim(upload_id)?;
        self.chunks.discard(claim).await?;
        info!(upload_id, user_id = caller.user_id, "abandoned upload");
        Ok(())
    }

    /// Turn a group of staged uploads into a published, recorded layer.
    pub async fn complete_upload(
        &self,
        caller: &Caller,
        metadata: MapMetadata,
        members: Vec<UploadMember>,
    ) -> MapResult<MapRecord> {
        metadata.validate()?;
        let plan = self.plan_group(caller, metadata.file_type, &members)?;

        let mut claims = Vec::with_capacity(plan.len());
        for member in &plan {
            claims.push(self.chunks.claim(&member.upload_id)?);
        }

        let base = Uuid::new_v4().simple().to_string();
        let assembled = self.assemble_group(&base, &plan, claims).await?;
        let primary = self
            .upload_dir
            .join(format!("{}.{}", base, metadata.file_type.primary_extension()));
        info!(
            base = %base,
            files = assembled.len(),
            file_type = %metadata.file_type,
            "assembled upload group"
        );

        match self.publish_and_record(caller, &metadata, &primary).await {
            Ok(record) => {
                info!(
                    id = record.id,
                    layer = %record.layer_name,
                    user_id = caller.user_id,
                    "map layer published"
                );
                Ok(record)
            }
            Err(err) => {
                let outcome = remove_siblings(&primary).await;
                debug!(
                    removed = outcome.removed_files.len(),
                    "cleaned up after failed publish"
                );
                Err(err)
            }
        }
    }

    /// Check a completion request against the group rules before touching any
    /// session.
    fn plan_group(
        &self,
        caller: &Caller,
        file_type: FileType,
        members: &[UploadMember],
    ) -> MapResult<Vec<PlannedMember>> {
        if members.is_empty() {
            return Err(MapError::Validation("at least one upload is required".into()));
        }

        let mut seen_ids = HashSet::new();
        let mut plan = Vec::with_capacity(members.len());
        for member in members {
            ensure_upload_id_safe(&member.upload_id)?;
            if !seen_ids.insert(member.upload_id.as_str()) {
                return Err(MapError::Validation(format!(
                    "upload `{}` is listed more than once",
                    member.upload_id
                )));
            }

            let session = self.chunks.session(&member.upload_id);
            if let Some(owner) = session.as_ref().and_then(|s| s.owner_id) {
                if !caller.can_manage(owner) {
                    return Err(MapError::Forbidden(format!(
                        "upload `{}` belongs to another user",
                        member.upload_id
                    )));
                }
            }
            if let Some(declared) = session.as_ref().and_then(|s| s.file_type) {
                if declared != file_type {
                    return Err(MapError::Validation(format!(
                        "upload `{}` was staged as {}, not {}",
                        member.upload_id, declared, file_type
                    )));
                }
            }
            let filename = member
                .filename
                .clone()
                .or_else(|| session.and_then(|s| s.filename))
                .ok_or_else(|| {
                    MapError::Validation(format!(
                        "filename for upload `{}` is unknown",
                        member.upload_id
                    ))
                })?;

            plan.push(PlannedMember {
                upload_id: member.upload_id.clone(),
                extension: member_extension(&filename, file_type)?,
            });
        }

        match file_type {
            FileType::Geotiff if plan.len() != 1 => Err(MapError::Validation(
                "a geotiff upload consists of exactly one file".into(),
            )),
            FileType::Geotiff => Ok(plan),
            FileType::Shapefile => {
                let mut extensions = HashSet::new();
                for member in &plan {
                    if !extensions.insert(member.extension) {
                        return Err(MapError::Validation(format!(
                            "shapefile group contains more than one .{} file",
                            member.extension
                        )));
                    }
                }
                if !extensions.contains("shp") {
                    return Err(MapError::Validation(
                        "shapefile group must contain a .shp file".into(),
                    ));
                }
                Ok(plan)
            }
        }
    }

    /// Assemble every member under `base`. If one fails, outputs already
    /// written are deleted and the remaining sessions are discarded.
    async fn assemble_group(
        &self,
        base: &str,
        plan: &[PlannedMember],
        claims: Vec<AssemblyClaim>,
    ) -> MapResult<Vec<AssembledFile>> {
        let mut assembled: Vec<AssembledFile> = Vec::with_capacity(plan.len());
        let mut pending = plan.iter().zip(claims);

        while let Some((member, claim)) = pending.next() {
            let target = self
                .upload_dir
                .join(format!("{}.{}", base, member.extension));
            match self.assembler.assemble(claim, &target).await {
                Ok(file) => assembled.push(file),
                Err(err) => {
                    for file in &assembled {
                        if let Err(rm_err) = fs::remove_file(&file.path).await {
                            warn!("failed to remove {}: {}", file.path.display(), rm_err);
                        }
                    }
                    for (rest, claim) in pending.by_ref() {
                        if let Err(rm_err) = self.chunks.discard(claim).await {
                            warn!(upload_id = %rest.upload_id, "failed to discard session: {}", rm_err);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(assembled)
    }

    async fn publish_and_record(
        &self,
        caller: &Caller,
        metadata: &MapMetadata,
        primary: &Path,
    ) -> MapResult<MapRecord> {
        if metadata.file_type == FileType::Geotiff {
            let info = raster::validate(primary).await?;
            debug!(width = info.width, height = info.height, "raster validated");
        }

        let layer = self.catalog.publish(primary, metadata.file_type).await?;
        let storage = StorageReference {
            file_path: primary.display().to_string(),
            layer_name: layer.layer_name.clone(),
        };

        match self.records.create(caller.user_id, metadata, &storage).await {
            Ok(record) => Ok(record),
            Err(err) => {
                warn!(layer = %layer.layer_name, "recording map failed, unpublishing: {}", err);
                if let Err(unpub_err) = self
                    .catalog
                    .unpublish(&layer.layer_name, metadata.file_type)
                    .await
                {
                    warn!(layer = %layer.layer_name, "unpublish after failed insert failed: {}", unpub_err);
                }
                Err(err)
            }
        }
    }

    /// Maps visible to the caller. Superusers see everything.
    pub async fn list_maps(
        &self,
        caller: &Caller,
        skip: Option<i64>,
        limit: Option<i64>,
    ) -> MapResult<Vec<MapRecord>> {
        let owner = (!caller.is_superuser).then_some(caller.user_id);
        self.records.list(owner, skip, limit).await
    }

    /// Delete a record, unpublish its layer and remove its files.
    ///
    /// The row delete is staged in a transaction that only commits once the
    /// catalog has dropped the layer. Nothing is changed when the caller may
    /// not manage the record, the row cannot be deleted, or the catalog
    /// refuses. Files are removed after the commit; failures there are
    /// reported in the outcome.
    pub async fn delete_map(&self, caller: &Caller, id: i64) -> MapResult<DeleteOutcome> {
        let record = self.records.get(id).await?;
        if !caller.can_manage(record.created_by) {
            return Err(MapError::Forbidden(format!(
                "map `{}` belongs to another user",
                id
            )));
        }

        let tx = self.records.begin_delete(id).await?;
        if let Err(err) = self
            .catalog
            .unpublish(&record.layer_name, record.file_type)
            .await
        {
            if let Err(rb_err) = tx.rollback().await {
                warn!(id, "rollback after failed unpublish failed: {}", rb_err);
            }
            return Err(err.into());
        }
        tx.commit().await?;
        let outcome = remove_siblings(Path::new(&record.file_path)).await;

        if outcome.unremoved_files.is_empty() {
            info!(id, layer = %record.layer_name, "map deleted");
        } else {
            warn!(
                id,
                unremoved = outcome.unremoved_files.len(),
                "map deleted but some files could not be removed"
            );
        }
        Ok(outcome)
    }

    /// Zip a visible shapefile record into a scratch file opened for reading.
    pub async fn shapefile_archive(&self, caller: &Caller, id: i64) -> MapResult<ShapefileArchive> {
        let not_found = || MapError::NotFound(format!("shapefile `{}` not found", id));

        let record = self.records.get(id).await?;
        if !(record.is_public || caller.can_manage(record.created_by)) {
            return Err(not_found());
        }
        if record.file_type != FileType::Shapefile {
            return Err(not_found());
        }

        let shp = PathBuf::from(&record.file_path);
        match fs::metadata(&shp).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(not_found()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(MapError::Io(err)),
        }

        let base = shp
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("layer")
            .to_string();
        let scratch = self
            .upload_dir
            .join(format!(".{}.zip.tmp", Uuid::new_v4().simple()));

        let target = scratch.clone();
        let stem = base.clone();
        let bundled = tokio::task::spawn_blocking(move || -> MapResult<usize> {
            let out = BufWriter::new(std::fs::File::create(&target)?);
            let (out, entries) = shapefile::bundle(&shp, &stem, out)?;
            out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(entries)
        })
        .await
        .map_err(MapError::from)
        .and_then(|res| res);

        let opened = match bundled {
            Ok(entries) => {
                debug!(id, entries, "built shapefile archive");
                open_for_streaming(&scratch).await
            }
            Err(err) => Err(err),
        };
        // unlinked once open; the descriptor keeps the data readable
        if let Err(err) = fs::remove_file(&scratch).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to remove {}: {}", scratch.display(), err);
            }
        }
        let (file, len) = opened?;

        Ok(ShapefileArchive {
            filename: format!("{}.zip", base),
            len,
            file,
        })
    }
}

async fn open_for_streaming(path: &Path) -> MapResult<(fs::File, u64)> {
    let file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    Ok((file, len))
}

/// Normalized extension of a member's filename, checked against the type.
/// Geotiff members always become `.tif`.
fn member_extension(filename: &str, file_type: FileType) -> MapResult<&'static str> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !file_type.accepts_extension(&ext) {
        return Err(MapError::Validation(format!(
            "`{}` is not a valid {} file",
            filename, file_type
        )));
    }
    Ok(match ext.as_str() {
        "tif" | "tiff" => "tif",
        "shp" => "shp",
        "shx" => "shx",
        "dbf" => "dbf",
        _ => "prj",
    })
}

/// Remove every `{base}.{ext}` beside `primary` for the known extensions.
async fn remove_siblings(primary: &Path) -> DeleteOutcome {
    let mut outcome = DeleteOutcome::default();
    for ext in KNOWN_EXTENSIONS {
        let path = primary.with_extension(ext);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed {}", path.display());
                outcome.removed_files.push(path.display().to_string());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!("failed to remove {}: {}", path.display(), err);
                outcome.unremoved_files.push(UnremovedFile {
                    path: path.display().to_string(),
                    error: err.to_string(),
                });
            }
        }
    }
    outcome
}
