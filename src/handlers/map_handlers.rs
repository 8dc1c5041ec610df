//! HTTP handlers for map uploads, listing, deletion and shapefile download.
//! Upload bodies are streamed straight into the chunk store; nothing is
//! buffered whole in memory.

use crate::{
    auth::Caller,
    errors::{AppError, MapError, MapResult},
    models::{
        map_record::{FileType, MapMetadata, MapRecord},
        upload::{ChunkReceipt, UploadMember},
    },
    services::{
        chunk_store::new_upload_id,
        map_service::{ChunkUpload, DeleteOutcome, MapService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, Query, State,
        multipart::{Field, MultipartError},
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const DOWNLOAD_BUFFER_BYTES: usize = 1 << 20;

/// Body of `POST /api/v1/maps/complete`.
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub file_type: String,
    #[serde(default)]
    pub is_public: bool,
    pub uploads: Vec<UploadMember>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    #[serde(flatten)]
    pub outcome: DeleteOutcome,
}

/// Text fields of the single-shot upload form.
#[derive(Debug, Default)]
struct MetadataForm {
    name: Option<String>,
    description: Option<String>,
    file_type: Option<String>,
    is_public: Option<String>,
}

impl MetadataForm {
    fn into_metadata(self) -> MapResult<MapMetadata> {
        let name = self
            .name
            .ok_or_else(|| MapError::Validation("missing `name` field".into()))?;
        let file_type = self
            .file_type
            .ok_or_else(|| MapError::Validation("missing `file_type` field".into()))?
            .parse::<FileType>()?;
        let is_public = match self.is_public {
            Some(raw) => parse_bool(&raw)?,
            None => false,
        };
        let metadata = MapMetadata {
            name,
            description: self.description.filter(|d| !d.trim().is_empty()),
            file_type,
            is_public,
        };
        metadata.validate()?;
        Ok(metadata)
    }
}

/// POST `/api/v1/maps/chunks` — store one part of a large upload.
///
/// `part_index`, `filename` and `file_type` must precede the binary `chunk`
/// field. Other fields are ignored.
pub async fn upload_chunk(
    State(service): State<MapService>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ChunkReceipt>), AppError> {
    let mut upload_id = None;
    let mut part_index = None;
    let mut filename = None;
    let mut file_type = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => {
                let upload = ChunkUpload {
                    upload_id: upload_id.take(),
                    part_index: part_index
                        .ok_or_else(|| AppError::bad_request("`part_index` must precede `chunk`"))?,
                    filename: Some(
                        filename
                            .take()
                            .ok_or_else(|| AppError::bad_request("`filename` must precede `chunk`"))?,
                    ),
                    file_type: Some(
                        file_type
                            .ok_or_else(|| AppError::bad_request("`file_type` must precede `chunk`"))?,
                    ),
                };
                let receipt = service
                    .receive_chunk(&caller, upload, field_stream(field))
                    .await?;
                return Ok((StatusCode::CREATED, Json(receipt)));
            }
            "upload_id" => upload_id = non_empty(read_text(field).await?),
            "part_index" => {
                let raw = read_text(field).await?;
                part_index = Some(raw.trim().parse::<u32>().map_err(|_| {
                    AppError::bad_request(format!("`part_index` must be a non-negative integer, got `{}`", raw))
                })?);
            }
            "filename" => filename = non_empty(read_text(field).await?),
            "file_type" => file_type = Some(read_text(field).await?.parse::<FileType>()?),
            other => debug!("ignoring multipart field `{}`", other),
        }
    }

    Err(AppError::bad_request("missing `chunk` field"))
}

/// DELETE `/api/v1/maps/uploads/{upload_id}` — abandon a staged upload.
pub async fn abandon_upload(
    State(service): State<MapService>,
    caller: Caller,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, AppError> {
    service.abandon_upload(&caller, &upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/api/v1/maps/complete` — assemble, validate, publish and record.
pub async fn complete_upload(
    State(service): State<MapService>,
    caller: Caller,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MapRecord>), AppError> {
    let Json(request) = payload.map_err(|r| AppError::bad_request(r.body_text()))?;
    let metadata = MapMetadata {
        name: request.name,
        description: request.description,
        file_type: request.file_type.parse()?,
        is_public: request.is_public,
    };

    let record = service
        .complete_upload(&caller, metadata, request.uploads)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST `/api/v1/maps/upload` — single-request upload of a whole file.
///
/// The `file` field may arrive before or after the metadata fields; it is
/// staged as a one-part upload and completed once the form is read.
pub async fn upload_map(
    State(service): State<MapService>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MapRecord>), AppError> {
    let mut staged: Option<UploadMember> = None;
    let result = read_upload_form(&service, &caller, &mut multipart, &mut staged).await;

    let Some(member) = staged else {
        result?;
        return Err(AppError::bad_request("missing `file` field"));
    };
    let upload_id = member.upload_id.clone();

    let outcome = match result.and_then(|form| form.into_metadata().map_err(AppError::from)) {
        Ok(metadata) => service
            .complete_upload(&caller, metadata, vec![member])
            .await
            .map_err(AppError::from),
        Err(err) => Err(err),
    };

    match outcome {
        Ok(record) => Ok((StatusCode::CREATED, Json(record))),
        Err(err) => {
            if let Err(cleanup) = service.abandon_upload(&caller, &upload_id).await {
                warn!(upload_id = %upload_id, "failed to discard single-shot upload: {}", cleanup);
            }
            Err(err)
        }
    }
}

async fn read_upload_form(
    service: &MapService,
    caller: &Caller,
    multipart: &mut Multipart,
    staged: &mut Option<UploadMember>,
) -> Result<MetadataForm, AppError> {
    let mut form = MetadataForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if staged.is_some() {
                    return Err(AppError::bad_request("only one `file` field is allowed"));
                }
                let upload_id = new_upload_id();
                let filename = field.file_name().map(str::to_string);
                *staged = Some(UploadMember {
                    upload_id: upload_id.clone(),
                    filename: filename.clone(),
                });
                let upload = ChunkUpload {
                    upload_id: Some(upload_id),
                    part_index: 0,
                    filename,
                    file_type: None,
                };
                service
                    .receive_chunk(caller, upload, field_stream(field))
                    .await?;
            }
            "name" => form.name = Some(read_text(field).await?),
            "description" => form.description = Some(read_text(field).await?),
            "file_type" => form.file_type = Some(read_text(field).await?),
            "is_public" => form.is_public = Some(read_text(field).await?),
            other => debug!("ignoring multipart field `{}`", other),
        }
    }
    Ok(form)
}

/// GET `/api/v1/maps` — maps visible to the caller.
pub async fn list_maps(
    State(service): State<MapService>,
    caller: Caller,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<MapRecord>>, AppError> {
    let Query(q) = query.map_err(|r| AppError::bad_request(r.body_text()))?;
    let records = service.list_maps(&caller, q.skip, q.limit).await?;
    Ok(Json(records))
}

/// DELETE `/api/v1/maps/{id}` — unpublish and remove a map.
pub async fn delete_map(
    State(service): State<MapService>,
    caller: Caller,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<DeleteResponse>, AppError> {
    let Path(id) = id.map_err(|r| AppError::bad_request(r.body_text()))?;
    let outcome = service.delete_map(&caller, id).await?;
    let message = if outcome.unremoved_files.is_empty() {
        format!("map {} deleted", id)
    } else {
        format!("map {} deleted; some files could not be removed", id)
    };
    Ok(Json(DeleteResponse { message, outcome }))
}

/// GET `/api/v1/maps/shapefile/{id}` — download a shapefile as a zip.
pub async fn download_shapefile(
    State(service): State<MapService>,
    caller: Caller,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Response, AppError> {
    let Path(id) = id.map_err(|r| AppError::bad_request(r.body_text()))?;
    let archive = service.shapefile_archive(&caller, id).await?;

    let stream = ReaderStream::with_capacity(archive.file, DOWNLOAD_BUFFER_BYTES);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(archive.len));
    let disposition = format!("attachment; filename=\"{}\"", archive.filename);
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    Ok(response)
}

fn field_stream(
    field: Field<'_>,
) -> impl futures::Stream<Item = io::Result<bytes::Bytes>> + '_ {
    field.map_err(io::Error::other)
}

async fn read_text(field: Field<'_>) -> Result<String, AppError> {
    field.text().await.map_err(multipart_error)
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), "validation_error", err.body_text())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_bool(raw: &str) -> MapResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(MapError::Validation(format!(
            "`is_public` must be a boolean, got `{}`",
            other
        ))),
    }
}
