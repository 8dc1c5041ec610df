//! Defines routes for the map-layer API.
//!
//! ## Structure
//! - **Probes** (mounted at root)
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Upload workflow**
//!   - `POST   /api/v1/maps/chunks` — store one part (multipart)
//!   - `DELETE /api/v1/maps/uploads/{upload_id}` — abandon a staged upload
//!   - `POST   /api/v1/maps/complete` — assemble, validate, publish, record
//!   - `POST   /api/v1/maps/upload` — single-request upload (multipart)
//!
//! - **Published maps**
//!   - `GET    /api/v1/maps` — list maps visible to the caller
//!   - `DELETE /api/v1/maps/{id}` — unpublish and remove
//!   - `GET    /api/v1/maps/shapefile/{id}` — download a shapefile as zip

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        map_handlers::{
            abandon_upload, complete_upload, delete_map, download_shapefile, list_maps,
            upload_chunk, upload_map,
        },
    },
    services::map_service::MapService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router for all endpoints, carrying `MapService` as state.
///
/// Upload routes lift axum's default body limit; the chunk store enforces
/// its own ceiling while streaming.
pub fn routes() -> Router<MapService> {
    let uploads = Router::new()
        .route("/api/v1/maps/chunks", post(upload_chunk))
        .route("/api/v1/maps/upload", post(upload_map))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/maps", get(list_maps))
        .route("/api/v1/maps/complete", post(complete_upload))
        .route("/api/v1/maps/uploads/{upload_id}", delete(abandon_upload))
        .route("/api/v1/maps/shapefile/{id}", get(download_shapefile))
        .route("/api/v1/maps/{id}", delete(delete_map))
        .merge(uploads)
}

/// The complete application with request tracing.
pub fn app(service: MapService) -> Router {
    routes()
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::{
            catalog::{CatalogClient, CatalogConfig},
            chunk_store::ChunkStore,
        },
        test_support::{FakeCatalog, Georef, MultipartForm, geotiff_bytes, memory_pool, unreachable_url},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{HeaderMap, Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        dir: TempDir,
    }

    impl Harness {
        async fn new(catalog_url: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let upload_dir = dir.path().join("uploads");
            let chunk_dir = dir.path().join("chunks");
            std::fs::create_dir_all(&upload_dir).unwrap();
            std::fs::create_dir_all(&chunk_dir).unwrap();
            let catalog = CatalogClient::new(CatalogConfig {
                base_url: catalog_url.to_string(),
                username: "admin".into(),
                password: "geoserver".into(),
                workspace: "lunar".into(),
                timeout: Duration::from_secs(5),
            })
            .unwrap();
            let service = MapService::new(
                Arc::new(memory_pool().await),
                ChunkStore::new(chunk_dir, 10 * 1024 * 1024),
                catalog,
                upload_dir,
            );
            Self {
                app: app(service),
                dir,
            }
        }

        fn count(&self, sub: &str) -> usize {
            std::fs::read_dir(self.dir.path().join(sub)).unwrap().count()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, headers, body.to_vec())
        }

        async fn send_json(&self, request: Request<Body>) -> (StatusCode, Value) {
            let (status, _, body) = self.send(request).await;
            let value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&body).unwrap()
            };
            (status, value)
        }
    }

    fn multipart(uri: &str, user: i64, form: MultipartForm) -> Request<Body> {
        let (content_type, body) = form.finish();
        Request::post(uri)
            .header("x-user-id", user.to_string())
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    fn json_post(uri: &str, user: i64, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("x-user-id", user.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as(uri: &str, user: i64) -> Request<Body> {
        Request::get(uri)
            .header("x-user-id", user.to_string())
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn probes_report_ready() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;

        let (status, body) = h
            .send_json(Request::get("/healthz").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = h
            .send_json(Request::get("/readyz").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["chunk_dir"]["ok"], true);
        assert_eq!(h.count("uploads"), 0);
    }

    #[tokio::test]
    async fn api_requires_caller_identity() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let (status, body) = h
            .send_json(Request::get("/api/v1/maps").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn chunked_geotiff_is_published_and_listed() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let raster = geotiff_bytes(512, 512, Georef::Lunar);
        let third = raster.len() / 3;
        let parts = [&raster[..third], &raster[third..2 * third], &raster[2 * third..]];

        let mut upload_id = String::new();
        for (index, part) in parts.iter().enumerate() {
            let mut form = MultipartForm::new();
            if !upload_id.is_empty() {
                form = form.text("upload_id", &upload_id);
            } else {
                // layer metadata belongs to completion; stray fields are skipped
                form = form.text("name", "draft");
            }
            let form = form
                .text("part_index", &index.to_string())
                .text("filename", "tranquility.tif")
                .text("file_type", "geotiff")
                .file("chunk", "blob", part);
            let (status, receipt) = h
                .send_json(multipart("/api/v1/maps/chunks", 5, form))
                .await;
            assert_eq!(status, StatusCode::CREATED, "{receipt}");
            assert_eq!(receipt["part_index"], index);
            assert_eq!(receipt["size_bytes"], part.len());
            upload_id = receipt["upload_id"].as_str().unwrap().to_string();
        }

        let (status, record) = h
            .send_json(json_post(
                "/api/v1/maps/complete",
                5,
                json!({
                    "name": "Sea of Tranquility",
                    "file_type": "geotiff",
                    "is_public": true,
                    "uploads": [{ "upload_id": upload_id }]
                }),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{record}");
        assert_eq!(record["file_type"], "geotiff");
        assert_eq!(record["created_by"], 5);
        assert!(!record["layer_name"].as_str().unwrap().is_empty());
        assert_eq!(h.count("chunks"), 0);
        assert_eq!(h.count("uploads"), 1);

        let (status, list) = h.send_json(get_as("/api/v1/maps", 6)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chunk_without_part_index_is_rejected() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let form = MultipartForm::new()
            .text("filename", "a.tif")
            .text("file_type", "geotiff")
            .file("chunk", "blob", b"xx");
        let (status, body) = h
            .send_json(multipart("/api/v1/maps/chunks", 1, form))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
        assert_eq!(h.count("chunks"), 0);
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_with_413() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let big = vec![7u8; 10 * 1024 * 1024 + 1];
        let form = MultipartForm::new()
            .text("upload_id", "huge")
            .text("part_index", "0")
            .text("filename", "a.tif")
            .text("file_type", "geotiff")
            .file("chunk", "blob", &big);
        let (status, body) = h
            .send_json(multipart("/api/v1/maps/chunks", 1, form))
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "size_limit_exceeded");
    }

    #[tokio::test]
    async fn ungeoreferenced_single_upload_is_refused_without_trace() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let form = MultipartForm::new()
            .file("file", "flat.tif", &geotiff_bytes(64, 64, Georef::Identity))
            .text("name", "flat")
            .text("file_type", "geotiff");

        let (status, body) = h.send_json(multipart("/api/v1/maps/upload", 3, form)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_georeference");
        assert_eq!(body["retryable"], false);
        assert_eq!(h.count("uploads"), 0);
        assert_eq!(h.count("chunks"), 0);
        let (_, list) = h.send_json(get_as("/api/v1/maps", 3)).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_catalog_is_a_retryable_publish_error() {
        let h = Harness::new(&unreachable_url().await).await;
        let form = MultipartForm::new()
            .text("name", "rim")
            .text("file_type", "geotiff")
            .file("file", "rim.tif", &geotiff_bytes(32, 32, Georef::Lunar));

        let (status, body) = h.send_json(multipart("/api/v1/maps/upload", 3, form)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "publish_error");
        assert_eq!(body["retryable"], true);
        assert_eq!(h.count("uploads"), 0);
        assert_eq!(h.count("chunks"), 0);
    }

    #[tokio::test]
    async fn single_upload_with_bad_metadata_discards_the_file() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let form = MultipartForm::new()
            .file("file", "a.kml", b"<kml/>")
            .text("name", "a")
            .text("file_type", "kml");

        let (status, body) = h.send_json(multipart("/api/v1/maps/upload", 3, form)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported_type");
        assert_eq!(h.count("chunks"), 0);
    }

    #[tokio::test]
    async fn shapefile_download_and_delete_round_trip() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let form = MultipartForm::new()
            .text("name", "Base perimeter")
            .text("file_type", "shapefile")
            .text("is_public", "false")
            .file("file", "perimeter.shp", b"shape-data");
        let (status, record) = h.send_json(multipart("/api/v1/maps/upload", 8, form)).await;
        assert_eq!(status, StatusCode::CREATED, "{record}");
        let id = record["id"].as_i64().unwrap();
        let layer = record["layer_name"].as_str().unwrap().to_string();

        let (status, headers, bytes) = h
            .send(get_as(&format!("/api/v1/maps/shapefile/{id}"), 8))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/zip");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"{layer}.zip\"").as_str()
        );
        assert_eq!(
            headers[header::CONTENT_LENGTH],
            bytes.len().to_string().as_str()
        );
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);

        let (status, _) = h
            .send_json(get_as(&format!("/api/v1/maps/shapefile/{id}"), 9))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let delete_as = |user: i64| {
            Request::delete(format!("/api/v1/maps/{id}"))
                .header("x-user-id", user.to_string())
                .body(Body::empty())
                .unwrap()
        };
        let (status, body) = h.send_json(delete_as(9)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
        assert_eq!(h.count("uploads"), 1);

        let (status, body) = h.send_json(delete_as(8)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["removed_files"].as_array().unwrap().len(), 1);
        assert!(body["unremoved_files"].as_array().unwrap().is_empty());
        assert!(body["message"].as_str().unwrap().contains("deleted"));
        assert_eq!(h.count("uploads"), 0);

        let (status, _) = h.send_json(delete_as(8)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abandoning_an_upload_removes_its_parts() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let form = MultipartForm::new()
            .text("upload_id", "drop-me")
            .text("part_index", "0")
            .text("filename", "a.shp")
            .text("file_type", "shapefile")
            .file("chunk", "blob", b"x");
        let (status, _) = h.send_json(multipart("/api/v1/maps/chunks", 4, form)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(h.count("chunks"), 1);

        let abandon = |user: i64| {
            Request::delete("/api/v1/maps/uploads/drop-me")
                .header("x-user-id", user.to_string())
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = h.send_json(abandon(5)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = h.send_json(abandon(4)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(h.count("chunks"), 0);
    }

    #[tokio::test]
    async fn malformed_completion_body_is_a_validation_error() {
        let catalog = FakeCatalog::spawn().await;
        let h = Harness::new(&catalog.base_url).await;
        let (status, body) = h
            .send_json(json_post("/api/v1/maps/complete", 1, json!({ "name": "x" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");
    }
}
