//! Shared fixtures for unit and HTTP tests.

use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::Stream;
use sqlx::SqlitePool;
use std::{
    io::{self, Cursor},
    sync::{Arc, Mutex},
};
use tiff::{
    encoder::{TiffEncoder, colortype::Gray8},
    tags::Tag,
};
use tokio::net::TcpListener;

/// Stream a request body made of the given text pieces.
pub fn byte_stream(parts: &[&str]) -> impl Stream<Item = io::Result<Bytes>> + use<> {
    let owned: Vec<io::Result<Bytes>> = parts
        .iter()
        .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
        .collect();
    futures::stream::iter(owned)
}

/// Stream raw bytes as a single body piece.
pub fn bytes_stream(bytes: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + use<> {
    futures::stream::iter(vec![Ok(Bytes::copy_from_slice(bytes))])
}

/// In-memory database with the schema applied.
pub async fn memory_pool() -> SqlitePool {
    let pool = crate::db::connect("sqlite::memory:").await.unwrap();
    crate::db::run_migrations(&pool).await.unwrap();
    pool
}

/// Georeferencing written into a test raster.
#[derive(Debug, Clone, Copy)]
pub enum Georef {
    /// 0.5 units per pixel, origin at (100, 200).
    Lunar,
    /// No GeoTIFF model tags at all.
    None,
    /// An explicit identity ModelTransformationTag.
    Identity,
}

/// Encode a `width` x `height` 8-bit grayscale GeoTIFF.
pub fn geotiff_bytes(width: u32, height: u32, georef: Georef) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buf).unwrap();
        let mut image = encoder.new_image::<Gray8>(width, height).unwrap();
        match georef {
            Georef::Lunar => {
                image
                    .encoder()
                    .write_tag(Tag::ModelPixelScaleTag, &[0.5f64, 0.5, 0.0][..])
                    .unwrap();
                image
                    .encoder()
                    .write_tag(
                        Tag::ModelTiepointTag,
                        &[0.0f64, 0.0, 0.0, 100.0, 200.0, 0.0][..],
                    )
                    .unwrap();
            }
            Georef::Identity => {
                let identity: [f64; 16] = [
                    1.0, 0.0, 0.0, 0.0, //
                    0.0, 1.0, 0.0, 0.0, //
                    0.0, 0.0, 1.0, 0.0, //
                    0.0, 0.0, 0.0, 1.0,
                ];
                image
                    .encoder()
                    .write_tag(Tag::ModelTransformationTag, &identity[..])
                    .unwrap();
            }
            Georef::None => {}
        }
        let pixels = vec![0u8; width as usize * height as usize];
        image.write_data(&pixels).unwrap();
    }
    buf.into_inner()
}

/// Address nothing is listening on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/geoserver")
}

/// Canned failures for the fake catalog.
#[derive(Debug, Default)]
pub struct FakeCatalogRules {
    /// Answer workspace lookups with 404.
    pub missing_workspace: bool,
    failures: Vec<(Method, String, StatusCode)>,
}

impl FakeCatalogRules {
    /// Answer `method` requests whose path contains `fragment` with `status`.
    pub fn fail(&mut self, method: Method, fragment: &str, status: StatusCode) {
        self.failures.push((method, fragment.to_string(), status));
    }
}

type RequestLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

#[derive(Clone)]
struct FakeState {
    rules: Arc<FakeCatalogRules>,
    log: RequestLog,
}

/// Minimal GeoServer stand-in that records every request it receives.
pub struct FakeCatalog {
    pub base_url: String,
    log: RequestLog,
}

impl FakeCatalog {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(configure: impl FnOnce(&mut FakeCatalogRules)) -> Self {
        let mut rules = FakeCatalogRules::default();
        configure(&mut rules);
        let state = FakeState {
            rules: Arc::new(rules),
            log: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .fallback(answer)
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/geoserver"),
            log: state.log,
        }
    }

    /// `"METHOD /path?query"` for each request, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(line, _)| line.clone()).collect()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().iter().map(|(_, body)| body.clone()).collect()
    }
}

async fn answer(State(state): State<FakeState>, method: Method, uri: Uri, body: Bytes) -> Response {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    state
        .log
        .lock()
        .unwrap()
        .push((format!("{} {}", method, target), body.to_vec()));

    for (fail_method, fragment, status) in &state.rules.failures {
        if *fail_method == method && uri.path().contains(fragment.as_str()) {
            return (*status, "refused by fake catalog").into_response();
        }
    }
    if state.rules.missing_workspace
        && method == Method::GET
        && uri.path().contains("/rest/workspaces/")
    {
        return StatusCode::NOT_FOUND.into_response();
    }
    if method == Method::POST {
        StatusCode::CREATED.into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

/// Hand-rolled `multipart/form-data` body for handler tests.
pub struct MultipartForm {
    boundary: &'static str,
    body: Vec<u8>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self {
            boundary: "lunar-maps-test-boundary",
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                self.boundary, name, value
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                self.boundary, name, filename
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Content type header value and the finished body.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}
