//! GeoTIFF inspection: can the file be read, is it small enough, and does it
//! carry a real pixel-to-world mapping.

use std::{
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
};
use thiserror::Error;
use tiff::{decoder::Decoder, tags::Tag};
use tracing::debug;

use crate::errors::MapResult;

/// Largest accepted width or height, in pixels.
pub const MAX_RASTER_DIMENSION: u32 = 10_000;

const IDENTITY_EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("file cannot be read as a GeoTIFF raster: {0}")]
    InvalidFormat(String),
    #[error("raster has no georeferencing (identity pixel-to-world transform)")]
    MissingGeoreference,
    #[error("raster is {width}x{height} pixels; at most {limit} per side is accepted")]
    DimensionsTooLarge { width: u32, height: u32, limit: u32 },
}

impl RasterError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid_format",
            Self::MissingGeoreference => "missing_georeference",
            Self::DimensionsTooLarge { .. } => "dimensions_too_large",
        }
    }
}

/// Affine pixel-to-world transform in GDAL order:
/// `x = a*col + b*row + c`, `y = d*col + e*row + f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 0.0,
        e: 1.0,
        f: 0.0,
    };

    pub fn is_identity(&self) -> bool {
        let close = |x: f64, y: f64| (x - y).abs() < IDENTITY_EPSILON;
        let id = Self::IDENTITY;
        close(self.a, id.a)
            && close(self.b, id.b)
            && close(self.c, id.c)
            && close(self.d, id.d)
            && close(self.e, id.e)
            && close(self.f, id.f)
    }

    /// From a row-major 4x4 `ModelTransformationTag` matrix.
    fn from_model_transformation(m: &[f64]) -> Result<Self, RasterError> {
        if m.len() < 16 {
            return Err(RasterError::InvalidFormat(format!(
                "ModelTransformationTag has {} values, expected 16",
                m.len()
            )));
        }
        Ok(Self {
            a: m[0],
            b: m[1],
            c: m[3],
            d: m[4],
            e: m[5],
            f: m[7],
        })
    }

    /// From `ModelPixelScaleTag` + the first `ModelTiepointTag` entry.
    fn from_scale_and_tiepoint(scale: &[f64], tiepoint: &[f64]) -> Result<Self, RasterError> {
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(RasterError::InvalidFormat(
                "ModelPixelScaleTag or ModelTiepointTag is truncated".into(),
            ));
        }
        let (sx, sy) = (scale[0], scale[1]);
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        Ok(Self {
            a: sx,
            b: 0.0,
            c: x - i * sx,
            d: 0.0,
            e: -sy,
            f: y + j * sy,
        })
    }
}

/// Dimensions and georeferencing of an accepted raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
}

/// Validate a GeoTIFF on the blocking pool.
pub async fn validate(path: &Path) -> MapResult<RasterInfo> {
    let path = path.to_path_buf();
    let info = tokio::task::spawn_blocking(move || inspect(&path)).await??;
    Ok(info)
}

/// Open, size-check and georeference-check a raster. The file handle is
/// released when this returns, on every path.
pub fn inspect(path: &Path) -> Result<RasterInfo, RasterError> {
    let file = File::open(path).map_err(invalid)?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(invalid)?;

    let (width, height) = decoder.dimensions().map_err(invalid)?;
    if width > MAX_RASTER_DIMENSION || height > MAX_RASTER_DIMENSION {
        return Err(RasterError::DimensionsTooLarge {
            width,
            height,
            limit: MAX_RASTER_DIMENSION,
        });
    }

    let transform = read_transform(&mut decoder)?;
    if transform.is_identity() {
        return Err(RasterError::MissingGeoreference);
    }

    debug!(path = %path.display(), width, height, ?transform, "raster accepted");
    Ok(RasterInfo {
        width,
        height,
        transform,
    })
}

/// Identity when the file carries no usable GeoTIFF model tags.
fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform, RasterError> {
    if let Some(matrix) = f64_tag(decoder, Tag::ModelTransformationTag)? {
        return GeoTransform::from_model_transformation(&matrix);
    }
    let scale = f64_tag(decoder, Tag::ModelPixelScaleTag)?;
    let tiepoint = f64_tag(decoder, Tag::ModelTiepointTag)?;
    match (scale, tiepoint) {
        (Some(scale), Some(tiepoint)) => GeoTransform::from_scale_and_tiepoint(&scale, &tiepoint),
        _ => Ok(GeoTransform::IDENTITY),
    }
}

fn f64_tag<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Result<Option<Vec<f64>>, RasterError> {
    decoder
        .find_tag(tag)
        .map_err(invalid)?
        .map(|value| value.into_f64_vec().map_err(invalid))
        .transpose()
}

fn invalid(err: impl std::fmt::Display) -> RasterError {
    RasterError::InvalidFormat(err.to_string())
}
