//! Represents a published map layer and the kinds of files it can be built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

use crate::errors::MapError;

/// Geospatial file families accepted for publication.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileType {
    Geotiff,
    Shapefile,
}

/// Shapefile members that travel together under one base name.
pub const SHAPEFILE_SIBLINGS: [&str; 4] = ["shp", "shx", "dbf", "prj"];

/// Every extension a published layer may leave on disk.
pub const KNOWN_EXTENSIONS: [&str; 7] = ["tif", "tiff", "shp", "shx", "dbf", "prj", "zip"];

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geotiff => "geotiff",
            Self::Shapefile => "shapefile",
        }
    }

    /// Extension of the primary file written for this type.
    pub fn primary_extension(&self) -> &'static str {
        match self {
            Self::Geotiff => "tif",
            Self::Shapefile => "shp",
        }
    }

    /// Whether a client-supplied extension (without the dot) belongs to this type.
    pub fn accepts_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        match self {
            Self::Geotiff => matches!(ext.as_str(), "tif" | "tiff"),
            Self::Shapefile => SHAPEFILE_SIBLINGS.contains(&ext.as_str()),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geotiff" => Ok(Self::Geotiff),
            "shapefile" => Ok(Self::Shapefile),
            _ => Err(MapError::UnsupportedType(s.to_string())),
        }
    }
}

/// A map layer that has been published to the catalog and recorded.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct MapRecord {
    pub id: i64,

    /// Display name chosen by the uploader.
    pub name: String,

    pub description: Option<String>,

    pub file_type: FileType,

    /// Local path of the primary file (`.tif` or `.shp`); siblings share its stem.
    pub file_path: String,

    /// Catalog layer name, without workspace prefix.
    pub layer_name: String,

    /// User id of the owner.
    pub created_by: i64,

    pub is_public: bool,

    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the uploader when a layer is published.
#[derive(Clone, Debug)]
pub struct MapMetadata {
    pub name: String,
    pub description: Option<String>,
    pub file_type: FileType,
    pub is_public: bool,
}

impl MapMetadata {
    pub fn validate(&self) -> Result<(), MapError> {
        if self.name.trim().is_empty() {
            return Err(MapError::Validation("map name must not be empty".into()));
        }
        Ok(())
    }
}

/// Where a published layer lives, locally and in the catalog.
#[derive(Clone, Debug)]
pub struct StorageReference {
    pub file_path: String,
    pub layer_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_types_case_insensitively() {
        assert_eq!("GeoTIFF".parse::<FileType>().unwrap(), FileType::Geotiff);
        assert_eq!(" shapefile ".parse::<FileType>().unwrap(), FileType::Shapefile);
        assert!(matches!(
            "kml".parse::<FileType>(),
            Err(MapError::UnsupportedType(t)) if t == "kml"
        ));
    }

    #[test]
    fn extensions_follow_the_declared_type() {
        assert!(FileType::Geotiff.accepts_extension("TIFF"));
        assert!(!FileType::Geotiff.accepts_extension("shp"));
        assert!(FileType::Shapefile.accepts_extension("prj"));
        assert!(!FileType::Shapefile.accepts_extension("tif"));
    }
}
