//! Zips a shapefile's sibling files under a common name.

use std::{
    fs::File,
    io::{self, ErrorKind, Seek, Write},
    path::Path,
};
use tracing::{debug, warn};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{errors::MapResult, models::map_record::SHAPEFILE_SIBLINGS};

/// Write every existing sibling of `shp_path` into a zip as `{entry_stem}.{ext}`.
///
/// Missing siblings are skipped. Returns the writer and the number of entries.
pub fn bundle<W: Write + Seek>(shp_path: &Path, entry_stem: &str, writer: W) -> MapResult<(W, usize)> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = 0;
    for ext in SHAPEFILE_SIBLINGS {
        let sibling = shp_path.with_extension(ext);
        let mut source = match File::open(&sibling) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("shapefile sibling {} not present, skipping", sibling.display());
                continue;
            }
            Err(err) => {
                warn!("cannot read shapefile sibling {}: {}", sibling.display(), err);
                continue;
            }
        };
        zip.start_file(format!("{}.{}", entry_stem, ext), options)?;
        io::copy(&mut source, &mut zip)?;
        entries += 1;
    }

    let writer = zip.finish()?;
    Ok((writer, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bundles_only_present_siblings_under_the_new_stem() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("abc.shp");
        std::fs::write(&shp, b"shp").unwrap();
        std::fs::write(dir.path().join("abc.dbf"), b"dbf").unwrap();
        std::fs::write(dir.path().join("other.shx"), b"unrelated").unwrap();

        let (cursor, entries) = bundle(&shp, "crater_rim", Cursor::new(Vec::new())).unwrap();
        assert_eq!(entries, 2);

        let mut archive = zip::ZipArchive::new(Cursor::new(cursor.into_inner())).unwrap();
        let mut names: Vec<_> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["crater_rim.dbf", "crater_rim.shp"]);

        let mut body = String::new();
        io::Read::read_to_string(&mut archive.by_name("crater_rim.shp").unwrap(), &mut body)
            .unwrap();
        assert_eq!(body, "shp");
    }
}
