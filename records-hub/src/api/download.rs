//! Packing download plans into zip archives.

use anyhow::Result;
use records_hub_core::blob::BlobStore;
use records_hub_core::engine::DownloadEntry;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Archive-safe variant of `path`, unique among `used`. A clash gets a
/// ` (n)` suffix before the extension.
fn unique_path(used: &mut HashSet<String>, path: &str) -> String {
    if used.insert(path.to_string()) {
        return path.to_string();
    }
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (format!("{dir}/"), file),
        None => (String::new(), path),
    };
    let (stem, ext) = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (file, String::new()),
    };
    let mut n = 2;
    loop {
        let candidate = format!("{dir}{stem} ({n}){ext}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Fetch every entry from `blobs` and write them into one archive.
pub fn build_archive(blobs: &dyn BlobStore, entries: &[DownloadEntry]) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut used = HashSet::new();
        for entry in entries {
            let data = blobs.fetch(&entry.file_ref)?;
            zip.start_file(unique_path(&mut used, &entry.path), options)?;
            zip.write_all(&data)?;
        }
        zip.finish()?;
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use records_hub_core::blob::InMemoryBlobStore;
    use std::io::Read;
    use uuid::Uuid;

    #[test]
    fn clashing_paths_get_suffixes() {
        let mut used = HashSet::new();
        assert_eq!(unique_path(&mut used, "Labs/cbc.pdf"), "Labs/cbc.pdf");
        assert_eq!(unique_path(&mut used, "Labs/cbc.pdf"), "Labs/cbc (2).pdf");
        assert_eq!(unique_path(&mut used, "Labs/cbc.pdf"), "Labs/cbc (3).pdf");
        assert_eq!(unique_path(&mut used, "notes"), "notes");
        assert_eq!(unique_path(&mut used, "notes"), "notes (2)");
    }

    #[test]
    fn archive_holds_every_entry() {
        let blobs = InMemoryBlobStore::new();
        let entry = |path: &str, data: &[u8]| DownloadEntry {
            item_id: Uuid::new_v4(),
            path: path.to_string(),
            file_ref: blobs.put(data).unwrap(),
            size: Some(data.len() as u64),
        };
        let entries = vec![entry("Labs/cbc.pdf", b"cbc"), entry("Labs/2024/x.pdf", b"x")];

        let bytes = build_archive(&blobs, &entries).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        archive
            .by_name("Labs/cbc.pdf")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "cbc");
    }
}
