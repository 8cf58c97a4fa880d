//! Content-addressed crate archives.
//!
//! The upper directory is packed into a gzip'd tar with sorted entries,
//! zeroed mtimes and root ownership, so identical build outputs produce
//! byte-identical archives and therefore identical digests.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use walkdir::WalkDir;

/// Package-manager caches left out of every archive (relative to the root).
pub const EXCLUDED_PATHS: &[&str] = &[
    "var/cache/apt",
    "var/lib/apt/lists",
    "var/cache/apk",
    "var/cache/dnf",
    "root/.cache",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Hex SHA-256 of the archive bytes.
    pub digest: String,
    pub size_bytes: u64,
}

fn is_excluded(relative: &Path) -> bool {
    EXCLUDED_PATHS.iter().any(|p| relative.starts_with(p))
}

fn storage_err(context: &str, path: &Path, e: impl std::fmt::Display) -> ShipyardError {
    ShipyardError::Storage(format!("{} {}: {}", context, path.display(), e))
}

/// Pack `upper` into `dest` and return its digest and size.
///
/// The archive is written to a temporary file next to `dest` and renamed
/// into place, so `dest` is either absent or complete.
pub fn write_archive(upper: &Path, dest: &Path) -> ShipyardResult<ArchiveInfo> {
    let parent = dest
        .parent()
        .ok_or_else(|| ShipyardError::Internal(format!("no parent for {}", dest.display())))?;
    std::fs::create_dir_all(parent)?;

    let tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| storage_err("create temp archive in", parent, e))?;
    let encoder = GzEncoder::new(tmp.reopen()?, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut entries = 0usize;
    let walker = WalkDir::new(upper)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(upper)
                .map(|rel| !is_excluded(rel))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| storage_err("walk", upper, e))?;
        let relative = entry
            .path()
            .strip_prefix(upper)
            .map_err(|e| ShipyardError::Internal(e.to_string()))?;
        if append_entry(&mut builder, entry.path(), relative)? {
            entries += 1;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| storage_err("finish tar", dest, e))?;
    let file = encoder
        .finish()
        .map_err(|e| storage_err("finish gzip", dest, e))?;
    file.sync_all()?;

    tmp.persist(dest)
        .map_err(|e| storage_err("persist archive", dest, e.error))?;

    let info = ArchiveInfo {
        digest: digest_file(dest)?,
        size_bytes: std::fs::metadata(dest)?.len(),
    };
    tracing::info!(
        archive = %dest.display(),
        entries,
        size = info.size_bytes,
        digest = %info.digest,
        "Wrote crate archive"
    );
    Ok(info)
}

fn header_for(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode & 0o7777);
    header.set_size(size);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header
}

/// Append one filesystem entry. Returns false for skipped special files
/// (overlay whiteouts, sockets, devices).
fn append_entry<W: io::Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    relative: &Path,
) -> ShipyardResult<bool> {
    let meta = std::fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    if file_type.is_dir() {
        let mut header = header_for(tar::EntryType::Directory, meta.mode(), 0);
        builder
            .append_data(&mut header, relative, io::empty())
            .map_err(|e| storage_err("archive dir", path, e))?;
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(path)?;
        let mut header = header_for(tar::EntryType::Symlink, meta.mode(), 0);
        builder
            .append_link(&mut header, relative, &target)
            .map_err(|e| storage_err("archive symlink", path, e))?;
    } else if file_type.is_file() {
        let mut header = header_for(tar::EntryType::Regular, meta.mode(), meta.len());
        let file = File::open(path).map_err(|e| storage_err("open", path, e))?;
        builder
            .append_data(&mut header, relative, file)
            .map_err(|e| storage_err("archive file", path, e))?;
    } else {
        tracing::debug!(path = %path.display(), "Skipping special file in archive");
        return Ok(false);
    }
    Ok(true)
}

/// Hex SHA-256 of a file's bytes.
pub fn digest_file(path: &Path) -> ShipyardResult<String> {
    let file = File::open(path).map_err(|e| storage_err("open", path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("etc")).unwrap();
        std::fs::create_dir_all(dir.join("var/cache/apt/archives")).unwrap();
        std::fs::create_dir_all(dir.join("root/.cache/pip")).unwrap();
        std::fs::write(dir.join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.join("etc/conf"), "k=v").unwrap();
        std::fs::write(dir.join("var/cache/apt/archives/x.deb"), "junk").unwrap();
        std::fs::write(dir.join("root/.cache/pip/y"), "junk").unwrap();
        std::os::unix::fs::symlink("a.txt", dir.join("link")).unwrap();
    }

    fn entry_names(archive: &Path) -> Vec<PathBuf> {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        tar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect()
    }

    #[test]
    fn test_digest_matches_archive_bytes() {
        let temp = TempDir::new().unwrap();
        let upper = temp.path().join("upper");
        populate(&upper);
        let dest = temp.path().join("out/demo.tar.gz");

        let info = write_archive(&upper, &dest).unwrap();
        let bytes = std::fs::read(&dest).unwrap();
        assert_eq!(info.digest, hex::encode(Sha256::digest(&bytes)));
        assert_eq!(info.size_bytes, bytes.len() as u64);
    }

    #[test]
    fn test_caches_excluded() {
        let temp = TempDir::new().unwrap();
        let upper = temp.path().join("upper");
        populate(&upper);
        let dest = temp.path().join("demo.tar.gz");
        write_archive(&upper, &dest).unwrap();

        let names = entry_names(&dest);
        assert!(names.contains(&PathBuf::from("a.txt")));
        assert!(names.contains(&PathBuf::from("etc/conf")));
        assert!(names.contains(&PathBuf::from("link")));
        assert!(names.iter().all(|n| !n.starts_with("var/cache/apt")));
        assert!(names.iter().all(|n| !n.starts_with("root/.cache")));
        // the parent directories themselves stay
        assert!(names.contains(&PathBuf::from("var/cache")));
    }

    #[test]
    fn test_identical_inputs_identical_digest() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        populate(&first);
        std::thread::sleep(std::time::Duration::from_millis(20));
        populate(&second);

        let a = write_archive(&first, &temp.path().join("a.tar.gz")).unwrap();
        let b = write_archive(&second, &temp.path().join("b.tar.gz")).unwrap();
        assert_eq!(a.digest, b.digest);

        std::fs::write(second.join("a.txt"), "changed").unwrap();
        let c = write_archive(&second, &temp.path().join("c.tar.gz")).unwrap();
        assert_ne!(a.digest, c.digest);
    }
}
