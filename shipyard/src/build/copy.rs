//! `copy_files` build steps: host build context into the merged root.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use walkdir::WalkDir;

/// Path inside the root for `destination`: absolute destinations are taken
/// from `/`, relative ones from the work directory.
pub fn resolve_destination(workdir: &str, destination: &str) -> ShipyardResult<PathBuf> {
    let joined = if destination.starts_with('/') {
        PathBuf::from(destination)
    } else {
        Path::new("/").join(workdir).join(destination)
    };
    relative_inside(&joined, destination)
}

/// Strip the root and reject `..`, so the result can be joined onto a merge dir.
fn relative_inside(path: &Path, original: &str) -> ShipyardResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ShipyardError::Config(format!(
                    "path '{}' escapes its root",
                    original
                )));
            }
        }
    }
    Ok(out)
}

/// Symlink hops allowed while resolving one destination, as in Linux path walks.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolve `relative` under `root` the way a process chrooted into `root`
/// sees it: symlinks are followed, absolute link targets restart at `root`
/// and `..` never climbs above it. Components that do not exist yet are
/// kept as given.
fn resolve_in_root(root: &Path, relative: &Path) -> ShipyardResult<PathBuf> {
    fn parts(path: &Path) -> impl Iterator<Item = OsString> + '_ {
        path.components().filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
    }

    let mut pending: VecDeque<OsString> = parts(relative).collect();
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match std::fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(ShipyardError::Config(format!(
                        "too many symlinks resolving {}",
                        relative.display()
                    )));
                }
                let link = std::fs::read_link(&full)?;
                if link.is_absolute() {
                    resolved = PathBuf::new();
                }
                let link_parts: Vec<OsString> = parts(&link).collect();
                for link_part in link_parts.into_iter().rev() {
                    pending.push_front(link_part);
                }
            }
            _ => resolved = candidate,
        }
    }
    Ok(root.join(resolved))
}

/// Copy `source` from `context` to `destination` inside `root`.
///
/// Files land at the destination itself, or inside it when the destination
/// ends in `/` or is an existing directory. Directories copy recursively.
/// Missing parent directories are created. Symlinks already in the root are
/// followed within the root, never out to the host. Returns the number of
/// files copied.
pub fn copy_into_root(
    context: &Path,
    source: &str,
    root: &Path,
    workdir: &str,
    destination: &str,
) -> ShipyardResult<u64> {
    let src = context.join(relative_inside(Path::new(source), source)?);
    let relative = resolve_destination(workdir, destination)?;
    let mut target = resolve_in_root(root, &relative)?;

    let meta = std::fs::metadata(&src).map_err(|e| {
        ShipyardError::NotFound(format!("copy source {}: {}", src.display(), e))
    })?;

    if meta.is_file() {
        if (destination.ends_with('/') || target.is_dir())
            && let Some(file_name) = src.file_name()
        {
            target = resolve_in_root(root, &relative.join(file_name))?;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &target).map_err(|e| {
            ShipyardError::Storage(format!(
                "copy {} -> {}: {}",
                src.display(),
                target.display(),
                e
            ))
        })?;
        tracing::debug!(from = %src.display(), to = %target.display(), "Copied file");
        return Ok(1);
    }

    std::fs::create_dir_all(&target)?;
    copy_tree(&src, root, &relative)
}

fn copy_tree(src: &Path, root: &Path, target: &Path) -> ShipyardResult<u64> {
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ShipyardError::Storage(format!("walk {}: {}", src.display(), e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ShipyardError::Internal(e.to_string()))?;
        let inside = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(resolve_in_root(root, &inside)?)?;
        } else if file_type.is_symlink() {
            // the link itself is replaced, only its parent is resolved
            let parent = resolve_in_root(root, inside.parent().unwrap_or(Path::new("")))?;
            let out = parent.join(entry.file_name());
            let link = std::fs::read_link(entry.path())?;
            if std::fs::symlink_metadata(&out).is_ok() {
                std::fs::remove_file(&out)?;
            }
            std::os::unix::fs::symlink(&link, &out)?;
            copied += 1;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), resolve_in_root(root, &inside)?)?;
            copied += 1;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
        }
    }

    tracing::debug!(from = %src.display(), to = %root.join(target).display(), files = copied, "Copied tree");
    Ok(copied)
}
