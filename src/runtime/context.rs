//! Build context archiving.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::task::spawn_blocking;

/// Path components never shipped to the daemon.
pub const EXCLUDED: &[&str] = &[".git", "node_modules"];

fn is_excluded(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| EXCLUDED.iter().any(|e| c.as_os_str() == *e))
}

/// Tars `dir` into memory, skipping version control metadata and
/// dependency caches.
pub async fn archive_context(dir: &Path) -> std::io::Result<Bytes> {
    let dir = dir.to_owned();
    spawn_blocking(move || archive_context_sync(&dir)).await?
}

fn archive_context_sync(dir: &Path) -> std::io::Result<Bytes> {
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);
        builder.follow_symlinks(false);

        for path in walk(dir)? {
            let relative = path.strip_prefix(dir).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?;
            let metadata = std::fs::symlink_metadata(&path)?;
            if metadata.is_dir() {
                builder.append_dir(relative, &path)?;
            } else {
                builder.append_path_with_name(&path, relative)?;
            }
        }
        builder.finish()?;
    }
    log::debug!("Build context {dir:?} archived ({} bytes)", tar_data.len());
    Ok(Bytes::from(tar_data))
}

/// Depth first listing of `root`, pruning excluded directories.
fn walk(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = std::fs::read_dir(&dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();
        for path in entries {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            if is_excluded(relative) {
                continue;
            }
            if std::fs::symlink_metadata(&path)?.is_dir() {
                pending.push(path.clone());
            }
            paths.push(path);
        }
    }
    Ok(paths)
}
