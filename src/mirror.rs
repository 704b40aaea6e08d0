use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

/// Files and directories found beneath the mirror root, each list sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorEntries {
    pub files: Vec<PathBuf>,
    pub directories: Vec<PathBuf>,
}

/// Async recursive walk over the local mirror
#[derive(Debug, Clone)]
pub struct MirrorScan {
    root: PathBuf,
    /// Maximum depth for directory traversal (None = unlimited)
    max_depth: Option<usize>,
}

impl MirrorScan {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_depth: None,
        }
    }

    /// Set maximum traversal depth
    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the mirror. A missing root yields no entries.
    pub async fn scan(&self) -> Result<MirrorEntries> {
        let mut entries = MirrorEntries::default();
        if !fs::try_exists(&self.root).await? {
            warn!(path = %self.root.display(), "mirror root does not exist");
            return Ok(entries);
        }

        self.scan_recursive(&self.root, 0, &mut entries).await?;
        entries.files.sort();
        entries.directories.sort();
        Ok(entries)
    }

    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        Ok(self.scan().await?.files)
    }

    pub async fn directories(&self) -> Result<Vec<PathBuf>> {
        Ok(self.scan().await?.directories)
    }

    /// Recursive helper; unreadable entries are logged and skipped
    fn scan_recursive<'a>(
        &'a self,
        dir: &'a Path,
        depth: usize,
        entries: &'a mut MirrorEntries,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut read_dir = fs::read_dir(dir).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(error) => {
                        warn!(path = %path.display(), error = %error, "cannot stat mirror entry");
                        continue;
                    }
                };

                // Links are not part of the mirror layout
                if file_type.is_symlink() {
                    continue;
                }

                let metadata = match fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(error) => {
                        warn!(path = %path.display(), error = %error, "cannot stat mirror entry");
                        continue;
                    }
                };

                if metadata.is_file() {
                    entries.files.push(path);
                } else if metadata.is_dir() {
                    entries.directories.push(path.clone());
                    if self.max_depth.is_some_and(|max| depth + 1 >= max) {
                        continue;
                    }
                    if let Err(error) = self.scan_recursive(&path, depth + 1, entries).await {
                        warn!(path = %path.display(), error = %error, "error scanning mirror directory");
                    }
                }
            }

            Ok(())
        })
    }
}

/// Path components of `path` below `root`, as strings
/// Depth of a collection directory below the mirror root (`<year>/<month>/<collection>`)
pub const COLLECTION_DEPTH: usize = 3;

/// The collection directory a mirrored file belongs to.
///
/// Files nested below a collection, such as archive members stored under a
/// sub-path, belong to their ancestor at [`COLLECTION_DEPTH`]. Files outside
/// that layout belong to their parent.
pub fn collection_directory(root: &Path, file: &Path) -> PathBuf {
    match file.strip_prefix(root) {
        Ok(relative) if relative.components().count() > COLLECTION_DEPTH + 1 => root.join(
            relative
                .components()
                .take(COLLECTION_DEPTH)
                .collect::<PathBuf>(),
        ),
        _ => file.parent().unwrap_or(root).to_path_buf(),
    }
}

pub fn relative_segments(root: &Path, path: &Path) -> Vec<String> {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect()
}
