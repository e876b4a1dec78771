//! Project working directories and the file operations sessions perform on
//! them. Every path a client sends is project-relative and is checked before
//! it touches the filesystem.

use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Directories never listed in a project tree.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

#[derive(Debug, Error)]
pub enum FileError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FileError {
    fn from_io(path: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FileError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => FileError::AlreadyExists(path.to_string()),
            _ => FileError::Io(e),
        }
    }
}

/// Normalize a client path into a relative path with no `.`/`..` parts.
///
/// A single leading `/` is tolerated because editors send paths rooted at the
/// project; anything that would climb out of the project is rejected.
pub fn normalize_relative(path: &str) -> Result<PathBuf, FileError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(FileError::InvalidPath("empty path".to_string()));
    }
    if trimmed.contains('\0') {
        return Err(FileError::InvalidPath(path.to_string()));
    }
    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FileError::InvalidPath(path.to_string()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(FileError::InvalidPath(path.to_string()));
    }
    Ok(out)
}

/// Canonical `/`-separated form of a client path. Lock keys, rooms and the
/// filesystem all use this form, so `a.txt`, `./a.txt` and `/a.txt` name the
/// same file everywhere.
pub fn canonical_path(path: &str) -> Result<String, FileError> {
    let rel = normalize_relative(path)?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Entry in a project tree listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    /// Path relative to the project directory, `/`-separated.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

/// Parent of all per-project working directories.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Working directory of a project. `project_id` must already be validated.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id)
    }

    pub async fn ensure_project_dir(&self, project_id: &str) -> Result<PathBuf, FileError> {
        let dir = self.project_dir(project_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Absolute location of `path` inside a project. Existing components
    /// must not be symbolic links, since sandbox users can create them.
    async fn resolve(&self, project_id: &str, path: &str) -> Result<PathBuf, FileError> {
        let rel = normalize_relative(path)?;
        let mut full = self.project_dir(project_id);
        for part in rel.components() {
            full.push(part);
            match tokio::fs::symlink_metadata(&full).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(FileError::InvalidPath(format!(
                        "{path}: symbolic links are not followed"
                    )));
                }
                Ok(_) => {}
                // Nothing below a missing component exists yet.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(self.project_dir(project_id).join(rel));
                }
                Err(e) => return Err(FileError::Io(e)),
            }
        }
        Ok(full)
    }

    /// Read a file as lossy UTF-8 together with its extension (`.ts`, or
    /// empty when there is none).
    pub async fn read(&self, project_id: &str, path: &str) -> Result<(String, String), FileError> {
        let full = self.resolve(project_id, path).await?;
        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| FileError::from_io(path, e))?;
        let extension = full
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Ok((String::from_utf8_lossy(&bytes).into_owned(), extension))
    }

    /// Replace a file's contents, creating parent directories as needed.
    pub async fn write(&self, project_id: &str, path: &str, data: &str) -> Result<(), FileError> {
        let full = self.resolve(project_id, path).await?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| FileError::from_io(path, e))?;
        debug!(project_id, path, bytes = data.len(), "file written");
        Ok(())
    }

    /// Create an empty file; fails if it already exists.
    pub async fn create_file(&self, project_id: &str, path: &str) -> Result<(), FileError> {
        let full = self.resolve(project_id, path).await?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
            .map_err(|e| FileError::from_io(path, e))?;
        Ok(())
    }

    pub async fn delete_file(&self, project_id: &str, path: &str) -> Result<(), FileError> {
        let full = self.resolve(project_id, path).await?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| FileError::from_io(path, e))
    }

    pub async fn create_folder(&self, project_id: &str, path: &str) -> Result<(), FileError> {
        let full = self.resolve(project_id, path).await?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| FileError::from_io(path, e))
    }

    /// Remove a folder and everything below it.
    pub async fn delete_folder(&self, project_id: &str, path: &str) -> Result<(), FileError> {
        let full = self.resolve(project_id, path).await?;
        tokio::fs::remove_dir_all(&full)
            .await
            .map_err(|e| FileError::from_io(path, e))
    }

    /// Directory tree of a project, folders first then by name.
    pub async fn tree(&self, project_id: &str) -> Result<Vec<TreeNode>, FileError> {
        let dir = self.project_dir(project_id);
        tokio::task::spawn_blocking(move || {
            if !dir.is_dir() {
                return Ok(Vec::new());
            }
            walk(&dir, Path::new(""))
        })
        .await
        .map_err(|e| FileError::Io(io::Error::other(e)))?
    }
}

fn walk(dir: &Path, rel: &Path) -> Result<Vec<TreeNode>, FileError> {
    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        let child_rel = rel.join(&name);
        let path = child_rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if file_type.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            nodes.push(TreeNode {
                name,
                path,
                kind: NodeKind::Folder,
                children: walk(&entry.path(), &child_rel)?,
            });
        } else if file_type.is_file() {
            nodes.push(TreeNode {
                name,
                path,
                kind: NodeKind::File,
                children: Vec::new(),
            });
        }
    }
    nodes.sort_by(|a, b| {
        (a.kind != NodeKind::Folder, &a.name).cmp(&(b.kind != NodeKind::Folder, &b.name))
    });
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_relative_and_rooted_paths() {
        assert_eq!(normalize_relative("src/a.rs").unwrap(), PathBuf::from("src/a.rs"));
        assert_eq!(normalize_relative("/src/./a.rs").unwrap(), PathBuf::from("src/a.rs"));
    }

    #[test]
    fn normalize_rejects_escapes() {
        for bad in ["", "/", "..", "a/../../b", "//etc/passwd", "a\0b", "./"] {
            assert!(
                matches!(normalize_relative(bad), Err(FileError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn equivalent_spellings_share_one_canonical_path() {
        for spelling in ["a.txt", "./a.txt", "/a.txt", "/./a.txt"] {
            assert_eq!(canonical_path(spelling).unwrap(), "a.txt", "{spelling:?}");
        }
        assert_eq!(canonical_path("src//lib/./a.rs").unwrap(), "src/lib/a.rs");
        assert!(canonical_path("../a.txt").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_inside_project_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let project = ws.ensure_project_dir("p1").await.unwrap();
        std::fs::write(outside.path().join("secret.txt"), "host data").unwrap();
        std::os::unix::fs::symlink(outside.path(), project.join("escape")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            project.join("link.txt"),
        )
        .unwrap();

        let escaped = ws.write("p1", "escape/planted.txt", "x").await;
        assert!(matches!(escaped, Err(FileError::InvalidPath(_))));
        assert!(!outside.path().join("planted.txt").exists());

        assert!(matches!(ws.read("p1", "escape/secret.txt").await, Err(FileError::InvalidPath(_))));
        assert!(matches!(ws.read("p1", "link.txt").await, Err(FileError::InvalidPath(_))));
        assert!(matches!(ws.delete_folder("p1", "escape").await, Err(FileError::InvalidPath(_))));
        assert!(outside.path().join("secret.txt").exists());

        // Ordinary paths next to the links still work.
        ws.write("p1", "src/ok.txt", "fine").await.unwrap();
        assert_eq!(ws.read("p1", "src/ok.txt").await.unwrap().0, "fine");
    }

    #[tokio::test]
    async fn write_then_read_reports_extension() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write("p1", "src/main.ts", "let x = 1;").await.unwrap();
        let (value, ext) = ws.read("p1", "src/main.ts").await.unwrap();
        assert_eq!(value, "let x = 1;");
        assert_eq!(ext, ".ts");
    }

    #[tokio::test]
    async fn create_file_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.create_file("p1", "a/b.txt").await.unwrap();
        assert!(matches!(
            ws.create_file("p1", "a/b.txt").await,
            Err(FileError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        assert!(matches!(ws.read("p1", "nope").await, Err(FileError::NotFound(_))));
        assert!(matches!(ws.delete_file("p1", "nope").await, Err(FileError::NotFound(_))));
    }

    #[tokio::test]
    async fn folders_are_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.create_folder("p1", "a/b/c").await.unwrap();
        ws.write("p1", "a/b/c/d.txt", "x").await.unwrap();
        ws.delete_folder("p1", "a").await.unwrap();
        assert!(!ws.project_dir("p1").join("a").exists());
    }

    #[tokio::test]
    async fn tree_lists_folders_first_and_skips_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.write("p1", "b.txt", "").await.unwrap();
        ws.write("p1", "src/a.rs", "").await.unwrap();
        ws.write("p1", "node_modules/x/index.js", "").await.unwrap();

        let tree = ws.tree("p1").await.unwrap();
        let names: Vec<_> = tree.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["src", "b.txt"]);
        assert_eq!(tree[0].kind, NodeKind::Folder);
        assert_eq!(tree[0].children[0].path, "src/a.rs");
        assert!(ws.tree("missing").await.unwrap().is_empty());
    }
}
