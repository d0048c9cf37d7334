use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::CatalogName;
use crate::error::CutoutError;

pub const RAW_CATALOG_FILE: &str = "raw.csv";
pub const FILTERED_CATALOG_FILE: &str = "filtered.csv.gz";

#[derive(Debug, Clone)]
pub struct Store {
    project_root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, CutoutError> {
        let cwd =
            std::env::current_dir().map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        let project_root = Utf8PathBuf::from_path_buf(cwd.join(".zoo-cutouts"))
            .map_err(|_| CutoutError::Filesystem("invalid project path".to_string()))?;

        let cache_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("zoo-cutouts")).ok()
            })
            .ok_or_else(|| {
                CutoutError::Filesystem("unable to resolve cache directory".to_string())
            })?;

        Ok(Self {
            project_root,
            cache_root,
        })
    }

    pub fn new_with_paths(project_root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Self {
        Self {
            project_root,
            cache_root,
        }
    }

    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn project_catalog_dir(&self, name: &CatalogName) -> Utf8PathBuf {
        self.project_root.join("catalogs").join(name.as_str())
    }

    /// Query results are shared between projects through the cache root.
    pub fn cache_raw_catalog_path(&self, name: &CatalogName) -> Utf8PathBuf {
        self.cache_root
            .join("catalogs")
            .join(name.as_str())
            .join(RAW_CATALOG_FILE)
    }

    pub fn project_raw_catalog_path(&self, name: &CatalogName) -> Utf8PathBuf {
        self.project_catalog_dir(name).join(RAW_CATALOG_FILE)
    }

    pub fn project_filtered_catalog_path(&self, name: &CatalogName) -> Utf8PathBuf {
        self.project_catalog_dir(name).join(FILTERED_CATALOG_FILE)
    }

    pub fn project_archive_path(&self, file_name: &str) -> Utf8PathBuf {
        self.project_root.join("archives").join(file_name)
    }

    pub fn project_metadata_path(&self, kind: &str, name: &str) -> Utf8PathBuf {
        self.project_root
            .join("metadata")
            .join(kind)
            .join(format!("{name}.json"))
    }

    pub fn ensure_project_root(&self) -> Result<(), CutoutError> {
        fs::create_dir_all(self.project_root.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))
    }

    pub fn ensure_parent(path: &Utf8Path) -> Result<(), CutoutError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn exists(path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn clear_project(&self) -> Result<(), CutoutError> {
        if self.project_root.as_std_path().exists() {
            fs::remove_dir_all(self.project_root.as_std_path())
                .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn clear_cache(&self) -> Result<(), CutoutError> {
        if self.cache_root.as_std_path().exists() {
            fs::remove_dir_all(self.cache_root.as_std_path())
                .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn write_metadata(path: &Utf8Path, metadata: &Metadata) -> Result<(), CutoutError> {
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    /// Writes through a temp file in the destination directory, then persists
    /// it over the target so readers never observe a partial file.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CutoutError> {
        let parent = path
            .parent()
            .ok_or_else(|| CutoutError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("zoo-cutouts-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        std::io::Write::write_all(&mut temp, content)
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), CutoutError> {
        let content = fs::read(source.as_std_path())
            .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(dest, &content)
    }

    pub fn list_metadata(root: &Utf8Path) -> Result<Vec<Metadata>, CutoutError> {
        let metadata_root = root.join("metadata");
        if !metadata_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for path in walk_dir(metadata_root.as_std_path())? {
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let content = fs::read_to_string(&path)
                    .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
                let metadata: Metadata = serde_json::from_str(&content)
                    .map_err(|err| CutoutError::Filesystem(err.to_string()))?;
                entries.push(metadata);
            }
        }
        entries.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        Ok(entries)
    }
}

/// Provenance record written next to every artifact the tool produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub source: String,
    /// `catalog`, `filtered`, `archive` or `model`.
    pub kind: String,
    pub name: String,
    pub rows: Option<usize>,
    pub created_at: String,
    pub tool: String,
    pub resolved_path: String,
}

impl Metadata {
    pub fn new(source: &str, kind: &str, name: &str, path: &Utf8Path) -> Self {
        Self {
            source: source.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            rows: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            tool: format!("zoo-cutouts/{}", env!("CARGO_PKG_VERSION")),
            resolved_path: path.to_string(),
        }
    }

    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = Some(rows);
        self
    }
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, CutoutError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| CutoutError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| CutoutError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new_with_paths(
            Utf8PathBuf::from("/work/.zoo-cutouts"),
            Utf8PathBuf::from("/home/u/.cache/zoo-cutouts"),
        );
        let name: CatalogName = "zoospec".parse().unwrap();

        assert!(store
            .project_filtered_catalog_path(&name)
            .ends_with("catalogs/zoospec/filtered.csv.gz"));
        assert!(store
            .cache_raw_catalog_path(&name)
            .starts_with("/home/u/.cache/zoo-cutouts"));
        assert!(store
            .project_metadata_path("archive", "images")
            .ends_with("metadata/archive/images.json"));
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("nested").join("out.bin");
        Store::write_bytes_atomic(&path, b"one").unwrap();
        Store::write_bytes_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"two".to_vec());
    }
}
