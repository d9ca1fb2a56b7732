//! Known-face registry built from a labelled dataset directory.
//!
//! Layout: `<root>/<prefix>_<user_id>/*.{jpg,jpeg,png}`, one face per image.
//! An optional `<root>/manifest.toml` maps folders to user ids explicitly:
//!
//! ```toml
//! [[user]]
//! id = 7
//! folder = "user_7"
//! ```
//!
//! Reloads build a fresh [`Snapshot`] off to the side and swap it in whole,
//! so readers holding the previous `Arc<Snapshot>` are never disturbed.

use crate::embedder::FaceEmbedder;
use crate::types::{KnownFace, Snapshot};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.toml";

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid dataset layout: {0}")]
    InvalidDatasetLayout(String),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Recoverable problem met during a reload. The offending item is skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryWarning {
    DatasetUnavailable { path: PathBuf, reason: String },
    InvalidDatasetLayout { folder: PathBuf, reason: String },
    NoFaceDetected { image: PathBuf },
    UnreadableImage { image: PathBuf, reason: String },
}

impl fmt::Display for RegistryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DatasetUnavailable { path, reason } => {
                write!(f, "dataset directory unavailable: {}: {reason}", path.display())
            }
            Self::InvalidDatasetLayout { folder, reason } => {
                write!(f, "skipped folder {}: {reason}", folder.display())
            }
            Self::NoFaceDetected { image } => write!(f, "no face detected in {}", image.display()),
            Self::UnreadableImage { image, reason } => {
                write!(f, "unreadable image {}: {reason}", image.display())
            }
        }
    }
}

/// Summary of a completed reload.
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    /// Embeddings now in the registry.
    pub loaded: usize,
    /// Distinct users now in the registry.
    pub users: usize,
    pub warnings: Vec<RegistryWarning>,
}

/// A per-user dataset folder and the id it resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserFolder {
    pub user_id: i64,
    pub path: PathBuf,
}

/// Result of resolving the dataset layout, before any image is read.
#[derive(Debug, Clone, Default)]
pub struct DatasetScan {
    pub folders: Vec<UserFolder>,
    pub warnings: Vec<RegistryWarning>,
    /// Whether a manifest drove the mapping.
    pub from_manifest: bool,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "user")]
    users: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: i64,
    folder: String,
}

/// Parse the user id from a `prefix_<id>` folder name.
pub fn parse_user_id(folder_name: &str) -> Option<i64> {
    let (prefix, suffix) = folder_name.rsplit_once('_')?;
    if prefix.is_empty() || suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Resolve the per-user folders under `root`.
///
/// With a manifest, only listed folders are used and the manifest itself is
/// validated. Without one, ids come from folder names. In strict mode any
/// folder that cannot be mapped fails the scan instead of being skipped.
pub fn scan_dataset(root: &Path, strict: bool) -> Result<DatasetScan, RegistryError> {
    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(root).map_err(|source| RegistryError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let manifest_path = root.join(MANIFEST_FILE);
    if manifest_path.is_file() {
        scan_with_manifest(&manifest_path, root, &dirs, strict)
    } else {
        scan_folder_names(&dirs, strict)
    }
}

fn scan_folder_names(dirs: &[PathBuf], strict: bool) -> Result<DatasetScan, RegistryError> {
    let mut scan = DatasetScan::default();
    let mut seen = HashSet::new();

    for dir in dirs {
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let problem = match parse_user_id(name) {
            Some(user_id) if seen.insert(user_id) => {
                scan.folders.push(UserFolder {
                    user_id,
                    path: dir.clone(),
                });
                continue;
            }
            Some(user_id) => format!("user id {user_id} already used by another folder"),
            None => "folder name does not end in _<user id>".to_string(),
        };

        if strict {
            return Err(RegistryError::InvalidDatasetLayout(format!(
                "{}: {problem}",
                dir.display()
            )));
        }
        tracing::warn!(folder = %dir.display(), reason = %problem, "dataset folder skipped");
        scan.warnings.push(RegistryWarning::InvalidDatasetLayout {
            folder: dir.clone(),
            reason: problem,
        });
    }

    Ok(scan)
}

fn scan_with_manifest(
    manifest_path: &Path,
    root: &Path,
    dirs: &[PathBuf],
    strict: bool,
) -> Result<DatasetScan, RegistryError> {
    let text = std::fs::read_to_string(manifest_path).map_err(|source| RegistryError::Io {
        path: manifest_path.to_path_buf(),
        source,
    })?;
    let manifest: Manifest = toml::from_str(&text).map_err(|e| {
        RegistryError::InvalidDatasetLayout(format!("{}: {e}", manifest_path.display()))
    })?;

    let mut scan = DatasetScan {
        from_manifest: true,
        ..DatasetScan::default()
    };
    let mut ids = HashSet::new();
    let mut listed = HashSet::new();

    for entry in manifest.users {
        if !ids.insert(entry.id) {
            return Err(RegistryError::InvalidDatasetLayout(format!(
                "manifest lists user id {} more than once",
                entry.id
            )));
        }
        let path = root.join(&entry.folder);
        if !listed.insert(path.clone()) {
            return Err(RegistryError::InvalidDatasetLayout(format!(
                "manifest lists folder {} more than once",
                entry.folder
            )));
        }
        if !path.is_dir() {
            return Err(RegistryError::InvalidDatasetLayout(format!(
                "manifest folder {} for user {} does not exist",
                entry.folder, entry.id
            )));
        }
        scan.folders.push(UserFolder {
            user_id: entry.id,
            path,
        });
    }

    for dir in dirs.iter().filter(|d| !listed.contains(*d)) {
        if strict {
            return Err(RegistryError::InvalidDatasetLayout(format!(
                "{} is not listed in the manifest",
                dir.display()
            )));
        }
        tracing::warn!(folder = %dir.display(), "dataset folder not in manifest; skipped");
        scan.warnings.push(RegistryWarning::InvalidDatasetLayout {
            folder: dir.clone(),
            reason: "not listed in the manifest".into(),
        });
    }

    Ok(scan)
}

fn list_images(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(folder)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Owned, explicitly reloadable set of known faces.
pub struct KnownFaceRegistry {
    dataset_root: PathBuf,
    strict: bool,
    current: RwLock<Arc<Snapshot>>,
    reload_gate: Mutex<()>,
}

impl KnownFaceRegistry {
    /// An empty registry over `dataset_root`. Nothing is read until [`reload`](Self::reload).
    pub fn new(dataset_root: impl Into<PathBuf>) -> Self {
        Self {
            dataset_root: dataset_root.into(),
            strict: false,
            current: RwLock::new(Arc::new(Snapshot::default())),
            reload_gate: Mutex::new(()),
        }
    }

    /// Fail reloads on any layout problem instead of skipping the folder.
    pub fn with_strict_layout(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn dataset_root(&self) -> &Path {
        &self.dataset_root
    }

    /// The view installed by the most recent completed reload.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn loaded_users(&self) -> Vec<i64> {
        self.snapshot().user_ids().iter().copied().collect()
    }

    fn install(&self, snapshot: Snapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// Rebuild the registry from disk.
    ///
    /// Concurrent reloads are serialized. On error the previous snapshot
    /// stays in place.
    pub fn reload<E>(&self, embedder: &mut E) -> Result<ReloadReport, RegistryError>
    where
        E: FaceEmbedder + ?Sized,
    {
        let _gate = self.reload_gate.lock().unwrap_or_else(PoisonError::into_inner);

        let scan = match scan_dataset(&self.dataset_root, self.strict) {
            Ok(scan) => scan,
            Err(RegistryError::Io { path, source }) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %source,
                    "dataset directory unavailable; registry left empty"
                );
                self.install(Snapshot::default());
                return Ok(ReloadReport {
                    warnings: vec![RegistryWarning::DatasetUnavailable {
                        path,
                        reason: source.to_string(),
                    }],
                    ..ReloadReport::default()
                });
            }
            Err(e) => return Err(e),
        };

        let mut warnings = scan.warnings;
        let mut faces = Vec::new();

        for folder in &scan.folders {
            let images = match list_images(&folder.path) {
                Ok(images) => images,
                Err(e) => {
                    tracing::warn!(folder = %folder.path.display(), error = %e, "cannot list user folder");
                    warnings.push(RegistryWarning::InvalidDatasetLayout {
                        folder: folder.path.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            for image_path in images {
                let image = match image::open(&image_path) {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::warn!(image = %image_path.display(), error = %e, "cannot decode image");
                        warnings.push(RegistryWarning::UnreadableImage {
                            image: image_path,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                match embedder.detect(&image) {
                    Ok(detections) => match detections.into_iter().next() {
                        Some(first) => {
                            tracing::debug!(
                                image = %image_path.display(),
                                user_id = folder.user_id,
                                "known face loaded"
                            );
                            faces.push(KnownFace {
                                user_id: folder.user_id,
                                embedding: first.embedding,
                            });
                        }
                        None => {
                            tracing::warn!(image = %image_path.display(), "no face found in dataset image");
                            warnings.push(RegistryWarning::NoFaceDetected { image: image_path });
                        }
                    },
                    Err(e) => {
                        tracing::warn!(image = %image_path.display(), error = %e, "face encoding failed");
                        warnings.push(RegistryWarning::UnreadableImage {
                            image: image_path,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let snapshot = Snapshot::new(faces);
        let report = ReloadReport {
            loaded: snapshot.len(),
            users: snapshot.user_ids().len(),
            warnings,
        };
        self.install(snapshot);

        tracing::info!(
            loaded = report.loaded,
            users = report.users,
            warnings = report.warnings.len(),
            manifest = scan.from_manifest,
            "known faces reloaded"
        );
        Ok(report)
    }
}
