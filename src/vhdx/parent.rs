//! Parent chain of a differencing disk.
//!
//! The chain is flattened into an owned vector ordered child-to-root. Every
//! layer is opened read-only and is never written through.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use uuid::Uuid;

use super::file::VhdxFile;
use super::metadata::ParentLocator;
use super::storage::{FileAccess, Storage};
use crate::error::{DiskError, Result};

/// Deepest parent chain accepted.
pub(crate) const MAX_CHAIN_DEPTH: usize = 64;

/// Owned, read-only parent layers of a differencing disk, nearest first.
pub struct ParentChain {
    layers: Vec<VhdxFile<Box<dyn Storage>>>,
}

impl ParentChain {
    pub fn empty() -> Self {
        Self { layers: Vec::new() }
    }

    /// Opens already-located parents, nearest first, read-only.
    pub fn from_storages<I>(storages: I) -> Result<Self>
    where
        I: IntoIterator<Item = Box<dyn Storage>>,
    {
        let layers = storages
            .into_iter()
            .map(|storage| VhdxFile::open(storage, FileAccess::Read))
            .collect::<Result<Vec<_>>>()?;
        if layers.len() > MAX_CHAIN_DEPTH {
            return Err(DiskError::format(format!(
                "parent chain deeper than {MAX_CHAIN_DEPTH}"
            )));
        }
        Ok(Self { layers })
    }

    /// Opens parents from file paths, nearest first.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut layers = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let storage: Box<dyn Storage> = Box::new(File::open(path)?);
            layers.push(VhdxFile::open(storage, FileAccess::Read)?.with_path(path));
        }
        if layers.len() > MAX_CHAIN_DEPTH {
            return Err(DiskError::format(format!(
                "parent chain deeper than {MAX_CHAIN_DEPTH}"
            )));
        }
        Ok(Self { layers })
    }

    /// Puts `parent` in front of the chain.
    pub(crate) fn with_nearest(mut self, parent: VhdxFile<Box<dyn Storage>>) -> Self {
        self.layers.insert(0, parent);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Paths of the layers, where known.
    pub fn paths(&self) -> Vec<Option<PathBuf>> {
        self.layers
            .iter()
            .map(|l| l.path().map(Path::to_path_buf))
            .collect()
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [VhdxFile<Box<dyn Storage>>] {
        &mut self.layers
    }

    /// Resolves the parents of `child` from its locator, recursively.
    pub(crate) fn resolve<S: Storage>(child: &VhdxFile<S>) -> Result<Self> {
        let mut layers: Vec<VhdxFile<Box<dyn Storage>>> = Vec::new();
        let mut locator = child
            .metadata()
            .parent_locator
            .clone()
            .ok_or_else(|| DiskError::format("differencing disk without parent locator"))?;
        let mut base_dir = child.path().and_then(Path::parent).map(Path::to_path_buf);
        let mut below_capacity = child.capacity();

        loop {
            if layers.len() >= MAX_CHAIN_DEPTH {
                return Err(DiskError::format(format!(
                    "parent chain deeper than {MAX_CHAIN_DEPTH}"
                )));
            }
            let parent = open_parent(&locator, base_dir.as_deref())?;
            if parent.capacity() < below_capacity {
                return Err(DiskError::ParentSizeMismatch {
                    parent: parent.capacity(),
                    child: below_capacity,
                });
            }
            below_capacity = parent.capacity();
            base_dir = parent.path().and_then(Path::parent).map(Path::to_path_buf);
            let next = if parent.has_parent() {
                parent.metadata().parent_locator.clone()
            } else {
                None
            };
            layers.push(parent);
            match next {
                Some(next) => locator = next,
                None => break,
            }
        }
        debug!("Resolved parent chain of depth {}", layers.len());
        Ok(Self { layers })
    }

    /// Checks an injected chain against the child it is attached to.
    pub(crate) fn validate_for<S: Storage>(&self, child: &VhdxFile<S>) -> Result<()> {
        if child.has_parent() && self.layers.is_empty() {
            return Err(DiskError::ParentNotFound(
                "no parent supplied for differencing disk".into(),
            ));
        }
        let mut below_capacity = child.capacity();
        let mut below_locator = child.metadata().parent_locator.as_ref();
        for layer in &self.layers {
            if layer.capacity() < below_capacity {
                return Err(DiskError::ParentSizeMismatch {
                    parent: layer.capacity(),
                    child: below_capacity,
                });
            }
            if let Some(locator) = below_locator {
                let linkages = linkages(locator);
                if !linkages.is_empty() && !linkages.contains(&layer.header().data_write_guid) {
                    warn!(
                        "Supplied parent {} does not match the child's linkage",
                        layer.header().data_write_guid
                    );
                }
            }
            below_capacity = layer.capacity();
            below_locator = layer.metadata().parent_locator.as_ref();
        }
        Ok(())
    }
}

impl std::fmt::Debug for ParentChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentChain")
            .field("depth", &self.layers.len())
            .field("paths", &self.paths())
            .finish()
    }
}

fn linkages(locator: &ParentLocator) -> Vec<Uuid> {
    [ParentLocator::PARENT_LINKAGE, ParentLocator::PARENT_LINKAGE2]
        .into_iter()
        .filter_map(|key| locator.linkage(key))
        .collect()
}

/// Turns a stored locator path into a local path.
fn candidate_path(key: &str, value: &str, base_dir: Option<&Path>) -> PathBuf {
    let native = if cfg!(windows) {
        value.to_string()
    } else {
        value.replace('\\', "/")
    };
    if key != ParentLocator::RELATIVE_PATH {
        return PathBuf::from(native);
    }
    let relative = native.strip_prefix("./").unwrap_or(&native);
    match base_dir {
        Some(dir) => dir.join(relative),
        None => PathBuf::from(relative),
    }
}

/// Tries the locator paths in order and opens the first parent whose data
/// write GUID matches the linkage.
fn open_parent(locator: &ParentLocator, base_dir: Option<&Path>) -> Result<VhdxFile<Box<dyn Storage>>> {
    let linkages = linkages(locator);
    if linkages.is_empty() {
        warn!("Parent locator carries no linkage, accepting the first parent found");
    }
    let mut tried = Vec::new();
    for key in [
        ParentLocator::RELATIVE_PATH,
        ParentLocator::VOLUME_PATH,
        ParentLocator::ABSOLUTE_WIN32_PATH,
    ] {
        let Some(value) = locator.get(key) else {
            continue;
        };
        let path = candidate_path(key, value, base_dir);
        tried.push(path.display().to_string());
        if !path.is_file() {
            debug!("Parent candidate {} ({}) does not exist", path.display(), key);
            continue;
        }
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Parent candidate {} unreadable: {}", path.display(), e);
                continue;
            }
        };
        let storage: Box<dyn Storage> = Box::new(file);
        let layer = match VhdxFile::open(storage, FileAccess::Read) {
            Ok(layer) => layer.with_path(&path),
            Err(e) => {
                warn!("Parent candidate {} is not a usable VHDX: {}", path.display(), e);
                continue;
            }
        };
        let guid = layer.header().data_write_guid;
        if !linkages.is_empty() && !linkages.contains(&guid) {
            warn!(
                "Parent candidate {} has data write GUID {}, expected {:?}; skipping",
                path.display(),
                guid,
                linkages
            );
            continue;
        }
        info!("Resolved parent {} through {}", path.display(), key);
        return Ok(layer);
    }
    Err(DiskError::ParentNotFound(if tried.is_empty() {
        "parent locator has no path entry".into()
    } else {
        tried.join(", ")
    }))
}
