//! `DiskImageFile`: a VHDX container opened or created as a virtual disk.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::file::VhdxFile;
use super::header::Header;
use super::metadata::{
    resolve_block_size, validate_sector_size, FileParameters, Metadata, ParentLocator,
    DEFAULT_BLOCK_SIZE, DEFAULT_DIFFERENCING_BLOCK_SIZE, DEFAULT_LOGICAL_SECTOR_SIZE,
    DEFAULT_PHYSICAL_SECTOR_SIZE, MAX_DISK_SIZE,
};
use super::parent::ParentChain;
use super::region::RegionEntry;
use super::storage::{FileAccess, Ownership, Storage};
use super::stream::ContentStream;
use super::{
    EXTENDED_PARAMETER_KEY_BLOCK_SIZE, EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE,
    EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE,
};
use crate::error::{DiskError, Result};
use crate::progress::ProgressSink;

/// Allocation strategy of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

/// Creation parameters of a VHDX container.
///
/// Unset values take the defaults: 32 MiB blocks, 4096-byte physical and
/// 512-byte logical sectors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskParameters {
    pub capacity: u64,
    pub block_size: Option<u32>,
    pub physical_sector_size: Option<u32>,
    pub logical_sector_size: Option<u32>,
}

fn parse_extended(
    extended: &BTreeMap<String, String>,
    key: &'static str,
) -> Result<Option<u32>> {
    match extended.get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| DiskError::InvalidArgument(key)),
    }
}

impl DiskParameters {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Reads the `VHDX.*` entries of a generic extended parameter bag.
    /// Values must be decimal integers; unknown `VHDX.*` keys are ignored.
    pub fn from_extended(capacity: u64, extended: &BTreeMap<String, String>) -> Result<Self> {
        for key in extended.keys() {
            let known = [
                EXTENDED_PARAMETER_KEY_BLOCK_SIZE,
                EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE,
                EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE,
            ];
            if key.starts_with("VHDX.") && !known.contains(&key.as_str()) {
                warn!("Ignoring unknown extended parameter {}", key);
            }
        }
        Ok(Self {
            capacity,
            block_size: parse_extended(extended, EXTENDED_PARAMETER_KEY_BLOCK_SIZE)?,
            physical_sector_size: parse_extended(
                extended,
                EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE,
            )?,
            logical_sector_size: parse_extended(
                extended,
                EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE,
            )?,
        })
    }

    /// The set values as `VHDX.*` extended parameters.
    pub fn to_extended(&self) -> BTreeMap<String, String> {
        [
            (EXTENDED_PARAMETER_KEY_BLOCK_SIZE, self.block_size),
            (
                EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE,
                self.physical_sector_size,
            ),
            (
                EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE,
                self.logical_sector_size,
            ),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), v.to_string())))
        .collect()
    }

    /// Checks the parameters without touching any storage.
    pub fn validate(&self) -> Result<()> {
        self.resolve(false).map(|_| ())
    }

    /// Validates the parameters and fills in defaults, before anything is
    /// written.
    fn resolve(&self, fixed: bool) -> Result<Metadata> {
        let logical = validate_sector_size(
            self.logical_sector_size
                .unwrap_or(DEFAULT_LOGICAL_SECTOR_SIZE),
            "logicalSectorSize",
        )?;
        let physical = validate_sector_size(
            self.physical_sector_size
                .unwrap_or(DEFAULT_PHYSICAL_SECTOR_SIZE),
            "physicalSectorSize",
        )?;
        if self.capacity == 0
            || self.capacity > MAX_DISK_SIZE
            || self.capacity % logical as u64 != 0
        {
            return Err(DiskError::InvalidArgument("capacity"));
        }
        let block_size = resolve_block_size(self.block_size, DEFAULT_BLOCK_SIZE)?;
        Ok(Metadata {
            file_parameters: FileParameters {
                block_size,
                leave_blocks_allocated: fixed,
                has_parent: false,
            },
            disk_size: self.capacity,
            page83: Uuid::new_v4(),
            logical_sector_size: logical,
            physical_sector_size: physical,
            parent_locator: None,
        })
    }
}

/// Serializable summary of an opened container.
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    pub disk_type: DiskType,
    pub capacity: u64,
    pub block_size: u32,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub is_sparse: bool,
    pub page83: Uuid,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    pub creator: String,
    pub total_blocks: u64,
    pub allocated_blocks: u64,
    pub replayed_log_entries: usize,
    pub regions: Vec<RegionEntry>,
    pub parent_locator: Option<ParentLocator>,
    pub parent_chain: Vec<Option<PathBuf>>,
}

/// A VHDX virtual disk.
///
/// Dropping the disk closes the write session on a best-effort basis; use
/// [`DiskImageFile::close`] to observe errors.
pub struct DiskImageFile<S: Storage> {
    file: VhdxFile<S>,
    parents: ParentChain,
    ownership: Ownership,
    closed: bool,
}

impl<S: Storage> DiskImageFile<S> {
    fn create(
        storage: S,
        ownership: Ownership,
        params: &DiskParameters,
        fixed: bool,
        progress: Option<&mut dyn ProgressSink>,
    ) -> Result<Self> {
        let metadata = params.resolve(fixed)?;
        let file = VhdxFile::create(storage, metadata, progress)?;
        Ok(Self {
            file,
            parents: ParentChain::empty(),
            ownership,
            closed: false,
        })
    }

    /// Creates a fixed disk: every block is allocated and the data region is
    /// zero-filled, so the file is exactly data-start + capacity long.
    /// `progress` sees 0 first and `capacity` last.
    pub fn initialize_fixed(
        storage: S,
        ownership: Ownership,
        capacity: u64,
        block_size: Option<u32>,
        physical_sector_size: Option<u32>,
        logical_sector_size: Option<u32>,
        progress: Option<&mut dyn ProgressSink>,
    ) -> Result<Self> {
        let params = DiskParameters {
            capacity,
            block_size,
            physical_sector_size,
            logical_sector_size,
        };
        Self::create(storage, ownership, &params, true, progress)
    }

    /// Creates a dynamic disk: no block is allocated and the file ends where
    /// the data region starts.
    pub fn initialize_dynamic(
        storage: S,
        ownership: Ownership,
        capacity: u64,
        block_size: Option<u32>,
        physical_sector_size: Option<u32>,
        logical_sector_size: Option<u32>,
        progress: Option<&mut dyn ProgressSink>,
    ) -> Result<Self> {
        let params = DiskParameters {
            capacity,
            block_size,
            physical_sector_size,
            logical_sector_size,
        };
        Self::create(storage, ownership, &params, false, progress)
    }

    /// Creates a fixed or dynamic disk from a parameter set.
    pub fn initialize(
        storage: S,
        ownership: Ownership,
        disk_type: DiskType,
        params: &DiskParameters,
        progress: Option<&mut dyn ProgressSink>,
    ) -> Result<Self> {
        match disk_type {
            DiskType::Fixed => Self::create(storage, ownership, params, true, progress),
            DiskType::Dynamic => Self::create(storage, ownership, params, false, progress),
            DiskType::Differencing => Err(DiskError::InvalidArgument("diskType")),
        }
    }

    /// Creates a differencing disk on top of the VHDX at `parent_path`.
    /// Capacity and sector sizes come from the parent; blocks are 2 MiB.
    pub fn initialize_differencing(
        storage: S,
        ownership: Ownership,
        child_path: &Path,
        parent_path: &Path,
    ) -> Result<Self> {
        let parent_storage: Box<dyn Storage> = Box::new(File::open(parent_path)?);
        let parent = VhdxFile::open(parent_storage, FileAccess::Read)?.with_path(parent_path);
        let ancestors = if parent.has_parent() {
            ParentChain::resolve(&parent)?
        } else {
            ParentChain::empty()
        };

        let absolute = std::fs::canonicalize(parent_path)?;
        let relative = relative_locator_path(child_path, &absolute);
        let locator = ParentLocator::new(
            &parent.header().data_write_guid,
            relative.as_deref(),
            &absolute.to_string_lossy(),
        );
        let parent_meta = parent.metadata();
        let metadata = Metadata {
            file_parameters: FileParameters {
                block_size: DEFAULT_DIFFERENCING_BLOCK_SIZE,
                leave_blocks_allocated: false,
                has_parent: true,
            },
            disk_size: parent_meta.disk_size,
            page83: Uuid::new_v4(),
            logical_sector_size: parent_meta.logical_sector_size,
            physical_sector_size: parent_meta.physical_sector_size,
            parent_locator: Some(locator),
        };

        let file = VhdxFile::create(storage, metadata, None)?.with_path(child_path);
        Ok(Self {
            file,
            parents: ancestors.with_nearest(parent),
            ownership,
            closed: false,
        })
    }

    /// Opens a container, replaying its log and resolving its parents.
    pub fn open(storage: S, access: FileAccess) -> Result<Self> {
        Self::from_file(VhdxFile::open(storage, access)?)
    }

    /// Opens a container whose parent chain the caller has already opened.
    pub fn open_with_parents(storage: S, access: FileAccess, parents: ParentChain) -> Result<Self> {
        let file = VhdxFile::open(storage, access)?;
        if !file.has_parent() && !parents.is_empty() {
            warn!("Ignoring parents supplied for a disk without parent");
        }
        let parents = if file.has_parent() {
            parents.validate_for(&file)?;
            parents
        } else {
            ParentChain::empty()
        };
        Ok(Self {
            file,
            parents,
            ownership: Ownership::Dispose,
            closed: false,
        })
    }

    fn from_file(file: VhdxFile<S>) -> Result<Self> {
        let parents = if file.has_parent() {
            ParentChain::resolve(&file)?
        } else {
            ParentChain::empty()
        };
        Ok(Self {
            file,
            parents,
            ownership: Ownership::Dispose,
            closed: false,
        })
    }

    /// Sets who syncs the storage on close.
    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.file.capacity()
    }

    pub fn block_size(&self) -> u32 {
        self.file.metadata().file_parameters.block_size
    }

    pub fn logical_sector_size(&self) -> u32 {
        self.file.metadata().logical_sector_size
    }

    pub fn physical_sector_size(&self) -> u32 {
        self.file.metadata().physical_sector_size
    }

    /// True for dynamic and differencing disks.
    pub fn is_sparse(&self) -> bool {
        !self.file.is_fixed()
    }

    pub fn disk_type(&self) -> DiskType {
        if self.file.has_parent() {
            DiskType::Differencing
        } else if self.file.is_fixed() {
            DiskType::Fixed
        } else {
            DiskType::Dynamic
        }
    }

    pub fn page83(&self) -> Uuid {
        self.file.metadata().page83
    }

    pub fn parent_locator(&self) -> Option<&ParentLocator> {
        self.file.metadata().parent_locator.as_ref()
    }

    pub fn parents(&self) -> &ParentChain {
        &self.parents
    }

    /// The current header.
    pub fn header(&self) -> &Header {
        self.file.header()
    }

    pub fn access(&self) -> FileAccess {
        self.file.access()
    }

    /// Parameters actually in effect, defaults included.
    pub fn parameters(&self) -> DiskParameters {
        DiskParameters {
            capacity: self.capacity(),
            block_size: Some(self.block_size()),
            physical_sector_size: Some(self.physical_sector_size()),
            logical_sector_size: Some(self.logical_sector_size()),
        }
    }

    pub fn info(&self) -> DiskInfo {
        let header = self.file.header();
        let bat = self.file.bat();
        DiskInfo {
            disk_type: self.disk_type(),
            capacity: self.capacity(),
            block_size: self.block_size(),
            logical_sector_size: self.logical_sector_size(),
            physical_sector_size: self.physical_sector_size(),
            is_sparse: self.is_sparse(),
            page83: self.page83(),
            file_write_guid: header.file_write_guid,
            data_write_guid: header.data_write_guid,
            creator: self.file.creator().to_string(),
            total_blocks: bat.layout().data_blocks,
            allocated_blocks: bat.allocated_blocks(),
            replayed_log_entries: self.file.replayed_entries(),
            regions: self.file.regions().entries().to_vec(),
            parent_locator: self.parent_locator().cloned(),
            parent_chain: self.parents.paths(),
        }
    }

    /// The virtual disk content as a random-access stream.
    pub fn content(&mut self) -> ContentStream<'_, S> {
        ContentStream::new(&mut self.file, &mut self.parents)
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.file.close(self.ownership == Ownership::Dispose)?;
        debug!("Closed disk, ownership {:?}", self.ownership);
        Ok(())
    }

    /// Ends the write session and reports any error.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }
}

impl DiskImageFile<File> {
    /// Opens the container at `path`. Relative parent locators resolve
    /// against the directory of `path`.
    pub fn open_path(path: impl AsRef<Path>, access: FileAccess) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(access.can_write())
            .open(path)?;
        Self::from_file(VhdxFile::open(file, access)?.with_path(path))
    }
}

impl<S: Storage> Drop for DiskImageFile<S> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Closing disk failed: {}", e);
        }
    }
}

impl<S: Storage> std::fmt::Debug for DiskImageFile<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageFile")
            .field("disk_type", &self.disk_type())
            .field("capacity", &self.capacity())
            .field("block_size", &self.block_size())
            .field("parents", &self.parents)
            .finish()
    }
}

/// Locator path of the parent relative to the child's directory, in the
/// `.\dir\file` form, when the parent lives below that directory.
fn relative_locator_path(child_path: &Path, parent_absolute: &Path) -> Option<String> {
    let child_dir = match child_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir().ok()?,
    };
    let child_dir = std::fs::canonicalize(child_dir).ok()?;
    let rest = parent_absolute.strip_prefix(&child_dir).ok()?;
    let parts: Vec<String> = rest
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!(".\\{}", parts.join("\\")))
}
