//! Virtual disk containers exposed as random-access byte streams.
//!
//! The [`vhdx`] module implements the VHDX container engine (fixed, dynamic
//! and differencing disks, write-ahead log, parent chains). The [`raw`]
//! module implements flat images. [`VirtualDisk`] dispatches between them by
//! format tag and carries a string-keyed parameter bag, so callers can
//! create and open disks without naming a concrete format.

pub mod error;
pub mod progress;
pub mod raw;
pub mod vhdx;

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

pub use error::{DiskError, Result};
pub use progress::ProgressSink;
use raw::RAW;
use vhdx::{DiskImageFile, DiskInfo, DiskParameters, DiskType, FileAccess, Ownership};

/// Capacity plus format-specific extended parameters (`"VHDX.BlockSize"`,
/// ...), as decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDiskParameters {
    pub capacity: u64,
    #[serde(default)]
    pub extended_parameters: BTreeMap<String, String>,
}

impl VirtualDiskParameters {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            extended_parameters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.extended_parameters
            .insert(key.to_string(), value.to_string());
        self
    }
}

pub enum DiskFormat {
    VHDX {
        disk: DiskImageFile<File>,
        description: String,
    },
    RAW {
        image: RAW,
        description: String,
    }, // Other compatible image formats here
}

/// A virtual disk of any supported format.
pub struct VirtualDisk {
    path: PathBuf,
    format: DiskFormat,
    position: u64,
}

const VHDX_DESCRIPTION: &str = "Hyper-V Virtual Hard Disk v2";
const RAW_DESCRIPTION: &str = "Raw Data";

impl VirtualDisk {
    /// Creates a disk of `format_tag` (`"VHDX"` or `"RAW"`) at `path`.
    ///
    /// `variant` is `"fixed"` or `"dynamic"`; RAW images are always fixed.
    /// Parameters are validated before `path` is opened, so invalid
    /// arguments leave an existing file untouched. Once valid, an existing
    /// file is overwritten. A file this call created is removed again when
    /// initialization fails.
    pub fn create_disk(
        format_tag: &str,
        variant: &str,
        path: impl AsRef<Path>,
        parameters: &VirtualDiskParameters,
    ) -> Result<VirtualDisk> {
        let path = path.as_ref();
        let format = match format_tag.to_ascii_lowercase().as_str() {
            "vhdx" => {
                let disk_type = match variant.to_ascii_lowercase().as_str() {
                    "fixed" => DiskType::Fixed,
                    "dynamic" => DiskType::Dynamic,
                    _ => return Err(DiskError::InvalidArgument("variant")),
                };
                let params = DiskParameters::from_extended(
                    parameters.capacity,
                    &parameters.extended_parameters,
                )?;
                params.validate()?;
                let existed = path.exists();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;
                let disk =
                    match DiskImageFile::initialize(file, Ownership::Dispose, disk_type, &params, None) {
                        Ok(disk) => disk,
                        Err(err) => {
                            if !existed {
                                if let Err(e) = std::fs::remove_file(path) {
                                    warn!("Could not remove {}: {}", path.display(), e);
                                }
                            }
                            return Err(err);
                        }
                    };
                DiskFormat::VHDX {
                    disk,
                    description: VHDX_DESCRIPTION.to_string(),
                }
            }
            "raw" => {
                if !variant.eq_ignore_ascii_case("fixed") {
                    return Err(DiskError::InvalidArgument("variant"));
                }
                if !parameters.extended_parameters.is_empty() {
                    warn!("RAW images take no extended parameters, ignoring them");
                }
                DiskFormat::RAW {
                    image: RAW::create(path, parameters.capacity)?,
                    description: RAW_DESCRIPTION.to_string(),
                }
            }
            _ => return Err(DiskError::UnsupportedFormat(format_tag.to_string())),
        };
        info!("Created {} {} disk at {}", variant, format_tag, path.display());
        Ok(VirtualDisk {
            path: path.to_path_buf(),
            format,
            position: 0,
        })
    }

    /// Opens the disk at `path` as `"vhdx"`, `"raw"` or `"auto"`.
    ///
    /// `"auto"` looks for the VHDX file identifier first, then at the
    /// extension, and falls back to RAW.
    pub fn open(path: impl AsRef<Path>, format: &str, access: FileAccess) -> Result<VirtualDisk> {
        let path = path.as_ref();
        let format = match format.to_ascii_lowercase().as_str() {
            "auto" => detect_format(path)?,
            "vhdx" => "vhdx",
            "raw" => "raw",
            _ => return Err(DiskError::UnsupportedFormat(format.to_string())),
        };
        let format = match format {
            "vhdx" => DiskFormat::VHDX {
                disk: DiskImageFile::open_path(path, access)?,
                description: VHDX_DESCRIPTION.to_string(),
            },
            _ => DiskFormat::RAW {
                image: RAW::open(path, access)?,
                description: RAW_DESCRIPTION.to_string(),
            },
        };
        Ok(VirtualDisk {
            path: path.to_path_buf(),
            format,
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &DiskFormat {
        &self.format
    }

    pub fn description(&self) -> &str {
        match &self.format {
            DiskFormat::VHDX { description, .. } => description,
            DiskFormat::RAW { description, .. } => description,
        }
    }

    /// Short format tag, `"VHDX"` or `"RAW"`.
    pub fn format_tag(&self) -> &'static str {
        match self.format {
            DiskFormat::VHDX { .. } => "VHDX",
            DiskFormat::RAW { .. } => "RAW",
        }
    }

    pub fn print_info(&self) {
        info!("Evidence : {}", self.path.display());
    }

    pub fn capacity(&self) -> u64 {
        match &self.format {
            DiskFormat::VHDX { disk, .. } => disk.capacity(),
            DiskFormat::RAW { image, .. } => image.capacity(),
        }
    }

    pub fn get_sector_size(&self) -> u32 {
        match &self.format {
            DiskFormat::VHDX { disk, .. } => disk.logical_sector_size(),
            DiskFormat::RAW { .. } => 512,
        }
    }

    /// The parameters in effect, defaults included. Feeding them back to
    /// [`VirtualDisk::create_disk`] recreates an identical geometry.
    pub fn parameters(&self) -> VirtualDiskParameters {
        match &self.format {
            DiskFormat::VHDX { disk, .. } => {
                let params = disk.parameters();
                VirtualDiskParameters {
                    capacity: params.capacity,
                    extended_parameters: params.to_extended(),
                }
            }
            DiskFormat::RAW { image, .. } => VirtualDiskParameters::new(image.capacity()),
        }
    }

    /// VHDX summary; `None` for other formats.
    pub fn info(&self) -> Option<DiskInfo> {
        match &self.format {
            DiskFormat::VHDX { disk, .. } => Some(disk.info()),
            DiskFormat::RAW { .. } => None,
        }
    }

    /// Flushes and closes the disk, reporting any error.
    pub fn close(self) -> Result<()> {
        match self.format {
            DiskFormat::VHDX { disk, .. } => disk.close(),
            DiskFormat::RAW { mut image, .. } => {
                image.flush()?;
                Ok(())
            }
        }
    }
}

/// Picks `"vhdx"` or `"raw"` for `path`.
fn detect_format(path: &Path) -> Result<&'static str> {
    let mut signature = [0u8; 8];
    let mut file = File::open(path)?;
    let read = file.read(&mut signature)?;
    if read == signature.len() && &signature == b"vhdxfile" {
        debug!("Found VHDX file identifier in {}", path.display());
        return Ok("vhdx");
    }
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("vhdx"))
        .unwrap_or(false);
    if by_extension {
        debug!("Treating {} as VHDX from its extension", path.display());
        Ok("vhdx")
    } else {
        Ok("raw")
    }
}

impl Read for VirtualDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = match self.format {
            DiskFormat::VHDX { ref mut disk, .. } => {
                let mut content = disk.content();
                content.seek(SeekFrom::Start(self.position))?;
                content.read(buf)?
            }
            DiskFormat::RAW { ref mut image, .. } => {
                image.seek(SeekFrom::Start(self.position))?;
                image.read(buf)?
            }
            // All other compatible formats will be handled here.
        };
        self.position += read as u64;
        Ok(read)
    }
}

impl Write for VirtualDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = match self.format {
            DiskFormat::VHDX { ref mut disk, .. } => {
                let mut content = disk.content();
                content.seek(SeekFrom::Start(self.position))?;
                content.write(buf)?
            }
            DiskFormat::RAW { ref mut image, .. } => {
                image.seek(SeekFrom::Start(self.position))?;
                image.write(buf)?
            }
        };
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.format {
            DiskFormat::VHDX { ref mut disk, .. } => Ok(disk.content().flush()?),
            DiskFormat::RAW { ref mut image, .. } => image.flush(),
        }
    }
}

impl Seek for VirtualDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.capacity().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_tag_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let result = VirtualDisk::create_disk(
            "VMDK",
            "fixed",
            dir.path().join("disk.vmdk"),
            &VirtualDiskParameters::new(1 << 20),
        );
        assert!(matches!(result, Err(DiskError::UnsupportedFormat(_))));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = VirtualDisk::create_disk(
            "VHDX",
            "sparse",
            dir.path().join("disk.vhdx"),
            &VirtualDiskParameters::new(1 << 20),
        );
        assert_eq!(result.err().and_then(|e| e.param_name()), Some("variant"));
    }

    #[test]
    fn failed_creation_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhdx");
        let params = VirtualDiskParameters::new(1 << 20).with("VHDX.LogicalSectorSize", 1024);
        let result = VirtualDisk::create_disk("VHDX", "dynamic", &path, &params);
        assert_eq!(
            result.err().and_then(|e| e.param_name()),
            Some("logicalSectorSize")
        );
        assert!(!path.exists());
    }

    #[test]
    fn auto_detects_by_signature_then_extension() {
        let dir = tempfile::tempdir().unwrap();
        let vhdx = dir.path().join("disk.img");
        VirtualDisk::create_disk("VHDX", "dynamic", &vhdx, &VirtualDiskParameters::new(1 << 20))
            .unwrap()
            .close()
            .unwrap();
        assert_eq!(detect_format(&vhdx).unwrap(), "vhdx");

        let raw = dir.path().join("disk.bin");
        std::fs::write(&raw, [0u8; 512]).unwrap();
        assert_eq!(detect_format(&raw).unwrap(), "raw");

        let named = dir.path().join("empty.VHDX");
        std::fs::write(&named, [0u8; 4]).unwrap();
        assert_eq!(detect_format(&named).unwrap(), "vhdx");
    }

    #[test]
    fn stream_traits_track_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vhdx");
        let mut disk =
            VirtualDisk::create_disk("VHDX", "dynamic", &path, &VirtualDiskParameters::new(4 << 20))
                .unwrap();
        disk.seek(SeekFrom::Start(1000)).unwrap();
        disk.write_all(b"hello world").unwrap();
        assert_eq!(disk.seek(SeekFrom::Current(0)).unwrap(), 1011);
        disk.seek(SeekFrom::Start(1006)).unwrap();
        let mut back = [0u8; 5];
        disk.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"world");
        disk.seek(SeekFrom::End(-2)).unwrap();
        let mut tail = Vec::new();
        disk.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, vec![0, 0]);
        disk.close().unwrap();
    }
}
