//! Runtime device discovery
//!
//! ESP tiles are exported to Linux userspace as UIO devices. Each
//! `/sys/class/uio/uioN/name` holds the device-tree compatible string
//! (`sld,mac`) or an instance name (`mac.0`), and `maps/map0/{addr,size}`
//! describe the register window mapped through `/dev/uioN`.
//!
//! The manager can also be populated with software tiles, which are opened
//! through the same interface.

use crate::backends::{MmioDevice, SoftwareAccelerator};
use crate::error::{AcceleratorError, Result};
use crate::protocol::Accelerator;
use crate::udmabuf::UdmaBuf;
use esp_chip::devices::AcceleratorKind;
use esp_chip::socmap::PlatformDescriptor;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a device's registers live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSource {
    /// UIO register map
    Uio {
        /// Device node (`/dev/uio0`)
        node: PathBuf,
        /// Physical address of the register window
        map_addr: u64,
        /// Size of the register window in bytes
        map_size: usize,
    },
    /// Software model held by the manager
    Software,
}

/// Information about a discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Discovery order (0, 1, 2, ...)
    pub index: usize,
    /// Instance name (`mac.0`)
    pub name: String,
    /// Accelerator kind
    pub kind: AcceleratorKind,
    /// Register transport
    pub source: DeviceSource,
}

/// Device manager for runtime discovery and access
#[derive(Debug)]
pub struct DeviceManager {
    platform: PlatformDescriptor,
    devices: Vec<DeviceInfo>,
    software: HashMap<String, SoftwareAccelerator>,
    flush_target: Option<Arc<UdmaBuf>>,
}

impl DeviceManager {
    /// Discover UIO accelerators under `/sys` and `/dev`.
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no accelerator is exported.
    pub fn discover(platform: PlatformDescriptor) -> Result<Self> {
        Self::discover_uio(Path::new("/sys"), Path::new("/dev"), platform)
    }

    /// Discover UIO accelerators under an explicit sysfs and dev root.
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no entry matches a known kind.
    pub fn discover_uio(
        sysfs_root: &Path,
        dev_root: &Path,
        platform: PlatformDescriptor,
    ) -> Result<Self> {
        tracing::info!("Discovering ESP accelerators under {}...", sysfs_root.display());

        let class = sysfs_root.join("class/uio");
        let mut entries: Vec<(u32, PathBuf)> = std::fs::read_dir(&class)
            .map_err(|e| {
                tracing::error!("Cannot read {}: {e}", class.display());
                AcceleratorError::NoDevicesFound
            })?
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let index = file_name.to_str()?.strip_prefix("uio")?.parse().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        entries.sort_by_key(|(index, _)| *index);

        let mut devices = Vec::new();
        let mut per_kind: HashMap<AcceleratorKind, usize> = HashMap::new();
        for (uio, path) in entries {
            let Ok(raw_name) = std::fs::read_to_string(path.join("name")) else {
                continue;
            };
            let raw_name = raw_name.trim();
            let Some(kind) = AcceleratorKind::ALL
                .into_iter()
                .find(|k| k.matches_name(raw_name))
            else {
                tracing::debug!("uio{uio}: '{raw_name}' is not an accelerator");
                continue;
            };

            let ordinal = per_kind.entry(kind).or_default();
            let name = if raw_name.contains('.') {
                raw_name.to_string()
            } else {
                format!("{}.{ordinal}", kind.name())
            };
            *ordinal += 1;

            let map = path.join("maps/map0");
            let map_addr = match read_sysfs_u64(&map.join("addr")) {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::warn!("uio{uio}: {e}");
                    continue;
                }
            };
            let map_size = match read_sysfs_u64(&map.join("size")).map(usize::try_from) {
                Ok(Ok(size)) => size,
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!("uio{uio}: unreadable map size");
                    continue;
                }
            };

            tracing::info!("Device {}: {name} @ {map_addr:#x} (uio{uio}, {map_size:#x} bytes)", devices.len());
            devices.push(DeviceInfo {
                index: devices.len(),
                name,
                kind,
                source: DeviceSource::Uio {
                    node: dev_root.join(format!("uio{uio}")),
                    map_addr,
                    map_size,
                },
            });
        }

        if devices.is_empty() {
            tracing::error!("No ESP accelerators found");
            return Err(AcceleratorError::NoDevicesFound);
        }

        tracing::info!("Discovered {} accelerator(s)", devices.len());
        Ok(Self {
            platform,
            devices,
            software: HashMap::new(),
            flush_target: None,
        })
    }

    /// Manager over named software tiles.
    ///
    /// Names must be unique; a repeated name is skipped with a warning and
    /// the first tile under it is kept.
    pub fn software(
        platform: PlatformDescriptor,
        tiles: impl IntoIterator<Item = (String, SoftwareAccelerator)>,
    ) -> Self {
        let mut devices = Vec::new();
        let mut software = HashMap::new();
        for (name, tile) in tiles {
            if software.contains_key(&name) {
                tracing::warn!("Skipping duplicate software tile '{name}'");
                continue;
            }
            devices.push(DeviceInfo {
                index: devices.len(),
                name: name.clone(),
                kind: tile.kind(),
                source: DeviceSource::Software,
            });
            software.insert(name, tile);
        }
        Self {
            platform,
            devices,
            software,
            flush_target: None,
        }
    }

    /// Route MMIO cache flushes through a `u-dma-buf` sync.
    #[must_use]
    pub fn with_flush_target(mut self, udmabuf: Arc<UdmaBuf>) -> Self {
        self.flush_target = Some(udmabuf);
        self
    }

    /// Platform geometry.
    pub const fn platform(&self) -> &PlatformDescriptor {
        &self.platform
    }

    /// Get number of discovered devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Get slice of all devices
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Devices of `kind` answering to `name`.
    ///
    /// An empty name, `*`, the kind name, or its compatible string select
    /// every instance of the kind.
    pub fn select(&self, kind: AcceleratorKind, name: &str) -> Vec<&DeviceInfo> {
        let name = name.trim();
        let any = name.is_empty() || name == "*" || name == kind.name() || name == kind.compatible();
        self.devices
            .iter()
            .filter(|d| d.kind == kind && (any || d.name == name))
            .collect()
    }

    /// Open a device by instance name.
    ///
    /// Software tiles can be opened once; the returned [`Accelerator`] owns
    /// them.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` for an unknown or already opened name, or
    /// the mapping error of a UIO device.
    pub fn open(&mut self, name: &str) -> Result<Accelerator> {
        let info = self
            .devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| AcceleratorError::device_not_found(name))?;

        match &info.source {
            DeviceSource::Uio { node, map_size, .. } => {
                let mut dev = MmioDevice::open(node, *map_size)?;
                if let Some(target) = &self.flush_target {
                    dev = dev.with_flush_target(Arc::clone(target));
                }
                Accelerator::new(info.name.clone(), info.kind, self.platform, Box::new(dev))
            }
            DeviceSource::Software => {
                let tile = self
                    .software
                    .remove(name)
                    .ok_or_else(|| AcceleratorError::device_not_found(format!("{name} (already open)")))?;
                Accelerator::new(info.name.clone(), info.kind, self.platform, Box::new(tile))
            }
        }
    }
}

/// Read a sysfs number, hexadecimal with a `0x` prefix or decimal.
pub(crate) fn read_sysfs_u64(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AcceleratorError::transfer(format!("Cannot read {}: {e}", path.display()))
    })?;
    let trimmed = content.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|e| {
        AcceleratorError::transfer(format!("Invalid value '{trimmed}' in {}: {e}", path.display()))
    })
}
