//! Update package reader.
//!
//! Reads the DFU ZIP container: `manifest.json` at the root names up to
//! four update slots, each pairing an init packet (`dat_file`) with a
//! firmware binary (`bin_file`). Updates are applied in a fixed order
//! with the application last.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DfuError, DfuResult};

/// Canonical slot order; SoftDevice first, application last.
pub const SLOT_ORDER: [UpdateSlot; 4] = [
    UpdateSlot::SoftDevice,
    UpdateSlot::Bootloader,
    UpdateSlot::SoftDeviceBootloader,
    UpdateSlot::Application,
];

/// Update slots a package may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSlot {
    SoftDevice,
    Bootloader,
    SoftDeviceBootloader,
    Application,
}

impl UpdateSlot {
    /// Manifest key for this slot.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSlot::SoftDevice => "softdevice",
            UpdateSlot::Bootloader => "bootloader",
            UpdateSlot::SoftDeviceBootloader => "softdevice_bootloader",
            UpdateSlot::Application => "application",
        }
    }
}

impl fmt::Display for UpdateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined image sizes carried by the `softdevice_bootloader` slot.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SizeMetadata {
    pub bl_size: u32,
    pub sd_size: u32,
}

/// One slot's entry in the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Firmware binary file name inside the archive.
    pub bin_file: String,
    /// Init packet file name inside the archive.
    pub dat_file: String,
    /// Present on `softdevice_bootloader` entries.
    #[serde(default)]
    pub info_read_only_metadata: Option<SizeMetadata>,
}

/// Parsed `manifest.json`. Unknown slots are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    softdevice: Option<ManifestEntry>,
    #[serde(default)]
    bootloader: Option<ManifestEntry>,
    #[serde(default)]
    softdevice_bootloader: Option<ManifestEntry>,
    #[serde(default)]
    application: Option<ManifestEntry>,
}

impl Manifest {
    /// Entry for a slot, if the package carries it.
    pub fn entry(&self, slot: UpdateSlot) -> Option<&ManifestEntry> {
        match slot {
            UpdateSlot::SoftDevice => self.softdevice.as_ref(),
            UpdateSlot::Bootloader => self.bootloader.as_ref(),
            UpdateSlot::SoftDeviceBootloader => self.softdevice_bootloader.as_ref(),
            UpdateSlot::Application => self.application.as_ref(),
        }
    }
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawPackage {
    manifest: Manifest,
}

/// One update ready for transfer.
#[derive(Debug, Clone)]
pub struct Update {
    pub slot: UpdateSlot,
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

/// A DFU update package (ZIP container).
pub struct UpdatePackage {
    archive: zip::ZipArchive<File>,
    manifest: Manifest,
}

impl UpdatePackage {
    /// Open a package, parse its manifest, and check every referenced
    /// payload exists in the archive.
    pub fn open<P: AsRef<Path>>(path: P) -> DfuResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut archive = zip::ZipArchive::new(file)?;

        let manifest = read_manifest(&mut archive)?;

        for slot in SLOT_ORDER {
            if let Some(entry) = manifest.entry(slot) {
                for name in [&entry.dat_file, &entry.bin_file] {
                    if archive.by_name(name).is_err() {
                        return Err(DfuError::PackageInvalid {
                            reason: format!("{} references missing file {}", slot, name),
                        });
                    }
                }
            }
        }

        Ok(Self { archive, manifest })
    }

    /// Parsed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Extract the present updates in canonical slot order.
    pub fn updates(&mut self) -> DfuResult<Vec<Update>> {
        let entries: Vec<(UpdateSlot, ManifestEntry)> = SLOT_ORDER
            .iter()
            .filter_map(|&slot| self.manifest.entry(slot).cloned().map(|entry| (slot, entry)))
            .collect();

        let mut updates = Vec::with_capacity(entries.len());
        for (slot, entry) in entries {
            let init_packet = read_file_from_zip(&mut self.archive, &entry.dat_file)?;
            let firmware = read_file_from_zip(&mut self.archive, &entry.bin_file)?;
            updates.push(Update {
                slot,
                init_packet,
                firmware,
            });
        }
        Ok(updates)
    }
}

/// Read and parse the manifest.json from the archive.
fn read_manifest(archive: &mut zip::ZipArchive<File>) -> DfuResult<Manifest> {
    let mut manifest_file =
        archive
            .by_name("manifest.json")
            .map_err(|_| DfuError::PackageInvalid {
                reason: "missing manifest.json".to_string(),
            })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    let raw: RawPackage =
        serde_json::from_str(&contents).map_err(|error| DfuError::PackageInvalid {
            reason: format!("manifest.json: {}", error),
        })?;

    Ok(raw.manifest)
}

/// Read a file from the zip archive by name.
fn read_file_from_zip(archive: &mut zip::ZipArchive<File>, name: &str) -> DfuResult<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| DfuError::PackageInvalid {
        reason: format!("missing file {}", name),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}
