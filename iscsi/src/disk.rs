use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Device;

/// Health of the logical disk behind a target set.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    /// No per-path disk was found.
    None,
    /// Paths disagree on vendor, model or serial.
    Mismatch,
    Online,
    Offline,
    /// Some but not all paths are running.
    Degrade,
    #[default]
    Unknown,
}

impl DiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskStatus::None => "none",
            DiskStatus::Mismatch => "mismatch",
            DiskStatus::Online => "online",
            DiskStatus::Offline => "offline",
            DiskStatus::Degrade => "degrade",
            DiskStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logical disk consolidated from every path of a target set.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Disk {
    valid: bool,
    status: DiskStatus,
    name: String,
    size: String,
    vendor: String,
    model: String,
    serial: String,
    mpath_cnt: usize,
    disk_cnt: usize,
    devices: BTreeMap<String, Device>,
}

impl Disk {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn status(&self) -> DiskStatus {
        self.status
    }

    /// Kernel name of the node callers should use, like `dm-0` or `sdb`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> &str {
        &self.size
    }

    /// Empty unless every path agrees.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn mpath_cnt(&self) -> usize {
        self.mpath_cnt
    }

    pub fn disk_cnt(&self) -> usize {
        self.disk_cnt
    }

    pub fn devices(&self) -> &BTreeMap<String, Device> {
        &self.devices
    }

    /// Merges the devices found for `target_cnt` targets into one disk.
    ///
    /// The disk is valid with exactly one multipath node and consistent paths,
    /// or with no multipath node and a single path. Status precedence is
    /// none, mismatch, online, offline, degrade, unknown.
    pub fn consolidate(
        devices: BTreeMap<String, Device>,
        target_cnt: usize,
        force_mpio: bool,
    ) -> Disk {
        let mut disk = Disk::default();
        let mut identity: Option<(&str, &str, &str)> = None;
        let mut matched = true;
        let mut running = 0;
        let mut first_disk: Option<(&String, &Device)> = None;
        let mut first_mpath: Option<(&String, &Device)> = None;

        for (kname, dev) in devices.iter() {
            if dev.is_disk() {
                disk.disk_cnt += 1;
                match identity {
                    None => identity = Some(dev.identity()),
                    Some(seen) if seen != dev.identity() => matched = false,
                    Some(_) => {}
                }
                if dev.is_running() {
                    running += 1;
                }
                first_disk.get_or_insert((kname, dev));
            } else if dev.is_mpath() {
                disk.mpath_cnt += 1;
                first_mpath.get_or_insert((kname, dev));
            }
        }

        if matched {
            if let Some((vendor, model, serial)) = identity {
                disk.vendor = vendor.to_string();
                disk.model = model.to_string();
                disk.serial = serial.to_string();
            }
        }

        // an mpath node names the disk even when it ends up invalid
        if let Some((kname, dev)) = first_mpath {
            disk.name = kname.clone();
            disk.size = dev.size().to_string();
        }

        disk.valid = (disk.mpath_cnt == 1 && matched) || (disk.mpath_cnt == 0 && disk.disk_cnt == 1);

        // a lone path is used directly unless multipath is enforced, so with
        // force_mpio off one disk plus its mpath node is named after the disk
        let single_path = disk.mpath_cnt == 0 || !force_mpio;
        if disk.valid && disk.disk_cnt == 1 && single_path {
            if let Some((kname, dev)) = first_disk {
                disk.name = kname.clone();
                disk.size = dev.size().to_string();
            }
        }

        disk.status = if disk.disk_cnt == 0 {
            DiskStatus::None
        } else if !matched {
            DiskStatus::Mismatch
        } else if disk.valid && running == target_cnt {
            DiskStatus::Online
        } else if disk.valid && running == 0 {
            DiskStatus::Offline
        } else if disk.valid && running < target_cnt {
            DiskStatus::Degrade
        } else {
            DiskStatus::Unknown
        };

        log::debug!(
            "[consolidate] valid={} status={} disk_cnt={} mpath_cnt={} running={}/{}",
            disk.valid,
            disk.status,
            disk.disk_cnt,
            disk.mpath_cnt,
            running,
            target_cnt
        );

        disk.devices = devices;
        disk
    }
}
