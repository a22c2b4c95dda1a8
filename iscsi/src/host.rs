use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Result;

use crate::IscsiError;

static MOUNT_TABLE: &str = "/proc/self/mounts";

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: String,
}

/// Filesystem side of the host: by-path links, sysfs control files and the
/// mount table.
pub trait Host {
    /// `true` if `path` resolves to an existing node. Symlinks are followed.
    fn exists(&self, path: &Path) -> bool;

    /// File names of the entries in directory `path`.
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>>;

    /// Write `content` into an existing control file.
    fn echo(&self, path: &Path, content: &str) -> Result<()>;

    fn mounts(&self) -> Result<Vec<MountPoint>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalHost;

impl Host for LocalHost {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        let names = fs::read_dir(path)?
            .filter_map(|res| res.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        Ok(names)
    }

    fn echo(&self, path: &Path, content: &str) -> Result<()> {
        log::trace!("[echo] {:?} > {}", content, path.display());
        let mut fd = fs::OpenOptions::new().write(true).open(path)?;
        fd.write_all(content.as_bytes())
            .map_err(|e| IscsiError::Io(e))?;

        Ok(())
    }

    fn mounts(&self) -> Result<Vec<MountPoint>> {
        let table = fs::read_to_string(MOUNT_TABLE)?;
        Ok(parse_mounts(&table))
    }
}

/// Parses the `/proc/mounts` format: device, mount path, fs type, options.
pub fn parse_mounts(table: &str) -> Vec<MountPoint> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            Some(MountPoint {
                device: unescape_octal(device),
                path: unescape_octal(path),
            })
        })
        .collect()
}

/// Decodes the `\040` style escapes the kernel uses for blanks in mount fields.
fn unescape_octal(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() {
            let digits = &bytes[index + 1..index + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let num = digits
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + u16::from(b - b'0'));
                if let Ok(num) = u8::try_from(num) {
                    out.push(num);
                    index += 4;
                    continue;
                }
            }
        }

        out.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&out).to_string()
}
