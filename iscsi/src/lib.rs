//! iSCSI initiator session and disk management on top of `iscsiadm`,
//! `lsblk` and sysfs.
//!
//! [`IscsiUtil`] logs targets in and out and consolidates the block devices
//! they expose, multipath included, into a single [`Disk`] with a
//! [`DiskStatus`].

mod config;
mod device;
mod disk;
mod error;
mod exec;
mod host;
mod iscsi_util;
mod session;
mod target;

#[cfg(test)]
mod testing;

pub use config::*;
pub use device::*;
pub use disk::*;
pub use error::*;
pub use exec::{Exec, Executor};
pub use host::*;
pub use iscsi_util::*;
pub use session::*;
pub use target::*;

/// Ordered `-n <name> -v <value>` settings for `iscsiadm -o update`.
#[derive(Debug, Default)]
pub struct NodeOptions {
    inner: Vec<(String, String)>,
}

impl NodeOptions {
    pub fn new() -> Self {
        NodeOptions { inner: Vec::new() }
    }

    /// Sets `key`, replacing an earlier value in place.
    pub fn insert<S: AsRef<str>>(&mut self, k: S, v: S) -> &mut Self {
        let (k, v) = (k.as_ref().to_string(), v.as_ref().to_string());
        match self.inner.iter_mut().find(|(key, _)| *key == k) {
            Some(entry) => entry.1 = v,
            None => self.inner.push((k, v)),
        }
        self
    }

    pub fn contains_key<S: AsRef<str>>(&self, k: S) -> bool {
        self.inner.iter().any(|(key, _)| key == k.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn to_args(&self) -> Vec<&str> {
        self.inner
            .iter()
            .flat_map(|(key, value)| ["-n", key.as_str(), "-v", value.as_str()])
            .collect()
    }
}
