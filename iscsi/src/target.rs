use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub static DEFAULT_PORT: &str = "3260";
pub static BY_PATH_DIR: &str = "/dev/disk/by-path";

/// CHAP credential for session login.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Chap {
    user: String,
    passwd: String,
}

impl Chap {
    pub fn new<S: AsRef<str>>(user: S, passwd: S) -> Self {
        Chap {
            user: user.as_ref().to_string(),
            passwd: passwd.as_ref().to_string(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn passwd(&self) -> &str {
        &self.passwd
    }
}

/// One iSCSI target endpoint a caller wants attached.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    portal: String,
    name: String,
    lun: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chap: Option<Chap>,
}

impl Target {
    /// `portal` is used verbatim; see [`with_default_port`] to normalize it.
    pub fn new<S: AsRef<str>>(portal: S, name: S, lun: u64) -> Self {
        Target {
            portal: portal.as_ref().to_string(),
            name: name.as_ref().to_string(),
            lun,
            chap: None,
        }
    }

    pub fn with_chap(mut self, chap: Chap) -> Self {
        self.chap = Some(chap);
        self
    }

    pub fn portal(&self) -> &str {
        &self.portal
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lun(&self) -> u64 {
        self.lun
    }

    pub fn chap(&self) -> Option<&Chap> {
        self.chap.as_ref()
    }

    /// Prefix shared by every by-path link of this target, whatever the LUN.
    pub fn by_path_prefix(&self) -> String {
        format!("ip-{}-iscsi-{}-lun", self.portal, self.name)
    }

    /// The udev by-path link expected for this target's LUN, like
    /// `/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-iqn.2004-08.com.qsan:dev1-lun-0`.
    pub fn by_path(&self) -> PathBuf {
        PathBuf::from(BY_PATH_DIR).join(format!("{}-{}", self.by_path_prefix(), self.lun))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} lun {}", self.portal, self.name, self.lun)
    }
}

/// Appends the iSCSI default port to a portal that carries none.
///
/// `10.0.0.1` and `[fe80::1]` gain `:3260`; `10.0.0.1:3261` is returned as is.
pub fn with_default_port<S: AsRef<str>>(portal: S) -> String {
    let portal = portal.as_ref().trim();
    let has_port = match portal.strip_prefix('[') {
        Some(rest) => rest.contains("]:"),
        None => portal.contains(':'),
    };

    if has_port {
        portal.to_string()
    } else {
        format!("{}:{}", portal, DEFAULT_PORT)
    }
}
