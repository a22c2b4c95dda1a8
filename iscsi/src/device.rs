use std::collections::BTreeMap;
use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::session::lun_session_exists;
use crate::{Executor, Host, RetryPolicy, Session, Target};

pub static DEVICE_DISK: &str = "disk";
pub static DEVICE_MPATH: &str = "mpath";
pub static DEVICE_RUNNING: &str = "running";

static LSBLK_COLUMNS: &str = "NAME,KNAME,PKNAME,TYPE,STATE,SIZE,VENDOR,MODEL,WWN";
static LSBLK_FIELDS: usize = 9;

/// A block device node as reported by `lsblk`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    kname: String,
    parent: String,
    r#type: String,
    state: String,
    size: String,
    vendor: String,
    model: String,
    serial: String,
}

impl Device {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel name, like `sdb` or `dm-0`.
    pub fn kname(&self) -> &str {
        &self.kname
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn get_type(&self) -> &str {
        &self.r#type
    }

    /// A raw per-path LUN.
    pub fn is_disk(&self) -> bool {
        self.r#type == DEVICE_DISK
    }

    /// A device-mapper multipath node.
    pub fn is_mpath(&self) -> bool {
        self.r#type == DEVICE_MPATH
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == DEVICE_RUNNING
    }

    pub fn size(&self) -> &str {
        &self.size
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub(crate) fn identity(&self) -> (&str, &str, &str) {
        (&self.vendor, &self.model, &self.serial)
    }
}

#[cfg(test)]
impl Device {
    pub(crate) fn disk(kname: &str, state: &str, vendor: &str, model: &str, serial: &str) -> Self {
        Device {
            name: kname.to_string(),
            kname: kname.to_string(),
            r#type: DEVICE_DISK.to_string(),
            state: state.to_string(),
            size: "10G".to_string(),
            vendor: vendor.to_string(),
            model: model.to_string(),
            serial: serial.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn mpath(kname: &str, parent: &str, size: &str) -> Self {
        Device {
            name: format!("mpath-{}", kname),
            kname: kname.to_string(),
            parent: parent.to_string(),
            r#type: DEVICE_MPATH.to_string(),
            size: size.to_string(),
            ..Default::default()
        }
    }
}

/// Resolves every target to its block devices, keyed by kernel name.
///
/// A multipath node reached through several targets lands in the map once.
/// Targets whose by-path link never shows up are left out.
pub fn get_devices<E: Executor, H: Host>(
    exec: &E,
    host: &H,
    sessions: &[Session],
    targets: &[Target],
    retry: &RetryPolicy,
) -> BTreeMap<String, Device> {
    let mut devices = BTreeMap::new();

    for target in targets {
        let device_path = target.by_path();
        log::debug!("[get_devices] device_path={}", device_path.display());

        if !wait_for_link(host, sessions, target, &device_path, retry) {
            continue;
        }

        let path = device_path.to_string_lossy().into_owned();
        let out = match exec.run("lsblk", &["-rn", "-o", LSBLK_COLUMNS, path.as_str()]) {
            Ok(out) => out,
            Err(e) => {
                log::error!("Failed to get device info of {}, err: {}", path, e);
                continue;
            }
        };

        for device in parse_lsblk(&out) {
            log::debug!("[get_devices] device_info {:?}", device);
            devices.insert(device.kname.clone(), device);
        }
    }

    devices
}

/// Waits for a by-path link, but only while a session already exposes the LUN.
fn wait_for_link<H: Host>(
    host: &H,
    sessions: &[Session],
    target: &Target,
    path: &Path,
    retry: &RetryPolicy,
) -> bool {
    let mut retries = 0;
    loop {
        if host.exists(path) {
            return true;
        }
        if !lun_session_exists(sessions, target) {
            log::debug!("[get_devices] no session exposes {}, skip", target);
            return false;
        }
        if retries >= retry.count {
            log::warn!(
                "[get_devices] {} not ready after {} retries",
                path.display(),
                retries
            );
            return false;
        }

        retries += 1;
        log::trace!(
            "[get_devices] sleep {:?} then try again, retries={} ({})",
            retry.delay(),
            retries,
            path.display()
        );
        thread::sleep(retry.delay());
    }
}

/// Parses `lsblk -rn -o NAME,KNAME,PKNAME,TYPE,STATE,SIZE,VENDOR,MODEL,WWN`.
///
/// Raw mode separates columns with a single blank and leaves empty columns
/// empty, so rows are split on every blank rather than on runs of them.
pub fn parse_lsblk(out: &str) -> Vec<Device> {
    out.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let tokens: Vec<String> = line.split(' ').map(unescape_hex).collect();
            if tokens.len() < LSBLK_FIELDS {
                log::warn!("[parse_lsblk] skip malformed row {:?}", line);
                return None;
            }

            Some(Device {
                name: tokens[0].clone(),
                kname: tokens[1].clone(),
                parent: tokens[2].clone(),
                r#type: tokens[3].clone(),
                state: tokens[4].clone(),
                size: tokens[5].clone(),
                vendor: tokens[6].clone(),
                model: tokens[7].clone(),
                serial: tokens[8].clone(),
            })
        })
        .collect()
}

/// Decodes lsblk raw-mode `\xHH` escapes and trims the padding they carry.
fn unescape_hex(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() && bytes[index + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[index + 2..index + 4]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                index += 4;
                continue;
            }
        }

        out.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&out).trim().to_string()
}

#[cfg(test)]
pub(crate) static LSBLK_MPATH: &str = "\
sdb sdb  disk running 10G QSAN\\x20\\x20\\x20\\x20 XF2026\\x20\\x20 0x2000d42f58000001
mpatha dm-0 sdb mpath  10G   
";

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::session::{parse_sessions, SESSION_LISTING};
    use crate::testing::{FakeExec, FakeHost};

    static CTR1: &str = "iqn.2004-08.com.qsan:xf2026-000d42f58:dev2.ctr1";

    fn quick(count: u32) -> RetryPolicy {
        RetryPolicy::new(count, Duration::ZERO)
    }

    fn lsblk(target: &Target) -> String {
        format!("lsblk -rn -o {} {}", LSBLK_COLUMNS, target.by_path().display())
    }

    #[test]
    fn parses_raw_rows() {
        let devices = parse_lsblk(LSBLK_MPATH);
        assert_eq!(devices.len(), 2);

        let disk = &devices[0];
        assert!(disk.is_disk());
        assert!(disk.is_running());
        assert_eq!(disk.kname(), "sdb");
        assert_eq!(disk.parent(), "");
        assert_eq!(disk.vendor(), "QSAN");
        assert_eq!(disk.model(), "XF2026");
        assert_eq!(disk.serial(), "0x2000d42f58000001");

        let mpath = &devices[1];
        assert!(mpath.is_mpath());
        assert_eq!(mpath.name(), "mpatha");
        assert_eq!(mpath.kname(), "dm-0");
        assert_eq!(mpath.parent(), "sdb");
        assert_eq!(mpath.state(), "");
        assert_eq!(mpath.size(), "10G");
    }

    #[test]
    fn skips_short_rows() {
        let devices = parse_lsblk("sdb sdb disk\n\nsdc sdc  disk running 1G V M S\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kname(), "sdc");
    }

    #[test]
    fn keeps_undecodable_escapes() {
        assert_eq!(unescape_hex("a\\xZZb"), "a\\xZZb");
        assert_eq!(unescape_hex("\\x41\\x20"), "A");
    }

    #[test]
    fn resolves_present_link() {
        let sessions = parse_sessions(SESSION_LISTING);
        let target = Target::new("192.168.206.50:3260", CTR1, 0);
        let exec = FakeExec::new().reply(&lsblk(&target), LSBLK_MPATH);
        let host = FakeHost::new().link(target.by_path());

        let devices = get_devices(&exec, &host, &sessions, &[target.clone()], &quick(3));
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["dm-0", "sdb"]);
        assert_eq!(host.probes(target.by_path()), 1);
    }

    #[test]
    fn waits_while_lun_session_exists() {
        let sessions = parse_sessions(SESSION_LISTING);
        let target = Target::new("192.168.206.50:3260", CTR1, 1);
        let exec = FakeExec::new().reply(&lsblk(&target), "sdc sdc  disk running 10G V M S\n");
        let host = FakeHost::new().link_after(target.by_path(), 2);

        let devices = get_devices(&exec, &host, &sessions, &[target.clone()], &quick(5));
        assert!(devices.contains_key("sdc"));
        assert_eq!(host.probes(target.by_path()), 3);
    }

    #[test]
    fn gives_up_after_retry_budget() {
        let sessions = parse_sessions(SESSION_LISTING);
        let target = Target::new("192.168.206.50:3260", CTR1, 0);
        let exec = FakeExec::new();
        let host = FakeHost::new();

        let devices = get_devices(&exec, &host, &sessions, &[target.clone()], &quick(4));
        assert!(devices.is_empty());
        assert_eq!(host.probes(target.by_path()), 5);
        assert_eq!(exec.count("lsblk"), 0);
    }

    #[test]
    fn no_lun_session_gives_up_immediately() {
        let sessions = parse_sessions(SESSION_LISTING);
        let target = Target::new("192.168.206.50:3260", CTR1, 9);
        let exec = FakeExec::new();
        let host = FakeHost::new();

        let devices = get_devices(&exec, &host, &sessions, &[target.clone()], &quick(30));
        assert!(devices.is_empty());
        assert_eq!(host.probes(target.by_path()), 1);
        assert_eq!(exec.count("lsblk"), 0);
    }

    #[test]
    fn failed_query_skips_only_that_target() {
        let sessions = parse_sessions(SESSION_LISTING);
        let broken = Target::new("192.168.206.50:3260", CTR1, 0);
        let healthy = Target::new("192.168.206.50:3260", CTR1, 1);
        let exec = FakeExec::new()
            .fail(&lsblk(&broken), "lsblk: not a block device")
            .reply(&lsblk(&healthy), "sdc sdc  disk running 10G V M S\n");
        let host = FakeHost::new()
            .link(broken.by_path())
            .link(healthy.by_path());

        let devices = get_devices(&exec, &host, &sessions, &[broken, healthy], &quick(1));
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["sdc"]);
    }
}
