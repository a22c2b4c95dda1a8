use std::collections::BTreeMap;
use std::path::Path;
use std::thread;

use anyhow::Result;
use regex::Regex;

use crate::device::get_devices;
use crate::session::{get_sessions, target_session_exists};
use crate::target::BY_PATH_DIR;
use crate::{
    Device, Disk, Exec, Executor, Host, IscsiError, IscsiOptions, LocalHost, NodeOptions, Session,
    Target,
};

static DEV_PATH_PATTERN: &str = r"^/dev/([^/\s]+)$";
static SYS_BLOCK: &str = "/sys/block";

/// Initiator-side session and disk manager.
///
/// Every call reads the session list and block devices afresh; nothing is
/// cached between calls. Targets are handled one after another.
#[derive(Debug)]
pub struct IscsiUtil<E = Exec, H = LocalHost> {
    opts: IscsiOptions,
    exec: E,
    host: H,
}

impl IscsiUtil {
    /// ```no_run
    /// use iscsi_initiator::{IscsiOptions, IscsiUtil, Target};
    ///
    /// let iscsi = IscsiUtil::new(IscsiOptions::default());
    /// let targets = vec![Target::new("192.168.206.50:3260", "iqn.2004-08.com.qsan:dev2.ctr1", 0)];
    ///
    /// iscsi.login(&targets)?;
    /// let disk = iscsi.get_disk(&targets)?;
    /// println!("{} is {}", disk.name(), disk.status());
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn new(opts: IscsiOptions) -> Self {
        IscsiUtil::with(opts, Exec, LocalHost)
    }
}

impl<E: Executor, H: Host> IscsiUtil<E, H> {
    pub fn with(opts: IscsiOptions, exec: E, host: H) -> Self {
        IscsiUtil { opts, exec, host }
    }

    pub fn options(&self) -> &IscsiOptions {
        &self.opts
    }

    /// Logs in every target that has no session yet.
    ///
    /// Succeeds when at least one target ends up with a session, whether it
    /// already had one or was logged in now. Targets that already had a
    /// session trigger a rescan of all sessions afterwards.
    pub fn login(&self, targets: &[Target]) -> Result<()> {
        let sessions = get_sessions(&self.exec);
        let mut logged_in = 0;
        let mut need_rescan = false;
        let mut last_err: Option<anyhow::Error> = None;

        for target in targets {
            if target_session_exists(&sessions, target) {
                log::info!("Target session is already exist: {}", target);
                need_rescan = true;
                logged_in += 1;
                continue;
            }

            match self.login_target(target) {
                Ok(()) => logged_in += 1,
                Err(e) => {
                    log::error!("Failed to login {}, err: {}", target, e);
                    last_err = Some(e);
                }
            }
        }

        if need_rescan {
            if let Err(e) = self.rescan_all_sessions() {
                log::error!("Failed to rescan sessions after login, err: {}", e);
            }
        }

        if logged_in == 0 {
            let e = last_err.unwrap_or_else(|| anyhow::anyhow!("no target given"));
            anyhow::bail!(IscsiError::LoginFailed { e });
        }

        Ok(())
    }

    fn login_target(&self, target: &Target) -> Result<()> {
        let base = node_args(target);

        if let Err(e) = self.iscsiadm(&base, &["-o", "new"]) {
            log::error!("Failed to new node {}, err: {}", target, e);
        }

        if let Some(chap) = target.chap() {
            let mut opts = NodeOptions::new();
            opts.insert("node.session.auth.authmethod", "CHAP")
                .insert("node.session.auth.username", chap.user())
                .insert("node.session.auth.password", chap.passwd());

            let mut update = vec!["-o", "update"];
            update.extend(opts.to_args());
            if let Err(e) = self.iscsiadm(&base, &update) {
                log::error!("Failed to set CHAP config of {}, err: {}", target, e);
            }
        }

        let args = [&base[..], &["-l"][..]].concat();
        self.exec
            .run_timeout("iscsiadm", &args, self.opts.timeout())?;
        log::info!("Logged in {}", target);

        Ok(())
    }

    /// Logs out and deletes the node of every target that has a session.
    ///
    /// Every target is processed; the call fails if any logout or delete did.
    pub fn logout(&self, targets: &[Target]) -> Result<()> {
        let sessions = get_sessions(&self.exec);
        let mut last_err: Option<anyhow::Error> = None;

        for target in targets {
            if !target_session_exists(&sessions, target) {
                log::warn!("Target session not exist: {}", target);
                continue;
            }

            let base = node_args(target);
            let args = [&base[..], &["-u"][..]].concat();
            if let Err(e) = self
                .exec
                .run_timeout("iscsiadm", &args, self.opts.timeout())
            {
                log::error!("Failed to logout {}, err: {}", target, e);
                last_err = Some(e);
            }

            if let Err(e) = self.iscsiadm(&base, &["-o", "delete"]) {
                log::error!("Failed to delete node {}, err: {}", target, e);
                last_err = Some(e);
            }
        }

        match last_err {
            Some(e) => anyhow::bail!(IscsiError::LogoutFailed { e }),
            None => Ok(()),
        }
    }

    pub fn get_session(&self) -> Vec<Session> {
        get_sessions(&self.exec)
    }

    /// Rescans every established session for new or resized LUNs.
    pub fn rescan_all_sessions(&self) -> Result<()> {
        self.exec
            .run("iscsiadm", &["-m", "session", "--rescan"])
            .map_err(|e| IscsiError::RescanFailed {
                target: "*".to_string(),
                e,
            })?;
        Ok(())
    }

    /// Rescans the sessions of each target, stopping at the first failure.
    pub fn rescan_session_by_target(&self, targets: &[Target]) -> Result<()> {
        for target in targets {
            self.exec
                .run("iscsiadm", &["-m", "node", "-T", target.name(), "--rescan"])
                .map_err(|e| IscsiError::RescanFailed {
                    target: target.name().to_string(),
                    e,
                })?;
        }
        Ok(())
    }

    /// Consolidates the block devices of `targets` into one logical disk.
    ///
    /// Polls until a per-path disk shows up, or with `force_mpio` and several
    /// targets until multipath has assembled them. Targets that never show a
    /// device only lower the counts of the result.
    pub fn get_disk(&self, targets: &[Target]) -> Result<Disk> {
        let sessions = get_sessions(&self.exec);
        let force_mpio = self.opts.force_mpio;
        let retry = &self.opts.dm_retry;
        log::debug!(
            "[get_disk] target_cnt={} force_mpio={}",
            targets.len(),
            force_mpio
        );

        let mut retries = 0;
        let devices = loop {
            let devices = get_devices(
                &self.exec,
                &self.host,
                &sessions,
                targets,
                &self.opts.device_retry,
            );
            if !self.need_wait(&devices, targets.len()) {
                break devices;
            }
            if retries >= retry.count {
                log::warn!("[get_disk] devices not ready after {} retries", retries);
                break devices;
            }

            retries += 1;
            log::trace!(
                "[get_disk] sleep {:?} then try again, retries={}",
                retry.delay(),
                retries
            );
            thread::sleep(retry.delay());
        };

        Ok(Disk::consolidate(devices, targets.len(), force_mpio))
    }

    fn need_wait(&self, devices: &BTreeMap<String, Device>, target_cnt: usize) -> bool {
        let disk_cnt = devices.values().filter(|dev| dev.is_disk()).count();
        let mpath_cnt = devices.values().filter(|dev| dev.is_mpath()).count();

        if self.opts.force_mpio && target_cnt > 1 {
            mpath_cnt == 0 && disk_cnt > 0
        } else {
            disk_cnt == 0
        }
    }

    /// Offlines then deletes a SCSI disk through sysfs, e.g. `/dev/sdb`.
    pub fn remove_disk<S: AsRef<str>>(&self, dev_path: S) -> Result<()> {
        let dev_path = dev_path.as_ref();
        let re = Regex::new(DEV_PATH_PATTERN)?;
        let dev_name = match re.captures(dev_path).and_then(|caps| caps.get(1)) {
            Some(name) => name.as_str(),
            None => anyhow::bail!(IscsiError::InvalidDevicePath(dev_path.to_string())),
        };

        let device = Path::new(SYS_BLOCK).join(dev_name).join("device");
        self.host.echo(&device.join("state"), "offline\n")?;
        self.host.echo(&device.join("delete"), "1")?;
        log::info!("Removed disk {}", dev_path);

        Ok(())
    }

    /// `true` if any of the targets has a session.
    pub fn is_session_exist(&self, targets: &[Target]) -> bool {
        let sessions = get_sessions(&self.exec);
        targets
            .iter()
            .any(|target| target_session_exists(&sessions, target))
    }

    /// `true` if any block device reached through the targets is mounted.
    pub fn has_another_used_disk(&self, targets: &[Target]) -> Result<bool> {
        let by_path = Path::new(BY_PATH_DIR);
        let mut names: Vec<String> = Vec::new();
        let mut mounted = 0;
        let mut total = 0;

        for target in targets {
            let prefix = target.by_path_prefix();
            let entries = self.host.list_dir(by_path).map_err(|e| {
                IscsiError::ByPathDirUnreadable {
                    dir: BY_PATH_DIR.to_string(),
                    e,
                }
            })?;

            for entry in entries.iter().filter(|entry| entry.starts_with(&prefix)) {
                total += 1;
                let path = by_path.join(entry);
                let path = path.to_string_lossy().into_owned();
                let out = match self
                    .exec
                    .run("lsblk", &["-rn", "-o", "NAME,KNAME,MOUNTPOINT", path.as_str()])
                {
                    Ok(out) => out,
                    Err(e) => {
                        log::debug!("[has_another_used_disk] skip {}, err: {}", entry, e);
                        continue;
                    }
                };

                let mut entry_mounted = false;
                for line in out.lines().filter(|line| !line.trim().is_empty()) {
                    let tokens: Vec<&str> = line.split(' ').collect();
                    names.extend(tokens.iter().take(2).map(|s| s.to_string()));
                    if let Some(mount_path) = tokens.get(2).filter(|s| !s.is_empty()) {
                        log::debug!(
                            "[has_another_used_disk] {}, mountpoint({})",
                            entry,
                            mount_path
                        );
                        entry_mounted = true;
                    }
                }
                if entry_mounted {
                    mounted += 1;
                }
            }
        }

        log::debug!(
            "[has_another_used_disk] mounted: {}/{}, devices: {:?}",
            mounted,
            total,
            names
        );

        let mounts = self.host.mounts().unwrap_or_else(|e| {
            log::debug!("[has_another_used_disk] list mounts err: {}", e);
            Vec::new()
        });
        for mp in mounts {
            let dev_name = if mp.device == "udev" {
                match self.exec.run("lsblk", &["-rn", "-o", "KNAME", mp.path.as_str()]) {
                    Ok(out) => out.lines().next().unwrap_or_default().trim().to_string(),
                    Err(_) => continue,
                }
            } else if let Some(name) = mp
                .device
                .strip_prefix("/dev/mapper/")
                .or_else(|| mp.device.strip_prefix("/dev/"))
            {
                name.to_string()
            } else {
                continue;
            };

            if !dev_name.is_empty() && names.contains(&dev_name) {
                log::debug!(
                    "[has_another_used_disk] found {} path({}) dev_name({})",
                    mp.device,
                    mp.path,
                    dev_name
                );
                return Ok(true);
            }
        }

        Ok(mounted > 0)
    }

    fn iscsiadm(&self, base: &[&str], args: &[&str]) -> Result<String> {
        let args = [base, args].concat();
        self.exec.run("iscsiadm", &args)
    }
}

fn node_args(target: &Target) -> Vec<&str> {
    vec!["-m", "node", "-T", target.name(), "-p", target.portal()]
}
