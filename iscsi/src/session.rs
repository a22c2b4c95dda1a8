use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{Executor, Target};

static SESSION_TARGET: &str = "Target:";
static SESSION_PORTAL: &str = "Current Portal:";
static SESSION_STATE: &str = "iSCSI Session State:";
static SESSION_SCSI: &str = "scsi";
static SESSION_DISK: &str = "Attached scsi disk";

/// An established iSCSI session as reported by `iscsiadm -m session -P 3`.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct Session {
    portal: String,
    target: String,
    state: String,
    scsi_devices: Vec<ScsiDevice>,
}

impl Session {
    pub fn portal(&self) -> &str {
        &self.portal
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Session state such as `LOGGED_IN` or `FAILED`.
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn scsi_devices(&self) -> &[ScsiDevice] {
        &self.scsi_devices
    }

    fn is_for(&self, target: &Target) -> bool {
        self.portal == target.portal() && self.target == target.name()
    }
}

/// A SCSI LUN attached under a session.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct ScsiDevice {
    lun: u64,
    name: String,
    state: String,
}

impl ScsiDevice {
    pub fn lun(&self) -> u64 {
        self.lun
    }

    /// Kernel device name, like `sdb`. Empty until a disk is attached.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &str {
        &self.state
    }
}

/// Lists sessions, returning an empty list when `iscsiadm` fails.
///
/// `iscsiadm` exits non-zero when no session exists at all, so a failed query
/// and an idle initiator look the same here. Use [`try_get_sessions`] to tell
/// them apart.
pub fn get_sessions<E: Executor>(exec: &E) -> Vec<Session> {
    match try_get_sessions(exec) {
        Ok(sessions) => sessions,
        Err(e) => {
            log::warn!("Failed to get session, err: {}", e);
            Vec::new()
        }
    }
}

pub fn try_get_sessions<E: Executor>(exec: &E) -> Result<Vec<Session>> {
    let out = exec.run("iscsiadm", &["-m", "session", "-P", "3"])?;
    Ok(parse_sessions(&out))
}

/// Parses the verbose session listing, keeping the order it reports.
///
/// Unrecognized lines are skipped and an unparsable LUN reads as 0.
pub fn parse_sessions(text: &str) -> Vec<Session> {
    let mut sessions: Vec<Session> = Vec::new();
    let mut cur_target = String::new();

    for line in text.lines().map(str::trim) {
        if line.starts_with(SESSION_TARGET) {
            cur_target = line
                .split_whitespace()
                .nth(1)
                .unwrap_or_default()
                .to_string();
        } else if line.starts_with(SESSION_PORTAL) {
            let value = field_value(line);
            sessions.push(Session {
                portal: value.split(',').next().unwrap_or_default().to_string(),
                target: cur_target.clone(),
                ..Default::default()
            });
        } else if line.starts_with(SESSION_STATE) {
            if let Some(session) = sessions.last_mut() {
                session.state = field_value(line).to_string();
            }
        } else if line.starts_with(SESSION_SCSI) {
            if let Some(session) = sessions.last_mut() {
                session.scsi_devices.push(ScsiDevice {
                    lun: field_value(line).parse::<u32>().map(u64::from).unwrap_or(0),
                    ..Default::default()
                });
            }
        } else if line.starts_with(SESSION_DISK) {
            let device = sessions
                .last_mut()
                .and_then(|session| session.scsi_devices.last_mut());
            if let Some(device) = device {
                device.name = line
                    .split_whitespace()
                    .nth(3)
                    .unwrap_or_default()
                    .to_string();
                device.state = field_value(line).to_string();
            }
        }
    }

    sessions
}

/// `true` if a session exists for the target's (portal, name).
pub fn target_session_exists(sessions: &[Session], target: &Target) -> bool {
    sessions.iter().any(|sess| sess.is_for(target))
}

/// `true` if a session for the target's (portal, name) exposes its LUN.
pub fn lun_session_exists(sessions: &[Session], target: &Target) -> bool {
    sessions
        .iter()
        .filter(|sess| sess.is_for(target))
        .flat_map(|sess| sess.scsi_devices.iter())
        .any(|dev| dev.lun == target.lun())
}

/// Value after the first `:` of a `Key: value` line, `<empty>` read as "".
fn field_value(line: &str) -> &str {
    let value = line.split_once(':').map(|(_, v)| v.trim()).unwrap_or("");
    if value == "<empty>" {
        ""
    } else {
        value
    }
}

#[cfg(test)]
pub(crate) static SESSION_LISTING: &str = "\
iSCSI Transport Class version 2.0-870
version 2.1.5
Target: iqn.2004-08.com.qsan:xf2026-000d42f58:dev2.ctr1 (non-flash)
\tCurrent Portal: 192.168.206.50:3260,1
\tPersistent Portal: 192.168.206.50:3260,1
\t\t**********
\t\tInterface:
\t\t**********
\t\tIface Name: default
\t\tIface Initiatorname: iqn.1993-08.org.debian:01:c0ffee
\t\tIface IPaddress: <empty>
\t\tiSCSI Connection State: LOGGED IN
\t\tiSCSI Session State: LOGGED_IN
\t\tInternal iscsid Session State: NO CHANGE
\t\t************************
\t\tAttached SCSI devices:
\t\t************************
\t\tHost Number: 3\tState: running
\t\tscsi3 Channel 00 Id 0 Lun: 0
\t\t\tAttached scsi disk sdb\t\tState: running
\t\tscsi3 Channel 00 Id 0 Lun: 1
\t\t\tAttached scsi disk sdc\t\tState: offline
Target: iqn.2004-08.com.qsan:xf2026-000d42f58:dev2.ctr2 (non-flash)
\tCurrent Portal: 192.168.206.51:3260,2
\tPersistent Portal: 192.168.206.51:3260,2
\t\tiSCSI Session State: FAILED
\t\t************************
\t\tAttached SCSI devices:
\t\t************************
\t\tHost Number: 4\tState: running
\t\tscsi4 Channel 00 Id 0 Lun: 0
\t\t\tAttached scsi disk sdd\t\tState: running
";
