use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("A fatal error occured: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),

    #[error("Command '{cmd}' failed: {output}")]
    CommandFailed { cmd: String, output: String },
    #[error("Command '{cmd}' did not finish within {timeout:?} and was killed.")]
    CommandTimeout { cmd: String, timeout: Duration },

    #[error("Login failed, no target has a session: '{e}'")]
    LoginFailed {
        #[source]
        e: anyhow::Error,
    },
    #[error("Logout failed: '{e}'")]
    LogoutFailed {
        #[source]
        e: anyhow::Error,
    },
    #[error("Failed to rescan session of target '{target}': '{e}'")]
    RescanFailed {
        target: String,
        #[source]
        e: anyhow::Error,
    },

    #[error("Invalid device path '{0}', expected '/dev/<name>'.")]
    InvalidDevicePath(String),
    #[error("Failed to read by-path directory '{dir}': '{e}'")]
    ByPathDirUnreadable { dir: String, e: std::io::Error },
}
