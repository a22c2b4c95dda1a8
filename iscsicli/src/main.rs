use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use iscsi_initiator::{Config, IscsiUtil};

/// Attach iSCSI targets and inspect the disk they form.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// YAML file with `options` and `targets`
    #[arg(short, long, default_value = "/etc/iscsicli.yml")]
    config: PathBuf,

    /// Raise log verbosity, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in every target that has no session yet
    Login,
    /// Log out and delete the nodes of every target
    Logout,
    /// List established sessions
    Sessions,
    /// Show the consolidated disk of the targets
    Disk,
    /// Rescan sessions, all of them unless --targets is given
    Rescan {
        #[arg(long)]
        targets: bool,
    },
    /// Offline and delete a SCSI disk, e.g. /dev/sdb
    Remove { device: String },
    /// Exit with status 1 unless a target has a session
    Exists,
    /// Exit with status 1 unless a device of the targets is mounted
    InUse,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let cfg = Config::read(&cli.config)?;
    let targets = cfg.targets();
    log::debug!("loaded {} targets from {}", targets.len(), cli.config.display());

    let iscsi = IscsiUtil::new(cfg.options().clone());

    match cli.command {
        Command::Login => iscsi.login(&targets)?,
        Command::Logout => iscsi.logout(&targets)?,
        Command::Sessions => print!("{}", serde_yml::to_string(&iscsi.get_session())?),
        Command::Disk => print!("{}", serde_yml::to_string(&iscsi.get_disk(&targets)?)?),
        Command::Rescan { targets: false } => iscsi.rescan_all_sessions()?,
        Command::Rescan { targets: true } => iscsi.rescan_session_by_target(&targets)?,
        Command::Remove { device } => iscsi.remove_disk(device)?,
        Command::Exists => {
            if !iscsi.is_session_exist(&targets) {
                std::process::exit(1);
            }
        }
        Command::InUse => {
            if !iscsi.has_another_used_disk(&targets)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
