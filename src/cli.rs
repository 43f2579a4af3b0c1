use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::VmError;
use crate::model::{NetworkAdapter, NetworkKind, OsType, ScriptKind, SharedFolder, Trigger, VmStatus};

#[derive(Parser, Debug)]
#[command(
    name = "vboxctl",
    version,
    about = "Manage VirtualBox machines, snapshots and host scripts"
)]
pub struct Cli {
    /// Path to config file [default: <config dir>/vboxctl/vboxctl.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Virtual machines
    Vm {
        #[command(subcommand)]
        action: VmCommand,
    },
    /// Snapshots of a virtual machine
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },
    /// Host scripts
    Script {
        #[command(subcommand)]
        action: ScriptCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// List machines (reconciles with VirtualBox first)
    List {
        #[arg(long)]
        status: Option<VmStatus>,
        #[arg(long)]
        os_type: Option<OsType>,
        /// Case-insensitive match on name or description
        #[arg(long)]
        search: Option<String>,
        /// Skip the reconcile pass
        #[arg(long)]
        no_sync: bool,
        #[command(flatten)]
        pages: PageArgs,
    },
    /// Show one machine, refreshed from VirtualBox
    Show { name: String },
    /// Create and register a machine
    Create {
        name: String,
        #[arg(long, default_value = "linux")]
        os_type: OsType,
        #[arg(long, default_value_t = 2048)]
        memory: u64,
        #[arg(long, default_value_t = 2)]
        cpus: u32,
        /// Disk size in GB
        #[arg(long, default_value_t = 20)]
        disk: u64,
        #[arg(long, default_value = "")]
        description: String,
        /// Network adapter type, repeatable [default: nat]
        #[arg(long = "network", value_parser = parse_network)]
        networks: Vec<NetworkAdapter>,
        /// NAME=HOST_PATH[,GUEST_PATH][,ro], repeatable
        #[arg(long = "share", value_parser = parse_shared_folder)]
        shares: Vec<SharedFolder>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Change stored settings of a machine
    Update {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        memory: Option<u64>,
        #[arg(long)]
        cpus: Option<u32>,
        /// Replace all network adapters
        #[arg(long = "network", value_parser = parse_network)]
        networks: Vec<NetworkAdapter>,
        /// Replace all shared folders
        #[arg(long = "share", value_parser = parse_shared_folder)]
        shares: Vec<SharedFolder>,
        /// Replace all tags
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Start headless
    Start { name: String },
    /// Stop via ACPI, or power off with --force
    Stop {
        name: String,
        #[arg(long)]
        force: bool,
    },
    Pause { name: String },
    Resume { name: String },
    /// Hard reset
    Restart { name: String },
    /// Unregister a machine and forget it
    Delete {
        name: String,
        /// Also delete disks and settings files
        #[arg(long)]
        delete_files: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Save a PNG screenshot of a running machine
    Screenshot { name: String, out: PathBuf },
    /// Run a command inside a running guest
    Exec {
        name: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "VBOXCTL_GUEST_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Bring stored status in line with VirtualBox
    Reconcile,
}

/// 1-based paging for list commands.
#[derive(Args, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageArgs {
    #[arg(long, default_value_t = 1)]
    pub page: usize,
    /// Entries per page, 0 for all
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// List snapshots, newest first, for one machine or all of them
    List {
        vm: Option<String>,
        /// Case-insensitive match on name or description
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        pages: PageArgs,
    },
    Take {
        vm: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Restore a snapshot (machine must be stopped)
    Restore { vm: String, name: String },
    /// Delete a snapshot and its descendants
    Delete {
        vm: String,
        name: String,
        /// Keep descendants and attach them to the deleted snapshot's parent
        #[arg(long)]
        reparent: bool,
    },
    Update {
        vm: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Replace all tags
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Align stored snapshots with VirtualBox
    Sync { vm: String },
}

#[derive(Subcommand, Debug)]
pub enum ScriptCommand {
    List {
        #[arg(long)]
        kind: Option<ScriptKind>,
        #[arg(long)]
        trigger: Option<Trigger>,
        /// Only scripts associated with this machine
        #[arg(long)]
        vm: Option<String>,
        #[arg(long)]
        active: bool,
        /// Case-insensitive match on name or description
        #[arg(long)]
        search: Option<String>,
        #[command(flatten)]
        pages: PageArgs,
    },
    /// Register a script, reading its body from a file
    Add {
        name: String,
        #[arg(long)]
        kind: ScriptKind,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "manual")]
        trigger: Trigger,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 0)]
        order: u32,
        /// Seconds [default: scripts.default_timeout_s]
        #[arg(long)]
        timeout: Option<u32>,
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        #[arg(long)]
        working_dir: Option<String>,
        #[arg(long)]
        admin: bool,
        #[arg(long)]
        continue_on_error: bool,
        /// Associated machine, repeatable
        #[arg(long = "vm")]
        vms: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Show { name: String },
    Update {
        name: String,
        /// Replace the body with this file's contents
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        trigger: Option<Trigger>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        order: Option<u32>,
        #[arg(long)]
        timeout: Option<u32>,
        /// Replace the environment
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
        #[arg(long)]
        working_dir: Option<String>,
        #[arg(long)]
        admin: Option<bool>,
        #[arg(long)]
        continue_on_error: Option<bool>,
        #[arg(long)]
        active: Option<bool>,
        /// Replace all tags
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Delete { name: String },
    /// Link or unlink machines
    Associate {
        name: String,
        #[arg(long = "add")]
        add: Vec<String>,
        #[arg(long = "remove")]
        remove: Vec<String>,
    },
    /// Run a script on the host
    Run {
        name: String,
        /// Target machine, exported as VM_NAME / VM_ID / VM_STATUS
        #[arg(long)]
        vm: Option<String>,
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },
    /// Execution history, newest first
    History {
        name: String,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Stats { name: String },
}

fn parse_env(s: &str) -> Result<(String, String), VmError> {
    crate::util::parse_env_pair(s)
}

fn parse_network(s: &str) -> Result<NetworkAdapter, VmError> {
    Ok(NetworkAdapter {
        kind: s.parse::<NetworkKind>()?,
        enabled: true,
    })
}

/// `NAME=HOST_PATH[,GUEST_PATH][,ro]`
pub fn parse_shared_folder(s: &str) -> Result<SharedFolder, VmError> {
    let (name, rest) = s
        .split_once('=')
        .filter(|(name, rest)| !name.is_empty() && !rest.is_empty())
        .ok_or_else(|| {
            VmError::validation(format!(
                "shared folder must look like NAME=HOST_PATH[,GUEST_PATH][,ro] (got '{s}')"
            ))
        })?;
    let mut parts = rest.split(',');
    let host_path = parts.next().unwrap_or_default().to_string();
    let mut folder = SharedFolder {
        name: name.to_string(),
        host_path,
        ..Default::default()
    };
    for part in parts {
        match part {
            "ro" => folder.read_only = true,
            "" => {}
            guest => folder.guest_path = guest.to_string(),
        }
    }
    Ok(folder)
}
