use std::fmt;
use std::str::FromStr;

use facet::Facet;

use crate::error::VmError;
use crate::util;

pub const MIN_MEMORY_MB: u64 = 512;
pub const MIN_CPUS: u32 = 1;
pub const MAX_CPUS: u32 = 32;
pub const MIN_DISK_GB: u64 = 1;

/// Lifecycle status as recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum VmStatus {
    Running,
    #[default]
    Stopped,
    Paused,
    Saved,
    Unknown,
}

impl VmStatus {
    /// Map a raw `VMState` value from `showvminfo` onto the stored status.
    pub fn from_tool_state(state: &str) -> Self {
        match state {
            "running" => VmStatus::Running,
            "paused" => VmStatus::Paused,
            "saved" => VmStatus::Saved,
            "poweroff" | "aborted" => VmStatus::Stopped,
            _ => VmStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Saved => "saved",
            VmStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(VmStatus::Running),
            "stopped" => Ok(VmStatus::Stopped),
            "paused" => Ok(VmStatus::Paused),
            "saved" => Ok(VmStatus::Saved),
            "unknown" => Ok(VmStatus::Unknown),
            other => Err(VmError::validation(format!("unknown VM status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
pub enum OsType {
    Windows,
    #[default]
    Linux,
    #[facet(rename = "MacOS")]
    MacOs,
    Other,
}

impl OsType {
    /// The `--ostype` identifier passed to `createvm`.
    pub fn vbox_os_type(self) -> &'static str {
        match self {
            OsType::Windows => "Windows10_64",
            OsType::Linux => "Linux_64",
            OsType::MacOs => "MacOS_64",
            OsType::Other => "Other",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OsType::Windows => "Windows",
            OsType::Linux => "Linux",
            OsType::MacOs => "MacOS",
            OsType::Other => "Other",
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsType {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(OsType::Windows),
            "linux" => Ok(OsType::Linux),
            "macos" => Ok(OsType::MacOs),
            "other" => Ok(OsType::Other),
            _ => Err(VmError::validation(format!(
                "unknown OS type '{s}' (use Windows, Linux, MacOS or Other)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
pub enum NetworkKind {
    #[default]
    #[facet(rename = "NAT")]
    Nat,
    Bridged,
    Internal,
    #[facet(rename = "Host-only")]
    HostOnly,
}

impl NetworkKind {
    /// Value for `modifyvm --nic<N>`.
    pub fn vbox_nic_mode(self) -> &'static str {
        match self {
            NetworkKind::Nat => "nat",
            NetworkKind::Bridged => "bridged",
            NetworkKind::Internal => "intnet",
            NetworkKind::HostOnly => "hostonly",
        }
    }
}

impl FromStr for NetworkKind {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nat" => Ok(NetworkKind::Nat),
            "bridged" => Ok(NetworkKind::Bridged),
            "internal" => Ok(NetworkKind::Internal),
            "host-only" | "hostonly" => Ok(NetworkKind::HostOnly),
            _ => Err(VmError::validation(format!(
                "unknown network type '{s}' (use NAT, Bridged, Internal or Host-only)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct NetworkAdapter {
    pub kind: NetworkKind,
    #[facet(default = true)]
    pub enabled: bool,
}

impl Default for NetworkAdapter {
    fn default() -> Self {
        Self {
            kind: NetworkKind::Nat,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
#[facet(default)]
pub struct SharedFolder {
    pub name: String,
    pub host_path: String,
    pub guest_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct VirtualMachine {
    pub id: String,
    /// Join key against VBoxManage. Unique across the store.
    pub name: String,
    /// UUID reported by VBoxManage at creation.
    pub uuid: Option<String>,
    pub description: String,
    pub os_type: OsType,
    pub memory_mb: u64,
    pub cpus: u32,
    pub disk_size_gb: u64,
    pub network_adapters: Vec<NetworkAdapter>,
    pub shared_folders: Vec<SharedFolder>,
    pub status: VmStatus,
    pub last_started: Option<u64>,
    pub last_stopped: Option<u64>,
    pub startup_scripts: Vec<String>,
    pub shutdown_scripts: Vec<String>,
    pub snapshots: Vec<String>,
    pub current_snapshot: Option<String>,
    pub tags: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl VirtualMachine {
    /// Milliseconds since the last start while running, otherwise zero.
    pub fn uptime_ms(&self, now: u64) -> u64 {
        match (self.status, self.last_started) {
            (VmStatus::Running, Some(started)) => now.saturating_sub(started),
            _ => 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = util::now_ms();
    }

    pub(crate) fn references_script(&self, script_id: &str) -> bool {
        self.startup_scripts.iter().any(|id| id == script_id)
            || self.shutdown_scripts.iter().any(|id| id == script_id)
    }

    pub(crate) fn detach_script(&mut self, script_id: &str) -> bool {
        let before = self.startup_scripts.len() + self.shutdown_scripts.len();
        self.startup_scripts.retain(|id| id != script_id);
        self.shutdown_scripts.retain(|id| id != script_id);
        before != self.startup_scripts.len() + self.shutdown_scripts.len()
    }
}

/// Everything needed to create a machine.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSpec {
    pub name: String,
    pub description: String,
    pub os_type: OsType,
    pub memory_mb: u64,
    pub cpus: u32,
    pub disk_size_gb: u64,
    pub network_adapters: Vec<NetworkAdapter>,
    pub shared_folders: Vec<SharedFolder>,
    pub tags: Vec<String>,
}

impl VmSpec {
    pub fn new(name: impl Into<String>, os_type: OsType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            os_type,
            memory_mb: 2048,
            cpus: 2,
            disk_size_gb: 20,
            network_adapters: vec![NetworkAdapter::default()],
            shared_folders: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), VmError> {
        super::validate_name("VM", &self.name)?;
        super::validate_description(&self.description)?;
        validate_resources(self.memory_mb, self.cpus)?;
        if self.disk_size_gb < MIN_DISK_GB {
            return Err(VmError::validation(format!(
                "disk size must be at least {MIN_DISK_GB} GB"
            )));
        }
        validate_shared_folders(&self.shared_folders)
    }

    pub(crate) fn into_record(self, uuid: Option<String>) -> VirtualMachine {
        let now = util::now_ms();
        let network_adapters = if self.network_adapters.is_empty() {
            vec![NetworkAdapter::default()]
        } else {
            self.network_adapters
        };
        VirtualMachine {
            id: util::new_id(),
            name: self.name,
            uuid,
            description: self.description,
            os_type: self.os_type,
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            disk_size_gb: self.disk_size_gb,
            network_adapters,
            shared_folders: self.shared_folders,
            status: VmStatus::Stopped,
            tags: self.tags,
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }
}

/// Record-only edits. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmUpdate {
    pub description: Option<String>,
    pub memory_mb: Option<u64>,
    pub cpus: Option<u32>,
    pub network_adapters: Option<Vec<NetworkAdapter>>,
    pub shared_folders: Option<Vec<SharedFolder>>,
    pub tags: Option<Vec<String>>,
}

impl VmUpdate {
    pub fn is_empty(&self) -> bool {
        *self == VmUpdate::default()
    }

    /// Validate against the resulting record, then apply.
    pub fn apply(self, vm: &mut VirtualMachine) -> Result<(), VmError> {
        if let Some(description) = &self.description {
            super::validate_description(description)?;
        }
        validate_resources(
            self.memory_mb.unwrap_or(vm.memory_mb),
            self.cpus.unwrap_or(vm.cpus),
        )?;
        if let Some(folders) = &self.shared_folders {
            validate_shared_folders(folders)?;
        }

        if let Some(description) = self.description {
            vm.description = description;
        }
        if let Some(memory_mb) = self.memory_mb {
            vm.memory_mb = memory_mb;
        }
        if let Some(cpus) = self.cpus {
            vm.cpus = cpus;
        }
        if let Some(adapters) = self.network_adapters {
            vm.network_adapters = adapters;
        }
        if let Some(folders) = self.shared_folders {
            vm.shared_folders = folders;
        }
        if let Some(tags) = self.tags {
            vm.tags = tags;
        }
        vm.touch();
        Ok(())
    }
}

fn validate_resources(memory_mb: u64, cpus: u32) -> Result<(), VmError> {
    if memory_mb < MIN_MEMORY_MB {
        return Err(VmError::validation(format!(
            "memory must be at least {MIN_MEMORY_MB} MB"
        )));
    }
    if !(MIN_CPUS..=MAX_CPUS).contains(&cpus) {
        return Err(VmError::validation(format!(
            "CPU count must be between {MIN_CPUS} and {MAX_CPUS}"
        )));
    }
    Ok(())
}

fn validate_shared_folders(folders: &[SharedFolder]) -> Result<(), VmError> {
    for folder in folders {
        if folder.name.trim().is_empty() || folder.host_path.trim().is_empty() {
            return Err(VmError::validation(
                "shared folders need a name and a host path",
            ));
        }
    }
    Ok(())
}
