use std::path::PathBuf;

/// Default config file: `~/.config/vboxctl/vboxctl.toml`
pub fn config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vboxctl")
        .join("vboxctl.toml")
}

/// State directory: `~/.local/share/vboxctl/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vboxctl")
}

/// Where new machines keep their disks: `~/VirtualBox VMs/`
pub fn vm_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("VirtualBox VMs")
}

/// Scratch space for materialized scripts.
pub fn script_temp_dir() -> PathBuf {
    std::env::temp_dir().join("vboxctl-scripts")
}

/// Document store file under a data directory.
pub fn store_file(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("state.json")
}

/// Log directory under a data directory.
pub fn logs_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("logs")
}

/// Disk image for a machine: `<vm_dir>/<name>/<name>.vdi`
pub fn disk_path(vm_dir: &std::path::Path, name: &str) -> PathBuf {
    vm_dir.join(name).join(format!("{name}.vdi"))
}
