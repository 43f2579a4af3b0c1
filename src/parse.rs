//! Parsers for `VBoxManage` machine-readable output.
//!
//! All parsers are lenient: lines that do not match the expected shape are
//! skipped, never reported as errors.

use std::collections::BTreeMap;

/// One entry of `VBoxManage list vms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedVm {
    pub name: String,
    pub uuid: String,
}

/// The subset of `showvminfo --machinereadable` the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Raw tool state (`poweroff`, `running`, `paused`, `saved`, `aborted`, ...)
    /// or `unknown` when the key is absent.
    pub state: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub os_type: String,
}

impl Default for VmInfo {
    fn default() -> Self {
        Self {
            state: "unknown".into(),
            memory_mb: 0,
            cpus: 1,
            os_type: "Unknown".into(),
        }
    }
}

impl VmInfo {
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            state: map
                .get("VMState")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or(defaults.state),
            memory_mb: map
                .get("memory")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.memory_mb),
            cpus: map
                .get("cpus")
                .and_then(|v| v.parse().ok())
                .filter(|&c| c > 0)
                .unwrap_or(defaults.cpus),
            os_type: map
                .get("ostype")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or(defaults.os_type),
        }
    }
}

/// Parse `list vms` output: lines of the form `"<name>" {<uuid>}`.
pub fn parse_vm_list(output: &str) -> Vec<ListedVm> {
    output.lines().filter_map(parse_vm_list_line).collect()
}

fn parse_vm_list_line(line: &str) -> Option<ListedVm> {
    let line = line.trim();
    let rest = line.strip_prefix('"')?;
    // Names may contain quotes; the closing quote is the last one before ` {`.
    let split = rest.rfind("\" {")?;
    let name = &rest[..split];
    let uuid = rest[split + 3..].strip_suffix('}')?;
    if name.is_empty() || uuid.is_empty() || uuid.contains(char::is_whitespace) {
        return None;
    }
    Some(ListedVm {
        name: name.to_string(),
        uuid: uuid.to_string(),
    })
}

/// Parse `key=value` lines into a map. Keys and values may be wrapped in
/// double quotes; the wrapping is removed. The split happens at the first
/// `=` so values may contain `=` themselves.
pub fn parse_machine_readable(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = unquote(key.trim());
            let value = unquote(value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

pub fn parse_vm_info(output: &str) -> VmInfo {
    VmInfo::from_map(&parse_machine_readable(output))
}

/// Extract snapshot names from `snapshot <vm> list --machinereadable`.
///
/// Nested snapshots appear as `SnapshotName-1`, `SnapshotName-1-1`, ... in
/// tree order. `CurrentSnapshotName` is not a snapshot entry and is skipped.
/// Duplicates are returned as reported.
pub fn parse_snapshot_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with("SnapshotName"))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let suffix = &key["SnapshotName".len()..];
            let is_name_key = suffix.is_empty()
                || (suffix.starts_with('-')
                    && suffix[1..].split('-').all(|n| n.parse::<u32>().is_ok()));
            is_name_key.then(|| unquote(value.trim()).to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Extract the machine UUID from `createvm` output (`UUID: <uuid>`).
pub fn parse_created_uuid(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "UUID")
            .then(|| value.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

fn unquote(s: &str) -> &str {
    let s = s.strip_prefix('"').unwrap_or(s);
    s.strip_suffix('"').unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_list_two_entries_in_order() {
        let out = "\"win10\" {550e8400-e29b-41d4-a716-446655440000}\n\"ubuntu\" {660e8400-e29b-41d4-a716-446655440000}";
        let vms = parse_vm_list(out);
        assert_eq!(
            vms,
            vec![
                ListedVm {
                    name: "win10".into(),
                    uuid: "550e8400-e29b-41d4-a716-446655440000".into(),
                },
                ListedVm {
                    name: "ubuntu".into(),
                    uuid: "660e8400-e29b-41d4-a716-446655440000".into(),
                },
            ]
        );
    }

    #[test]
    fn vm_list_skips_malformed_lines() {
        let out = "garbage line\n\"ok\" {1234}\n\"no-uuid\"\n{abcd}\n\"\" {ffff}\n";
        let vms = parse_vm_list(out);
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "ok");
        assert_eq!(vms[0].uuid, "1234");
    }

    #[test]
    fn vm_list_names_with_spaces() {
        let vms = parse_vm_list("\"Windows 10 Dev\" {aaaa-bbbb}\r\n");
        assert_eq!(vms[0].name, "Windows 10 Dev");
        assert_eq!(vms[0].uuid, "aaaa-bbbb");
    }

    #[test]
    fn vm_list_empty_output() {
        assert!(parse_vm_list("").is_empty());
    }

    #[test]
    fn vm_info_reads_consumed_keys() {
        let info = parse_vm_info("VMState=\"poweroff\"\nmemory=2048\ncpus=2\nostype=\"Linux\"");
        assert_eq!(info.state, "poweroff");
        assert_eq!(info.memory_mb, 2048);
        assert_eq!(info.cpus, 2);
        assert_eq!(info.os_type, "Linux");
    }

    #[test]
    fn vm_info_defaults_when_empty() {
        let info = parse_vm_info("");
        assert_eq!(info.state, "unknown");
        assert_eq!(info.memory_mb, 0);
        assert_eq!(info.cpus, 1);
    }

    #[test]
    fn vm_info_defaults_when_keys_missing_or_garbled() {
        let info = parse_vm_info("name=\"x\"\nmemory=lots\ncpus=\n");
        assert_eq!(info.state, "unknown");
        assert_eq!(info.memory_mb, 0);
        assert_eq!(info.cpus, 1);
    }

    #[test]
    fn machine_readable_keeps_equals_in_values() {
        let map = parse_machine_readable("description=\"a=b\"\n\"GuestProperty\"=\"x\"");
        assert_eq!(map["description"], "a=b");
        assert_eq!(map["GuestProperty"], "x");
    }

    #[test]
    fn snapshot_names_include_nested() {
        let out = "SnapshotName=\"base\"\nSnapshotUUID=\"1\"\nSnapshotName-1=\"child\"\nSnapshotName-1-1=\"grandchild\"\nCurrentSnapshotName=\"grandchild\"\nCurrentSnapshotUUID=\"3\"";
        assert_eq!(
            parse_snapshot_names(out),
            vec!["base", "child", "grandchild"]
        );
    }

    #[test]
    fn snapshot_names_keep_duplicates() {
        let out = "SnapshotName=\"a\"\nSnapshotName-1=\"a\"";
        assert_eq!(parse_snapshot_names(out), vec!["a", "a"]);
    }

    #[test]
    fn snapshot_names_ignore_description_keys() {
        let out = "SnapshotName=\"a\"\nSnapshotDescription=\"SnapshotName=b\"";
        assert_eq!(parse_snapshot_names(out), vec!["a"]);
    }

    #[test]
    fn snapshot_names_no_snapshots() {
        assert!(parse_snapshot_names("This machine does not have any snapshots").is_empty());
    }

    #[test]
    fn created_uuid() {
        let out = "Virtual machine 'web' is created and registered.\nUUID: 1c2d-3e4f\nSettings file: '/vms/web/web.vbox'";
        assert_eq!(parse_created_uuid(out).as_deref(), Some("1c2d-3e4f"));
        assert_eq!(parse_created_uuid("nothing here"), None);
    }
}
