//! Document store for machines, snapshots and scripts.
//!
//! The orchestration core only talks to the [`Store`] trait. The bundled
//! [`DocumentStore`] keeps every document in memory and, when opened with a
//! path, rewrites a single JSON file after each mutation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use facet::Facet;

use crate::error::VmError;
use crate::model::{Script, Snapshot, VirtualMachine};

pub trait Store {
    fn list_vms(&self) -> Result<Vec<VirtualMachine>, VmError>;
    fn get_vm(&self, id: &str) -> Result<Option<VirtualMachine>, VmError>;
    fn find_vm(&self, name: &str) -> Result<Option<VirtualMachine>, VmError>;
    /// Insert or replace by id. Names must stay unique.
    fn save_vm(&self, vm: &VirtualMachine) -> Result<(), VmError>;
    fn delete_vm(&self, id: &str) -> Result<bool, VmError>;

    fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>, VmError>;
    fn all_snapshots(&self) -> Result<Vec<Snapshot>, VmError>;
    fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, VmError>;
    fn find_snapshot(&self, vm_id: &str, name: &str) -> Result<Option<Snapshot>, VmError>;
    /// Insert or replace by id. `(vm_id, name)` must stay unique.
    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), VmError>;
    /// Remove every listed id. Returns how many existed.
    fn delete_snapshots(&self, ids: &[String]) -> Result<usize, VmError>;

    fn list_scripts(&self) -> Result<Vec<Script>, VmError>;
    fn get_script(&self, id: &str) -> Result<Option<Script>, VmError>;
    fn find_script(&self, name: &str) -> Result<Option<Script>, VmError>;
    /// Insert or replace by id. Names must stay unique.
    fn save_script(&self, script: &Script) -> Result<(), VmError>;
    fn delete_script(&self, id: &str) -> Result<bool, VmError>;
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
struct Documents {
    vms: Vec<VirtualMachine>,
    snapshots: Vec<Snapshot>,
    scripts: Vec<Script>,
}

pub struct DocumentStore {
    path: Option<PathBuf>,
    docs: Mutex<Documents>,
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            docs: Mutex::new(Documents::default()),
        }
    }

    /// Open (or start) the store backed by `path`.
    pub fn open(path: &Path) -> Result<Self, VmError> {
        let docs = match std::fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => Documents::default(),
            Ok(contents) => facet_json::from_str(&contents).map_err(|e| VmError::Store {
                message: format!("failed to parse {}: {e}", path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Documents::default(),
            Err(e) => {
                return Err(VmError::Io {
                    context: format!("reading store {}", path.display()),
                    source: e,
                });
            }
        };
        tracing::debug!(
            path = %path.display(),
            vms = docs.vms.len(),
            snapshots = docs.snapshots.len(),
            scripts = docs.scripts.len(),
            "opened document store"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            docs: Mutex::new(docs),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Documents> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the documents and persist if it succeeds.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Documents) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let mut docs = self.lock();
        let mut draft = docs.clone();
        let value = f(&mut draft)?;
        if let Some(path) = &self.path {
            persist(path, &draft)?;
        }
        *docs = draft;
        Ok(value)
    }
}

/// Write to a sibling temp file, then rename over the target.
fn persist(path: &Path, docs: &Documents) -> Result<(), VmError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VmError::Io {
            context: format!("creating directory {}", parent.display()),
            source: e,
        })?;
    }
    let json = facet_json::to_string(docs).map_err(|e| VmError::Store {
        message: format!("failed to serialize documents: {e}"),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| VmError::Io {
        context: format!("writing {}", tmp.display()),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| VmError::Io {
        context: format!("replacing {}", path.display()),
        source: e,
    })
}

fn upsert<T: Clone>(items: &mut Vec<T>, item: &T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(slot) => *slot = item.clone(),
        None => items.push(item.clone()),
    }
}

impl Store for DocumentStore {
    fn list_vms(&self) -> Result<Vec<VirtualMachine>, VmError> {
        Ok(self.lock().vms.clone())
    }

    fn get_vm(&self, id: &str) -> Result<Option<VirtualMachine>, VmError> {
        Ok(self.lock().vms.iter().find(|v| v.id == id).cloned())
    }

    fn find_vm(&self, name: &str) -> Result<Option<VirtualMachine>, VmError> {
        Ok(self.lock().vms.iter().find(|v| v.name == name).cloned())
    }

    fn save_vm(&self, vm: &VirtualMachine) -> Result<(), VmError> {
        self.mutate(|docs| {
            if docs.vms.iter().any(|v| v.name == vm.name && v.id != vm.id) {
                return Err(VmError::AlreadyExists {
                    kind: "VM",
                    name: vm.name.clone(),
                });
            }
            upsert(&mut docs.vms, vm, |v| v.id == vm.id);
            Ok(())
        })
    }

    fn delete_vm(&self, id: &str) -> Result<bool, VmError> {
        self.mutate(|docs| {
            let before = docs.vms.len();
            docs.vms.retain(|v| v.id != id);
            Ok(docs.vms.len() != before)
        })
    }

    fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>, VmError> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.vm_id == vm_id)
            .cloned()
            .collect())
    }

    fn all_snapshots(&self) -> Result<Vec<Snapshot>, VmError> {
        Ok(self.lock().snapshots.clone())
    }

    fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, VmError> {
        Ok(self.lock().snapshots.iter().find(|s| s.id == id).cloned())
    }

    fn find_snapshot(&self, vm_id: &str, name: &str) -> Result<Option<Snapshot>, VmError> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .find(|s| s.vm_id == vm_id && s.name == name)
            .cloned())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), VmError> {
        self.mutate(|docs| {
            let clash = docs.snapshots.iter().any(|s| {
                s.vm_id == snapshot.vm_id && s.name == snapshot.name && s.id != snapshot.id
            });
            if clash {
                return Err(VmError::AlreadyExists {
                    kind: "snapshot",
                    name: snapshot.name.clone(),
                });
            }
            upsert(&mut docs.snapshots, snapshot, |s| s.id == snapshot.id);
            Ok(())
        })
    }

    fn delete_snapshots(&self, ids: &[String]) -> Result<usize, VmError> {
        self.mutate(|docs| {
            let before = docs.snapshots.len();
            docs.snapshots.retain(|s| !ids.contains(&s.id));
            Ok(before - docs.snapshots.len())
        })
    }

    fn list_scripts(&self) -> Result<Vec<Script>, VmError> {
        Ok(self.lock().scripts.clone())
    }

    fn get_script(&self, id: &str) -> Result<Option<Script>, VmError> {
        Ok(self.lock().scripts.iter().find(|s| s.id == id).cloned())
    }

    fn find_script(&self, name: &str) -> Result<Option<Script>, VmError> {
        Ok(self.lock().scripts.iter().find(|s| s.name == name).cloned())
    }

    fn save_script(&self, script: &Script) -> Result<(), VmError> {
        self.mutate(|docs| {
            if docs
                .scripts
                .iter()
                .any(|s| s.name == script.name && s.id != script.id)
            {
                return Err(VmError::AlreadyExists {
                    kind: "script",
                    name: script.name.clone(),
                });
            }
            upsert(&mut docs.scripts, script, |s| s.id == script.id);
            Ok(())
        })
    }

    fn delete_script(&self, id: &str) -> Result<bool, VmError> {
        self.mutate(|docs| {
            let before = docs.scripts.len();
            docs.scripts.retain(|s| s.id != id);
            Ok(docs.scripts.len() != before)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionRecord, ExecutionStatus, OsType, ScriptKind, VmSpec, VmStatus};

    fn vm(name: &str) -> VirtualMachine {
        VmSpec::new(name, OsType::Linux).into_record(None)
    }

    #[test]
    fn save_and_find_vm() {
        let store = DocumentStore::in_memory();
        let mut web = vm("web");
        store.save_vm(&web).unwrap();
        web.status = VmStatus::Running;
        store.save_vm(&web).unwrap();

        let found = store.find_vm("web").unwrap().unwrap();
        assert_eq!(found.status, VmStatus::Running);
        assert_eq!(store.list_vms().unwrap().len(), 1);
        assert!(store.find_vm("db").unwrap().is_none());
    }

    #[test]
    fn duplicate_vm_name_rejected() {
        let store = DocumentStore::in_memory();
        store.save_vm(&vm("web")).unwrap();
        let err = store.save_vm(&vm("web")).unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists { .. }));
        assert_eq!(store.list_vms().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_snapshot_name_only_within_vm() {
        let store = DocumentStore::in_memory();
        let snap = |id: &str, vm_id: &str| Snapshot {
            id: id.into(),
            vm_id: vm_id.into(),
            name: "base".into(),
            ..Default::default()
        };
        store.save_snapshot(&snap("1", "a")).unwrap();
        store.save_snapshot(&snap("2", "b")).unwrap();
        assert!(store.save_snapshot(&snap("3", "a")).is_err());
        assert_eq!(store.delete_snapshots(&["1".into(), "9".into()]).unwrap(), 1);
        assert_eq!(store.all_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = DocumentStore::open(&path).unwrap();
        let web = vm("web");
        store.save_vm(&web).unwrap();
        let mut script = Script {
            id: "s1".into(),
            name: "hello".into(),
            kind: ScriptKind::Bash,
            body: "echo hi".into(),
            ..Default::default()
        };
        script.environment.insert("A".into(), "1".into());
        script.record_execution(ExecutionRecord {
            timestamp: 7,
            status: ExecutionStatus::Timeout,
            ..Default::default()
        });
        store.save_script(&script).unwrap();
        drop(store);

        let reopened = DocumentStore::open(&path).unwrap();
        let loaded_vm = reopened.find_vm("web").unwrap().unwrap();
        assert_eq!(loaded_vm, web);
        let loaded_script = reopened.find_script("hello").unwrap().unwrap();
        assert_eq!(loaded_script, script);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(&dir.path().join("nope.json")).unwrap();
        assert!(store.list_vms().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            DocumentStore::open(&path),
            Err(VmError::Store { .. })
        ));
    }
}
