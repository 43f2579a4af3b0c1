//! Snapshot operations mirrored onto `VBoxManage snapshot`.

use std::collections::{HashMap, HashSet};

use facet::Facet;

use crate::error::VmError;
use crate::manager::Manager;
use crate::model::{
    self, Snapshot, SnapshotState, SnapshotTree, SnapshotUpdate, VirtualMachine, VmStatus,
};
use crate::reconcile::surviving_ancestor;
use crate::runner::ProcessRunner;
use crate::store::Store;
use crate::util;

/// What happens to the children of a deleted snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildPolicy {
    /// Delete the whole subtree, deepest first.
    #[default]
    Cascade,
    /// Keep the children and hang them off the deleted snapshot's parent.
    Reparent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct SnapshotDeleteReport {
    /// Names removed, in deletion order.
    pub removed: Vec<String>,
    /// Names whose parent changed.
    pub reparented: Vec<String>,
}

/// Selection for [`Manager::list_all_snapshots`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Only snapshots of this machine name.
    pub vm: Option<String>,
    /// Case-insensitive match on name or description.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TakeSnapshot {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub is_auto: bool,
}

impl<R: ProcessRunner, S: Store> Manager<R, S> {
    /// Snapshots of a machine, newest first.
    pub fn list_snapshots(&self, vm_name: &str) -> Result<Vec<Snapshot>, VmError> {
        let vm = self.load_vm(vm_name)?;
        let mut snaps = self.store.list_snapshots(&vm.id)?;
        snaps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(snaps)
    }

    /// Snapshots across every stored machine, newest first.
    pub fn list_all_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, VmError> {
        let vm_id = match &filter.vm {
            Some(name) => Some(self.load_vm(name)?.id),
            None => None,
        };
        let query = filter.search.as_deref().map(str::to_lowercase);
        let mut snaps: Vec<Snapshot> = self
            .store
            .all_snapshots()?
            .into_iter()
            .filter(|s| vm_id.as_ref().is_none_or(|id| &s.vm_id == id))
            .filter(|s| {
                query.as_ref().is_none_or(|q| {
                    s.name.to_lowercase().contains(q) || s.description.to_lowercase().contains(q)
                })
            })
            .collect();
        snaps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(snaps)
    }

    pub fn get_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<Snapshot, VmError> {
        let vm = self.load_vm(vm_name)?;
        self.find_snapshot(&vm, snapshot)
    }

    fn find_snapshot(&self, vm: &VirtualMachine, snapshot: &str) -> Result<Snapshot, VmError> {
        self.store
            .find_snapshot(&vm.id, snapshot)?
            .ok_or_else(|| VmError::not_found("snapshot", snapshot))
    }

    /// Take a snapshot. Its parent is the machine's current snapshot and it
    /// becomes the new current one.
    pub async fn take_snapshot(&self, vm_name: &str, req: TakeSnapshot) -> Result<Snapshot, VmError> {
        model::validate_name("snapshot", &req.name)?;
        model::validate_description(&req.description)?;
        let _guard = self.vm_locks.lock(vm_name).await;
        let mut vm = self.load_vm(vm_name)?;
        if self.store.find_snapshot(&vm.id, &req.name)?.is_some() {
            return Err(VmError::AlreadyExists {
                kind: "snapshot",
                name: req.name,
            });
        }

        let status = match self.vbox.vm_info(vm_name).await {
            Ok(info) => match VmStatus::from_tool_state(&info.state) {
                VmStatus::Unknown => vm.status,
                live => live,
            },
            Err(e) => {
                tracing::warn!(vm = %vm_name, error = %e, "could not read live state, using stored status");
                vm.status
            }
        };

        self.vbox
            .snapshot_take(vm_name, &req.name, &req.description)
            .await?;

        let now = util::now_ms();
        let snapshot = Snapshot {
            id: util::new_id(),
            vm_id: vm.id.clone(),
            name: req.name,
            description: req.description,
            parent_id: vm.current_snapshot.clone(),
            vm_state: SnapshotState::from(status),
            is_auto: req.is_auto,
            tags: req.tags,
            created_at: now,
            updated_at: now,
            ..Default::default()
        };
        self.store.save_snapshot(&snapshot)?;
        vm.snapshots.push(snapshot.id.clone());
        vm.current_snapshot = Some(snapshot.id.clone());
        vm.touch();
        self.store.save_vm(&vm)?;
        tracing::info!(vm = %vm_name, snapshot = %snapshot.name, state = %snapshot.vm_state, "snapshot taken");
        Ok(snapshot)
    }

    /// Restore a snapshot. The machine must not be running or paused.
    pub async fn restore_snapshot(
        &self,
        vm_name: &str,
        snapshot: &str,
    ) -> Result<(VirtualMachine, Snapshot), VmError> {
        let _guard = self.vm_locks.lock(vm_name).await;
        let mut vm = self.load_vm(vm_name)?;
        let mut snap = self.find_snapshot(&vm, snapshot)?;
        if matches!(vm.status, VmStatus::Running | VmStatus::Paused) {
            return Err(VmError::precondition(
                vm_name,
                format!("stop the VM before restoring (it is {})", vm.status),
            ));
        }

        self.vbox.snapshot_restore(vm_name, &snap.name).await?;

        let now = util::now_ms();
        snap.restore_count += 1;
        snap.last_restored = Some(now);
        snap.updated_at = now;
        self.store.save_snapshot(&snap)?;

        vm.status = snap.vm_state.as_vm_status();
        vm.current_snapshot = Some(snap.id.clone());
        vm.touch();
        self.store.save_vm(&vm)?;
        tracing::info!(vm = %vm_name, snapshot = %snap.name, restores = snap.restore_count, "snapshot restored");
        Ok((vm, snap))
    }

    pub async fn update_snapshot(
        &self,
        vm_name: &str,
        snapshot: &str,
        update: SnapshotUpdate,
    ) -> Result<Snapshot, VmError> {
        if let Some(description) = &update.description {
            model::validate_description(description)?;
        }
        let _guard = self.vm_locks.lock(vm_name).await;
        let vm = self.load_vm(vm_name)?;
        let mut snap = self.find_snapshot(&vm, snapshot)?;
        if let Some(description) = update.description {
            snap.description = description;
        }
        if let Some(tags) = update.tags {
            snap.tags = tags;
        }
        snap.updated_at = util::now_ms();
        self.store.save_snapshot(&snap)?;
        Ok(snap)
    }

    /// Delete a snapshot and deal with its children per `policy`.
    ///
    /// With [`ChildPolicy::Cascade`] the subtree is deleted deepest first.
    /// If VBoxManage fails part-way, the snapshots it already deleted are
    /// still removed from the store before the error is returned.
    pub async fn delete_snapshot(
        &self,
        vm_name: &str,
        snapshot: &str,
        policy: ChildPolicy,
    ) -> Result<SnapshotDeleteReport, VmError> {
        let _guard = self.vm_locks.lock(vm_name).await;
        let mut vm = self.load_vm(vm_name)?;
        let all = self.store.list_snapshots(&vm.id)?;
        let tree = SnapshotTree::new(&all);
        let target = all
            .iter()
            .find(|s| s.name == snapshot)
            .ok_or_else(|| VmError::not_found("snapshot", snapshot))?;

        let mut report = SnapshotDeleteReport::default();
        let mut deleted: Vec<&Snapshot> = Vec::new();
        let mut failure = None;

        match policy {
            ChildPolicy::Cascade => {
                for snap in tree.subtree_leaves_first(&target.id) {
                    if let Err(e) = self.vbox.snapshot_delete(vm_name, &snap.name).await {
                        failure = Some(e);
                        break;
                    }
                    deleted.push(snap);
                }
            }
            ChildPolicy::Reparent => {
                self.vbox.snapshot_delete(vm_name, &target.name).await?;
                deleted.push(target);
                for child in tree.children_of(&target.id) {
                    let mut moved = child.clone();
                    moved.parent_id = target.parent_id.clone();
                    moved.updated_at = util::now_ms();
                    self.store.save_snapshot(&moved)?;
                    report.reparented.push(moved.name);
                }
            }
        }

        let ids: Vec<String> = deleted.iter().map(|s| s.id.clone()).collect();
        self.store.delete_snapshots(&ids)?;
        report.removed = deleted.iter().map(|s| s.name.clone()).collect();

        if !ids.is_empty() {
            let gone: HashSet<&str> = ids.iter().map(String::as_str).collect();
            vm.snapshots.retain(|id| !gone.contains(id.as_str()));
            if let Some(current) = vm.current_snapshot.as_deref().filter(|id| gone.contains(id)) {
                // VirtualBox moves "current" up to the nearest surviving parent.
                let parents: HashMap<&str, Option<&str>> = all
                    .iter()
                    .map(|s| (s.id.as_str(), s.parent_id.as_deref()))
                    .collect();
                let parent = parents.get(current).copied().flatten();
                vm.current_snapshot =
                    surviving_ancestor(parent, &parents, &gone).map(str::to_string);
            }
            vm.touch();
            self.store.save_vm(&vm)?;
        }

        if let Some(e) = failure {
            tracing::warn!(vm = %vm_name, removed = report.removed.len(), "snapshot cascade stopped part-way");
            return Err(e);
        }
        tracing::info!(vm = %vm_name, snapshot, removed = report.removed.len(), ?policy, "snapshot deleted");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OsType, VmSpec};
    use crate::testing::{self, FakeRunner, TestManager};

    async fn setup() -> (tempfile::TempDir, std::sync::Arc<FakeRunner>, TestManager) {
        let dir = tempfile::tempdir().unwrap();
        let (fake, manager) = testing::manager(dir.path());
        manager
            .create_vm(VmSpec::new("web", OsType::Linux))
            .await
            .unwrap();
        (dir, fake, manager)
    }

    fn take(name: &str) -> TakeSnapshot {
        TakeSnapshot {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn take_chains_parent_and_current() {
        let (_dir, fake, manager) = setup().await;
        fake.vm_state("web", "running");
        let first = manager.take_snapshot("web", take("one")).await.unwrap();
        let second = manager.take_snapshot("web", take("two")).await.unwrap();

        assert_eq!(first.parent_id, None);
        assert_eq!(second.parent_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(second.vm_state, SnapshotState::Running);
        let vm = manager.get_vm("web").unwrap();
        assert_eq!(vm.snapshots, vec![first.id, second.id.clone()]);
        assert_eq!(vm.current_snapshot, Some(second.id));
        assert!(fake.calls().contains(&"snapshot web take two".to_string()));
    }

    #[tokio::test]
    async fn saved_state_is_captured_as_stopped() {
        let (_dir, fake, manager) = setup().await;
        fake.vm_state("web", "saved");
        let snap = manager.take_snapshot("web", take("s")).await.unwrap();
        assert_eq!(snap.vm_state, SnapshotState::Stopped);
    }

    #[tokio::test]
    async fn duplicate_name_rejected_before_tool() {
        let (_dir, fake, manager) = setup().await;
        manager.take_snapshot("web", take("one")).await.unwrap();
        fake.clear();
        let err = manager.take_snapshot("web", take("one")).await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists { .. }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn restore_sets_status_and_counts() {
        let (_dir, fake, manager) = setup().await;
        fake.vm_state("web", "paused");
        manager.take_snapshot("web", take("p")).await.unwrap();

        let (vm, snap) = manager.restore_snapshot("web", "p").await.unwrap();
        assert_eq!(vm.status, VmStatus::Paused);
        assert_eq!(snap.restore_count, 1);
        assert!(snap.last_restored.is_some());

        // Paused now, so a second restore is refused.
        fake.clear();
        assert!(manager.restore_snapshot("web", "p").await.unwrap_err().is_rejection());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn restore_unknown_snapshot_is_not_found() {
        let (_dir, _fake, manager) = setup().await;
        assert!(matches!(
            manager.restore_snapshot("web", "nope").await,
            Err(VmError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cascade_deletes_subtree_leaves_first() {
        let (_dir, fake, manager) = setup().await;
        for name in ["a", "b", "c"] {
            manager.take_snapshot("web", take(name)).await.unwrap();
        }
        fake.clear();

        let report = manager
            .delete_snapshot("web", "a", ChildPolicy::Cascade)
            .await
            .unwrap();
        assert_eq!(report.removed, vec!["c", "b", "a"]);
        assert_eq!(
            fake.calls(),
            vec![
                "snapshot web delete c",
                "snapshot web delete b",
                "snapshot web delete a"
            ]
        );
        let vm = manager.get_vm("web").unwrap();
        assert!(vm.snapshots.is_empty());
        assert_eq!(vm.current_snapshot, None);
        assert!(manager.list_snapshots("web").unwrap().is_empty());
    }

    #[tokio::test]
    async fn reparent_leaves_no_orphans() {
        let (_dir, _fake, manager) = setup().await;
        let a = manager.take_snapshot("web", take("a")).await.unwrap();
        manager.take_snapshot("web", take("b")).await.unwrap();
        manager.take_snapshot("web", take("c")).await.unwrap();

        let report = manager
            .delete_snapshot("web", "b", ChildPolicy::Reparent)
            .await
            .unwrap();
        assert_eq!(report.removed, vec!["b"]);
        assert_eq!(report.reparented, vec!["c"]);

        let c = manager.get_snapshot("web", "c").unwrap();
        assert_eq!(c.parent_id, Some(a.id));
        let remaining = manager.list_snapshots("web").unwrap();
        let ids: HashSet<_> = remaining.iter().map(|s| s.id.clone()).collect();
        assert!(
            remaining
                .iter()
                .all(|s| s.parent_id.as_ref().is_none_or(|p| ids.contains(p)))
        );
    }

    #[tokio::test]
    async fn cascade_failure_keeps_store_consistent() {
        let (_dir, fake, manager) = setup().await;
        for name in ["a", "b", "c"] {
            manager.take_snapshot("web", take(name)).await.unwrap();
        }
        fake.fail("snapshot web delete b", "medium locked");

        let err = manager
            .delete_snapshot("web", "a", ChildPolicy::Cascade)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::Tool { .. }));
        let names: Vec<_> = manager
            .list_snapshots("web")
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(!names.contains(&"c".to_string()));
        assert!(names.contains(&"a".to_string()) && names.contains(&"b".to_string()));
        // The new current snapshot must still exist.
        let vm = manager.get_vm("web").unwrap();
        let current = vm.current_snapshot.unwrap();
        assert!(manager.store().get_snapshot(&current).unwrap().is_some());
    }

    #[tokio::test]
    async fn update_changes_description_only() {
        let (_dir, _fake, manager) = setup().await;
        manager.take_snapshot("web", take("a")).await.unwrap();
        let snap = manager
            .update_snapshot(
                "web",
                "a",
                SnapshotUpdate {
                    description: Some("golden image".into()),
                    tags: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(snap.description, "golden image");
        assert_eq!(snap.name, "a");
    }

    #[tokio::test]
    async fn list_all_spans_machines_and_filters() {
        let (_dir, _fake, manager) = setup().await;
        manager
            .create_vm(VmSpec::new("db", OsType::Linux))
            .await
            .unwrap();
        manager
            .take_snapshot(
                "web",
                TakeSnapshot {
                    name: "before-upgrade".into(),
                    description: "Kernel 6.1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager.take_snapshot("db", take("nightly")).await.unwrap();
        manager.take_snapshot("db", take("pre-migration")).await.unwrap();

        let all = manager.list_all_snapshots(&SnapshotFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let db = manager
            .list_all_snapshots(&SnapshotFilter {
                vm: Some("db".into()),
                search: None,
            })
            .unwrap();
        let mut names: Vec<&str> = db.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["nightly", "pre-migration"]);

        let by_description = manager
            .list_all_snapshots(&SnapshotFilter {
                vm: None,
                search: Some("KERNEL".into()),
            })
            .unwrap();
        assert_eq!(by_description.len(), 1);
        assert_eq!(by_description[0].name, "before-upgrade");

        let by_name = manager
            .list_all_snapshots(&SnapshotFilter {
                vm: Some("web".into()),
                search: Some("night".into()),
            })
            .unwrap();
        assert!(by_name.is_empty());
    }

    #[tokio::test]
    async fn list_all_rejects_unknown_machine() {
        let (_dir, _fake, manager) = setup().await;
        let err = manager
            .list_all_snapshots(&SnapshotFilter {
                vm: Some("ghost".into()),
                search: None,
            })
            .unwrap_err();
        assert!(matches!(err, VmError::NotFound { .. }));
    }
}
