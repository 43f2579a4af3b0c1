//! Explicit reconciliation between stored records and VBoxManage.
//!
//! Nothing here runs implicitly on reads. Callers schedule [`Manager::reconcile`],
//! [`Manager::refresh_status`] or [`Manager::sync_snapshots`] when they want
//! the store brought in line with the tool. All three are idempotent.

use std::collections::{HashMap, HashSet};

use facet::Facet;

use crate::error::{BestEffort, VmError};
use crate::manager::Manager;
use crate::model::{Snapshot, SnapshotState, VirtualMachine, VmStatus};
use crate::runner::ProcessRunner;
use crate::store::Store;
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct StatusChange {
    pub name: String,
    pub from: VmStatus,
    pub to: VmStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct ReconcileReport {
    /// Stored machines whose status was corrected.
    pub updated: Vec<StatusChange>,
    /// Registered with VBoxManage but not in the store.
    pub untracked: Vec<String>,
    /// In the store but unknown to VBoxManage. Left in place.
    pub dangling: Vec<String>,
    /// Machines whose info could not be read, with the reason.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct SnapshotSyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl<R: ProcessRunner, S: Store> Manager<R, S> {
    /// One pass over every stored machine: a single `list vms`, then
    /// `showvminfo` for each machine the tool knows about.
    pub async fn reconcile(&self) -> Result<ReconcileReport, VmError> {
        let listed = self.vbox.list_vms().await?;
        let live: HashMap<&str, &str> = listed
            .iter()
            .map(|l| (l.name.as_str(), l.uuid.as_str()))
            .collect();

        let mut report = ReconcileReport::default();
        let stored = self.store.list_vms()?;
        let stored_names: HashSet<&str> = stored.iter().map(|vm| vm.name.as_str()).collect();

        for entry in &stored {
            let Some(uuid) = live.get(entry.name.as_str()) else {
                report.dangling.push(entry.name.clone());
                continue;
            };
            let _guard = self.vm_locks.lock(&entry.name).await;
            // The record may have changed or gone while we waited for the lock.
            let Some(mut vm) = self.store.get_vm(&entry.id)? else {
                continue;
            };
            let info = match self.vbox.vm_info(&vm.name).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(vm = %vm.name, error = %e, "could not read VM info, skipping");
                    report.failed.push(format!("{}: {e}", vm.name));
                    continue;
                }
            };
            let live_status = VmStatus::from_tool_state(&info.state);
            let mut changed = false;
            if vm.uuid.is_none() {
                vm.uuid = Some(uuid.to_string());
                changed = true;
            }
            if vm.status != live_status {
                tracing::info!(vm = %vm.name, from = %vm.status, to = %live_status, "status corrected");
                report.updated.push(StatusChange {
                    name: vm.name.clone(),
                    from: vm.status,
                    to: live_status,
                });
                vm.status = live_status;
                changed = true;
            }
            if changed {
                vm.touch();
                self.store.save_vm(&vm)?;
            }
        }

        report.untracked = listed
            .iter()
            .filter(|l| !stored_names.contains(l.name.as_str()))
            .map(|l| l.name.clone())
            .collect();
        tracing::debug!(
            updated = report.updated.len(),
            untracked = report.untracked.len(),
            dangling = report.dangling.len(),
            "reconcile finished"
        );
        Ok(report)
    }

    /// Re-read one machine's state from the tool and persist it if it differs.
    pub async fn refresh_status(&self, name: &str) -> Result<VirtualMachine, VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;
        let info = self.vbox.vm_info(name).await?;
        let live_status = VmStatus::from_tool_state(&info.state);
        if vm.status != live_status {
            tracing::info!(vm = %name, from = %vm.status, to = %live_status, "status corrected");
            vm.status = live_status;
            vm.touch();
            self.store.save_vm(&vm)?;
        }
        Ok(vm)
    }

    /// [`Manager::reconcile`] for read paths. A VBoxManage failure is
    /// logged and reported as skipped so the caller can fall back to the
    /// stored records.
    pub async fn reconcile_for_read(&self) -> Result<BestEffort, VmError> {
        match self.reconcile().await {
            Ok(report) => {
                for reason in &report.failed {
                    tracing::warn!(reason = %reason, "could not refresh");
                }
                Ok(BestEffort::Done)
            }
            Err(e @ VmError::Tool { .. }) => {
                tracing::warn!(error = %e, "VBoxManage unavailable, showing stored status");
                Ok(BestEffort::Skipped {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// One machine for display: refreshed when VBoxManage answers, the
    /// stored record otherwise.
    pub async fn show_vm(&self, name: &str) -> Result<(VirtualMachine, BestEffort), VmError> {
        match self.refresh_status(name).await {
            Ok(vm) => Ok((vm, BestEffort::Done)),
            Err(e @ VmError::Tool { .. }) => {
                tracing::warn!(vm = %name, error = %e, "could not refresh, showing stored status");
                let vm = self.load_vm(name)?;
                Ok((
                    vm,
                    BestEffort::Skipped {
                        reason: e.to_string(),
                    },
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Make the stored snapshots of `name` match the tool's list by name.
    ///
    /// New names are recorded with state unknown. Stored snapshots the tool
    /// no longer reports are removed and their children moved up to the
    /// nearest surviving ancestor.
    pub async fn sync_snapshots(&self, name: &str) -> Result<SnapshotSyncReport, VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;

        let mut live = Vec::new();
        let mut seen = HashSet::new();
        for snap in self.vbox.snapshot_names(name).await? {
            if seen.insert(snap.clone()) {
                live.push(snap);
            }
        }

        let stored = self.store.list_snapshots(&vm.id)?;
        let stored_names: HashSet<&str> = stored.iter().map(|s| s.name.as_str()).collect();

        let removed: Vec<&Snapshot> = stored
            .iter()
            .filter(|s| !seen.contains(&s.name))
            .collect();
        let removed_ids: HashSet<&str> = removed.iter().map(|s| s.id.as_str()).collect();
        let parents: HashMap<&str, Option<&str>> = stored
            .iter()
            .map(|s| (s.id.as_str(), s.parent_id.as_deref()))
            .collect();

        // Survivors pointing into the removed set move up the tree.
        for snap in &stored {
            if removed_ids.contains(snap.id.as_str()) {
                continue;
            }
            let new_parent = surviving_ancestor(snap.parent_id.as_deref(), &parents, &removed_ids);
            if new_parent != snap.parent_id.as_deref() {
                let mut moved = snap.clone();
                moved.parent_id = new_parent.map(String::from);
                moved.updated_at = util::now_ms();
                self.store.save_snapshot(&moved)?;
            }
        }

        let removed_id_list: Vec<String> = removed.iter().map(|s| s.id.clone()).collect();
        self.store.delete_snapshots(&removed_id_list)?;

        let now = util::now_ms();
        let mut added = Vec::new();
        for snap_name in live.iter().filter(|n| !stored_names.contains(n.as_str())) {
            let record = Snapshot {
                id: util::new_id(),
                vm_id: vm.id.clone(),
                name: snap_name.clone(),
                vm_state: SnapshotState::Unknown,
                created_at: now,
                updated_at: now,
                ..Default::default()
            };
            self.store.save_snapshot(&record)?;
            vm.snapshots.push(record.id);
            added.push(snap_name.clone());
        }

        vm.snapshots.retain(|id| !removed_ids.contains(id.as_str()));
        if vm
            .current_snapshot
            .as_deref()
            .is_some_and(|id| removed_ids.contains(id))
        {
            vm.current_snapshot = None;
        }
        if !added.is_empty() || !removed.is_empty() {
            vm.touch();
            self.store.save_vm(&vm)?;
        }

        let report = SnapshotSyncReport {
            removed: removed.iter().map(|s| s.name.clone()).collect(),
            unchanged: stored.len() - removed.len(),
            added,
        };
        tracing::info!(
            vm = %name,
            added = report.added.len(),
            removed = report.removed.len(),
            "snapshots synchronized"
        );
        Ok(report)
    }
}

/// First ancestor starting at `parent` that is not being removed.
pub(crate) fn surviving_ancestor<'a>(
    mut parent: Option<&'a str>,
    parents: &HashMap<&'a str, Option<&'a str>>,
    removed: &HashSet<&str>,
) -> Option<&'a str> {
    let mut hops = 0;
    while let Some(id) = parent {
        if !removed.contains(id) || hops > parents.len() {
            break;
        }
        parent = parents.get(id).copied().flatten();
        hops += 1;
    }
    parent.filter(|id| !removed.contains(id))
}
