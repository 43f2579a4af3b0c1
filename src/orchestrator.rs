//! VM lifecycle: creation as an ordered VBoxManage sequence, and the
//! single-step control operations.
//!
//! Each control operation checks only its own precondition against the
//! stored status and refuses before touching VBoxManage when it does not
//! hold. Every operation holds the machine's name lock around its
//! VBoxManage calls and record updates; trigger scripts run outside it.

use std::path::Path;

use facet::Facet;

use crate::error::{BestEffort, VmError};
use crate::manager::Manager;
use crate::model::{OsType, Trigger, VirtualMachine, VmSpec, VmStatus, VmUpdate};
use crate::paths;
use crate::runner::ProcessRunner;
use crate::script::ScriptRun;
use crate::store::Store;
use crate::util;
use crate::vbox::ControlAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// ACPI power button; the guest shuts itself down.
    Graceful,
    /// Immediate power-off.
    Forced,
}

#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub status: Option<VmStatus>,
    pub os_type: Option<OsType>,
    /// Case-insensitive match on name or description.
    pub search: Option<String>,
}

impl VmFilter {
    fn matches(&self, vm: &VirtualMachine) -> bool {
        if self.status.is_some_and(|s| s != vm.status) {
            return false;
        }
        if self.os_type.is_some_and(|o| o != vm.os_type) {
            return false;
        }
        match &self.search {
            Some(q) => {
                let q = q.to_lowercase();
                vm.name.to_lowercase().contains(&q) || vm.description.to_lowercase().contains(&q)
            }
            None => true,
        }
    }
}

/// Result of a control operation, including any trigger scripts it ran.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ControlOutcome {
    pub vm: VirtualMachine,
    pub scripts: Vec<ScriptRun>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub name: String,
    /// Forced stop before unregistering. Skipped when the machine was not running.
    pub pre_stop: BestEffort,
    pub files_deleted: bool,
    pub snapshots_removed: usize,
    pub scripts_detached: usize,
}

impl<R: ProcessRunner, S: Store> Manager<R, S> {
    /// Create, configure and register a machine, then record it.
    ///
    /// Steps after `createvm` are undone with `unregistervm --delete` on
    /// failure when rollback is enabled. The original error is returned
    /// either way.
    pub async fn create_vm(&self, spec: VmSpec) -> Result<VirtualMachine, VmError> {
        spec.validate()?;
        let _guard = self.vm_locks.lock(&spec.name).await;
        if self.store.find_vm(&spec.name)?.is_some() {
            return Err(VmError::AlreadyExists {
                kind: "VM",
                name: spec.name,
            });
        }

        let name = spec.name.clone();
        tracing::info!(vm = %name, os = %spec.os_type, memory_mb = spec.memory_mb, cpus = spec.cpus, "creating VM");
        let uuid = self
            .vbox
            .create_vm(&name, spec.os_type.vbox_os_type())
            .await?;

        let disk = paths::disk_path(&self.settings.vm_dir, &name);
        if let Err(e) = self.configure_new_vm(&spec, &disk).await {
            if self.settings.rollback_on_create_failure {
                let rollback = BestEffort::from_result(self.vbox.unregister(&name, true).await);
                match &rollback {
                    BestEffort::Done => tracing::warn!(vm = %name, "creation failed, VM unregistered"),
                    BestEffort::Skipped { reason } => {
                        tracing::error!(vm = %name, reason = %reason, "creation failed and rollback failed, VM left registered")
                    }
                }
            } else {
                tracing::warn!(vm = %name, "creation failed, partially configured VM left registered");
            }
            return Err(e);
        }

        let vm = spec.into_record(uuid);
        self.store.save_vm(&vm)?;
        tracing::info!(vm = %vm.name, id = %vm.id, "VM created");
        Ok(vm)
    }

    async fn configure_new_vm(&self, spec: &VmSpec, disk: &Path) -> Result<(), VmError> {
        let name = &spec.name;
        self.vbox
            .modify_resources(name, spec.memory_mb, spec.cpus, &spec.network_adapters)
            .await?;
        self.vbox
            .create_disk(disk, spec.disk_size_gb.saturating_mul(1024))
            .await?;
        self.vbox.add_sata_controller(name).await?;
        self.vbox.attach_disk(name, disk).await?;
        for folder in &spec.shared_folders {
            self.vbox.add_shared_folder(name, folder).await?;
        }
        Ok(())
    }

    pub fn get_vm(&self, name: &str) -> Result<VirtualMachine, VmError> {
        self.load_vm(name)
    }

    /// Stored machines matching `filter`, sorted by name. Reads only the
    /// store; call [`Manager::reconcile`] first for fresh status.
    pub fn list_vms(&self, filter: &VmFilter) -> Result<Vec<VirtualMachine>, VmError> {
        let mut vms: Vec<VirtualMachine> = self
            .store
            .list_vms()?
            .into_iter()
            .filter(|vm| filter.matches(vm))
            .collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    /// Record-only edit of a stored machine.
    pub async fn update_vm(&self, name: &str, update: VmUpdate) -> Result<VirtualMachine, VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;
        update.apply(&mut vm)?;
        self.store.save_vm(&vm)?;
        Ok(vm)
    }

    /// Start headless, then run the startup scripts. The machine lock is
    /// released before the scripts run.
    pub async fn start_vm(&self, name: &str) -> Result<ControlOutcome, VmError> {
        let guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;
        if vm.status == VmStatus::Running {
            return Err(VmError::precondition(name, "VM is already running"));
        }

        self.vbox.start_headless(name).await?;
        vm.status = VmStatus::Running;
        vm.last_started = Some(util::now_ms());
        vm.touch();
        self.store.save_vm(&vm)?;
        drop(guard);
        tracing::info!(vm = %name, "VM started");

        let scripts = self.run_trigger_scripts(&vm, Trigger::Startup).await;
        Ok(ControlOutcome { vm, scripts })
    }

    /// Run the shutdown scripts, then stop the machine.
    ///
    /// The scripts run without the machine lock, before `controlvm`. If the
    /// stop is then refused or VBoxManage fails, the scripts have already run
    /// and their executions stay in each script's history.
    pub async fn stop_vm(&self, name: &str, mode: StopMode) -> Result<ControlOutcome, VmError> {
        let vm = self.load_vm(name)?;
        if vm.status == VmStatus::Stopped {
            return Err(VmError::precondition(name, "VM is already stopped"));
        }
        let scripts = self.run_trigger_scripts(&vm, Trigger::Shutdown).await;

        let _guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;
        if vm.status == VmStatus::Stopped {
            return Err(VmError::precondition(name, "VM was stopped while shutdown scripts ran"));
        }
        let action = match mode {
            StopMode::Graceful => ControlAction::AcpiPowerButton,
            StopMode::Forced => ControlAction::PowerOff,
        };
        if let Err(e) = self.vbox.control(name, action).await {
            if !scripts.is_empty() {
                tracing::warn!(vm = %name, scripts = scripts.len(), "stop failed after shutdown scripts ran");
            }
            return Err(e);
        }
        vm.status = VmStatus::Stopped;
        vm.last_stopped = Some(util::now_ms());
        vm.touch();
        self.store.save_vm(&vm)?;
        tracing::info!(vm = %name, ?mode, "VM stopped");
        Ok(ControlOutcome { vm, scripts })
    }

    pub async fn pause_vm(&self, name: &str) -> Result<VirtualMachine, VmError> {
        self.transition(name, VmStatus::Running, ControlAction::Pause, VmStatus::Paused)
            .await
    }

    pub async fn resume_vm(&self, name: &str) -> Result<VirtualMachine, VmError> {
        self.transition(name, VmStatus::Paused, ControlAction::Resume, VmStatus::Running)
            .await
    }

    /// Hard reset. The machine stays running; only the start time moves.
    pub async fn restart_vm(&self, name: &str) -> Result<VirtualMachine, VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;
        require_status(&vm, VmStatus::Running)?;
        self.vbox.control(name, ControlAction::Reset).await?;
        vm.last_started = Some(util::now_ms());
        vm.touch();
        self.store.save_vm(&vm)?;
        tracing::info!(vm = %name, "VM restarted");
        Ok(vm)
    }

    async fn transition(
        &self,
        name: &str,
        required: VmStatus,
        action: ControlAction,
        next: VmStatus,
    ) -> Result<VirtualMachine, VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let mut vm = self.load_vm(name)?;
        require_status(&vm, required)?;
        self.vbox.control(name, action).await?;
        vm.status = next;
        vm.touch();
        self.store.save_vm(&vm)?;
        tracing::info!(vm = %name, status = %next, "VM {}", action.as_arg());
        Ok(vm)
    }

    /// Tear down a machine and drop its record, snapshots and script links.
    ///
    /// The forced stop is best-effort. The settle delay only follows a stop
    /// that succeeded; unregistering must succeed before anything is removed
    /// from the store.
    pub async fn delete_vm(&self, name: &str, delete_files: bool) -> Result<DeleteReport, VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let vm = self.load_vm(name)?;

        let pre_stop = BestEffort::from_result(self.vbox.control(name, ControlAction::PowerOff).await);
        match &pre_stop {
            BestEffort::Done => {
                tracing::debug!(vm = %name, settle_ms = self.settings.delete_settle.as_millis() as u64, "VM powered off, settling");
                tokio::time::sleep(self.settings.delete_settle).await;
            }
            BestEffort::Skipped { reason } => {
                tracing::debug!(vm = %name, reason = %reason, "pre-delete power-off skipped");
            }
        }

        self.vbox.unregister(name, delete_files).await?;

        let snapshot_ids: Vec<String> = self
            .store
            .list_snapshots(&vm.id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let snapshots_removed = self.store.delete_snapshots(&snapshot_ids)?;

        let mut scripts_detached = 0;
        for mut script in self.store.list_scripts()? {
            if script.associated_vms.contains(&vm.id) {
                let _script_guard = self.script_locks.lock(&script.name).await;
                if let Some(current) = self.store.get_script(&script.id)? {
                    script = current;
                }
                script.associated_vms.retain(|id| *id != vm.id);
                script.touch();
                self.store.save_script(&script)?;
                scripts_detached += 1;
            }
        }

        self.store.delete_vm(&vm.id)?;
        tracing::info!(vm = %name, delete_files, snapshots_removed, "VM deleted");
        Ok(DeleteReport {
            name: vm.name,
            pre_stop,
            files_deleted: delete_files,
            snapshots_removed,
            scripts_detached,
        })
    }

    pub async fn screenshot(&self, name: &str, out: &Path) -> Result<(), VmError> {
        let _guard = self.vm_locks.lock(name).await;
        let vm = self.load_vm(name)?;
        require_status(&vm, VmStatus::Running)?;
        self.vbox.screenshot(name, out).await
    }

    /// Run a command inside the guest. Returns its stdout.
    pub async fn guest_exec(
        &self,
        name: &str,
        username: &str,
        password: &str,
        command: &[String],
    ) -> Result<String, VmError> {
        if command.is_empty() {
            return Err(VmError::validation("guest command must not be empty"));
        }
        let _guard = self.vm_locks.lock(name).await;
        let vm = self.load_vm(name)?;
        require_status(&vm, VmStatus::Running)?;
        self.vbox.guest_run(name, username, password, command).await
    }
}

fn require_status(vm: &VirtualMachine, required: VmStatus) -> Result<(), VmError> {
    if vm.status == required {
        Ok(())
    } else {
        Err(VmError::precondition(
            &vm.name,
            format!("VM must be {required} (it is {})", vm.status),
        ))
    }
}
