//! The orchestration core: one VBoxManage handle, one store, and the locks
//! that serialize work per machine and per script.
//!
//! Operations live in [`crate::orchestrator`], [`crate::reconcile`],
//! [`crate::snapshots`] and [`crate::script`] as `impl Manager` blocks.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::SystemConfig;
use crate::error::VmError;
use crate::locks::NameLocks;
use crate::model::{Script, VirtualMachine};
use crate::runner::ProcessRunner;
use crate::store::Store;
use crate::vbox::VBoxManage;

#[derive(Debug, Clone)]
pub struct Settings {
    pub vm_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Pause between a successful forced stop and `unregistervm`.
    pub delete_settle: Duration,
    pub rollback_on_create_failure: bool,
    pub run_trigger_scripts: bool,
}

impl Settings {
    pub fn from_config(sys: &SystemConfig) -> Self {
        Self {
            vm_dir: sys.vm_dir(),
            temp_dir: sys.script_temp_dir(),
            delete_settle: sys.delete_settle(),
            rollback_on_create_failure: sys.config.lifecycle.rollback_on_create_failure,
            run_trigger_scripts: sys.config.lifecycle.run_trigger_scripts,
        }
    }
}

pub struct Manager<R, S> {
    pub(crate) vbox: VBoxManage<R>,
    pub(crate) store: S,
    pub(crate) vm_locks: NameLocks,
    pub(crate) script_locks: NameLocks,
    pub(crate) settings: Settings,
}

impl<R: ProcessRunner, S: Store> Manager<R, S> {
    pub fn new(vbox: VBoxManage<R>, store: S, settings: Settings) -> Self {
        Self {
            vbox,
            store,
            vm_locks: NameLocks::new(),
            script_locks: NameLocks::new(),
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn load_vm(&self, name: &str) -> Result<VirtualMachine, VmError> {
        self.store
            .find_vm(name)?
            .ok_or_else(|| VmError::not_found("VM", name))
    }

    pub(crate) fn load_script(&self, name: &str) -> Result<Script, VmError> {
        self.store
            .find_script(name)?
            .ok_or_else(|| VmError::not_found("script", name))
    }
}
