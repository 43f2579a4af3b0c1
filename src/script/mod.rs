//! Host scripts: registration, association with machines, and execution
//! with persisted history.

pub mod engine;
pub mod env;
pub mod interpreter;

use std::collections::HashSet;

use facet::Facet;

use crate::error::VmError;
use crate::manager::Manager;
use crate::model::{
    ExecutionRecord, ExecutionStatus, Script, ScriptKind, ScriptSpec, ScriptStats, ScriptUpdate,
    Trigger, TriggerSource, VirtualMachine,
};
use crate::runner::ProcessRunner;
use crate::store::Store;
use crate::util;

pub use engine::{ExecutionResult, ScriptEngine};

#[derive(Debug, Clone, Default)]
pub struct ScriptFilter {
    pub kind: Option<ScriptKind>,
    pub trigger: Option<Trigger>,
    /// Only scripts associated with this machine name.
    pub vm: Option<String>,
    pub active_only: bool,
    /// Case-insensitive match on name or description.
    pub search: Option<String>,
}

/// One trigger script run as part of a control operation.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ScriptRun {
    pub script: String,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
}

impl<R: ProcessRunner, S: Store> Manager<R, S> {
    pub async fn create_script(&self, spec: ScriptSpec) -> Result<Script, VmError> {
        spec.validate()?;
        let guard = self.script_locks.lock(&spec.name).await;
        if self.store.find_script(&spec.name)?.is_some() {
            return Err(VmError::AlreadyExists {
                kind: "script",
                name: spec.name,
            });
        }

        let mut associated_vms = Vec::new();
        for vm_name in &spec.associated_vms {
            let vm = self.load_vm(vm_name)?;
            if !associated_vms.contains(&vm.id) {
                associated_vms.push(vm.id);
            }
        }

        let now = util::now_ms();
        let script = Script {
            id: util::new_id(),
            name: spec.name,
            description: spec.description,
            kind: spec.kind,
            body: spec.body,
            trigger: spec.trigger,
            execution_order: spec.execution_order,
            timeout_s: spec.timeout_s,
            environment: spec.environment,
            working_dir: spec.working_dir,
            run_as_admin: spec.run_as_admin,
            continue_on_error: spec.continue_on_error,
            associated_vms,
            tags: spec.tags,
            created_at: now,
            updated_at: now,
            ..Default::default()
        };
        self.store.save_script(&script)?;
        drop(guard);
        self.sync_vm_attachments(&script).await?;
        tracing::info!(script = %script.name, kind = %script.kind, trigger = %script.trigger, "script created");
        Ok(script)
    }

    pub fn get_script(&self, name: &str) -> Result<Script, VmError> {
        self.load_script(name)
    }

    /// Scripts sorted by execution order, then name.
    pub fn list_scripts(&self, filter: &ScriptFilter) -> Result<Vec<Script>, VmError> {
        let vm_id = match &filter.vm {
            Some(name) => Some(self.load_vm(name)?.id),
            None => None,
        };
        let query = filter.search.as_deref().map(str::to_lowercase);
        let mut scripts: Vec<Script> = self
            .store
            .list_scripts()?
            .into_iter()
            .filter(|s| filter.kind.is_none_or(|k| s.kind == k))
            .filter(|s| filter.trigger.is_none_or(|t| s.trigger == t))
            .filter(|s| !filter.active_only || s.is_active)
            .filter(|s| vm_id.as_ref().is_none_or(|id| s.associated_vms.contains(id)))
            .filter(|s| {
                query.as_ref().is_none_or(|q| {
                    s.name.to_lowercase().contains(q) || s.description.to_lowercase().contains(q)
                })
            })
            .collect();
        scripts.sort_by(|a, b| {
            a.execution_order
                .cmp(&b.execution_order)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(scripts)
    }

    pub async fn update_script(&self, name: &str, update: ScriptUpdate) -> Result<Script, VmError> {
        update.validate()?;
        let guard = self.script_locks.lock(name).await;
        let mut script = self.load_script(name)?;
        let trigger_changed = update.trigger.is_some_and(|t| t != script.trigger);
        update.apply(&mut script);
        script.touch();
        self.store.save_script(&script)?;
        drop(guard);
        if trigger_changed {
            self.sync_vm_attachments(&script).await?;
        }
        tracing::info!(script = %script.name, version = script.version, "script updated");
        Ok(script)
    }

    /// Link or unlink machines. Startup and shutdown scripts follow onto the
    /// machines' trigger lists.
    pub async fn associate_script(
        &self,
        name: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<Script, VmError> {
        let guard = self.script_locks.lock(name).await;
        let mut script = self.load_script(name)?;
        for vm_name in add {
            let vm = self.load_vm(vm_name)?;
            if !script.associated_vms.contains(&vm.id) {
                script.associated_vms.push(vm.id);
            }
        }
        for vm_name in remove {
            let vm = self.load_vm(vm_name)?;
            script.associated_vms.retain(|id| *id != vm.id);
        }
        script.touch();
        self.store.save_script(&script)?;
        drop(guard);
        self.sync_vm_attachments(&script).await?;
        Ok(script)
    }

    /// Delete a script and detach it from every machine. Returns how many
    /// machines referenced it.
    pub async fn delete_script(&self, name: &str) -> Result<usize, VmError> {
        let guard = self.script_locks.lock(name).await;
        let script = self.load_script(name)?;
        self.store.delete_script(&script.id)?;
        drop(guard);

        let associated: HashSet<&str> = script.associated_vms.iter().map(String::as_str).collect();
        let mut detached = 0;
        for listed in self.store.list_vms()? {
            if !associated.contains(listed.id.as_str()) && !listed.references_script(&script.id) {
                continue;
            }
            let _vm_guard = self.vm_locks.lock(&listed.name).await;
            let Some(mut vm) = self.store.get_vm(&listed.id)? else {
                continue;
            };
            if vm.detach_script(&script.id) {
                vm.touch();
                self.store.save_vm(&vm)?;
                detached += 1;
            }
        }
        tracing::info!(script = %script.name, detached, "script deleted");
        Ok(detached)
    }

    /// Run a script on the host. The outcome is recorded in the script's
    /// history whatever it is; only lookups and inactive scripts are errors.
    pub async fn run_script(
        &self,
        name: &str,
        vm: Option<&str>,
        overlay: &[(String, String)],
        source: TriggerSource,
    ) -> Result<ExecutionRecord, VmError> {
        let script = self.load_script(name)?;
        if !script.is_active {
            return Err(VmError::precondition(name, "script is inactive"));
        }
        let target = vm.map(|n| self.load_vm(n)).transpose()?;
        self.execute_and_record(&script, target.as_ref(), overlay, source)
            .await
    }

    pub fn script_history(
        &self,
        name: &str,
        page: usize,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>, VmError> {
        let script = self.load_script(name)?;
        Ok(script
            .history_page(page, limit)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn script_stats(&self, name: &str) -> Result<ScriptStats, VmError> {
        Ok(self.load_script(name)?.stats())
    }

    async fn execute_and_record(
        &self,
        script: &Script,
        target: Option<&VirtualMachine>,
        overlay: &[(String, String)],
        source: TriggerSource,
    ) -> Result<ExecutionRecord, VmError> {
        let engine = ScriptEngine::new(self.vbox.runner(), &self.settings.temp_dir);
        let result = engine.execute(script, target, overlay).await;
        let record = ExecutionRecord {
            timestamp: util::now_ms(),
            vm_id: target.map(|vm| vm.id.clone()),
            status: result.status,
            output: result.output,
            error: result.error,
            duration_ms: result.duration_ms,
            triggered_by: source,
        };

        // Reload under the lock so concurrent runs never drop history.
        let _guard = self.script_locks.lock(&script.name).await;
        match self.store.get_script(&script.id)? {
            Some(mut current) => {
                current.record_execution(record.clone());
                self.store.save_script(&current)?;
            }
            None => {
                tracing::warn!(script = %script.name, "script deleted while running, result not recorded");
            }
        }
        Ok(record)
    }

    /// Run the machine's startup or shutdown scripts in execution order.
    ///
    /// A failed script ends the chain unless it allows continuing. Nothing
    /// here fails the calling control operation.
    pub(crate) async fn run_trigger_scripts(
        &self,
        vm: &VirtualMachine,
        trigger: Trigger,
    ) -> Vec<ScriptRun> {
        let ids = match trigger {
            Trigger::Startup => &vm.startup_scripts,
            Trigger::Shutdown => &vm.shutdown_scripts,
            Trigger::Manual | Trigger::Scheduled => return Vec::new(),
        };
        if !self.settings.run_trigger_scripts || ids.is_empty() {
            return Vec::new();
        }

        let mut scripts = Vec::new();
        for id in ids {
            match self.store.get_script(id) {
                Ok(Some(script)) if script.is_active => scripts.push(script),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(vm = %vm.name, error = %e, "could not load trigger script");
                }
            }
        }
        scripts.sort_by_key(|s| s.execution_order);

        let mut runs = Vec::new();
        for script in scripts {
            let record = match self
                .execute_and_record(&script, Some(vm), &[], TriggerSource::System)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(script = %script.name, error = %e, "trigger script bookkeeping failed");
                    break;
                }
            };
            runs.push(ScriptRun {
                script: script.name.clone(),
                status: record.status,
                duration_ms: record.duration_ms,
            });
            if record.status != ExecutionStatus::Success && !script.continue_on_error {
                tracing::warn!(
                    vm = %vm.name,
                    script = %script.name,
                    status = %record.status,
                    "{trigger} script failed, skipping the rest"
                );
                break;
            }
        }
        runs
    }

    /// Make every machine's trigger lists agree with the script's trigger and
    /// associations. Only machines that are associated or already list the
    /// script are locked, so no script lock may be held.
    async fn sync_vm_attachments(&self, script: &Script) -> Result<(), VmError> {
        let associated: HashSet<&str> = script.associated_vms.iter().map(String::as_str).collect();
        for listed in self.store.list_vms()? {
            if !associated.contains(listed.id.as_str()) && !listed.references_script(&script.id) {
                continue;
            }
            let _vm_guard = self.vm_locks.lock(&listed.name).await;
            let Some(mut vm) = self.store.get_vm(&listed.id)? else {
                continue;
            };
            let before = (vm.startup_scripts.clone(), vm.shutdown_scripts.clone());
            vm.detach_script(&script.id);
            if associated.contains(vm.id.as_str()) {
                match script.trigger {
                    Trigger::Startup => vm.startup_scripts.push(script.id.clone()),
                    Trigger::Shutdown => vm.shutdown_scripts.push(script.id.clone()),
                    Trigger::Manual | Trigger::Scheduled => {}
                }
            }
            if (vm.startup_scripts.clone(), vm.shutdown_scripts.clone()) != before {
                vm.touch();
                self.store.save_vm(&vm)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OsType, VmSpec};
    use crate::testing;

    async fn with_vm(manager: &testing::TestManager, name: &str) -> VirtualMachine {
        manager
            .create_vm(VmSpec::new(name, OsType::Linux))
            .await
            .unwrap()
    }

    fn startup(name: &str, vms: &[&str]) -> ScriptSpec {
        let mut spec = ScriptSpec::new(name, ScriptKind::Bash, "echo ok");
        spec.trigger = Trigger::Startup;
        spec.associated_vms = vms.iter().map(|v| v.to_string()).collect();
        spec
    }

    #[tokio::test]
    async fn create_attaches_startup_script() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = testing::manager(dir.path());
        let vm = with_vm(&manager, "web").await;

        let script = manager.create_script(startup("boot", &["web"])).await.unwrap();
        assert_eq!(script.associated_vms, vec![vm.id.clone()]);
        let vm = manager.get_vm("web").unwrap();
        assert_eq!(vm.startup_scripts, vec![script.id]);
        assert!(vm.shutdown_scripts.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_unknown_vm_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = testing::manager(dir.path());
        let err = manager
            .create_script(startup("boot", &["ghost"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::NotFound { .. }));

        manager
            .create_script(ScriptSpec::new("a", ScriptKind::Bash, "true"))
            .await
            .unwrap();
        let err = manager
            .create_script(ScriptSpec::new("a", ScriptKind::Bash, "true"))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn delete_detaches_from_every_vm() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = testing::manager(dir.path());
        with_vm(&manager, "web").await;
        with_vm(&manager, "db").await;
        manager
            .create_script(startup("boot", &["web", "db"]))
            .await
            .unwrap();

        assert_eq!(manager.delete_script("boot").await.unwrap(), 2);
        for name in ["web", "db"] {
            assert!(manager.get_vm(name).unwrap().startup_scripts.is_empty());
        }
        assert!(manager.get_script("boot").is_err());
    }

    #[tokio::test]
    async fn trigger_change_moves_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = testing::manager(dir.path());
        with_vm(&manager, "web").await;
        let script = manager.create_script(startup("hook", &["web"])).await.unwrap();

        manager
            .update_script(
                "hook",
                ScriptUpdate {
                    trigger: Some(Trigger::Shutdown),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let vm = manager.get_vm("web").unwrap();
        assert!(vm.startup_scripts.is_empty());
        assert_eq!(vm.shutdown_scripts, vec![script.id]);
    }

    #[tokio::test]
    async fn run_records_history_and_vm_target() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, manager) = testing::manager(dir.path());
        let vm = with_vm(&manager, "web").await;
        manager
            .create_script(ScriptSpec::new("probe", ScriptKind::Bash, "echo hi"))
            .await
            .unwrap();
        fake.clear();

        let record = manager
            .run_script("probe", Some("web"), &[], TriggerSource::User)
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.vm_id.as_deref(), Some(vm.id.as_str()));

        let script = manager.get_script("probe").unwrap();
        assert_eq!(script.history.len(), 1);
        assert!(script.last_execution.is_some());
        assert_eq!(fake.invocations()[0].program, "bash");
    }

    #[tokio::test]
    async fn failed_run_is_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, manager) = testing::manager(dir.path());
        manager
            .create_script(ScriptSpec::new("probe", ScriptKind::Bash, "exit 1"))
            .await
            .unwrap();
        fake.fail("", "nope");

        let record = manager
            .run_script("probe", None, &[], TriggerSource::User)
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        let stats = manager.script_stats("probe").unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0);
    }

    #[tokio::test]
    async fn inactive_script_refuses_to_run() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, manager) = testing::manager(dir.path());
        manager
            .create_script(ScriptSpec::new("probe", ScriptKind::Bash, "true"))
            .await
            .unwrap();
        manager
            .update_script(
                "probe",
                ScriptUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = manager
            .run_script("probe", None, &[], TriggerSource::User)
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(fake.invocations().is_empty());
    }

    #[tokio::test]
    async fn trigger_chain_stops_on_failure_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, manager) = testing::manager(dir.path());
        with_vm(&manager, "web").await;

        let mut first = startup("first", &["web"]);
        first.execution_order = 1;
        first.continue_on_error = true;
        first.kind = ScriptKind::JavaScript;
        manager.create_script(first).await.unwrap();

        let mut second = startup("second", &["web"]);
        second.execution_order = 2;
        manager.create_script(second).await.unwrap();

        let mut third = startup("third", &["web"]);
        third.execution_order = 3;
        manager.create_script(third).await.unwrap();

        // Every script fails.
        fake.fail("", "bad");
        let vm = manager.get_vm("web").unwrap();
        let runs = manager.run_trigger_scripts(&vm, Trigger::Startup).await;
        let names: Vec<_> = runs.iter().map(|r| r.script.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(runs.iter().all(|r| r.status == ExecutionStatus::Error));
        assert_eq!(
            manager.get_script("second").unwrap().history[0].triggered_by,
            TriggerSource::System
        );
    }

    #[tokio::test]
    async fn list_filters_by_vm_and_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = testing::manager(dir.path());
        with_vm(&manager, "web").await;
        manager.create_script(startup("boot", &["web"])).await.unwrap();
        manager
            .create_script(ScriptSpec::new("ps", ScriptKind::PowerShell, "Get-Date"))
            .await
            .unwrap();

        let for_web = manager
            .list_scripts(&ScriptFilter {
                vm: Some("web".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_web.len(), 1);
        assert_eq!(for_web[0].name, "boot");

        let ps = manager
            .list_scripts(&ScriptFilter {
                kind: Some(ScriptKind::PowerShell),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].name, "ps");

        let searched = manager
            .list_scripts(&ScriptFilter {
                search: Some("BOO".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].name, "boot");
    }

    #[tokio::test]
    async fn associate_and_dissociate() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = testing::manager(dir.path());
        with_vm(&manager, "web").await;
        manager.create_script(startup("boot", &[])).await.unwrap();

        manager
            .associate_script("boot", &["web".into()], &[])
            .await
            .unwrap();
        assert_eq!(manager.get_vm("web").unwrap().startup_scripts.len(), 1);

        manager
            .associate_script("boot", &[], &["web".into()])
            .await
            .unwrap();
        assert!(manager.get_vm("web").unwrap().startup_scripts.is_empty());
    }
}
