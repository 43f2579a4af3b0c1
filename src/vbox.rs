//! Typed wrapper around the `VBoxManage` command line.
//!
//! Each method builds one invocation. Output is returned trimmed, stderr that
//! is not a VirtualBox `WARNING` is logged, and every failure is normalized
//! into [`VmError::Tool`] carrying the command and the tool's own message.

use std::path::Path;
use std::time::Duration;

use crate::error::VmError;
use crate::model::{NetworkAdapter, SharedFolder};
use crate::parse::{self, ListedVm, VmInfo};
use crate::runner::{Captured, Invocation, ProcessRunner, RunError};

const SATA_CONTROLLER: &str = "SATA Controller";
const NO_SNAPSHOTS: &str = "does not have any snapshots";

/// `controlvm` verbs that need no extra arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    AcpiPowerButton,
    PowerOff,
    Pause,
    Resume,
    Reset,
}

impl ControlAction {
    pub fn as_arg(self) -> &'static str {
        match self {
            ControlAction::AcpiPowerButton => "acpipowerbutton",
            ControlAction::PowerOff => "poweroff",
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Reset => "reset",
        }
    }
}

pub struct VBoxManage<R> {
    runner: R,
    program: String,
    timeout: Option<Duration>,
}

impl<R: ProcessRunner> VBoxManage<R> {
    pub fn new(runner: R, program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run_raw(&self, args: Vec<String>) -> (String, Result<Captured, RunError>) {
        let invocation = Invocation::new(&self.program)
            .args(args)
            .timeout(self.timeout);
        let command = redact(&invocation).command_line();
        tracing::info!(command = %command, "running VBoxManage");

        let result = self.runner.run(&invocation).await;
        if let Ok(out) = &result {
            let stderr = out.stderr.trim();
            if !stderr.is_empty() && !stderr.contains("WARNING") {
                tracing::warn!(command = %command, stderr, "VBoxManage wrote to stderr");
            }
        }
        (command, result)
    }

    /// Run `VBoxManage <args>` and return trimmed stdout.
    pub async fn exec<I, S>(&self, args: I) -> Result<String, VmError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (command, result) = self.run_raw(args.into_iter().map(Into::into).collect()).await;
        match result {
            Ok(out) => Ok(out.stdout.trim().to_string()),
            Err(e) => Err(tool_error(command, &e)),
        }
    }

    pub async fn list_vms(&self) -> Result<Vec<ListedVm>, VmError> {
        let out = self.exec(["list", "vms"]).await?;
        Ok(parse::parse_vm_list(&out))
    }

    pub async fn vm_info(&self, name: &str) -> Result<VmInfo, VmError> {
        let out = self.exec(["showvminfo", name, "--machinereadable"]).await?;
        Ok(parse::parse_vm_info(&out))
    }

    /// Create and register a machine. Returns the UUID when the tool reports one.
    pub async fn create_vm(&self, name: &str, os_type: &str) -> Result<Option<String>, VmError> {
        let out = self
            .exec(["createvm", "--name", name, "--ostype", os_type, "--register"])
            .await?;
        Ok(parse::parse_created_uuid(&out))
    }

    pub async fn modify_resources(
        &self,
        name: &str,
        memory_mb: u64,
        cpus: u32,
        adapters: &[NetworkAdapter],
    ) -> Result<(), VmError> {
        let mut args = vec![
            "modifyvm".to_string(),
            name.to_string(),
            "--memory".into(),
            memory_mb.to_string(),
            "--cpus".into(),
            cpus.to_string(),
        ];
        for (i, adapter) in adapters.iter().enumerate() {
            let mode = if adapter.enabled {
                adapter.kind.vbox_nic_mode()
            } else {
                "none"
            };
            args.push(format!("--nic{}", i + 1));
            args.push(mode.to_string());
        }
        self.exec(args).await.map(drop)
    }

    pub async fn create_disk(&self, path: &Path, size_mb: u64) -> Result<(), VmError> {
        let path = path.display().to_string();
        let size = size_mb.to_string();
        self.exec(["createhd", "--filename", path.as_str(), "--size", size.as_str()])
            .await
            .map(drop)
    }

    pub async fn add_sata_controller(&self, name: &str) -> Result<(), VmError> {
        self.exec([
            "storagectl",
            name,
            "--name",
            SATA_CONTROLLER,
            "--add",
            "sata",
            "--controller",
            "IntelAHCI",
        ])
        .await
        .map(drop)
    }

    pub async fn attach_disk(&self, name: &str, disk: &Path) -> Result<(), VmError> {
        let disk = disk.display().to_string();
        self.exec([
            "storageattach",
            name,
            "--storagectl",
            SATA_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "hdd",
            "--medium",
            disk.as_str(),
        ])
        .await
        .map(drop)
    }

    pub async fn add_shared_folder(&self, name: &str, folder: &SharedFolder) -> Result<(), VmError> {
        let mut args = vec![
            "sharedfolder".to_string(),
            "add".into(),
            name.to_string(),
            "--name".into(),
            folder.name.clone(),
            "--hostpath".into(),
            folder.host_path.clone(),
        ];
        if folder.read_only {
            args.push("--readonly".into());
        }
        if !folder.guest_path.is_empty() {
            args.push("--automount".into());
            args.push("--auto-mount-point".into());
            args.push(folder.guest_path.clone());
        }
        self.exec(args).await.map(drop)
    }

    pub async fn start_headless(&self, name: &str) -> Result<(), VmError> {
        self.exec(["startvm", name, "--type", "headless"])
            .await
            .map(drop)
    }

    pub async fn control(&self, name: &str, action: ControlAction) -> Result<(), VmError> {
        self.exec(["controlvm", name, action.as_arg()])
            .await
            .map(drop)
    }

    pub async fn screenshot(&self, name: &str, out: &Path) -> Result<(), VmError> {
        let out = out.display().to_string();
        self.exec(["controlvm", name, "screenshotpng", out.as_str()])
            .await
            .map(drop)
    }

    pub async fn unregister(&self, name: &str, delete_files: bool) -> Result<(), VmError> {
        let mut args = vec!["unregistervm", name];
        if delete_files {
            args.push("--delete");
        }
        self.exec(args).await.map(drop)
    }

    pub async fn snapshot_take(
        &self,
        name: &str,
        snapshot: &str,
        description: &str,
    ) -> Result<(), VmError> {
        let mut args = vec!["snapshot", name, "take", snapshot];
        if !description.is_empty() {
            args.push("--description");
            args.push(description);
        }
        self.exec(args).await.map(drop)
    }

    pub async fn snapshot_restore(&self, name: &str, snapshot: &str) -> Result<(), VmError> {
        self.exec(["snapshot", name, "restore", snapshot])
            .await
            .map(drop)
    }

    pub async fn snapshot_delete(&self, name: &str, snapshot: &str) -> Result<(), VmError> {
        self.exec(["snapshot", name, "delete", snapshot])
            .await
            .map(drop)
    }

    /// Snapshot names as reported by the tool, duplicates included.
    ///
    /// A machine without snapshots makes VBoxManage exit non-zero; that case
    /// is an empty list, every other failure propagates.
    pub async fn snapshot_names(&self, name: &str) -> Result<Vec<String>, VmError> {
        let args = ["snapshot", name, "list", "--machinereadable"]
            .map(String::from)
            .to_vec();
        let (command, result) = self.run_raw(args).await;
        match result {
            Ok(out) => Ok(parse::parse_snapshot_names(&out.stdout)),
            Err(RunError::Failed { stdout, stderr, .. })
                if stderr.contains(NO_SNAPSHOTS) || stdout.contains(NO_SNAPSHOTS) =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(tool_error(command, &e)),
        }
    }

    /// Run a command inside the guest through Guest Additions.
    pub async fn guest_run(
        &self,
        name: &str,
        username: &str,
        password: &str,
        command: &[String],
    ) -> Result<String, VmError> {
        let mut args: Vec<String> = [
            "guestcontrol",
            name,
            "run",
            "--username",
            username,
            "--password",
            password,
            "--",
        ]
        .map(String::from)
        .to_vec();
        args.extend(command.iter().cloned());
        self.exec(args).await
    }
}

fn tool_error(command: String, err: &RunError) -> VmError {
    let message = match err {
        RunError::Failed { stdout, stderr, .. } => {
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            if detail.is_empty() {
                "command failed without output".to_string()
            } else {
                detail.to_string()
            }
        }
        RunError::TimedOut { after, .. } => {
            format!("timed out after {}s", after.as_secs_f64())
        }
        RunError::Spawn { message, .. } => format!("could not run VBoxManage: {message}"),
    };
    VmError::Tool { command, message }
}

/// Copy of `invocation` with the value after `--password` masked.
fn redact(invocation: &Invocation) -> Invocation {
    let mut masked = invocation.clone();
    let mut hide_next = false;
    for arg in &mut masked.args {
        if hide_next {
            *arg = "****".to_string();
            hide_next = false;
        } else if arg == "--password" {
            hide_next = true;
        }
    }
    masked
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::NetworkKind;
    use crate::testing::FakeRunner;

    fn vbox() -> (Arc<FakeRunner>, VBoxManage<Arc<FakeRunner>>) {
        let fake = Arc::new(FakeRunner::new());
        (fake.clone(), VBoxManage::new(fake, "VBoxManage", None))
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let (fake, vbox) = vbox();
        fake.respond("list vms", "\n\"web\" {1234}\n\n");
        let vms = vbox.list_vms().await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(fake.calls(), vec!["list vms"]);
    }

    #[tokio::test]
    async fn failure_becomes_tool_error_with_stderr() {
        let (fake, vbox) = vbox();
        fake.fail("startvm", "VBoxManage: error: Could not find a registered machine");
        match vbox.start_headless("web").await {
            Err(VmError::Tool { command, message }) => {
                assert_eq!(command, "VBoxManage startvm web --type headless");
                assert!(message.contains("Could not find"));
            }
            other => panic!("expected Tool error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_message_hides_signal_details() {
        let (fake, vbox) = vbox();
        fake.time_out("showvminfo");
        let err = vbox.vm_info("web").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn modify_sets_nics_in_order() {
        let (fake, vbox) = vbox();
        let adapters = vec![
            NetworkAdapter {
                kind: NetworkKind::Nat,
                enabled: true,
            },
            NetworkAdapter {
                kind: NetworkKind::HostOnly,
                enabled: false,
            },
        ];
        vbox.modify_resources("web", 2048, 2, &adapters)
            .await
            .unwrap();
        assert_eq!(
            fake.calls(),
            vec!["modifyvm web --memory 2048 --cpus 2 --nic1 nat --nic2 none"]
        );
    }

    #[tokio::test]
    async fn arguments_with_spaces_stay_single_words() {
        let (fake, vbox) = vbox();
        vbox.add_sata_controller("my vm").await.unwrap();
        let inv = fake.invocations().pop().unwrap();
        assert_eq!(inv.args[1], "my vm");
        assert_eq!(inv.args[3], "SATA Controller");
    }

    #[tokio::test]
    async fn snapshot_take_omits_empty_description() {
        let (fake, vbox) = vbox();
        vbox.snapshot_take("web", "base", "").await.unwrap();
        vbox.snapshot_take("web", "v2", "after update")
            .await
            .unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                "snapshot web take base",
                "snapshot web take v2 --description after update"
            ]
        );
    }

    #[tokio::test]
    async fn no_snapshots_is_empty_list() {
        let (fake, vbox) = vbox();
        fake.fail(
            "snapshot web list",
            "This machine does not have any snapshots",
        );
        assert!(vbox.snapshot_names("web").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_snapshot_list_failures_propagate() {
        let (fake, vbox) = vbox();
        fake.fail("snapshot web list", "Could not find a registered machine");
        assert!(vbox.snapshot_names("web").await.is_err());
    }

    #[tokio::test]
    async fn password_is_masked_in_errors() {
        let (fake, vbox) = vbox();
        fake.fail("guestcontrol", "guest additions not running");
        let err = vbox
            .guest_run("web", "admin", "hunter2", &["whoami".to_string()])
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("--password '****'") || text.contains("--password ****"));
        // The real argv still carries the password.
        let inv = fake.invocations().pop().unwrap();
        assert!(inv.args.contains(&"hunter2".to_string()));
    }

    #[tokio::test]
    async fn unregister_with_and_without_delete() {
        let (fake, vbox) = vbox();
        vbox.unregister("web", false).await.unwrap();
        vbox.unregister("web", true).await.unwrap();
        assert_eq!(
            fake.calls(),
            vec!["unregistervm web", "unregistervm web --delete"]
        );
    }
}
