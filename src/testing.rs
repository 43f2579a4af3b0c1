//! Test doubles shared by the unit tests.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::manager::{Manager, Settings};
use crate::runner::{Captured, Invocation, ProcessRunner, RunError};
use crate::store::DocumentStore;
use crate::vbox::VBoxManage;

#[derive(Clone)]
enum Reply {
    Ok(String),
    Fail(String),
    TimeOut,
}

/// Records every invocation and answers from canned replies.
///
/// A reply applies when the space-joined arguments start with its prefix.
/// Later replies win over earlier ones; unmatched calls succeed with empty
/// output.
#[derive(Default)]
pub struct FakeRunner {
    replies: Mutex<Vec<(String, Reply)>>,
    delays: Mutex<Vec<(String, Duration)>>,
    log: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.push(prefix, Reply::Ok(stdout.to_string()));
    }

    pub fn fail(&self, prefix: &str, stderr: &str) {
        self.push(prefix, Reply::Fail(stderr.to_string()));
    }

    pub fn time_out(&self, prefix: &str) {
        self.push(prefix, Reply::TimeOut);
    }

    /// Make every call to `program` take `delay` before it answers.
    pub fn delay(&self, program: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .push((program.to_string(), delay));
    }

    /// Shorthand for the `showvminfo` reply carrying `VMState`.
    pub fn vm_state(&self, name: &str, state: &str) {
        self.respond(
            &format!("showvminfo {name}"),
            &format!("name=\"{name}\"\nVMState=\"{state}\"\nmemory=2048\ncpus=2\n"),
        );
    }

    fn push(&self, prefix: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .push((prefix.to_string(), reply));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().unwrap().clone()
    }

    /// Arguments of every call, space-joined, program omitted.
    pub fn calls(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|inv| inv.args.join(" "))
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

impl ProcessRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<Captured, RunError> {
        self.log.lock().unwrap().push(invocation.clone());
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(program, _)| *program == invocation.program)
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let line = invocation.args.join(" ");
        let reply = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        match reply {
            None => Ok(Captured::default()),
            Some(Reply::Ok(stdout)) => Ok(Captured {
                stdout,
                stderr: String::new(),
            }),
            Some(Reply::Fail(stderr)) => Err(RunError::Failed {
                program: invocation.program.clone(),
                code: Some(1),
                stdout: String::new(),
                stderr,
            }),
            Some(Reply::TimeOut) => Err(RunError::TimedOut {
                program: invocation.program.clone(),
                after: invocation.timeout.unwrap_or(Duration::from_secs(1)),
            }),
        }
    }
}

pub type TestManager = Manager<Arc<FakeRunner>, DocumentStore>;

/// A manager over a fake VBoxManage and an in-memory store, with no settle
/// delay.
pub fn manager(temp_dir: &Path) -> (Arc<FakeRunner>, TestManager) {
    let fake = Arc::new(FakeRunner::new());
    let settings = Settings {
        vm_dir: temp_dir.join("vms"),
        temp_dir: temp_dir.join("scripts"),
        delete_settle: Duration::ZERO,
        rollback_on_create_failure: true,
        run_trigger_scripts: true,
    };
    let manager = Manager::new(
        VBoxManage::new(fake.clone(), "VBoxManage", None),
        DocumentStore::in_memory(),
        settings,
    );
    (fake, manager)
}
