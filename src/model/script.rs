use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use facet::Facet;

use crate::error::VmError;
use crate::util;

/// Executions kept per script; older entries are evicted first.
pub const HISTORY_CAP: usize = 100;

pub const MIN_TIMEOUT_S: u32 = 1;
pub const MAX_TIMEOUT_S: u32 = 3600;
pub const DEFAULT_TIMEOUT_S: u32 = 300;
pub const MAX_EXECUTION_ORDER: u32 = 100;
pub const MAX_BODY_LEN: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
pub enum ScriptKind {
    #[default]
    #[facet(rename = "powershell")]
    PowerShell,
    #[facet(rename = "batch")]
    Batch,
    #[facet(rename = "vbs")]
    Vbs,
    #[facet(rename = "javascript")]
    JavaScript,
    #[facet(rename = "bash")]
    Bash,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 5] = [
        ScriptKind::PowerShell,
        ScriptKind::Batch,
        ScriptKind::Vbs,
        ScriptKind::JavaScript,
        ScriptKind::Bash,
    ];

    /// File extension, including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ScriptKind::PowerShell => ".ps1",
            ScriptKind::Batch => ".bat",
            ScriptKind::Vbs => ".vbs",
            ScriptKind::JavaScript => ".js",
            ScriptKind::Bash => ".sh",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptKind::PowerShell => "powershell",
            ScriptKind::Batch => "batch",
            ScriptKind::Vbs => "vbs",
            ScriptKind::JavaScript => "javascript",
            ScriptKind::Bash => "bash",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptKind {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScriptKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                VmError::validation(format!(
                    "unsupported script type '{s}' (use powershell, batch, vbs, javascript or bash)"
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Trigger {
    Startup,
    Shutdown,
    #[default]
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Shutdown => "shutdown",
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "startup" => Ok(Trigger::Startup),
            "shutdown" => Ok(Trigger::Shutdown),
            "manual" => Ok(Trigger::Manual),
            "scheduled" => Ok(Trigger::Scheduled),
            _ => Err(VmError::validation(format!(
                "unknown trigger '{s}' (use startup, shutdown, manual or scheduled)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    #[default]
    Error,
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        })
    }
}

/// Who asked for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    User,
    System,
    Schedule,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ExecutionRecord {
    pub timestamp: u64,
    pub vm_id: Option<String>,
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub triggered_by: TriggerSource,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct LastExecution {
    pub timestamp: u64,
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(default)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: ScriptKind,
    pub body: String,
    pub trigger: Trigger,
    pub execution_order: u32,
    pub timeout_s: u32,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub run_as_admin: bool,
    pub continue_on_error: bool,
    pub associated_vms: Vec<String>,
    pub tags: Vec<String>,
    pub is_active: bool,
    pub last_execution: Option<LastExecution>,
    /// Oldest first, at most [`HISTORY_CAP`] entries.
    pub history: Vec<ExecutionRecord>,
    pub version: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            kind: ScriptKind::default(),
            body: String::new(),
            trigger: Trigger::default(),
            execution_order: 0,
            timeout_s: DEFAULT_TIMEOUT_S,
            environment: BTreeMap::new(),
            working_dir: None,
            run_as_admin: false,
            continue_on_error: false,
            associated_vms: Vec::new(),
            tags: Vec::new(),
            is_active: true,
            last_execution: None,
            history: Vec::new(),
            version: 1,
            created_at: 0,
            updated_at: 0,
        }
    }
}

impl Script {
    pub fn file_extension(&self) -> &'static str {
        self.kind.extension()
    }

    /// Append an execution, evicting the oldest entries past the cap, and
    /// make it the most recent execution summary.
    pub fn record_execution(&mut self, record: ExecutionRecord) {
        self.last_execution = Some(LastExecution {
            timestamp: record.timestamp,
            status: record.status,
            output: record.output.clone(),
            error: record.error.clone(),
            duration_ms: record.duration_ms,
        });
        self.history.push(record);
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
        self.touch();
    }

    /// Percentage of successful runs in the retained history, rounded.
    /// An empty history counts as 100.
    pub fn success_rate(&self) -> u32 {
        if self.history.is_empty() {
            return 100;
        }
        let ok = self
            .history
            .iter()
            .filter(|h| h.status == ExecutionStatus::Success)
            .count();
        ((ok as f64 / self.history.len() as f64) * 100.0).round() as u32
    }

    pub fn stats(&self) -> ScriptStats {
        let count = |status| self.history.iter().filter(|h| h.status == status).count();
        let total = self.history.len();
        let average_duration_ms = if total == 0 {
            0
        } else {
            let sum: u64 = self.history.iter().map(|h| h.duration_ms).sum();
            (sum as f64 / total as f64).round() as u64
        };
        ScriptStats {
            total_executions: total,
            successful: count(ExecutionStatus::Success),
            failed: count(ExecutionStatus::Error),
            timed_out: count(ExecutionStatus::Timeout),
            average_duration_ms,
            success_rate: self.success_rate(),
            last_execution: self.last_execution.clone(),
        }
    }

    /// History newest first, paginated. Pages start at 1.
    pub fn history_page(&self, page: usize, limit: usize) -> Vec<&ExecutionRecord> {
        let skip = page.saturating_sub(1).saturating_mul(limit);
        self.history.iter().rev().skip(skip).take(limit).collect()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = util::now_ms();
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ScriptStats {
    pub total_executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub average_duration_ms: u64,
    pub success_rate: u32,
    pub last_execution: Option<LastExecution>,
}

/// Everything needed to register a script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSpec {
    pub name: String,
    pub description: String,
    pub kind: ScriptKind,
    pub body: String,
    pub trigger: Trigger,
    pub execution_order: u32,
    pub timeout_s: u32,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub run_as_admin: bool,
    pub continue_on_error: bool,
    /// Machine names.
    pub associated_vms: Vec<String>,
    pub tags: Vec<String>,
}

impl ScriptSpec {
    pub fn new(name: impl Into<String>, kind: ScriptKind, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            body: body.into(),
            trigger: Trigger::Manual,
            execution_order: 0,
            timeout_s: DEFAULT_TIMEOUT_S,
            environment: BTreeMap::new(),
            working_dir: None,
            run_as_admin: false,
            continue_on_error: false,
            associated_vms: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), VmError> {
        super::validate_name("script", &self.name)?;
        super::validate_description(&self.description)?;
        validate_body(&self.body)?;
        validate_order(self.execution_order)?;
        validate_timeout(self.timeout_s)?;
        validate_environment(&self.environment)
    }
}

/// Edits to a registered script. The name and kind are fixed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptUpdate {
    pub description: Option<String>,
    pub body: Option<String>,
    pub trigger: Option<Trigger>,
    pub execution_order: Option<u32>,
    pub timeout_s: Option<u32>,
    pub environment: Option<BTreeMap<String, String>>,
    pub working_dir: Option<Option<String>>,
    pub run_as_admin: Option<bool>,
    pub continue_on_error: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

impl ScriptUpdate {
    pub fn validate(&self) -> Result<(), VmError> {
        if let Some(description) = &self.description {
            super::validate_description(description)?;
        }
        if let Some(body) = &self.body {
            validate_body(body)?;
        }
        if let Some(order) = self.execution_order {
            validate_order(order)?;
        }
        if let Some(timeout) = self.timeout_s {
            validate_timeout(timeout)?;
        }
        if let Some(env) = &self.environment {
            validate_environment(env)?;
        }
        Ok(())
    }

    /// Apply to `script`. Bumps the version when the body changes.
    pub(crate) fn apply(self, script: &mut Script) {
        if let Some(body) = self.body {
            if body != script.body {
                script.version += 1;
                script.body = body;
            }
        }
        if let Some(description) = self.description {
            script.description = description;
        }
        if let Some(trigger) = self.trigger {
            script.trigger = trigger;
        }
        if let Some(order) = self.execution_order {
            script.execution_order = order;
        }
        if let Some(timeout) = self.timeout_s {
            script.timeout_s = timeout;
        }
        if let Some(env) = self.environment {
            script.environment = env;
        }
        if let Some(dir) = self.working_dir {
            script.working_dir = dir;
        }
        if let Some(flag) = self.run_as_admin {
            script.run_as_admin = flag;
        }
        if let Some(flag) = self.continue_on_error {
            script.continue_on_error = flag;
        }
        if let Some(tags) = self.tags {
            script.tags = tags;
        }
        if let Some(active) = self.is_active {
            script.is_active = active;
        }
        script.touch();
    }
}

fn validate_body(body: &str) -> Result<(), VmError> {
    if body.trim().is_empty() {
        return Err(VmError::validation("script content is required"));
    }
    if body.chars().count() > MAX_BODY_LEN {
        return Err(VmError::validation(format!(
            "script content cannot exceed {MAX_BODY_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_order(order: u32) -> Result<(), VmError> {
    if order > MAX_EXECUTION_ORDER {
        return Err(VmError::validation(format!(
            "execution order must be between 0 and {MAX_EXECUTION_ORDER}"
        )));
    }
    Ok(())
}

fn validate_timeout(timeout_s: u32) -> Result<(), VmError> {
    if !(MIN_TIMEOUT_S..=MAX_TIMEOUT_S).contains(&timeout_s) {
        return Err(VmError::validation(format!(
            "timeout must be between {MIN_TIMEOUT_S} and {MAX_TIMEOUT_S} seconds"
        )));
    }
    Ok(())
}

fn validate_environment(env: &BTreeMap<String, String>) -> Result<(), VmError> {
    for key in env.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(VmError::validation(format!(
                "invalid environment variable name '{key}'"
            )));
        }
    }
    Ok(())
}
