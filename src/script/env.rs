//! Environment for a script run, built from named layers.
//!
//! Layers are applied in push order and later layers win on key collision.
//! The engine pushes them as process, script, caller, then target VM.

use std::collections::BTreeMap;
use std::fmt;

use crate::model::VirtualMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSource {
    /// The host process environment.
    Process,
    /// The script's stored overlay.
    Script,
    /// Variables supplied with this run.
    Caller,
    /// `VM_NAME`, `VM_ID` and `VM_STATUS` for the target machine.
    TargetVm,
}

impl fmt::Display for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnvSource::Process => "process",
            EnvSource::Script => "script",
            EnvSource::Caller => "caller",
            EnvSource::TargetVm => "target-vm",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayeredEnv {
    layers: Vec<(EnvSource, Vec<(String, String)>)>,
}

impl LayeredEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer<I, K, V>(mut self, source: EnvSource, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.layers.push((source, vars));
        self
    }

    /// Final key/value set.
    pub fn merged(&self) -> BTreeMap<String, String> {
        self.resolve()
            .into_iter()
            .map(|(k, (v, _))| (k, v))
            .collect()
    }

    /// Which layer supplied the final value for `key`.
    pub fn origin(&self, key: &str) -> Option<EnvSource> {
        self.resolve().get(key).map(|(_, source)| *source)
    }

    fn resolve(&self) -> BTreeMap<String, (String, EnvSource)> {
        let mut out = BTreeMap::new();
        for (source, vars) in &self.layers {
            for (k, v) in vars {
                out.insert(k.clone(), (v.clone(), *source));
            }
        }
        out
    }
}

/// Variables describing the target machine.
pub fn vm_vars(vm: &VirtualMachine) -> Vec<(String, String)> {
    vec![
        ("VM_NAME".to_string(), vm.name.clone()),
        ("VM_ID".to_string(), vm.id.clone()),
        ("VM_STATUS".to_string(), vm.status.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VmStatus;

    #[test]
    fn later_layers_win() {
        let env = LayeredEnv::new()
            .layer(EnvSource::Process, [("PATH", "/bin"), ("MODE", "process")])
            .layer(EnvSource::Script, [("MODE", "script"), ("LEVEL", "1")])
            .layer(EnvSource::Caller, [("LEVEL", "2")]);
        let merged = env.merged();
        assert_eq!(merged["PATH"], "/bin");
        assert_eq!(merged["MODE"], "script");
        assert_eq!(merged["LEVEL"], "2");
        assert_eq!(env.origin("MODE"), Some(EnvSource::Script));
        assert_eq!(env.origin("LEVEL"), Some(EnvSource::Caller));
        assert_eq!(env.origin("NOPE"), None);
    }

    #[test]
    fn vm_layer_overrides_caller_values() {
        let vm = VirtualMachine {
            id: "abc".into(),
            name: "web".into(),
            status: VmStatus::Running,
            ..Default::default()
        };
        let env = LayeredEnv::new()
            .layer(EnvSource::Caller, [("VM_NAME", "spoofed")])
            .layer(EnvSource::TargetVm, vm_vars(&vm));
        let merged = env.merged();
        assert_eq!(merged["VM_NAME"], "web");
        assert_eq!(merged["VM_ID"], "abc");
        assert_eq!(merged["VM_STATUS"], "running");
        assert_eq!(env.origin("VM_NAME"), Some(EnvSource::TargetVm));
    }
}
