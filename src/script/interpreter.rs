//! Per-interpreter command construction.
//!
//! Elevated Windows interpreters are re-launched through PowerShell's
//! `Start-Process -Verb RunAs -Wait`, which blocks until the privileged
//! process exits and then forwards its exit code. Unix interpreters are
//! prefixed with non-interactive `sudo`.

use std::path::Path;

use crate::model::ScriptKind;
use crate::runner::Invocation;

/// Program and leading arguments that run `script` directly.
fn direct(kind: ScriptKind, script: &str) -> (&'static str, Vec<String>) {
    match kind {
        ScriptKind::PowerShell => (
            "powershell",
            vec![
                "-NoProfile".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-File".into(),
                script.into(),
            ],
        ),
        ScriptKind::Batch => ("cmd", vec!["/C".into(), script.into()]),
        ScriptKind::Vbs => ("cscript", vec!["//NoLogo".into(), script.into()]),
        ScriptKind::JavaScript => ("node", vec![script.into()]),
        ScriptKind::Bash => ("bash", vec![script.into()]),
    }
}

fn uses_runas(kind: ScriptKind) -> bool {
    matches!(
        kind,
        ScriptKind::PowerShell | ScriptKind::Batch | ScriptKind::Vbs
    )
}

/// Single-quoted PowerShell literal.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn invocation(kind: ScriptKind, script: &Path, elevate: bool) -> Invocation {
    let script = script.display().to_string();
    let (program, args) = direct(kind, &script);

    if !elevate {
        return Invocation::new(program).args(args);
    }

    if uses_runas(kind) {
        let arg_list = args
            .iter()
            .map(|a| ps_quote(a))
            .collect::<Vec<_>>()
            .join(",");
        let command = format!(
            "$p = Start-Process -FilePath {} -ArgumentList {arg_list} -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
            ps_quote(program)
        );
        Invocation::new("powershell").args([
            "-NoProfile".to_string(),
            "-ExecutionPolicy".into(),
            "Bypass".into(),
            "-Command".into(),
            command,
        ])
    } else {
        Invocation::new("sudo")
            .args(["-n", program])
            .args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_runs_file_directly() {
        let inv = invocation(ScriptKind::Bash, Path::new("/tmp/script_x.sh"), false);
        assert_eq!(inv.program, "bash");
        assert_eq!(inv.args, vec!["/tmp/script_x.sh"]);
    }

    #[test]
    fn powershell_bypasses_policy() {
        let inv = invocation(ScriptKind::PowerShell, Path::new("C:/t/a.ps1"), false);
        assert_eq!(inv.program, "powershell");
        assert_eq!(inv.args.last().map(String::as_str), Some("C:/t/a.ps1"));
        assert!(inv.args.contains(&"Bypass".to_string()));
    }

    #[test]
    fn elevated_batch_waits_for_runas() {
        let inv = invocation(ScriptKind::Batch, Path::new("C:/t/it's.bat"), true);
        assert_eq!(inv.program, "powershell");
        let command = inv.args.last().unwrap();
        assert!(command.contains("Start-Process -FilePath 'cmd'"));
        assert!(command.contains("'/C','C:/t/it''s.bat'"));
        assert!(command.contains("-Verb RunAs -Wait"));
        assert!(command.ends_with("exit $p.ExitCode"));
    }

    #[test]
    fn elevated_bash_uses_sudo() {
        let inv = invocation(ScriptKind::Bash, Path::new("/tmp/a.sh"), true);
        assert_eq!(inv.program, "sudo");
        assert_eq!(inv.args, vec!["-n", "bash", "/tmp/a.sh"]);
    }

    #[test]
    fn every_kind_has_a_command() {
        for kind in ScriptKind::ALL {
            let inv = invocation(kind, Path::new("s"), false);
            assert!(!inv.program.is_empty());
            assert!(inv.args.iter().any(|a| a == "s"));
        }
    }
}
