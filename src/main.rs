use std::io::IsTerminal;

use clap::Parser;
use facet::Facet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vboxctl::cli::{Cli, Command, OutputFormat, PageArgs, ScriptCommand, SnapshotCommand, VmCommand};
use vboxctl::config::{self, SystemConfig};
use vboxctl::error::{BestEffort, VmError};
use vboxctl::logging;
use vboxctl::manager::{Manager, Settings};
use vboxctl::model::{
    ScriptSpec, ScriptUpdate, Snapshot, SnapshotUpdate, TriggerSource, VirtualMachine, VmSpec,
    VmUpdate,
};
use vboxctl::orchestrator::{StopMode, VmFilter};
use vboxctl::progress::Spinner;
use vboxctl::runner::SystemRunner;
use vboxctl::script::{ScriptFilter, ScriptRun};
use vboxctl::snapshots::{ChildPolicy, SnapshotFilter, TakeSnapshot};
use vboxctl::store::DocumentStore;
use vboxctl::util;
use vboxctl::vbox::VBoxManage;

type App = Manager<SystemRunner, DocumentStore>;

#[derive(Facet)]
struct DeleteJson {
    name: String,
    pre_stop: String,
    files_deleted: bool,
    snapshots_removed: usize,
    scripts_detached: usize,
}

#[derive(Facet)]
struct RestoreJson {
    vm: VirtualMachine,
    snapshot: Snapshot,
}

#[derive(Facet)]
struct ScriptDeleteJson {
    name: String,
    detached_from: usize,
}

#[derive(Facet)]
struct ExecJson {
    output: String,
}

#[derive(Facet)]
struct PathJson {
    path: String,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Keep stderr quiet by default; the spinner owns the terminal while it runs.
    let terminal_filter = if cli.verbose {
        EnvFilter::new("vboxctl=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vboxctl=warn"))
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vboxctl=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let sys_config = config::load_config(cli.config.as_deref())?;

    let log_path = sys_config.logs_dir().join("vboxctl.log");
    if let Err(e) = logging::rotate_if_large(&log_path, logging::MAX_LOG_BYTES) {
        tracing::debug!(error = %e, "log rotation skipped");
    }
    if let Err(e) = file_handle.set_file(&log_path) {
        tracing::warn!(path = %log_path.display(), error = %e, "file logging disabled");
    }

    let manager = build_manager(&sys_config)?;
    let out = Output {
        format: cli.output,
        interactive: std::io::stderr().is_terminal(),
    };

    match cli.command {
        Command::Vm { action } => run_vm(&manager, action, &out).await?,
        Command::Snapshot { action } => run_snapshot(&manager, action, &out).await?,
        Command::Script { action } => run_script(&manager, &sys_config, action, &out).await?,
    }
    Ok(())
}

fn build_manager(sys_config: &SystemConfig) -> Result<App, VmError> {
    let vbox = VBoxManage::new(
        SystemRunner,
        sys_config.vboxmanage_program(),
        sys_config.tool_timeout(),
    );
    let store = DocumentStore::open(&sys_config.store_path())?;
    Ok(Manager::new(vbox, store, Settings::from_config(sys_config)))
}

struct Output {
    format: OutputFormat,
    interactive: bool,
}

impl Output {
    fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<'a, T: Facet<'a>>(&self, value: &T) -> Result<(), VmError> {
        let text = facet_json::to_string(value).map_err(|e| VmError::Output {
            message: e.to_string(),
        })?;
        println!("{text}");
        Ok(())
    }

    fn spinner(&self, prefix: &str, message: impl Into<String>) -> Spinner {
        Spinner::new(prefix, message, self.interactive && !self.is_json())
    }
}

async fn run_vm(manager: &App, action: VmCommand, out: &Output) -> Result<(), VmError> {
    match action {
        VmCommand::List {
            status,
            os_type,
            search,
            no_sync,
            pages,
        } => {
            if !no_sync {
                manager.reconcile_for_read().await?;
            }
            let vms = manager.list_vms(&VmFilter {
                status,
                os_type,
                search,
            })?;
            let total = vms.len();
            let vms = util::paginate(vms, pages.page, pages.limit);
            if out.is_json() {
                return out.json(&vms);
            }
            if vms.is_empty() {
                println!("No VMs.");
            }
            for vm in &vms {
                println!(
                    "{:<24} {:<8} {:<8} {:>6} MB  {} CPU",
                    vm.name, vm.status, vm.os_type, vm.memory_mb, vm.cpus
                );
            }
            print_page_footer(total, pages);
        }
        VmCommand::Show { name } => {
            let (vm, _refresh) = manager.show_vm(&name).await?;
            if out.is_json() {
                return out.json(&vm);
            }
            print_vm(&vm);
        }
        VmCommand::Create {
            name,
            os_type,
            memory,
            cpus,
            disk,
            description,
            networks,
            shares,
            tags,
        } => {
            let mut spec = VmSpec::new(&name, os_type);
            spec.memory_mb = memory;
            spec.cpus = cpus;
            spec.disk_size_gb = disk;
            spec.description = description;
            if !networks.is_empty() {
                spec.network_adapters = networks;
            }
            spec.shared_folders = shares;
            spec.tags = tags;

            let spinner = out.spinner("create", format!("creating {name}"));
            match manager.create_vm(spec).await {
                Ok(vm) => {
                    spinner.succeed(format!("created {}", vm.name));
                    if out.is_json() {
                        return out.json(&vm);
                    }
                    if !out.interactive {
                        println!("Created VM '{}'", vm.name);
                    }
                }
                Err(e) => {
                    spinner.fail(format!("could not create {name}"));
                    return Err(e);
                }
            }
        }
        VmCommand::Update {
            name,
            description,
            memory,
            cpus,
            networks,
            shares,
            tags,
        } => {
            let update = VmUpdate {
                description,
                memory_mb: memory,
                cpus,
                network_adapters: non_empty(networks),
                shared_folders: non_empty(shares),
                tags: non_empty(tags),
            };
            if update.is_empty() {
                return Err(VmError::Validation {
                    message: "nothing to update".into(),
                });
            }
            let vm = manager.update_vm(&name, update).await?;
            if out.is_json() {
                return out.json(&vm);
            }
            println!("Updated VM '{}'", vm.name);
        }
        VmCommand::Start { name } => {
            let outcome = manager.start_vm(&name).await?;
            if out.is_json() {
                return out.json(&outcome);
            }
            println!("VM '{}' is {}", outcome.vm.name, outcome.vm.status);
            print_script_runs(&outcome.scripts);
        }
        VmCommand::Stop { name, force } => {
            let mode = if force {
                StopMode::Forced
            } else {
                StopMode::Graceful
            };
            let outcome = manager.stop_vm(&name, mode).await?;
            if out.is_json() {
                return out.json(&outcome);
            }
            print_script_runs(&outcome.scripts);
            println!("VM '{}' is {}", outcome.vm.name, outcome.vm.status);
        }
        VmCommand::Pause { name } => report_vm(out, manager.pause_vm(&name).await?)?,
        VmCommand::Resume { name } => report_vm(out, manager.resume_vm(&name).await?)?,
        VmCommand::Restart { name } => report_vm(out, manager.restart_vm(&name).await?)?,
        VmCommand::Delete {
            name,
            delete_files,
            yes,
        } => {
            // Fail on unknown names before prompting.
            manager.get_vm(&name)?;
            if !yes && std::io::stdin().is_terminal() {
                let what = if delete_files {
                    format!("Delete VM '{name}' and all its files?")
                } else {
                    format!("Unregister VM '{name}'?")
                };
                if !confirm(&what)? {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            let spinner = out.spinner("delete", format!("deleting {name}"));
            let report = match manager.delete_vm(&name, delete_files).await {
                Ok(report) => {
                    spinner.succeed(format!("deleted {name}"));
                    report
                }
                Err(e) => {
                    spinner.fail(format!("could not delete {name}"));
                    return Err(e);
                }
            };
            if out.is_json() {
                return out.json(&DeleteJson {
                    name: report.name,
                    pre_stop: describe_best_effort(&report.pre_stop),
                    files_deleted: report.files_deleted,
                    snapshots_removed: report.snapshots_removed,
                    scripts_detached: report.scripts_detached,
                });
            }
            if let BestEffort::Skipped { reason } = &report.pre_stop {
                println!("  pre-delete stop skipped: {reason}");
            }
            println!(
                "Deleted VM '{}' ({} snapshots, detached from {} scripts{})",
                report.name,
                report.snapshots_removed,
                report.scripts_detached,
                if report.files_deleted {
                    ", files removed"
                } else {
                    ""
                }
            );
        }
        VmCommand::Screenshot { name, out: path } => {
            manager.screenshot(&name, &path).await?;
            if out.is_json() {
                return out.json(&PathJson {
                    path: path.display().to_string(),
                });
            }
            println!("Saved {}", path.display());
        }
        VmCommand::Exec {
            name,
            username,
            password,
            command,
        } => {
            let output = manager
                .guest_exec(&name, &username, &password, &command)
                .await?;
            if out.is_json() {
                return out.json(&ExecJson { output });
            }
            println!("{output}");
        }
        VmCommand::Reconcile => {
            let report = manager.reconcile().await?;
            if out.is_json() {
                return out.json(&report);
            }
            for change in &report.updated {
                println!("{}: {} -> {}", change.name, change.from, change.to);
            }
            for name in &report.untracked {
                println!("{name}: registered in VirtualBox but not managed");
            }
            for name in &report.dangling {
                println!("{name}: managed but missing from VirtualBox");
            }
            for failure in &report.failed {
                println!("{failure}");
            }
            if report.updated.is_empty()
                && report.untracked.is_empty()
                && report.dangling.is_empty()
                && report.failed.is_empty()
            {
                println!("Everything in sync.");
            }
        }
    }
    Ok(())
}

async fn run_snapshot(manager: &App, action: SnapshotCommand, out: &Output) -> Result<(), VmError> {
    match action {
        SnapshotCommand::List { vm, search, pages } => {
            let snaps = manager.list_all_snapshots(&SnapshotFilter {
                vm: vm.clone(),
                search,
            })?;
            let total = snaps.len();
            let snaps = util::paginate(snaps, pages.page, pages.limit);
            if out.is_json() {
                return out.json(&snaps);
            }
            let vms = manager.list_vms(&VmFilter::default())?;
            let currents: Vec<&str> = vms
                .iter()
                .filter_map(|v| v.current_snapshot.as_deref())
                .collect();
            let vm_name = |id: &str| {
                vms.iter()
                    .find(|v| v.id == id)
                    .map_or("?", |v| v.name.as_str())
            };
            if snaps.is_empty() {
                println!("No snapshots.");
            }
            for snap in &snaps {
                let marker = if currents.contains(&snap.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                if vm.is_some() {
                    println!(
                        "{marker} {:<24} {:<8} {}  {}",
                        snap.name,
                        snap.vm_state,
                        util::format_timestamp(snap.created_at),
                        snap.description
                    );
                } else {
                    println!(
                        "{marker} {:<16} {:<24} {:<8} {}  {}",
                        vm_name(&snap.vm_id),
                        snap.name,
                        snap.vm_state,
                        util::format_timestamp(snap.created_at),
                        snap.description
                    );
                }
            }
            print_page_footer(total, pages);
        }
        SnapshotCommand::Take {
            vm,
            name,
            description,
            tags,
        } => {
            let spinner = out.spinner("snapshot", format!("taking {name}"));
            let snap = match manager
                .take_snapshot(
                    &vm,
                    TakeSnapshot {
                        name,
                        description,
                        tags,
                        is_auto: false,
                    },
                )
                .await
            {
                Ok(snap) => {
                    spinner.succeed(format!("took {}", snap.name));
                    snap
                }
                Err(e) => {
                    spinner.fail("snapshot failed");
                    return Err(e);
                }
            };
            if out.is_json() {
                return out.json(&snap);
            }
            println!("Took snapshot '{}' of '{vm}' ({})", snap.name, snap.vm_state);
        }
        SnapshotCommand::Restore { vm, name } => {
            let (vm, snapshot) = manager.restore_snapshot(&vm, &name).await?;
            if out.is_json() {
                return out.json(&RestoreJson { vm, snapshot });
            }
            println!(
                "Restored '{}' to '{}'; VM is {}",
                vm.name, snapshot.name, vm.status
            );
        }
        SnapshotCommand::Delete { vm, name, reparent } => {
            let policy = if reparent {
                ChildPolicy::Reparent
            } else {
                ChildPolicy::Cascade
            };
            let report = manager.delete_snapshot(&vm, &name, policy).await?;
            if out.is_json() {
                return out.json(&report);
            }
            println!("Deleted: {}", report.removed.join(", "));
            if !report.reparented.is_empty() {
                println!("Reparented: {}", report.reparented.join(", "));
            }
        }
        SnapshotCommand::Update {
            vm,
            name,
            description,
            tags,
        } => {
            let snap = manager
                .update_snapshot(
                    &vm,
                    &name,
                    SnapshotUpdate {
                        description,
                        tags: non_empty(tags),
                    },
                )
                .await?;
            if out.is_json() {
                return out.json(&snap);
            }
            println!("Updated snapshot '{}'", snap.name);
        }
        SnapshotCommand::Sync { vm } => {
            let report = manager.sync_snapshots(&vm).await?;
            if out.is_json() {
                return out.json(&report);
            }
            println!(
                "added {}, removed {}, unchanged {}",
                report.added.len(),
                report.removed.len(),
                report.unchanged
            );
        }
    }
    Ok(())
}

async fn run_script(
    manager: &App,
    sys_config: &SystemConfig,
    action: ScriptCommand,
    out: &Output,
) -> Result<(), VmError> {
    match action {
        ScriptCommand::List {
            kind,
            trigger,
            vm,
            active,
            search,
            pages,
        } => {
            let scripts = manager.list_scripts(&ScriptFilter {
                kind,
                trigger,
                vm,
                active_only: active,
                search,
            })?;
            let total = scripts.len();
            let scripts = util::paginate(scripts, pages.page, pages.limit);
            if out.is_json() {
                return out.json(&scripts);
            }
            if scripts.is_empty() {
                println!("No scripts.");
            }
            for s in &scripts {
                println!(
                    "{:<24} {:<10} {:<9} order {:>3}  {}",
                    s.name,
                    s.kind,
                    s.trigger,
                    s.execution_order,
                    if s.is_active { "active" } else { "inactive" }
                );
            }
            print_page_footer(total, pages);
        }
        ScriptCommand::Add {
            name,
            kind,
            file,
            trigger,
            description,
            order,
            timeout,
            env,
            working_dir,
            admin,
            continue_on_error,
            vms,
            tags,
        } => {
            let mut spec = ScriptSpec::new(&name, kind, read_body(&file)?);
            spec.trigger = trigger;
            spec.description = description;
            spec.execution_order = order;
            spec.timeout_s = timeout.unwrap_or(sys_config.config.scripts.default_timeout_s);
            spec.environment = env.into_iter().collect();
            spec.working_dir = working_dir;
            spec.run_as_admin = admin;
            spec.continue_on_error = continue_on_error;
            spec.associated_vms = vms;
            spec.tags = tags;
            let script = manager.create_script(spec).await?;
            if out.is_json() {
                return out.json(&script);
            }
            println!("Added script '{}' ({})", script.name, script.kind);
        }
        ScriptCommand::Show { name } => {
            let script = manager.get_script(&name)?;
            if out.is_json() {
                return out.json(&script);
            }
            println!("Script '{}' v{}", script.name, script.version);
            println!("  kind:      {}", script.kind);
            println!("  trigger:   {} (order {})", script.trigger, script.execution_order);
            println!("  timeout:   {}s", script.timeout_s);
            println!("  active:    {}", script.is_active);
            if !script.description.is_empty() {
                println!("  about:     {}", script.description);
            }
            if let Some(last) = &script.last_execution {
                println!(
                    "  last run:  {} {} ({} ms)",
                    util::format_timestamp(last.timestamp),
                    last.status,
                    last.duration_ms
                );
            }
            println!("---");
            println!("{}", script.body);
        }
        ScriptCommand::Update {
            name,
            file,
            trigger,
            description,
            order,
            timeout,
            env,
            working_dir,
            admin,
            continue_on_error,
            active,
            tags,
        } => {
            let update = ScriptUpdate {
                description,
                body: file.as_deref().map(read_body).transpose()?,
                trigger,
                execution_order: order,
                timeout_s: timeout,
                environment: non_empty(env).map(|e| e.into_iter().collect()),
                working_dir: working_dir.map(|d| Some(d).filter(|d| !d.is_empty())),
                run_as_admin: admin,
                continue_on_error,
                tags: non_empty(tags),
                is_active: active,
            };
            let script = manager.update_script(&name, update).await?;
            if out.is_json() {
                return out.json(&script);
            }
            println!("Updated script '{}' (v{})", script.name, script.version);
        }
        ScriptCommand::Delete { name } => {
            let detached_from = manager.delete_script(&name).await?;
            if out.is_json() {
                return out.json(&ScriptDeleteJson {
                    name,
                    detached_from,
                });
            }
            println!("Deleted script '{name}' (detached from {detached_from} VMs)");
        }
        ScriptCommand::Associate { name, add, remove } => {
            if add.is_empty() && remove.is_empty() {
                return Err(VmError::Validation {
                    message: "pass --add or --remove".into(),
                });
            }
            let script = manager.associate_script(&name, &add, &remove).await?;
            if out.is_json() {
                return out.json(&script);
            }
            println!(
                "Script '{}' is associated with {} VMs",
                script.name,
                script.associated_vms.len()
            );
        }
        ScriptCommand::Run { name, vm, env } => {
            let spinner = out.spinner("script", format!("running {name}"));
            let record = match manager
                .run_script(&name, vm.as_deref(), &env, TriggerSource::User)
                .await
            {
                Ok(record) => {
                    spinner.succeed(format!("{name}: {}", record.status));
                    record
                }
                Err(e) => {
                    spinner.fail(format!("could not run {name}"));
                    return Err(e);
                }
            };
            if out.is_json() {
                return out.json(&record);
            }
            if !record.output.is_empty() {
                println!("{}", record.output);
            }
            if let Some(error) = &record.error {
                eprintln!("{error}");
            }
            if !out.interactive {
                println!("{}: {} ({} ms)", name, record.status, record.duration_ms);
            }
        }
        ScriptCommand::History { name, page, limit } => {
            let records = manager.script_history(&name, page, limit)?;
            if out.is_json() {
                return out.json(&records);
            }
            if records.is_empty() {
                println!("No executions.");
            }
            for r in &records {
                println!(
                    "{}  {:<8} {:>6} ms  {}",
                    util::format_timestamp(r.timestamp),
                    r.status,
                    r.duration_ms,
                    r.vm_id.as_deref().unwrap_or("-")
                );
            }
        }
        ScriptCommand::Stats { name } => {
            let stats = manager.script_stats(&name)?;
            if out.is_json() {
                return out.json(&stats);
            }
            println!("executions:   {}", stats.total_executions);
            println!("successful:   {}", stats.successful);
            println!("failed:       {}", stats.failed);
            println!("timed out:    {}", stats.timed_out);
            println!("avg duration: {} ms", stats.average_duration_ms);
            println!("success rate: {}%", stats.success_rate);
        }
    }
    Ok(())
}

fn report_vm(out: &Output, vm: VirtualMachine) -> Result<(), VmError> {
    if out.is_json() {
        return out.json(&vm);
    }
    println!("VM '{}' is {}", vm.name, vm.status);
    Ok(())
}

/// Note the page position when a listing does not fit on one page.
fn print_page_footer(total: usize, pages: PageArgs) {
    let count = util::page_count(total, pages.limit);
    if count > 1 {
        println!("-- page {} of {count} ({total} total)", pages.page.max(1));
    }
}

fn print_vm(vm: &VirtualMachine) {
    println!("VM '{}'", vm.name);
    println!("  status:    {}", vm.status);
    println!("  os:        {}", vm.os_type);
    println!("  memory:    {} MB", vm.memory_mb);
    println!("  cpus:      {}", vm.cpus);
    println!("  disk:      {} GB", vm.disk_size_gb);
    if let Some(uuid) = &vm.uuid {
        println!("  uuid:      {uuid}");
    }
    let uptime_s = vm.uptime_ms(util::now_ms()) / 1000;
    if uptime_s > 0 {
        println!("  uptime:    {}h{:02}m", uptime_s / 3600, (uptime_s % 3600) / 60);
    }
    if !vm.description.is_empty() {
        println!("  about:     {}", vm.description);
    }
    println!("  snapshots: {}", vm.snapshots.len());
    println!("  created:   {}", util::format_timestamp(vm.created_at));
}

fn print_script_runs(runs: &[ScriptRun]) {
    for run in runs {
        println!("  script {}: {} ({} ms)", run.script, run.status, run.duration_ms);
    }
}

fn describe_best_effort(outcome: &BestEffort) -> String {
    match outcome {
        BestEffort::Done => "done".to_string(),
        BestEffort::Skipped { reason } => format!("skipped: {reason}"),
    }
}

fn read_body(path: &std::path::Path) -> Result<String, VmError> {
    std::fs::read_to_string(path).map_err(|e| VmError::Io {
        context: format!("reading script body from {}", path.display()),
        source: e,
    })
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn confirm(question: &str) -> Result<bool, VmError> {
    match inquire::Confirm::new(question).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(
            inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted,
        ) => Err(VmError::Cancelled),
        Err(other) => Err(VmError::Validation {
            message: format!("prompt error: {other}"),
        }),
    }
}
