//! # clrscope - Main Entry Point
//!
//! Subcommands:
//! - **runtimes**: installed runtimes, or those loaded in a process
//! - **version**: runtime version a managed executable targets
//! - **attach**: negotiate an attach and ask the target to load the sink
//! - **replay**: drive a recorded trace through an in-process sink

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clrscope::attach::{AttachNegotiator, AttachRequest, PresenceCheck};
use clrscope::cli::{Args, Command, TargetArgs};
use clrscope::domain::{Pid, ProcessTarget};
use clrscope::logging::{FileLogger, LogFacade, Logger};
use clrscope::preflight::run_preflight_checks;
use clrscope::process_lookup::{ProcessLocator, ProcfsLocator};
use clrscope::replay::{replay, TraceFile};
use clrscope::runtime::local::LocalHost;
use clrscope::runtime::RuntimeHost;
use clrscope::sink::stats::display_statistics;
use clrscope::sink::SinkConfig;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied")
        || msg.contains("access denied")
        || msg.contains("0x80070005")
    {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") || msg.contains("must be") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn target_from(args: &TargetArgs) -> Option<ProcessTarget> {
    match (&args.process, args.pid) {
        (Some(name), _) => Some(ProcessTarget::Name(name.clone())),
        (None, Some(pid)) => Some(ProcessTarget::Pid(Pid(pid))),
        (None, None) => None,
    }
}

fn local_host(root: Option<PathBuf>) -> LocalHost {
    root.map_or_else(LocalHost::discover, LocalHost::with_root)
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    match args.command {
        Command::Runtimes { target, root } => {
            list_runtimes(target_from(&target), &local_host(root))
        }
        Command::Version { file } => {
            let version = local_host(None).version_from_file(&file)?;
            println!("{version}");
            Ok(())
        }
        Command::Attach {
            target,
            runtime,
            path,
            component,
            timeout,
            presence,
            client_data,
            root,
        } => {
            let target = target_from(&target).context(
                "Missing required argument: PROCESS or --pid\n\n\
                 Usage:\n  \
                 clrscope attach my-app --runtime V --path FILE\n  \
                 clrscope attach --pid 1234 --runtime V --path FILE",
            )?;
            let mut builder = AttachRequest::builder()
                .target(target)
                .runtime_version(runtime)
                .code_path(path)
                .timeout(Duration::from_millis(timeout))
                .presence(presence)
                .client_data(client_data.unwrap_or_default());
            if let Some(component) = component {
                builder = builder.component_str(&component)?;
            }
            attach(&builder.build()?, &local_host(root), quiet)
        }
        Command::Replay { trace, strict, log_file } => {
            replay_trace(&trace, strict, log_file, quiet)
        }
    }
}

fn list_runtimes(target: Option<ProcessTarget>, host: &LocalHost) -> Result<()> {
    let runtimes = match target {
        Some(target) => {
            let process = ProcfsLocator.locate(&target)?;
            println!("process {} ({})", process.pid(), process.command().unwrap_or("?"));
            host.loaded_runtimes(&process)?
        }
        None => host.installed_runtimes()?,
    };

    if runtimes.is_empty() {
        eprintln!("no runtimes found under {}", host.root().display());
    }
    for runtime in &runtimes {
        let loadable = match runtime.info().is_loadable() {
            Ok(true) => "loadable",
            Ok(false) => "not loadable",
            Err(_) => "unknown",
        };
        println!("{}\t{loadable}", runtime.version());
    }
    Ok(())
}

fn attach(request: &AttachRequest, host: &LocalHost, quiet: bool) -> Result<()> {
    let locator = ProcfsLocator;
    let process = locator.locate(request.target())?;
    run_preflight_checks(request.code_path(), process.pid(), quiet)?;
    drop(process);

    if !quiet {
        println!("clrscope v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {}", request.target());
        println!("runtime: {}", request.runtime_version());
        if request.presence() == PresenceCheck::Skip {
            println!("presence check: skipped");
        }
    }

    let attached = AttachNegotiator::new(&locator, host).attach(request)?;
    if !quiet {
        println!("attached: {} ({})", attached.pid, attached.runtime);
    }
    Ok(())
}

fn replay_trace(
    path: &std::path::Path,
    strict: bool,
    log_file: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let trace = TraceFile::load(path)
        .with_context(|| format!("Failed to load trace {}", path.display()))?;

    // Flags add to what the environment configures
    let mut config = SinkConfig::from_env();
    config.strict_sequencing |= strict;
    if log_file.is_some() {
        config.log_file = log_file;
    }

    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(file) => Arc::new(
            FileLogger::create(file)
                .with_context(|| format!("Failed to open log file {}", file.display()))?,
        ),
        None => Arc::new(LogFacade),
    };

    let result = replay(trace, config, Arc::clone(&logger));
    logger.shutdown();
    let report = result?;

    info!("Replayed {} events against runtime {}", report.events, report.runtime);
    display_statistics(&report.stats);

    if !quiet {
        println!("events: {}", report.events);
        println!("names resolved: {}", report.names_cached);
        for failure in &report.failures {
            println!("rejected #{} {}: {}", failure.index, failure.kind, failure.error);
        }
        for pair in &report.outstanding {
            println!("unfinished: {pair}");
        }
        for (name, count) in &report.analysis.exceptions {
            println!("thrown: {count} {name}");
        }
        for (name, count) in &report.analysis.allocations {
            println!("allocated: {count} {name}");
        }
        let pauses = report.analysis.pauses;
        if pauses.count > 0 {
            println!(
                "runtime pauses: {} ({}ms total, {}ms longest)",
                pauses.count,
                pauses.total.as_millis(),
                pauses.longest.as_millis()
            );
        }
        if report.detached {
            println!("detached after attach");
        }
    }

    if report.failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} events were rejected", report.failures.len())
    }
}
