//! # pagetap - Main Entry Point
//!
//! Startup: pre-flight checks → open/load/attach → consumers. Then block until
//! SIGINT or SIGTERM, and tear down: detach, drain, unload, close.

use std::fs::File;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};

use pagetap::channel::{lossy_ring, TraceLog};
use pagetap::cli::Args;
use pagetap::consumer::{EventProcessor, StreamConsumer, TraceLinePrinter};
use pagetap::domain::AttachmentError;
use pagetap::export::JsonLinesWriter;
use pagetap::preflight::{run_preflight_checks, PreflightError};
use pagetap::probes::{
    call_site_probes, fault_probes, AyaBackend, BackendConfig, Orchestrator,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = args.validate() {
        // usage errors exit with 2
        e.exit();
    }

    std::process::exit(match run(args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<PreflightError>().is_some_and(PreflightError::is_privilege) {
        return EXIT_NOPERM;
    }
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("operation not permitted") || msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    run_preflight_checks(args.pid, args.call_site.as_ref())?;

    let mut probes = fault_probes();
    if let Some(site) = &args.call_site {
        probes.extend(call_site_probes(site, args.pid));
    }

    // Fail on an unwritable export path before anything is attached
    let export_file = args
        .export
        .as_ref()
        .map(|path| {
            File::create(path).with_context(|| format!("cannot create {}", path.display()))
        })
        .transpose()?;

    let backend = AyaBackend::new(BackendConfig {
        object: args.ebpf_object_path(),
        target: args.target_spec(),
        offsets: args.kernel_offsets(),
        kernel_log: true,
    });
    let mut orchestrator = Orchestrator::new(backend, probes, args.poll_timeout(), args.grace());

    orchestrator.start().map_err(|e: AttachmentError| {
        let stage = e.stage();
        anyhow::Error::new(e).context(format!("{stage} stage failed"))
    })?;

    // ── Consumers: event ring first so destroy joins it before the writer ──
    let (export_tx, export_rx) = match export_file {
        Some(file) => {
            let (tx, rx) = lossy_ring(args.export_buffer);
            (Some(tx), Some((rx, file)))
        }
        None => (None, None),
    };
    orchestrator.spawn_event_consumer(EventProcessor::new(args.quiet, args.dump_pages, export_tx))?;

    if let Some(path) = &args.trace_pipe {
        match TraceLog::open(path) {
            Ok(log) => {
                let consumer =
                    StreamConsumer::new(log, TraceLinePrinter::new(args.quiet), args.poll_timeout());
                orchestrator.adopt(consumer.spawn().context("spawn trace consumer")?)?;
            }
            Err(e) => warn!("trace pipe unavailable: {e}"),
        }
    }

    if let (Some((ring, file)), Some(path)) = (export_rx, &args.export) {
        let writer = JsonLinesWriter::new(file, path.display().to_string());
        let consumer = StreamConsumer::new(ring, writer, args.poll_timeout());
        orchestrator.adopt(consumer.spawn().context("spawn export writer")?)?;
    }

    if !args.quiet {
        println!("pagetap v{}", env!("CARGO_PKG_VERSION"));
        for probe in orchestrator.probes() {
            println!("attached: {} → {}", probe.program, probe.target);
        }
        if let Some(path) = &args.export {
            println!("export: {}", path.display());
        }
    }
    info!("waiting for events, Ctrl+C to stop");

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let exit_reason = tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("wait for Ctrl+C")?;
            "interrupted"
        }
        _ = sigterm.recv() => "terminated",
    };

    let reports = tokio::task::block_in_place(|| orchestrator.destroy());

    eprintln!("\n{exit_reason}");
    for report in &reports {
        if let Some(summary) = &report.summary {
            eprintln!("{summary}");
        }
        if let Some(error) = &report.error {
            eprintln!("{} consumer failed: {error}", report.source);
        }
    }
    if let Some(stats) = orchestrator.backend().stats() {
        eprintln!("{stats}");
    }

    Ok(())
}
