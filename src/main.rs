//! Audit-log introspection entry point.

use anyhow::Context;
use birdwatch::audit::{self, AuditModel, Event, EventPayload};
use birdwatch::vmprofile::VmProfile;
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the event timeline of an audit log
    Events {
        /// Audit log file
        auditlog: PathBuf,
    },
    /// Summarize the traces of an audit log
    Traces {
        /// Audit log file
        auditlog: PathBuf,
    },
    /// Print the reassembled IR of one trace
    Ir {
        /// Audit log file
        auditlog: PathBuf,
        /// Trace number
        traceno: u32,
    },
    /// Print the decoded bytecode log of one trace
    Bc {
        /// Audit log file
        auditlog: PathBuf,
        /// Trace number
        traceno: u32,
    },
    /// Rank the traces of a VM profile by sample count
    Hot {
        /// VM profile file
        profile: PathBuf,
        /// Audit log supplying the profile dimensions
        #[arg(short, long)]
        auditlog: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Events { auditlog } => {
            let model = audit::load_auditlog(&auditlog)
                .with_context(|| format!("load {}", auditlog.display()))?;
            for event in &model.events {
                println!(
                    "{:>14.6} {:<14} {}",
                    event.reltime(&model),
                    event.name,
                    describe(event, &model)
                );
            }
        }
        Command::Traces { auditlog } => {
            let model = audit::load_auditlog(&auditlog)
                .with_context(|| format!("load {}", auditlog.display()))?;
            for trace in model.traces.values() {
                let contour = trace
                    .contour(&model)
                    .iter()
                    .map(|li| format!("{}:{}:{}", li.chunkname, li.chunkline, li.declname))
                    .join(" -> ");
                println!(
                    "{:>5} parent={:<5} start={:<12} bclog={:<5} events={:<3} {}",
                    trace.traceno,
                    trace.parent,
                    trace.start_id(),
                    trace.bclog.len(),
                    trace.events(&model).len(),
                    contour,
                );
            }
        }
        Command::Ir { auditlog, traceno } => {
            let model = audit::load_auditlog(&auditlog)
                .with_context(|| format!("load {}", auditlog.display()))?;
            let trace = model
                .traces
                .get(&traceno)
                .with_context(|| format!("trace {traceno} not found"))?;
            for ins in trace.instructions(&model)? {
                println!("{ins}");
            }
        }
        Command::Bc { auditlog, traceno } => {
            let model = audit::load_auditlog(&auditlog)
                .with_context(|| format!("load {}", auditlog.display()))?;
            let trace = model
                .traces
                .get(&traceno)
                .with_context(|| format!("trace {traceno} not found"))?;
            for (pos, bc) in trace.bytecodes(&model).iter().enumerate() {
                let li = trace
                    .lineinfo(&model, pos)
                    .map(|li| li.to_string())
                    .unwrap_or_default();
                match bc {
                    Some(bc) => println!("{pos:4} {bc}  [{li}]"),
                    None => println!("{pos:4} ?"),
                }
            }
        }
        Command::Hot { profile, auditlog } => {
            let vm = match auditlog {
                Some(log) => {
                    let mut model = audit::load_auditlog(&log)
                        .with_context(|| format!("load {}", log.display()))?;
                    model.add_profile(&profile, None)?;
                    model
                        .profiles
                        .values()
                        .next()
                        .and_then(|series| series.last())
                        .map(|snapshot| snapshot.profile.clone())
                        .context("profile not attached")?
                }
                None => VmProfile::load(&profile)
                    .with_context(|| format!("load {}", profile.display()))?,
            };
            for hot in vm.hot_traces() {
                let traceno = hot
                    .traceno
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "none".to_string());
                println!("{traceno:>8} {:>12}", hot.total);
            }
            println!("total samples: {}", vm.total_samples());
        }
    }
    Ok(())
}

fn describe(event: &Event, model: &AuditModel) -> String {
    match event.payload {
        EventPayload::NewPrototype { address } => model
            .prototypes
            .get(&address)
            .map(|p| format!("{}:{} {}", p.chunkname, p.firstline, p.declname))
            .unwrap_or_else(|| format!("0x{address:x}")),
        EventPayload::NewCtype { id } => {
            let desc = model.ctypes.get(&id).map(String::as_str).unwrap_or("?");
            format!("#{id} {desc}")
        }
        EventPayload::TraceStop { traceno } => format!("trace {traceno}"),
        EventPayload::TraceAbort { abort } => {
            let abort = &model.aborts[abort];
            format!("{} at {}", abort.error, abort.start_id())
        }
        EventPayload::Lex | EventPayload::Other => String::new(),
    }
}
