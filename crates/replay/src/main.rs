//! Trace review and replay tool.
//!
//! Reads a recorded event trace (see `conclave-eventlog`), filters it by
//! node, event type, and step message type, and prints the surviving
//! records. With `--interactive` the events are also applied to live state
//! machines, one per node in the trace, which reproduces the exact decisions
//! the recorded nodes made; `--status-index` prints a machine's status
//! snapshot after the event at that index.

use anyhow::{bail, Context, Result};
use clap::Parser;
use conclave_core::Event;
use conclave_eventlog::{Reader, RecordedEvent};
use conclave_statemachine::{MachineConfig, StateMachine};
use conclave_types::{Msg, NodeId};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "conclave-replay",
    about = "Review and replay recorded consensus event traces"
)]
struct Args {
    /// Trace file to read; "-" or absent reads standard input.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Apply events to live state machines while scanning.
    #[arg(long)]
    interactive: bool,

    /// Only include events recorded by these nodes (repeatable).
    #[arg(long = "node-id")]
    node_ids: Vec<u64>,

    /// Only include these event types (repeatable).
    #[arg(long = "event-type", conflicts_with = "not_event_types")]
    event_types: Vec<String>,

    /// Exclude these event types (repeatable).
    #[arg(long = "not-event-type")]
    not_event_types: Vec<String>,

    /// Only include steps carrying these message types (repeatable).
    #[arg(long = "step-type", conflicts_with = "not_step_types")]
    step_types: Vec<String>,

    /// Exclude steps carrying these message types (repeatable).
    #[arg(long = "not-step-type")]
    not_step_types: Vec<String>,

    /// Print the applying machine's status after this record index
    /// (repeatable, requires --interactive).
    #[arg(long = "status-index", requires = "interactive")]
    status_indices: Vec<u64>,

    /// Print full record contents instead of one-line summaries.
    #[arg(long)]
    verbose_text: bool,
}

/// Include/exclude filtering; at most one of the two lists is non-empty.
fn excluded_by_type(value: &str, include: &[String], exclude: &[String]) -> bool {
    if !include.is_empty() {
        return !include.iter().any(|name| name == value);
    }
    exclude.iter().any(|name| name == value)
}

fn excluded_by_node(record: &RecordedEvent, node_ids: &[u64]) -> bool {
    !node_ids.is_empty() && !node_ids.contains(&record.node_id.0)
}

fn validate_names(given: &[String], allowed: &[&str], what: &str) -> Result<()> {
    for name in given {
        if !allowed.contains(&name.as_str()) {
            bail!(
                "unknown {} {:?}; expected one of: {}",
                what,
                name,
                allowed.join(", ")
            );
        }
    }
    Ok(())
}

fn open_input(path: &Option<PathBuf>) -> Result<Box<dyn Read>> {
    match path {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::open(path)
                .with_context(|| format!("opening trace {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(std::io::stdin().lock())),
    }
}

fn summarize(record: &RecordedEvent) -> String {
    match &record.event {
        Event::Step { source, msg } => {
            format!("Step from {} [{}]", source, msg.type_name())
        }
        other => other.type_name().to_string(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    validate_names(&args.event_types, Event::ALL_TYPE_NAMES, "event type")?;
    validate_names(&args.not_event_types, Event::ALL_TYPE_NAMES, "event type")?;
    validate_names(&args.step_types, Msg::ALL_TYPE_NAMES, "step type")?;
    validate_names(&args.not_step_types, Msg::ALL_TYPE_NAMES, "step type")?;

    let mut reader = Reader::new(open_input(&args.input)?);
    let mut machines: BTreeMap<u64, StateMachine> = BTreeMap::new();
    let mut index: u64 = 0;

    while let Some(record) = reader
        .next_record()
        .with_context(|| format!("reading record {}", index))?
    {
        let mut excluded = excluded_by_node(&record, &args.node_ids)
            || excluded_by_type(
                record.event.type_name(),
                &args.event_types,
                &args.not_event_types,
            );
        if let Event::Step { msg, .. } = &record.event {
            excluded = excluded
                || excluded_by_type(msg.type_name(), &args.step_types, &args.not_step_types);
        }

        if !excluded {
            if args.verbose_text {
                println!("{:>8} node {} {:#?}", index, record.node_id.0, record.event);
            } else {
                println!("{:>8} node {} {}", index, record.node_id.0, summarize(&record));
            }

            if args.interactive {
                let node = record.node_id.0;
                let machine = machines
                    .entry(node)
                    .or_insert_with(|| StateMachine::new(NodeId(node), MachineConfig::default()));
                machine
                    .apply(record.event)
                    .with_context(|| format!("applying record {} to node {}", index, node))?;
                if args.status_indices.contains(&index) {
                    println!("{:#?}", machine.status());
                }
            }
        }

        index += 1;
    }

    Ok(())
}
