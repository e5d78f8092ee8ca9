use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::select;
use tokio::signal;
use tokio::sync::mpsc;

use grainflow::{
    Aggregate, BreakpointSpec, CmpOp, Engine, FieldType, FieldValue, JobEvent, JobId, JobPhase,
    OperatorId, OperatorKind, SourceSpec, TableId, Tuple, Workflow,
};

static RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^run\s+(\w+);*$").unwrap());
static SUBMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^submit\s+(\w+);*$").unwrap());
static START_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^start\s+([\da-fA-F-]+);*$").unwrap());
static JOBS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:show\s+)?jobs;*$").unwrap());
static PAUSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^pause\s+([\da-fA-F-]+);*$").unwrap());
static RESUME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^resume\s+([\da-fA-F-]+);*$").unwrap());
static KILL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^kill(?:\s+job)?\s+([\da-fA-F-]+);*$").unwrap());
static BREAK_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^break\s+([\da-fA-F-]+)\s+op(\d+)\s+count\s+(\d+);*$").unwrap());
static BREAK_MATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^break\s+([\da-fA-F-]+)\s+op(\d+)\s+match\s+(\d+)\s+(\S+);*$").unwrap()
});

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let mut rl = DefaultEditor::new()?;
    let mut engine = Engine::default();
    let mut last_job: Option<String> = None;

    println!("grainflow shell, 'help' lists commands");
    loop {
        match read_command(&mut rl) {
            Ok(line) => {
                let line = line.trim().to_string();
                if matches!(line.as_str(), "exit" | "exit;" | "quit" | "quit;") {
                    println!("Bye.");
                    break;
                }
                if let Err(err) = dispatch(&mut engine, &mut last_job, &line).await {
                    println!("{err}");
                }
            }
            Err(ReadlineError::Interrupted) => {
                if let Some(job) = last_job.take() {
                    println!("Interrupted");
                    let _ = engine.kill(&job).await;
                }
            }
            Err(ReadlineError::Eof) => {
                println!("Exited");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    engine.shutdown().await;
    Ok(())
}

/// Read lines from STDIN until one holds a command.
fn read_command(rl: &mut DefaultEditor) -> Result<String, ReadlineError> {
    loop {
        let line = rl.readline("> ")?;
        if line.trim().is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line.as_str());
        return Ok(line);
    }
}

async fn dispatch(engine: &mut Engine, last_job: &mut Option<String>, line: &str) -> Result<()> {
    if line == "help" {
        print_help();
    } else if line == "demos" {
        print_demos();
    } else if JOBS_RE.is_match(line) {
        let listing = engine.jobs();
        if listing.is_empty() {
            println!("(no jobs)");
        } else {
            println!("{}", render_jobs(&listing));
        }
    } else if let Some(cap) = RUN_RE.captures(line) {
        run_demo(engine, last_job, &cap[1]).await?;
    } else if let Some(cap) = SUBMIT_RE.captures(line) {
        let id = engine.submit(demo(&cap[1])?)?;
        let job = id.to_string();
        println!("submitted {id}, start it with 'start {}'", short(&job));
        *last_job = Some(job);
    } else if let Some(cap) = START_RE.captures(line) {
        let events = engine.take_events(&cap[1])?;
        let results = engine.take_results(&cap[1])?;
        let id = engine.start(&cap[1]).await?;
        *last_job = Some(id.to_string());
        watch_in_background(id, events, results);
    } else if let Some(cap) = PAUSE_RE.captures(line) {
        let id = engine.pause(&cap[1])?;
        println!("pause requested for {id}");
    } else if let Some(cap) = RESUME_RE.captures(line) {
        let id = engine.resume(&cap[1])?;
        println!("resume requested for {id}");
    } else if let Some(cap) = KILL_RE.captures(line) {
        let id = engine.kill(&cap[1]).await?;
        if last_job.as_deref() == Some(id.to_string().as_str()) {
            *last_job = None;
        }
        println!("killed {id}");
    } else if let Some(cap) = BREAK_COUNT_RE.captures(line) {
        let operator = OperatorId(cap[2].parse()?);
        let target: u64 = cap[3].parse()?;
        let bp = engine
            .add_breakpoint(&cap[1], operator, BreakpointSpec::Count { target })
            .await?;
        println!("{bp} armed on {operator}");
    } else if let Some(cap) = BREAK_MATCH_RE.captures(line) {
        let operator = OperatorId(cap[2].parse()?);
        let spec = BreakpointSpec::Conditional {
            field: cap[3].parse()?,
            keyword: cap[4].to_string(),
        };
        let bp = engine.add_breakpoint(&cap[1], operator, spec).await?;
        println!("{bp} armed on {operator}");
    } else {
        anyhow::bail!("unrecognized command, 'help' lists commands");
    }
    Ok(())
}

/// Submit, start and follow a demo in the foreground. Ctrl-c kills the job
/// instead of the shell.
async fn run_demo(engine: &mut Engine, last_job: &mut Option<String>, name: &str) -> Result<()> {
    let id = engine.submit(demo(name)?)?;
    let job = id.to_string();
    let events = engine.take_events(&job)?;
    let results = engine.take_results(&job)?;
    engine.start(&job).await?;
    *last_job = Some(job.clone());

    select! {
        _ = signal::ctrl_c() => {
            println!("Kill job {id}.");
            engine.kill(&job).await?;
            *last_job = None;
        }
        rows = watch(short(&job).to_string(), events, results) => {
            println!("({rows} rows)");
        }
    }
    Ok(())
}

fn watch_in_background(
    id: JobId,
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    results: Option<mpsc::UnboundedReceiver<Tuple>>,
) {
    if events.is_none() && results.is_none() {
        println!("{id} is already being watched");
        return;
    }
    println!("started {id}");
    tokio::spawn(async move {
        let label = short(&id.to_string()).to_string();
        let rows = watch(label.clone(), events, results).await;
        println!("[{label}] done, {rows} row(s)");
    });
}

/// Print events and result tuples as they arrive, until the job tears its
/// channels down. Returns how many result rows were seen.
async fn watch(
    label: String,
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    results: Option<mpsc::UnboundedReceiver<Tuple>>,
) -> usize {
    let (mut events, mut results) = match (events, results) {
        (Some(events), Some(results)) => (events, results),
        _ => return 0,
    };
    let mut rows = 0;
    let mut events_open = true;
    let mut results_open = true;
    while events_open || results_open {
        select! {
            event = events.recv(), if events_open => match event {
                Some(event) => print_event(&label, &event),
                None => events_open = false,
            },
            tuple = results.recv(), if results_open => match tuple {
                Some(tuple) => {
                    rows += 1;
                    println!("[{label}] {}", tuple.to_line());
                }
                None => results_open = false,
            },
        }
    }
    rows
}

fn print_event(label: &str, event: &JobEvent) {
    match event {
        JobEvent::Paused => println!("[{label}] paused"),
        JobEvent::Resumed => println!("[{label}] resumed"),
        JobEvent::Completed => println!("[{label}] completed"),
        JobEvent::Failed {
            operator,
            worker,
            reason,
        } => println!("[{label}] failed in {operator} at {worker}: {reason}"),
        JobEvent::Breakpoint {
            operator,
            id,
            report,
        } => println!("[{label}] {id} tripped on {operator}: {report}"),
        JobEvent::Deactivated => println!("[{label}] deactivated"),
    }
}

fn short(job: &str) -> &str {
    &job[..job.len().min(8)]
}

fn render_jobs(listing: &[(JobId, JobPhase)]) -> String {
    use prettytable::{format, Table};
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(["job", "phase"].iter().map(|s| s.to_string()).collect());
    for (id, phase) in listing {
        table.add_row([id.to_string(), phase.to_string()].into_iter().collect());
    }
    table.to_string()
}

const DEMOS: &[(&str, &str)] = &[
    ("group", "100 keyed rows grouped and counted, 10 groups of 10"),
    ("stream", "400 paced rows, keyword match on cat7, counted"),
    ("join", "users joined to orders on user id"),
    ("spill", "64 generated rows filtered and spilled to partition files"),
];

fn demo(name: &str) -> Result<Workflow> {
    let mut workflow = Workflow::new();
    match name {
        "group" => {
            let rows = (0..100)
                .map(|i| vec![(i % 10).to_string(), format!("item{i}")])
                .collect();
            let scan = workflow.add_with_parallelism(
                OperatorKind::Scan {
                    table: TableId(1),
                    types: vec![FieldType::Int, FieldType::String],
                    source: SourceSpec::Values(rows),
                },
                Some(3),
            );
            let group = workflow.add(OperatorKind::GroupBy {
                keys: vec![0],
                agg: Aggregate::Count,
            });
            workflow.connect(scan, group);
        }
        "stream" => {
            let scan = workflow.add(OperatorKind::Scan {
                table: TableId(1),
                types: vec![FieldType::Int, FieldType::String, FieldType::Int],
                source: SourceSpec::Generate {
                    count: 400,
                    pace: Some(Duration::from_millis(2)),
                },
            });
            let search = workflow.add(OperatorKind::KeywordSearch {
                field: 1,
                keyword: "cat7".into(),
            });
            let count = workflow.add(OperatorKind::Count);
            workflow.connect(scan, search);
            workflow.connect(search, count);
        }
        "join" => {
            let users = vec![
                vec!["1".into(), "ada".into()],
                vec!["2".into(), "grace".into()],
                vec!["3".into(), "alan".into()],
                vec!["4".into(), "edsger".into()],
            ];
            let orders = (0..20)
                .map(|i| vec![format!("{}", 100 + i), format!("{}", i % 5)])
                .collect();
            let user_scan = workflow.add(OperatorKind::Scan {
                table: TableId(1),
                types: vec![FieldType::Int, FieldType::String],
                source: SourceSpec::Values(users),
            });
            let order_scan = workflow.add(OperatorKind::Scan {
                table: TableId(2),
                types: vec![FieldType::Int, FieldType::Int],
                source: SourceSpec::Values(orders),
            });
            let join = workflow.add(OperatorKind::HashJoin {
                build_table: TableId(1),
                build_field: 0,
                probe_field: 1,
            });
            workflow.connect(user_scan, join);
            workflow.connect(order_scan, join);
        }
        "spill" => {
            let scan = workflow.add(OperatorKind::Scan {
                table: TableId(1),
                types: vec![FieldType::Int, FieldType::String, FieldType::Int],
                source: SourceSpec::Generate {
                    count: 64,
                    pace: None,
                },
            });
            let filter = workflow.add(OperatorKind::Filter {
                field: 2,
                op: CmpOp::Ge,
                value: FieldValue::Int(50),
            });
            let spill = workflow.add(OperatorKind::Materialize {
                partitions: 2,
                key: Some(0),
            });
            workflow.connect(scan, filter);
            workflow.connect(filter, spill);
        }
        other => anyhow::bail!("unknown demo '{other}', 'demos' lists them"),
    }
    Ok(workflow)
}

fn print_demos() {
    for (name, blurb) in DEMOS {
        println!("  {name:<8} {blurb}");
    }
}

fn print_help() {
    println!("  run <demo>                        submit and follow a demo, ctrl-c kills it");
    println!("  submit <demo>                     submit without starting");
    println!("  start <job>                       start a submitted job in the background");
    println!("  jobs                              list jobs and phases");
    println!("  pause <job> / resume <job>        control a running job");
    println!("  kill <job>                        tear a job down");
    println!("  break <job> op<N> count <n>       pause after n tuples through operator N");
    println!("  break <job> op<N> match <f> <kw>  pause when field f contains kw");
    println!("  demos                             list demo workflows");
    println!("  exit                              leave the shell");
    println!("jobs accept any unique id prefix");
}
