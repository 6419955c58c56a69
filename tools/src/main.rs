//! recon-runner: headless runner for the reconciliation engine.
//!
//! Usage:
//!   recon-runner --db recon.db                 # run the job once
//!   recon-runner --db recon.db --schedule      # run on the schedule
//!   recon-runner --db recon.db --delay-secs 5 --interval-secs 60 --batch-size 500

use anyhow::Result;
use recon_core::{config::JobConfig, runner::JobRunner, scheduler::Scheduler, store::DocStore};
use std::env;
use std::io::BufRead;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = args
        .windows(2)
        .find(|w| w[0] == "--db")
        .map(|w| w[1].as_str())
        .unwrap_or("recon.db");
    let schedule = args.iter().any(|a| a == "--schedule");

    let mut config = JobConfig::from_env();
    if let Some(secs) = parse_arg(&args, "--delay-secs") {
        config.first_run_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_arg(&args, "--interval-secs") {
        config.repeat_interval = Duration::from_secs(secs);
    }
    if let Some(size) = parse_arg(&args, "--batch-size") {
        config.formula_batch_size = size as usize;
    }

    println!("recon-runner");
    println!("  db:         {db}");
    println!("  batch size: {}", config.effective_batch_size());

    let store = DocStore::open(db)?;
    store.migrate()?;

    if !schedule {
        let mut runner = JobRunner::new(&store, config);
        let summary = runner.run()?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        println!("  duration: {:.2?}", summary.duration);
        return Ok(());
    }

    println!(
        "  schedule:   first run in {:?}, then every {:?}",
        config.first_run_delay, config.repeat_interval
    );
    println!("type 'quit' to stop");

    let scheduler = Scheduler::start(store, config);

    // Block on stdin until asked to stop; the scheduler thread does the
    // actual work.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "quit" | "exit" => break,
            "status" => {
                match scheduler.next_run_time() {
                    Some(t) => println!("next run: {t}"),
                    None => println!("next run: none scheduled"),
                }
                match scheduler.last_run_summary() {
                    Some(summary) => println!("last run: {}", serde_json::to_string(&summary)?),
                    None => println!("last run: none yet"),
                }
                println!("in flight: {}", scheduler.is_running());
            }
            "" => {}
            other => println!("unknown command '{other}' (try 'status' or 'quit')"),
        }
    }

    scheduler.shutdown();
    Ok(())
}

fn parse_arg(args: &[String], name: &str) -> Option<u64> {
    args.windows(2)
        .find(|w| w[0] == name)
        .and_then(|w| w[1].parse::<u64>().ok())
}
