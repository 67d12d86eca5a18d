use retainer::rc::{self, Retained};
use retainer::{ClassDescriptor, ClassId, RuntimeConfig};
use std::thread;
use std::time::Instant;

const USAGE: &str = "Usage: retainer <COMMAND> [OPTIONS]\n\n\
Commands:\n  \
  stress          Hammer shared objects from several threads and print stats\n  \
  config          Print the default retainer.toml\n\n\
Stress options:\n  \
  --threads N     Worker threads (default: 4)\n  \
  --iterations N  Iterations per thread (default: 100000)\n  \
  --raw           Use raw headers so every count goes through the side table\n  \
  --json          Print stats as JSON";

#[derive(Debug, Clone)]
struct StressConfig {
    threads: usize,
    iterations: usize,
    raw: bool,
    json: bool,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 100_000,
            raw: false,
            json: false,
        }
    }
}

enum Command {
    Stress(StressConfig),
    Config,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.get(1) else {
        return Err(USAGE.to_string());
    };

    match command.as_str() {
        "config" => Ok(Command::Config),
        "stress" => {
            let mut config = StressConfig::default();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--raw" => config.raw = true,
                    "--json" => config.json = true,
                    flag @ ("--threads" | "--iterations") => {
                        i += 1;
                        let value: usize = args
                            .get(i)
                            .ok_or_else(|| format!("{} requires an argument", flag))?
                            .parse()
                            .map_err(|_| format!("Invalid value for {}", flag))?;
                        if value == 0 {
                            return Err(format!("{} must be at least 1", flag));
                        }
                        if flag == "--threads" {
                            config.threads = value;
                        } else {
                            config.iterations = value;
                        }
                    }
                    arg => return Err(format!("Unknown option: {}\n\n{}", arg, USAGE)),
                }
                i += 1;
            }
            Ok(Command::Stress(config))
        }
        "-h" | "--help" | "help" => Err(USAGE.to_string()),
        other => Err(format!("Unknown command: {}\n\n{}", other, USAGE)),
    }
}

fn register_class(raw: bool) -> Result<ClassId, String> {
    let desc = ClassDescriptor::new("StressObject", 32);
    let desc = if raw { desc.requiring_raw_header() } else { desc };
    desc.register().map_err(|e| e.to_string())
}

fn run_stress(config: &StressConfig) -> Result<(), String> {
    let class = register_class(config.raw)?;
    let shared = Retained::alloc(class).map_err(|e| e.to_string())?;
    let weak = shared.downgrade();
    let start = Instant::now();

    thread::scope(|scope| {
        for _ in 0..config.threads {
            scope.spawn(|| {
                for i in 0..config.iterations {
                    let copy = shared.clone();
                    if let Some(upgraded) = weak.upgrade() {
                        debug_assert_eq!(upgraded, copy);
                    }
                    drop(copy);

                    // Short-lived objects exercise both teardown paths
                    if i % 64 == 0 {
                        if let Ok(local) = Retained::alloc(class) {
                            let local_weak = local.downgrade();
                            drop(local);
                            debug_assert!(local_weak.upgrade().is_none());
                        }
                    }
                }
            });
        }
    });

    let elapsed = start.elapsed();
    let final_count = unsafe { rc::retain_count(shared.as_obj()) };
    drop(shared);
    let stats = retainer::stats::snapshot();

    if config.json {
        let report = serde_json::json!({
            "threads": config.threads,
            "iterations": config.iterations,
            "raw_headers": config.raw,
            "elapsed_ms": elapsed.as_millis() as u64,
            "final_count": final_count,
            "weak_cleared": weak.is_null(),
            "stats": stats,
        });
        let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        println!(
            "{} threads x {} iterations in {:.2?} ({} headers)",
            config.threads,
            config.iterations,
            elapsed,
            if config.raw { "raw" } else { "inline" }
        );
        println!("  final count before drop: {}", final_count);
        println!("  objects allocated:       {}", stats.objects_allocated);
        println!("  objects freed:           {}", stats.objects_freed);
        println!("  fast / slow frees:       {} / {}", stats.fast_frees, stats.slow_frees);
        println!("  overflow spills:         {}", stats.overflow_spills);
        println!("  underflow borrows:       {}", stats.underflow_borrows);
        println!("  weak slots cleared:      {}", stats.weak_slots_cleared);
        println!("  live objects:            {}", stats.live_objects());
    }

    if final_count != 1 || !weak.is_null() {
        return Err(format!(
            "lifetime mismatch: final count {}, weak cleared {}",
            final_count,
            weak.is_null()
        ));
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    let result = match command {
        Command::Config => {
            print!("{}", RuntimeConfig::generate_default());
            Ok(())
        }
        Command::Stress(config) => {
            retainer::init();
            let result = run_stress(&config);
            retainer::cleanup();
            result
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
