use std::{
    env, fs,
    io::{self, Write},
    path::PathBuf,
    process,
    thread::available_parallelism,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{
    crate_authors, crate_description, value_parser, Arg, ArgAction, ArgMatches, Command,
};
use log::{error, info, warn};

#[cfg(target_env = "musl")]
use mimalloc::MiMalloc;

use workq::{
    config::DEFAULT_PORT, distributed::worker::Worker, queue::scheduler::ScheduleAlgorithm,
    Queue, QueueConfig, Task, TaskState, CRATE_NAME, CRATE_VERSION,
};

// Use mimalloc when building against musl, since its allocator is slow
#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    let matches = build_cli().get_matches();

    if let Err(e) = simple_logger::init_with_level(match matches.get_count("v") {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    }) {
        eprintln!("Could not set up logging: {e}");
    }

    info!("{} version {}", CRATE_NAME, CRATE_VERSION);

    let outcome = match matches.subcommand() {
        Some(("worker", worker_matches)) => start_worker(worker_matches),
        Some(("run", run_matches)) => run_commands(run_matches),
        _ => unreachable!(),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

fn build_cli() -> Command {
    let default_capacity = available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .to_string();

    Command::new(CRATE_NAME)
        .about(crate_description!())
        .version(CRATE_VERSION)
        .author(crate_authors!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("v")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            Command::new("worker")
                .about("Connects to a queue and executes its tasks")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .help("Host name or IP address of the queue")
                        .value_name("HOST")
                        .default_value("localhost"),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .help("Port of the queue")
                        .value_name("PORT")
                        .default_value(DEFAULT_PORT.to_string())
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("capacity")
                        .long("capacity")
                        .help("Number of tasks to run concurrently")
                        .value_name("INT")
                        .default_value(default_capacity)
                        .value_parser(value_parser!(u32).range(1..)),
                )
                .arg(
                    Arg::new("workdir")
                        .long("workdir")
                        .help("Directory for task sandboxes and cached files. Defaults to a new directory in the system's temp dir.")
                        .value_name("DIR")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Executes the commands of a file, one per line, on connected workers")
                .arg(
                    Arg::new("commands")
                        .required(true)
                        .help("File with one shell command per line. Empty lines and lines starting with '#' are skipped.")
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .help("Port to listen on for workers")
                        .value_name("PORT")
                        .default_value(DEFAULT_PORT.to_string())
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("retries")
                        .long("retries")
                        .help("How often a task is retried after a lost worker or a failed transfer")
                        .value_name("INT")
                        .default_value("3")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("liveness")
                        .long("liveness")
                        .help("Seconds of silence after which a worker is considered lost")
                        .value_name("SECONDS")
                        .default_value("30")
                        .value_parser(value_parser!(u64).range(1..)),
                )
                .arg(
                    Arg::new("algorithm")
                        .long("algorithm")
                        .help("How workers are chosen for tasks")
                        .value_name("ALGORITHM")
                        .default_value("files")
                        .value_parser(["files", "fcfs", "time", "random"]),
                )
                .arg(
                    Arg::new("fast_abort")
                        .long("fast-abort")
                        .help("Drop workers whose task runs longer than this multiple of the average execution time")
                        .value_name("MULTIPLIER")
                        .value_parser(value_parser!(f64)),
                ),
        )
}

fn start_worker(matches: &ArgMatches) -> anyhow::Result<bool> {
    let host = matches
        .get_one::<String>("host")
        .context("host is required")?;
    let port = *matches.get_one::<u16>("port").context("port is required")?;
    let capacity = *matches
        .get_one::<u32>("capacity")
        .context("capacity is required")?;
    let workdir = matches
        .get_one::<PathBuf>("workdir")
        .cloned()
        .unwrap_or_else(|| env::temp_dir().join(format!("{}-worker-{}", CRATE_NAME, process::id())));

    let mut worker = Worker::connect(host, port, capacity, &workdir)
        .with_context(|| format!("could not connect to {host}:{port}"))?;
    worker.run()?;

    if matches.get_one::<PathBuf>("workdir").is_none() {
        if let Err(e) = fs::remove_dir_all(&workdir) {
            warn!("Could not clean up {}: {}", workdir.display(), e);
        }
    }
    Ok(true)
}

/// Returns whether all commands succeeded
fn run_commands(matches: &ArgMatches) -> anyhow::Result<bool> {
    let commands_path = matches
        .get_one::<PathBuf>("commands")
        .context("commands file is required")?;
    let port = *matches.get_one::<u16>("port").context("port is required")?;
    let retries = *matches
        .get_one::<u32>("retries")
        .context("retries is required")?;
    let liveness = *matches
        .get_one::<u64>("liveness")
        .context("liveness is required")?;
    let algorithm = match matches.get_one::<String>("algorithm").map(String::as_str) {
        Some("fcfs") => ScheduleAlgorithm::Fcfs,
        Some("time") => ScheduleAlgorithm::Time,
        Some("random") => ScheduleAlgorithm::Random,
        _ => ScheduleAlgorithm::Files,
    };

    let mut config = QueueConfig::default()
        .with_retry_budget(retries)
        .with_liveness_window(Duration::from_secs(liveness))
        .with_algorithm(algorithm);
    if let Some(&multiplier) = matches.get_one::<f64>("fast_abort") {
        config = config.with_fast_abort(multiplier);
    }

    let commands = fs::read_to_string(commands_path)
        .with_context(|| format!("could not read {}", commands_path.display()))?;
    let commands = commands
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>();
    if commands.is_empty() {
        bail!("{} contains no commands", commands_path.display());
    }

    let queue = Queue::with_config(port, config)?;
    for command in &commands {
        queue.submit(Task::new(*command))?;
    }
    info!(
        "Submitted {} task(s), waiting for workers on port {}",
        commands.len(),
        queue.port()
    );

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut all_succeeded = true;
    while !queue.empty() {
        let Some(task) = queue.wait(Some(Duration::from_secs(5))) else {
            continue;
        };
        all_succeeded &= task.state() == TaskState::Done;
        match task.failure() {
            None => writeln!(
                stdout,
                "task {} on {} (exit {}): {}",
                task,
                task.host().unwrap_or("?"),
                task.exit_code().unwrap_or_default(),
                task.command()
            )?,
            Some(failure) => writeln!(
                stdout,
                "task {} failed ({}): {}",
                task,
                failure,
                task.command()
            )?,
        }
        stdout.write_all(task.output())?;
    }

    let stats = queue.stats();
    info!(
        "{} task(s) done, {} file(s) and {} byte(s) sent, {:.1}s of execution time",
        stats.total_tasks_retrieved,
        stats.total_files_sent,
        stats.total_bytes_sent,
        stats.total_execution_time.as_secs_f64()
    );
    Ok(all_succeeded)
}
