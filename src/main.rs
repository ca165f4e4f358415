use chrono::Timelike;
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use traversal_scheduler::config::Config;
use traversal_scheduler::domain::Schedule;
use traversal_scheduler::scheduler::{SourceContext, TraversalScheduler};
use traversal_scheduler::source::{MemorySourceRegistry, SimulatedJob};

fn setup_logging(default_level: Option<&str>) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("traversal-scheduler")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("traversal-scheduler.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    // RUST_LOG wins over the configured level
    let env = env_logger::Env::default().default_filter_or(default_level.unwrap_or("info"));
    env_logger::Builder::from_env(env)
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        None => handle_run_command(None, config).await,
        Some(Commands::Run { duration_secs }) => handle_run_command(*duration_secs, config).await,
        Some(Commands::Config) => handle_config_command(config),
        Some(Commands::CheckSchedule { schedule }) => handle_check_schedule_command(schedule),
    }
}

async fn handle_run_command(duration_secs: Option<u64>, config: &Config) -> Result<()> {
    let registry = Arc::new(MemorySourceRegistry::new());
    let mut jobs = Vec::new();

    for source in &config.demo.sources {
        let schedule: Schedule = source
            .schedule
            .parse()
            .context(format!("Invalid demo schedule '{}'", source.schedule))?;
        let job = Arc::new(
            SimulatedJob::new(source.documents).with_per_document(Duration::from_millis(source.per_document_ms)),
        );
        println!("{} {} ({} documents)", "Source:".cyan(), schedule, source.documents);
        jobs.push((schedule.source_id.clone(), job.clone()));
        registry.add_source(schedule, job);
    }
    if jobs.is_empty() {
        println!("{}", "No demo sources configured, the scheduler will idle".yellow());
    }

    let scheduler = TraversalScheduler::new(config, SourceContext::from_registry(registry))
        .context("Failed to create scheduler")?;
    scheduler.init().context("Failed to start scheduler")?;
    println!("{}", "Scheduler running, press Ctrl+C to stop".green());

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run duration of {}s elapsed", secs);
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl+C")?;
                }
            }
        }
        None => tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?,
    }

    println!("{}", "Shutting down...".cyan());
    let drained = scheduler.shutdown().await;
    if !drained {
        println!("{}", "Some batches were still running at shutdown".yellow());
    }

    println!("{} {}", "Ticks:".green(), scheduler.tick_count());
    for (source_id, job) in &jobs {
        println!(
            "  {}: {} batches, {} documents left",
            source_id,
            job.batch_count(),
            job.remaining()
        );
    }
    Ok(())
}

fn handle_config_command(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}

fn handle_check_schedule_command(schedule: &str) -> Result<()> {
    let schedule: Schedule = schedule.parse().context("Failed to parse schedule")?;

    println!("{} {}", "Schedule:".green(), schedule);
    println!("  source:   {}", schedule.source_id);
    println!("  disabled: {}", schedule.disabled);
    println!("  load:     {}", schedule.load);
    match schedule.retry_delay() {
        Some(delay) => println!("  retry:    {}ms", delay.as_millis()),
        None => println!("  retry:    {}", "disable when drained".yellow()),
    }
    let open: Vec<String> = (0..24)
        .filter(|hour| schedule.in_interval(*hour))
        .map(|hour| hour.to_string())
        .collect();
    if open.is_empty() {
        println!("  hours:    {}", "never".red());
    } else {
        println!("  hours:    {}", open.join(","));
    }

    let hour = chrono::Local::now().hour();
    if schedule.in_interval(hour) {
        println!("{} open now (hour {})", "Status:".green(), hour);
    } else {
        println!("{} closed now (hour {})", "Status:".red(), hour);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(config.log_level.as_deref()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
