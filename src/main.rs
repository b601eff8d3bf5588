use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runfiber::config::AppConfig;
use runfiber::encoder::{self, RunningTrace};
use runfiber::ingest::{self, SubjectFiles};
use runfiber::report::SubjectReport;
use runfiber::running::bouts::{BoutCategory, BoutSet};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "runfiber", version, about = "Fiber photometry + running wheel analysis")]
struct Cli {
    /// Config file (defaults to the XDG config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover subjects and run the full pipeline on each
    Process {
        /// Directories to search (defaults to config file data_dirs)
        paths: Vec<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,

        /// Write per-subject reports as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decode an encoder log into running speed and show the calibration
    Decode {
        file: PathBuf,

        /// Zero-based encoder channel
        #[arg(long)]
        channel: Option<usize>,

        /// Wheel diameter in cm
        #[arg(long)]
        diameter: Option<f64>,

        /// Flip the running direction
        #[arg(long)]
        invert: bool,
    },

    /// Decode an encoder log and list classified locomotion bouts
    Bouts { file: PathBuf },

    /// List the markers found in a fluorescence table's events column
    Events { file: PathBuf },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Explicit --config must parse; the default location falls back to defaults
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(),
    };

    match cli.command {
        Commands::Process { paths, jobs, output } => {
            let roots = if !paths.is_empty() {
                paths
            } else if !config.data_dirs.is_empty() {
                config.data_dirs.clone()
            } else {
                anyhow::bail!(
                    "No directories to process. Pass paths as arguments or set data_dirs in config."
                );
            };

            let subjects: Vec<SubjectFiles> = ingest::discover_subjects(&roots);
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let result = runfiber::batch::run_batch(&subjects, &config, workers);

            print_subject_table(&result.reports);
            println!(
                "Process complete: {} processed, {} failed",
                result.processed, result.failed
            );
            for (id, reason) in &result.failures {
                println!("  {id}: {reason}");
            }

            if let Some(path) = output {
                runfiber::report::write_json(&path, &result.reports)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {} reports to {}", result.reports.len(), path.display());
            }
        }

        Commands::Decode {
            file,
            channel,
            diameter,
            invert,
        } => {
            if let Some(channel) = channel {
                config.running.channel = channel;
            }
            if let Some(diameter) = diameter {
                config.running.diameter_cm = diameter;
            }
            config.running.invert |= invert;

            let decoded = decode_file(&file, &config)?;
            let trace = &decoded.trace;
            let cal = &decoded.calibration;

            println!("File:          {}", file.display());
            println!("Samples:       {}", trace.len());
            println!("Duration:      {:.2} s", trace.duration());
            match trace.sample_rate() {
                Some(rate) => println!("Sample rate:   {rate:.2} Hz"),
                None => println!("Sample rate:   n/a"),
            }
            println!(
                "Voltage range: {:.3} – {:.3} V ({})",
                cal.range.0,
                cal.range.1,
                if cal.calibrated { "calibrated" } else { "default" }
            );
            println!("Sweep edges:   {} peaks, {} valleys", cal.peaks, cal.valleys);
            if decoded.truncated_samples > 0 {
                println!("Truncated:     {} samples", decoded.truncated_samples);
            }
            print_speed_summary(trace);
        }

        Commands::Bouts { file } => {
            let decoded = decode_file(&file, &config)?;
            let running = runfiber::running::apply_filters(&decoded.trace, &config.running.filters)
                .context("Running filter failed")?;
            let bouts = running
                .detect_bouts(&config.bouts)
                .context("Bout detection failed")?;
            print_bout_table(&bouts, &running.original.timestamps);
        }

        Commands::Events { file } => {
            let table = ingest::load_fluorescence(&file, &config.table)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let events = table.event_stream(&config.events).with_context(|| {
                format!(
                    "{} has no '{}' column",
                    file.display(),
                    config.table.events_column
                )
            })?;

            println!("{:>10}  {:<20} {:<8} {}", "Time (s)", "Name", "State", "Kind");
            println!("{}", "-".repeat(56));
            for record in events.records() {
                let kind = record
                    .kind
                    .map_or_else(|| "-".to_string(), |k| format!("{k:?}"));
                println!(
                    "{:>10.3}  {:<20} {:<8} {}",
                    record.time,
                    record.name,
                    format!("{:?}", record.state),
                    kind
                );
            }
            println!("{} events", events.records().len());
        }

        Commands::Config => {
            if let Some(path) = AppConfig::config_path() {
                println!("# {}", path.display());
            }
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn decode_file(file: &Path, config: &AppConfig) -> Result<encoder::DecodedRunning> {
    let log = encoder::load_encoder_log(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    encoder::decode(&log, &config.running.decode_options())
        .with_context(|| format!("Failed to decode {}", file.display()))
}

fn print_speed_summary(trace: &RunningTrace) {
    if trace.is_empty() {
        return;
    }
    let mean = trace.speed.iter().sum::<f64>() / trace.len() as f64;
    let max = trace.speed.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let distance: f64 = trace
        .timestamps
        .windows(2)
        .zip(&trace.speed[1..])
        .map(|(t, v)| v.abs() * (t[1] - t[0]))
        .sum();
    println!("Mean speed:    {mean:.2} cm/s");
    println!("Max speed:     {max:.2} cm/s");
    println!("Distance:      {:.1} cm", distance);
}

fn print_bout_table(bouts: &BoutSet, timestamps: &[f64]) {
    println!(
        "Threshold {:.3} cm/s ({}), {:.2} Hz",
        bouts.threshold.threshold,
        if bouts.threshold.adaptive { "adaptive" } else { "fixed" },
        bouts.sample_rate
    );
    println!();
    println!("{:<12} {:>6} {:>10} {:>10} {:>8}", "Category", "#", "Onset", "Offset", "Dur (s)");
    println!("{}", "-".repeat(50));

    for category in BoutCategory::ALL {
        for (i, bout) in bouts.of(category).iter().enumerate() {
            let Some((onset, offset)) = bout.time_range(timestamps) else {
                continue;
            };
            println!(
                "{:<12} {:>6} {:>10.2} {:>10.2} {:>8.2}",
                category.as_str(),
                i + 1,
                onset,
                offset,
                bout.len() as f64 / bouts.sample_rate
            );
        }
    }

    println!();
    for category in BoutCategory::ALL {
        println!(
            "{:<12} {:>4} bouts  {:>8.1} s",
            category.as_str(),
            bouts.count(category),
            bouts.total_duration(category)
        );
    }
}

fn print_subject_table(reports: &[SubjectReport]) {
    if reports.is_empty() {
        return;
    }
    println!(
        "{:<25} {:>5} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "Subject", "ΔF/F", "Gen", "Loco", "Reset", "Jerk", "Other", "Rest", "Diag"
    );
    println!("{}", "-".repeat(82));

    for r in reports {
        // Truncate long ids
        let id: String = if r.id.chars().count() > 25 {
            format!("{}...", r.id.chars().take(22).collect::<String>())
        } else {
            r.id.clone()
        };
        let ok = r.channels.iter().filter(|c| c.formula.is_some()).count();

        println!(
            "{:<25} {:>5} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
            id,
            format!("{}/{}", ok, r.channels.len()),
            r.bouts.count(BoutCategory::General),
            r.bouts.count(BoutCategory::Locomotion),
            r.bouts.count(BoutCategory::Reset),
            r.bouts.count(BoutCategory::Jerk),
            r.bouts.count(BoutCategory::Other),
            r.bouts.count(BoutCategory::Rest),
            r.diagnostics.len()
        );
    }
    println!();
}
