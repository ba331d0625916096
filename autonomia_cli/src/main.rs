use autonomia_core::csv_export::export_csv;
use autonomia_core::history::{bpm_bounds, load_all, summarize, BPM_MARGIN};
use autonomia_core::*;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "autonomia")]
#[command(about = "Heart-rate guided rowing intervals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded session log through the workout engine
    Replay {
        /// Session log to replay
        log: PathBuf,

        /// Sleep multiplier between ticks (0 runs flat out)
        #[arg(long)]
        speed: Option<f64>,

        /// Do not save the replayed log
        #[arg(long)]
        no_save: bool,

        /// Drive a logging metronome from the guidance
        #[arg(long)]
        metronome: bool,
    },

    /// List recorded sessions
    History,

    /// Export a session log to CSV
    Export {
        /// Session log to export
        log: PathBuf,

        /// CSV file to write
        csv: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Write it to the config file instead
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    autonomia_core::logging::init();

    if let Err(e) = run(Cli::parse()) {
        tracing::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) if path.exists() => Config::load_from(path)?,
        Some(path) => {
            tracing::info!("No config file found at {:?}, using defaults", path);
            Config::default()
        }
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    match cli.command {
        Commands::Replay {
            log,
            speed,
            no_save,
            metronome,
        } => {
            if let Some(speed) = speed {
                config.replay.speed = speed;
            }
            config.data.no_save |= no_save;
            cmd_replay(&log, &config, metronome)
        }
        Commands::History => cmd_history(&config),
        Commands::Export { log, csv } => cmd_export(&log, &csv),
        Commands::Config { write } => {
            let path = cli.config.unwrap_or_else(Config::default_config_path);
            cmd_config(&config, &path, write)
        }
    }
}

fn cmd_replay(log: &Path, config: &Config, with_metronome: bool) -> Result<()> {
    let record = LogStore::load(log)?;
    let mut session = Session::replay(&record, config)?;
    let mut driver = Driver::new();
    let metronome = if with_metronome {
        Some(Metronome::start(LoggingOutput, &config.metronome)?)
    } else {
        None
    };

    println!(
        "Replaying {} {} (resting {} bpm, {} rows)",
        session.date(),
        session.start_time(),
        session.resting_bpm(),
        record.log.len()
    );

    let mut phase = session.phase();
    let mut ticks = 0usize;
    loop {
        let tick = driver.tick(&mut session, None)?;

        if let (Some(metronome), Some(command)) = (&metronome, tick.metronome) {
            metronome.send(command);
        }
        if tick.finished {
            break;
        }

        ticks += 1;
        if tick.phase != phase {
            println!("{:>8.1}s  {}", tick.event.time, tick.phase);
            phase = tick.phase;
        }
        if let Some(guidance) = &tick.guidance {
            tracing::debug!(
                "{:.1}s {:?} cadence {} watts {} bpm {:.1}",
                tick.event.time,
                guidance.advice,
                guidance.cadence,
                guidance.watts,
                guidance.rolling_bpm
            );
        }

        session.sleep_tick();
    }

    if let Some(metronome) = metronome {
        metronome.stop()?;
    }

    let store = LogStore::new(&config.data.data_dir);
    let saved = session.shutdown(Some(&store))?;

    println!("Replay finished after {} ticks", ticks);
    match saved {
        Some(path) => println!("Saved session log to {}", path.display()),
        None => println!("Session log not saved"),
    }
    if let Some(runner) = driver.runner() {
        if let Some(target) = runner.steady_target() {
            println!(
                "Steady target: {} strokes/min, {} W",
                target.cadence, target.watts
            );
        }
    }

    Ok(())
}

fn cmd_history(config: &Config) -> Result<()> {
    let store = LogStore::new(&config.data.data_dir);
    let sessions = load_all(&store)?;

    if sessions.is_empty() {
        println!("No sessions found in {}", store.dir().display());
        return Ok(());
    }

    for loaded in &sessions {
        let summary = summarize(&loaded.record, &loaded.events);
        let mean = summary
            .mean_bpm
            .map_or_else(|| "-".to_string(), |bpm| format!("{:.0}", bpm));
        println!(
            "{} {}  resting {:>3}  {:>5} rows  {:>6.0}s  mean {:>3} bpm  {:.0} m",
            summary.date,
            summary.start_time,
            summary.resting_bpm,
            summary.rows,
            summary.duration,
            mean,
            summary.distance
        );

        let phases: Vec<String> = summary
            .phases
            .iter()
            .map(|(offset, phase)| format!("{}@{:.0}s", phase, offset))
            .collect();
        println!("    {}", phases.join(" "));
    }

    let bounds = bpm_bounds(sessions.iter().map(|s| s.events.as_slice()), BPM_MARGIN);
    if let Some(bounds) = bounds {
        println!(
            "BPM range {:.1} to {:.1} ({:.1})",
            bounds.min, bounds.max, bounds.range
        );
    }

    Ok(())
}

fn cmd_export(log: &Path, csv_path: &Path) -> Result<()> {
    let record = LogStore::load(log)?;
    let count = export_csv(&record, csv_path)?;

    println!("✓ Exported {} rows", count);
    println!("  CSV: {}", csv_path.display());
    Ok(())
}

fn cmd_config(config: &Config, path: &Path, write: bool) -> Result<()> {
    if write {
        config.save_to(path)?;
        println!("✓ Wrote config to {}", path.display());
    } else {
        print!("{}", config.to_toml()?);
    }
    Ok(())
}
