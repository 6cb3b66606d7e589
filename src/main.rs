use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use revimg::config::{Config, Operation};
use revimg::core::cluster::ClusterMode;
use revimg::core::manager::{DuplicateReport, SearchReport, SkippedImage};
use revimg::services::hash::{HashProgress, ProgressCallback};
use revimg::services::{ImageScanner, PerceptualHasher};
use revimg::{HashMethod, IndexManager, SledRecordStore};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

type Manager = IndexManager<SledRecordStore, PerceptualHasher>;

#[derive(Parser, Debug)]
#[command(
    name = "revimg",
    version,
    about = "Reverse image search and near-duplicate detection"
)]
struct Cli {
    /// JSON parameter file, created with defaults if missing
    #[arg(short, long, value_name = "FILE", default_value = "params.json", global = true)]
    config: PathBuf,

    /// Override the configured hash method
    #[arg(long, value_enum, global = true)]
    hash_method: Option<HashMethod>,

    /// Override the configured hash grid size
    #[arg(long, global = true)]
    hash_size: Option<u32>,

    /// Override the configured Hamming distance threshold
    #[arg(short, long, global = true)]
    threshold: Option<u32>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index every image under the configured directories from scratch
    Build {
        /// Replace an existing index without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Sync the index with the configured directories
    Update,

    /// Find indexed images similar to the query images
    Search {
        /// Directory of query images (default: configured `input_dir`)
        #[arg(short, long, value_name = "DIR")]
        input: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Group indexed images into near-duplicate clusters
    Duplicates {
        /// Also list images without duplicates
        #[arg(long)]
        all: bool,
        #[arg(long, value_enum)]
        mode: Option<ClusterMode>,
        #[arg(long)]
        json: bool,
    },

    /// Run the operation named in the parameter file (default)
    Run {
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },

    /// Show index and record store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = Config::load_or_init(&cli.config)
        .with_context(|| format!("Failed to load parameters from {:?}", cli.config))?;
    if let Some(method) = cli.hash_method {
        config.hash_method = method;
    }
    if let Some(size) = cli.hash_size {
        config.hash_size = size;
    }
    if let Some(threshold) = cli.threshold {
        config.distance_threshold = threshold;
    }
    if let Some(Commands::Duplicates {
        mode: Some(mode), ..
    }) = &cli.command
    {
        config.cluster_mode = *mode;
    }
    config.validate()?;

    let command = cli.command.unwrap_or(Commands::Run {
        yes: false,
        json: false,
    });

    let store_path = config.store_path();
    let store = SledRecordStore::open(&store_path)
        .with_context(|| format!("Failed to open record store {:?}", store_path))?;

    let (bar, callback) = hashing_progress()?;
    let mut manager = IndexManager::new(config.clone(), store, PerceptualHasher::new())
        .with_progress(callback);

    let outcome = match command {
        Commands::Build { yes } => build(&mut manager, &config, yes),
        Commands::Update => update(&mut manager, &config),
        Commands::Search { input, json } => search(&mut manager, &config, input, json),
        Commands::Duplicates { all, json, .. } => duplicates(&mut manager, all, json),
        Commands::Run { yes, json } => match config.operation {
            Operation::Build => build(&mut manager, &config, yes),
            Operation::Update => update(&mut manager, &config),
            Operation::Search => search(&mut manager, &config, None, json),
            Operation::FindDuplicates => duplicates(&mut manager, false, json),
        },
        Commands::Stats { json } => stats(&mut manager, json),
    };
    bar.finish_and_clear();
    outcome
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build(manager: &mut Manager, config: &Config, yes: bool) -> Result<()> {
    let existing = manager.store().len();
    if existing > 0 && !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Replace the existing index of {} images?",
                existing
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Build cancelled; existing index kept.");
            return Ok(());
        }
    }

    let images = scan_images(&config.img_dirs)?;
    println!("▶ Hashing {} images…", images.len());
    let report = benchmark("building the index", || manager.build(&images))?;

    println!("✅ Indexed {} images", report.indexed);
    print_skipped(&report.skipped);
    Ok(())
}

fn update(manager: &mut Manager, config: &Config) -> Result<()> {
    let images = scan_images(&config.img_dirs)?;
    println!("▶ Syncing index with {} images…", images.len());
    let report = benchmark("updating the index", || manager.update(&images))?;

    println!(
        "✅ {} added, {} rehashed, {} removed, {} unchanged",
        report.added, report.rehashed, report.removed, report.unchanged
    );
    if report.rebuilt {
        println!("🌳 Index was rebuilt");
    }
    print_skipped(&report.skipped);
    Ok(())
}

fn search(
    manager: &mut Manager,
    config: &Config,
    input: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let input = input.unwrap_or_else(|| config.input_dir.clone());
    let queries = scan_images(&[input])?;
    let report = benchmark("searching", || manager.search(&queries))?;

    if json {
        return print_json(&report);
    }
    print_search(&report);
    Ok(())
}

fn duplicates(manager: &mut Manager, all: bool, json: bool) -> Result<()> {
    let report = benchmark("finding duplicates", || manager.find_duplicates())?;

    if json {
        return print_json(&report);
    }
    print_duplicates(&report, all);
    Ok(())
}

fn stats(manager: &mut Manager, json: bool) -> Result<()> {
    let stats = manager.stats()?;
    if json {
        return print_json(&stats);
    }

    println!("🗂️  Index ({})", stats.index);
    println!("   records:        {}", stats.records);
    println!("   tombstoned:     {}", stats.tombstoned_records);
    println!("   indexed:        {}", stats.indexed);
    println!("   pending delete: {}", stats.ledger);
    println!("   distinct codes: {}", stats.distinct_codes);
    println!("   tree nodes:     {}", stats.nodes);
    println!("   tree depth:     {}", stats.depth);
    Ok(())
}

fn print_search(report: &SearchReport) {
    if report.results.is_empty() {
        println!("No query images found.");
    }
    for result in &report.results {
        if result.matches.is_empty() {
            println!("\n🔍 {} → no matches", result.query.display());
            continue;
        }
        println!(
            "\n🔍 {} → {} match(es):",
            result.query.display(),
            result.matches.len()
        );
        for found in &result.matches {
            println!("   ▶ [{}] {}", found.distance, found.path.display());
        }
    }
    print_skipped(&report.skipped);
}

fn print_duplicates(report: &DuplicateReport, all: bool) {
    let clusters: Vec<_> = if all {
        report.clusters.iter().collect()
    } else {
        report.groups().collect()
    };
    if clusters.is_empty() {
        println!("No duplicates found.");
        return;
    }

    println!(
        "Found {} cluster(s) among {} images (threshold {}):",
        clusters.len(),
        report.records,
        report.threshold
    );
    for (i, cluster) in clusters.iter().enumerate() {
        println!("\n✨ Group {}:", i + 1);
        for member in &cluster.members {
            println!("   ▶ {}", member.path.display());
        }
    }
}

fn print_skipped(skipped: &[SkippedImage]) {
    if skipped.is_empty() {
        return;
    }
    println!("\n⚠️  Skipped {} image(s):", skipped.len());
    for image in skipped {
        println!("   {} ({})", image.path.display(), image.reason);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Recursively collect image files under `dirs` behind a spinner.
fn scan_images(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let images = ImageScanner::new()
        .scan(dirs)
        .with_context(|| format!("Failed to scan {:?}", dirs))?;
    spinner.finish_with_message(format!("Found {} images", images.len()));
    Ok(images)
}

/// Progress bar fed by the hasher's per-file callback.
fn hashing_progress() -> Result<(ProgressBar, ProgressCallback)> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    let handle = bar.clone();
    let callback: ProgressCallback = Box::new(move |progress: HashProgress| {
        handle.set_length(progress.total as u64);
        handle.inc(1);
        if let Some(name) = progress.current_file.file_name() {
            handle.set_message(name.to_string_lossy().into_owned());
        }
    });
    Ok((bar, callback))
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    eprintln!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
