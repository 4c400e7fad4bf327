use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use libpixcal::config::Config;
use libpixcal::process::{create_subsets, process_subset};
use libpixcal::worker_status::{BarColor, WorkerStatus};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

fn bar_style(color: BarColor) -> ProgressStyle {
    let template = match color {
        BarColor::CYAN => "{prefix:>18} [{bar:40.cyan/blue}] {pos:>3}%",
        BarColor::GREEN => "{prefix:>18} [{bar:40.green/blue}] {pos:>3}%",
        BarColor::MAGENTA => "{prefix:>18} [{bar:40.magenta/blue}] {pos:>3}% (events skipped)",
    };
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn setup_logging(verbose: bool) {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./pixcal.log"))
            .formatter(*Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .unwrap(),
    );
    let level_filter = if verbose {
        spdlog::LevelFilter::All
    } else {
        spdlog::LevelFilter::MoreSevereEqual(spdlog::Level::Info)
    };
    let logger = Arc::new(
        spdlog::Logger::builder()
            .level_filter(level_filter)
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);
}

fn main() {
    // Create a cli
    let matches = Command::new("pixcal_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log per-detector diagnostics every 100 events"),
        )
        .get_matches();

    setup_logging(matches.get_flag("verbose"));
    spdlog::info!("Starting pixcal");

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        println!("Made a template config at {}", config_path.to_string_lossy());
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            eprintln!("{e}");
            return;
        }
    };
    if !config.is_n_threads_valid() {
        spdlog::error!("n_threads must be at least 1, found {}", config.n_threads);
        eprintln!("n_threads must be at least 1, found {}", config.n_threads);
        return;
    }
    spdlog::info!("Config successfully loaded.");
    spdlog::info!("Input Path: {}", config.input_path.to_string_lossy());
    spdlog::info!("Output Path: {}", config.output_path.to_string_lossy());
    spdlog::info!("Detector Family: {:?}", config.family);
    spdlog::info!("Execution Strategy: {:?}", config.strategy);
    spdlog::info!("Common Mode: {:?}", config.common_mode);
    spdlog::info!(
        "First Run: {} Last Run: {}",
        config.first_run_number,
        config.last_run_number
    );

    // Setup the progress bars and spawn the workers
    let pb_manager = MultiProgress::new();
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let mut bars = Vec::new();
    let mut colors = Vec::new();
    let mut workers = Vec::new();
    for (idx, subset) in create_subsets(&config).into_iter().enumerate() {
        let bar = pb_manager.add(ProgressBar::new(100));
        bar.set_style(bar_style(BarColor::CYAN));
        bar.set_prefix(format!("Worker {idx}"));
        bars.push(bar);
        colors.push(BarColor::CYAN);

        let conf = config.clone();
        let tx = tx.clone();
        workers.push(std::thread::spawn(move || {
            process_subset(conf, tx, idx, subset)
        }));
    }
    drop(tx);

    // Ends once every worker has hung up
    for status in rx.iter() {
        let id = status.worker_id;
        if let Some(bar) = bars.get(id) {
            if colors[id] != status.color {
                bar.set_style(bar_style(status.color));
                colors[id] = status.color;
            }
            bar.set_prefix(format!("Worker {} run {}", id, status.run_number));
            bar.set_position((status.progress * 100.0) as u64);
        }
    }

    let mut n_failed = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(_)) => spdlog::info!("Worker complete"),
            Ok(Err(e)) => {
                n_failed += 1;
                spdlog::error!("Processor error: {e}")
            }
            Err(_) => {
                n_failed += 1;
                spdlog::error!("An error occured joining one of the workers!")
            }
        }
    }
    for bar in bars {
        bar.finish();
    }

    if n_failed == 0 {
        spdlog::info!("Successfully calibrated data!");
    } else {
        eprintln!("{n_failed} worker(s) failed, check pixcal.log for details");
    }
    spdlog::info!("Done.");
}
