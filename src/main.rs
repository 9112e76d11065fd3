use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};

use lenscull::cache::FieldKind;
use lenscull::config::{Config, StoreLocation};
use lenscull::core::similarity::Algorithm;
use lenscull::engine::{
    ClearRequest, Progress, RefreshSummary, Session, SessionOptions, SessionState,
};

#[derive(Parser, Debug)]
#[command(name = "lenscull", version, about = "Find near-duplicate shots in a photo directory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Config file (default: `<config dir>/lenscull/config.json`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Similarity algorithm: phash, histogram or keypoints. Switching it
    /// recomputes the distances of every cached directory it is used on.
    #[arg(short, long, global = true, value_name = "ALG")]
    algorithm: Option<Algorithm>,

    /// Maximum worker threads per batch
    #[arg(short, long, global = true, value_name = "N")]
    workers: Option<usize>,

    /// Never compare shots taken further apart than this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    window: Option<i64>,

    /// Do not read or write the shared descriptor store
    #[arg(long, global = true)]
    no_store: bool,

    /// YuNet ONNX model used to detect faces
    #[arg(long, global = true, value_name = "FILE")]
    face_model: Option<PathBuf>,

    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh the cache and list groups of similar shots
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Drop a cached field before scanning (repeatable)
        #[arg(long, value_name = "FIELD")]
        clear: Vec<FieldKind>,
    },

    /// List the shots similar to one file
    Similar {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[arg(short, long, value_name = "NAME")]
        file: String,
        /// Raise the threshold by N steps
        #[arg(long, value_name = "N", default_value_t = 0)]
        loosen: u32,
        /// Lower the threshold by N steps
        #[arg(long, value_name = "N", default_value_t = 0)]
        tighten: u32,
    },

    /// Show sharpness, brightness and contrast on a 0-100 scale
    Ratings {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Restrict the view to these files (default: all)
        files: Vec<String>,
    },

    /// Toggle the blurred mark on files
    Mark {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[arg(required = true, value_name = "NAME")]
        files: Vec<String>,
    },

    /// Show detected face boxes for one file
    Faces {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[arg(short, long, value_name = "NAME")]
        file: String,
        /// Write each face as its own image into this directory
        #[arg(long, value_name = "DIR")]
        extract: Option<PathBuf>,
    },

    /// Drop cached data and recompute it
    Clear {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Field to drop (repeatable)
        #[arg(long, value_name = "FIELD", required_unless_present_any = ["all", "descriptors"])]
        field: Vec<FieldKind>,
        /// Drop every record of the directory
        #[arg(long)]
        all: bool,
        /// Also empty the shared descriptor store
        #[arg(long)]
        descriptors: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    let options = session_options(&cli.global)?;

    match cli.command {
        Commands::Scan { path, clear } => {
            println!("▶ Scanning {}", path.display());
            let session = refreshed(&path, options, &ClearRequest::fields(clear))?;
            print_groups(&session)?;
        }

        Commands::Similar {
            path,
            file,
            loosen,
            tighten,
        } => {
            let mut session = refreshed(&path, options, &ClearRequest::none())?;
            for _ in 0..loosen {
                session.loosen();
            }
            for _ in 0..tighten {
                session.tighten();
            }
            let similar = session.get_similar(&file)?;
            println!(
                "🔎 {} ({}, threshold {}):",
                file,
                session.algorithm(),
                session.threshold()
            );
            if similar.is_empty() {
                println!("   no similar shots");
            }
            for other in similar {
                println!("   ▶ {other}");
            }
        }

        Commands::Ratings { path, files } => {
            let session = refreshed(&path, options, &ClearRequest::none())?;
            let ratings = session.ratings(&files)?;
            let width = ratings.iter().map(|r| r.file.len()).max().unwrap_or(4).max(4);
            println!(
                "{:<width$}  {:>9}  {:>10}  {:>8}  {:>7}",
                "file", "sharpness", "brightness", "contrast", "blurred"
            );
            for rating in ratings {
                println!(
                    "{:<width$}  {:>9}  {:>10}  {:>8}  {:>7}",
                    rating.file,
                    score(rating.sharpness),
                    score(rating.brightness),
                    score(rating.contrast),
                    if rating.blurred { "yes" } else { "" }
                );
            }
        }

        Commands::Mark { path, files } => {
            let mut session = open(&path, options)?;
            for file in &files {
                let blurred = session.toggle_blurred(file)?;
                println!("{} {file}", if blurred { "🌫 blurred" } else { "✨ sharp  " });
            }
            if !session.save() {
                println!("⚠ Cache for {} could not be written", path.display());
            }
        }

        Commands::Faces {
            path,
            file,
            extract,
        } => {
            let session = refreshed(&path, options, &ClearRequest::none())?;
            let faces = session.faces(&file)?;
            println!("🙂 {} face(s) in {}", faces.len(), file);
            for face in faces {
                println!(
                    "   ({}, {}) → ({}, {})",
                    face.left, face.top, face.right, face.bottom
                );
            }
            if let Some(out_dir) = extract {
                let written = session
                    .export_faces(&file, &out_dir)
                    .with_context(|| format!("Failed to export faces to {}", out_dir.display()))?;
                println!("📦 Wrote {} file(s) to {}", written.len(), out_dir.display());
            }
        }

        Commands::Clear {
            path,
            field,
            all,
            descriptors,
            yes,
        } => {
            let request = ClearRequest {
                fields: field.into_iter().collect(),
                everything: all,
                descriptor_store: descriptors,
            };
            if !yes && !confirm_clear(&path, &request)? {
                println!("Nothing cleared.");
                return Ok(());
            }
            let mut session = open(&path, options)?;
            let summary = refresh(&mut session, &request)?;
            println!(
                "🧹 Cleared {} value(s), recomputed {} file(s)",
                summary.cleared, summary.extracted
            );
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn session_options(args: &GlobalArgs) -> Result<SessionOptions> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(algorithm) = args.algorithm {
        config.algorithm = algorithm;
    }
    if args.workers.is_some() {
        config.worker_limit = args.workers;
    }
    if let Some(window) = args.window {
        config.time_window_secs = window;
    }
    if args.no_store {
        config.descriptor_store = StoreLocation::Disabled;
    }
    if let Some(model) = &args.face_model {
        config.face_model = Some(model.clone());
    }
    Ok(SessionOptions::from_config(&config)?)
}

fn open(path: &Path, options: SessionOptions) -> Result<Session> {
    Session::open(path, options).with_context(|| format!("Failed to open {}", path.display()))
}

fn refresh(session: &mut Session, clear: &ClearRequest) -> Result<RefreshSummary> {
    let start = Instant::now();
    let mut bars = Bars::default();
    let summary = session
        .refresh(clear, &mut bars)
        .context("Scan failed; run the command again to retry")?;
    if summary.rescanned {
        println!("⏱ Refreshed in {:.2?}", start.elapsed());
    }
    Ok(summary)
}

fn refreshed(path: &Path, options: SessionOptions, clear: &ClearRequest) -> Result<Session> {
    let mut session = open(path, options)?;
    refresh(&mut session, clear)?;
    Ok(session)
}

fn print_groups(session: &Session) -> Result<()> {
    let groups = session.groups();
    println!(
        "✅ {} image(s) in {} group(s) ({}, threshold {})",
        session.files().len(),
        groups.len(),
        session.algorithm(),
        session.threshold()
    );
    let mut shown = 0;
    for representative in &groups {
        let similar = session.get_similar(representative)?;
        if similar.is_empty() {
            continue;
        }
        shown += 1;
        println!("\n✨ Group {shown}:");
        println!("   🏆 {representative}");
        for file in similar {
            println!("   ▶ {file}");
        }
    }
    if shown == 0 {
        println!("No similar shots found.");
    }
    Ok(())
}

fn confirm_clear(path: &Path, request: &ClearRequest) -> Result<bool> {
    let what = if request.everything {
        "every cached record".to_string()
    } else {
        let names: Vec<String> = request.fields.iter().map(|f| f.to_string()).collect();
        names.join(", ")
    };
    Ok(Confirm::new()
        .with_prompt(format!("Clear {what} for {}?", path.display()))
        .default(false)
        .interact()?)
}

fn score(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}

/// One progress bar per engine stage.
#[derive(Default)]
struct Bars {
    bar: Option<ProgressBar>,
}

impl Progress for Bars {
    fn begin(&mut self, stage: SessionState, total: usize) {
        let label = match stage {
            SessionState::Extracting => "Analyzing images",
            SessionState::Comparing => "Comparing shots",
            _ => "Working",
        };
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(label);
        self.bar = Some(bar);
    }

    fn advance(&mut self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
