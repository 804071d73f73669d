use avifier::imaging::TargetFormat;
use avifier::{ConversionRequest, Engine, SourceRef, config, logging, maintenance, output};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Shared flags for commands that convert images.
#[derive(clap::Args, Clone)]
struct ConvertArgs {
    /// Ignore valid cached variants and convert again
    #[arg(long)]
    force: bool,
}

#[derive(Parser)]
#[command(name = "avifier")]
#[command(about = "Serve the smallest valid AVIF/WebP variant of an image")]
#[command(long_about = "\
Serve the smallest valid AVIF/WebP variant of an image

Variants are written next to their source and named from it:

  uploads/2024/
  ├── photo.jpg                    # Original
  ├── photo.avif                   # AVIF at the configured default quality
  ├── photo-q65.avif               # AVIF at an explicit non-default quality
  ├── photo.webp                   # WEBP next to AVIF (policy.webp)
  ├── photo-800x400.jpg            # Proportional pre-warm copy
  └── photo-800x400.avif           # ...and its variant

A variant is kept only if it validates and, with policy.only_if_smaller,
is strictly smaller than its source. Otherwise the original is served.

Run 'avifier gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Directory containing config.toml
    #[arg(long, default_value = ".", global = true)]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which backend produces each format on this host
    Detect,
    /// Convert one image (a local file or a URL under a content root)
    Convert {
        /// File path or URL
        source: String,
        /// Public URL of a local file (defaults to the path)
        #[arg(long)]
        url: Option<String>,
        /// Only this format (default: every enabled format)
        #[arg(long)]
        format: Option<TargetFormat>,
        /// Explicit quality 1-100 (default: from settings)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
        quality: Option<u32>,
        #[command(flatten)]
        args: ConvertArgs,
    },
    /// Register an uploaded original and convert it
    Register {
        /// Original file
        path: PathBuf,
        /// Public URL of the original
        #[arg(long)]
        url: String,
        /// Registered size files (thumbnails) of the original
        #[arg(long = "size")]
        sizes: Vec<PathBuf>,
    },
    /// Convert every registered original, or every image under the roots
    Bulk {
        /// Generate WEBP alongside AVIF
        #[arg(long, overrides_with = "no_webp")]
        webp: bool,
        /// Generate AVIF only
        #[arg(long)]
        no_webp: bool,
        /// Worker threads (default: all cores)
        #[arg(long)]
        threads: Option<usize>,
        #[command(flatten)]
        args: ConvertArgs,
    },
    /// Delete every generated variant (registered originals are kept)
    Purge,
    /// Delete generated variants that fail validation
    Sweep,
    /// Forget detected capabilities and detect again
    ClearCache,
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let mut settings = config::load_config(&cli.config_dir)?;
    logging::init(&settings);
    let engine = Engine::from_settings(&settings);

    match cli.command {
        Command::Detect => {
            output::print_capabilities(&engine.detector().detect_all());
        }
        Command::Convert {
            source,
            url,
            format,
            quality,
            args,
        } => {
            let reference = source_ref(&source, url);
            let formats = match format {
                Some(f) => vec![f],
                None => settings.formats(),
            };
            for format in formats {
                let mut request =
                    ConversionRequest::new(reference.clone(), format).force(args.force);
                request.quality = quality;
                let conversion = engine.convert(&settings, &request);
                output::print_conversion(format, &conversion);
            }
        }
        Command::Register { path, url, sizes } => {
            let (attachment, stats) =
                maintenance::register_upload(&engine, &settings, &url, &path, sizes)?;
            println!("Registered attachment {} ({})", attachment.id, attachment.url);
            println!("Variants: {}", stats);
        }
        Command::Bulk {
            webp,
            no_webp,
            threads,
            args,
        } => {
            if webp {
                settings.policy.webp = true;
            }
            if no_webp {
                settings.policy.webp = false;
            }
            init_thread_pool(threads);
            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                let mut done = 0;
                for event in rx {
                    if let maintenance::BulkEvent::SourceDone { .. } = event {
                        done += 1;
                    }
                    for line in output::format_bulk_event(done, &event) {
                        println!("{}", line);
                    }
                }
            });
            let stats = maintenance::bulk_convert(&engine, &settings, args.force, Some(tx));
            printer.join().ok();
            println!("Variants: {}", stats);
        }
        Command::Purge => {
            let stats = maintenance::purge(&engine, &settings)?;
            println!("Purged: {}", stats);
        }
        Command::Sweep => {
            let stats = maintenance::sweep_invalid(&engine, &settings);
            println!("Swept: {}", stats);
        }
        Command::ClearCache => {
            output::print_capabilities(&engine.detector().clear());
        }
        // Printed before settings were loaded.
        Command::GenConfig => {}
    }

    Ok(())
}

/// A path that exists on disk is a file handle; anything else is a URL.
fn source_ref(source: &str, url: Option<String>) -> SourceRef {
    let path = PathBuf::from(source);
    if path.is_file() {
        let path = std::path::absolute(&path).unwrap_or(path);
        let url = url.unwrap_or_else(|| path.display().to_string());
        SourceRef::File { path, url }
    } else {
        SourceRef::Url(source.to_string())
    }
}

/// Initialize the rayon thread pool.
///
/// Capped at the number of available CPU cores: the user can constrain down,
/// not up.
fn init_thread_pool(threads: Option<usize>) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let threads = threads.map_or(cores, |t| t.clamp(1, cores));
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
