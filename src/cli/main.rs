//! Background Removal CLI Tool
//!
//! Downloads and caches the model and runtime assets, removes backgrounds
//! from single images, and manages the on-disk asset cache.

use super::config::CliConfigBuilder;
use crate::{
    cache::{default_cache_dir, format_size, AssetCache},
    catalog::AssetCatalog,
    download::{ChunkedFetcher, FetchOptions},
    inference::InferenceRuntime,
    services::{ImageSource, ProgressSink, INFERENCE_LABEL},
    tracing_config::init_cli_tracing,
    BackgroundRemover,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Background removal CLI tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "imgly-bgremove-web")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Base URL the model and runtime assets are served from
    #[arg(long, global = true, env = "IMGLY_BGREMOVE_PUBLIC_PATH", value_name = "URL")]
    pub public_path: Option<String>,

    /// Use custom cache directory
    #[arg(long, global = true, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Extra request header for asset downloads (NAME:VALUE), repeatable
    #[arg(long = "header", global = true, value_name = "NAME:VALUE")]
    pub headers: Vec<String>,

    /// Timeout in seconds for each asset download
    #[arg(long, global = true, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download every model and runtime asset into the cache
    Preload,

    /// Remove the background of one image
    Remove {
        /// Input image path or URL
        #[arg(value_name = "INPUT")]
        input: String,

        /// Output PNG file ("-" for stdout) [default: <input>_bg_removed.png]
        #[arg(short, long, value_name = "OUTPUT")]
        output: Option<String>,

        /// Model variant
        #[arg(short, long, value_enum, default_value_t = CliModel::Medium)]
        model: CliModel,

        /// Inference runtime
        #[arg(long, value_enum, default_value_t = CliRuntime::default())]
        runtime: CliRuntime,

        /// Ask the runtime to execute on a worker thread
        #[arg(long)]
        proxy_to_worker: bool,
    },

    /// Inspect or clear the asset cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// List cached assets
    List,
    /// Delete every cached asset
    Clear,
    /// Show the cache directory
    Dir,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliModel {
    Small,
    Medium,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliRuntime {
    /// Pure Rust runtime
    #[cfg(feature = "tract")]
    Tract,
    /// ONNX Runtime
    #[cfg(feature = "onnx")]
    Onnx,
}

impl Default for CliRuntime {
    #[allow(unreachable_code)]
    fn default() -> Self {
        #[cfg(feature = "tract")]
        return Self::Tract;
        #[cfg(all(feature = "onnx", not(feature = "tract")))]
        return Self::Onnx;
    }
}

impl std::fmt::Display for CliRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default();
        f.write_str(&name)
    }
}

impl std::fmt::Display for CliModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Small => "small",
            Self::Medium => "medium",
        })
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_cli_tracing(cli.verbose, cli.json_logs).context("Failed to initialize tracing")?;

    match cli.command.clone() {
        Command::Preload => preload(&cli).await,
        Command::Remove {
            input,
            output,
            model,
            runtime,
            proxy_to_worker,
        } => {
            let request = RemoveRequest {
                input,
                output,
                model,
                proxy_to_worker,
            };
            match runtime {
                #[cfg(feature = "tract")]
                CliRuntime::Tract => {
                    remove(&cli, request, Arc::new(crate::backends::TractRuntime::new())).await
                },
                #[cfg(feature = "onnx")]
                CliRuntime::Onnx => {
                    remove(&cli, request, Arc::new(crate::backends::OnnxRuntime::new())).await
                },
            }
        },
        Command::Cache { action } => cache_command(&cli, action).await,
    }
}

/// Arguments of the `remove` subcommand
struct RemoveRequest {
    input: String,
    output: Option<String>,
    model: CliModel,
    proxy_to_worker: bool,
}

async fn open_cache(cli: &Cli) -> Result<AssetCache> {
    let fetcher = ChunkedFetcher::http().context("Failed to create HTTP client")?;
    Ok(AssetCache::open(
        Arc::new(AssetCatalog::default()),
        fetcher,
        cli.cache_dir.clone(),
    )
    .await)
}

async fn preload(cli: &Cli) -> Result<()> {
    let progress = Arc::new(CliProgress::new());
    let config = CliConfigBuilder::new(cli)
        .progress(progress.clone())
        .build()
        .context("Invalid configuration")?;

    let cache = open_cache(cli).await?;
    let total = cache.catalog().total_size();
    println!(
        "📦 Preloading {} assets ({})",
        cache.catalog().len(),
        format_size(total)
    );

    let start = Instant::now();
    let options = FetchOptions::from_config(&config);
    let results = cache.fetch_all(&options).await;
    progress.finish();

    let mut failed = 0;
    for (key, result) in &results {
        match result {
            Ok(artifact) => info!("{}: {}", key, format_size(artifact.len() as u64)),
            Err(e) => {
                failed += 1;
                error!("Failed to preload {}: {}", key, e);
            },
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} assets failed to download", failed, results.len());
    }
    println!(
        "✅ All assets cached in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

async fn remove<R: InferenceRuntime>(cli: &Cli, request: RemoveRequest, runtime: Arc<R>) -> Result<()> {
    let progress = Arc::new(CliProgress::new());
    let config = CliConfigBuilder::new(cli)
        .model(request.model)
        .proxy_to_worker(request.proxy_to_worker)
        .progress(progress.clone())
        .build()
        .context("Invalid configuration")?;

    info!(
        "Removing background from {} (model {}, runtime {})",
        request.input,
        config.model,
        runtime.name()
    );

    let cache = Arc::new(open_cache(cli).await?);
    let remover = Arc::new(BackgroundRemover::new(config, runtime, cache)?);

    let canceller = {
        let remover = Arc::clone(&remover);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling");
                remover.cancel();
            }
        })
    };

    let start = Instant::now();
    let result = remover
        .remove_background(ImageSource::parse(&request.input))
        .await;
    canceller.abort();
    progress.finish();

    let png = result.with_context(|| format!("Failed to process {}", request.input))?;

    match request.output.as_deref() {
        Some("-") => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&png).context("Failed to write to stdout")?;
            stdout.flush().context("Failed to flush stdout")?;
        },
        output => {
            let path = output
                .map(PathBuf::from)
                .unwrap_or_else(|| generate_output_path(&request.input));
            tokio::fs::write(&path, &png)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "✅ Saved {} in {:.2}s",
                path.display(),
                start.elapsed().as_secs_f64()
            );
        },
    }
    Ok(())
}

async fn cache_command(cli: &Cli, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Dir => {
            let dir = match &cli.cache_dir {
                Some(dir) => dir.clone(),
                None => default_cache_dir()?,
            };
            println!("📁 Current cache directory:");
            println!("   Path: {}", dir.display());
            if std::env::var(crate::cache::CACHE_DIR_ENV).is_ok() {
                println!("   Source: IMGLY_BGREMOVE_CACHE_DIR environment variable");
            } else if cli.cache_dir.is_some() {
                println!("   Source: --cache-dir");
            } else {
                println!("   Source: XDG cache directory specification");
            }
        },
        CacheAction::List => {
            let cache = open_cache(cli).await?;
            let entries = cache.cached_entries().await?;
            println!("📦 Cached Assets");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            if entries.is_empty() {
                println!("No cached assets found.");
                println!("\n💡 To download every asset, use:");
                println!("  imgly-bgremove-web --public-path <URL> preload");
                return Ok(());
            }
            for entry in &entries {
                let valid = cache
                    .catalog()
                    .get(&entry.key)
                    .is_ok_and(|catalog| catalog.size == entry.size);
                println!("📁 {}", entry.key);
                println!("  └─ Size: {}", format_size(entry.size));
                println!("  └─ Stored: {}", entry.stored_at.format("%Y-%m-%d %H:%M:%S UTC"));
                if let Some(last_modified) = &entry.last_modified {
                    println!("  └─ Last-Modified: {}", last_modified);
                }
                if !valid {
                    println!("  └─ ⚠️  Does not match the catalog; will be refetched");
                }
            }
            let total: u64 = entries.iter().map(|e| e.size).sum();
            println!("\n{} asset(s), {}", entries.len(), format_size(total));
        },
        CacheAction::Clear => {
            let cache = open_cache(cli).await?;
            let removed = cache.clear().await?;
            if removed.is_empty() {
                println!("💡 Cache was already empty");
            } else {
                println!("✅ Successfully removed {} asset(s):", removed.len());
                for key in removed {
                    println!("   • {}", key);
                }
            }
        },
    }
    Ok(())
}

/// `<stem>_bg_removed.png` next to a local input, or in the working
/// directory for URLs
fn generate_output_path(input: &str) -> PathBuf {
    let (dir, stem) = match ImageSource::parse(input) {
        ImageSource::Path(path) => (
            path.parent().map(Path::to_path_buf).unwrap_or_default(),
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string()),
        ),
        ImageSource::Url(url) => {
            let stem = url
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .and_then(|name| {
                    Path::new(&name)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "output".to_string());
            (PathBuf::new(), stem)
        },
        ImageSource::Bytes(_) | ImageSource::Decoded(_) => (PathBuf::new(), "output".to_string()),
    };
    dir.join(format!("{}_bg_removed.png", stem))
}

/// One progress bar per download, one spinner for inference
struct CliProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, label: &str, total: u64) -> ProgressBar {
        let Ok(mut bars) = self.bars.lock() else {
            return ProgressBar::hidden();
        };
        bars.entry(label.to_string())
            .or_insert_with(|| {
                let bar = if label == INFERENCE_LABEL {
                    let bar = self.multi.add(ProgressBar::new_spinner());
                    bar.enable_steady_tick(std::time::Duration::from_millis(100));
                    bar
                } else {
                    let bar = self.multi.add(ProgressBar::new(total));
                    if let Ok(style) = ProgressStyle::default_bar().template(
                        "{spinner:.green} {msg:32} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                    ) {
                        bar.set_style(style.progress_chars("#>-"));
                    }
                    bar
                };
                bar.set_message(label.trim_start_matches("fetch:").to_string());
                bar
            })
            .clone()
    }

    fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for bar in bars.values() {
                if !bar.is_finished() {
                    bar.finish_and_clear();
                }
            }
        }
    }
}

impl ProgressSink for CliProgress {
    fn report(&self, label: &str, current: u64, total: u64) {
        let bar = self.bar_for(label, total);
        if label == INFERENCE_LABEL {
            if current >= total {
                bar.finish_with_message("inference done");
            } else {
                bar.set_message("running inference");
            }
            return;
        }
        if total > 0 {
            bar.set_length(total);
        }
        bar.set_position(current);
        if total > 0 && current >= total {
            bar.finish();
        }
    }
}
