use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;

use sdm_core::checksum;
use sdm_core::config;
use sdm_core::probe;
use sdm_core::queue::{AddRequest, JobStatus, ProgressEvent, Queue};

/// Top-level CLI for the sdm download manager.
#[derive(Debug, Parser)]
#[command(name = "sdm")]
#[command(about = "sdm: segmented, resumable download manager", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download one or more URLs, printing live progress.
    Download {
        /// HTTPS URLs to download.
        urls: Vec<String>,

        /// Save under this filename (single URL only).
        #[arg(long)]
        filename: Option<String>,

        /// Parallel connections per download (1..=30).
        #[arg(long, short = 'c')]
        connections: Option<usize>,

        /// Adapt the connection count to observed per-connection throughput.
        #[arg(long)]
        adaptive: bool,

        /// Destination directory (defaults to the current directory).
        #[arg(long)]
        dest_dir: Option<PathBuf>,

        /// How many downloads run at once.
        #[arg(long, short = 'j')]
        max_concurrent: Option<usize>,

        /// Accept plain-http URLs (local mirrors, test servers).
        #[arg(long)]
        insecure: bool,

        /// Print the SHA-256 of each completed file.
        #[arg(long)]
        verify: bool,
    },

    /// Probe a URL: size, range support, content type, suggested name.
    Probe {
        /// URL to probe.
        url: String,
    },

    /// SHA-256 of a local file.
    Hash {
        /// File to hash.
        path: PathBuf,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        match cli.command {
            CliCommand::Download {
                urls,
                filename,
                connections,
                adaptive,
                dest_dir,
                max_concurrent,
                insecure,
                verify,
            } => {
                if urls.is_empty() {
                    bail!("no URLs given");
                }
                if filename.is_some() && urls.len() > 1 {
                    bail!("--filename only makes sense with a single URL");
                }

                let mut cfg = config::load_or_init()?;
                if let Some(k) = max_concurrent {
                    cfg.max_concurrent_jobs = k.max(1);
                }
                if insecure {
                    cfg.allow_insecure = true;
                }
                let dest = match dest_dir {
                    Some(d) => d,
                    None => std::env::current_dir()?,
                };

                let queue = Queue::new(cfg, dest);
                let (sub_id, mut events) = queue.subscribe_channel();

                let mut pending: HashSet<u64> = HashSet::new();
                for url in urls {
                    let mut req = AddRequest::new(url.clone());
                    req.filename = filename.clone();
                    req.connections = connections;
                    req.adaptive = Some(adaptive);
                    match queue.add(req) {
                        Ok(id) => {
                            pending.insert(id);
                        }
                        Err(e) => eprintln!("sdm: skipping {}: {}", url, e),
                    }
                }
                if pending.is_empty() {
                    bail!("nothing to download");
                }

                let mut completed: Vec<String> = Vec::new();
                while !pending.is_empty() {
                    let Some(event) = events.recv().await else {
                        break;
                    };
                    print_event(&event);
                    let job = &event.data;
                    if job.status.is_terminal() && pending.remove(&job.id) {
                        if job.status == JobStatus::Completed {
                            completed.push(job.dest_path.clone());
                        }
                    }
                }
                queue.unsubscribe(sub_id);
                tracing::info!(completed = completed.len(), "download run finished");

                if verify {
                    for path in &completed {
                        let digest = checksum::sha256_path(std::path::Path::new(path))?;
                        println!("{}  {}", digest, path);
                    }
                }
            }
            CliCommand::Probe { url } => {
                let meta =
                    tokio::task::spawn_blocking(move || probe::probe_best_effort(&url)).await??;
                println!("status:          {}", meta.status_code);
                println!(
                    "size:            {}",
                    meta.total_bytes
                        .map(|n| format!("{} ({})", n, human_bytes(n as f64)))
                        .unwrap_or_else(|| "unknown".to_string())
                );
                println!("accepts ranges:  {}", meta.accepts_ranges);
                println!(
                    "content type:    {}",
                    meta.content_type.as_deref().unwrap_or("-")
                );
                println!(
                    "suggested name:  {}",
                    meta.suggested_filename.as_deref().unwrap_or("-")
                );
            }
            CliCommand::Hash { path } => {
                let digest = checksum::sha256_path(&path)?;
                println!("{}  {}", digest, path.display());
            }
        }

        Ok(())
    }
}

fn print_event(event: &ProgressEvent) {
    let job = &event.data;
    match job.status {
        JobStatus::Downloading => {
            let pct = if job.total_bytes > 0 {
                format!(
                    "{:5.1}%",
                    job.received_bytes as f64 / job.total_bytes as f64 * 100.0
                )
            } else {
                format!("{:>8}", human_bytes(job.received_bytes as f64))
            };
            println!(
                "[{}] {} {} {}/s",
                job.id,
                pct,
                job.filename,
                human_bytes(job.speed_bps)
            );
        }
        JobStatus::Completed => {
            println!("[{}] completed: {}", job.id, job.dest_path);
        }
        JobStatus::Failed => {
            println!(
                "[{}] failed: {}",
                job.id,
                job.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        JobStatus::Cancelled => println!("[{}] cancelled", job.id),
        JobStatus::Paused => println!("[{}] paused", job.id),
        JobStatus::Queued => println!("[{}] queued: {}", job.id, job.url),
    }
}

fn human_bytes(n: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
