use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use streamstack_core::{
    render_prometheus, ByteRange, FileSystemBackend, Statistic, Streamer, StreamerConfig,
};

#[derive(Parser)]
#[command(name = "sstream")]
#[command(about = "Read files through the StreamStack pipeline", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "SSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory registered as the `@root@` alias and used for relative paths
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Output format for statistics
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Prometheus,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read a byte range and write it to stdout or a file
    Read {
        path: String,
        #[arg(short, long, default_value = "0")]
        offset: u64,
        /// Bytes to read; the rest of the file when omitted
        #[arg(short, long)]
        length: Option<u64>,
        #[arg(short = 'O', long)]
        output: Option<PathBuf>,
    },
    /// Print the size of a file
    Size { path: String },
    /// Read whole files repeatedly and report timings and statistics
    Bench {
        paths: Vec<String>,
        #[arg(short, long, default_value = "2")]
        passes: u32,
    },
    /// Read files once and print pipeline statistics
    Stats { paths: Vec<String> },
}

impl Cli {
    pub fn load_config(&self) -> Result<StreamerConfig> {
        let mut config = match &self.config {
            Some(path) => StreamerConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => StreamerConfig::default(),
        };
        if let Some(root) = &self.root {
            config
                .aliases
                .insert("root".to_string(), root.to_string_lossy().into_owned());
            config.default_alias = Some("root".to_string());
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let streamer = Streamer::from_config(&config, Arc::new(FileSystemBackend::new()))?;
        let result = match &self.command {
            Command::Read {
                path,
                offset,
                length,
                output,
            } => read(&streamer, path, *offset, *length, output.as_deref()).await,
            Command::Size { path } => size(&streamer, path).await,
            Command::Bench { paths, passes } => {
                bench(&streamer, paths, *passes).await?;
                print_statistics(&streamer, self.format).await
            }
            Command::Stats { paths } => {
                for path in paths {
                    streamer
                        .read_to_vec(path, ByteRange::whole_file())
                        .await
                        .with_context(|| format!("reading {}", path))?;
                }
                print_statistics(&streamer, self.format).await
            }
        };
        streamer.shutdown().await;
        result
    }
}

async fn read(
    streamer: &Streamer,
    path: &str,
    offset: u64,
    length: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    let range = match length {
        Some(length) => ByteRange::new(offset, length),
        None => ByteRange::from_offset(offset),
    };
    let start = Instant::now();
    let data = streamer
        .read_to_vec(path, range)
        .await
        .with_context(|| format!("reading {} {}", path, range))?;
    tracing::info!(path, bytes = data.len(), elapsed = ?start.elapsed(), "read complete");

    match output {
        Some(file) => std::fs::write(file, &data)
            .with_context(|| format!("writing {}", file.display()))?,
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

async fn size(streamer: &Streamer, path: &str) -> Result<()> {
    let completion = streamer.get_file_size(path)?.wait().await?;
    match completion.file_size {
        Some(size) => println!("{}", size),
        None => anyhow::bail!("no size reported for {}", path),
    }
    Ok(())
}

async fn bench(streamer: &Streamer, paths: &[String], passes: u32) -> Result<()> {
    if paths.is_empty() {
        anyhow::bail!("bench needs at least one path");
    }
    for pass in 1..=passes {
        let start = Instant::now();
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let buffer = streamstack_core::ReadBuffer::new();
            let handle = streamer.read(
                path,
                ByteRange::whole_file(),
                buffer,
                streamstack_core::RequestOptions::default(),
            )?;
            handles.push((path, handle));
        }
        let mut total = 0u64;
        for (path, handle) in handles {
            let completion = handle
                .wait()
                .await
                .with_context(|| format!("reading {}", path))?;
            total += completion.bytes_delivered;
        }
        let elapsed = start.elapsed();
        let mib_per_sec = total as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64().max(1e-9);
        println!(
            "pass {}: {} files, {} bytes in {:.3} ms ({:.1} MiB/s)",
            pass,
            paths.len(),
            total,
            elapsed.as_secs_f64() * 1000.0,
            mib_per_sec
        );
    }
    Ok(())
}

async fn print_statistics(streamer: &Streamer, format: OutputFormat) -> Result<()> {
    let stats = streamer.collect_statistics().await?;
    print!("{}", format_statistics(&stats, format)?);
    Ok(())
}

pub fn format_statistics(stats: &[Statistic], format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(stats)?),
        OutputFormat::Prometheus => render_prometheus(stats),
        OutputFormat::Table => {
            let mut out = format!("{:<12} {:<28} {:>16}\n", "LAYER", "STATISTIC", "VALUE");
            for stat in stats {
                out.push_str(&format!(
                    "{:<12} {:<28} {:>16}\n",
                    stat.layer,
                    stat.name,
                    format_value(stat.value.as_f64())
                ));
            }
            out
        }
    })
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.3}", value)
    }
}
