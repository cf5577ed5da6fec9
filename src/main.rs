use clap::{Parser, Subcommand};
use ecstore::{FsTransport, Reader, ReaderConfig};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "ecstore")]
#[command(about = "Read objects from an erasure-coded object store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a byte range of an object
    Read {
        /// Offset of the first byte
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to read
        #[arg(short, long)]
        length: usize,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Configuration file path
        #[arg(short, long, default_value = "config/reader.yaml")]
        config: PathBuf,
    },
    /// Read a whole object, block by block, until its end
    Cat {
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Configuration file path
        #[arg(short, long, default_value = "config/reader.yaml")]
        config: PathBuf,
    },
    /// Open an object and print what was found as JSON
    Inspect {
        /// Configuration file path
        #[arg(short, long, default_value = "config/reader.yaml")]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Read {
            offset,
            length,
            output,
            config,
        } => {
            let reader = open_reader(&config).await?;
            let mut buf = vec![0u8; length];
            let copied = reader.read(offset, &mut buf).await?;
            reader.close().await?;

            let mut out = sink(output.as_deref())?;
            out.write_all(&buf[..copied])?;
            out.flush()?;
            info!("Read {} at offset {}", format_bytes(copied as u64), offset);
            Ok(())
        }
        Commands::Cat { output, config } => {
            let reader = open_reader(&config).await?;
            let block_size = usize::try_from(reader.config().block_size)?;
            let mut out = sink(output.as_deref())?;
            let mut buf = vec![0u8; block_size];
            let mut offset = 0u64;

            // a short block is the last one
            loop {
                let copied = reader.read(offset, &mut buf).await?;
                out.write_all(&buf[..copied])?;
                offset += copied as u64;
                if copied < block_size {
                    break;
                }
            }
            out.flush()?;
            reader.close().await?;

            info!("Object size: {}", format_bytes(offset));
            Ok(())
        }
        Commands::Inspect { config } => {
            let reader_config = ReaderConfig::from_file(&config)?;
            let reader = Reader::from_config(reader_config, Arc::new(FsTransport::new()))?;
            let summary = reader.open().await?;
            reader.close().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Version => {
            println!("ecstore v{}", env!("CARGO_PKG_VERSION"));
            println!("Erasure-coded object store reader");
            Ok(())
        }
    }
}

async fn open_reader(config: &Path) -> anyhow::Result<Reader> {
    info!("Loading configuration from {:?}", config);
    let reader_config = ReaderConfig::from_file(config)?;
    let reader = Reader::from_config(reader_config, Arc::new(FsTransport::new()))?;
    let summary = reader.open().await?;
    info!(
        "Metadata from {} after {} attempt(s), {} chunks",
        summary.metadata_url, summary.metadata_attempts, summary.chunks
    );
    Ok(reader)
}

fn sink(output: Option<&Path>) -> io::Result<Box<dyn Write>> {
    Ok(match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout().lock()),
    })
}

/// Format bytes in a human-readable format
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
