use clap::Parser;
use pc98fur::{ConvertOptions, Converter, ParsedSong, SongReport, SourceFormat};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pc98fur")]
#[command(version = "0.1.0")]
#[command(about = "Convert PMD and MDRV2 songs to Furnace patterns and instruments", long_about = None)]
struct Args {
    /// Input .M or .MDT file
    input: PathBuf,

    /// Output file (JSON goes to stdout if not specified)
    output: Option<PathBuf>,

    /// Source format: pmd or mdt (guessed from the extension if not specified)
    #[arg(short, long)]
    format: Option<String>,

    /// Write a JSON report instead of the block bundle
    #[arg(short, long)]
    json: bool,

    /// zlib-compress the block bundle
    #[arg(short, long)]
    compress: bool,

    /// Source ticks per pattern row
    #[arg(long)]
    ticks_per_row: Option<u32>,

    /// Rows per pattern
    #[arg(long)]
    rows: Option<u32>,

    /// JSON file with conversion options
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), pc98fur::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let format = match &args.format {
        Some(name) => SourceFormat::from_name(name)?,
        None => SourceFormat::from_path(&args.input)?,
    };

    let mut options = match &args.config {
        Some(path) => ConvertOptions::load(path, format)?,
        None => ConvertOptions::for_format(format),
    };
    if let Some(tpr) = args.ticks_per_row {
        options.ticks_per_row = tpr;
    }
    if let Some(rows) = args.rows {
        options.rows_per_pattern = rows;
    }

    let data = std::fs::read(&args.input)?;
    let parsed = ParsedSong::load(data, format)?;
    tracing::info!(
        "{}: {} \"{}\", {} channels",
        args.input.display(),
        format.name(),
        parsed.title,
        parsed.channels.len()
    );

    let song = Converter::new(options).convert(&parsed)?;
    tracing::info!(
        "{} orders, {} instruments, {} recoveries",
        song.order_count,
        song.instruments.len(),
        song.recoveries.len()
    );

    if args.json {
        let report = SongReport::new(&song)?;
        let json = serde_json::to_string_pretty(&report)?;
        match &args.output {
            Some(path) => {
                let mut file = File::create(path)?;
                file.write_all(json.as_bytes())?;
                file.write_all(b"\n")?;
            }
            None => println!("{}", json),
        }
        return Ok(());
    }

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("blocks"));
    let file = BufWriter::new(File::create(&output)?);
    song.write_bundle(file, args.compress)?;
    tracing::info!("wrote {}", output.display());

    Ok(())
}
