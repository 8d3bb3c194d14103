use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use log::info;
use serde_json::json;

use spectident::broad::BroadIndex;
use spectident::{
    BuildState, ChemicalRecord, EmbeddingGenerator, EmbeddingSpace, EngineConfig, Peak,
    SpectralEngine,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// JSON settings file, missing fields take their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Word2vec text file holding the peak token vectors
    #[arg(short, long, global = true, default_value = "models/spec2vec.txt")]
    space: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the broad index, or load it if it already exists
    BuildIndex,
    /// Report the broad index status
    Status,
    /// Search a peak list against the broad index
    Search {
        /// JSON array of {"mz": .., "intensity": ..} objects
        peaks: PathBuf,
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
    },
    /// Run every reference library analysis for a peak list
    Identify {
        /// Reference spectra, MGF or MSP
        #[arg(short, long)]
        reference: PathBuf,
        /// JSON array of chemical records, one object of column name to value per row
        #[arg(long)]
        records: Option<PathBuf>,
        /// JSON array of {"mz": .., "intensity": ..} objects
        peaks: PathBuf,
        #[arg(short, long)]
        precursor: Option<f64>,
        #[arg(short, long)]
        tolerance: Option<f64>,
        #[arg(short = 'n', long)]
        top_n: Option<usize>,
    },
}

fn read_peaks(path: &Path) -> Result<Vec<Peak>, Box<dyn Error>> {
    let handle = io::BufReader::new(fs::File::open(path)?);
    Ok(serde_json::from_reader(handle)?)
}

fn read_records(path: &Path) -> Result<Vec<ChemicalRecord>, Box<dyn Error>> {
    let handle = io::BufReader::new(fs::File::open(path)?);
    let rows: Vec<IndexMap<String, String>> = serde_json::from_reader(handle)?;
    Ok(rows.iter().map(ChemicalRecord::from_row).collect())
}

fn open_broad_index(config: &EngineConfig, space: &Path) -> Result<BroadIndex, Box<dyn Error>> {
    let generator = EmbeddingGenerator::new(Arc::new(EmbeddingSpace::from_path(space)?));
    Ok(BroadIndex::from_config(generator, &config.broad)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::BuildIndex => {
            let index = open_broad_index(&config, &cli.space)?;
            index.start_build();
            let mut last = None;
            loop {
                let status = index.status();
                if status.state != BuildState::Building {
                    break;
                }
                if last != Some(status.progress) {
                    info!("{:>3}% {}", status.progress, status.message);
                    last = Some(status.progress);
                }
                thread::sleep(Duration::from_millis(250));
            }
            let status = index.wait();
            print_json(&status)?;
            if status.state == BuildState::Error {
                std::process::exit(1);
            }
        }
        Command::Status => {
            let index = open_broad_index(&config, &cli.space)?;
            index.try_load()?;
            print_json(&index.status())?;
        }
        Command::Search { peaks, top_n } => {
            let index = open_broad_index(&config, &cli.space)?;
            index.try_load()?;
            let peaks = read_peaks(&peaks)?;
            let hits = index.search(&peaks, top_n.unwrap_or(config.top_n))?;
            print_json(&hits)?;
        }
        Command::Identify {
            reference,
            records,
            peaks,
            precursor,
            tolerance,
            top_n,
        } => {
            let records = match records {
                Some(path) => read_records(&path)?,
                None => Vec::new(),
            };
            let engine = SpectralEngine::from_paths(config, &cli.space, &reference, records)?;
            let peaks = read_peaks(&peaks)?;
            let report = json!({
                "exact_match": engine.exact_match(&peaks, precursor, tolerance, top_n),
                "embedding_match": engine.embedding_match(&peaks, top_n),
                "novelty": engine.novelty(&peaks)?,
                "projection": engine.project_query(&peaks, "Query")?,
            });
            print_json(&report)?;
        }
    }
    Ok(())
}
