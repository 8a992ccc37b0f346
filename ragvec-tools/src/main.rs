// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RagVec CLI
//!
//! Operate a retrieval engine data directory from the shell. All output is
//! JSON on stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Write a config with defaults
//! ragvec init-config ragvec.toml --dimension 768
//!
//! # Ingest JSON lines: {"vector": [...], "metadata": {...}, "source_type": "pdf"}
//! ragvec --config ragvec.toml ingest chunks.jsonl
//!
//! # Top-5 among PDFs tagged as shipping content
//! ragvec --config ragvec.toml search '[0.1, 0.2, ...]' --k 5 --source pdf --where category=Shipping
//!
//! # Maintenance
//! ragvec --config ragvec.toml seal --elapsed
//! ragvec --config ragvec.toml reconcile
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ragvec_client::{EngineConfig, RetrievalEngine, SearchRequest};
use ragvec_core::{
    metadata_from_json, metadata_to_json, Clause, PartitionId, Predicate, RecordId, SourceType,
    TimeRange, Timestamp, VectorRecord,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// RagVec - partitioned vector retrieval
#[derive(Parser)]
#[command(name = "ragvec")]
#[command(about = "Operate a RagVec retrieval engine")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest JSON-lines records
    Ingest {
        /// Input file; stdin when omitted
        input: Option<PathBuf>,
    },

    /// Approximate (or exact) top-k search
    Search {
        /// Query vector as a JSON array, or @path to a file holding one
        vector: String,

        /// Number of results
        #[arg(short, long, default_value = "10")]
        k: usize,

        /// Restrict to source types (repeatable)
        #[arg(short, long = "source")]
        sources: Vec<SourceType>,

        /// Inclusive lower bound, milliseconds since the epoch
        #[arg(long)]
        from: Option<u64>,

        /// Exclusive upper bound, milliseconds since the epoch
        #[arg(long)]
        to: Option<u64>,

        /// Metadata clause such as `category=Shipping` or `page>=3` (repeatable)
        #[arg(short = 'w', long = "where")]
        clauses: Vec<Clause>,

        /// Candidate list size override
        #[arg(short = 'l', long)]
        list_size: Option<usize>,

        /// Brute-force search over stored records
        #[arg(long)]
        exact: bool,
    },

    /// Print one record
    Get { id: RecordId },

    /// Delete one record
    Delete { id: RecordId },

    /// Seal a partition, or every partition whose bucket has ended
    Seal {
        /// Partition id such as `pdf-1718236800000`
        partition: Option<PartitionId>,

        #[arg(long, conflicts_with = "partition")]
        elapsed: bool,
    },

    /// List partitions
    Partitions,

    /// Engine statistics
    Stats,

    /// Re-index unindexed records and apply retention
    Reconcile,

    /// Rewrite the record log without dead records
    Compact,

    /// Write a config file with default values
    InitConfig {
        output: PathBuf,

        #[arg(short, long)]
        dimension: Option<usize>,

        #[arg(long)]
        force: bool,
    },
}

/// One line of ingest input
#[derive(Debug, Deserialize)]
struct IngestLine {
    vector: Vec<f32>,
    #[serde(default)]
    metadata: serde_json::Value,
    source_type: SourceType,
    /// Milliseconds since the epoch
    #[serde(default)]
    created_at: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    if let Commands::InitConfig {
        output,
        dimension,
        force,
    } = &cli.command
    {
        return init_config(cli.data_dir.clone(), output, *dimension, *force);
    }

    let config = load_config(cli.config.as_ref(), cli.data_dir.clone())?;
    let engine = RetrievalEngine::open(config).context("failed to open engine")?;

    let result = run(&engine, cli.command);
    engine.close().context("failed to close engine")?;
    result
}

fn load_config(path: Option<&PathBuf>, data_dir: Option<PathBuf>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(match data_dir {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    })
}

fn init_config(
    data_dir: Option<PathBuf>,
    output: &PathBuf,
    dimension: Option<usize>,
    force: bool,
) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let mut config = EngineConfig::default();
    if let Some(dimension) = dimension {
        config.dimension = dimension;
    }
    if let Some(dir) = data_dir {
        config = config.with_data_dir(dir);
    }
    config.validate()?;
    config.save_to(output)?;
    info!(path = %output.display(), "Wrote config");
    Ok(())
}

fn run(engine: &RetrievalEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Ingest { input } => ingest(engine, input),
        Commands::Search {
            vector,
            k,
            sources,
            from,
            to,
            clauses,
            list_size,
            exact,
        } => {
            let mut request = SearchRequest::new(parse_vector(&vector)?, k).with_time_range(
                TimeRange {
                    start: from.map(Timestamp::from_millis),
                    end: to.map(Timestamp::from_millis),
                },
            );
            if !sources.is_empty() {
                request = request.with_sources(sources);
            }
            if !clauses.is_empty() {
                request = request
                    .with_predicate(clauses.into_iter().fold(Predicate::new(), Predicate::with));
            }
            if let Some(list_size) = list_size {
                request = request.with_list_size(list_size);
            }

            let response = if exact {
                engine.search_exact(&request)?
            } else {
                engine.search(&request)?
            };
            if response.degraded {
                warn!(
                    failures = response.failures.len(),
                    inconsistent = response.inconsistent_partitions.len(),
                    "Result set is degraded"
                );
            }
            let results: Vec<_> = response
                .results
                .iter()
                .map(|r| {
                    json!({
                        "record_id": r.record_id.to_string(),
                        "distance": r.distance,
                        "source_type": r.source_type,
                        "created_at": r.created_at,
                        "metadata": metadata_to_json(&r.metadata),
                    })
                })
                .collect();
            print_json(&json!({
                "results": results,
                "degraded": response.degraded,
                "failures": response.failures,
                "inconsistent_partitions": response
                    .inconsistent_partitions
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
                "partitions_searched": response.partitions_searched,
            }))
        }
        Commands::Get { id } => print_json(&record_json(&*engine.get(&id)?)),
        Commands::Delete { id } => {
            let partition = engine.delete(&id)?;
            print_json(&json!({ "deleted": id.to_string(), "partition": partition.to_string() }))
        }
        Commands::Seal { partition, elapsed } => match (partition, elapsed) {
            (Some(partition), _) => {
                let outcome = engine.seal(&partition)?;
                print_json(&json!({
                    "partition": partition.to_string(),
                    "outcome": format!("{:?}", outcome),
                }))
            }
            (None, true) => {
                let sealed = engine.seal_elapsed()?;
                print_json(&json!({
                    "sealed": sealed.iter().map(ToString::to_string).collect::<Vec<_>>()
                }))
            }
            (None, false) => bail!("pass a partition id or --elapsed"),
        },
        Commands::Partitions => print_json(&engine.partitions()),
        Commands::Stats => print_json(&engine.stats()),
        Commands::Reconcile => {
            let expired = engine.expire()?;
            let report = engine.reconcile()?;
            print_json(&json!({
                "expired": expired.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "report": report,
            }))
        }
        Commands::Compact => {
            let stats = engine.compact()?;
            print_json(&json!({
                "live_records": stats.live_records,
                "segments_before": stats.segments_before,
                "segments_after": stats.segments_after,
                "bytes_before": stats.bytes_before,
                "bytes_after": stats.bytes_after,
            }))
        }
        Commands::InitConfig { .. } => bail!("init-config runs without an engine"),
    }
}

fn ingest(engine: &RetrievalEngine, input: Option<PathBuf>) -> Result<()> {
    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut ingested = 0usize;
    let mut failed = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let outcome = serde_json::from_str::<IngestLine>(&line)
            .map_err(anyhow::Error::from)
            .and_then(|parsed| {
                let metadata = metadata_from_json(&parsed.metadata)?;
                let created_at = parsed
                    .created_at
                    .map(Timestamp::from_millis)
                    .unwrap_or_else(Timestamp::now);
                Ok(engine.ingest_at(parsed.vector, metadata, parsed.source_type, created_at)?)
            });
        match outcome {
            Ok(id) => {
                ingested += 1;
                println!("{}", json!({ "line": number + 1, "id": id.to_string() }));
            }
            Err(e) => {
                failed += 1;
                warn!(line = number + 1, error = %e, "Ingest failed");
                println!("{}", json!({ "line": number + 1, "error": e.to_string() }));
            }
        }
    }
    info!(ingested, failed, "Ingest complete");
    Ok(())
}

fn parse_vector(raw: &str) -> Result<Vec<f32>> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read query vector from {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("query vector must be a JSON array of numbers")
}

fn record_json(record: &VectorRecord) -> serde_json::Value {
    json!({
        "id": record.id.to_string(),
        "vector": record.vector,
        "metadata": metadata_to_json(&record.metadata),
        "source_type": record.source_type,
        "created_at": record.created_at,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
