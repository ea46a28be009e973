use anyhow::{bail, Error};
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use tracing::{debug, instrument};

use seqsched::telemetry;
use seqsched::{SchedConfig, Scheduler};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'd',
        long = "database",
        help = "SQLite scheduler file",
        default_value = "seqsched.sqlite3"
    )]
    database: PathBuf,

    #[arg(
        short = 'o',
        long = "output_dir",
        help = "Directory for product reports",
        default_value = "prods"
    )]
    output_dir: PathBuf,

    #[arg(
        short = 'n',
        long = "max_connections",
        help = "Number of Store Connections",
        default_value = "5"
    )]
    max_connections: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
enum Command {
    /// Register a profile database file
    Register { file: PathBuf },
    /// Submit the sequences of a FASTA file as one job
    Submit {
        #[arg(long = "db-id")]
        db_id: i64,
        #[arg(long = "multi-hits")]
        multi_hits: bool,
        #[arg(long = "hmmer3-compat")]
        hmmer3_compat: bool,
        fasta: PathBuf,
    },
    /// List registered databases
    Dbs,
    /// List all jobs
    Jobs,
    /// Show one job with its sequences and products
    Job { id: i64 },
    /// Import a tab-separated product file
    Import { file: PathBuf },
}

#[instrument(skip(config))]
async fn run(config: ConfigContext) -> Result<(), Error> {
    let sched_config = SchedConfig::new(&config.database)
        .with_output_dir(&config.output_dir)
        .with_max_connections(config.max_connections);
    let sched = Scheduler::open(&sched_config).await?;
    debug!(command = ?config.command, "Running");

    match config.command {
        Command::Register { file } => {
            let db = sched.register_database(&file).await?;
            println!("{}\t{:016x}\t{}", db.id, db.hash64, db.filename);
        }
        Command::Submit {
            db_id,
            multi_hits,
            hmmer3_compat,
            fasta,
        } => {
            let content = tokio::fs::read_to_string(&fasta).await?;
            let seqs = parse_fasta(&content)?;
            let job = sched.submit_job(db_id, multi_hits, hmmer3_compat, seqs).await?;
            println!("{}\t{}", job.id, job.state);
        }
        Command::Dbs => {
            sched
                .catalog()
                .list_all(|db| println!("{}\t{:016x}\t{}", db.id, db.hash64, db.filename))
                .await?;
        }
        Command::Jobs => {
            sched
                .jobs()
                .get_all(|job| println!("{}\t{}\t{}\t{}", job.id, job.db_id, job.state, job.error))
                .await?;
        }
        Command::Job { id } => {
            let job = sched.jobs().get(id).await?;
            println!("{:#?}", job);
            sched
                .jobs()
                .get_sequences(id, |seq| println!("seq\t{}\t{}\t{}", seq.id, seq.name, seq.data.len()))
                .await?;
            sched
                .jobs()
                .get_products(id, |prod| {
                    println!(
                        "prod\t{}\t{}\t{}\t{}\t{}",
                        prod.id, prod.seq_id, prod.profile_name, prod.alt_loglik, prod.null_loglik
                    )
                })
                .await?;
        }
        Command::Import { file } => {
            let count = sched.prods().add_file(&file).await?;
            println!("{}", count);
        }
    }

    sched.close().await;
    Ok(())
}

/// Splits FASTA text into `(name, sequence)` pairs. The name is the first
/// word of the header line.
fn parse_fasta(content: &str) -> Result<Vec<(String, String)>, Error> {
    let mut seqs: Vec<(String, String)> = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let name = header.split_whitespace().next().unwrap_or_default();
            seqs.push((name.to_string(), String::new()));
        } else if let Some((_, data)) = seqs.last_mut() {
            data.push_str(line);
        } else {
            bail!("line {}: sequence data before the first header", lineno + 1);
        }
    }
    Ok(seqs)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "seqsched=debug");
    }

    telemetry::init(None)?;

    let config = ConfigContext::parse();
    let result = run(config).await;

    telemetry::shutdown();

    Ok(result?)
}
