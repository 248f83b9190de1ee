use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use configuration::{Config, LoggingSettings};
use database::{Database, Query};
use locking::{DatabaseLockManager, LockFamily};
use std::path::PathBuf;
use std::time::Duration;
use tabular::{CsvDataProvider, DataProvider, Value};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Database access tools for the hydrologic forecast verification store.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file; every setting has a default so it may be absent.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query and print its result as a table.
    Query(QueryArgs),
    /// Bulk load a delimited text file into a table.
    ImportCsv(ImportCsvArgs),
    /// Take a named lock, hold it for a while, then release it.
    Lock(LockArgs),
    /// Refresh planner statistics.
    Analyze(AnalyzeArgs),
    /// Verify that the database is reachable.
    Check,
}

#[derive(Parser)]
struct QueryArgs {
    /// The SQL to run. Parameters are `$1`, `$2`, ...
    sql: String,

    /// A positional parameter, bound as text. Repeat for more.
    #[arg(long = "param", short)]
    params: Vec<String>,

    /// Use the high-priority pool.
    #[arg(long)]
    high_priority: bool,

    /// Run in a SERIALIZABLE transaction, retrying on serialization failure.
    #[arg(long)]
    serializable: bool,

    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct ImportCsvArgs {
    /// The delimited file. Its first line names the columns unless `--columns` is given.
    #[arg(long, short)]
    file: PathBuf,

    /// Destination table, optionally schema-qualified.
    #[arg(long, short)]
    table: String,

    #[arg(long, short, default_value_t = ',')]
    delimiter: char,

    /// Column names, for files without a header line.
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
}

#[derive(Parser)]
struct LockArgs {
    /// Lock name, from 1 to 2147483646.
    name: i32,

    #[arg(long, value_enum, default_value_t = FamilyArg::Plain)]
    family: FamilyArg,

    /// Seconds to hold the lock before releasing it.
    #[arg(long, default_value_t = 10)]
    hold_secs: u64,
}

#[derive(Parser)]
struct AnalyzeArgs {
    /// Vacuum before analyzing.
    #[arg(long)]
    vacuum: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FamilyArg {
    Plain,
    Shared,
    Exclusive,
    Source,
}

impl From<FamilyArg> for LockFamily {
    fn from(family: FamilyArg) -> Self {
        match family {
            FamilyArg::Plain => LockFamily::Plain,
            FamilyArg::Shared => LockFamily::Shared,
            FamilyArg::Exclusive => LockFamily::Exclusive,
            FamilyArg::Source => LockFamily::Source,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = configuration::load_config_from(&cli.config)?;
    let _log_guard = init_logging(&config.logging)?;

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to the database")?;

    let outcome = match cli.command {
        Commands::Query(args) => handle_query(&db, args).await,
        Commands::ImportCsv(args) => handle_import_csv(&db, args).await,
        Commands::Lock(args) => handle_lock(&db, &config, args).await,
        Commands::Analyze(args) => db.refresh_statistics(args.vacuum).await.map_err(Into::into),
        Commands::Check => handle_check(&db).await,
    };

    db.close().await;
    outcome
}

/// Logs to stderr, and also to a daily rolling file when a directory is configured.
/// The returned guard flushes the file on drop.
fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let builder = FmtSubscriber::builder().with_env_filter(EnvFilter::from_default_env());

    match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (file, guard) = tracing_appender::non_blocking(appender);
            let subscriber = builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(None)
        }
    }
}

async fn handle_query(db: &Database, args: QueryArgs) -> Result<()> {
    let mut query = Query::new(args.sql)
        .with_parameters(args.params.into_iter().map(Value::Text).collect());
    if args.high_priority {
        query = query.high_priority();
    }
    if args.serializable {
        query = query.serializable();
    }

    let mut provider = db.buffer(&query).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&provider.to_json()?)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(provider.column_names()?);
    let mut rows = 0usize;
    while provider.next()? {
        let cells: Vec<String> = provider
            .row_values()?
            .iter()
            .map(|value| match value {
                Value::Null => "NULL".to_string(),
                other => other.to_string(),
            })
            .collect();
        table.add_row(cells);
        rows += 1;
    }
    provider.close();

    println!("{table}");
    println!("({rows} rows)");
    Ok(())
}

async fn handle_import_csv(db: &Database, args: ImportCsvArgs) -> Result<()> {
    let mut provider = if args.columns.is_empty() {
        CsvDataProvider::from_path(&args.file, args.delimiter)?
    } else {
        CsvDataProvider::from_path_with_columns(&args.file, args.delimiter, args.columns)?
    };

    let copied = db.copy_provider(&mut provider, &args.table, true).await?;
    println!("Copied {copied} rows from {} into {}.", args.file.display(), args.table);
    Ok(())
}

async fn handle_lock(db: &Database, config: &Config, args: LockArgs) -> Result<()> {
    let manager = db.lock_manager(config.locking.clone()).await?;
    let family = LockFamily::from(args.family);

    let held = hold_lock(&manager, family, args.name, Duration::from_secs(args.hold_secs)).await;
    manager.close().await;
    held
}

async fn hold_lock(
    manager: &DatabaseLockManager,
    family: LockFamily,
    name: i32,
    hold: Duration,
) -> Result<()> {
    match family {
        LockFamily::Plain => manager.lock(name).await?,
        LockFamily::Shared => manager.lock_shared(name).await?,
        LockFamily::Exclusive => manager.lock_exclusive(name).await?,
        LockFamily::Source => manager.lock_source(name).await?,
    }
    println!("Holding {family} lock {name} for {}s (Ctrl-C releases early).", hold.as_secs());

    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, releasing early.");
        }
    }

    match family {
        LockFamily::Plain => manager.unlock(name).await?,
        LockFamily::Shared => manager.unlock_shared(name).await?,
        LockFamily::Exclusive => manager.unlock_exclusive(name).await?,
        LockFamily::Source => manager.unlock_source(name).await?,
    }
    println!("Released {family} lock {name}.");
    Ok(())
}

async fn handle_check(db: &Database) -> Result<()> {
    let version = db
        .scalar(&Query::new("SELECT version()").high_priority())
        .await?
        .context("The server returned no version")?;
    println!("Connected: {version}");
    Ok(())
}
