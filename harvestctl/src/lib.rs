use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use harvest_core::browser::{BrowserError, ChromiumLauncher, LaunchOverrides};
use harvest_core::{
    load_harvest_config, preview_batch, BatchSource, Cursor, CursorStore, HarvestConfig,
    HarvestEngine, PageBatch, RunOverrides, RunReport, SqliteStateStore,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] harvest_core::ConfigError),
    #[error("state error: {0}")]
    State(#[from] harvest_core::StateError),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("{0}")]
    Engine(#[from] harvest_core::EngineError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental listing harvester", long_about = None)]
pub struct Cli {
    /// Path to harvest.toml
    #[arg(long, default_value = "configs/harvest.toml")]
    pub config: PathBuf,
    /// Base directory for relative data paths (defaults to the working directory)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the next batch of listing pages
    Run(RunArgs),
    /// Inspects or rewrites the stored cursor
    #[command(subcommand)]
    Cursor(CursorCommands),
    /// Shows the batch the next run would process, without navigating
    Plan(PlanArgs),
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Process this page instead of the stored cursor; nothing is persisted
    #[arg(long)]
    pub page: Option<u32>,
    #[arg(long)]
    pub max_pages: Option<u32>,
    #[arg(long)]
    pub max_results: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<u32>,
    /// Launch a visible browser window
    #[arg(long, default_value_t = false)]
    pub headed: bool,
}

#[derive(Subcommand, Debug)]
pub enum CursorCommands {
    /// Prints the stored cursor
    Show,
    /// Points the cursor at a page (default 1)
    Reset(CursorResetArgs),
}

#[derive(Args, Debug)]
pub struct CursorResetArgs {
    #[arg(long, default_value_t = 1)]
    pub page: u32,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[arg(long)]
    pub page: Option<u32>,
}

pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "harvestctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let report = context.run_batch(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Cursor(CursorCommands::Show) => {
            let view = context.cursor_show()?;
            render(&view, cli.format)?;
        }
        Commands::Cursor(CursorCommands::Reset(args)) => {
            let view = context.cursor_reset(args.page)?;
            render(&view, cli.format)?;
        }
        Commands::Plan(args) => {
            let view = context.plan(args)?;
            render(&view, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: HarvestConfig,
    base_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_harvest_config(&cli.config)?;
        let base_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(Self { config, base_dir })
    }

    fn database_path(&self) -> PathBuf {
        self.config
            .resolve_path(&self.base_dir, &self.config.state.database)
    }

    fn state_store(&self) -> Result<Arc<SqliteStateStore>> {
        let store = SqliteStateStore::new(self.database_path())?;
        store.initialize()?;
        Ok(Arc::new(store))
    }

    fn cursors(&self) -> Result<CursorStore> {
        Ok(CursorStore::new(
            self.state_store()?,
            self.config.state.cursor_key.clone(),
        ))
    }

    async fn run_batch(&self, args: &RunArgs) -> Result<RunReport> {
        let mut config = self.config.clone();
        RunOverrides {
            page: args.page,
            max_pages: args.max_pages,
            max_results: args.max_results,
            batch_size: args.batch_size,
        }
        .apply(&mut config)?;

        let launcher = ChromiumLauncher::new(config.browser.clone());
        let mut engine = HarvestEngine::from_config(config, &self.base_dir)?;
        if let Some(report) = engine.exhausted_report()? {
            return Ok(report);
        }
        let session = launcher
            .launch_with_overrides(LaunchOverrides {
                headless: args.headed.then_some(false),
            })
            .await?;

        let result = engine.run(&session).await;
        if let Err(err) = session.shutdown().await {
            warn!(error = %err, "browser shutdown failed");
        }
        Ok(result?)
    }

    fn cursor_show(&self) -> Result<CursorView> {
        let cursors = self.cursors()?;
        let cursor = cursors.load()?;
        Ok(CursorView {
            key: cursors.key().to_string(),
            database: self.database_path(),
            cursor,
        })
    }

    fn cursor_reset(&self, page: u32) -> Result<CursorView> {
        let cursors = self.cursors()?;
        let cursor = Cursor::starting_at(page);
        cursors.save(&cursor)?;
        Ok(CursorView {
            key: cursors.key().to_string(),
            database: self.database_path(),
            cursor,
        })
    }

    fn plan(&self, args: &PlanArgs) -> Result<PlanView> {
        let mut config = self.config.clone();
        RunOverrides {
            page: args.page,
            ..Default::default()
        }
        .apply(&mut config)?;
        let (cursor, batch, source) = preview_batch(self.state_store()?, &config)?;
        Ok(PlanView {
            exhausted: batch.is_empty(),
            cursor,
            batch,
            source,
            max_pages: config.run.max_pages,
            batch_size: config.run.batch_size,
        })
    }
}

#[derive(Debug, Serialize)]
struct CursorView {
    key: String,
    database: PathBuf,
    cursor: Cursor,
}

impl DisplayFallback for CursorView {
    fn display(&self) -> String {
        let last_run = self
            .cursor
            .last_run_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let context = if self.cursor.search_context.is_empty() {
            "-"
        } else {
            self.cursor.search_context.as_str()
        };
        format!(
            "cursor {} ({})\n  next page: {}\n  last page: {}\n  last run:  {}\n  search:    {}",
            self.key,
            display_path(&self.database),
            self.cursor.next_page,
            self.cursor.last_page,
            last_run,
            context
        )
    }
}

#[derive(Debug, Serialize)]
struct PlanView {
    cursor: Cursor,
    batch: PageBatch,
    source: BatchSource,
    max_pages: u32,
    batch_size: u32,
    exhausted: bool,
}

impl DisplayFallback for PlanView {
    fn display(&self) -> String {
        if self.exhausted {
            return format!(
                "nothing to do: next page {} is past max_pages {}",
                self.cursor.next_page, self.max_pages
            );
        }
        format!(
            "next batch ({:?}): pages {}\n  batch size: {}\n  max pages:  {}",
            self.source,
            join_pages(&self.batch),
            self.batch_size,
            self.max_pages
        )
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        if self.batch.is_empty() {
            return format!("run {}: all pages processed, nothing to do", self.run_id);
        }
        let mut lines = vec![format!(
            "run {} ({}): pages {}",
            self.run_id,
            self.state,
            join_pages(&self.batch)
        )];
        for page in &self.pages {
            lines.push(format!(
                "  page {:>3}: {} links, {} visited, {} saved, {} skipped, {} failed{}",
                page.page_number,
                page.links_found,
                page.links_visited,
                page.saved,
                page.skipped,
                page.failed,
                if page.rerendered { " (re-rendered)" } else { "" }
            ));
        }
        if !self.filters.failed.is_empty() {
            lines.push(format!("  filters failed: {}", self.filters.failed.len()));
        }
        if let Some(page) = self.stopped_at {
            lines.push(format!("  stopped early at page {page}"));
        }
        lines.push(format!(
            "  records: {} ({:.0}% structured), forwarded {} / failed {}",
            self.metrics.records_delivered,
            self.metrics.structured_rate(),
            self.metrics.forward_sent,
            self.metrics.forward_failed
        ));
        match &self.cursor_after {
            Some(cursor) => lines.push(format!("  cursor -> next page {}", cursor.next_page)),
            None => lines.push("  cursor not persisted".to_string()),
        }
        lines.join("\n")
    }
}

fn join_pages(batch: &PageBatch) -> String {
    batch
        .iter()
        .map(|page| page.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
