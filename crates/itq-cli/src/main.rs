use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use itq_core::{BucketOrder, Issue, Property};
use itq_report::{ReportConfig, ReportPipeline, TriageReport};
use itq_storage::{FsIssueStore, IssueStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "itq")]
#[command(about = "Fetch, group and report on issue tracker queries")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags that win over the `ITQ_*` environment.
#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    project: Option<String>,
    #[arg(long, global = true)]
    label: Option<String>,
    #[arg(long, global = true)]
    query: Option<String>,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[arg(long, global = true)]
    page_size: Option<usize>,
}

impl Overrides {
    fn apply(self, mut config: ReportConfig) -> ReportConfig {
        if let Some(project) = self.project {
            config.project = project;
        }
        if let Some(label) = self.label {
            config.label = Some(label);
        }
        if let Some(query) = self.query {
            config.query = Some(query);
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size.max(1);
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List every issue matching the query.
    Fetch {
        /// One JSON object per line instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Bucket issues by a property and print the counts.
    Group {
        property: Property,
        #[arg(long)]
        by_size: bool,
        /// Group what the last refresh stored instead of fetching.
        #[arg(long)]
        stored: bool,
    },
    /// Build the triage report and write it to the reports directory.
    Report {
        /// Print the markdown brief to stdout.
        #[arg(long)]
        print: bool,
    },
    /// Replace the local store with a fresh fetch.
    Refresh,
}

fn init_logging(level: &str) {
    // RUST_LOG still wins over the configured level.
    let default = format!("{level},itq={level},reqwest=warn,hyper=warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn stored_issues(store: &FsIssueStore, label: Option<&str>) -> Result<Vec<Issue>> {
    let issues = match label {
        Some(label) => store.issues_with_label(label).await,
        None => store.all_issues().await,
    };
    issues.with_context(|| format!("reading stored issues from {}", store.root().display()))
}

async fn run(pipeline: &ReportPipeline, command: Commands) -> Result<()> {
    let config = pipeline.config();
    match command {
        Commands::Fetch { json } => {
            let issues = pipeline.fetch_issues().await?;
            for issue in &issues {
                if json {
                    println!("{}", serde_json::to_string(issue).context("serializing issue")?);
                } else {
                    println!("{}\t{}\t{}\t{}", issue.id, issue.stars, issue.status, issue.title);
                }
            }
            if !json {
                println!("Found: {}", issues.len());
            }
        }
        Commands::Group {
            property,
            by_size,
            stored,
        } => {
            let issues = if stored {
                let store = FsIssueStore::new(config.data_dir.clone());
                stored_issues(&store, config.label.as_deref()).await?
            } else {
                pipeline.fetch_issues().await?
            };
            let order = if by_size {
                BucketOrder::BySize
            } else {
                BucketOrder::ByKey
            };
            for bucket in property.summarize(&issues, order) {
                println!("{}: {}", bucket.key, bucket.count);
            }
        }
        Commands::Report { print } => {
            if print {
                let issues = pipeline.fetch_issues().await?;
                let report = TriageReport::build(&config.project, &issues, config.current_milestone);
                print!("{}", report.to_markdown());
            } else {
                let summary = pipeline.run_report().await?;
                println!(
                    "report complete: run_id={} project={} issues={} reports={}",
                    summary.run_id, summary.project, summary.total_issues, summary.reports_dir
                );
            }
        }
        Commands::Refresh => {
            let store = FsIssueStore::new(config.data_dir.clone());
            let summary = pipeline.run_refresh(&store).await?;
            println!(
                "refresh complete: issues={} batches={} last_update={}",
                summary.stored_issues, summary.batches, summary.started_at
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.overrides.apply(ReportConfig::from_env());
    init_logging(&config.log_level);
    info!(project = %config.project, workers = config.workers, "starting");

    let pipeline = ReportPipeline::new(config)?;
    let outcome = run(&pipeline, cli.command.unwrap_or(Commands::Report { print: false })).await;
    pipeline.shutdown().await;
    outcome
}
