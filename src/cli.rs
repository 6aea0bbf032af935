//! Strata CLI - drive the memory engine from the command line
//!
//! Usage:
//!   strata remember <owner> "content"     Store a memory
//!   strata recall <owner> [query]         Find memories
//!   strata forget <owner> <id>            Delete a memory
//!   strata consolidate <owner>            Run a promotion pass
//!   strata stats [owner]                  Tier counts, hit rates, bottlenecks
//!   strata scan [owner]                   Anomaly scan
//!   strata share <from> <to> <id>         Copy a memory to another owner
//!   strata patterns                       Tags shared across owners
//!   strata cache-clear                    Empty every cache level
//!
//! Only the LONG tier and the disk cache survive between invocations.

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use strata::{
    EngineConfig, MemoryEngine, MemoryItem, PersonaProfile, RecallQuery, RememberRequest,
    StorageConfig, Tier,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Strata - tiered memory for multi-agent assistants")]
#[command(version)]
struct Cli {
    /// Path to data directory
    #[arg(short, long, env = "STRATA_DATA_DIR", default_value = "./strata_data")]
    data_dir: PathBuf,

    /// JSON engine configuration
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Register an extra persona (repeatable)
    #[arg(short, long)]
    persona: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a memory for an owner
    Remember {
        owner: String,
        content: String,

        /// Target tier (default: short)
        #[arg(short, long, value_enum)]
        tier: Option<CliTier>,

        /// Importance (0.0-1.0); scored automatically when omitted
        #[arg(short, long)]
        importance: Option<f32>,

        /// Add tags
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Expire after this many seconds
        #[arg(long)]
        ttl_secs: Option<i64>,
    },

    /// Recall memories for an owner
    Recall {
        owner: String,

        /// Search text; empty matches everything
        #[arg(default_value = "")]
        query: String,

        #[arg(short, long, value_enum)]
        tier: Option<CliTier>,

        /// Require tags
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(short, long, default_value = "0")]
        min_importance: f32,

        /// Maximum results
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Rank by similarity instead of keyword match
        #[arg(short, long)]
        semantic: bool,
    },

    /// Delete a memory
    Forget { owner: String, id: String },

    /// Promote and expire memories for an owner
    Consolidate { owner: String },

    /// Show statistics
    Stats { owner: Option<String> },

    /// Run the anomaly detector
    Scan { owner: Option<String> },

    /// Copy a memory into another owner's store
    Share { from: String, to: String, id: String },

    /// Tags present in the long-term memory of several owners
    Patterns,

    /// Empty every cache level
    CacheClear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CliTier {
    Short,
    Medium,
    Long,
}

impl From<CliTier> for Tier {
    fn from(cli: CliTier) -> Self {
        match cli {
            CliTier::Short => Tier::Short,
            CliTier::Medium => Tier::Medium,
            CliTier::Long => Tier::Long,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info,strata=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let engine = open_engine(&cli).await?;
    let result = run(&engine, cli.command).await;
    engine.shutdown().await;
    result
}

async fn open_engine(cli: &Cli) -> anyhow::Result<MemoryEngine> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if config.storage.data_dir.is_none() {
        config.storage = StorageConfig::at(&cli.data_dir);
    }
    // One-shot commands; maintenance runs explicitly
    config.workers.enabled = false;
    for name in &cli.persona {
        if !config.personas.iter().any(|p| &p.name == name) {
            config.personas.push(PersonaProfile::new(name.as_str()));
        }
    }

    let engine = MemoryEngine::open(config).await?;

    // Owners with persisted memories are known without configuration
    let persisted = engine.long_term_store().owners().await?;
    for owner in persisted {
        if !engine.orchestrator().owners().await.contains(&owner) {
            engine
                .orchestrator()
                .register_persona(PersonaProfile::new(owner))
                .await?;
        }
    }
    Ok(engine)
}

/// Commands naming an owner register it on the fly
async fn ensure_owner(engine: &MemoryEngine, owner: &str) -> anyhow::Result<()> {
    if !engine.orchestrator().owners().await.iter().any(|o| o == owner) {
        engine
            .orchestrator()
            .register_persona(PersonaProfile::new(owner))
            .await?;
    }
    Ok(())
}

async fn run(engine: &MemoryEngine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Remember {
            owner,
            content,
            tier,
            importance,
            tags,
            ttl_secs,
        } => cmd_remember(engine, owner, content, tier, importance, tags, ttl_secs).await,
        Commands::Recall {
            owner,
            query,
            tier,
            tags,
            min_importance,
            limit,
            semantic,
        } => {
            let mut recall = RecallQuery::new(query)
                .min_importance(min_importance)
                .limit(limit)
                .semantic(semantic);
            recall.tags = tags;
            recall.tier = tier.map(Into::into);
            cmd_recall(engine, owner, recall).await
        }
        Commands::Forget { owner, id } => cmd_forget(engine, owner, id).await,
        Commands::Consolidate { owner } => cmd_consolidate(engine, owner).await,
        Commands::Stats { owner } => cmd_stats(engine, owner).await,
        Commands::Scan { owner } => cmd_scan(engine, owner).await,
        Commands::Share { from, to, id } => cmd_share(engine, from, to, id).await,
        Commands::Patterns => cmd_patterns(engine).await,
        Commands::CacheClear => {
            engine.cache().clear().await?;
            println!("{}", "Cache cleared".green());
            Ok(())
        }
    }
}

async fn cmd_remember(
    engine: &MemoryEngine,
    owner: String,
    content: String,
    tier: Option<CliTier>,
    importance: Option<f32>,
    tags: Vec<String>,
    ttl_secs: Option<i64>,
) -> anyhow::Result<()> {
    ensure_owner(engine, &owner).await?;

    let mut request = RememberRequest::new(content).tags(tags);
    if let Some(tier) = tier {
        request = request.tier(tier.into());
    }
    if let Some(importance) = importance {
        request = request.importance(importance);
    }
    if let Some(secs) = ttl_secs {
        let ttl = chrono::Duration::try_seconds(secs)
            .ok_or_else(|| anyhow::anyhow!("--ttl-secs {secs} is out of range"))?;
        request = request.ttl(ttl);
    }

    let id = engine.orchestrator().remember(&owner, request).await?;
    let item = engine.orchestrator().get(&owner, &id).await?;

    println!("{}", "Memory stored".green().bold());
    println!("  ID: {}", id.cyan());
    if let Some(item) = item {
        println!("  Tier: {}", item.tier);
        println!("  Importance: {:.2}", item.importance);
        if item.tier != Tier::Long {
            println!(
                "  {}",
                "Only the long tier persists after this command exits".dimmed()
            );
        }
    }
    Ok(())
}

async fn cmd_recall(engine: &MemoryEngine, owner: String, query: RecallQuery) -> anyhow::Result<()> {
    ensure_owner(engine, &owner).await?;
    let results = engine.orchestrator().recall(&owner, &query).await?;

    if results.is_empty() {
        println!("{}", "No memories found".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("Found {} memories:", results.len()).bold().green()
    );
    println!();
    for (i, item) in results.iter().enumerate() {
        print_item(i + 1, item);
    }
    Ok(())
}

fn print_item(position: usize, item: &MemoryItem) {
    let importance = format!("{:.2}", item.importance);
    let importance = if item.importance >= 0.8 {
        importance.green()
    } else if item.importance >= 0.5 {
        importance.yellow()
    } else {
        importance.red()
    };
    let text = item.content.searchable_text();
    println!(
        "{}. {} ({} - {} - importance: {})",
        position,
        text.chars().take(60).collect::<String>(),
        item.tier.to_string().cyan(),
        item.id.chars().take(8).collect::<String>().dimmed(),
        importance
    );
    if !item.tags.is_empty() {
        let tags: Vec<&str> = item.tags.iter().map(String::as_str).collect();
        println!("   tags: {}", tags.join(", ").dimmed());
    }
}

async fn cmd_forget(engine: &MemoryEngine, owner: String, id: String) -> anyhow::Result<()> {
    ensure_owner(engine, &owner).await?;
    if engine.orchestrator().forget(&owner, &id).await? {
        println!("{}", format!("Forgot {id}").green());
    } else {
        println!("{}", format!("No memory {id} for {owner}").yellow());
    }
    Ok(())
}

async fn cmd_consolidate(engine: &MemoryEngine, owner: String) -> anyhow::Result<()> {
    ensure_owner(engine, &owner).await?;
    let report = engine.orchestrator().consolidate(&owner).await?;

    println!("{}", "Consolidation complete".bold().green());
    println!("  Promoted: {}", report.promoted);
    println!("  Expired: {}", report.expired);
    println!("  Duration: {}ms", report.duration_ms);
    if !report.errors.is_empty() {
        println!("  {}", format!("Errors: {}", report.errors.len()).red());
        for error in &report.errors {
            println!("    {} {:?}: {}", error.item_id.dimmed(), error.stage, error.message);
        }
    }
    Ok(())
}

async fn cmd_stats(engine: &MemoryEngine, owner: Option<String>) -> anyhow::Result<()> {
    if let Some(owner) = &owner {
        ensure_owner(engine, owner).await?;
    }
    let stats = engine.orchestrator().get_statistics(owner.as_deref()).await?;

    println!("{}", "Strata Statistics".bold());
    println!();
    for owner in &stats.owners {
        println!("{}", owner.owner.cyan().bold());
        for tier in &owner.tiers {
            println!(
                "  {:<7} {:>5} / {:<5} ({:.0}%)",
                tier.tier.to_string(),
                tier.count,
                tier.capacity,
                tier.utilization * 100.0
            );
        }
    }
    println!();
    println!(
        "Cache: {} lookups, hit rate {:.0}%",
        stats.cache.total_requests,
        stats.cache_hit_rate * 100.0
    );
    println!(
        "Prefetch: {} hits, {} misses",
        stats.prefetch.prefetch_hits, stats.prefetch.prefetch_misses
    );

    if stats.bottlenecks.is_empty() {
        println!("{}", "No bottlenecks detected".green());
    } else {
        println!("{}", "Bottlenecks:".yellow().bold());
        for bottleneck in &stats.bottlenecks {
            println!("  - {bottleneck}");
        }
    }
    Ok(())
}

async fn cmd_scan(engine: &MemoryEngine, owner: Option<String>) -> anyhow::Result<()> {
    if let Some(owner) = &owner {
        ensure_owner(engine, owner).await?;
    }
    let report = engine
        .orchestrator()
        .scan_anomalies(owner.as_deref())
        .await?;

    println!("Scanned {} memories", report.scanned);
    if report.reports.is_empty() {
        println!("{}", "No anomalies found".green());
        return Ok(());
    }
    for finding in &report.reports {
        println!(
            "{} {} {} (score {:.2}): {} -> {:?}",
            finding.anomaly_type.to_string().red(),
            finding.owner.cyan(),
            finding.item_id.chars().take(8).collect::<String>().dimmed(),
            finding.score,
            finding.reason,
            finding.recommended_action
        );
    }
    if report.rule_failures > 0 {
        println!(
            "{}",
            format!("{} rule evaluations failed", report.rule_failures).yellow()
        );
    }
    Ok(())
}

async fn cmd_share(engine: &MemoryEngine, from: String, to: String, id: String) -> anyhow::Result<()> {
    ensure_owner(engine, &from).await?;
    ensure_owner(engine, &to).await?;
    let copy = engine.orchestrator().share_memory(&from, &to, &id).await?;
    println!("{}", "Memory shared".green().bold());
    println!("  {} -> {}", from.cyan(), to.cyan());
    println!("  Copy ID: {}", copy.cyan());
    Ok(())
}

async fn cmd_patterns(engine: &MemoryEngine) -> anyhow::Result<()> {
    let patterns = engine.orchestrator().extract_patterns().await;
    if patterns.is_empty() {
        println!("{}", "No shared patterns".yellow());
        return Ok(());
    }
    for pattern in &patterns {
        println!(
            "{} shared by {} ({} memories)",
            pattern.tag.bold(),
            pattern.owners.join(", ").cyan(),
            pattern.occurrences
        );
    }
    Ok(())
}
