//! Repository commands: list/add/remove/enable/disable, sync and search

use anyhow::{bail, Result};
use clap::Subcommand;
use std::io::Write;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

use crate::app::App;
use modsync_core::model::CatalogEntry;
use modsync_core::repo::{ModuleMap, RepoSummary, RepositoryAggregator};
use modsync_core::sync::SyncOutcome;

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// List configured repositories
    List {
        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Add a custom repository (must serve a modules.json index)
    Add { url: String },

    /// Remove a custom repository and its cached modules
    Remove { id: String },

    /// Enable a repository
    Enable { id: String },

    /// Disable a repository
    Disable { id: String },
}

impl RepoCommand {
    pub async fn execute(self, app: &App) -> Result<()> {
        let aggregator = app.aggregator()?;
        match self {
            RepoCommand::List { json } => {
                let repos = aggregator.repositories().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&repos)?);
                } else {
                    print_repos(&repos);
                }
            }
            RepoCommand::Add { url } => {
                let config = aggregator.add_custom(&url).await?;
                println!(
                    "Added repository '{}' ({})",
                    config.name.as_deref().unwrap_or(&config.url),
                    config.id
                );
            }
            RepoCommand::Remove { id } => {
                if aggregator.remove_custom(&id).await? {
                    println!("Removed repository '{id}'");
                } else {
                    bail!("Repository '{id}' not found");
                }
            }
            RepoCommand::Enable { id } => {
                aggregator.set_enabled(&id, true).await?;
                println!("Enabled repository '{id}'");
            }
            RepoCommand::Disable { id } => {
                aggregator.set_enabled(&id, false).await?;
                println!("Disabled repository '{id}'");
            }
        }
        Ok(())
    }
}

#[derive(Tabled)]
struct RepoRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Modules")]
    modules: usize,
    #[tabled(rename = "Last update")]
    last_update: String,
}

fn print_repos(repos: &[RepoSummary]) {
    let rows: Vec<RepoRow> = repos
        .iter()
        .map(|repo| RepoRow {
            id: repo.id.clone(),
            name: repo.name.clone(),
            enabled: match (repo.enabled, repo.forced_hide) {
                (_, true) => "hidden".to_string(),
                (true, false) => "yes".to_string(),
                (false, false) => "no".to_string(),
            },
            modules: repo.module_count,
            last_update: format_timestamp(repo.last_update),
        })
        .collect();
    println!("{}", styled(Table::new(&rows)));
}

#[derive(Tabled)]
struct ModuleRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Author")]
    author: String,
    #[tabled(rename = "Repository")]
    repo: String,
}

impl From<&CatalogEntry> for ModuleRow {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id().to_string(),
            name: truncate(entry.meta.display_name(), 40),
            version: entry.meta.version.clone().unwrap_or_default(),
            author: truncate(entry.meta.author.as_deref().unwrap_or_default(), 24),
            repo: entry.repo_id.clone(),
        }
    }
}

fn print_modules<'a>(entries: impl Iterator<Item = &'a CatalogEntry>) {
    let rows: Vec<ModuleRow> = entries.map(ModuleRow::from).collect();
    println!("{}", styled(Table::new(&rows)));
}

fn styled(mut table: Table) -> String {
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max - 3).collect();
        format!("{kept}...")
    } else {
        text.to_string()
    }
}

pub(crate) fn format_timestamp(epoch_ms: i64) -> String {
    if epoch_ms <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub async fn execute_sync(app: &App, json: bool) -> Result<()> {
    let aggregator = app.aggregator()?;
    let progress = |value: u32, max: u32| {
        let percent = if max == 0 { 0 } else { value * 100 / max };
        eprint!("\rSyncing repositories... {percent:>3}%");
        let _ = std::io::stderr().flush();
    };
    let outcome = aggregator.update(&progress).await;
    eprintln!();
    if outcome == SyncOutcome::Joined {
        eprintln!("Joined a sync that was already running");
    }

    let modules = aggregator.modules().await;
    let report = aggregator.last_report();
    if json {
        let output = serde_json::json!({
            "report": report,
            "modules": modules.values().collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if report.offline {
        println!("No network connection, catalog is empty.");
        return Ok(());
    }
    print_modules(modules.values());
    println!("\n{} module(s)", report.module_count);
    for failed in &report.failed_sources {
        if failed.premium {
            println!(
                "! Failed to sync '{}', resetting premium credentials may help",
                failed.name
            );
        } else {
            println!("! Failed to sync '{}' ({})", failed.name, failed.id);
        }
    }
    Ok(())
}

/// Case-insensitive match on id, name, author and description
pub fn matches(entry: &CatalogEntry, query: &str) -> bool {
    let query = query.to_lowercase();
    let meta = &entry.meta;
    [
        Some(meta.id.as_str()),
        meta.name.as_deref(),
        meta.author.as_deref(),
        meta.description.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.to_lowercase().contains(&query))
}

pub async fn execute_search(app: &App, query: &str, json: bool) -> Result<()> {
    let aggregator = app.aggregator()?;
    let modules = cached_catalog(&aggregator).await;
    let results: Vec<&CatalogEntry> = modules.values().filter(|e| matches(e, query)).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("No modules found.");
    } else {
        println!("Found {} module(s):\n", results.len());
        print_modules(results.into_iter());
    }
    Ok(())
}

/// Fresh repositories are read from the cache rows, stale ones are refetched
async fn cached_catalog(aggregator: &RepositoryAggregator) -> std::sync::Arc<ModuleMap> {
    aggregator.scan().await;
    aggregator.modules().await
}
