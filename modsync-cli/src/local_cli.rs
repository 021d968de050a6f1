//! Installed module commands

use anyhow::{bail, Result};
use clap::Subcommand;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

use crate::app::App;
use modsync_core::model::{LocalModuleRecord, StatusFlags};

#[derive(Subcommand, Debug)]
pub enum LocalCommand {
    /// List installed and pending modules
    List {
        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Enable a module on next boot
    Enable { id: String },

    /// Disable a module on next boot
    Disable { id: String },

    /// Mark a module for removal on next boot
    Uninstall { id: String },

    /// Cancel a pending removal
    Restore { id: String },

    /// Delete an inactive module's files right away
    Clear { id: String },

    /// Query update feeds of installed modules
    CheckUpdates {
        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },
}

impl LocalCommand {
    pub async fn execute(self, app: &App) -> Result<()> {
        let scanner = app.scanner();
        scanner.scan().await;

        match self {
            LocalCommand::List { json } => {
                let modules = scanner.modules().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&*modules)?);
                } else if modules.is_empty() {
                    println!("No modules installed.");
                } else {
                    print_modules(modules.values());
                }
            }
            LocalCommand::Enable { id } => {
                require(scanner.set_enabled(&id, true).await, "enable", &id)?;
                println!("'{id}' will be enabled after reboot");
            }
            LocalCommand::Disable { id } => {
                require(scanner.set_enabled(&id, false).await, "disable", &id)?;
                println!("'{id}' will be disabled after reboot");
            }
            LocalCommand::Uninstall { id } => {
                require(scanner.set_uninstall(&id, true).await, "uninstall", &id)?;
                println!("'{id}' will be removed after reboot");
            }
            LocalCommand::Restore { id } => {
                require(scanner.set_uninstall(&id, false).await, "restore", &id)?;
                println!("'{id}' will be kept");
            }
            LocalCommand::Clear { id } => {
                require(scanner.master_clear(&id).await, "clear", &id)?;
                println!("Deleted '{id}'");
            }
            LocalCommand::CheckUpdates { json } => {
                let updatable = scanner.check_updates().await;
                let modules = scanner.modules().await;
                let pending: Vec<&LocalModuleRecord> =
                    modules.values().filter(|m| m.has_update()).collect();
                if json {
                    println!("{}", serde_json::to_string_pretty(&pending)?);
                } else if updatable == 0 {
                    println!("All modules are up to date.");
                } else {
                    println!("{updatable} update(s) available:\n");
                    print_modules(pending.into_iter());
                }
            }
        }
        Ok(())
    }
}

fn require(done: bool, action: &str, id: &str) -> Result<()> {
    if !done {
        bail!("Failed to {action} '{id}'");
    }
    Ok(())
}

#[derive(Tabled)]
struct LocalRow {
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Update")]
    update: String,
}

fn print_modules<'a>(modules: impl Iterator<Item = &'a LocalModuleRecord>) {
    let rows: Vec<LocalRow> = modules
        .map(|module| LocalRow {
            id: module.id().to_string(),
            name: module.meta.display_name().to_string(),
            version: module.meta.version.clone().unwrap_or_default(),
            state: state_label(module.flags()),
            update: module
                .update
                .as_ref()
                .filter(|_| module.has_update())
                .map(|u| u.version.clone())
                .unwrap_or_default(),
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();
    println!("{table}");
}

fn state_label(flags: StatusFlags) -> String {
    let mut labels = Vec::new();
    if flags.contains(StatusFlags::UPDATE_PENDING_ONLY) {
        labels.push("pending install");
    } else if flags.contains(StatusFlags::ACTIVE) {
        labels.push("active");
    } else if flags.contains(StatusFlags::MAYBE_ACTIVE) {
        labels.push("maybe active");
    }
    if flags.contains(StatusFlags::UPDATING) && !flags.contains(StatusFlags::UPDATE_PENDING_ONLY) {
        labels.push("updating");
    }
    if flags.contains(StatusFlags::DISABLED) {
        labels.push("disabled");
    }
    if flags.contains(StatusFlags::UNINSTALLING) {
        labels.push("uninstalling");
    }
    if flags.contains(StatusFlags::METADATA_INVALID) {
        labels.push("invalid");
    }
    if labels.is_empty() {
        "inactive".to_string()
    } else {
        labels.join(", ")
    }
}
