//! Export and import
//!
//! An export is a plain list of commands that rebuilds every group, track
//! and stored user when replayed through [`CommandExecutor`] as the console.

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::commands::{CommandExecutor, CommandOutcome, Sender};
use crate::engine::Engine;
use crate::holder::PermissionHolder;
use crate::node::{group_node, to_command, unix_now};
use crate::storage::{with_timeout, StorageError};

const PROGRESS_EVERY: usize = 100;

/// Build the export script.
///
/// Order: groups, group nodes, tracks, track entries, then each stored
/// user's nodes, primary group and (if needed) removal of the default
/// group. Expired nodes are left out.
pub async fn export_lines(engine: &Engine) -> Result<Vec<String>, StorageError> {
    let now = unix_now();
    let default = engine.default_group().to_string();
    let timeout = std::time::Duration::from_millis(engine.config().storage_timeout_ms);
    let mut lines = vec![format!(
        "# permd export {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )];

    let groups = engine.groups().all();
    for group in &groups {
        if group.name() != default {
            lines.push(format!("creategroup {}", group.name()));
        }
    }
    for group in &groups {
        for node in group.nodes().iter().filter(|n| !n.has_expired(now)) {
            lines.push(to_command(node, group.name(), true));
        }
    }
    info!("Export: wrote {} groups", groups.len());

    let tracks = engine.tracks().all();
    for track in &tracks {
        lines.push(format!("createtrack {}", track.name()));
    }
    for track in &tracks {
        for group in track.groups() {
            lines.push(format!("track {} append {}", track.name(), group));
        }
    }
    info!("Export: wrote {} tracks", tracks.len());

    let default_membership = group_node(&default).ok();
    let keys = with_timeout(timeout, engine.storage().list_user_keys()).await?;
    let total = keys.len();
    let mut written = 0;

    for uuid in keys {
        let data = match engine.users().get(uuid) {
            Some(user) => Some(crate::managers::UserManager::snapshot(&user)),
            None => with_timeout(timeout, engine.storage().load_user(uuid)).await?,
        };
        let Some(data) = data else {
            continue;
        };

        let holder = uuid.to_string();
        for node in data.nodes.iter().filter(|n| !n.has_expired(now)) {
            if Some(node) == default_membership.as_ref() {
                continue;
            }
            lines.push(to_command(node, &holder, false));
        }
        if data.primary_group != default {
            lines.push(format!("user {} switchprimarygroup {}", holder, data.primary_group));
        }
        let inherits_default = default_membership
            .as_ref()
            .is_some_and(|d| data.nodes.contains(d));
        if !inherits_default {
            lines.push(format!("user {} parent remove {}", holder, default));
        }

        written += 1;
        if written % PROGRESS_EVERY == 0 {
            info!("Export: {}/{} users", written, total);
        }
    }
    info!("Export: wrote {} users", written);

    Ok(lines)
}

/// Export to a new file. Refuses to overwrite an existing one.
pub async fn export_to_file(engine: &Engine, path: &Path) -> CommandOutcome {
    if path.exists() {
        return CommandOutcome::invalid_args(format!("{} already exists", path.display()));
    }

    let lines = match export_lines(engine).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!("Export failed: {}", e);
            return CommandOutcome::failure(format!("export failed: {}", e));
        }
    };

    let mut contents = lines.join("\n");
    contents.push('\n');
    if let Err(e) = tokio::fs::write(path, contents).await {
        warn!("Failed to write export to {}: {}", path.display(), e);
        return CommandOutcome::failure(format!("could not write {}: {}", path.display(), e));
    }

    info!("Exported {} lines to {}", lines.len(), path.display());
    CommandOutcome::success(format!("exported {} lines to {}", lines.len(), path.display()))
}

/// Outcome of replaying an export
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub succeeded: usize,
    /// Line number (1-based), line and outcome of every failed command
    pub failures: Vec<(usize, String, CommandOutcome)>,
}

impl ImportReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Replay command lines as the console, skipping blanks and `#` comments
pub async fn import_lines<'a, I>(executor: &CommandExecutor, lines: I) -> ImportReport
where
    I: IntoIterator<Item = &'a str>,
{
    let mut report = ImportReport::default();
    for (index, line) in lines.into_iter().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let outcome = executor.execute(&Sender::Console, line).await;
        if outcome.is_success() {
            report.succeeded += 1;
        } else {
            warn!("Import line {} failed: {} ({})", index + 1, line, outcome);
            report.failures.push((index + 1, line.to_string(), outcome));
        }

        let processed = report.succeeded + report.failed();
        if processed % PROGRESS_EVERY == 0 {
            info!("Import: {} commands processed", processed);
        }
    }

    info!(
        "Import finished: {} succeeded, {} failed",
        report.succeeded,
        report.failed()
    );
    report
}

pub async fn import_file(executor: &CommandExecutor, path: &Path) -> Result<ImportReport> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    Ok(import_lines(executor, contents.lines()).await)
}
