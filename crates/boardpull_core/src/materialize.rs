//! Materialize the snapshot into a reviewable directory tree: one directory
//! per work item (children nested inside their parent), fixed description,
//! metadata, and origin files, plus per-section subdirectories for history,
//! discussion, development, and attachments.
//!
//! The pass is cleanup-then-rebuild: previous output directories and stray
//! symlinks are removed first, the staging directory is left alone until the
//! end so staged downloads can be moved into place, then it is deleted.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use rand::distr::Alphanumeric;
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ScrapeConfig;
use crate::convert::{self, HISTORY_ENTRY_FORMAT, sanitize_title, wrap_content};
use crate::model::{Changeset, Discussion, HistoryEntry, WorkItem};

/// Width for `* Content:` lines in discussion files.
const CONTENT_WRAP_COLUMNS: usize = 90;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializeReport {
    pub items: usize,
    pub history_entries: usize,
    pub discussions: usize,
    pub changesets: usize,
    pub attachments_moved: usize,
    pub attachments_missing: usize,
}

/// Rebuild the output tree under `output_root` from the captured records.
/// Staged downloads under `staging_dir` are moved next to the markdown that
/// references them; the staging directory is removed once the pass succeeds.
pub fn materialize(
    items: &[WorkItem],
    output_root: &Path,
    staging_dir: &Path,
    config: &ScrapeConfig,
) -> Result<MaterializeReport> {
    clean_output_root(output_root, staging_dir)?;

    let mut report = MaterializeReport::default();
    materialize_level(items, output_root, staging_dir, config, &mut report)?;

    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir)
            .with_context(|| format!("failed to remove {}", staging_dir.display()))?;
    }
    info!(
        items = report.items,
        moved = report.attachments_moved,
        missing = report.attachments_missing,
        "materialized output tree"
    );
    Ok(report)
}

/// Clear the previous run's output: item directories and symlinks go, loose
/// files (the snapshot may live here) and the staging directory stay.
fn clean_output_root(root: &Path, staging_dir: &Path) -> Result<()> {
    if !root.exists() {
        return fs::create_dir_all(root)
            .with_context(|| format!("failed to create {}", root.display()));
    }
    for entry in
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to unlink {}", path.display()))?;
            continue;
        }
        if file_type.is_dir() && path != staging_dir {
            debug!(path = %path.display(), "removing stale output directory");
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

fn materialize_level(
    items: &[WorkItem],
    parent_dir: &Path,
    staging_dir: &Path,
    config: &ScrapeConfig,
    report: &mut MaterializeReport,
) -> Result<()> {
    for item in items {
        let dir = parent_dir.join(item.dir_name());
        info!(path = %dir.display(), "materializing work item");
        for sub in ["history", "discussion/attachments", "development", "attachments", "related"] {
            fs::create_dir_all(dir.join(sub))
                .with_context(|| format!("failed to create {}", dir.join(sub).display()))?;
        }

        write_description(&dir, item)?;
        write_metadata(&dir, item)?;
        write_origin(&dir, item, config)?;
        write_history(&dir.join("history"), &item.history, staging_dir, report)?;
        write_discussions(&dir.join("discussion"), &item.discussions, staging_dir, report)?;
        write_changesets(&dir.join("development"), &item.development, report)?;
        move_item_attachments(&dir.join("attachments"), item, staging_dir, report)?;
        report.items += 1;

        materialize_level(&item.children, &dir, staging_dir, config, report)?;
    }
    Ok(())
}

fn write_description(dir: &Path, item: &WorkItem) -> Result<()> {
    let path = dir.join("description.md");
    fs::write(&path, item.description.as_deref().unwrap_or_default())
        .with_context(|| format!("failed to write {}", path.display()))
}

/// One `* key: value` line per scalar; fields that never resolved a value are
/// left out rather than rendered as an empty line.
fn write_metadata(dir: &Path, item: &WorkItem) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!("* Task id: {}\n", item.id));
    out.push_str(&format!("* Title: {}\n", item.title));
    for (key, value) in &item.fields {
        if let Some(value) = value {
            out.push_str(&format!("* {key}: {value}\n"));
        }
    }
    let path = dir.join("metadata.md");
    fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// The canonical edit URL, rebuilt from the base URL's scheme, authority, and
/// first two path segments so query-page URLs still yield the plain form.
fn write_origin(dir: &Path, item: &WorkItem, config: &ScrapeConfig) -> Result<()> {
    let url = Url::parse(&config.base_url)
        .with_context(|| format!("invalid base URL {}", config.base_url))?;
    let mut segments = url.path().split('/').filter(|segment| !segment.is_empty());
    let organization = segments.next().unwrap_or_default();
    let project = segments.next().unwrap_or_default();
    let origin = format!(
        "{}://{}/{}/{}/{}/{}",
        url.scheme(),
        url.authority(),
        organization,
        project,
        config.work_item_endpoint,
        item.id
    );
    let path = dir.join("origin.md");
    fs::write(&path, origin).with_context(|| format!("failed to write {}", path.display()))
}

fn write_history(
    history_dir: &Path,
    entries: &[HistoryEntry],
    staging_dir: &Path,
    report: &mut MaterializeReport,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let added_dir = history_dir.join("attachments");
    let removed_dir = history_dir.join("removed_attachments");
    fs::create_dir_all(&added_dir)
        .with_context(|| format!("failed to create {}", added_dir.display()))?;
    fs::create_dir_all(&removed_dir)
        .with_context(|| format!("failed to create {}", removed_dir.display()))?;

    for entry in entries {
        let path = history_entry_path(history_dir, entry);

        let mut out = String::new();
        out.push_str(&format!("* Date: {}\n", entry.timestamp));
        out.push_str(&format!("   * User: {}\n", entry.author));
        out.push_str(&format!("   * Title: {}\n", entry.title));

        if !entry.fields.is_empty() {
            out.push_str("   * Fields\n");
            for field in &entry.fields {
                out.push_str(&format!("       * {}\n", field.name));
                out.push_str(&format!(
                    "           * Old Value: {}\n",
                    field.old_value.as_deref().unwrap_or_default()
                ));
                out.push_str(&format!(
                    "           * New Value: {}\n",
                    field.new_value.as_deref().unwrap_or_default()
                ));
                if !field.old_attachments.is_empty() {
                    out.push_str("           * Old Attachments\n");
                    for name in &field.old_attachments {
                        let destination = removed_dir.join(name);
                        out.push_str(&format!("               * File Name: {name}\n"));
                        out.push_str(&format!(
                            "               * Absolute link to attachment:  [{name}]({})\n",
                            destination.display()
                        ));
                        move_staged(staging_dir, name, &destination, report)?;
                    }
                }
                if !field.new_attachments.is_empty() {
                    out.push_str("           * New Attachments\n");
                    for name in &field.new_attachments {
                        let destination = added_dir.join(name);
                        out.push_str(&format!("               * File Name: {name}\n"));
                        out.push_str(&format!(
                            "               * Absolute link to attachment:  [{name}]({})\n",
                            destination.display()
                        ));
                        move_staged(staging_dir, name, &destination, report)?;
                    }
                }
            }
        }

        for link in &entry.links {
            out.push_str("   * Links\n");
            out.push_str(&format!("       * Type: {}\n", link.kind));
            out.push_str(&format!("       * Change Type: {}\n", link.change.as_str()));
            out.push_str(&format!("       * Link to item file: {}\n", link.target));
            out.push_str(&format!("       * Title: {}\n", link.title));
        }

        for attachment in &entry.attachments {
            out.push_str("   * Attachment\n");
            out.push_str(&format!(
                "       * Change Type: {}\n",
                attachment.change.as_str()
            ));
            out.push_str(&format!(
                "       * File Name: {}\n",
                attachment.file_name.as_deref().unwrap_or_default()
            ));
        }

        fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
        report.history_entries += 1;
    }
    Ok(())
}

/// `<normalized-date>_<tag>_<user>_<title>.md`, where `tag` is a two-character
/// disambiguator regenerated until the name is free. Entries often share a
/// date, author, and title (bulk edits), so collisions are routine.
fn history_entry_path(history_dir: &Path, entry: &HistoryEntry) -> PathBuf {
    let formats = [HISTORY_ENTRY_FORMAT.to_string()];
    let date = match convert::normalize_timestamp(&entry.timestamp, &formats) {
        Ok(date) => date,
        Err(error) => {
            warn!(raw = %entry.timestamp, %error, "history date did not normalize");
            sanitize_title(&entry.timestamp)
        }
    };
    let user = entry.author.split_whitespace().collect::<Vec<_>>().join("_");
    let title = sanitize_title(&entry.title);
    loop {
        let tag: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(2)
            .map(char::from)
            .collect();
        let candidate = history_dir.join(format!("{date}_{tag}_{user}_{title}.md"));
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// One file per day and author, append mode, so a thread's same-day comments
/// accumulate in order.
fn write_discussions(
    discussion_dir: &Path,
    discussions: &[Discussion],
    staging_dir: &Path,
    report: &mut MaterializeReport,
) -> Result<()> {
    let attachments_dir = discussion_dir.join("attachments");
    for discussion in discussions {
        let stamp = discussion.timestamp.as_deref().unwrap_or("undated");
        let day = discussion
            .timestamp
            .as_deref()
            .map(convert::day_part)
            .unwrap_or("undated");
        let path = discussion_dir.join(format!("{day}_{}.md", discussion.author));

        let mut out = String::new();
        out.push_str(&format!(
            "* Title: <{} commented {}>\n",
            discussion.author, stamp
        ));
        out.push_str(&format!(
            "* Content: {}\n",
            wrap_content(&discussion.content, CONTENT_WRAP_COLUMNS)
        ));
        out.push_str("* Absolute link to attachment/s\n");
        for attachment in &discussion.attachments {
            let destination = attachments_dir.join(&attachment.filename);
            out.push_str(&format!(
                "  * [{}]({})\n",
                attachment.filename,
                destination.display()
            ));
            move_staged(staging_dir, &attachment.filename, &destination, report)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(out.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        report.discussions += 1;
    }
    Ok(())
}

fn write_changesets(
    development_dir: &Path,
    development: &[Changeset],
    report: &mut MaterializeReport,
) -> Result<()> {
    for changeset in development {
        let path = development_dir.join(format!("changeset_{}.md", changeset.id));
        let mut out = String::new();
        for file in &changeset.files {
            out.push_str(&format!(
                "* 'File Name': {}\n",
                file.name.as_deref().unwrap_or_default()
            ));
            out.push_str(&format!(
                "* 'Path': {}\n",
                file.path.as_deref().unwrap_or_default()
            ));
            if let Some(content) = &file.content {
                out.push_str("* 'Content':\n\n```\n");
                out.push_str(content);
                out.push_str("\n```\n");
            }
        }
        fs::write(&path, out).with_context(|| format!("failed to write {}", path.display()))?;
        report.changesets += 1;
    }
    Ok(())
}

/// Item-level attachments and description images both land in the item's
/// `attachments/` directory.
fn move_item_attachments(
    attachments_dir: &Path,
    item: &WorkItem,
    staging_dir: &Path,
    report: &mut MaterializeReport,
) -> Result<()> {
    for attachment in item.attachments.iter().chain(item.description_images.iter()) {
        let destination = attachments_dir.join(&attachment.filename);
        move_staged(staging_dir, &attachment.filename, &destination, report)?;
    }
    Ok(())
}

/// Move one staged download into place. A missing source is not an error;
/// the markdown keeps its reference and the report counts the gap.
fn move_staged(
    staging_dir: &Path,
    name: &str,
    destination: &Path,
    report: &mut MaterializeReport,
) -> Result<()> {
    let source = staging_dir.join(name);
    if !source.exists() {
        debug!(file = name, "staged file missing, leaving dangling reference");
        report.attachments_missing += 1;
        return Ok(());
    }
    fs::rename(&source, destination).with_context(|| {
        format!(
            "failed to move {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    report.attachments_moved += 1;
    Ok(())
}
