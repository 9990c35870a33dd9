//! Cross-reference related-work links against the materialized tree. Links
//! whose target directory exists in this project become symlinks under the
//! owning item's `related/` directory plus a stub describing the relation;
//! links into other projects get a stub recording the origin URL only.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::model::{RelatedItem, WorkItem};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub linked: usize,
    pub existing: usize,
    pub cross_project: usize,
    /// Items whose own directory never materialized; their links are skipped.
    pub missing_items: usize,
}

/// Resolve every related-work reference in `items` against the directories
/// under `output_root`. Safe to re-run: links already in place are left alone.
pub fn reconcile(items: &[WorkItem], output_root: &Path) -> Result<ReconcileReport> {
    // Symlink targets must survive being read from inside `related/`, so the
    // index is built from the canonical root and holds absolute paths.
    let root = output_root
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", output_root.display()))?;
    let index = index_directories(&root)?;

    let mut report = ReconcileReport::default();
    reconcile_level(items, &index, &mut report)?;
    info!(
        linked = report.linked,
        existing = report.existing,
        cross_project = report.cross_project,
        "reconciled related work"
    );
    Ok(report)
}

/// Directory name to path, first occurrence wins. Symlinks are not followed,
/// so links created by an earlier run never alias their targets.
fn index_directories(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut index = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        index.entry(name).or_insert_with(|| entry.path().to_path_buf());
    }
    Ok(index)
}

fn reconcile_level(
    items: &[WorkItem],
    index: &BTreeMap<String, PathBuf>,
    report: &mut ReconcileReport,
) -> Result<()> {
    for item in items {
        let Some(item_dir) = index.get(&item.dir_name()) else {
            warn!(id = %item.id, "item directory not found, skipping its links");
            report.missing_items += 1;
            continue;
        };
        let related_dir = item_dir.join("related");
        fs::create_dir_all(&related_dir)
            .with_context(|| format!("failed to create {}", related_dir.display()))?;

        for group in &item.related_work {
            for related in &group.items {
                link_one(&related_dir, &group.kind, related, index, report)?;
            }
        }
        reconcile_level(&item.children, index, report)?;
    }
    Ok(())
}

fn link_one(
    related_dir: &Path,
    kind: &str,
    related: &RelatedItem,
    index: &BTreeMap<String, PathBuf>,
    report: &mut ReconcileReport,
) -> Result<()> {
    let link_name = related.link_name(kind);
    let stub_path = related_dir.join(format!("{link_name}.md"));

    let Some(target) = index.get(&related.target_dir_name()) else {
        fs::write(&stub_path, format!("origin: {}", related.url))
            .with_context(|| format!("failed to write {}", stub_path.display()))?;
        report.cross_project += 1;
        return Ok(());
    };

    let link_path = related_dir.join(&link_name);
    // exists() would follow the link; a dangling one still counts as present.
    if fs::symlink_metadata(&link_path).is_ok() {
        debug!(path = %link_path.display(), "related link already present");
        report.existing += 1;
        return Ok(());
    }
    create_link(target, &link_path)?;

    let mut stub = String::new();
    stub.push_str(&format!("* Type: {kind}\n"));
    stub.push_str(&format!("    * Link to item file: `{}`\n", target.display()));
    stub.push_str(&format!("    * Last update: {}\n\n", related.updated_at));
    fs::write(&stub_path, stub)
        .with_context(|| format!("failed to write {}", stub_path.display()))?;
    report.linked += 1;
    Ok(())
}

#[cfg(unix)]
fn create_link(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).with_context(|| {
        format!("failed to link {} to {}", link.display(), target.display())
    })
}

/// Junctions instead of symlinks: they work without elevation.
#[cfg(windows)]
fn create_link(target: &Path, link: &Path) -> Result<()> {
    let status = std::process::Command::new("cmd")
        .args(["/C", "mklink", "/J"])
        .arg(link)
        .arg(target)
        .status()
        .context("failed to run mklink")?;
    if !status.success() {
        anyhow::bail!("mklink exited with {status} for {}", link.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::model::RelatedGroup;

    fn related(id: &str, title: &str) -> RelatedItem {
        RelatedItem {
            id: id.to_string(),
            title: title.to_string(),
            updated_at: "2024_01_02T03_04_05".to_string(),
            url: format!("https://tracker.test/org/proj/_workitems/edit/{id}"),
        }
    }

    fn item_with_links(id: &str, title: &str, kind: &str, links: Vec<RelatedItem>) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            title: title.to_string(),
            related_work: vec![RelatedGroup {
                kind: kind.to_string(),
                items: links,
            }],
            ..WorkItem::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn links_targets_found_in_the_tree() {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("work_items");
        fs::create_dir_all(output.join("42_Fix_login").join("related")).expect("item dir");
        fs::create_dir_all(output.join("7_Other_item")).expect("target dir");

        let item = item_with_links("42", "Fix login", "Child", vec![related("7", "Other item")]);
        let report = reconcile(&[item], &output).expect("reconcile");
        assert_eq!(report.linked, 1);
        assert_eq!(report.cross_project, 0);

        let link = output
            .join("42_Fix_login")
            .join("related")
            .join("7_Other_item_update_2024_01_02T03_04_05_Child");
        assert!(fs::symlink_metadata(&link).expect("link").file_type().is_symlink());
        // exists() follows the link, so this also proves it is not dangling.
        assert!(link.exists());

        let stub = fs::read_to_string(link.with_extension("md")).expect("stub");
        assert!(stub.starts_with("* Type: Child\n    * Link to item file: `"));
        assert!(stub.contains("7_Other_item`\n"));
        assert!(stub.ends_with("    * Last update: 2024_01_02T03_04_05\n\n"));
    }

    #[test]
    fn cross_project_targets_get_origin_stubs() {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("work_items");
        fs::create_dir_all(output.join("42_Fix_login")).expect("item dir");

        let item = item_with_links(
            "42",
            "Fix login",
            "Related",
            vec![related("99", "Elsewhere")],
        );
        let report = reconcile(&[item], &output).expect("reconcile");
        assert_eq!(report.cross_project, 1);
        assert_eq!(report.linked, 0);

        let stub = output
            .join("42_Fix_login")
            .join("related")
            .join("99_Elsewhere_update_2024_01_02T03_04_05_Related.md");
        assert_eq!(
            fs::read_to_string(stub).expect("stub"),
            "origin: https://tracker.test/org/proj/_workitems/edit/99"
        );
    }

    #[cfg(unix)]
    #[test]
    fn rerun_leaves_existing_links_alone() {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("work_items");
        fs::create_dir_all(output.join("42_Fix_login").join("related")).expect("item dir");
        fs::create_dir_all(output.join("7_Other_item")).expect("target dir");

        let item = item_with_links("42", "Fix login", "Child", vec![related("7", "Other item")]);
        let first = reconcile(std::slice::from_ref(&item), &output).expect("first run");
        assert_eq!(first.linked, 1);

        let second = reconcile(&[item], &output).expect("second run");
        assert_eq!(second.linked, 0);
        assert_eq!(second.existing, 1);
    }

    #[cfg(unix)]
    #[test]
    fn nested_children_link_from_their_own_directories() {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("work_items");
        let child_related = output
            .join("42_Fix_login")
            .join("43_Child_task")
            .join("related");
        fs::create_dir_all(&child_related).expect("child dir");
        fs::create_dir_all(output.join("7_Other_item")).expect("target dir");

        let child = item_with_links("43", "Child task", "Related", vec![related("7", "Other item")]);
        let parent = WorkItem {
            id: "42".to_string(),
            title: "Fix login".to_string(),
            children: vec![child],
            ..WorkItem::default()
        };

        let report = reconcile(&[parent], &output).expect("reconcile");
        assert_eq!(report.linked, 1);
        assert!(
            child_related
                .join("7_Other_item_update_2024_01_02T03_04_05_Related")
                .exists()
        );
    }

    #[test]
    fn unmaterialized_items_are_counted_and_skipped() {
        let dir = tempdir().expect("tempdir");
        let output = dir.path().join("work_items");
        fs::create_dir_all(&output).expect("output root");

        let item = item_with_links("42", "Fix login", "Child", vec![related("7", "Other item")]);
        let report = reconcile(&[item], &output).expect("reconcile");
        assert_eq!(report.missing_items, 1);
        assert_eq!(report.linked + report.existing + report.cross_project, 0);
    }
}
