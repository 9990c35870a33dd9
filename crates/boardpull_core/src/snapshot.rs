//! The scrape snapshot: one JSON document holding every captured work item
//! tree. Loaded whole at startup, rewritten whole after each item so a crash
//! never costs more than the item in flight.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::model::WorkItem;

/// Load the snapshot. A missing or unreadable document yields an empty
/// result set so a fresh or corrupted run starts over instead of failing.
pub fn load_snapshot(path: &Path) -> Result<Vec<WorkItem>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    match serde_json::from_str(&content) {
        Ok(items) => Ok(items),
        Err(error) => {
            warn!(path = %path.display(), %error, "snapshot is not valid JSON; starting empty");
            Ok(Vec::new())
        }
    }
}

/// Overwrite the snapshot with the full result set.
pub fn save_snapshot(path: &Path, items: &[WorkItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = serde_json::to_string_pretty(items).context("failed to serialize snapshot")?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Collect every work item id in the forest, children included.
pub fn id_index(items: &[WorkItem]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect_ids(items, &mut ids);
    ids
}

fn collect_ids(items: &[WorkItem], ids: &mut BTreeSet<String>) {
    for item in items {
        if !item.children.is_empty() {
            collect_ids(&item.children, ids);
        }
        ids.insert(item.id.clone());
    }
}

/// A subtree is complete when every leaf under it is indexed. Interior ids
/// are not checked; a parent re-captured with a new child must be replaced
/// even though the parent itself is indexed.
pub fn subtree_complete(item: &WorkItem, indexed: &BTreeSet<String>) -> bool {
    if item.children.is_empty() {
        return indexed.contains(&item.id);
    }
    item.children
        .iter()
        .all(|child| subtree_complete(child, indexed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    Replaced,
    KeptExisting,
}

/// Fold a freshly captured tree into the result set. `indexed` is the id
/// index of the set as loaded at startup: an id seen for the first time is
/// appended, a known id replaces its old record only when that old record's
/// subtree is no longer complete against the fresh capture.
pub fn merge_item(
    items: &mut Vec<WorkItem>,
    item: WorkItem,
    indexed: &BTreeSet<String>,
) -> MergeOutcome {
    if !indexed.contains(&item.id) {
        items.push(item);
        return MergeOutcome::Appended;
    }
    if subtree_complete(&item, indexed) {
        return MergeOutcome::KeptExisting;
    }
    items.retain(|existing| existing.id != item.id);
    items.push(item);
    MergeOutcome::Replaced
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn item(id: &str, children: Vec<WorkItem>) -> WorkItem {
        WorkItem {
            id: id.to_string(),
            title: format!("Item {id}"),
            children,
            ..WorkItem::default()
        }
    }

    #[test]
    fn load_snapshot_missing_file_is_empty() {
        let items = load_snapshot(Path::new("/nonexistent/scrape_result.json")).expect("load");
        assert!(items.is_empty());
    }

    #[test]
    fn load_snapshot_corrupt_file_is_empty() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("scrape_result.json");
        fs::write(&path, "{ not json").expect("write");
        let items = load_snapshot(&path).expect("load");
        assert!(items.is_empty());
    }

    #[test]
    fn save_snapshot_creates_parent_and_loads_back() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("data").join("scrape_result.json");
        let items = vec![item("42", vec![item("43", Vec::new())])];
        save_snapshot(&path, &items).expect("save");
        let loaded = load_snapshot(&path).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "42");
        assert_eq!(loaded[0].children[0].id, "43");
    }

    #[test]
    fn id_index_walks_children() {
        let items = vec![
            item("1", vec![item("2", vec![item("3", Vec::new())])]),
            item("4", Vec::new()),
        ];
        let ids = id_index(&items);
        assert_eq!(
            ids.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["1", "2", "3", "4"]
        );
    }

    #[test]
    fn subtree_complete_checks_leaves_only() {
        let indexed: BTreeSet<String> = ["2".to_string(), "3".to_string()].into();
        let parent = item("1", vec![item("2", Vec::new()), item("3", Vec::new())]);
        assert!(subtree_complete(&parent, &indexed));

        let with_new_leaf = item("1", vec![item("2", Vec::new()), item("9", Vec::new())]);
        assert!(!subtree_complete(&with_new_leaf, &indexed));
    }

    #[test]
    fn merge_appends_unknown_id() {
        let mut items = vec![item("1", Vec::new())];
        let indexed = id_index(&items);
        let outcome = merge_item(&mut items, item("2", Vec::new()), &indexed);
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn merge_keeps_existing_complete_record() {
        let mut items = vec![item("1", vec![item("2", Vec::new())])];
        let indexed = id_index(&items);
        let fresh = item("1", vec![item("2", Vec::new())]);
        let outcome = merge_item(&mut items, fresh, &indexed);
        assert_eq!(outcome, MergeOutcome::KeptExisting);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn merge_replaces_record_with_unindexed_leaf() {
        let mut items = vec![item("1", vec![item("2", Vec::new())])];
        items[0].title = "stale".to_string();
        let indexed = id_index(&items);
        let fresh = item("1", vec![item("2", Vec::new()), item("5", Vec::new())]);
        let outcome = merge_item(&mut items, fresh, &indexed);
        assert_eq!(outcome, MergeOutcome::Replaced);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].children.len(), 2);
        assert_ne!(items[0].title, "stale");
    }
}
