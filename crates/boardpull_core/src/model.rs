use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::convert::sanitize_title;

/// One work item as captured from its detail panel. `children` nest
/// recursively; everything else is flat per item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    /// Label-keyed scalar fields. A `None` value records a field the panel
    /// exposes but a read could not resolve; fields a type does not expose
    /// are simply absent.
    #[serde(default)]
    pub fields: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub description: Option<String>,
    /// Images embedded in the description, staged under generated names.
    #[serde(default)]
    pub description_images: Vec<AttachmentRef>,
    #[serde(default)]
    pub discussions: Vec<Discussion>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub related_work: Vec<RelatedGroup>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub development: Vec<Changeset>,
    #[serde(default)]
    pub children: Vec<WorkItem>,
}

impl WorkItem {
    /// Directory name in the materialized tree.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.id, sanitize_title(&self.title))
    }
}

/// A staged download: where it came from and the collision-resistant local
/// name it was assigned at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub url: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discussion {
    pub author: String,
    pub content: String,
    /// Normalized (`%Y_%m_%dT%H_%M_%S`) timestamp resolved from the comment
    /// tooltip; `None` when the tooltip never yielded a parseable value.
    pub timestamp: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub author: String,
    /// Raw date text as the history pane shows it.
    pub timestamp: String,
    pub title: String,
    #[serde(default)]
    pub fields: Vec<FieldChange>,
    #[serde(default)]
    pub links: Vec<LinkChange>,
    #[serde(default)]
    pub attachments: Vec<AttachmentChange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldChange {
    pub name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Files the change removed (moved to `removed_attachments/` on disk).
    #[serde(default)]
    pub old_attachments: Vec<String>,
    /// Files the change introduced.
    #[serde(default)]
    pub new_attachments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "Added",
            Self::Deleted => "Deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkChange {
    pub change: ChangeKind,
    /// Relation display name ("Child", "Related", …).
    pub kind: String,
    /// Href of the linked item, or its text when no anchor was rendered.
    pub target: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentChange {
    pub change: ChangeKind,
    pub file_name: Option<String>,
}

/// Related-work rows grouped under one relation-type label, in the order the
/// links tab lists them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedGroup {
    pub kind: String,
    #[serde(default)]
    pub items: Vec<RelatedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedItem {
    pub id: String,
    pub title: String,
    /// Normalized last-update timestamp; capture skips rows without one.
    pub updated_at: String,
    pub url: String,
}

impl RelatedItem {
    /// Directory name the target was (or would be) materialized under.
    pub fn target_dir_name(&self) -> String {
        format!("{}_{}", self.id, sanitize_title(&self.title))
    }

    /// Name for the symlink/stub in the owning item's `related/` directory.
    /// Multi-word relation kinds contribute their first word only, so
    /// "Duplicate Of" links read `..._Duplicate`.
    pub fn link_name(&self, kind: &str) -> String {
        let kind = kind.split_whitespace().next().unwrap_or(kind);
        format!("{}_update_{}_{}", self.target_dir_name(), self.updated_at, kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Changeset {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangedFile {
    pub name: Option<String>,
    pub path: Option<String>,
    /// Present only when changeset content capture is enabled.
    #[serde(default)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{RelatedItem, WorkItem};

    #[test]
    fn dir_name_sanitizes_title() {
        let item = WorkItem {
            id: "42".to_string(),
            title: "Fix login (v2)".to_string(),
            ..WorkItem::default()
        };
        assert_eq!(item.dir_name(), "42_Fix_login__v2_");
    }

    #[test]
    fn related_link_name_embeds_update_and_kind() {
        let related = RelatedItem {
            id: "7".to_string(),
            title: "Other item".to_string(),
            updated_at: "2024_01_02T03_04_05".to_string(),
            url: "https://tracker.test/org/proj/_workitems/edit/7".to_string(),
        };
        assert_eq!(related.target_dir_name(), "7_Other_item");
        assert_eq!(
            related.link_name("Child"),
            "7_Other_item_update_2024_01_02T03_04_05_Child"
        );
        assert_eq!(
            related.link_name("Duplicate Of"),
            "7_Other_item_update_2024_01_02T03_04_05_Duplicate"
        );
    }
}
