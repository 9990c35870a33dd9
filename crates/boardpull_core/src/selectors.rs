//! XPath tables and label lists for the tracker UI. Every element lookup in
//! the traversal and extraction code goes through these constants so panel
//! layout changes stay in one place.

// Work item panel. `[last()]` picks the innermost panel when children are
// stacked on top of their parent.
pub const DIALOG: &str = "//div[@role='dialog'][last()]";
pub const DIALOG_TITLE_INPUT: &str =
    "//div[@role='dialog'][last()]//input[@aria-label='Title Field']";
pub const DIALOG_CLOSE_BUTTON: &str = ".//button[contains(@class, 'ui-button')]";

// Backlog outline rows.
pub const BACKLOG_ROWS: &str = "//div[@aria-level=\"1\"]";
pub const UNPARENTED_ROWS: &str =
    "//div[@class=\"grid-canvas ui-draggable\"]//div[@aria-level=\"2\"]";
pub const UNPARENTED_EXPANDER: &str = "//span[text()='Unparented']//following-sibling::div";
pub const ROW_LINK: &str = ".//a";
// Whole outline including expanded descendants, used to peek ids without
// opening panels.
pub const OUTLINE_ROWS: &str = "//div[@aria-level]";
pub const UNPARENTED_OUTLINE_ROWS: &str =
    "//div[@class=\"grid-canvas ui-draggable\"]//div[@aria-level]";
// Title links on an arbitrary query/list page, for single-item capture.
pub const WORK_ITEM_TITLE_LINKS: &str = "//a[@class='work-item-title-link']";

// Panel tab strip. The history tab sits at position 2 on most item kinds and
// position 4 on the rest; callers probe the accessible name first.
pub const DETAILS_TAB: &str = "//div[@role='dialog'][last()]//ul[@role='tablist']/li[1]";
pub const HISTORY_TAB: &str = "//div[@role='dialog'][last()]//ul[@role='tablist']/li[2]";
pub const HISTORY_TAB_FALLBACK: &str = "//div[@role='dialog'][last()]//ul[@role='tablist']/li[4]";
// Test-case panels swap the first two tabs: steps live on the first tab and
// the summary (description) on the second.
pub const STEPS_TAB: &str = "//div[@role='dialog'][last()]//ul[@role='tablist']/li[1]";
pub const SUMMARY_TAB: &str = "//div[@role='dialog'][last()]//ul[@role='tablist']/li[2]";
pub const ATTACHMENTS_TAB: &str = "//div[@role='dialog'][last()]//ul[@role='tablist']/li[4]";
pub const ATTACHMENTS_COUNT: &str =
    "//div[@role='dialog'][last()]//ul[@role='tablist']/li[4]/span[2]";
// Scoped to the panel element, not the document.
pub const RELATED_TAB: &str = ".//ul[@role='tablist']/li[3]";
pub const RELATED_DETAILS_TAB: &str = ".//ul[@role='tablist']/li[1]";

// Child links group at the bottom of the details tab.
pub const CHILD_GROUP_TITLE: &str =
    "(//div[@role='dialog'][last()]//div[@class='la-group-title' and contains(text(), 'Child')])[1]";
pub const CHILD_SHOW_MORE: &str = "(//div[@role='dialog'][last()]//div[@class='la-group-title' and contains(text(), 'Child')])[1]/../following-sibling::div//div[@class='la-show-more']";
pub const CHILD_ROWS: &str = "(//div[@role='dialog'][last()]//div[@class='la-group-title' and contains(text(), 'Child')])[1]/following-sibling::div";

// History tab.
pub const HISTORY_ITEMS: &str = "//div[@role='dialog'][last()]//div[@class='history-item-summary' or contains(@class, 'history-item-selected')]";
pub const HISTORY_ITEM_VIEWER: &str =
    "//div[@role='dialog'][last()]//div[@class='history-item-viewer']";
pub const HISTORY_COLLAPSED: &str = "//div[@role='dialog'][last()]//div[@class='history-item-list']//div[@aria-expanded='false']";

// Related work tab, scoped to the panel element.
pub const RELATED_GRID_CANVAS: &str = ".//div[@class='grid-canvas']";
pub const RELATED_ROWS: &str =
    ".//div[@class='grid-canvas']//div[contains(@class, 'grid-row grid-row-normal') and @aria-level]";
pub const RELATED_UPDATED_SPAN: &str = ".//span[contains(text(), 'Updated')]";
pub const RELATED_UPDATED_POPUP: &str =
    "(.//div[contains(text(), 'Updated by') and contains(@class, 'popup-content-container')])[last()]";

// Discussion section on the details tab.
pub const COMMENTS_SECTION: &str = "//div[@role='dialog'][last()]//div[@class='comments-section']";
pub const FIRST_COMMENT_HEADER: &str = "(//div[@role='dialog'][last()]//div[@class='comments-section']//div[@class='comment-header-left'])[1]";
pub const TOOLTIP_SUBTEXT: &str = "//p[contains(@class, 'ms-Tooltip-subtext')]";

/// Timestamp element of the nth comment header, 1-based.
pub fn comment_timestamp(index: usize) -> String {
    format!(
        "((//div[@role='dialog'][last()]//div[@class='comments-section']//div[@class='comment-header-left'])[{index}]//*[@class='comment-timestamp'])[1]"
    )
}

// Attachments tab grid.
pub const ATTACHMENT_ROWS: &str = "(//div[@role='dialog'][last()]//div[@class='grid-content-spacer'])[last()]/parent::div//div[@role='row']";
pub const ATTACHMENT_DATE_CELL: &str = "./div[3]";

// Development section and the build pages it links to.
pub const DEVELOPMENT_SHOW_MORE: &str = "//span[@aria-label='Collapse Development section.']/ancestor::div[@class='grid-group']//div[@class='la-show-more']";
pub const DEVELOPMENT_ITEMS: &str = "//div[@role='dialog'][last()]//span[@aria-label='Collapse Development section.']/ancestor::div[@class='grid-group']//div[@class='la-item']";
pub const CHANGESET_TREE_ITEMS: &str = "//div[@role='treeitem']";
pub const CHANGESET_FILE_PATH: &str = "//span[@class='diff-summary-filepath']";
pub const CHANGESET_LINE_CONTENT: &str = "//div[contains(@class, 'repos-line-content')]";

/// Header of the nth changed file on a build page, 1-based.
pub fn changeset_file_name(index: usize) -> String {
    format!("(//span[@class='file-name'])[{index}]")
}

/// Development rows whose build link is dead or failed; these are skipped.
pub const FAILED_BUILD_MARKERS: &[&str] = &[
    ".//span[starts-with(text(), 'Integrated in build link can not be read.')]",
    ".//span[@class='la-text build-failed']",
    ".//div[starts-with(text(), 'Integrated in build')]",
];

// Hosted login form.
pub const LOGIN_EMAIL_INPUT: &str = "//input[@name='loginfmt']";
pub const LOGIN_PASSWORD_INPUT: &str = "//input[@name='passwd']";
pub const LOGIN_SUBMIT_BUTTON: &str = "//*[@id='idSIButton9']";

/// aria-labels of the scalar fields read off the details tab.
pub const BASIC_FIELD_LABELS: &[&str] = &[
    "ID Field",
    "Assigned To Field",
    "State Field",
    "Area Path",
    "Iteration Path",
    "Priority",
    "Remaining Work",
    "Activity",
    "Blocked",
    "Effort",
    "Severity",
];

/// Relation group headers recognized on the related work tab. Anything else
/// (attachments, hyperlinks) is ignored.
pub const RELATION_LABELS: &[&str] = &[
    "Child",
    "Duplicate",
    "Duplicate Of",
    "Predecessor",
    "Related",
    "Successor",
    "Tested By",
    "Tests",
    "Parent",
];
