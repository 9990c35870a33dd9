//! Extractors that read one open work item panel: scalar fields, the four
//! description layouts, history, discussion, related work, attachments, and
//! linked build pages. Each extractor leaves the panel back on the details
//! tab so the next one starts from a known place.
//!
//! Attachment handling is split in two: a pure planning step rewrites the
//! source URL into a download URL with a unique staged file name, and a
//! separate step drives the browser at it so the file lands in the staging
//! directory.

use std::collections::BTreeMap;
use std::slice;
use std::thread::sleep;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ScrapeConfig;
use crate::convert::{self, Node, find_all, find_first, parse_fragment};
use crate::driver::{ElementHandle, UiActions, absent_if_stale};
use crate::model::{
    AttachmentChange, AttachmentRef, ChangeKind, ChangedFile, Changeset, Discussion, FieldChange,
    HistoryEntry, LinkChange, RelatedGroup, RelatedItem,
};
use crate::selectors;

/// Upper bound on "show more" clicks for one grid.
const SHOW_MORE_LIMIT: usize = 50;

/// Scalar fields and description read off the details tab.
#[derive(Debug, Clone)]
pub struct BasicFields {
    pub id: String,
    pub fields: BTreeMap<String, Option<String>>,
    pub description: Option<String>,
    pub description_images: Vec<AttachmentRef>,
}

pub fn extract_basic_fields<U: UiActions>(ui: &mut U, panel: &ElementHandle) -> Result<BasicFields> {
    let html = ui.inner_html(panel)?;
    let root = parse_fragment(&html);

    let mut raw: BTreeMap<String, Option<String>> = BTreeMap::new();
    let labelled = find_all(&root, &|node| {
        node.attr("aria-label")
            .is_some_and(|label| selectors::BASIC_FIELD_LABELS.contains(&label))
    });
    for node in labelled {
        let Some(label) = node.attr("aria-label") else {
            continue;
        };
        let value = if label == "Assigned To Field" {
            find_first(slice::from_ref(node), &|n| {
                n.tag() == Some("span") && n.has_class("text-cursor")
            })
            .map(|span| span.text_content())
            .and_then(non_empty)
        } else if node.tag() == Some("input") {
            match node.attr("value") {
                Some(value) => non_empty(value.to_string()),
                // Rendered without the attribute; ask the live DOM instead.
                None => live_input_value(ui, panel, label)?,
            }
        } else {
            non_empty(node.text_content())
        };
        raw.insert(label.to_string(), value);
    }

    let Some(id) = raw.remove("ID Field").flatten() else {
        bail!("work item panel exposes no ID field");
    };

    let mut fields = BTreeMap::new();
    for (label, value) in raw {
        let key = match label.as_str() {
            "Assigned To Field" => "Assigned To",
            "State Field" => "State",
            "Area Path" => "Area",
            "Iteration Path" => "Iteration",
            other => other,
        };
        fields.insert(key.to_string(), value);
    }

    let (description, image_srcs) = extract_description(ui, panel, &root)?;
    let mut description_images = Vec::new();
    for src in image_srcs {
        let Some(plan) = plan_inline_staging(&src, None) else {
            warn!(url = %src, "unparseable description image URL, skipping");
            continue;
        };
        stage_download(ui, &plan)?;
        description_images.push(plan);
    }

    Ok(BasicFields {
        id,
        fields,
        description,
        description_images,
    })
}

fn live_input_value<U: UiActions>(
    ui: &mut U,
    panel: &ElementHandle,
    label: &str,
) -> Result<Option<String>> {
    let xpath = format!(".//input[@aria-label='{label}']");
    let Some(input) = absent_if_stale(ui.locate_in(panel, &xpath))? else {
        return Ok(None);
    };
    Ok(ui.read_attribute(&input, "value")?.and_then(non_empty))
}

/// Work item types render their description four different ways; probe the
/// layouts in order of specificity.
fn extract_description<U: UiActions>(
    ui: &mut U,
    panel: &ElementHandle,
    root: &[Node],
) -> Result<(Option<String>, Vec<String>)> {
    if aria_labelled(root, "Collapse Repro Steps section.").is_some() {
        return Ok((compose_bug_description(root), Vec::new()));
    }
    if aria_labelled(root, "Resolution section.").is_some() {
        return Ok(description_with_resolution(root));
    }
    if let Some(element) = aria_labelled(root, "Description") {
        return Ok((
            Some(convert::node_to_markdown(element)),
            image_sources(element),
        ));
    }
    if aria_labelled(root, "Steps").is_some() {
        return steps_description(ui, panel, root);
    }
    Ok((None, Vec::new()))
}

fn compose_bug_description(root: &[Node]) -> Option<String> {
    let mut composed = String::new();
    if let Some(element) = aria_labelled(root, "Repro Steps") {
        let text = convert::node_to_markdown(element);
        if !text.is_empty() {
            composed.push_str(&format!("* Repro Steps\n** {text}\n"));
        }
    }
    if let Some(element) = aria_labelled(root, "System Info") {
        let text = convert::node_to_markdown(element);
        if !text.is_empty() {
            composed.push_str(&format!("* System Info\n** {text}\n"));
        }
    }
    if let Some(element) = aria_labelled(root, "Acceptance Criteria") {
        let text = convert::node_to_markdown(element);
        if !text.is_empty() {
            composed.push_str(&format!("* Acceptance criteria \n** {text}\n"));
        }
    }
    Some(composed)
}

fn description_with_resolution(root: &[Node]) -> (Option<String>, Vec<String>) {
    let (description, image_srcs) = match aria_labelled(root, "Description") {
        Some(element) => (convert::node_to_markdown(element), image_sources(element)),
        None => (String::new(), Vec::new()),
    };
    let resolution = aria_labelled(root, "Resolution")
        .map(convert::node_to_markdown)
        .unwrap_or_default();
    let composed = format!("{description}\n* Repro Steps\n\t* {resolution}\n");
    (Some(composed), image_srcs)
}

/// Test cases carry a steps grid on their first tab and the description on
/// the second; flatten the grid, flip to the summary for the description,
/// then flip back.
fn steps_description<U: UiActions>(
    ui: &mut U,
    panel: &ElementHandle,
    root: &[Node],
) -> Result<(Option<String>, Vec<String>)> {
    let mut description = steps_grid_lines(root);
    let mut image_srcs = Vec::new();

    if let Some(summary_tab) = ui.locate(selectors::SUMMARY_TAB)? {
        ui.click_element(&summary_tab)?;
        let html = ui.inner_html(panel)?;
        let summary_root = parse_fragment(&html);
        if let Some(element) = aria_labelled(&summary_root, "Description") {
            image_srcs = image_sources(element);
            description.push_str(&convert::node_to_markdown(element));
        }
        if let Some(steps_tab) = ui.locate(selectors::STEPS_TAB)? {
            ui.click_element(&steps_tab)?;
        }
    }

    Ok((Some(description), image_srcs))
}

fn steps_grid_lines(root: &[Node]) -> String {
    let Some(list) = find_first(root, &|n| {
        n.tag() == Some("div") && n.has_class("test-steps-list")
    }) else {
        return String::new();
    };
    let Some(canvas) = find_first(slice::from_ref(list), &|n| {
        n.has_class("grid-canvas") && n.attr("role") == Some("presentation")
    }) else {
        return String::new();
    };

    let rows = find_all(slice::from_ref(canvas), &|n| {
        n.tag() == Some("div")
            && n.attr("class")
                .is_some_and(|class| class.contains("grid-row grid-row-normal"))
    });

    // Each row flattens to its step texts, a spacer, and an attachment
    // summary of first words. The trailing row is the grid's insertion
    // placeholder.
    let mut cells: Vec<String> = Vec::new();
    for row in rows.iter().copied().take(rows.len().saturating_sub(1)) {
        for paragraph in find_all(slice::from_ref(row), &|n| n.tag() == Some("p")) {
            cells.push(paragraph.text_content());
        }
        cells.push(String::new());
        let mut summary = String::new();
        for anchor in find_all(slice::from_ref(row), &|n| n.tag() == Some("a")) {
            let text = anchor.text_content();
            summary.push_str(text.split(' ').next().unwrap_or(""));
            summary.push(' ');
        }
        cells.push(summary);
    }

    let mut lines = String::new();
    for chunk in cells.chunks(4) {
        if let [action, expectation, spacer, attachments] = chunk {
            lines.push_str(&format!(
                "{action} \t {expectation} \t {spacer} \t {attachments}\n"
            ));
        }
    }
    lines
}

fn aria_labelled<'a>(nodes: &'a [Node], label: &str) -> Option<&'a Node> {
    find_first(nodes, &|n| n.attr("aria-label") == Some(label))
}

fn image_sources(element: &Node) -> Vec<String> {
    find_all(slice::from_ref(element), &|n| n.tag() == Some("img"))
        .into_iter()
        .filter_map(|img| img.attr("src").map(str::to_string))
        .collect()
}

/// Rewrite an inline attachment URL (description images, history deltas,
/// comment images) into a staged download URL. The staged name gets a fresh
/// UUID so repeated file names never collide in the staging directory; when
/// the URL carries a `FileNameGuid`, the path is redirected at the stable
/// attachment endpoint. Returns `None` when the URL is unparseable or names
/// no file.
pub(crate) fn plan_inline_staging(raw: &str, prefix: Option<&str>) -> Option<AttachmentRef> {
    let mut url = Url::parse(raw).ok()?;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let guid = pairs
        .iter()
        .position(|(key, _)| key.as_str() == "FileNameGuid")
        .map(|at| pairs.remove(at).1);
    let original = query_file_name(&pairs)?;

    let staged = match prefix {
        Some(prefix) => format!("{prefix}_{}_{original}", Uuid::new_v4()),
        None => format!("{}_{original}", Uuid::new_v4()),
    };

    set_pair(&mut pairs, "fileName", &staged);
    set_pair(&mut pairs, "download", "True");
    pairs.retain(|(key, _)| key.as_str() != "FileName");

    if let Some(guid) = guid {
        let path = {
            let mut segments: Vec<&str> = url.path().split('/').collect();
            segments.pop();
            format!("{}/attachments/{guid}", segments.join("/"))
        };
        url.set_path(&path);
    }

    rebuild_query(&mut url, &pairs);
    Some(AttachmentRef {
        url: url.into(),
        filename: staged,
    })
}

/// Rewrite an attachments-grid URL: only the file name value changes, under
/// whichever key the grid used, gaining the attached-on date and a UUID.
pub(crate) fn plan_grid_staging(raw: &str, date_prefix: &str) -> Option<AttachmentRef> {
    let mut url = Url::parse(raw).ok()?;
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let at = pairs
        .iter()
        .position(|(key, value)| key.as_str() == "fileName" && !value.is_empty())
        .or_else(|| {
            pairs
                .iter()
                .position(|(key, value)| key.as_str() == "FileName" && !value.is_empty())
        })?;

    let staged = format!("{date_prefix}_{}_{}", Uuid::new_v4(), pairs[at].1);
    pairs[at].1 = staged.clone();

    rebuild_query(&mut url, &pairs);
    Some(AttachmentRef {
        url: url.into(),
        filename: staged,
    })
}

fn query_file_name(pairs: &[(String, String)]) -> Option<String> {
    let named = pairs
        .iter()
        .find(|(key, value)| key.as_str() == "fileName" && !value.is_empty())
        .or_else(|| {
            pairs
                .iter()
                .find(|(key, value)| key.as_str() == "FileName" && !value.is_empty())
        })?;
    Some(named.1.clone())
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: &str) {
    match pairs.iter_mut().find(|(existing, _)| existing.as_str() == key) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((key.to_string(), value.to_string())),
    }
}

fn rebuild_query(url: &mut Url, pairs: &[(String, String)]) {
    let mut editor = url.query_pairs_mut();
    editor.clear();
    for (key, value) in pairs {
        editor.append_pair(key, value);
    }
}

/// Drive the browser at a planned download URL so the file lands in the
/// staging directory.
fn stage_download<U: UiActions>(ui: &mut U, plan: &AttachmentRef) -> Result<()> {
    debug!(file = %plan.filename, "staging attachment download");
    ui.goto(&plan.url)
        .with_context(|| format!("failed to stage download of {}", plan.filename))
}

pub fn extract_history<U: UiActions>(
    ui: &mut U,
    config: &ScrapeConfig,
) -> Result<Vec<HistoryEntry>> {
    let mut tab_xpath = selectors::HISTORY_TAB;
    if let Some(tab) = ui.locate(selectors::HISTORY_TAB)? {
        if ui.accessible_name(&tab)? != "History" {
            tab_xpath = selectors::HISTORY_TAB_FALLBACK;
        }
    }
    if let Err(error) = ui.click(tab_xpath) {
        warn!(%error, "history tab never became clickable");
        return Ok(Vec::new());
    }

    expand_collapsed(ui)?;

    let mut items = Vec::new();
    for attempt in 0..config.max_retries {
        items = ui.locate_all(selectors::HISTORY_ITEMS)?;
        if !items.is_empty() {
            break;
        }
        debug!(attempt, "waiting for history items");
        sleep(config.retry_delay);
    }
    if items.is_empty() {
        warn!("history items never rendered");
        ui.click(selectors::DETAILS_TAB)?;
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for index in 0..items.len() {
        let current = ui.locate_all(selectors::HISTORY_ITEMS)?;
        let Some(item) = current.get(index) else {
            break;
        };
        if let Err(error) = ui.click_element(item) {
            warn!(index, %error, "history entry would not open, skipping");
            continue;
        }
        sleep(config.poll_interval);

        let Some(viewer) = ui.locate(selectors::HISTORY_ITEM_VIEWER)? else {
            warn!(index, "history viewer missing, skipping entry");
            continue;
        };
        let html = ui.inner_html(&viewer)?;
        match parse_history_entry(&html) {
            Ok((entry, downloads)) => {
                for plan in &downloads {
                    stage_download(ui, plan)?;
                }
                entries.push(entry);
            }
            Err(error) => warn!(index, %error, "unreadable history entry, skipping"),
        }
    }

    ui.click(selectors::DETAILS_TAB)?;
    Ok(entries)
}

fn expand_collapsed<U: UiActions>(ui: &mut U) -> Result<()> {
    for element in ui.locate_all(selectors::HISTORY_COLLAPSED)? {
        if let Err(error) = ui.click_element(&element) {
            debug!(%error, "collapsed history group did not expand");
        }
    }
    Ok(())
}

/// Parse one history entry viewer. Pure: planned attachment downloads are
/// returned for the caller to perform.
fn parse_history_entry(html: &str) -> Result<(HistoryEntry, Vec<AttachmentRef>)> {
    let root = parse_fragment(html);
    let mut downloads = Vec::new();

    let author = find_first(&root, &|n| n.has_class("history-item-name-changed-by"))
        .map(|n| n.text_content())
        .context("history entry has no author")?;
    let timestamp = find_first(&root, &|n| n.has_class("history-item-date"))
        .map(|n| n.text_content())
        .context("history entry has no date")?;
    let title = find_first(&root, &|n| n.has_class("history-item-summary-text"))
        .map(|n| n.text_content())
        .context("history entry has no summary")?;

    let mut entry = HistoryEntry {
        author,
        timestamp,
        title,
        fields: Vec::new(),
        links: Vec::new(),
        attachments: Vec::new(),
    };

    if let Some(fields) = find_first(&root, &|n| n.tag() == Some("div") && n.has_class("fields")) {
        let names = find_all(slice::from_ref(fields), &|n| {
            n.tag() == Some("div") && n.has_class("field-name")
        });
        let values = find_all(slice::from_ref(fields), &|n| {
            n.tag() == Some("div") && n.has_class("field-values")
        });
        for (name, value) in names.iter().copied().zip(values.iter().copied()) {
            let field_name = find_first(slice::from_ref(name), &|n| n.tag() == Some("span"))
                .map(|n| n.text_content())
                .unwrap_or_default();
            let new_value = find_first(slice::from_ref(value), &|n| {
                n.has_class("field-new-value")
            })
            .map(|n| n.text_content());
            let old_value = find_first(slice::from_ref(value), &|n| {
                n.has_class("field-old-value")
            })
            .map(|n| n.text_content());
            entry.fields.push(FieldChange {
                name: field_name,
                old_value,
                new_value,
                ..Default::default()
            });
        }
    }

    if let Some(html_field) = find_first(&root, &|n| n.has_class("html-field")) {
        let name = find_first(slice::from_ref(html_field), &|n| {
            n.has_class("html-field-name")
        })
        .map(|n| n.text_content())
        .unwrap_or_default();
        let mut change = FieldChange {
            name,
            ..Default::default()
        };
        if let Some(container) = find_first(slice::from_ref(html_field), &|n| {
            n.has_class("html-field-old-value-container")
        }) {
            change.old_attachments = plan_anchor_downloads(container, &mut downloads);
            change.old_value = last_span_text(container);
        }
        if let Some(container) = find_first(slice::from_ref(html_field), &|n| {
            n.has_class("html-field-new-value-container")
        }) {
            change.new_attachments = plan_anchor_downloads(container, &mut downloads);
            change.new_value = last_span_text(container);
        }
        entry.fields.push(change);
    }

    // Edited comments nest plain comment divs, so probe the edited layout
    // first and only then treat a bare comment div as an addition.
    if let Some(edited) = find_first(&root, &|n| n.has_class("history-item-comment-edited")) {
        let mut change = FieldChange {
            name: "Comments".to_string(),
            ..Default::default()
        };
        if let Some(comment) = find_first(slice::from_ref(edited), &|n| n.has_class("old-comment"))
        {
            change.old_attachments = plan_anchor_downloads(comment, &mut downloads);
            change.old_value = comment_body_text(comment);
        }
        if let Some(comment) = find_first(slice::from_ref(edited), &|n| n.has_class("new-comment"))
        {
            change.new_attachments = plan_anchor_downloads(comment, &mut downloads);
            change.new_value = comment_body_text(comment);
        }
        entry.fields.push(change);
    } else if let Some(added) = find_first(&root, &|n| n.has_class("history-item-comment")) {
        let new_attachments = plan_anchor_downloads(added, &mut downloads);
        entry.fields.push(FieldChange {
            name: "Comments".to_string(),
            old_value: None,
            new_value: Some(added.text_content()),
            old_attachments: Vec::new(),
            new_attachments,
        });
    }

    if let Some(links) = find_first(&root, &|n| n.has_class("history-links")) {
        let changed = find_all(slice::from_ref(links), &|n| {
            n.tag() == Some("div") && n.has_class("link")
        });
        for link in changed {
            let change = if link.has_class("link-delete") {
                ChangeKind::Deleted
            } else {
                ChangeKind::Added
            };
            let kind = find_first(slice::from_ref(link), &|n| n.has_class("link-display-name"))
                .map(|n| n.text_content())
                .unwrap_or_default();
            let Some(text_span) =
                find_first(slice::from_ref(link), &|n| n.has_class("link-text"))
            else {
                continue;
            };
            let anchor = find_first(slice::from_ref(text_span), &|n| n.tag() == Some("a"));
            let title = match anchor {
                Some(anchor) => {
                    let text = anchor.text_content();
                    text.trim_start_matches([':', ' ']).to_string()
                }
                None => text_span.text_content(),
            };
            let target = anchor
                .and_then(|a| a.attr("href"))
                .map(str::to_string)
                .unwrap_or_else(|| text_span.text_content());
            entry.links.push(LinkChange {
                change,
                kind,
                target,
                title,
            });
        }
    }

    if let Some(attachments) = find_first(&root, &|n| n.has_class("history-attachments")) {
        let changed = find_all(slice::from_ref(attachments), &|n| {
            n.tag() == Some("div") && n.has_class("attachment")
        });
        for attachment in changed {
            let file_name = find_first(slice::from_ref(attachment), &|n| {
                n.tag() == Some("button") && n.has_class("attachment-text")
            })
            .map(|n| n.text_content());
            let change = if find_first(slice::from_ref(attachment), &|n| n.tag() == Some("del"))
                .is_some()
            {
                ChangeKind::Deleted
            } else {
                ChangeKind::Added
            };
            entry.attachments.push(AttachmentChange { change, file_name });
        }
    }

    Ok((entry, downloads))
}

fn last_span_text(container: &Node) -> Option<String> {
    find_all(slice::from_ref(container), &|n| n.tag() == Some("span"))
        .last()
        .map(|n| n.text_content())
}

fn comment_body_text(container: &Node) -> Option<String> {
    find_first(slice::from_ref(container), &|n| {
        n.has_class("history-item-comment")
    })
    .map(|n| n.text_content())
}

/// Plan inline staging for every anchor under the container; returns the
/// staged names and queues the downloads.
fn plan_anchor_downloads(container: &Node, downloads: &mut Vec<AttachmentRef>) -> Vec<String> {
    let mut names = Vec::new();
    for anchor in find_all(slice::from_ref(container), &|n| n.tag() == Some("a")) {
        let Some(href) = anchor.attr("href") else {
            continue;
        };
        let Some(plan) = plan_inline_staging(href, None) else {
            continue;
        };
        names.push(plan.filename.clone());
        downloads.push(plan);
    }
    names
}

pub fn extract_discussions<U: UiActions>(
    ui: &mut U,
    config: &ScrapeConfig,
) -> Result<Vec<Discussion>> {
    // The first comment header doubles as a readiness probe; the section
    // renders late.
    for attempt in 0..config.max_retries {
        if ui.locate(selectors::FIRST_COMMENT_HEADER)?.is_some() {
            break;
        }
        debug!(attempt, "waiting for discussion entries");
        sleep(config.retry_delay);
    }

    let Some(container) = ui.locate(selectors::COMMENTS_SECTION)? else {
        warn!("comments section never rendered");
        return Ok(Vec::new());
    };

    let html = ui.inner_html(&container)?;
    let comments = parse_comments(&html);

    let mut discussions = Vec::new();
    for (index, comment) in comments.into_iter().enumerate() {
        let timestamp = resolve_comment_timestamp(ui, &container, index + 1, config)?;
        let mut attachments = Vec::new();
        for src in &comment.image_srcs {
            let Some(plan) = plan_inline_staging(src, timestamp.as_deref()) else {
                warn!(url = %src, "unparseable comment attachment URL, skipping");
                continue;
            };
            stage_download(ui, &plan)?;
            attachments.push(plan);
        }
        discussions.push(Discussion {
            author: comment.author,
            content: comment.content,
            timestamp,
            attachments,
        });
    }
    Ok(discussions)
}

struct ParsedComment {
    author: String,
    content: String,
    image_srcs: Vec<String>,
}

fn parse_comments(html: &str) -> Vec<ParsedComment> {
    let root = parse_fragment(html);
    find_all(&root, &|n| n.has_class("comment-item-right"))
        .into_iter()
        .map(|item| {
            let author = find_first(slice::from_ref(item), &|n| {
                n.tag() == Some("span") && n.has_class("user-display-name")
            })
            .map(|n| n.text_content())
            .unwrap_or_default();
            let content = find_first(slice::from_ref(item), &|n| {
                n.tag() == Some("div") && n.has_class("comment-content")
            })
            .map(convert::node_to_markdown)
            .unwrap_or_default();
            let image_srcs = find_all(slice::from_ref(item), &|n| n.tag() == Some("img"))
                .into_iter()
                .filter_map(|img| img.attr("src").map(str::to_string))
                .collect();
            ParsedComment {
                author,
                content,
                image_srcs,
            }
        })
        .collect()
}

/// Comment timestamps only surface through a hover tooltip. A tooltip that
/// never renders, or renders text no configured format accepts, degrades to
/// `None`; the staged file names then carry no date prefix.
fn resolve_comment_timestamp<U: UiActions>(
    ui: &mut U,
    container: &ElementHandle,
    position: usize,
    config: &ScrapeConfig,
) -> Result<Option<String>> {
    let xpath = selectors::comment_timestamp(position);
    for attempt in 0..config.max_retries {
        let Some(stamp) = absent_if_stale(ui.locate(&xpath))? else {
            sleep(config.retry_delay);
            continue;
        };
        if let Err(error) = ui.hover(&stamp) {
            debug!(position, %error, "hover on comment timestamp failed");
            sleep(config.retry_delay);
            continue;
        }
        if let Some(tooltip) = ui.locate(selectors::TOOLTIP_SUBTEXT)? {
            let text = ui.element_text(&tooltip)?;
            let normalized = match convert::normalize_timestamp(&text, &config.timestamp_formats) {
                Ok(value) => Some(value),
                Err(error) => {
                    warn!(position, %error, "unparseable comment timestamp");
                    None
                }
            };
            ui.remove_node(&tooltip)?;
            return Ok(normalized);
        }
        debug!(position, attempt, "tooltip did not render, nudging the panel");
        if let Err(error) = ui.click_element(container) {
            debug!(%error, "panel nudge failed");
        }
        sleep(config.retry_delay);
    }
    warn!(position, "comment timestamp never resolved");
    Ok(None)
}

pub fn extract_related_work<U: UiActions>(
    ui: &mut U,
    panel: &ElementHandle,
    config: &ScrapeConfig,
) -> Result<Vec<RelatedGroup>> {
    let mut tab = absent_if_stale(ui.locate_in(panel, selectors::RELATED_TAB))?;
    let mut attempt = 0;
    while tab.is_none() && attempt < config.max_retries {
        debug!(attempt, "waiting for related work tab");
        sleep(config.retry_delay);
        tab = absent_if_stale(ui.locate_in(panel, selectors::RELATED_TAB))?;
        attempt += 1;
    }
    let Some(tab) = tab else {
        warn!("related work tab never rendered");
        return Ok(Vec::new());
    };

    // Item kinds without a links tab reuse the slot for something else.
    if ui.element_text(&tab)?.is_empty() || !ui.accessible_name(&tab)?.contains("Links") {
        return Ok(Vec::new());
    }

    ui.click_element(&tab)?;
    sleep(config.retry_delay);

    if let Some(canvas) = ui.locate_in(panel, selectors::RELATED_GRID_CANVAS)? {
        ui.scroll_to_bottom(&canvas)?;
    }

    let rows = ui.locate_all_in(panel, selectors::RELATED_ROWS)?;
    if rows.is_empty() {
        ui.click_in(panel, selectors::RELATED_DETAILS_TAB)?;
        return Ok(Vec::new());
    }
    // Clicking the last row forces the grid to realize every row.
    if let Some(last) = rows.last() {
        ui.click_element(last)?;
    }
    let rows = ui.locate_all_in(panel, selectors::RELATED_ROWS)?;

    let html = ui.inner_html(panel)?;
    let root = parse_fragment(&html);
    let Some(canvas) = find_first(&root, &|n| {
        n.tag() == Some("div") && n.has_class("grid-canvas")
    }) else {
        ui.click_in(panel, selectors::RELATED_DETAILS_TAB)?;
        return Ok(Vec::new());
    };

    // The parsed rows and the located rows come from the same grid in the
    // same document order, so they align by index.
    let level_nodes = find_all(slice::from_ref(canvas), &|n| {
        n.tag() == Some("div") && n.attr("aria-level").is_some()
    });

    let mut groups: Vec<RelatedGroup> = Vec::new();
    let mut in_group = false;
    for (index, node) in level_nodes.iter().copied().enumerate() {
        if node.attr("aria-level") == Some("1") {
            match relation_label(node) {
                Some(kind) => {
                    groups.push(RelatedGroup {
                        kind,
                        items: Vec::new(),
                    });
                    in_group = true;
                }
                None => in_group = false,
            }
            continue;
        }
        if !in_group {
            continue;
        }

        let Some(anchor) = find_first(slice::from_ref(node), &|n| n.tag() == Some("a")) else {
            continue;
        };
        let Some(href) = anchor.attr("href") else {
            continue;
        };
        let id = href.rsplit('/').next().unwrap_or_default().to_string();
        let title = convert::sanitize_title(&anchor.text_content());

        let Some(row) = rows.get(index) else {
            continue;
        };
        // Rows without an Updated span have not materialized; skip them.
        let Some(updated) = absent_if_stale(ui.locate_in(row, selectors::RELATED_UPDATED_SPAN))?
        else {
            continue;
        };
        if let Err(error) = ui.hover(&updated) {
            warn!(id = %id, %error, "hover on related row failed, skipping");
            continue;
        }
        let Some(popup) = ui.locate(selectors::RELATED_UPDATED_POPUP)? else {
            warn!(id = %id, "update popup never rendered, skipping row");
            continue;
        };
        let popup_text = ui.element_text(&popup)?;
        let updated_at = match convert::normalize_timestamp(&popup_text, &config.timestamp_formats)
        {
            Ok(value) => value,
            Err(error) => {
                warn!(id = %id, %error, "unparseable update popup, skipping row");
                ui.remove_node(&popup)?;
                continue;
            }
        };
        ui.remove_node(&popup)?;

        if let Some(group) = groups.last_mut() {
            group.items.push(RelatedItem {
                id,
                title,
                updated_at,
                url: href.to_string(),
            });
        }
    }

    ui.click_in(panel, selectors::RELATED_DETAILS_TAB)?;
    Ok(groups)
}

/// Group headers read as "Child\u{a0}(3)"; strip the count and the no-break
/// space, then check the label against the known relation kinds.
fn relation_label(node: &Node) -> Option<String> {
    let raw = find_first(slice::from_ref(node), &|n| n.tag() == Some("span"))?.text_content();
    let head = raw.trim().split('(').next().unwrap_or("");
    let label = head.replace('\u{a0}', "");
    let label = label.trim().to_string();
    selectors::RELATION_LABELS
        .contains(&label.as_str())
        .then_some(label)
}

pub fn extract_attachments<U: UiActions>(
    ui: &mut U,
    config: &ScrapeConfig,
) -> Result<Vec<AttachmentRef>> {
    // The tab badge is absent when the item has no attachments.
    if ui.read_text(selectors::ATTACHMENTS_COUNT)?.is_none() {
        debug!("no attachment count badge, skipping tab");
        return Ok(Vec::new());
    }
    if let Err(error) = ui.click(selectors::ATTACHMENTS_TAB) {
        warn!(%error, "attachments tab never became clickable");
        return Ok(Vec::new());
    }

    let mut rows = Vec::new();
    for attempt in 0..config.max_retries {
        rows = ui.locate_all(selectors::ATTACHMENT_ROWS)?;
        if !rows.is_empty() {
            break;
        }
        debug!(attempt, "waiting for attachment rows");
        sleep(config.retry_delay);
    }

    let grid_format = [convert::ATTACHMENT_GRID_FORMAT.to_string()];
    let mut attachments = Vec::new();
    for index in 0..rows.len() {
        let mut resolved = resolve_attachment_row(ui, index)?;
        let mut attempt = 0;
        while resolved.is_none() && attempt < config.max_retries {
            debug!(index, attempt, "retrying attachment row");
            sleep(config.retry_delay);
            resolved = resolve_attachment_row(ui, index)?;
            attempt += 1;
        }
        let Some((link, date_cell)) = resolved else {
            warn!(index, "attachment row never yielded a link, skipping");
            continue;
        };

        let raw_date = ui.element_text(&date_cell)?;
        let attached_at = convert::normalize_timestamp(&raw_date, &grid_format)?;
        let Some(href) = ui.read_attribute(&link, "href")? else {
            warn!(index, "attachment link has no href, skipping");
            continue;
        };
        let Some(plan) = plan_grid_staging(&href, &attached_at) else {
            warn!(index, url = %href, "file name not found on attachment, skipping");
            continue;
        };
        stage_download(ui, &plan)?;
        attachments.push(plan);
    }

    ui.click(selectors::DETAILS_TAB)?;
    Ok(attachments)
}

fn resolve_attachment_row<U: UiActions>(
    ui: &mut U,
    index: usize,
) -> Result<Option<(ElementHandle, ElementHandle)>> {
    let rows = ui.locate_all(selectors::ATTACHMENT_ROWS)?;
    let Some(row) = rows.get(index) else {
        return Ok(None);
    };
    let Some(link) = absent_if_stale(ui.locate_in(row, selectors::ROW_LINK))? else {
        return Ok(None);
    };
    let Some(date_cell) = absent_if_stale(ui.locate_in(row, selectors::ATTACHMENT_DATE_CELL))?
    else {
        return Ok(None);
    };
    Ok(Some((link, date_cell)))
}

pub fn extract_development<U: UiActions>(
    ui: &mut U,
    config: &ScrapeConfig,
) -> Result<Vec<Changeset>> {
    show_more_all(ui, selectors::DEVELOPMENT_SHOW_MORE)?;
    let items = ui.locate_all(selectors::DEVELOPMENT_ITEMS)?;
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let original_window = ui.current_window()?;

    let mut results = Vec::new();
    for index in 0..items.len() {
        let current = ui.locate_all(selectors::DEVELOPMENT_ITEMS)?;
        let Some(item) = current.get(index) else {
            break;
        };

        if development_row_failed(ui, item)? {
            debug!(index, "skipping failed build row");
            continue;
        }

        if let Err(error) = ui.click_in(item, selectors::ROW_LINK) {
            warn!(index, %error, "build link would not open, skipping");
            continue;
        }
        if !wait_for_extra_window(ui, config)? {
            warn!(index, "build page never opened, skipping");
            continue;
        }
        let handles = ui.window_handles()?;
        let Some(build_window) = handles.last() else {
            continue;
        };
        ui.focus_window(build_window)?;

        let url = ui.current_url()?;
        let id = url.rsplit('/').next().unwrap_or_default().to_string();
        let title = ui.page_title()?;
        let files = extract_changesets(ui, config)?;
        results.push(Changeset { id, title, files });

        ui.close_window()?;
        ui.focus_window(&original_window)?;
    }
    Ok(results)
}

fn development_row_failed<U: UiActions>(ui: &mut U, item: &ElementHandle) -> Result<bool> {
    for marker in selectors::FAILED_BUILD_MARKERS.iter().copied() {
        if let Some(found) = absent_if_stale(ui.locate_in(item, marker))? {
            if !ui.element_text(&found)?.is_empty() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn wait_for_extra_window<U: UiActions>(ui: &mut U, config: &ScrapeConfig) -> Result<bool> {
    let deadline = Instant::now() + config.max_wait_time;
    loop {
        if ui.window_handles()?.len() >= 2 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(config.poll_interval);
    }
}

/// Walk the changed-file tree on a build page. The first tree item is the
/// changeset root, not a file; file name headers are 1-based and offset past
/// it.
fn extract_changesets<U: UiActions>(
    ui: &mut U,
    config: &ScrapeConfig,
) -> Result<Vec<ChangedFile>> {
    let tree_items = ui.locate_all(selectors::CHANGESET_TREE_ITEMS)?;
    let mut files = Vec::new();
    for (position, item) in tree_items.iter().enumerate().skip(1) {
        if let Err(error) = ui.click_element(item) {
            warn!(position, %error, "changed file row would not open, skipping");
            continue;
        }
        let name = ui.read_text(&selectors::changeset_file_name(position + 1))?;
        let path = ui.read_text(selectors::CHANGESET_FILE_PATH)?;
        let content = if config.capture_changeset_content {
            changeset_content(ui)?
        } else {
            None
        };
        files.push(ChangedFile {
            name,
            path,
            content,
        });
    }
    Ok(files)
}

fn changeset_content<U: UiActions>(ui: &mut U) -> Result<Option<String>> {
    let lines = ui.locate_all(selectors::CHANGESET_LINE_CONTENT)?;
    let mut content = String::new();
    for line in &lines {
        let text = ui.element_text(line)?;
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&text);
    }
    Ok((!content.is_empty()).then_some(content))
}

/// Click a "show more" button until it disappears.
pub(crate) fn show_more_all<U: UiActions>(ui: &mut U, xpath: &str) -> Result<()> {
    for _ in 0..SHOW_MORE_LIMIT {
        let Some(button) = ui.locate(xpath)? else {
            return Ok(());
        };
        if let Err(error) = ui.click_element(&button) {
            debug!(%error, "show-more click failed");
            return Ok(());
        }
    }
    warn!(xpath, "show-more button persisted after {SHOW_MORE_LIMIT} clicks");
    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_map(url: &str) -> BTreeMap<String, String> {
        Url::parse(url)
            .expect("staged url parses")
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }

    #[test]
    fn inline_staging_rewrites_guid_path_and_params() {
        let raw = "https://tracker.test/org/proj/_apis/wit/fields/download?FileName=shot.png&FileNameGuid=abc-123&api-version=5.1";
        let plan = plan_inline_staging(raw, None).expect("plan");

        assert!(plan.filename.ends_with("_shot.png"));
        let url = Url::parse(&plan.url).expect("url");
        assert!(url.path().ends_with("/attachments/abc-123"));

        let params = query_map(&plan.url);
        assert_eq!(params.get("download").map(String::as_str), Some("True"));
        assert_eq!(params.get("fileName"), Some(&plan.filename));
        assert_eq!(params.get("api-version").map(String::as_str), Some("5.1"));
        assert!(!params.contains_key("FileName"));
        assert!(!params.contains_key("FileNameGuid"));
    }

    #[test]
    fn inline_staging_applies_prefix_and_keeps_path_without_guid() {
        let raw = "https://tracker.test/org/proj/_apis/wit/download?fileName=trace.log";
        let plan = plan_inline_staging(raw, Some("2024_01_02T03_04_05")).expect("plan");

        assert!(plan.filename.starts_with("2024_01_02T03_04_05_"));
        assert!(plan.filename.ends_with("_trace.log"));
        let url = Url::parse(&plan.url).expect("url");
        assert_eq!(url.path(), "/org/proj/_apis/wit/download");
    }

    #[test]
    fn inline_staging_without_file_name_is_none() {
        let raw = "https://tracker.test/org/proj/_apis/wit/download?api-version=5.1";
        assert!(plan_inline_staging(raw, None).is_none());
        assert!(plan_inline_staging("not a url", None).is_none());
    }

    #[test]
    fn staged_names_are_unique_per_download() {
        let raw = "https://tracker.test/d?fileName=same.png";
        let first = plan_inline_staging(raw, None).expect("first");
        let second = plan_inline_staging(raw, None).expect("second");
        assert_ne!(first.filename, second.filename);
    }

    #[test]
    fn grid_staging_preserves_key_and_prefixes_date() {
        let raw = "https://tracker.test/org/proj/_apis/wit/download?FileName=data.csv&api-version=5.1";
        let plan = plan_grid_staging(raw, "2024_03_04T10_00_00").expect("plan");

        assert!(plan.filename.starts_with("2024_03_04T10_00_00_"));
        assert!(plan.filename.ends_with("_data.csv"));

        let params = query_map(&plan.url);
        assert_eq!(params.get("FileName"), Some(&plan.filename));
        assert!(!params.contains_key("download"));
        assert!(!params.contains_key("fileName"));
    }

    #[test]
    fn steps_grid_flattens_rows_and_drops_placeholder() {
        let html = r##"
            <div class="test-steps-list">
              <div class="grid-canvas" role="presentation">
                <div class="grid-row grid-row-normal">
                  <p>Open the app</p><p>It starts</p>
                  <a href="#">shot.png added</a>
                </div>
                <div class="grid-row grid-row-normal"><p>placeholder</p></div>
              </div>
            </div>"##;
        let root = parse_fragment(html);
        assert_eq!(
            steps_grid_lines(&root),
            "Open the app \t It starts \t  \t shot.png \n"
        );
    }

    #[test]
    fn bug_description_composes_present_sections() {
        let html = r#"
            <div aria-label="Collapse Repro Steps section."></div>
            <div aria-label="Repro Steps"><p>Crash on save</p></div>
            <div aria-label="System Info"><p>build 42</p></div>"#;
        let root = parse_fragment(html);
        assert_eq!(
            compose_bug_description(&root).expect("description"),
            "* Repro Steps\n** Crash on save\n* System Info\n** build 42\n"
        );
    }

    #[test]
    fn resolution_block_is_appended_to_description() {
        let html = r#"
            <div aria-label="Resolution section."></div>
            <div aria-label="Description"><p>Fixed now</p></div>
            <div aria-label="Resolution"><p>Restart helped</p></div>"#;
        let root = parse_fragment(html);
        let (description, images) = description_with_resolution(&root);
        assert_eq!(
            description.expect("description"),
            "Fixed now\n* Repro Steps\n\t* Restart helped\n"
        );
        assert!(images.is_empty());
    }

    #[test]
    fn history_entry_reads_fields_links_and_attachments() {
        let html = r#"
            <span class="history-item-name-changed-by">Ada</span>
            <span class="history-item-date">Mon 01/04/2024 09:30</span>
            <div class="history-item-summary-text">Changed State</div>
            <div class="fields">
              <div class="field-row">
                <div class="field-name"><span>State</span></div>
                <div class="field-values">
                  <span class="field-new-value">Active</span>
                  <span class="field-old-value">New</span>
                </div>
              </div>
            </div>
            <div class="history-links">
              <div class="link">
                <span class="link-display-name">Child</span>
                <span class="link-text"><a href="https://tracker.test/x/9">: Fix things</a></span>
              </div>
              <div class="link link-delete">
                <span class="link-display-name">Related</span>
                <span class="link-text">plain text</span>
              </div>
            </div>
            <div class="history-attachments">
              <div class="attachment"><button class="attachment-text">log.txt</button></div>
              <div class="attachment"><del><button class="attachment-text">old.txt</button></del></div>
            </div>"#;
        let (entry, downloads) = parse_history_entry(html).expect("entry");

        assert_eq!(entry.author, "Ada");
        assert_eq!(entry.timestamp, "Mon 01/04/2024 09:30");
        assert_eq!(entry.title, "Changed State");
        assert!(downloads.is_empty());

        assert_eq!(entry.fields.len(), 1);
        assert_eq!(entry.fields[0].name, "State");
        assert_eq!(entry.fields[0].old_value.as_deref(), Some("New"));
        assert_eq!(entry.fields[0].new_value.as_deref(), Some("Active"));

        assert_eq!(entry.links.len(), 2);
        assert_eq!(entry.links[0].change, ChangeKind::Added);
        assert_eq!(entry.links[0].kind, "Child");
        assert_eq!(entry.links[0].target, "https://tracker.test/x/9");
        assert_eq!(entry.links[0].title, "Fix things");
        assert_eq!(entry.links[1].change, ChangeKind::Deleted);
        assert_eq!(entry.links[1].target, "plain text");

        assert_eq!(entry.attachments.len(), 2);
        assert_eq!(entry.attachments[0].change, ChangeKind::Added);
        assert_eq!(entry.attachments[0].file_name.as_deref(), Some("log.txt"));
        assert_eq!(entry.attachments[1].change, ChangeKind::Deleted);
    }

    #[test]
    fn history_entry_edited_comment_wins_over_nested_added() {
        let html = r#"
            <span class="history-item-name-changed-by">Ada</span>
            <span class="history-item-date">Tue 02/04/2024 10:00</span>
            <div class="history-item-summary-text">Edited a comment</div>
            <div class="history-item-comment-edited">
              <div class="old-comment"><div class="history-item-comment">before</div></div>
              <div class="new-comment">
                <div class="history-item-comment">after</div>
                <a href="https://tracker.test/a?fileName=pic.png">pic.png</a>
              </div>
            </div>"#;
        let (entry, downloads) = parse_history_entry(html).expect("entry");

        assert_eq!(entry.fields.len(), 1);
        let change = &entry.fields[0];
        assert_eq!(change.name, "Comments");
        assert_eq!(change.old_value.as_deref(), Some("before"));
        assert_eq!(change.new_value.as_deref(), Some("after"));
        assert!(change.old_attachments.is_empty());
        assert_eq!(change.new_attachments.len(), 1);
        assert!(change.new_attachments[0].ends_with("_pic.png"));
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].filename, change.new_attachments[0]);
    }

    #[test]
    fn history_entry_added_comment_without_edit() {
        let html = r#"
            <span class="history-item-name-changed-by">Lin</span>
            <span class="history-item-date">Wed 03/04/2024 11:00</span>
            <div class="history-item-summary-text">Commented</div>
            <div class="history-item-comment">hello world</div>"#;
        let (entry, _) = parse_history_entry(html).expect("entry");

        assert_eq!(entry.fields.len(), 1);
        assert_eq!(entry.fields[0].name, "Comments");
        assert_eq!(entry.fields[0].old_value, None);
        assert_eq!(entry.fields[0].new_value.as_deref(), Some("hello world"));
    }

    #[test]
    fn history_entry_without_author_is_an_error() {
        let html = r#"<div class="history-item-summary-text">orphan</div>"#;
        assert!(parse_history_entry(html).is_err());
    }

    #[test]
    fn comments_parse_author_markdown_and_images() {
        let html = r#"
            <div class="comment-item-right">
              <span class="user-display-name">Lin</span>
              <div class="comment-content"><p>Looks <strong>good</strong></p></div>
              <img src="https://tracker.test/a?fileName=x.png"/>
            </div>"#;
        let comments = parse_comments(html);
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "Lin");
        assert_eq!(comments[0].content, "Looks good");
        assert_eq!(comments[0].image_srcs.len(), 1);
    }

    #[test]
    fn relation_labels_strip_counts_and_reject_unknown_groups() {
        let root = parse_fragment(
            "<div aria-level=\"1\"><span>Duplicate Of\u{a0}(2)</span></div>",
        );
        assert_eq!(
            relation_label(&root[0]).as_deref(),
            Some("Duplicate Of")
        );

        let root = parse_fragment("<div aria-level=\"1\"><span>Attachments (1)</span></div>");
        assert_eq!(relation_label(&root[0]), None);
    }
}
