use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};

/// Output shape for every timestamp that ends up in filenames or snapshot data.
pub const SNAPSHOT_DATE_FORMAT: &str = "%Y_%m_%dT%H_%M_%S";

/// Tooltip timestamps as the tracker renders them in most locales.
pub const DEFAULT_TOOLTIP_FORMAT: &str = "%d %B %Y %H:%M:%S";

/// Attachment grid dates are shorter than tooltip dates.
pub const ATTACHMENT_GRID_FORMAT: &str = "%d/%m/%Y %H:%M";

/// History entry dates carry a weekday prefix.
pub const HISTORY_ENTRY_FORMAT: &str = "%a %d/%m/%Y %H:%M";

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// One node of a parsed HTML fragment. The parser is deliberately small and
/// tailored to the markup the tracker serializes out of `innerHTML`; it is not
/// a general HTML parser.
#[derive(Debug, Clone)]
pub enum Node {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<Node>,
    },
    Text(String),
}

impl Node {
    pub fn tag(&self) -> Option<&str> {
        match self {
            Node::Element { tag, .. } => Some(tag.as_str()),
            Node::Text(_) => None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        match self {
            Node::Element { attrs, .. } => attrs
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str()),
            Node::Text(_) => None,
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|value| value.split_whitespace().any(|token| token == class))
            .unwrap_or(false)
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Element { children, .. } => children,
            Node::Text(_) => &[],
        }
    }

    /// Concatenated text of this node and everything below it.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(text),
        Node::Element { children, .. } => {
            for child in children {
                collect_text(child, out);
            }
        }
    }
}

/// Depth-first search over a fragment, document order.
pub fn find_all<'a, F>(nodes: &'a [Node], pred: &F) -> Vec<&'a Node>
where
    F: Fn(&Node) -> bool,
{
    let mut out = Vec::new();
    for node in nodes {
        collect_matches(node, pred, &mut out);
    }
    out
}

fn collect_matches<'a, F>(node: &'a Node, pred: &F, out: &mut Vec<&'a Node>)
where
    F: Fn(&Node) -> bool,
{
    if pred(node) {
        out.push(node);
    }
    for child in node.children() {
        collect_matches(child, pred, out);
    }
}

pub fn find_first<'a, F>(nodes: &'a [Node], pred: &F) -> Option<&'a Node>
where
    F: Fn(&Node) -> bool,
{
    for node in nodes {
        if let Some(found) = first_match(node, pred) {
            return Some(found);
        }
    }
    None
}

fn first_match<'a, F>(node: &'a Node, pred: &F) -> Option<&'a Node>
where
    F: Fn(&Node) -> bool,
{
    if pred(node) {
        return Some(node);
    }
    for child in node.children() {
        if let Some(found) = first_match(child, pred) {
            return Some(found);
        }
    }
    None
}

/// Parse an HTML fragment into a node tree. Tolerates unclosed tags, stray
/// close tags, comments, and doctype noise; browser-serialized fragments are
/// balanced in practice so the tolerance is rarely exercised.
pub fn parse_fragment(html: &str) -> Vec<Node> {
    let bytes = html.as_bytes();
    let mut pos = 0usize;
    // (tag, attrs, children) frames; the root frame has an empty tag
    let mut stack: Vec<(String, Vec<(String, String)>, Vec<Node>)> =
        vec![(String::new(), Vec::new(), Vec::new())];

    while pos < bytes.len() {
        if bytes[pos] == b'<' {
            if html[pos..].starts_with("<!--") {
                pos = match html[pos..].find("-->") {
                    Some(end) => pos + end + 3,
                    None => bytes.len(),
                };
                continue;
            }
            if html[pos..].starts_with("<!") || html[pos..].starts_with("<?") {
                pos = match html[pos..].find('>') {
                    Some(end) => pos + end + 1,
                    None => bytes.len(),
                };
                continue;
            }
            if html[pos..].starts_with("</") {
                let end = match html[pos..].find('>') {
                    Some(end) => pos + end,
                    None => bytes.len(),
                };
                let name = html[pos + 2..end].trim().to_ascii_lowercase();
                close_element(&mut stack, &name);
                pos = (end + 1).min(bytes.len());
                continue;
            }
            if let Some((tag, attrs, self_closing, next)) = parse_open_tag(html, pos) {
                if self_closing || VOID_TAGS.contains(&tag.as_str()) {
                    push_node(
                        &mut stack,
                        Node::Element {
                            tag,
                            attrs,
                            children: Vec::new(),
                        },
                    );
                } else {
                    stack.push((tag, attrs, Vec::new()));
                }
                pos = next;
                continue;
            }
            // Bare '<' that is not a tag: treat as text
            push_text(&mut stack, "<");
            pos += 1;
        } else {
            let end = html[pos..]
                .find('<')
                .map(|offset| pos + offset)
                .unwrap_or(bytes.len());
            push_text(&mut stack, &html[pos..end]);
            pos = end;
        }
    }

    // Unclosed elements fold into their parents
    while stack.len() > 1 {
        let (tag, attrs, children) = stack.pop().unwrap_or_default();
        push_node(
            &mut stack,
            Node::Element {
                tag,
                attrs,
                children,
            },
        );
    }
    stack.pop().map(|(_, _, children)| children).unwrap_or_default()
}

fn parse_open_tag(html: &str, start: usize) -> Option<(String, Vec<(String, String)>, bool, usize)> {
    let rest = &html[start + 1..];
    let mut name_end = 0usize;
    for (idx, ch) in rest.char_indices() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == ':' {
            name_end = idx + ch.len_utf8();
        } else {
            break;
        }
    }
    if name_end == 0 {
        return None;
    }
    let tag = rest[..name_end].to_ascii_lowercase();

    let mut pos = name_end;
    let mut attrs = Vec::new();
    let bytes = rest.as_bytes();
    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Some((tag, attrs, false, html.len()));
        }
        if bytes[pos] == b'>' {
            return Some((tag, attrs, false, start + 1 + pos + 1));
        }
        if bytes[pos] == b'/' {
            let close = rest[pos..].find('>').map(|offset| pos + offset)?;
            return Some((tag, attrs, true, start + 1 + close + 1));
        }
        let attr_start = pos;
        while pos < bytes.len()
            && bytes[pos] != b'='
            && bytes[pos] != b'>'
            && bytes[pos] != b'/'
            && !bytes[pos].is_ascii_whitespace()
        {
            pos += 1;
        }
        let name = rest[attr_start..pos].to_ascii_lowercase();
        if name.is_empty() {
            pos += 1;
            continue;
        }
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == b'=' {
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos < bytes.len() && (bytes[pos] == b'"' || bytes[pos] == b'\'') {
                let quote = bytes[pos];
                pos += 1;
                let value_start = pos;
                while pos < bytes.len() && bytes[pos] != quote {
                    pos += 1;
                }
                attrs.push((name, decode_entities(&rest[value_start..pos])));
                pos = (pos + 1).min(bytes.len());
            } else {
                let value_start = pos;
                while pos < bytes.len()
                    && bytes[pos] != b'>'
                    && !bytes[pos].is_ascii_whitespace()
                {
                    pos += 1;
                }
                attrs.push((name, decode_entities(&rest[value_start..pos])));
            }
        } else {
            attrs.push((name, String::new()));
        }
    }
}

fn close_element(stack: &mut Vec<(String, Vec<(String, String)>, Vec<Node>)>, name: &str) {
    let Some(open_at) = stack.iter().rposition(|(tag, _, _)| tag == name) else {
        return; // stray close tag
    };
    if open_at == 0 {
        return;
    }
    while stack.len() > open_at {
        let (tag, attrs, children) = match stack.pop() {
            Some(frame) => frame,
            None => return,
        };
        push_node(
            stack,
            Node::Element {
                tag,
                attrs,
                children,
            },
        );
    }
}

fn push_node(stack: &mut [(String, Vec<(String, String)>, Vec<Node>)], node: Node) {
    if let Some((_, _, children)) = stack.last_mut() {
        children.push(node);
    }
}

fn push_text(stack: &mut [(String, Vec<(String, String)>, Vec<Node>)], text: &str) {
    if text.is_empty() {
        return;
    }
    push_node(stack, Node::Text(decode_entities(text)));
}

/// Decode the handful of entities the tracker actually emits.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest[..rest.len().min(12)].find(';') else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => decode_numeric_entity(entity),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_numeric_entity(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let code = if let Some(hex) = digits.strip_prefix('x').or_else(|| digits.strip_prefix('X')) {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<u32>().ok()?
    };
    char::from_u32(code)
}

/// Convert a rendered HTML fragment into the markdown dialect the output tree
/// uses: block boundaries become newlines, anchors become inline links, and
/// lists follow the depth rules below.
pub fn fragment_to_markdown(html: &str) -> String {
    let nodes = parse_fragment(html);
    let mut out = String::new();
    render_nodes(&nodes, &mut out);
    out.trim_end().to_string()
}

/// Markdown for a single node out of an already parsed fragment.
pub fn node_to_markdown(node: &Node) -> String {
    let mut out = String::new();
    render_node(node, &mut out);
    out.trim_end().to_string()
}

fn render_nodes(nodes: &[Node], out: &mut String) {
    for node in nodes {
        render_node(node, out);
    }
}

fn render_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(text),
        Node::Element { tag, children, .. } => match tag.as_str() {
            "a" => {
                out.push_str(&anchor_markdown(node));
            }
            "ul" => render_list(node, ListKind::Unordered, out),
            "ol" => render_list(node, ListKind::Ordered, out),
            "br" => out.push('\n'),
            "div" | "p" => {
                render_nodes(children, out);
                out.push('\n');
            }
            "img" | "script" | "style" => {}
            _ => render_nodes(children, out),
        },
    }
}

fn anchor_markdown(node: &Node) -> String {
    let text = inline_text(node);
    let href = node.attr("href").unwrap_or_default();
    format!("[{text}]({href})")
}

/// Inline text of a node with anchors rendered as markdown and nested lists
/// excluded (list items own their lines).
fn inline_text(node: &Node) -> String {
    let mut out = String::new();
    for child in node.children() {
        inline_text_into(child, &mut out);
    }
    out
}

fn inline_text_into(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(text),
        Node::Element { tag, children, .. } => match tag.as_str() {
            "a" => out.push_str(&anchor_markdown(node)),
            "ul" | "ol" | "img" => {}
            _ => {
                for child in children {
                    inline_text_into(child, out);
                }
            }
        },
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Unordered,
    Ordered,
}

struct OrderedCounters {
    index: usize,
    letters: usize,
    romans: usize,
}

/// List rendering rules:
/// - unordered items: `* ` bullets, two spaces of indent per nesting depth;
/// - ordered depth 0: `1.`, `2.`, …
/// - ordered depth 1: `a.`–`z.`, then `aa.`, `ab.`, …, each line ending `\`
/// - ordered depth 2: lower-case roman, each line ending `\`, the first one
///   preceded by a continuation `\` on its own line
/// Counters span the whole top-level list and do not reset between sibling
/// sublists. Deeper ordered levels are dropped.
fn render_list(list: &Node, kind: ListKind, out: &mut String) {
    let mut counters = OrderedCounters {
        index: 0,
        letters: 0,
        romans: 0,
    };
    for child in list.children() {
        render_list_items(child, kind, 0, &mut counters, out);
    }
}

fn render_list_items(
    node: &Node,
    kind: ListKind,
    depth: usize,
    counters: &mut OrderedCounters,
    out: &mut String,
) {
    let Node::Element { tag, children, .. } = node else {
        return;
    };
    match (tag.as_str(), kind) {
        ("li", _) => {
            let text = inline_text(node);
            match kind {
                ListKind::Unordered => {
                    out.push_str(&"  ".repeat(depth));
                    out.push_str("* ");
                    out.push_str(&text);
                    out.push('\n');
                }
                ListKind::Ordered => match depth {
                    0 => {
                        counters.index += 1;
                        out.push_str(&format!("{}. {}\n", counters.index, text));
                    }
                    1 => {
                        let label = letter_label(counters.letters);
                        counters.letters += 1;
                        out.push_str(&format!("{label}. {text}\\\n"));
                    }
                    2 => {
                        if counters.romans == 0 {
                            out.push_str("\\\n");
                        }
                        counters.romans += 1;
                        out.push_str(&format!("{}. {}\\\n", roman_lower(counters.romans), text));
                    }
                    _ => {}
                },
            }
            for child in children {
                render_list_items(child, kind, depth, counters, out);
            }
        }
        ("ul", ListKind::Unordered) | ("ol", ListKind::Ordered) => {
            for child in children {
                render_list_items(child, kind, depth + 1, counters, out);
            }
        }
        // A list of the other kind nested inside this one renders on its own
        ("ul", ListKind::Ordered) => render_list(node, ListKind::Unordered, out),
        ("ol", ListKind::Unordered) => render_list(node, ListKind::Ordered, out),
        _ => {
            for child in children {
                render_list_items(child, kind, depth, counters, out);
            }
        }
    }
}

/// `0 -> a`, `25 -> z`, `26 -> aa`, `27 -> ab`, …
fn letter_label(n: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let last = LETTERS[n % 26] as char;
    if n >= 26 {
        let first = LETTERS[(n / 26 - 1) % 26] as char;
        format!("{first}{last}")
    } else {
        last.to_string()
    }
}

pub fn roman_lower(mut n: usize) -> String {
    const TABLE: &[(usize, &str)] = &[
        (1000, "m"),
        (900, "cm"),
        (500, "d"),
        (400, "cd"),
        (100, "c"),
        (90, "xc"),
        (50, "l"),
        (40, "xl"),
        (10, "x"),
        (9, "ix"),
        (5, "v"),
        (4, "iv"),
        (1, "i"),
    ];
    let mut out = String::new();
    for &(value, symbol) in TABLE {
        while n >= value {
            out.push_str(symbol);
            n -= value;
        }
    }
    out
}

/// Every `img` source URL in document order.
pub fn collect_image_sources(html: &str) -> Vec<String> {
    let nodes = parse_fragment(html);
    find_all(&nodes, &|node| node.tag() == Some("img"))
        .iter()
        .filter_map(|node| node.attr("src").map(str::to_string))
        .collect()
}

/// Filesystem-safe form of a display title: non-alphanumeric becomes `_`.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Hard-wrap long discussion content; continuation lines get a backslash and
/// an indent that lines up under the `* Content: ` prefix.
pub fn wrap_content(text: &str, max_columns: usize) -> String {
    if max_columns == 0 {
        return text.to_string();
    }
    let mut out = String::new();
    let mut rest = text;
    loop {
        let mut taken = 0usize;
        let mut split_at = rest.len();
        for (idx, _) in rest.char_indices() {
            if taken == max_columns {
                split_at = idx;
                break;
            }
            taken += 1;
        }
        if split_at >= rest.len() {
            out.push_str(rest);
            return out;
        }
        out.push_str(&rest[..split_at]);
        out.push_str("\\\n           ");
        rest = &rest[split_at..];
    }
}

/// Parse a free-text timestamp against an ordered list of formats, falling
/// back to a relaxed token scan, and emit the snapshot's normalized form.
pub fn normalize_timestamp(raw: &str, formats: &[String]) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("empty timestamp");
    }
    for format in formats {
        if let Some(parsed) = parse_with_format(trimmed, format) {
            return Ok(parsed.format(SNAPSHOT_DATE_FORMAT).to_string());
        }
    }
    if let Some(parsed) = relaxed_parse(trimmed) {
        return Ok(parsed.format(SNAPSHOT_DATE_FORMAT).to_string());
    }
    bail!("unparseable timestamp: {trimmed:?}")
}

fn parse_with_format(raw: &str, format: &str) -> Option<NaiveDateTime> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, format) {
        return Some(datetime);
    }
    NaiveDate::parse_from_str(raw, format)
        .ok()
        .map(|date| date.and_time(NaiveTime::MIN))
}

/// Relaxed day-first scan: picks day, month, year, and an optional time out
/// of the tokens and ignores everything else ("Updated by X 3 May 2024").
fn relaxed_parse(raw: &str) -> Option<NaiveDateTime> {
    let mut day: Option<u32> = None;
    let mut month: Option<u32> = None;
    let mut year: Option<i32> = None;
    let mut time: Option<NaiveTime> = None;

    for token in raw.split_whitespace() {
        let token = token.trim_matches(|ch: char| ch == ',' || ch == '.');
        if token.contains(':') {
            if time.is_none() {
                time = NaiveTime::parse_from_str(token, "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(token, "%H:%M"))
                    .ok();
            }
            continue;
        }
        if token.contains('/') {
            if let Ok(date) = NaiveDate::parse_from_str(token, "%d/%m/%Y") {
                day = Some(date.day());
                month = Some(date.month());
                year = Some(date.year());
            }
            continue;
        }
        if let Some(index) = month_index(token) {
            month = month.or(Some(index));
            continue;
        }
        if let Ok(number) = token.parse::<u32>() {
            if (1000..=9999).contains(&number) {
                year = year.or(Some(number as i32));
            } else if (1..=31).contains(&number) {
                day = day.or(Some(number));
            }
        }
    }

    let date = NaiveDate::from_ymd_opt(year?, month?, day?)?;
    Some(date.and_time(time.unwrap_or(NaiveTime::MIN)))
}

fn month_index(token: &str) -> Option<u32> {
    const MONTHS: &[&str] = &[
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    let lower = token.to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|month| **month == lower || (lower.len() == 3 && month.starts_with(&lower)))
        .map(|index| index as u32 + 1)
}

/// The `YYYY_MM_DD` prefix of a normalized timestamp, for per-day filenames.
pub fn day_part(normalized: &str) -> &str {
    normalized.split('T').next().unwrap_or(normalized)
}

#[cfg(test)]
mod tests {
    use super::{
        ATTACHMENT_GRID_FORMAT, DEFAULT_TOOLTIP_FORMAT, collect_image_sources, day_part,
        decode_entities, fragment_to_markdown, letter_label, normalize_timestamp, parse_fragment,
        roman_lower, sanitize_title, wrap_content,
    };

    fn formats(list: &[&str]) -> Vec<String> {
        list.iter().map(|format| format.to_string()).collect()
    }

    #[test]
    fn ordered_list_with_nested_sublist() {
        let html = "<ol><li>Parent<ol><li>Sub one</li><li>Sub two</li></ol></li></ol>";
        let markdown = fragment_to_markdown(html);
        assert_eq!(markdown, "1. Parent\na. Sub one\\\nb. Sub two\\");
    }

    #[test]
    fn ordered_list_letters_continue_across_sublists() {
        let html = "<ol>\
            <li>First<ol><li>one</li><li>two</li></ol></li>\
            <li>Second<ol><li>three</li></ol></li>\
            </ol>";
        let markdown = fragment_to_markdown(html);
        assert_eq!(
            markdown,
            "1. First\na. one\\\nb. two\\\n2. Second\nc. three\\"
        );
    }

    #[test]
    fn ordered_list_third_level_uses_roman() {
        let html = "<ol><li>Top<ol><li>Mid<ol><li>Deep</li><li>Deeper</li></ol></li></ol></li></ol>";
        let markdown = fragment_to_markdown(html);
        assert_eq!(markdown, "1. Top\na. Mid\\\n\\\ni. Deep\\\nii. Deeper\\");
    }

    #[test]
    fn unordered_list_indents_by_depth() {
        let html = "<ul><li>Parent<ul><li>Child</li></ul></li><li>Sibling</li></ul>";
        let markdown = fragment_to_markdown(html);
        assert_eq!(markdown, "* Parent\n  * Child\n* Sibling");
    }

    #[test]
    fn anchors_become_inline_links() {
        let html = "<div>See <a href=\"https://example.test/item/9\">item nine</a> here</div>";
        let markdown = fragment_to_markdown(html);
        assert_eq!(markdown, "See [item nine](https://example.test/item/9) here");
    }

    #[test]
    fn divs_and_breaks_become_newlines() {
        let html = "<div>first</div><div>second<br>third</div>";
        let markdown = fragment_to_markdown(html);
        assert_eq!(markdown, "first\nsecond\nthird");
    }

    #[test]
    fn entities_decode() {
        assert_eq!(decode_entities("a &amp; b &lt;c&gt;&nbsp;&#33;"), "a & b <c> !");
        assert_eq!(decode_entities("no entities"), "no entities");
        assert_eq!(decode_entities("dangling &amp"), "dangling &amp");
    }

    #[test]
    fn parser_tolerates_unclosed_tags() {
        let nodes = parse_fragment("<div><span>open<div>nested");
        assert_eq!(nodes.len(), 1);
        let text: String = nodes.iter().map(|node| node.text_content()).collect();
        assert_eq!(text, "opennested");
    }

    #[test]
    fn image_sources_in_document_order() {
        let html = "<div><img src=\"first.png\"><p><img src=\"second.png\"/></p></div>";
        assert_eq!(collect_image_sources(html), vec!["first.png", "second.png"]);
    }

    #[test]
    fn letter_labels_continue_past_z() {
        assert_eq!(letter_label(0), "a");
        assert_eq!(letter_label(25), "z");
        assert_eq!(letter_label(26), "aa");
        assert_eq!(letter_label(27), "ab");
        assert_eq!(letter_label(52), "ba");
    }

    #[test]
    fn roman_numerals() {
        assert_eq!(roman_lower(1), "i");
        assert_eq!(roman_lower(4), "iv");
        assert_eq!(roman_lower(9), "ix");
        assert_eq!(roman_lower(14), "xiv");
        assert_eq!(roman_lower(2024), "mmxxiv");
    }

    #[test]
    fn titles_sanitize_to_underscores() {
        assert_eq!(sanitize_title("Fix login (v2)!"), "Fix_login__v2__");
        assert_eq!(sanitize_title("already_safe_123"), "already_safe_123");
    }

    #[test]
    fn content_wraps_with_continuations() {
        let wrapped = wrap_content("abcdefghij", 4);
        assert_eq!(wrapped, "abcd\\\n           efgh\\\n           ij");
        assert_eq!(wrap_content("short", 90), "short");
    }

    #[test]
    fn timestamps_parse_primary_format() {
        let normalized =
            normalize_timestamp("01 May 2023 14:30:15", &formats(&[DEFAULT_TOOLTIP_FORMAT]))
                .expect("parse");
        assert_eq!(normalized, "2023_05_01T14_30_15");
    }

    #[test]
    fn timestamps_parse_attachment_grid_format() {
        let normalized =
            normalize_timestamp("01/05/2023 14:30", &formats(&[ATTACHMENT_GRID_FORMAT]))
                .expect("parse");
        assert_eq!(normalized, "2023_05_01T14_30_00");
    }

    #[test]
    fn timestamps_fall_back_to_relaxed_scan() {
        let normalized =
            normalize_timestamp("Smith 3 May 2024", &formats(&[DEFAULT_TOOLTIP_FORMAT]))
                .expect("parse");
        assert_eq!(normalized, "2024_05_03T00_00_00");
    }

    #[test]
    fn timestamps_unparseable_is_an_error() {
        assert!(normalize_timestamp("not a date", &formats(&[DEFAULT_TOOLTIP_FORMAT])).is_err());
        assert!(normalize_timestamp("   ", &[]).is_err());
    }

    #[test]
    fn day_part_strips_time() {
        assert_eq!(day_part("2023_05_01T14_30_15"), "2023_05_01");
    }
}
