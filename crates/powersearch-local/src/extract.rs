//! HTML → markdown main-content extraction.

use powersearch_core::{ContentExtractor, ExtractionOptions};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Containers with no readable content; dropped before anything else.
const DROP_BLOCKS: [&str; 10] = [
    "script", "style", "noscript", "template", "svg", "iframe", "form", "nav", "aside", "footer",
];

fn cached(cell: &'static OnceLock<Regex>, pat: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pat).expect("static regex"))
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn class_or_id_lc(el: &html_scraper::ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_boilerplate_container(el: &html_scraper::ElementRef, opts: &ExtractionOptions) -> bool {
    let s = class_or_id_lc(el);
    if s.is_empty() {
        return false;
    }
    if !opts.include_comments && s.contains("comment") {
        return true;
    }
    [
        "nav",
        "navbar",
        "menu",
        "sidebar",
        "footer",
        "header",
        "banner",
        "cookie",
        "consent",
        "ads",
        "advert",
        "promo",
        "subscribe",
        "newsletter",
        "share",
        "related",
    ]
    .iter()
    .any(|bad| s.contains(bad))
}

fn element_text_chars(el: &html_scraper::ElementRef) -> usize {
    el.text().map(|t| t.chars().count()).sum()
}

fn element_link_text_chars(el: &html_scraper::ElementRef) -> usize {
    let Ok(sel) = html_scraper::Selector::parse("a") else {
        return 0;
    };
    el.select(&sel)
        .map(|a| a.text().map(|t| t.chars().count()).sum::<usize>())
        .sum()
}

/// Choose the densest non-boilerplate container and return its outer HTML.
///
/// With `favor_precision` only a real container qualifies and link-heavy blocks are rejected
/// outright; otherwise the whole `<body>` is the fallback.
fn pick_main_html(html: &str, opts: &ExtractionOptions) -> Option<String> {
    const MAX_ELEMS: usize = 20_000;
    let doc = html_scraper::Html::parse_document(html);

    let sel = html_scraper::Selector::parse("article, main, section, div").ok()?;
    let mut best_score: i64 = 0;
    let mut best_html: Option<String> = None;

    for el in doc.select(&sel).take(MAX_ELEMS) {
        if is_boilerplate_container(&el, opts) {
            continue;
        }
        let txt = element_text_chars(&el);
        if txt < 20 {
            continue;
        }
        let link_txt = element_link_text_chars(&el);
        if opts.favor_precision && link_txt > txt / 3 {
            continue;
        }
        let mut score = txt as i64 - 2 * (link_txt as i64);
        match el.value().name() {
            "article" => score += 500,
            "main" => score += 300,
            _ => {}
        }
        if link_txt > txt / 2 {
            score -= 500;
        }
        if score > best_score {
            best_score = score;
            best_html = Some(el.html());
        }
    }

    if best_html.is_some() || opts.favor_precision {
        return best_html;
    }
    let body = html_scraper::Selector::parse("body").ok()?;
    doc.select(&body).next().map(|b| b.html())
}

/// Remove `<tag ...> ... </tag>` blocks (ASCII case-insensitive, first matching close tag).
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let tag_lc = tag.to_ascii_lowercase();
    let open_pat = format!("<{tag_lc}");
    let close_pat = format!("</{tag_lc}>");

    let mut out = String::with_capacity(html.len());
    let mut i = 0usize;
    let lower = html.to_ascii_lowercase();
    while let Some(rel_start) = lower[i..].find(&open_pat) {
        let start = i + rel_start;
        let after_open = start + open_pat.len();
        // `<nav` must not match `<navigation-menu>`.
        let boundary = lower[after_open..]
            .chars()
            .next()
            .is_some_and(|c| c == '>' || c == '/' || c.is_ascii_whitespace());
        if !boundary {
            out.push_str(&html[i..after_open]);
            i = after_open;
            continue;
        }
        match lower[after_open..].find(&close_pat) {
            Some(rel_end) => {
                out.push_str(&html[i..start]);
                i = after_open + rel_end + close_pat.len();
            }
            None => break,
        }
    }
    out.push_str(&html[i..]);
    out
}

fn prepare_html(html: &str, opts: &ExtractionOptions) -> String {
    static IMG: OnceLock<Regex> = OnceLock::new();
    let mut h = html.to_string();
    for tag in DROP_BLOCKS {
        h = strip_tag_blocks(&h, tag);
    }
    if !opts.include_tables {
        h = strip_tag_blocks(&h, "table");
    }
    if !opts.include_images {
        h = cached(&IMG, r"(?is)<img\b[^>]*>").replace_all(&h, "").into_owned();
    }
    h
}

/// Drop inline markup the caller did not ask for, keeping its text.
fn unwrap_inline(html: &str, opts: &ExtractionOptions) -> String {
    static LINK: OnceLock<Regex> = OnceLock::new();
    static FORMAT: OnceLock<Regex> = OnceLock::new();
    let mut h = html.to_string();
    if !opts.include_links {
        h = cached(&LINK, r"(?is)</?a\b[^>]*>").replace_all(&h, "").into_owned();
    }
    if !opts.include_formatting {
        h = cached(
            &FORMAT,
            r"(?is)</?(?:b|strong|i|em|u|mark|small|sup|sub|s|del|ins)\b[^>]*>",
        )
        .replace_all(&h, "")
        .into_owned();
    }
    h
}

/// Paragraph-level repetition control.
fn dedupe_blocks(text: &str, opts: &ExtractionOptions) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<&str> = Vec::new();
    for block in text.split("\n\n") {
        let key = norm_ws(block);
        if key.is_empty() {
            continue;
        }
        let n = counts.entry(key).or_insert(0);
        *n += 1;
        let long = block.chars().count() >= opts.min_duplcheck_size;
        if opts.deduplicate && long && *n > 1 {
            continue;
        }
        if *n > opts.max_repetitions.max(1) {
            continue;
        }
        out.push(block.trim_end());
    }
    out.join("\n\n")
}

/// Readability-style extractor: scraper picks the main container, html2text renders it.
#[derive(Debug, Clone, Copy)]
pub struct ReadabilityExtractor {
    width: usize,
}

impl ReadabilityExtractor {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(20),
        }
    }
}

impl Default for ReadabilityExtractor {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl ContentExtractor for ReadabilityExtractor {
    fn extract_markdown(&self, html: &str, url: &str, opts: &ExtractionOptions) -> Option<String> {
        let prepared = prepare_html(html, opts);
        let Some(main) = pick_main_html(&prepared, opts) else {
            tracing::debug!(url, "no main content container");
            return None;
        };
        let main = unwrap_inline(&main, opts);
        let md = html2text::from_read(std::io::Cursor::new(main.as_bytes()), self.width).ok()?;
        let md = dedupe_blocks(&md, opts);
        let md = md.trim();
        if md.chars().count() < opts.min_extracted_size {
            tracing::debug!(url, chars = md.chars().count(), "extraction below minimum size");
            return None;
        }
        Some(md.to_string())
    }
}

/// Final cleanup applied to extracted markdown before it is returned.
pub fn clean_markdown(md: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static BLANKS: OnceLock<Regex> = OnceLock::new();
    static EMPTY_FENCE: OnceLock<Regex> = OnceLock::new();
    let s = cached(&TAGS, r"<[^>]+>").replace_all(md, "");
    let s = cached(&BLANKS, r"\n{3,}").replace_all(&s, "\n\n");
    let s = cached(&EMPTY_FENCE, r"```\s*```").replace_all(&s, "");
    s.trim().to_string()
}
