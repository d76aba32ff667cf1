//! Normalization of vendor responses into canonical results.
//!
//! Each upstream shape gets one explicit mapping table (canonical field -> JSON pointers,
//! first hit wins). Detail bodies go through [`NOTE_PARSERS`], an ordered list of pure
//! functions; the first one that yields a note wins.

use chrono::{DateTime, Datelike, NaiveDate};
use sapnotes_core::{CanonicalNote, CanonicalSearchResult, Field};
use serde_json::Value;
use std::io::Cursor;

/// Canonical field -> candidate JSON pointers, tried in order.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub id: &'static [&'static str],
    pub title: &'static [&'static str],
    pub summary: &'static [&'static str],
    pub component: &'static [&'static str],
    pub priority: &'static [&'static str],
    pub category: &'static [&'static str],
    pub release_date: &'static [&'static str],
    pub language: &'static [&'static str],
    pub url: &'static [&'static str],
    pub content: &'static [&'static str],
}

/// A hit from the search API's `results` array.
pub const SEARCH_HIT: FieldMap = FieldMap {
    id: &["/raw/mh_id", "/raw/mh_number", "/raw/sapnotenumber"],
    title: &["/title", "/raw/mh_title", "/raw/systitle"],
    summary: &["/excerpt", "/raw/mh_description", "/raw/mh_summary"],
    component: &["/raw/mh_app_component", "/raw/mh_component"],
    priority: &["/raw/mh_priority"],
    category: &["/raw/mh_category", "/raw/mh_note_category"],
    release_date: &["/raw/date", "/raw/mh_release_date"],
    language: &["/raw/mh_language", "/raw/language"],
    url: &["/clickUri", "/uri"],
    content: &[],
};

/// The JSON served by the raw detail endpoint.
pub const RAW_DETAIL: FieldMap = FieldMap {
    id: &["/Response/SAPNote/Header/Number/value"],
    title: &["/Response/SAPNote/Header/Title/value"],
    summary: &["/Response/SAPNote/Header/Summary/value"],
    component: &[
        "/Response/SAPNote/Header/SAPComponentKey/value",
        "/Response/SAPNote/Header/SAPComponentKeyText/value",
    ],
    priority: &["/Response/SAPNote/Header/Priority/value"],
    category: &["/Response/SAPNote/Header/Category/value"],
    release_date: &["/Response/SAPNote/Header/ReleasedOn/value"],
    language: &["/Response/SAPNote/Header/Language/value"],
    url: &[],
    content: &["/Response/SAPNote/LongText/value"],
};

/// One OData entity (the `d` object, or the first of `d.results`).
pub const ODATA_ENTITY: FieldMap = FieldMap {
    id: &["/SapNotesNumber", "/SapNoteNumber", "/Number"],
    title: &["/Title", "/ShortText"],
    summary: &["/Summary", "/Description"],
    component: &["/ComponentKey", "/Component", "/SAPComponentKey"],
    priority: &["/Priority", "/PriorityDescription"],
    category: &["/Category", "/CategoryDescription"],
    release_date: &["/ReleaseDate", "/ReleasedOn", "/ValidFrom"],
    language: &["/Language", "/Langu"],
    url: &[],
    content: &["/LongText", "/Text", "/NoteText"],
};

/// Already-canonical JSON (our own output, or a proxy that speaks it).
pub const FLAT_NOTE: FieldMap = FieldMap {
    id: &["/id", "/number", "/noteId"],
    title: &["/title"],
    summary: &["/summary"],
    component: &["/component"],
    priority: &["/priority"],
    category: &["/category"],
    release_date: &["/releaseDate", "/release_date"],
    language: &["/language"],
    url: &["/url"],
    content: &["/content", "/text"],
};

/// A detail response body as handed to the parsers.
#[derive(Debug, Clone, Copy)]
pub struct RawDetail<'a> {
    pub note_id: &'a str,
    /// Canonical note URL, used when the payload carries none.
    pub note_url: &'a str,
    pub body: &'a str,
    pub content_type: Option<&'a str>,
}

pub type NoteParser = fn(&RawDetail<'_>) -> Option<CanonicalNote>;

pub const NOTE_PARSERS: &[(&str, NoteParser)] = &[
    ("raw_detail_json", parse_raw_detail_json),
    ("odata_json", parse_odata_json),
    ("flat_json", parse_flat_json),
    ("embedded_json", parse_embedded_json),
    ("markup", parse_markup),
];

/// Run the parsers in order; returns the winning parser's name with the note.
pub fn parse_note(raw: &RawDetail<'_>) -> Option<(&'static str, CanonicalNote)> {
    NOTE_PARSERS
        .iter()
        .find_map(|(name, parse)| parse(raw).map(|n| (*name, n)))
}

/// Structured payloads only; plain HTTP responses are never read as rendered markup.
pub fn parse_structured(raw: &RawDetail<'_>) -> Option<(&'static str, CanonicalNote)> {
    NOTE_PARSERS
        .iter()
        .filter(|(name, _)| *name != "markup")
        .find_map(|(name, parse)| parse(raw).map(|n| (*name, n)))
}

/// Normalize the search API response. Anything malformed yields an empty list.
pub fn search_results(body: &Value, note_url_template: &str) -> Vec<CanonicalSearchResult> {
    let Some(hits) = body.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    hits.iter()
        .filter_map(|h| search_hit(h, note_url_template))
        .collect()
}

/// A hit without an identifier is dropped.
pub fn search_hit(hit: &Value, note_url_template: &str) -> Option<CanonicalSearchResult> {
    let m = &SEARCH_HIT;
    let id = normalize_note_id(&pick(hit, m.id)?)?;
    let url = pick(hit, m.url)
        .unwrap_or_else(|| crate::config::fill_id(note_url_template, &id));
    Some(CanonicalSearchResult {
        title: field(hit, m.title),
        summary: field(hit, m.summary),
        component: field(hit, m.component),
        priority: field(hit, m.priority),
        category: field(hit, m.category),
        release_date: date_field(hit, m.release_date),
        language: field(hit, m.language),
        url,
        id,
    })
}

fn note_from_map(v: &Value, m: &FieldMap, raw: &RawDetail<'_>) -> Option<CanonicalNote> {
    if let Some(found) = pick(v, m.id) {
        if normalize_note_id(&found).as_deref() != normalize_note_id(raw.note_id).as_deref() {
            return None;
        }
    }
    let note = CanonicalNote {
        id: raw.note_id.trim().to_string(),
        title: field(v, m.title),
        summary: field(v, m.summary),
        component: field(v, m.component),
        priority: field(v, m.priority),
        category: field(v, m.category),
        release_date: date_field(v, m.release_date),
        language: field(v, m.language),
        url: pick(v, m.url).unwrap_or_else(|| raw.note_url.to_string()),
        content: Field::from_opt(pick(v, m.content).map(|c| readable_text(&c))),
    };
    note.has_substance().then_some(note)
}

fn json_body(raw: &RawDetail<'_>) -> Option<Value> {
    let t = raw.body.trim_start();
    if !(t.starts_with('{') || t.starts_with('[')) {
        return None;
    }
    serde_json::from_str(t).ok()
}

pub fn parse_raw_detail_json(raw: &RawDetail<'_>) -> Option<CanonicalNote> {
    let v = json_body(raw)?;
    v.pointer("/Response/SAPNote")?;
    note_from_map(&v, &RAW_DETAIL, raw)
}

pub fn parse_odata_json(raw: &RawDetail<'_>) -> Option<CanonicalNote> {
    let v = json_body(raw)?;
    let d = v.get("d")?;
    let entity = match d.get("results").and_then(Value::as_array) {
        Some(rows) => rows.first()?,
        None => d,
    };
    note_from_map(entity, &ODATA_ENTITY, raw)
}

pub fn parse_flat_json(raw: &RawDetail<'_>) -> Option<CanonicalNote> {
    let v = json_body(raw)?;
    if !v.is_object() || v.get("d").is_some() || v.get("Response").is_some() {
        return None;
    }
    note_from_map(&v, &FLAT_NOTE, raw)
}

/// JSON wrapped in markup: a browser showing a JSON response puts it in `<pre>`, and
/// app shells sometimes inline their data in a JSON `<script>`.
pub fn parse_embedded_json(raw: &RawDetail<'_>) -> Option<CanonicalNote> {
    if !raw.body.contains('<') {
        return None;
    }
    let doc = html_scraper::Html::parse_document(raw.body);
    let sel = html_scraper::Selector::parse(
        "pre, script[type=\"application/json\"], script[type=\"application/ld+json\"]",
    )
    .ok()?;
    doc.select(&sel).find_map(|el| {
        let text = el.text().collect::<String>();
        let inner = RawDetail {
            body: text.trim(),
            content_type: Some("application/json"),
            ..*raw
        };
        [
            parse_raw_detail_json as NoteParser,
            parse_odata_json,
            parse_flat_json,
        ]
        .iter()
        .find_map(|p| p(&inner))
    })
}

/// Title and readable body text from rendered markup. Login surfaces never yield a note,
/// and neither do pages that never mention the note number.
pub fn parse_markup(raw: &RawDetail<'_>) -> Option<CanonicalNote> {
    if !raw.body.contains('<') {
        return None;
    }
    if raw
        .content_type
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    {
        return None;
    }
    let doc = html_scraper::Html::parse_document(raw.body);
    if looks_like_login(&doc) {
        return None;
    }

    let title = first_text(&doc, "h1").or_else(|| first_text(&doc, "title"));
    let html = strip_tag_blocks(raw.body, "script");
    let html = strip_tag_blocks(&html, "style");
    let html = strip_tag_blocks(&html, "noscript");
    let text = html_to_text(&html, 100);
    let text = text.trim();

    let id = normalize_note_id(raw.note_id)?;
    let mentions_id = text.contains(&id) || title.as_deref().is_some_and(|t| t.contains(&id));
    if !mentions_id {
        return None;
    }

    let mut note = CanonicalNote::bare(raw.note_id.trim(), raw.note_url);
    note.title = Field::from_opt(title);
    if text.chars().filter(|c| !c.is_whitespace()).count() >= 80 {
        note.content = Field::value(text);
    }
    note.has_substance().then_some(note)
}

fn looks_like_login(doc: &html_scraper::Html) -> bool {
    if let Ok(sel) = html_scraper::Selector::parse("input[type=\"password\"]") {
        if doc.select(&sel).next().is_some() {
            return true;
        }
    }
    let title = first_text(doc, "title").unwrap_or_default().to_ascii_lowercase();
    ["log on", "sign in", "login"]
        .iter()
        .any(|needle| title.contains(needle))
}

fn first_text(doc: &html_scraper::Html, selector: &str) -> Option<String> {
    let sel = html_scraper::Selector::parse(selector).ok()?;
    let el = doc.select(&sel).next()?;
    let t = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
    (!t.is_empty()).then_some(t)
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn html_to_text(html: &str, width: usize) -> String {
    html2text::from_read(Cursor::new(html.as_bytes()), width).unwrap_or_else(|_| html.to_string())
}

/// Long texts arrive as HTML fragments; flatten them, leave plain text alone.
fn readable_text(s: &str) -> String {
    if s.contains('<') && s.contains('>') {
        html_to_text(s, 100).trim().to_string()
    } else {
        s.trim().to_string()
    }
}

/// Remove `<tag ...> ... </tag>` blocks; stops at the first unclosed one.
fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let open_pat = format!("<{}", tag.to_ascii_lowercase());
    let close_pat = format!("</{}>", tag.to_ascii_lowercase());
    let lower = html.to_ascii_lowercase();

    let mut out = String::with_capacity(html.len());
    let mut i = 0usize;
    while let Some(rel_start) = lower[i..].find(&open_pat) {
        let start = i + rel_start;
        let after_open = start + open_pat.len();
        let Some(rel_end) = lower[after_open..].find(&close_pat) else {
            break;
        };
        out.push_str(&html[i..start]);
        i = after_open + rel_end + close_pat.len();
    }
    out.push_str(&html[i..]);
    out
}

/// First usable value among `paths`. Strings are trimmed, numbers stringified, arrays
/// contribute their first usable element.
pub fn pick(v: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| v.pointer(p).and_then(scalar))
}

fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.iter().find_map(scalar),
        _ => None,
    }
}

fn field(v: &Value, paths: &[&str]) -> Field {
    Field::from_opt(pick(v, paths).filter(|s| s != Field::UNSPECIFIED))
}

fn date_field(v: &Value, paths: &[&str]) -> Field {
    Field::from_opt(pick(v, paths).and_then(|d| format_release_date(&d)))
}

/// Normalize the vendor's date encodings to UTC `YYYY-MM-DD`.
///
/// Accepts epoch milliseconds (seconds when too small to be millis), OData `/Date(ms)/`,
/// `dd.mm.yyyy`, `yyyymmdd` and ISO-8601 prefixes.
pub fn format_release_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if let Some(inner) = s.strip_prefix("/Date(").and_then(|r| r.strip_suffix(")/")) {
        let digits: String = inner
            .chars()
            .enumerate()
            .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
            .map(|(_, c)| c)
            .collect();
        return epoch_ms_to_date(digits.parse().ok()?);
    }
    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").ok().and_then(iso_day);
    }
    if let Ok(n) = s.parse::<i64>() {
        let ms = if n.unsigned_abs() < 100_000_000_000 { n * 1000 } else { n };
        return epoch_ms_to_date(ms);
    }
    if let Ok(f) = s.parse::<f64>() {
        return epoch_ms_to_date(f as i64);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return iso_day(d);
    }
    let prefix = s.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok().and_then(iso_day)
}

fn epoch_ms_to_date(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms).and_then(|t| iso_day(t.date_naive()))
}

// Four-digit years only.
fn iso_day(d: NaiveDate) -> Option<String> {
    (1..=9999)
        .contains(&d.year())
        .then(|| d.format("%Y-%m-%d").to_string())
}

/// Note numbers are 1..=10 ASCII digits; leading zeros are insignificant.
pub fn normalize_note_id(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() || s.len() > 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let stripped = s.trim_start_matches('0');
    Some(if stripped.is_empty() { "0" } else { stripped }.to_string())
}
