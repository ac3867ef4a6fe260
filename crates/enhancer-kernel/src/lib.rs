use chrono::{DateTime, Duration, Utc};
use enhancer_contracts::{DisplayMode, StoredLabel};
use regex::Regex;
use std::sync::LazyLock;

static FEED_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<title>([^<]+)</title>").expect("feed title pattern"));

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// Text shown for an entry under `mode`. `label` is the override or the
/// resolved label, whichever wins.
pub fn format_label(mode: DisplayMode, label: Option<&str>, raw_name: &str) -> String {
    match (mode, label) {
        (DisplayMode::Handle, _) | (_, None) => raw_name.to_string(),
        (DisplayMode::Name, Some(label)) => label.to_string(),
        (DisplayMode::Both, Some(label)) => format!("{label} ({raw_name})"),
    }
}

pub fn effective_label<'a>(
    override_label: Option<&'a str>,
    resolved: Option<&'a str>,
) -> Option<&'a str> {
    override_label.or(resolved)
}

/// First `<title>` of a feed document.
pub fn extract_title(body: &str) -> Option<String> {
    let raw = FEED_TITLE.captures(body)?.get(1)?.as_str();
    let title = decode_xml_entities(raw.trim());
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

pub fn decode_xml_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        let decoded = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&apos;", '\''),
            ("&#39;", '\''),
        ]
        .into_iter()
        .find(|(entity, _)| tail.starts_with(entity));
        match decoded {
            Some((entity, ch)) => {
                out.push(ch);
                rest = &tail[entity.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn stored_label(label: &str, now: DateTime<Utc>) -> StoredLabel {
    StoredLabel {
        label: label.to_string(),
        observed_at: now.to_rfc3339(),
    }
}

/// Whether a durable label may still seed the in-memory cache. Unparseable
/// timestamps are treated as stale when an age limit applies.
pub fn is_fresh(stored: &StoredLabel, now: DateTime<Utc>, max_age_ms: Option<u64>) -> bool {
    let Some(max_age_ms) = max_age_ms else {
        return true;
    };
    let Some(observed_at) = parse_rfc3339(&stored.observed_at) else {
        return false;
    };
    let Some(max_age) = i64::try_from(max_age_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
    else {
        return true;
    };
    now.signed_duration_since(observed_at) <= max_age
}
