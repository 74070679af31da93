//! Regex-based extraction of hashtags, mentions, links, coordinates, and
//! domain-specific entity mentions (military units, equipment) from message text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static HASHTAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\w+)").unwrap());
static MENTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@(\w{5,32})").unwrap());
static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s]+").unwrap());
static TELEGRAM_LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:https?://)?t\.me/(\w+)").unwrap());
static COORDINATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,2}\.\d+)\s*°?\s*([NS])[,\s]+(\d{1,3}\.\d+)\s*°?\s*([EW])").unwrap()
});

static MILITARY_UNIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(\d+)\s*-?[іи]?\s*(бригад[аи])",
        r"(\d+)\s*-?[йи]?\s*полк",
        r"(\d+)\s*(batal[ьі]?[йо]?н)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static EQUIPMENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bT-(64|72|80|84|90)\b",
        r"(?i)\bBMP-?(1|2|3)\b",
        r"(?i)\bHIMARS\b",
        r"(?i)\bleopard\s?2\b",
        r"(?i)\bбпла\b",
        r"(?i)\bshahed\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Extracts and deduplicates entity mentions from text, excluding self-references to
/// the channel the message originated from. Categories with no matches are omitted
/// from the returned object entirely rather than included as empty arrays.
pub fn extract(text: &str, exclude_channel: Option<&str>) -> Value {
    let exclude_normalized = exclude_channel.map(|c| c.trim_start_matches('@').to_lowercase());

    let mut categories: Map<String, Value> = Map::new();

    insert_category(&mut categories, "hashtags", collect_matches(&HASHTAG_PATTERN, text, 1));

    let mentions: BTreeSet<String> = MENTION_PATTERN
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|m| exclude_normalized.as_deref() != Some(m.to_lowercase().as_str()))
        .collect();
    insert_category(&mut categories, "mentions", mentions);

    insert_category(&mut categories, "urls", collect_matches(&URL_PATTERN, text, 0));

    let telegram_links: BTreeSet<String> = TELEGRAM_LINK_PATTERN
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|m| exclude_normalized.as_deref() != Some(m.to_lowercase().as_str()))
        .collect();
    insert_category(&mut categories, "telegram_links", telegram_links);

    let coordinates: BTreeSet<String> = COORDINATE_PATTERN
        .captures_iter(text)
        .map(|c| format!("{} {}, {} {}", &c[1], &c[2], &c[3], &c[4]))
        .collect();
    insert_category(&mut categories, "coordinates", coordinates);

    let mut military_units = BTreeSet::new();
    for pattern in MILITARY_UNIT_PATTERNS.iter() {
        military_units.extend(pattern.find_iter(text).map(|m| m.as_str().to_string()));
    }
    insert_category(&mut categories, "military_units", military_units);

    let mut equipment = BTreeSet::new();
    for pattern in EQUIPMENT_PATTERNS.iter() {
        equipment.extend(pattern.find_iter(text).map(|m| m.as_str().to_string()));
    }
    insert_category(&mut categories, "equipment", equipment);

    Value::Object(categories)
}

fn collect_matches(pattern: &Regex, text: &str, group: usize) -> BTreeSet<String> {
    pattern
        .captures_iter(text)
        .filter_map(|c| c.get(group).map(|m| m.as_str().to_string()))
        .collect()
}

fn insert_category(map: &mut Map<String, Value>, key: &str, values: BTreeSet<String>) {
    if values.is_empty() {
        return;
    }
    map.insert(
        key.to_string(),
        Value::Array(values.into_iter().map(Value::String).collect()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_hashtags_and_mentions() {
        let out = extract("see #update from @somechannel now", None);
        assert_eq!(out["hashtags"], serde_json::json!(["update"]));
        assert_eq!(out["mentions"], serde_json::json!(["somechannel"]));
    }

    #[test]
    fn excludes_self_mentions() {
        let out = extract("cross-post from @mychannel", Some("@MyChannel"));
        assert!(out.get("mentions").is_none());
    }

    #[test]
    fn empty_categories_are_omitted() {
        let out = extract("just plain text", None);
        assert_eq!(out, serde_json::json!({}));
    }

    #[test]
    fn extracts_coordinates() {
        let out = extract("position at 50.45 N, 30.52 E reported", None);
        assert_eq!(out["coordinates"], serde_json::json!(["50.45 N, 30.52 E"]));
    }
}
