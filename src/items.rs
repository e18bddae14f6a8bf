//! Work items (headlines) and their stable ids.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_SLUG_LEN: usize = 48;
const ID_HASH_CHARS: usize = 10;

/// One unit of work: a headline keyed by a stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub title: String,
}

impl Item {
    pub fn new(item_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            title: title.into(),
        }
    }

    /// Item whose id is derived from the headline text.
    pub fn from_title(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            item_id: derive_item_id(&title),
            title,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ItemsError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid titles index: {0}")]
    Parse(String),
    #[error("invalid item id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },
}

/// Stable id for a headline: a lowercase slug plus a short content hash, so
/// two headlines that slug identically still get distinct ids.
pub fn derive_item_id(title: &str) -> String {
    let mut slug = String::with_capacity(MAX_SLUG_LEN);
    let mut pending_dash = false;
    for ch in title.trim().chars() {
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            slug.push(ch.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    let hash = blake3::hash(title.trim().as_bytes()).to_hex();
    let short = &hash.as_str()[..ID_HASH_CHARS];
    if slug.is_empty() {
        short.to_string()
    } else {
        format!("{slug}-{short}")
    }
}

/// Item ids become file names; reject anything that could escape the
/// results directory or collide with sidecar/temp files.
pub fn validate_item_id(id: &str) -> Result<(), ItemsError> {
    let reason = if id.is_empty() {
        Some("empty")
    } else if id.starts_with('.') {
        Some("leading dot")
    } else if id.contains(['/', '\\', '\0']) {
        Some("path separator")
    } else if id.contains("..") {
        Some("parent reference")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ItemsError::InvalidId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Load the titles index.
///
/// Accepted shapes:
/// - object: `{"<id>": {"title": "..."}}` or `{"<id>": "..."}` (sorted by id)
/// - array: `[{"id": "...", "title": "..."}]`, `headline`/`identifier` aliases,
///   or bare strings (id derived from the text)
///
/// Entries with an empty title are dropped.
pub fn load_items(path: impl AsRef<Path>) -> Result<Vec<Item>, ItemsError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ItemsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value =
        serde_json::from_str(&raw).map_err(|e| ItemsError::Parse(e.to_string()))?;
    parse_items(value)
}

pub fn parse_items(value: Value) -> Result<Vec<Item>, ItemsError> {
    let mut items = match value {
        Value::Object(map) => {
            let mut items: Vec<Item> = map
                .into_iter()
                .filter_map(|(id, entry)| {
                    let title = match &entry {
                        Value::String(s) => s.clone(),
                        Value::Object(obj) => title_of(obj)?,
                        _ => return None,
                    };
                    Some(Item::new(id, title.trim()))
                })
                .collect();
            items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
            items
        }
        Value::Array(entries) => entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(s) => Some(Item::from_title(s.trim())),
                Value::Object(obj) => {
                    let title = title_of(&obj)?;
                    let id = ["id", "identifier", "slug"]
                        .iter()
                        .find_map(|k| obj.get(*k).and_then(id_string));
                    Some(match id {
                        Some(id) => Item::new(id, title.trim()),
                        None => Item::from_title(title.trim()),
                    })
                }
                _ => None,
            })
            .collect(),
        _ => {
            return Err(ItemsError::Parse(
                "titles index must be a JSON object or array".to_string(),
            ))
        }
    };
    items.retain(|item| !item.title.is_empty());
    for item in &items {
        validate_item_id(&item.item_id)?;
    }
    Ok(items)
}

fn title_of(obj: &serde_json::Map<String, Value>) -> Option<String> {
    ["title", "headline"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let a = derive_item_id("Florida man holds city hall hostage!");
        let b = derive_item_id("Florida man holds city hall hostage?");
        assert_eq!(a, derive_item_id("Florida man holds city hall hostage!"));
        assert!(a.starts_with("florida-man-holds-city-hall-hostage-"));
        assert_ne!(a, b);
        assert!(validate_item_id(&a).is_ok());
    }

    #[test]
    fn non_ascii_title_falls_back_to_hash() {
        let id = derive_item_id("日本語");
        assert_eq!(id.len(), ID_HASH_CHARS);
    }

    #[test]
    fn rejects_ids_that_escape_the_directory() {
        for bad in ["", "../x", "a/b", ".hidden", "a\\b"] {
            assert!(validate_item_id(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_item_id("abc-123").is_ok());
    }

    #[test]
    fn parses_object_and_array_indices() {
        let from_obj = parse_items(json!({
            "b": {"title": "Second"},
            "a": "First",
            "c": {"title": ""}
        }))
        .unwrap();
        assert_eq!(
            from_obj,
            vec![Item::new("a", "First"), Item::new("b", "Second")]
        );

        let from_arr = parse_items(json!([
            {"id": "x", "headline": "Headline X"},
            {"identifier": 7, "title": "Seven"},
            "Bare headline"
        ]))
        .unwrap();
        assert_eq!(from_arr[0], Item::new("x", "Headline X"));
        assert_eq!(from_arr[1], Item::new("7", "Seven"));
        assert_eq!(from_arr[2].title, "Bare headline");
    }

    #[test]
    fn rejects_unsafe_ids_in_index() {
        let err = parse_items(json!({"../etc": "oops"})).unwrap_err();
        assert!(matches!(err, ItemsError::InvalidId { .. }));
    }
}
