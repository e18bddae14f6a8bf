//! Recovering and validating structured answers from model text.
//!
//! Models wrap JSON in code fences, add prose around it, leave trailing
//! commas or forget the commas between objects. [`extract_json_values`]
//! repairs the common cases; [`ResponseSchema::match_batch`] then checks the
//! objects against the required keys and pairs them with the batch items.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::items::Item;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("no JSON array or object found in response")]
    NoJson,
    #[error("entry {index} is not a JSON object")]
    NonObjectEntry { index: usize },
    #[error("response has {got} objects for a batch of {expected}")]
    TooManyObjects { got: usize, expected: usize },
    #[error("response contains no objects")]
    Empty,
    #[error("entry {index} is missing required fields: {fields:?}")]
    MissingFields { index: usize, fields: Vec<String> },
    #[error("entry {index} has unexpected fields: {fields:?}")]
    ExtraFields { index: usize, fields: Vec<String> },
    #[error("entry {index} references unknown id {id:?}")]
    UnknownId { index: usize, id: String },
    #[error("id {id:?} answered more than once")]
    DuplicateId { id: String },
}

/// Parse model output into a list of JSON values, repairing common damage.
pub fn extract_json_values(text: &str) -> Result<Vec<Value>, SchemaViolation> {
    let text = normalize_quotes(strip_code_fence(text).trim());
    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        if let Some(values) = into_list(value) {
            return Ok(values);
        }
    }

    let span = outer_span(&text).ok_or(SchemaViolation::NoJson)?;
    let repaired = join_adjacent_objects(&strip_trailing_commas(span));
    let candidates = [
        repaired.clone(),
        // `{..},{..}` with no enclosing array.
        format!("[{repaired}]"),
    ];
    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            if let Some(values) = into_list(value) {
                return Ok(values);
            }
        }
    }
    Err(SchemaViolation::NoJson)
}

fn into_list(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(values) => Some(values),
        Value::Object(obj) => {
            // `{"results": [...]}` style wrappers.
            if obj.len() == 1 {
                if let Some(Value::Array(values)) = obj.values().next() {
                    if !values.is_empty() && values.iter().all(Value::is_object) {
                        return Some(values.clone());
                    }
                }
            }
            Some(vec![Value::Object(obj)])
        }
        _ => None,
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip the language tag line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201c}', '\u{201d}'], "\"")
}

/// From the first `[`/`{` to the last `]`/`}`.
fn outer_span(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let end = text.rfind([']', '}'])?;
    (end > start).then(|| &text[start..=end])
}

/// Walk `text` outside string literals, calling `f` on each char and its
/// byte index. Quote characters are reported; string contents are not.
fn scan_outside_strings(text: &str, mut f: impl FnMut(usize, char)) {
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            match (escaped, ch) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => {
                    in_string = false;
                    f(i, ch);
                }
                _ => {}
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        f(i, ch);
    }
}

fn strip_trailing_commas(text: &str) -> String {
    let mut trailing = Vec::new();
    scan_outside_strings(text, |i, ch| {
        if ch == ',' {
            let next = text[i + 1..].chars().find(|c| !c.is_whitespace());
            if matches!(next, Some(']' | '}')) {
                trailing.push(i);
            }
        }
    });
    text.char_indices()
        .filter(|(i, _)| !trailing.contains(i))
        .map(|(_, ch)| ch)
        .collect()
}

fn join_adjacent_objects(text: &str) -> String {
    let mut inserts = Vec::new();
    let mut last_close: Option<usize> = None;
    scan_outside_strings(text, |i, ch| match ch {
        '}' => last_close = Some(i),
        '{' => {
            if let Some(c) = last_close.take() {
                inserts.push(c + 1);
            }
        }
        c if c.is_whitespace() => {}
        _ => last_close = None,
    });
    let mut out = String::with_capacity(text.len() + inserts.len());
    for (i, ch) in text.char_indices() {
        if inserts.contains(&i) {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub required_fields: Vec<String>,
    pub allow_extra_fields: bool,
    pub id_field: String,
}

impl Default for ResponseSchema {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            allow_extra_fields: true,
            id_field: "id".to_string(),
        }
    }
}

/// Objects paired with the items they answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedBatch {
    pub matched: Vec<(Item, Map<String, Value>)>,
    /// Item ids the response did not answer.
    pub missing: Vec<String>,
}

impl ResponseSchema {
    pub fn new(required_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_fields: required_fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn allow_extra_fields(mut self, allow: bool) -> Self {
        self.allow_extra_fields = allow;
        self
    }

    pub fn validate_object(&self, index: usize, obj: &Map<String, Value>) -> Result<(), SchemaViolation> {
        let missing: Vec<String> = self
            .required_fields
            .iter()
            .filter(|f| !obj.contains_key(f.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(SchemaViolation::MissingFields {
                index,
                fields: missing,
            });
        }
        if !self.allow_extra_fields {
            let allowed: BTreeSet<&str> = self
                .required_fields
                .iter()
                .map(String::as_str)
                .chain([self.id_field.as_str(), "title"])
                .collect();
            let extra: Vec<String> = obj
                .keys()
                .filter(|k| !allowed.contains(k.as_str()))
                .cloned()
                .collect();
            if !extra.is_empty() {
                return Err(SchemaViolation::ExtraFields {
                    index,
                    fields: extra,
                });
            }
        }
        Ok(())
    }

    /// Pair response objects with `items`.
    ///
    /// Objects are matched by `id_field` when every object carries one and
    /// positionally otherwise. The id field is removed from matched payloads.
    pub fn match_batch(&self, values: Vec<Value>, items: &[Item]) -> Result<MatchedBatch, SchemaViolation> {
        if values.is_empty() {
            return Err(SchemaViolation::Empty);
        }
        if values.len() > items.len() {
            return Err(SchemaViolation::TooManyObjects {
                got: values.len(),
                expected: items.len(),
            });
        }
        let mut objects = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            let Value::Object(obj) = value else {
                return Err(SchemaViolation::NonObjectEntry { index });
            };
            self.validate_object(index, &obj)?;
            objects.push(obj);
        }

        let by_id = objects
            .iter()
            .all(|obj| obj.get(&self.id_field).is_some_and(|v| id_text(v).is_some()));

        let mut slots: Vec<Option<Map<String, Value>>> = vec![None; items.len()];
        if by_id {
            let index: HashMap<&str, usize> = items
                .iter()
                .enumerate()
                .map(|(i, item)| (item.item_id.as_str(), i))
                .collect();
            for (i, mut obj) in objects.into_iter().enumerate() {
                let id = obj.remove(&self.id_field).and_then(|v| id_text(&v)).unwrap_or_default();
                let slot = index
                    .get(id.as_str())
                    .copied()
                    .or_else(|| ordinal_slot(&id, items.len()))
                    .ok_or_else(|| SchemaViolation::UnknownId {
                        index: i,
                        id: id.clone(),
                    })?;
                if slots[slot].is_some() {
                    return Err(SchemaViolation::DuplicateId { id });
                }
                slots[slot] = Some(obj);
            }
        } else {
            for (slot, mut obj) in slots.iter_mut().zip(objects) {
                obj.remove(&self.id_field);
                *slot = Some(obj);
            }
        }

        let mut batch = MatchedBatch::default();
        for (item, slot) in items.iter().zip(slots) {
            match slot {
                Some(obj) => batch.matched.push((item.clone(), obj)),
                None => batch.missing.push(item.item_id.clone()),
            }
        }
        Ok(batch)
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Models sometimes echo the headline number instead of the id.
fn ordinal_slot(id: &str, len: usize) -> Option<usize> {
    let n: usize = id.parse().ok()?;
    (1..=len).contains(&n).then(|| n - 1)
}
