use std::collections::BTreeMap;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::dto::{Record, FIELDS};

/// Canonical value for absent, blank or unparseable input.
pub const MISSING: &str = "missing";

const SEPARATORS: [char; 7] = ['\n', ':', ',', '/', '\'', '"', '-'];

/// Canonicalizes a raw field value. Total and idempotent.
pub fn normalize(value: Option<&str>) -> String {
    let value = match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => return MISSING.to_string(),
    };
    let replaced: String = transliterate(value)
        .chars()
        .map(|c| if SEPARATORS.contains(&c) { ' ' } else { c })
        .collect();
    let collapsed = replaced
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    if collapsed.is_empty() {
        MISSING.to_string()
    } else {
        collapsed
    }
}

fn transliterate(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.nfkd().filter(|c| !is_combining_mark(*c)) {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let mapped = match c {
            'ß' => "ss",
            'æ' => "ae",
            'Æ' => "AE",
            'œ' => "oe",
            'Œ' => "OE",
            'ø' => "o",
            'Ø' => "O",
            'ł' => "l",
            'Ł' => "L",
            'đ' | 'ð' => "d",
            'Đ' | 'Ð' => "D",
            'þ' => "th",
            'Þ' => "TH",
            'ı' => "i",
            _ => "",
        };
        out.push_str(mapped);
    }
    out
}

/// Normalized view of a [`Record`]. Recomputed on demand, never stored apart
/// from its source.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedRecord {
    pub id: String,
    fields: BTreeMap<String, String>,
}

impl NormalizedRecord {
    /// Normalizes exactly the fields the record carries.
    pub fn from_record(record: &Record) -> Self {
        let fields = record
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), normalize(value.as_deref())))
            .collect();
        NormalizedRecord {
            id: record.id.clone(),
            fields,
        }
    }

    /// Normalizes the fields the record carries, and fills every schema field
    /// it leaves out as missing. Fields outside the schema are never invented.
    pub fn with_schema(record: &Record) -> Self {
        let mut normalized = Self::from_record(record);
        for name in FIELDS {
            normalized
                .fields
                .entry(name.to_string())
                .or_insert_with(|| MISSING.to_string());
        }
        normalized
    }

    /// Normalizes the given fields, treating any the record lacks as missing.
    pub fn with_fields<S: AsRef<str>>(record: &Record, names: &[S]) -> Self {
        let fields = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                (name.to_string(), normalize(record.get(name)))
            })
            .collect();
        NormalizedRecord {
            id: record.id.clone(),
            fields,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Value of `name` unless it is absent or `missing`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| *v != MISSING)
    }

    /// Whether any field carries a usable value.
    pub fn has_signal(&self) -> bool {
        self.fields.values().any(|v| v != MISSING)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}
