//! The extraction schema: the fixed set of metadata fields we pull off each
//! card, the column layout of our CSV exports, and validation for archive
//! signatures.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The metadata fields we ask the model to extract, in declared order. These
/// are the field labels printed on the archive's index cards, so they stay in
/// German.
pub const FIELD_KEYS: &[&str] = &[
    "Komponist",
    "Signatur",
    "Titel",
    "Textanfang",
    "Verlag",
    "Material",
    "Textdichter",
    "Bearbeiter",
    "Bemerkungen",
];

/// CSV column holding the source image filename.
pub const FILENAME_COLUMN: &str = "Datei";

/// CSV column holding the batch name.
pub const BATCH_COLUMN: &str = "Batch";

/// The full CSV column layout: filename, batch, then signature and composer
/// up front (the columns reviewers care about most), then the remaining
/// fields in declared order.
pub fn csv_columns() -> Vec<&'static str> {
    let mut columns = vec![FILENAME_COLUMN, BATCH_COLUMN, "Signatur", "Komponist"];
    for &key in FIELD_KEYS {
        if !columns.contains(&key) {
            columns.push(key);
        }
    }
    columns
}

/// Extracted field values, keyed by field name.
pub type FieldMap = BTreeMap<String, String>;

/// The structured data extracted from one card, plus where it came from.
/// This is exactly what we write to the per-card JSON file and what becomes
/// one CSV row.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CardRecord {
    /// The source image filename within its batch directory.
    #[serde(rename = "Datei")]
    pub filename: String,

    /// The batch this card belongs to.
    #[serde(rename = "Batch")]
    pub batch: String,

    /// The extracted fields.
    #[serde(flatten)]
    pub fields: FieldMap,
}

impl CardRecord {
    /// Create a record, keeping only the configured fields and filling in
    /// empty strings for anything the model left out.
    pub fn new(filename: String, batch: String, mut raw: FieldMap) -> Self {
        let mut fields = FieldMap::new();
        for &key in FIELD_KEYS {
            fields.insert(key.to_owned(), raw.remove(key).unwrap_or_default());
        }
        Self {
            filename,
            batch,
            fields,
        }
    }

    /// Look up a field value, trimmed. Unknown fields read as empty.
    pub fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(|v| v.trim()).unwrap_or_default()
    }

    /// Render this record as one CSV row, in [`csv_columns`] order.
    pub fn csv_row(&self) -> Vec<String> {
        csv_columns()
            .into_iter()
            .map(|column| match column {
                FILENAME_COLUMN => self.filename.clone(),
                BATCH_COLUMN => self.batch.clone(),
                key => self.fields.get(key).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

/// The signature formats used by this archive:
/// `Spez.XX.XXX` with an optional trailing lowercase letter, or
/// `TOB`/`RTSO`/`RTOB` followed by a three-or-four-digit number.
static SIGNATURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^Spez\.\d{1,2}\.\d{3,4}(\s+[a-z])?$",
        r"^(RTSO|RTOB|TOB)\s+\d{3,4}$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("bad signature pattern"))
    .collect()
});

/// Does this signature match one of the archive's known formats?
pub fn is_valid_signature(signature: &str) -> bool {
    if signature.is_empty() {
        return false;
    }
    SIGNATURE_PATTERNS.iter().any(|re| re.is_match(signature))
}
