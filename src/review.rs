//! Review tooling for the extracted data.
//!
//! The archive staff review extracted cards batch by batch: quality
//! statistics show which batches need attention, and field-level corrections
//! collected during review are written back to the batch exports, the
//! per-card JSON files, and the consolidated table.

use std::{collections::BTreeMap, fs::File, io::BufRead as _};

use serde::Deserialize;

use crate::{
    prelude::*,
    run::OutputLayout,
    schema::{CardRecord, FIELD_KEYS},
    table,
};

/// A filled field count of at least this many makes a card "complete".
const COMPLETE_THRESHOLD: usize = 6;

/// A filled field count of at most this many makes a card "sparse".
const SPARSE_THRESHOLD: usize = 2;

/// Quality statistics for one batch.
#[derive(Debug, PartialEq, Eq)]
pub struct BatchQuality {
    pub batch: String,

    /// Cards in the batch export.
    pub total: usize,

    /// Non-empty cards per field, in schema order.
    pub field_presence: Vec<(String, usize)>,

    /// Cards with at least six filled fields.
    pub complete: usize,

    /// Cards with at most two filled fields.
    pub sparse: usize,
}

impl BatchQuality {
    /// Compute statistics over a batch's records.
    pub fn from_records(batch: &str, records: &[CardRecord]) -> Self {
        let mut presence: BTreeMap<&str, usize> = BTreeMap::new();
        let mut complete = 0;
        let mut sparse = 0;
        for record in records {
            let mut filled = 0;
            for key in FIELD_KEYS {
                if !record.field(key).is_empty() {
                    filled += 1;
                    *presence.entry(key).or_default() += 1;
                }
            }
            if filled >= COMPLETE_THRESHOLD {
                complete += 1;
            }
            if filled <= SPARSE_THRESHOLD {
                sparse += 1;
            }
        }
        Self {
            batch: batch.to_owned(),
            total: records.len(),
            field_presence: FIELD_KEYS
                .iter()
                .map(|key| (key.to_string(), presence.get(key).copied().unwrap_or(0)))
                .collect(),
            complete,
            sparse,
        }
    }
}

/// List the batches that have a CSV export, sorted by name.
pub fn list_batches(csv_dir: &Path) -> Result<Vec<String>> {
    let mut batches = Vec::new();
    let entries = std::fs::read_dir(csv_dir)
        .with_context(|| format!("failed to list {}", csv_dir.display()))?;
    for entry in entries {
        let path = entry.context("failed to read directory entry")?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("csv")
            && let Some(stem) = path.file_stem()
        {
            batches.push(stem.to_string_lossy().into_owned());
        }
    }
    batches.sort();
    Ok(batches)
}

/// Load a batch export and compute its quality statistics.
pub fn batch_quality(csv_dir: &Path, batch: &str) -> Result<BatchQuality> {
    let path = csv_dir.join(format!("{batch}.csv"));
    let records = table::read_batch_csv(&path)
        .with_context(|| format!("failed to load batch export for {batch}"))?;
    Ok(BatchQuality::from_records(batch, &records))
}

/// One field-level correction from a review session.
#[derive(Clone, Debug, Deserialize)]
pub struct Correction {
    /// Batch the card belongs to.
    pub batch: String,

    /// Source image filename (the `Datei` column).
    pub filename: String,

    /// Field to overwrite. Must be one of the configured field keys.
    pub field: String,

    /// New value. An empty string clears the field.
    pub value: String,
}

/// Read corrections from a JSONL file, one JSON object per line.
pub fn read_corrections(path: &Path) -> Result<Vec<Correction>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open corrections file {}", path.display()))?;
    let mut corrections = Vec::new();
    for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.context("failed to read corrections file")?;
        if line.trim().is_empty() {
            continue;
        }
        let correction: Correction = serde_json::from_str(&line)
            .with_context(|| format!("bad correction on line {}", idx + 1))?;
        corrections.push(correction);
    }
    Ok(corrections)
}

/// What applying a correction file accomplished.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CorrectionReport {
    /// Corrections written back.
    pub applied: usize,

    /// Corrections ignored: unknown field, unknown batch, or no matching row.
    pub skipped: usize,
}

/// Apply corrections to the batch exports and per-card JSON files, then
/// rebuild the consolidated table.
pub fn apply_corrections(
    layout: &OutputLayout,
    corrections: &[Correction],
) -> Result<CorrectionReport> {
    let mut by_batch: BTreeMap<&str, Vec<&Correction>> = BTreeMap::new();
    for correction in corrections {
        by_batch
            .entry(correction.batch.as_str())
            .or_default()
            .push(correction);
    }

    let mut report = CorrectionReport::default();
    for (batch, corrections) in by_batch {
        let csv_path = layout.csv_dir.join(format!("{batch}.csv"));
        if !csv_path.exists() {
            warn!("no export for batch {batch}, skipping {} corrections", corrections.len());
            report.skipped += corrections.len();
            continue;
        }
        let mut records = table::read_batch_csv(&csv_path)?;
        let mut touched = Vec::new();
        for correction in corrections {
            if !FIELD_KEYS.contains(&correction.field.as_str()) {
                warn!(
                    "unknown field {:?} for {}/{}, skipping",
                    correction.field, batch, correction.filename
                );
                report.skipped += 1;
                continue;
            }
            match records
                .iter_mut()
                .find(|record| record.filename == correction.filename)
            {
                Some(record) => {
                    record
                        .fields
                        .insert(correction.field.clone(), correction.value.clone());
                    touched.push(record.clone());
                    report.applied += 1;
                }
                None => {
                    warn!("no row for {}/{}, skipping", batch, correction.filename);
                    report.skipped += 1;
                }
            }
        }
        if touched.is_empty() {
            continue;
        }
        table::write_batch_csv(&csv_path, &records)?;
        for record in &touched {
            rewrite_card_json(&layout.json_dir, record)?;
        }
    }

    if report.applied > 0 {
        table::merge_batch_csvs(&layout.csv_dir, &layout.final_csv)?;
    }
    Ok(report)
}

/// Update the per-card JSON file for a corrected record, if one exists.
fn rewrite_card_json(json_dir: &Path, record: &CardRecord) -> Result<()> {
    let stem = Path::new(&record.filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| record.filename.clone());
    let path = json_dir.join(&record.batch).join(format!("{stem}.json"));
    if !path.exists() {
        debug!("no per-card JSON at {}, skipping", path.display());
        return Ok(());
    }
    let json = serde_json::to_string_pretty(record).context("failed to serialize record")?;
    std::fs::write(&path, json.as_bytes())
        .with_context(|| format!("failed to rewrite {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldMap;

    fn record_with_fields(filename: &str, filled: &[(&str, &str)]) -> CardRecord {
        let mut fields = FieldMap::new();
        for (key, value) in filled {
            fields.insert((*key).to_owned(), (*value).to_owned());
        }
        CardRecord::new(filename.to_owned(), "Batch_01".to_owned(), fields)
    }

    #[test]
    fn quality_counts_complete_and_sparse_cards() {
        let records = vec![
            record_with_fields(
                "full.jpg",
                &[
                    ("Komponist", "Lincke"),
                    ("Signatur", "RTSO 3953"),
                    ("Titel", "Frau Luna"),
                    ("Textanfang", "Schlösser, die im Monde liegen"),
                    ("Verlag", "Apollo"),
                    ("Material", "KlA"),
                ],
            ),
            record_with_fields("thin.jpg", &[("Komponist", "?")]),
            record_with_fields("mid.jpg", &[
                ("Komponist", "Strauss"),
                ("Titel", "Die Fledermaus"),
                ("Verlag", "Cranz"),
            ]),
        ];

        let quality = BatchQuality::from_records("Batch_01", &records);
        assert_eq!(quality.total, 3);
        assert_eq!(quality.complete, 1);
        assert_eq!(quality.sparse, 1);
        let komponist = quality
            .field_presence
            .iter()
            .find(|(key, _)| key == "Komponist")
            .map(|(_, count)| *count);
        assert_eq!(komponist, Some(3));
    }

    #[test]
    fn corrections_update_csv_json_and_consolidated_table() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.ensure_dirs().unwrap();

        let record = record_with_fields("0042.jpg", &[("Komponist", "Linke")]);
        table::write_batch_csv(&layout.csv_dir.join("Batch_01.csv"), &[record.clone()])
            .unwrap();
        let json_batch_dir = layout.json_dir.join("Batch_01");
        std::fs::create_dir_all(&json_batch_dir).unwrap();
        std::fs::write(
            json_batch_dir.join("0042.json"),
            serde_json::to_string_pretty(&record).unwrap(),
        )
        .unwrap();

        let corrections_path = dir.path().join("corrections.jsonl");
        std::fs::write(
            &corrections_path,
            concat!(
                r#"{"batch":"Batch_01","filename":"0042.jpg","field":"Komponist","value":"Lincke, Paul"}"#,
                "\n",
                r#"{"batch":"Batch_01","filename":"missing.jpg","field":"Titel","value":"x"}"#,
                "\n",
            ),
        )
        .unwrap();

        let corrections = read_corrections(&corrections_path).unwrap();
        let report = apply_corrections(&layout, &corrections).unwrap();
        assert_eq!(report, CorrectionReport { applied: 1, skipped: 1 });

        let records = table::read_batch_csv(&layout.csv_dir.join("Batch_01.csv")).unwrap();
        assert_eq!(records[0].field("Komponist"), "Lincke, Paul");

        let json_text = std::fs::read_to_string(json_batch_dir.join("0042.json")).unwrap();
        let reloaded: CardRecord = serde_json::from_str(&json_text).unwrap();
        assert_eq!(reloaded.field("Komponist"), "Lincke, Paul");

        let merged = table::read_batch_csv(&layout.final_csv).unwrap();
        assert_eq!(merged[0].field("Komponist"), "Lincke, Paul");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        table::write_batch_csv(
            &layout.csv_dir.join("Batch_01.csv"),
            &[record_with_fields("a.jpg", &[])],
        )
        .unwrap();

        let report = apply_corrections(
            &layout,
            &[Correction {
                batch: "Batch_01".to_owned(),
                filename: "a.jpg".to_owned(),
                field: "Dirigent".to_owned(),
                value: "x".to_owned(),
            }],
        )
        .unwrap();
        assert_eq!(report, CorrectionReport { applied: 0, skipped: 1 });
    }
}
