//! Tabular exports: per-batch CSV files and the consolidated table.
//!
//! Exports are written with a UTF-8 BOM so the archive staff can open them
//! directly in Excel without mangling umlauts.

use std::{
    fs::File,
    io::{Read as _, Write as _},
};

use crate::{
    prelude::*,
    schema::{BATCH_COLUMN, CardRecord, FILENAME_COLUMN, FieldMap, csv_columns},
};

/// UTF-8 byte order mark.
const BOM: &[u8] = b"\xef\xbb\xbf";

/// Write one batch's records as a CSV file, sorted by filename for stable
/// output across reruns.
pub fn write_batch_csv(path: &Path, records: &[CardRecord]) -> Result<()> {
    let mut records = records.to_vec();
    records.sort_by(|a, b| a.filename.cmp(&b.filename));

    let mut file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(BOM).context("failed to write BOM")?;

    let mut writer = csv::Writer::from_writer(file);
    writer
        .write_record(csv_columns())
        .context("failed to write CSV header")?;
    for record in &records {
        writer
            .write_record(record.csv_row())
            .with_context(|| format!("failed to write row for {}", record.filename))?;
    }
    writer.flush().context("failed to flush CSV")?;
    Ok(())
}

/// Read a batch CSV back into records. Used by the merge step and the review
/// tooling.
pub fn read_batch_csv(path: &Path) -> Result<Vec<CardRecord>> {
    let mut text = String::new();
    File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .read_to_string(&mut text)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .context("failed to read CSV header")?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.with_context(|| format!("bad CSV row in {}", path.display()))?;
        let mut filename = String::new();
        let mut batch = String::new();
        let mut fields = FieldMap::new();
        for (header, value) in headers.iter().zip(row.iter()) {
            match header {
                FILENAME_COLUMN => filename = value.to_owned(),
                BATCH_COLUMN => batch = value.to_owned(),
                _ => {
                    fields.insert(header.to_owned(), value.to_owned());
                }
            }
        }
        records.push(CardRecord {
            filename,
            batch,
            fields,
        });
    }
    Ok(records)
}

/// Write a batch CSV, preserving rows from an earlier, interrupted run.
///
/// The per-batch table must stay row-equivalent to the union of the batch's
/// extraction records, so rows already exported before a resume are folded
/// back in; a fresh record for the same filename wins.
pub fn update_batch_csv(path: &Path, new_records: &[CardRecord]) -> Result<usize> {
    let mut records = new_records.to_vec();
    if path.exists() {
        let existing = read_batch_csv(path)
            .with_context(|| format!("failed to load existing {}", path.display()))?;
        for old in existing {
            if !records.iter().any(|r| r.filename == old.filename) {
                records.push(old);
            }
        }
    }
    write_batch_csv(path, &records)?;
    Ok(records.len())
}

/// Merge every per-batch CSV under `csv_dir` into one consolidated table at
/// `final_csv`. Returns the number of rows written.
///
/// The consolidated table is rebuilt from scratch on every call, never
/// incrementally updated.
pub fn merge_batch_csvs(csv_dir: &Path, final_csv: &Path) -> Result<usize> {
    let mut batch_files = Vec::new();
    let entries = std::fs::read_dir(csv_dir)
        .with_context(|| format!("failed to list {}", csv_dir.display()))?;
    for entry in entries {
        let path = entry.context("failed to read directory entry")?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("csv") {
            batch_files.push(path);
        }
    }
    batch_files.sort();

    let mut all_records = Vec::new();
    for path in &batch_files {
        let records = read_batch_csv(path)
            .with_context(|| format!("failed to load batch CSV {}", path.display()))?;
        all_records.extend(records);
    }

    write_batch_csv(final_csv, &all_records)?;
    Ok(all_records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(filename: &str, batch: &str, komponist: &str) -> CardRecord {
        let mut fields = FieldMap::new();
        fields.insert("Komponist".to_owned(), komponist.to_owned());
        CardRecord::new(filename.to_owned(), batch.to_owned(), fields)
    }

    #[test]
    fn batch_csv_round_trips_with_bom_and_sorted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Batch_01.csv");
        let records = vec![
            record("b.jpg", "Batch_01", "Strauss"),
            record("a.jpg", "Batch_01", "Lehár"),
        ];
        write_batch_csv(&path, &records).unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..3], BOM);

        let reloaded = read_batch_csv(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].filename, "a.jpg");
        assert_eq!(reloaded[0].field("Komponist"), "Lehár");
        assert_eq!(reloaded[1].filename, "b.jpg");
    }

    #[test]
    fn update_preserves_rows_from_an_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Batch_01.csv");
        update_batch_csv(&path, &[record("a.jpg", "Batch_01", "Lehár")]).unwrap();
        let rows = update_batch_csv(
            &path,
            &[
                record("b.jpg", "Batch_01", "Strauss"),
                record("a.jpg", "Batch_01", "Lehár, Franz"),
            ],
        )
        .unwrap();
        assert_eq!(rows, 2);

        let reloaded = read_batch_csv(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        // The fresh record for a.jpg wins.
        assert_eq!(reloaded[0].field("Komponist"), "Lehár, Franz");
    }

    #[test]
    fn merge_unions_all_batch_tables() {
        let dir = tempfile::tempdir().unwrap();
        let csv_dir = dir.path().join("csv");
        std::fs::create_dir(&csv_dir).unwrap();
        write_batch_csv(
            &csv_dir.join("Batch_01.csv"),
            &[record("a.jpg", "Batch_01", "Lincke")],
        )
        .unwrap();
        write_batch_csv(
            &csv_dir.join("Batch_02.csv"),
            &[record("b.jpg", "Batch_02", "Millöcker")],
        )
        .unwrap();

        let final_csv = dir.path().join("complete.csv");
        let rows = merge_batch_csvs(&csv_dir, &final_csv).unwrap();
        assert_eq!(rows, 2);

        let merged = read_batch_csv(&final_csv).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].batch, "Batch_01");
        assert_eq!(merged[1].batch, "Batch_02");
    }
}
