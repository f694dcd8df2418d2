//! Run reports and parquet snapshots.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use taxmirror_core::DocumentRecord;
use tokio::fs;
use uuid::Uuid;

use crate::orchestrator::SyncReport;

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub entity_id: Uuid,
    pub exported_at: chrono::DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<root>/<run_id>/sync_report.json` and `summary.md` for each run.
#[derive(Debug, Clone)]
pub struct RunReports {
    root: PathBuf,
}

impl RunReports {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write_sync_report(&self, report: &SyncReport) -> Result<PathBuf> {
        let dir = self.root.join(report.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
        fs::write(dir.join("sync_report.json"), json)
            .await
            .context("writing sync_report.json")?;
        fs::write(dir.join("summary.md"), summary_markdown(report))
            .await
            .context("writing summary.md")?;
        Ok(dir)
    }
}

pub fn summary_markdown(report: &SyncReport) -> String {
    let overall = report.totals.overall();
    let mut lines = vec![
        "# Sync Summary".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Session: `{}`", report.session_id),
        format!("- Entity: `{}`", report.entity_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!(
            "- Periods: {} of {} ({})",
            report.periods_processed,
            report.periods.len(),
            report.periods.join(", ")
        ),
        format!(
            "- Documents: {} total, {} new, {} updated",
            overall.total, overall.new, overall.updated
        ),
    ];
    if report.cancelled {
        lines.push("- Cancelled before completion".to_string());
    }

    lines.push(String::new());
    lines.push("## Families".to_string());
    for (name, outcome) in [
        ("purchase", report.totals.purchase),
        ("sale", report.totals.sale),
        ("receipt", report.totals.receipt),
    ] {
        lines.push(format!(
            "- {name}: {} total, {} new, {} updated",
            outcome.total, outcome.new, outcome.updated
        ));
    }

    if !report.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        for failure in &report.errors {
            lines.push(format!(
                "- {} {}: {}",
                failure.period,
                failure.family.as_str(),
                failure.error
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write `documents.parquet`, `period_totals.parquet` and `manifest.json` under
/// `out_dir`, returning the manifest path.
pub fn export_snapshot(out_dir: &Path, entity_id: Uuid, documents: &[DocumentRecord]) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let documents_path = out_dir.join("documents.parquet");
    let totals_path = out_dir.join("period_totals.parquet");
    write_documents_parquet(&documents_path, documents)?;
    let total_rows = write_period_totals_parquet(&totals_path, documents)?;

    let manifest = ExportManifest {
        schema_version: 1,
        entity_id,
        exported_at: Utc::now(),
        files: vec![
            manifest_entry("documents", out_dir, &documents_path, documents.len())?,
            manifest_entry("period_totals", out_dir, &totals_path, total_rows)?,
        ],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a>(documents: &'a [DocumentRecord], f: impl Fn(&'a DocumentRecord) -> Option<&'a str>) -> StringArray {
    StringArray::from(documents.iter().map(f).collect::<Vec<_>>())
}

fn amounts(documents: &[DocumentRecord], f: impl Fn(&DocumentRecord) -> i64) -> Int64Array {
    Int64Array::from(documents.iter().map(f).collect::<Vec<_>>())
}

fn write_documents_parquet(path: &Path, documents: &[DocumentRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("family", DataType::Utf8, false),
        ArrowField::new("document_type", DataType::Utf8, false),
        ArrowField::new("folio", DataType::Utf8, false),
        ArrowField::new("period", DataType::Utf8, false),
        ArrowField::new("granularity", DataType::Utf8, false),
        ArrowField::new("issue_date", DataType::Utf8, true),
        ArrowField::new("counterparty_rut", DataType::Utf8, true),
        ArrowField::new("counterparty_name", DataType::Utf8, true),
        ArrowField::new("net_amount", DataType::Int64, false),
        ArrowField::new("tax_amount", DataType::Int64, false),
        ArrowField::new("exempt_amount", DataType::Int64, false),
        ArrowField::new("total_amount", DataType::Int64, false),
        ArrowField::new("status", DataType::Utf8, false),
    ]));

    let periods: Vec<String> = documents.iter().map(|d| d.period.code()).collect();
    let issue_dates: Vec<Option<String>> = documents
        .iter()
        .map(|d| d.issue_date.map(|date| date.to_string()))
        .collect();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(documents, |d| Some(d.family.as_str()))),
            Arc::new(strings(documents, |d| Some(d.document_type.as_str()))),
            Arc::new(strings(documents, |d| Some(d.folio.as_str()))),
            Arc::new(StringArray::from(periods)),
            Arc::new(strings(documents, |d| Some(d.granularity.as_str()))),
            Arc::new(StringArray::from(issue_dates)),
            Arc::new(strings(documents, |d| d.counterparty_rut.as_deref())),
            Arc::new(strings(documents, |d| d.counterparty_name.as_deref())),
            Arc::new(amounts(documents, |d| d.net_amount)),
            Arc::new(amounts(documents, |d| d.tax_amount)),
            Arc::new(amounts(documents, |d| d.exempt_amount)),
            Arc::new(amounts(documents, |d| d.total_amount)),
            Arc::new(strings(documents, |d| Some(d.status.as_str()))),
        ],
    )
    .context("building documents record batch")?;
    write_parquet(path, batch)
}

#[derive(Default)]
struct PeriodTotal {
    rows: u64,
    net: i64,
    tax: i64,
    total: i64,
}

fn write_period_totals_parquet(path: &Path, documents: &[DocumentRecord]) -> Result<usize> {
    let mut grouped: BTreeMap<(String, &'static str), PeriodTotal> = BTreeMap::new();
    for document in documents {
        let entry = grouped
            .entry((document.period.code(), document.family.as_str()))
            .or_default();
        entry.rows += 1;
        entry.net += document.net_amount;
        entry.tax += document.tax_amount;
        entry.total += document.total_amount;
    }

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("period", DataType::Utf8, false),
        ArrowField::new("family", DataType::Utf8, false),
        ArrowField::new("rows", DataType::UInt64, false),
        ArrowField::new("net_amount", DataType::Int64, false),
        ArrowField::new("tax_amount", DataType::Int64, false),
        ArrowField::new("total_amount", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                grouped.keys().map(|(period, _)| Some(period.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                grouped.keys().map(|(_, family)| Some(*family)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(grouped.values().map(|t| t.rows).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(grouped.values().map(|t| t.net).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(grouped.values().map(|t| t.tax).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(grouped.values().map(|t| t.total).collect::<Vec<_>>())),
        ],
    )
    .context("building period totals record batch")?;
    write_parquet(path, batch)?;
    Ok(grouped.len())
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{FamilyTotals, PeriodFailure};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;
    use taxmirror_core::{DocumentFamily, Granularity, SyncPeriod};
    use taxmirror_storage::UpsertOutcome;

    fn document(family: DocumentFamily, folio: &str, month: u32, total: i64) -> DocumentRecord {
        DocumentRecord {
            entity_id: Uuid::nil(),
            family,
            document_type: "33".into(),
            folio: folio.into(),
            period: SyncPeriod::new(2024, month).unwrap(),
            granularity: Granularity::Detail,
            issue_date: None,
            counterparty_rut: Some("11111111-1".into()),
            counterparty_name: None,
            net_amount: total,
            tax_amount: 0,
            exempt_amount: 0,
            total_amount: total,
            status: "registered".into(),
            extra_data: json!({}),
            contact_id: None,
        }
    }

    fn report() -> SyncReport {
        let now = Utc::now();
        SyncReport {
            run_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            months_back: 2,
            totals: FamilyTotals {
                purchase: UpsertOutcome { total: 3, new: 2, updated: 1 },
                ..FamilyTotals::default()
            },
            periods: vec!["202409".into(), "202410".into()],
            periods_processed: 2,
            errors: vec![PeriodFailure {
                period: "202410".into(),
                family: DocumentFamily::Sale,
                error: "extraction failed: bad shape".into(),
            }],
            cancelled: false,
            duration_seconds: 1.5,
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn sync_report_writes_json_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let reports = RunReports::new(dir.path());
        let report = report();
        let run_dir = reports.write_sync_report(&report).await.unwrap();

        assert_eq!(run_dir, dir.path().join(report.run_id.to_string()));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("sync_report.json")).unwrap()).unwrap();
        assert_eq!(json["totals"]["purchase"]["new"], 2);
        let summary = std::fs::read_to_string(run_dir.join("summary.md")).unwrap();
        assert!(summary.contains("- purchase: 3 total, 2 new, 1 updated"));
        assert!(summary.contains("202410 sale: extraction failed"));
    }

    #[test]
    fn export_writes_parquet_and_manifest_digests() {
        let dir = tempfile::tempdir().unwrap();
        let documents = vec![
            document(DocumentFamily::Purchase, "1", 9, 100),
            document(DocumentFamily::Purchase, "2", 9, 50),
            document(DocumentFamily::Sale, "3", 10, 70),
        ];
        let manifest_path = export_snapshot(dir.path(), Uuid::nil(), &documents).unwrap();

        let manifest: serde_json::Value = serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["rows"], 3);
        assert_eq!(files[1]["rows"], 2);

        let bytes = std::fs::read(dir.path().join("documents.parquet")).unwrap();
        assert_eq!(files[0]["sha256"], hex::encode(Sha256::digest(&bytes)));

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(dir.path().join("period_totals.parquet")).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[test]
    fn export_of_empty_entity_still_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        export_snapshot(dir.path(), Uuid::nil(), &[]).unwrap();
        assert!(dir.path().join("documents.parquet").exists());
        assert!(dir.path().join("manifest.json").exists());
    }
}
