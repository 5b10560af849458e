use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{BenchError, Result};
use crate::store::ResultStore;
use crate::types::{BenchResult, Run, RunId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
    Csv,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ReportFormat::Markdown => "text/markdown; charset=utf-8",
            ReportFormat::Json => "application/json",
            ReportFormat::Csv => "text/csv; charset=utf-8",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportArtifact {
    pub run_id: RunId,
    pub format: ReportFormat,
    pub file_name: String,
    pub body: String,
}

pub trait Reporter: Send + Sync {
    fn generate(&self, run_id: RunId, format: ReportFormat) -> Result<ReportArtifact>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub model: String,
    pub results: usize,
    pub avg_time_ms: f64,
    pub avg_tokens_per_second: f64,
    /// Mean score as a percentage; unscored results count as zero.
    pub avg_score_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailRow {
    pub model: String,
    pub task_id: String,
    pub status: String,
    pub time_ms: u64,
    pub tokens: u64,
    pub tokens_per_second: f64,
    pub score_percent: f64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    run: &'a Run,
    summary: &'a [ModelSummary],
    details: &'a [DetailRow],
}

pub fn summarize(results: &[BenchResult]) -> Vec<ModelSummary> {
    let mut by_model: BTreeMap<&str, Vec<&BenchResult>> = BTreeMap::new();
    for r in results {
        by_model.entry(r.model.as_str()).or_default().push(r);
    }

    by_model
        .into_iter()
        .map(|(model, rs)| {
            let count = rs.len() as f64;
            let total_ms: u64 = rs.iter().map(|r| r.elapsed_ms.unwrap_or(0)).sum();
            let total_tokens: u64 = rs.iter().map(|r| r.tokens.unwrap_or(0)).sum();
            let total_score: f64 = rs.iter().map(|r| r.score.unwrap_or(0.0)).sum();
            ModelSummary {
                model: model.to_string(),
                results: rs.len(),
                avg_time_ms: total_ms as f64 / count,
                avg_tokens_per_second: if total_ms > 0 {
                    total_tokens as f64 / total_ms as f64 * 1000.0
                } else {
                    0.0
                },
                avg_score_percent: total_score / count * 100.0,
            }
        })
        .collect()
}

pub fn detail_rows(results: &[BenchResult]) -> Vec<DetailRow> {
    results
        .iter()
        .map(|r| DetailRow {
            model: r.model.clone(),
            task_id: r.task_id.clone(),
            status: r.status.to_string(),
            time_ms: r.elapsed_ms.unwrap_or(0),
            tokens: r.tokens.unwrap_or(0),
            tokens_per_second: r.tokens_per_second().unwrap_or(0.0),
            score_percent: r.score.unwrap_or(0.0) * 100.0,
            reason: r
                .rationale
                .clone()
                .or_else(|| r.error.clone())
                .unwrap_or_default(),
        })
        .collect()
}

fn md_cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\r', '\n'], " ")
}

/// Builds summary and detail tables from the persisted results of a run.
pub struct TableReporter {
    store: Arc<dyn ResultStore>,
}

impl TableReporter {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    fn markdown(run: &Run, summary: &[ModelSummary], details: &[DetailRow]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Benchmark run {}\n", run.id);
        let _ = writeln!(out, "- Judge: {}", run.judge_model);
        let _ = writeln!(out, "- Status: {}", run.status);
        let _ = writeln!(out, "- Started: {}\n", run.created_at.to_rfc3339());

        out.push_str("## Summary\n\n");
        out.push_str("| MODEL | RESULTS | AVG. TIME (s) | AVG. TOKENS/s | AVG. SCORE (%) |\n");
        out.push_str("|---|---|---|---|---|\n");
        for s in summary {
            let _ = writeln!(
                out,
                "| {} | {} | {:.3} | {:.3} | {:.2} |",
                md_cell(&s.model),
                s.results,
                s.avg_time_ms / 1000.0,
                s.avg_tokens_per_second,
                s.avg_score_percent
            );
        }

        out.push_str("\n## Details\n\n");
        out.push_str("| MODEL | TASK | STATUS | TIME (ms) | TOKENS | TOKENS/s | SCORE (%) | REASON |\n");
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for d in details {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {:.2} | {:.2} | {} |",
                md_cell(&d.model),
                md_cell(&d.task_id),
                d.status,
                d.time_ms,
                d.tokens,
                d.tokens_per_second,
                d.score_percent,
                md_cell(&d.reason)
            );
        }
        out
    }

    fn csv(details: &[DetailRow]) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in details {
            writer
                .serialize(row)
                .map_err(|e| BenchError::Persistence(format!("cannot encode CSV row: {}", e)))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| BenchError::Persistence(format!("cannot finish CSV report: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| BenchError::Persistence(format!("CSV report is not UTF-8: {}", e)))
    }
}

impl Reporter for TableReporter {
    fn generate(&self, run_id: RunId, format: ReportFormat) -> Result<ReportArtifact> {
        let run = self.store.get_run(run_id)?;
        let results = self.store.load_results(run_id, None)?;
        let summary = summarize(&results);
        let details = detail_rows(&results);

        let body = match format {
            ReportFormat::Markdown => Self::markdown(&run, &summary, &details),
            ReportFormat::Json => serde_json::to_string_pretty(&JsonReport {
                run: &run,
                summary: &summary,
                details: &details,
            })
            .map_err(|e| BenchError::Persistence(format!("cannot encode report: {}", e)))?,
            ReportFormat::Csv => Self::csv(&details)?,
        };

        Ok(ReportArtifact {
            run_id,
            format,
            file_name: format!("run-{}-report.{}", run_id, format.extension()),
            body,
        })
    }
}
