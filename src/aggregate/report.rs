#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Panel, Style, Width, object::Rows},
};

use super::{ClassSummary, aggregate};
use crate::{
    constants::{CSV_FEEDBACK_TRUNCATE, GRADES_CSV_FILENAME, GRADES_SUMMARY_FILENAME},
    grade::{GradeRecord, GradeStatus},
    rubric::Rubric,
};

/// Every grade record of a run plus the class summary; what the dashboard
/// reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    /// Rubric version the records were graded against.
    pub rubric_version: String,
    /// Assignment title.
    pub rubric_title:   String,
    /// When the set was assembled.
    pub generated_at:   DateTime<Utc>,
    /// Class statistics.
    pub summary:        ClassSummary,
    /// Records sorted by submission id.
    pub records:        Vec<GradeRecord>,
}

impl ResultSet {
    /// Assembles a result set and computes its summary.
    pub fn new(rubric: &Rubric, records: Vec<GradeRecord>) -> Self {
        Self::from_parts(rubric.version(), rubric.title.clone(), records)
    }

    /// Assembles a result set from already-known rubric identity.
    pub fn from_parts(rubric_version: String, rubric_title: String, mut records: Vec<GradeRecord>) -> Self {
        records.sort_by(|a, b| a.submission_id.cmp(&b.submission_id));
        Self {
            rubric_version,
            rubric_title,
            generated_at: Utc::now(),
            summary: aggregate(&records),
            records,
        }
    }

    /// Writes `grades_summary.json` and `grades_summary.csv` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Could not create grades directory {}", dir.display()))?;

        let json_path = dir.join(GRADES_SUMMARY_FILENAME);
        let json = serde_json::to_string_pretty(self).context("Could not serialize result set")?;
        std::fs::write(&json_path, json)
            .with_context(|| format!("Could not write {}", json_path.display()))?;

        let csv_path = dir.join(GRADES_CSV_FILENAME);
        std::fs::write(&csv_path, self.to_csv()?)
            .with_context(|| format!("Could not write {}", csv_path.display()))?;

        Ok((json_path, csv_path))
    }

    /// Reads a previously written result set from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(GRADES_SUMMARY_FILENAME);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Could not parse {}", path.display()))
    }

    /// Recomputes the summary from the records.
    pub fn reaggregate(&mut self) {
        self.summary = aggregate(&self.records);
    }

    /// Gradebook CSV: one row per student, one column per criterion.
    pub fn to_csv(&self) -> Result<String> {
        let criteria: Vec<&str> = self
            .summary
            .criteria
            .iter()
            .map(|c| c.criterion_id.as_str())
            .collect();

        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut header = vec![
            "student_id",
            "total_score",
            "max_score",
            "percentage",
            "tests_passed",
            "status",
        ];
        header.extend(criteria.iter().copied());
        header.push("overall_feedback");
        writer
            .write_record(&header)
            .context("Could not write CSV header")?;

        for record in &self.records {
            let mut row = vec![
                record.submission_id.clone(),
                format!("{}", record.total_points),
                format!("{}", record.max_points),
                format!("{:.1}%", record.percent()),
                match record.tests_passed {
                    Some(true) => "Yes".to_string(),
                    Some(false) => "No".to_string(),
                    None => String::new(),
                },
                record.status.to_string(),
            ];
            for id in &criteria {
                row.push(
                    record
                        .score(id)
                        .map(|s| format!("{}/{}", s.awarded, s.max_points))
                        .unwrap_or_default(),
                );
            }
            row.push(record.feedback.chars().take(CSV_FEEDBACK_TRUNCATE).collect());
            writer
                .write_record(&row)
                .with_context(|| format!("Could not write CSV row for {}", record.submission_id))?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Could not flush CSV: {}", e.error()))?;
        String::from_utf8(bytes).context("CSV output was not UTF-8")
    }
}

/// Status with terminal colour.
fn colored_status(status: GradeStatus) -> String {
    let s = status.to_string();
    match status {
        GradeStatus::Complete => s.green().to_string(),
        GradeStatus::Partial => s.yellow().to_string(),
        GradeStatus::Failed => s.red().to_string(),
        GradeStatus::Pending => s.dimmed().to_string(),
    }
}

#[derive(Tabled)]
/// A row of the class overview table
struct StudentRow {
    #[tabled(rename = "Student")]
    /// * `student`: submission id
    student: String,
    #[tabled(rename = "Total")]
    /// * `total`: awarded over maximum
    total:   String,
    #[tabled(rename = "Percent")]
    /// * `percent`: total as a percentage
    percent: String,
    #[tabled(rename = "Tests")]
    /// * `tests`: whether all tests passed
    tests:   String,
    #[tabled(rename = "Status")]
    /// * `status`: pipeline status
    status:  String,
}

#[derive(Tabled)]
/// A row of the per-criterion statistics table
struct CriterionRow {
    #[tabled(rename = "Criterion")]
    /// * `criterion`: criterion id
    criterion: String,
    #[tabled(rename = "Mean")]
    /// * `mean`: mean over maximum
    mean:      String,
    #[tabled(rename = "Median")]
    /// * `median`: median score
    median:    String,
    #[tabled(rename = "Range")]
    /// * `range`: min to max
    range:     String,
    #[tabled(rename = "Full / Zero")]
    /// * `extremes`: full-mark and zero counts
    extremes:  String,
}

/// Class overview: one row per student and the class statistics.
pub fn overview_table(results: &ResultSet) -> String {
    let rows: Vec<StudentRow> = results
        .records
        .iter()
        .map(|r| StudentRow {
            student: r.submission_id.clone(),
            total:   format!("{:.2}/{:.2}", r.total_points, r.max_points),
            percent: format!("{:.1}%", r.percent()),
            tests:   match r.tests_passed {
                Some(true) => "passed".to_string(),
                Some(false) => "failed".to_string(),
                None => "-".to_string(),
            },
            status:  colored_status(r.status),
        })
        .collect();

    let s = &results.summary;
    let counts = &s.status_counts;
    let footer = format!(
        "mean {:.2} | median {:.2} | min {:.2} | max {:.2} | tests passed {:.1}% | {} complete, \
         {} partial, {} failed, {} pending",
        s.totals.mean,
        s.totals.median,
        s.totals.min,
        s.totals.max,
        s.tests_passed_percent,
        counts.complete,
        counts.partial,
        counts.failed,
        counts.pending,
    );

    let students = Table::new(&rows)
        .with(Modify::new(Rows::new(1..)).with(Width::wrap(24).keep_words(true)))
        .with(Panel::header(format!("{} ({})", results.rubric_title, results.rubric_version)))
        .with(Panel::footer(footer))
        .with(
            Modify::new(Rows::first())
                .with(Alignment::center())
                .with(Alignment::center_vertical()),
        )
        .with(Style::modern())
        .to_string();

    let criteria: Vec<CriterionRow> = s
        .criteria
        .iter()
        .map(|c| CriterionRow {
            criterion: c.criterion_id.clone(),
            mean:      format!("{:.2}/{:.2}", c.stats.mean, c.max_points),
            median:    format!("{:.2}", c.stats.median),
            range:     format!("{:.2} - {:.2}", c.stats.min, c.stats.max),
            extremes:  format!("{} / {}", c.full_marks, c.zero),
        })
        .collect();

    if criteria.is_empty() {
        return students;
    }

    let per_criterion = Table::new(&criteria)
        .with(Panel::header("Per-criterion distribution"))
        .with(Style::modern())
        .to_string();
    format!("{students}\n{per_criterion}")
}

/// Per-criterion breakdown of one record.
pub fn record_table(record: &GradeRecord) -> String {
    Table::new(&record.scores)
        .with(Modify::new(Rows::new(1..)).with(Width::wrap(24).keep_words(true)))
        .with(Panel::header(format!("Grading Overview: {}", record.submission_id)))
        .with(Panel::footer(format!(
            "Total: {:.2}/{:.2} ({})",
            record.total_points, record.max_points, record.status
        )))
        .with(
            Modify::new(Rows::first())
                .with(Alignment::center())
                .with(Alignment::center_vertical()),
        )
        .with(
            Modify::new(Rows::last())
                .with(Alignment::center())
                .with(Alignment::center_vertical()),
        )
        .with(Style::modern())
        .to_string()
}
