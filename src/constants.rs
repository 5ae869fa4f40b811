#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

/// Name of the student's code artifact.
pub const ANSWERS_FILENAME: &str = "answers.py";

/// Reference solution dropped into a submission folder for calibration runs.
pub const TEACHER_ANSWERS_FILENAME: &str = "teacher_answers.py";

/// Name of the student's written report.
pub const REPORT_FILENAME: &str = "report.md";

/// Configuration file picked up from the working directory when `--config` is
/// not given.
pub const DEFAULT_CONFIG_FILENAME: &str = "grader.toml";

/// Output directory for grade records and summaries.
pub const DEFAULT_GRADES_DIR: &str = "grades";

/// Sub-directory of the grades directory holding one JSON record per
/// submission, grouped by rubric version.
pub const RECORDS_DIR: &str = "records";

/// Class summary, including every grade record.
pub const GRADES_SUMMARY_FILENAME: &str = "grades_summary.json";

/// Gradebook-friendly CSV export.
pub const GRADES_CSV_FILENAME: &str = "grades_summary.csv";

/// Directories inside the submissions folder that are never submissions.
pub const IGNORED_DIRS: &[&str] = &["tests", "__pycache__"];

/// File extensions treated as report figures.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp"];

/// Section-name keywords that mark a rubric section as extra credit.
pub const EXTRA_CREDIT_KEYWORDS: &[&str] = &["extra", "bonus", "optional"];

/// Prompt truncation length for review payloads.
pub const PROMPT_TRUNCATE: usize = 15_000;

/// Maximum characters of a report forwarded to the reviewer.
pub const REPORT_TRUNCATE: usize = 8_000;

/// Maximum characters of overall feedback kept in the CSV export.
pub const CSV_FEEDBACK_TRUNCATE: usize = 200;
