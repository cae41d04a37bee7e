//! Bulk ingestion: parse, validate every row, then commit valid rows one
//! upsert at a time.
//!
//! Commits are per row, never batch-wide. A cancelled or aborted batch
//! leaves the rows it already committed in place, and re-running the same
//! payload is safe because every upsert is keyed by natural identity.

use crate::engine::{Engine, ScopeError, SubjectEntry};
use crate::error::EngineError;
use crate::grading::{GradingScope, OutOfRangePolicy};
use crate::ranking::RankScope;
use crate::scoring::{AssessmentConfig, ComponentScores, SubjectScore, RAW_ASSESSMENT_TYPE};
use crate::settings::ImportSettings;
use crate::store::{ImportLogEntry, StudentFields};
use crate::tabular::{self, normalize_header, PayloadFormat, RawRow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportTarget {
    Roster,
    Scores,
    Mock,
}

impl ImportTarget {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roster" | "students" => Some(Self::Roster),
            "scores" => Some(Self::Scores),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Roster => "roster",
            Self::Scores => "scores",
            Self::Mock => "mock",
        }
    }

    fn template_columns(self) -> &'static [&'static str] {
        match self {
            Self::Roster => &["student_no", "last_name", "first_name", "class_name"],
            Self::Scores => &[
                "student_no",
                "last_name",
                "first_name",
                "class_name",
                "term",
                "academic_year",
                "department",
                "assessment_type",
                "subject",
            ],
            Self::Mock => &[
                "student_no",
                "last_name",
                "first_name",
                "session",
                "subject",
                "percentage",
            ],
        }
    }

    fn is_known_column(self, column: &str) -> bool {
        self.template_columns()
            .iter()
            .any(|c| normalize_header(c) == column)
    }
}

/// Header row for a target. Score templates end with the component columns
/// of `config`, or the single raw `score` column.
pub fn template_headers(target: ImportTarget, config: Option<&AssessmentConfig>) -> Vec<String> {
    let mut headers: Vec<String> = target
        .template_columns()
        .iter()
        .map(|c| c.to_string())
        .collect();
    if target == ImportTarget::Scores {
        match config {
            Some(config) => headers.extend(config.components.iter().map(|c| c.name.clone())),
            None => headers.push(crate::scoring::RAW_COMPONENT.to_string()),
        }
    }
    headers
}

/// Values applied when a row leaves the matching column blank.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchDefaults {
    pub class_name: Option<String>,
    pub term: Option<String>,
    pub academic_year: Option<String>,
    pub department: Option<String>,
    pub assessment_type: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub batch_id: String,
    pub target: ImportTarget,
    pub format: PayloadFormat,
    pub payload: String,
    pub defaults: BatchDefaults,
    pub policy: OutOfRangePolicy,
    pub settings: ImportSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Parsing,
    Validating,
    Importing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub phase: BatchPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Receives per-row progress. `progress` fires once for every processed row
/// (the last one with phase `complete`), or once at the end when there is no
/// row to process. `phase` reports the transitions that precede row work.
pub trait ProgressSink {
    fn progress(&mut self, progress: &Progress);

    fn phase(&mut self, _phase: BatchPhase, _message: &str) {}
}

impl<F: FnMut(&Progress)> ProgressSink for F {
    fn progress(&mut self, progress: &Progress) {
        self(progress)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIssue {
    pub line: usize,
    pub severity: IssueSeverity,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RowIssue {
    fn error(line: usize, err: &EngineError, field: Option<&str>) -> Self {
        let field = match err {
            EngineError::Validation { field, .. } => Some(field.clone()),
            EngineError::InvalidComponentScore { component, .. } => Some(component.clone()),
            _ => field.map(str::to_string),
        };
        Self {
            line,
            severity: IssueSeverity::Error,
            code: err.code().to_string(),
            field,
            message: err.to_string(),
            details: err.details(),
        }
    }

    fn warning(line: usize, code: &str, field: Option<&str>, message: String) -> Self {
        Self {
            line,
            severity: IssueSeverity::Warning,
            code: code.to_string(),
            field: field.map(str::to_string),
            message,
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FatalError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub batch_id: String,
    pub target: ImportTarget,
    pub phase: BatchPhase,
    pub total: usize,
    pub valid: usize,
    pub imported: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub warnings: usize,
    pub not_processed: usize,
    pub cancelled: bool,
    pub fatal: Option<FatalError>,
    pub columns: Vec<String>,
    pub issues: Vec<RowIssue>,
    pub issues_truncated: bool,
    pub scope_errors: Vec<ScopeError>,
    pub payload_sha256: String,
    pub started_at: String,
    pub finished_at: String,
}

/// Terminal outcome of a batch: the summary (issue list capped) and the full
/// issue list.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub summary: ImportSummary,
    pub issues: Vec<RowIssue>,
}

/// A batch that stopped on an unreadable payload or an unavailable store.
/// Rows committed before the failure stay committed.
#[derive(Debug, Clone, Error)]
#[error("import batch {} failed: {error}", .report.summary.batch_id)]
pub struct BatchAborted {
    pub error: EngineError,
    pub report: ImportReport,
}

enum RowPlan {
    Roster {
        student_no: String,
        fields: StudentFields,
    },
    Score {
        entry: SubjectEntry,
        score: SubjectScore,
    },
    Mock {
        student_no: String,
        student: Option<StudentFields>,
        session: String,
        subject: String,
        percentage: f64,
    },
}

struct ValidatedRow {
    line: usize,
    plan: Option<RowPlan>,
}

type ConfigKey = (String, String, String, String);

struct Batch<'a> {
    engine: &'a Engine,
    request: &'a ImportRequest,
    issues: Vec<RowIssue>,
    scope_errors: BTreeMap<String, ScopeError>,
    seen_keys: HashMap<String, usize>,
    configs: HashMap<ConfigKey, Result<Arc<AssessmentConfig>, EngineError>>,
}

/// (normalized header, component key) for each component of a configuration.
fn component_columns(config: &AssessmentConfig) -> Vec<(String, String)> {
    config
        .components
        .iter()
        .map(|c| (normalize_header(&c.name), c.name.to_ascii_lowercase()))
        .collect()
}

fn value_or_default(row: &RawRow, column: &str, default: &Option<String>) -> Option<String> {
    row.get(column)
        .map(str::to_string)
        .or_else(|| {
            default
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
}

fn parse_percentage(raw: &str, field: &str) -> Result<f64, EngineError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| EngineError::validation(field, format!("'{}' is not a number", raw.trim())))?;
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(EngineError::ScoreOutOfRange {
            score: value,
            min: 0.0,
            max: 100.0,
        });
    }
    Ok(value)
}

fn names_from_row(row: &RawRow, class_name: Option<String>) -> Option<StudentFields> {
    let last = row.get("lastname");
    let first = row.get("firstname");
    if last.is_none() && first.is_none() {
        return None;
    }
    Some(StudentFields {
        last_name: last.unwrap_or_default().to_string(),
        first_name: first.unwrap_or_default().to_string(),
        class_name,
    })
}

impl<'a> Batch<'a> {
    fn new(engine: &'a Engine, request: &'a ImportRequest) -> Self {
        Self {
            engine,
            request,
            issues: Vec::new(),
            scope_errors: BTreeMap::new(),
            seen_keys: HashMap::new(),
            configs: HashMap::new(),
        }
    }

    fn require(&mut self, row: &RawRow, column: &str, value: Option<String>) -> Option<String> {
        if value.is_none() {
            let err = EngineError::validation(column, format!("missing required field {}", column));
            self.issues.push(RowIssue::error(row.line, &err, None));
        }
        value
    }

    /// First occurrence of a business key wins; later ones are rejected.
    fn claim_key(&mut self, row: &RawRow, key: String) -> bool {
        let key = key.to_ascii_lowercase();
        if let Some(&first_line) = self.seen_keys.get(&key) {
            let err = EngineError::IdentityConflict { key, first_line };
            self.issues.push(RowIssue::error(row.line, &err, None));
            return false;
        }
        self.seen_keys.insert(key, row.line);
        true
    }

    fn warn_unknown_columns(&mut self, row: &RawRow, extra_known: &[String]) {
        let target = self.request.target;
        for (column, value) in &row.fields {
            if value.trim().is_empty()
                || target.is_known_column(column)
                || extra_known.iter().any(|k| k == column)
            {
                continue;
            }
            self.issues.push(RowIssue::warning(
                row.line,
                "unknown_column",
                Some(column),
                format!("column '{}' is not used by {} imports", column, target.as_str()),
            ));
        }
        if row.extra_cells > 0 {
            self.issues.push(RowIssue::warning(
                row.line,
                "extra_cells",
                None,
                format!("{} value(s) beyond the header were ignored", row.extra_cells),
            ));
        }
    }

    fn scope_error(&mut self, line: usize, scope: &GradingScope, err: &EngineError) {
        self.issues.push(RowIssue::error(line, err, None));
        let name = scope.to_string();
        self.scope_errors
            .entry(name.clone())
            .or_insert_with(|| ScopeError {
                scope: name,
                code: err.code().to_string(),
                message: err.to_string(),
                rows: 0,
            })
            .rows += 1;
    }

    /// Returns `Err` only for fatal store failures.
    fn validate(&mut self, row: &RawRow) -> Result<Option<RowPlan>, EngineError> {
        let before = self.issues.len();
        let plan = match self.request.target {
            ImportTarget::Roster => self.validate_roster(row),
            ImportTarget::Scores => self.validate_score(row)?,
            ImportTarget::Mock => self.validate_mock(row),
        };
        let row_failed = self.issues[before..]
            .iter()
            .any(|i| i.severity == IssueSeverity::Error);
        Ok(if row_failed { None } else { plan })
    }

    fn validate_roster(&mut self, row: &RawRow) -> Option<RowPlan> {
        let defaults = &self.request.defaults;
        let class_name = value_or_default(row, "classname", &defaults.class_name);
        let student_no = self.require(row, "studentno", row.get("studentno").map(str::to_string));
        let last = self.require(row, "lastname", row.get("lastname").map(str::to_string));
        let first = self.require(row, "firstname", row.get("firstname").map(str::to_string));
        self.warn_unknown_columns(row, &[]);
        let (student_no, last_name, first_name) = (student_no?, last?, first?);
        if !self.claim_key(row, student_no.clone()) {
            return None;
        }
        Some(RowPlan::Roster {
            student_no,
            fields: StudentFields {
                last_name,
                first_name,
                class_name,
            },
        })
    }

    fn validate_mock(&mut self, row: &RawRow) -> Option<RowPlan> {
        let defaults = &self.request.defaults;
        let session_default = defaults.session.clone();
        let student_no = self.require(row, "studentno", row.get("studentno").map(str::to_string));
        let session = self.require(row, "session", value_or_default(row, "session", &session_default));
        let subject = self.require(row, "subject", row.get("subject").map(str::to_string));
        let raw_pct = self.require(row, "percentage", row.get("percentage").map(str::to_string));
        self.warn_unknown_columns(row, &[]);

        let percentage = match raw_pct.as_deref().map(|p| parse_percentage(p, "percentage")) {
            Some(Ok(p)) => Some(p),
            Some(Err(e)) => {
                self.issues.push(RowIssue::error(row.line, &e, Some("percentage")));
                None
            }
            None => None,
        };
        let (student_no, session, subject) = (student_no?, session?, subject?);
        if !self.claim_key(row, format!("{}|{}|{}", student_no, session, subject)) {
            return None;
        }
        Some(RowPlan::Mock {
            student: names_from_row(row, None),
            student_no,
            session,
            subject,
            percentage: percentage?,
        })
    }

    fn config_for(
        &mut self,
        scope: &GradingScope,
        assessment_type: &str,
    ) -> Result<Arc<AssessmentConfig>, EngineError> {
        let (d, y, t) = scope.cache_key();
        let key = (d, y, t, assessment_type.to_ascii_lowercase());
        let engine = self.engine;
        self.configs
            .entry(key)
            .or_insert_with(|| engine.assessment_config(scope, assessment_type).map(Arc::new))
            .clone()
    }

    fn validate_score(&mut self, row: &RawRow) -> Result<Option<RowPlan>, EngineError> {
        let defaults = self.request.defaults.clone();
        let student_no = self.require(row, "studentno", row.get("studentno").map(str::to_string));
        let class_name = self.require(row, "classname", value_or_default(row, "classname", &defaults.class_name));
        let term = self.require(row, "term", value_or_default(row, "term", &defaults.term));
        let year = self.require(
            row,
            "academicyear",
            value_or_default(row, "academicyear", &defaults.academic_year),
        );
        let department = self.require(
            row,
            "department",
            value_or_default(row, "department", &defaults.department),
        );
        let subject = self.require(row, "subject", row.get("subject").map(str::to_string));
        let assessment_type = value_or_default(row, "assessmenttype", &defaults.assessment_type)
            .unwrap_or_else(|| RAW_ASSESSMENT_TYPE.to_string());

        let known_scope = match (&department, &year, &term) {
            (Some(d), Some(y), Some(t)) => Some(GradingScope::new(d, y, t)),
            _ => None,
        };
        let (Some(student_no), Some(class_name), Some(term), Some(year), Some(department), Some(subject)) =
            (student_no, class_name, term, year, department, subject)
        else {
            // Component columns are only known once the configuration resolves.
            if let Some(scope) = known_scope {
                match self.config_for(&scope, &assessment_type) {
                    Ok(config) => {
                        let known = component_columns(&config).into_iter().map(|(col, _)| col);
                        self.warn_unknown_columns(row, &known.collect::<Vec<_>>());
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(_) => {}
                }
            }
            return Ok(None);
        };
        if !self.claim_key(
            row,
            format!("{}|{}|{}|{}|{}", student_no, class_name, term, year, subject),
        ) {
            return Ok(None);
        }

        let grading_scope = GradingScope::new(&department, &year, &term);
        let config = match self.config_for(&grading_scope, &assessment_type) {
            Ok(c) => c,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.scope_error(row.line, &grading_scope, &e);
                return Ok(None);
            }
        };

        let columns = component_columns(&config);
        let known: Vec<String> = columns.iter().map(|(col, _)| col.clone()).collect();
        self.warn_unknown_columns(row, &known);

        let mut components = ComponentScores::new();
        let mut cell_errors = false;
        for (column, name) in &columns {
            let value = match row.get(column) {
                None => None,
                Some(raw) => match parse_percentage(raw, column) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        self.issues.push(RowIssue::error(row.line, &e, Some(column)));
                        cell_errors = true;
                        continue;
                    }
                },
            };
            components.insert(name.clone(), value);
        }
        if cell_errors {
            return Ok(None);
        }

        let score = match self
            .engine
            .compute_subject_score(&components, &config, self.request.policy)
        {
            Ok(s) => s,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if e.is_configuration() => {
                self.scope_error(row.line, &grading_scope, &e);
                return Ok(None);
            }
            Err(e) => {
                self.issues.push(RowIssue::error(row.line, &e, None));
                return Ok(None);
            }
        };

        let student = names_from_row(row, Some(class_name.clone()));
        Ok(Some(RowPlan::Score {
            entry: SubjectEntry {
                student_no,
                student,
                scope: RankScope::new(&class_name, &term, &year),
                department,
                assessment_type: config.assessment_type.clone(),
                subject,
                components,
            },
            score,
        }))
    }

    /// Student names to write for a row that omitted them: none when the
    /// student exists (keep stored names), blank when new students may be
    /// created without names.
    fn fill_missing_names(
        &self,
        student_no: &str,
        given: Option<StudentFields>,
    ) -> Result<Option<StudentFields>, EngineError> {
        if given.is_some() || self.request.settings.require_names_for_new_students {
            return Ok(given);
        }
        if self.engine.store().find_student(student_no)?.is_some() {
            return Ok(None);
        }
        Ok(Some(StudentFields {
            last_name: String::new(),
            first_name: String::new(),
            class_name: None,
        }))
    }

    /// Commits one row; returns whether the target record was created.
    fn commit(&self, plan: &RowPlan) -> Result<bool, EngineError> {
        match plan {
            RowPlan::Roster { student_no, fields } => {
                Ok(self.engine.upsert_student(student_no, fields)?.created)
            }
            RowPlan::Score { entry, score } => {
                let mut entry = entry.clone();
                entry.student = self.fill_missing_names(&entry.student_no, entry.student.take())?;
                Ok(self.engine.commit_subject_score(&entry, score)?.created)
            }
            RowPlan::Mock {
                student_no,
                student,
                session,
                subject,
                percentage,
            } => {
                let student = self.fill_missing_names(student_no, student.clone())?;
                Ok(self
                    .engine
                    .upsert_mock_score(student_no, student.as_ref(), session, subject, *percentage)?
                    .created)
            }
        }
    }
}

#[derive(Default)]
struct Counts {
    total: usize,
    valid: usize,
    imported: usize,
    created: usize,
    updated: usize,
    failed: usize,
    not_processed: usize,
    cancelled: bool,
}

pub fn payload_digest(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Runs one batch to a terminal outcome. `Ok` covers complete and cancelled
/// batches (partial success is itemized in the report); `Err` carries the
/// fatal error together with the partial report.
pub fn run_import(
    engine: &Engine,
    request: &ImportRequest,
    sink: &mut dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<ImportReport, BatchAborted> {
    let started_at = Utc::now().to_rfc3339();
    let digest = payload_digest(&request.payload);
    let span = tracing::info_span!("import", batch = %request.batch_id, target = request.target.as_str());
    let _enter = span.enter();

    let mut batch = Batch::new(engine, request);
    let mut counts = Counts::default();

    sink.phase(BatchPhase::Parsing, "reading payload");
    let payload = match tabular::parse_payload(request.format, &request.payload) {
        Ok(p) => p,
        Err(error) => {
            tracing::warn!(error = %error, "payload rejected");
            sink.progress(&Progress {
                phase: BatchPhase::Failed,
                current: 0,
                total: 0,
                message: error.to_string(),
            });
            return Err(finish(batch, counts, Vec::new(), digest, started_at, Some(error)).into_aborted());
        }
    };
    counts.total = payload.rows.len();
    let total = counts.total;

    sink.phase(
        BatchPhase::Validating,
        &format!("validating {} row(s)", total),
    );
    let mut rows = Vec::with_capacity(total);
    for raw in &payload.rows {
        match batch.validate(raw) {
            Ok(plan) => rows.push(ValidatedRow {
                line: raw.line,
                plan,
            }),
            Err(error) => {
                tracing::error!(error = %error, line = raw.line, "store failed during validation");
                counts.not_processed = total;
                sink.progress(&Progress {
                    phase: BatchPhase::Failed,
                    current: 0,
                    total,
                    message: error.to_string(),
                });
                return Err(finish(batch, counts, payload.columns, digest, started_at, Some(error))
                    .into_aborted());
            }
        }
    }
    counts.valid = rows.iter().filter(|r| r.plan.is_some()).count();
    counts.failed = total - counts.valid;
    tracing::info!(total, valid = counts.valid, "batch validated");

    sink.phase(
        BatchPhase::Importing,
        &format!("importing {} valid row(s)", counts.valid),
    );
    let mut fatal: Option<EngineError> = None;
    let mut processed = 0usize;
    for row in &rows {
        if cancel.is_cancelled() {
            counts.cancelled = true;
            break;
        }
        if let Some(plan) = &row.plan {
            match batch.commit(plan) {
                Ok(true) => {
                    counts.imported += 1;
                    counts.created += 1;
                }
                Ok(false) => {
                    counts.imported += 1;
                    counts.updated += 1;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, line = row.line, "store unavailable, aborting batch");
                    batch.issues.push(RowIssue::error(row.line, &e, None));
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, line = row.line, "row rejected by store");
                    batch.issues.push(RowIssue::error(row.line, &e, None));
                    counts.failed += 1;
                }
            }
        }
        processed += 1;
        let phase = if processed == total {
            BatchPhase::Complete
        } else {
            BatchPhase::Importing
        };
        sink.progress(&Progress {
            phase,
            current: processed,
            total,
            message: format!("processed row {} of {}", processed, total),
        });
    }

    if fatal.is_some() || counts.cancelled {
        counts.not_processed = rows[processed..]
            .iter()
            .filter(|r| r.plan.is_some())
            .count();
    }
    if let Some(error) = &fatal {
        sink.progress(&Progress {
            phase: BatchPhase::Failed,
            current: processed,
            total,
            message: error.to_string(),
        });
    } else if counts.cancelled {
        tracing::info!(processed, total, "batch cancelled");
        sink.progress(&Progress {
            phase: BatchPhase::Complete,
            current: processed,
            total,
            message: format!("cancelled after {} of {} row(s)", processed, total),
        });
    } else if total == 0 {
        sink.progress(&Progress {
            phase: BatchPhase::Complete,
            current: 0,
            total: 0,
            message: "no rows to import".into(),
        });
    }

    let outcome = finish(batch, counts, payload.columns, digest, started_at, fatal);
    match outcome.error {
        Some(_) => Err(outcome.into_aborted()),
        None => Ok(outcome.report),
    }
}

struct Finished {
    report: ImportReport,
    error: Option<EngineError>,
}

impl Finished {
    fn into_aborted(self) -> BatchAborted {
        BatchAborted {
            error: self
                .error
                .unwrap_or_else(|| EngineError::StoreUnavailable("batch aborted".into())),
            report: self.report,
        }
    }
}

fn finish(
    batch: Batch<'_>,
    counts: Counts,
    columns: Vec<String>,
    payload_sha256: String,
    started_at: String,
    error: Option<EngineError>,
) -> Finished {
    let request = batch.request;
    let mut issues = batch.issues;
    issues.sort_by_key(|i| i.line);
    let warnings = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Warning)
        .count();
    let cap = request.settings.max_reported_issues;
    let summary = ImportSummary {
        batch_id: request.batch_id.clone(),
        target: request.target,
        phase: if error.is_some() {
            BatchPhase::Failed
        } else {
            BatchPhase::Complete
        },
        total: counts.total,
        valid: counts.valid,
        imported: counts.imported,
        created: counts.created,
        updated: counts.updated,
        failed: counts.failed,
        warnings,
        not_processed: counts.not_processed,
        cancelled: counts.cancelled,
        fatal: error.as_ref().map(|e| FatalError {
            code: e.code().to_string(),
            message: e.to_string(),
        }),
        columns,
        issues: issues.iter().take(cap).cloned().collect(),
        issues_truncated: issues.len() > cap,
        scope_errors: batch.scope_errors.into_values().collect(),
        payload_sha256,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
    };

    let log = ImportLogEntry {
        batch_id: summary.batch_id.clone(),
        target: request.target.as_str().to_string(),
        payload_sha256: summary.payload_sha256.clone(),
        started_at: summary.started_at.clone(),
        finished_at: summary.finished_at.clone(),
        total: summary.total,
        imported: summary.imported,
        failed: summary.failed,
        cancelled: summary.cancelled,
        fatal: summary.fatal.as_ref().map(|f| f.code.clone()),
    };
    if let Err(e) = batch.engine.store().record_import_log(&log) {
        tracing::warn!(error = %e, "import log not written");
    }
    tracing::info!(
        imported = summary.imported,
        created = summary.created,
        updated = summary.updated,
        failed = summary.failed,
        warnings = summary.warnings,
        cancelled = summary.cancelled,
        "batch finished"
    );

    Finished {
        report: ImportReport { summary, issues },
        error,
    }
}
