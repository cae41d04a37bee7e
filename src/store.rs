//! Record store seam.
//!
//! The engine only talks to [`RecordStore`]: scoped reads, upserts keyed by
//! natural identity, and bulk deletes. [`SqliteStore`] is the workspace
//! implementation; every write runs in its own immediate transaction behind a
//! connection mutex, so concurrent upserts to the same identity serialize.

use crate::error::{EngineError, EngineResult};
use crate::grading::{GradeBand, GradingScope};
use crate::ranking::RankScope;
use crate::scoring::{AssessmentConfig, ComponentDef, ComponentScores};
use chrono::Utc;
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub student_no: String,
    pub last_name: String,
    pub first_name: String,
    pub class_name: Option<String>,
}

fn display_name(last: &str, first: &str) -> String {
    match (last.is_empty(), first.is_empty()) {
        (false, false) => format!("{}, {}", last, first),
        (false, true) => last.to_string(),
        (true, false) => first.to_string(),
        (true, true) => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentFields {
    pub last_name: String,
    pub first_name: String,
    pub class_name: Option<String>,
}

/// Natural identity of a result: one per student per ranking scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultKey {
    pub student_no: String,
    pub scope: RankScope,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    pub student_no: String,
    pub display_name: String,
    pub class_name: String,
    pub term: String,
    pub academic_year: String,
    pub department: String,
    pub assessment_type: String,
    pub subject_count: i64,
    pub total_marks: f64,
    pub total_score: f64,
    pub approved: bool,
}

impl ResultRecord {
    pub fn average(&self) -> f64 {
        if self.subject_count > 0 {
            self.total_score / self.subject_count as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectScoreFields {
    pub components: ComponentScores,
    pub total: f64,
    pub max_total: f64,
    pub grade: String,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScoreRecord {
    pub id: String,
    pub result_id: String,
    pub student_no: String,
    pub subject: String,
    pub components: ComponentScores,
    pub total: f64,
    pub max_total: f64,
    pub grade: String,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockScoreRecord {
    pub student_no: String,
    pub display_name: String,
    pub session: String,
    pub subject: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportLogEntry {
    pub batch_id: String,
    pub target: String,
    pub payload_sha256: String,
    pub started_at: String,
    pub finished_at: String,
    pub total: usize,
    pub imported: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub fatal: Option<String>,
}

/// Result of an upsert: the stored record and whether it was newly created.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<T> {
    pub record: T,
    pub created: bool,
}

/// What one entered subject score writes: the student, the owning result
/// and the subject row.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRowWrite<'a> {
    pub key: &'a ResultKey,
    /// Names to create or refresh the student with; `None` requires the
    /// student to exist already.
    pub student: Option<&'a StudentFields>,
    pub department: &'a str,
    pub assessment_type: &'a str,
    pub subject: &'a str,
    pub fields: &'a SubjectScoreFields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRowWritten {
    pub student: Upserted<StudentRecord>,
    pub result: Upserted<ResultRecord>,
    pub score: Upserted<SubjectScoreRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deleted {
    pub results: usize,
    pub scopes: Vec<RankScope>,
}

/// Results and subject scores of one ranking scope, read together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeSnapshot {
    pub results: Vec<ResultRecord>,
    pub subject_scores: Vec<SubjectScoreRecord>,
}

pub trait RecordStore: Send + Sync {
    fn grading_bands(&self, scope: &GradingScope) -> EngineResult<Option<Vec<GradeBand>>>;
    /// Replaces the whole band list of a scope.
    fn save_grading_bands(&self, scope: &GradingScope, bands: &[GradeBand]) -> EngineResult<()>;
    fn grading_scopes(&self) -> EngineResult<Vec<GradingScope>>;

    fn assessment_config(
        &self,
        scope: &GradingScope,
        assessment_type: &str,
    ) -> EngineResult<Option<AssessmentConfig>>;
    fn save_assessment_config(&self, config: &AssessmentConfig) -> EngineResult<()>;

    fn find_student(&self, student_no: &str) -> EngineResult<Option<StudentRecord>>;
    fn upsert_student(
        &self,
        student_no: &str,
        fields: &StudentFields,
    ) -> EngineResult<Upserted<StudentRecord>>;

    /// Writes the student, the result and the subject score in one
    /// transaction; nothing is kept if any step fails.
    fn write_subject_row(&self, row: &SubjectRowWrite<'_>) -> EngineResult<SubjectRowWritten>;
    /// Rewrites the computed fields of a stored subject score and refreshes
    /// the owning result's totals in the same transaction.
    fn upsert_subject_score(
        &self,
        result_id: &str,
        subject: &str,
        fields: &SubjectScoreFields,
    ) -> EngineResult<Upserted<SubjectScoreRecord>>;
    fn scope_snapshot(&self, scope: &RankScope) -> EngineResult<ScopeSnapshot>;
    /// Ranking scopes holding results graded under a grading scope.
    fn rank_scopes_graded_by(&self, scope: &GradingScope) -> EngineResult<Vec<RankScope>>;
    fn set_approved(&self, result_ids: &[String], approved: bool) -> EngineResult<usize>;
    /// Deletes results with their subject scores; returns the number of
    /// results removed and the scopes touched.
    fn delete_results(&self, result_ids: &[String]) -> EngineResult<Deleted>;

    fn upsert_mock_score(
        &self,
        student_id: &str,
        session: &str,
        subject: &str,
        percentage: f64,
    ) -> EngineResult<Upserted<MockScoreRecord>>;
    fn mock_scores(&self, session: &str) -> EngineResult<Vec<MockScoreRecord>>;

    fn record_import_log(&self, entry: &ImportLogEntry) -> EngineResult<()>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn decode_components(raw: &str) -> rusqlite::Result<ComponentScores> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

const RESULT_COLUMNS: &str = "r.id, s.student_no, s.last_name, s.first_name, r.class_name, r.term,
     r.academic_year, r.department, r.assessment_type, r.subject_count, r.total_marks,
     r.total_score, r.approved";

fn map_result(r: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRecord> {
    let last: String = r.get(2)?;
    let first: String = r.get(3)?;
    Ok(ResultRecord {
        id: r.get(0)?,
        student_no: r.get(1)?,
        display_name: display_name(&last, &first),
        class_name: r.get(4)?,
        term: r.get(5)?,
        academic_year: r.get(6)?,
        department: r.get(7)?,
        assessment_type: r.get(8)?,
        subject_count: r.get(9)?,
        total_marks: r.get(10)?,
        total_score: r.get(11)?,
        approved: r.get::<_, i64>(12)? != 0,
    })
}

const SUBJECT_COLUMNS: &str = "ss.id, ss.result_id, s.student_no, ss.subject, ss.components_json,
     ss.total, ss.max_total, ss.grade, ss.remark";

fn map_subject(r: &rusqlite::Row<'_>) -> rusqlite::Result<SubjectScoreRecord> {
    let components_json: String = r.get(4)?;
    Ok(SubjectScoreRecord {
        id: r.get(0)?,
        result_id: r.get(1)?,
        student_no: r.get(2)?,
        subject: r.get(3)?,
        components: decode_components(&components_json)?,
        total: r.get(5)?,
        max_total: r.get(6)?,
        grade: r.get(7)?,
        remark: r.get(8)?,
    })
}

fn map_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRecord> {
    Ok(StudentRecord {
        id: r.get(0)?,
        student_no: r.get(1)?,
        last_name: r.get(2)?,
        first_name: r.get(3)?,
        class_name: r.get(4)?,
    })
}

fn query_student(conn: &Connection, student_no: &str) -> rusqlite::Result<Option<StudentRecord>> {
    conn.query_row(
        "SELECT id, student_no, last_name, first_name, class_name
         FROM students WHERE student_no = ?",
        [student_no],
        map_student,
    )
    .optional()
}

fn query_result_by_id(conn: &Connection, id: &str) -> rusqlite::Result<ResultRecord> {
    let sql = format!(
        "SELECT {RESULT_COLUMNS}
         FROM results r JOIN students s ON s.id = r.student_id
         WHERE r.id = ?"
    );
    conn.query_row(&sql, [id], map_result)
}

fn refresh_result_totals(conn: &Connection, result_id: &str, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE results SET
           subject_count = (SELECT COUNT(*) FROM subject_scores WHERE result_id = ?1),
           total_marks = (SELECT COALESCE(SUM(max_total), 0) FROM subject_scores WHERE result_id = ?1),
           total_score = (SELECT COALESCE(SUM(total), 0) FROM subject_scores WHERE result_id = ?1),
           updated_at = ?2
         WHERE id = ?1",
        (result_id, now),
    )?;
    Ok(())
}

fn encode_components(fields: &SubjectScoreFields) -> EngineResult<String> {
    serde_json::to_string(&fields.components)
        .map_err(|e| EngineError::validation("components", e.to_string()))
}

fn upsert_student_in(
    conn: &Connection,
    student_no: &str,
    fields: &StudentFields,
    now: &str,
) -> EngineResult<Upserted<StudentRecord>> {
    let created = query_student(conn, student_no)?.is_none();
    conn.execute(
        "INSERT INTO students(id, student_no, last_name, first_name, class_name, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_no) DO UPDATE SET
           last_name = excluded.last_name,
           first_name = excluded.first_name,
           class_name = COALESCE(excluded.class_name, students.class_name),
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_no,
            &fields.last_name,
            &fields.first_name,
            &fields.class_name,
            now,
        ),
    )?;
    let record = query_student(conn, student_no)?
        .ok_or_else(|| EngineError::NotFound(format!("student {student_no}")))?;
    Ok(Upserted { record, created })
}

fn upsert_result_in(
    conn: &Connection,
    student: &StudentRecord,
    scope: &RankScope,
    department: &str,
    assessment_type: &str,
    now: &str,
) -> EngineResult<Upserted<ResultRecord>> {
    let find = || {
        conn.query_row(
            "SELECT id FROM results
             WHERE student_id = ? AND class_name = ? AND term = ? AND academic_year = ?",
            (&student.id, &scope.class_name, &scope.term, &scope.academic_year),
            |r| r.get::<_, String>(0),
        )
        .optional()
    };
    let existing = find()?;
    let created = existing.is_none();
    conn.execute(
        "INSERT INTO results(id, student_id, class_name, term, academic_year, department,
           assessment_type, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, class_name, term, academic_year) DO UPDATE SET
           department = excluded.department,
           assessment_type = excluded.assessment_type,
           updated_at = excluded.updated_at",
        (
            existing.unwrap_or_else(|| Uuid::new_v4().to_string()),
            &student.id,
            &scope.class_name,
            &scope.term,
            &scope.academic_year,
            department,
            assessment_type,
            now,
        ),
    )?;
    let id = find()?.ok_or_else(|| EngineError::NotFound(format!("result of {}", student.student_no)))?;
    let record = query_result_by_id(conn, &id)?;
    Ok(Upserted { record, created })
}

fn upsert_subject_in(
    conn: &Connection,
    result_id: &str,
    subject: &str,
    components_json: &str,
    fields: &SubjectScoreFields,
    now: &str,
) -> EngineResult<Upserted<SubjectScoreRecord>> {
    let created = conn
        .query_row(
            "SELECT id FROM subject_scores WHERE result_id = ? AND subject = ?",
            (result_id, subject),
            |r| r.get::<_, String>(0),
        )
        .optional()?
        .is_none();
    conn.execute(
        "INSERT INTO subject_scores(id, result_id, subject, components_json, total,
           max_total, grade, remark, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(result_id, subject) DO UPDATE SET
           components_json = excluded.components_json,
           total = excluded.total,
           max_total = excluded.max_total,
           grade = excluded.grade,
           remark = excluded.remark,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            result_id,
            subject,
            components_json,
            fields.total,
            fields.max_total,
            &fields.grade,
            &fields.remark,
            now,
        ),
    )?;
    refresh_result_totals(conn, result_id, now)?;
    let sql = format!(
        "SELECT {SUBJECT_COLUMNS}
         FROM subject_scores ss
         JOIN results r ON r.id = ss.result_id
         JOIN students s ON s.id = r.student_id
         WHERE ss.result_id = ? AND ss.subject = ?"
    );
    let record = conn.query_row(&sql, (result_id, subject), map_subject)?;
    Ok(Upserted { record, created })
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(crate::db::open_in_memory().expect("in-memory database"))
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::StoreUnavailable("connection lock poisoned".into()))
    }

    /// Runs `f` inside an immediate transaction; rolls back on error.
    fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn settings_get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let conn = self.lock()?;
        crate::db::settings_get_json(&conn, key)
    }

    pub fn settings_set(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let conn = self.lock()?;
        crate::db::settings_set_json(&conn, key, value)
    }
}

impl RecordStore for SqliteStore {
    fn grading_bands(&self, scope: &GradingScope) -> EngineResult<Option<Vec<GradeBand>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT from_percentage, to_percentage, grade, remark
             FROM grading_bands
             WHERE department = ? AND academic_year = ? AND term = ?
             ORDER BY sort_order",
        )?;
        let bands = stmt
            .query_map(
                (&scope.department, &scope.academic_year, &scope.term),
                |r| {
                    Ok(GradeBand {
                        from_percentage: r.get(0)?,
                        to_percentage: r.get(1)?,
                        grade: r.get(2)?,
                        remark: r.get(3)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(if bands.is_empty() { None } else { Some(bands) })
    }

    fn save_grading_bands(&self, scope: &GradingScope, bands: &[GradeBand]) -> EngineResult<()> {
        self.write(|tx| {
            tx.execute(
                "DELETE FROM grading_bands WHERE department = ? AND academic_year = ? AND term = ?",
                (&scope.department, &scope.academic_year, &scope.term),
            )?;
            for (i, b) in bands.iter().enumerate() {
                tx.execute(
                    "INSERT INTO grading_bands(id, department, academic_year, term, sort_order,
                       from_percentage, to_percentage, grade, remark)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &scope.department,
                        &scope.academic_year,
                        &scope.term,
                        i as i64,
                        b.from_percentage,
                        b.to_percentage,
                        &b.grade,
                        &b.remark,
                    ),
                )?;
            }
            Ok(())
        })
    }

    fn grading_scopes(&self) -> EngineResult<Vec<GradingScope>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT department, academic_year, term
             FROM grading_bands
             ORDER BY department, academic_year, term",
        )?;
        let scopes = stmt
            .query_map([], |r| {
                Ok(GradingScope {
                    department: r.get(0)?,
                    academic_year: r.get(1)?,
                    term: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scopes)
    }

    fn assessment_config(
        &self,
        scope: &GradingScope,
        assessment_type: &str,
    ) -> EngineResult<Option<AssessmentConfig>> {
        let conn = self.lock()?;
        let row: Option<(String, String, f64, Option<f64>)> = conn
            .query_row(
                "SELECT assessment_type, components_json, total, normalize_to
                 FROM assessment_configs
                 WHERE department = ? AND academic_year = ? AND term = ? AND assessment_type = ?",
                (
                    &scope.department,
                    &scope.academic_year,
                    &scope.term,
                    assessment_type,
                ),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let Some((stored_type, components_json, total, normalize_to)) = row else {
            return Ok(None);
        };
        let components: Vec<ComponentDef> =
            serde_json::from_str(&components_json).map_err(|e| {
                EngineError::InvalidAssessmentConfig {
                    reason: format!("stored components are unreadable: {e}"),
                }
            })?;
        Ok(Some(AssessmentConfig {
            scope: scope.clone(),
            assessment_type: stored_type,
            components,
            total,
            normalize_to,
        }))
    }

    fn save_assessment_config(&self, config: &AssessmentConfig) -> EngineResult<()> {
        let components_json = serde_json::to_string(&config.components)
            .map_err(|e| EngineError::InvalidAssessmentConfig {
                reason: e.to_string(),
            })?;
        let now = now_rfc3339();
        self.write(|tx| {
            tx.execute(
                "INSERT INTO assessment_configs(id, department, academic_year, term, assessment_type,
                   components_json, total, normalize_to, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(department, academic_year, term, assessment_type) DO UPDATE SET
                   components_json = excluded.components_json,
                   total = excluded.total,
                   normalize_to = excluded.normalize_to,
                   updated_at = excluded.updated_at",
                (
                    Uuid::new_v4().to_string(),
                    &config.scope.department,
                    &config.scope.academic_year,
                    &config.scope.term,
                    &config.assessment_type,
                    &components_json,
                    config.total,
                    config.normalize_to,
                    &now,
                ),
            )?;
            Ok(())
        })
    }

    fn find_student(&self, student_no: &str) -> EngineResult<Option<StudentRecord>> {
        let conn = self.lock()?;
        Ok(query_student(&conn, student_no)?)
    }

    fn upsert_student(
        &self,
        student_no: &str,
        fields: &StudentFields,
    ) -> EngineResult<Upserted<StudentRecord>> {
        let now = now_rfc3339();
        self.write(|tx| upsert_student_in(tx, student_no, fields, &now))
    }

    fn write_subject_row(&self, row: &SubjectRowWrite<'_>) -> EngineResult<SubjectRowWritten> {
        let components_json = encode_components(row.fields)?;
        let now = now_rfc3339();
        self.write(|tx| {
            let student_no = row.key.student_no.as_str();
            let student = match row.student {
                Some(fields) => upsert_student_in(tx, student_no, fields, &now)?,
                None => Upserted {
                    record: query_student(tx, student_no)?.ok_or_else(|| {
                        EngineError::validation(
                            "studentNo",
                            format!("student {student_no} does not exist and no names were given"),
                        )
                    })?,
                    created: false,
                },
            };
            let result = upsert_result_in(
                tx,
                &student.record,
                &row.key.scope,
                row.department,
                row.assessment_type,
                &now,
            )?;
            let score = upsert_subject_in(
                tx,
                &result.record.id,
                row.subject,
                &components_json,
                row.fields,
                &now,
            )?;
            // Totals changed with the subject row.
            let result = Upserted {
                record: query_result_by_id(tx, &result.record.id)?,
                created: result.created,
            };
            Ok(SubjectRowWritten {
                student,
                result,
                score,
            })
        })
    }

    fn upsert_subject_score(
        &self,
        result_id: &str,
        subject: &str,
        fields: &SubjectScoreFields,
    ) -> EngineResult<Upserted<SubjectScoreRecord>> {
        let components_json = encode_components(fields)?;
        let now = now_rfc3339();
        self.write(|tx| upsert_subject_in(tx, result_id, subject, &components_json, fields, &now))
    }

    fn scope_snapshot(&self, scope: &RankScope) -> EngineResult<ScopeSnapshot> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let results = {
            let sql = format!(
                "SELECT {RESULT_COLUMNS}
                 FROM results r JOIN students s ON s.id = r.student_id
                 WHERE r.class_name = ? AND r.term = ? AND r.academic_year = ?
                 ORDER BY s.student_no"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    (&scope.class_name, &scope.term, &scope.academic_year),
                    map_result,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let subject_scores = {
            let sql = format!(
                "SELECT {SUBJECT_COLUMNS}
                 FROM subject_scores ss
                 JOIN results r ON r.id = ss.result_id
                 JOIN students s ON s.id = r.student_id
                 WHERE r.class_name = ? AND r.term = ? AND r.academic_year = ?
                 ORDER BY ss.subject, s.student_no"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    (&scope.class_name, &scope.term, &scope.academic_year),
                    map_subject,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.commit()?;
        Ok(ScopeSnapshot {
            results,
            subject_scores,
        })
    }

    fn rank_scopes_graded_by(&self, scope: &GradingScope) -> EngineResult<Vec<RankScope>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT class_name, term, academic_year
             FROM results
             WHERE department = ? COLLATE NOCASE AND academic_year = ? AND term = ?
             GROUP BY class_name, term, academic_year
             ORDER BY class_name",
        )?;
        let scopes = stmt
            .query_map(
                (&scope.department, &scope.academic_year, &scope.term),
                |r| {
                    Ok(RankScope {
                        class_name: r.get(0)?,
                        term: r.get(1)?,
                        academic_year: r.get(2)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scopes)
    }

    fn set_approved(&self, result_ids: &[String], approved: bool) -> EngineResult<usize> {
        if result_ids.is_empty() {
            return Ok(0);
        }
        let now = now_rfc3339();
        self.write(|tx| {
            let sql = format!(
                "UPDATE results SET approved = ?, updated_at = ? WHERE id IN ({})",
                placeholders(result_ids.len())
            );
            let mut bind: Vec<rusqlite::types::Value> = vec![
                rusqlite::types::Value::Integer(if approved { 1 } else { 0 }),
                rusqlite::types::Value::Text(now.clone()),
            ];
            bind.extend(
                result_ids
                    .iter()
                    .map(|id| rusqlite::types::Value::Text(id.clone())),
            );
            Ok(tx.execute(&sql, params_from_iter(bind))?)
        })
    }

    fn delete_results(&self, result_ids: &[String]) -> EngineResult<Deleted> {
        if result_ids.is_empty() {
            return Ok(Deleted::default());
        }
        self.write(|tx| {
            let ids = placeholders(result_ids.len());
            let bind = || {
                params_from_iter(
                    result_ids
                        .iter()
                        .map(|id| rusqlite::types::Value::Text(id.clone())),
                )
            };
            let scopes: Vec<RankScope> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT class_name, term, academic_year FROM results WHERE id IN ({ids})
                     GROUP BY class_name, term, academic_year"
                ))?;
                let rows = stmt
                    .query_map(bind(), |r| {
                        Ok(RankScope {
                            class_name: r.get(0)?,
                            term: r.get(1)?,
                            academic_year: r.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute(
                &format!("DELETE FROM subject_scores WHERE result_id IN ({ids})"),
                bind(),
            )?;
            let results = tx.execute(&format!("DELETE FROM results WHERE id IN ({ids})"), bind())?;
            Ok(Deleted { results, scopes })
        })
    }

    fn upsert_mock_score(
        &self,
        student_id: &str,
        session: &str,
        subject: &str,
        percentage: f64,
    ) -> EngineResult<Upserted<MockScoreRecord>> {
        let now = now_rfc3339();
        self.write(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM mock_scores WHERE student_id = ? AND session = ? AND subject = ?",
                    (student_id, session, subject),
                    |r| r.get(0),
                )
                .optional()?;
            let created = existing.is_none();
            tx.execute(
                "INSERT INTO mock_scores(id, student_id, session, subject, percentage, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, session, subject) DO UPDATE SET
                   percentage = excluded.percentage,
                   updated_at = excluded.updated_at",
                (
                    Uuid::new_v4().to_string(),
                    student_id,
                    session,
                    subject,
                    percentage,
                    &now,
                ),
            )?;
            let record = tx.query_row(
                "SELECT s.student_no, s.last_name, s.first_name, m.session, m.subject, m.percentage
                 FROM mock_scores m JOIN students s ON s.id = m.student_id
                 WHERE m.student_id = ? AND m.session = ? AND m.subject = ?",
                (student_id, session, subject),
                |r| {
                    let last: String = r.get(1)?;
                    let first: String = r.get(2)?;
                    Ok(MockScoreRecord {
                        student_no: r.get(0)?,
                        display_name: display_name(&last, &first),
                        session: r.get(3)?,
                        subject: r.get(4)?,
                        percentage: r.get(5)?,
                    })
                },
            )?;
            Ok(Upserted { record, created })
        })
    }

    fn mock_scores(&self, session: &str) -> EngineResult<Vec<MockScoreRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.student_no, s.last_name, s.first_name, m.session, m.subject, m.percentage
             FROM mock_scores m JOIN students s ON s.id = m.student_id
             WHERE m.session = ?
             ORDER BY s.student_no, m.subject",
        )?;
        let rows = stmt
            .query_map([session], |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(MockScoreRecord {
                    student_no: r.get(0)?,
                    display_name: display_name(&last, &first),
                    session: r.get(3)?,
                    subject: r.get(4)?,
                    percentage: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn record_import_log(&self, entry: &ImportLogEntry) -> EngineResult<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO import_log(batch_id, target, payload_sha256, started_at,
                   finished_at, total, imported, failed, cancelled, fatal)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &entry.batch_id,
                    &entry.target,
                    &entry.payload_sha256,
                    &entry.started_at,
                    &entry.finished_at,
                    entry.total as i64,
                    entry.imported as i64,
                    entry.failed as i64,
                    entry.cancelled as i64,
                    &entry.fatal,
                ),
            )?;
            Ok(())
        })
    }
}
