//! Results engine: owns the record store handle and the two derived-value
//! caches (validated scales, rankings). Every write that can move a
//! position invalidates its ranking scope after the store commits.

use crate::error::{EngineError, EngineResult};
use crate::grading::{GradeBand, GradeResolver, GradingScale, GradingScope, OutOfRangePolicy, ScaleCache};
use crate::ranking::{rank_mock, MockCandidate, MockRanking, MockScheme, RankCache, RankScope, ScopeRanking};
use crate::scoring::{self, AssessmentConfig, ComponentScores, SubjectScore};
use crate::store::{
    Deleted, MockScoreRecord, RecordStore, ResultKey, ResultRecord, StudentFields, StudentRecord,
    SubjectRowWrite, SubjectScoreFields, SubjectScoreRecord, Upserted,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One subject score as entered by a teacher or read from an import row.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectEntry {
    pub student_no: String,
    /// Names to create or refresh the student with; `None` requires the
    /// student to exist already.
    pub student: Option<StudentFields>,
    pub scope: RankScope,
    pub department: String,
    pub assessment_type: String,
    pub subject: String,
    pub components: ComponentScores,
}

impl SubjectEntry {
    pub fn grading_scope(&self) -> GradingScope {
        GradingScope::new(&self.department, &self.scope.academic_year, &self.scope.term)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnteredScore {
    pub result_id: String,
    pub student_created: bool,
    pub result_created: bool,
    pub created: bool,
    pub record: SubjectScoreRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeFailure {
    pub student_no: String,
    pub subject: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeError {
    pub scope: String,
    pub code: String,
    pub message: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub scope: RankScope,
    pub checked: usize,
    pub changed: usize,
    pub failed: Vec<RecomputeFailure>,
    pub scope_errors: Vec<ScopeError>,
}

pub struct Engine {
    store: Arc<dyn RecordStore>,
    scales: ScaleCache,
    ranks: RankCache,
}

impl Engine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            scales: ScaleCache::new(),
            ranks: RankCache::new(),
        }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn resolver(&self, policy: OutOfRangePolicy) -> GradeResolver<'_> {
        GradeResolver::new(self.store.as_ref(), &self.scales, policy)
    }

    /// Stores a validated scale and re-grades every stored subject score
    /// of its grading scope before returning.
    pub fn save_scale(
        &self,
        scope: &GradingScope,
        bands: Vec<GradeBand>,
        policy: OutOfRangePolicy,
    ) -> EngineResult<(GradingScale, Vec<RecomputeSummary>)> {
        let scale = GradingScale::new(scope.clone(), bands)?;
        self.store.save_grading_bands(scope, &scale.bands)?;
        self.scales.invalidate(scope);
        tracing::info!(scope = %scope, bands = scale.bands.len(), "grading scale saved");
        let regraded = self.regrade_grading_scope(scope, None, policy)?;
        Ok((scale, regraded))
    }

    pub fn scale(&self, scope: &GradingScope) -> EngineResult<Arc<GradingScale>> {
        self.resolver(OutOfRangePolicy::Reject).scale(scope)
    }

    /// Stores a validated configuration and recomputes the subject scores
    /// entered under it.
    pub fn save_assessment_config(
        &self,
        config: &AssessmentConfig,
        policy: OutOfRangePolicy,
    ) -> EngineResult<Vec<RecomputeSummary>> {
        config.validate()?;
        self.store.save_assessment_config(config)?;
        tracing::info!(
            scope = %config.scope,
            assessment_type = %config.assessment_type,
            "assessment configuration saved"
        );
        self.regrade_grading_scope(&config.scope, Some(&config.assessment_type), policy)
    }

    fn regrade_grading_scope(
        &self,
        scope: &GradingScope,
        assessment_type: Option<&str>,
        policy: OutOfRangePolicy,
    ) -> EngineResult<Vec<RecomputeSummary>> {
        let key = scope.cache_key();
        let graded_here = |r: &ResultRecord| {
            GradingScope::new(&r.department, &r.academic_year, &r.term).cache_key() == key
                && assessment_type.map_or(true, |t| r.assessment_type.eq_ignore_ascii_case(t))
        };
        let mut summaries = Vec::new();
        for rank_scope in self.store.rank_scopes_graded_by(scope)? {
            let summary = self.recompute_matching(&rank_scope, policy, &graded_here)?;
            if summary.checked > 0 {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    pub fn assessment_config(
        &self,
        scope: &GradingScope,
        assessment_type: &str,
    ) -> EngineResult<AssessmentConfig> {
        scoring::load_assessment_config(self.store.as_ref(), scope, assessment_type)
    }

    /// Computes and grades without writing anything.
    pub fn compute_subject_score(
        &self,
        components: &ComponentScores,
        config: &AssessmentConfig,
        policy: OutOfRangePolicy,
    ) -> EngineResult<SubjectScore> {
        let resolver = self.resolver(policy);
        scoring::compute_subject_score(components, config, |total| {
            resolver.resolve_grade(total, &config.scope)
        })
    }

    pub fn enter_subject_score(
        &self,
        entry: &SubjectEntry,
        policy: OutOfRangePolicy,
    ) -> EngineResult<EnteredScore> {
        let config = self.assessment_config(&entry.grading_scope(), &entry.assessment_type)?;
        let score = self.compute_subject_score(&entry.components, &config, policy)?;
        self.commit_subject_score(entry, &score)
    }

    /// Writes an already computed score. The student (when names are
    /// given), the result and the subject row commit together. Invalidates
    /// the ranking scope.
    pub fn commit_subject_score(
        &self,
        entry: &SubjectEntry,
        score: &SubjectScore,
    ) -> EngineResult<EnteredScore> {
        let student_no = entry.student_no.trim();
        if student_no.is_empty() {
            return Err(EngineError::validation("studentNo", "student number is required"));
        }
        let key = ResultKey {
            student_no: student_no.to_string(),
            scope: entry.scope.clone(),
        };
        let fields = SubjectScoreFields {
            components: entry.components.clone(),
            total: score.total,
            max_total: score.max_total,
            grade: score.grade.clone(),
            remark: score.remark.clone(),
        };
        let written = self.store.write_subject_row(&SubjectRowWrite {
            key: &key,
            student: entry.student.as_ref(),
            department: &entry.department,
            assessment_type: &entry.assessment_type,
            subject: entry.subject.trim(),
            fields: &fields,
        })?;
        self.ranks.invalidate(&entry.scope);
        Ok(EnteredScore {
            result_id: written.result.record.id,
            student_created: written.student.created,
            result_created: written.result.created,
            created: written.score.created,
            record: written.score.record,
        })
    }

    pub fn upsert_student(
        &self,
        student_no: &str,
        fields: &StudentFields,
    ) -> EngineResult<Upserted<StudentRecord>> {
        let student_no = student_no.trim();
        if student_no.is_empty() {
            return Err(EngineError::validation("studentNo", "student number is required"));
        }
        self.store.upsert_student(student_no, fields)
    }

    fn ensure_student(
        &self,
        student_no: &str,
        fields: Option<&StudentFields>,
    ) -> EngineResult<Upserted<StudentRecord>> {
        match fields {
            Some(fields) => self.upsert_student(student_no, fields),
            None => self
                .store
                .find_student(student_no.trim())?
                .map(|record| Upserted {
                    record,
                    created: false,
                })
                .ok_or_else(|| {
                    EngineError::validation(
                        "studentNo",
                        format!("student {} does not exist and no names were given", student_no.trim()),
                    )
                }),
        }
    }

    /// Positions for a scope, recomputed if any write invalidated them.
    pub fn ranking(&self, scope: &RankScope) -> EngineResult<Arc<ScopeRanking>> {
        self.ranks.get_or_compute(scope, self.store.as_ref())
    }

    /// Re-grades every stored subject score of a scope from its stored
    /// components.
    pub fn recompute_scope(
        &self,
        scope: &RankScope,
        policy: OutOfRangePolicy,
    ) -> EngineResult<RecomputeSummary> {
        self.recompute_matching(scope, policy, |_| true)
    }

    fn recompute_matching(
        &self,
        scope: &RankScope,
        policy: OutOfRangePolicy,
        include: impl Fn(&ResultRecord) -> bool,
    ) -> EngineResult<RecomputeSummary> {
        let snapshot = self.store.scope_snapshot(scope)?;
        let by_result: HashMap<&str, &ResultRecord> = snapshot
            .results
            .iter()
            .filter(|r| include(*r))
            .map(|r| (r.id.as_str(), r))
            .collect();

        let mut configs: HashMap<(String, String, String, String), Result<AssessmentConfig, EngineError>> =
            HashMap::new();
        let mut scope_errors: BTreeMap<String, ScopeError> = BTreeMap::new();
        let mut failed = Vec::new();
        let mut checked = 0usize;
        let mut changed = 0usize;

        for stored in &snapshot.subject_scores {
            let Some(result) = by_result.get(stored.result_id.as_str()) else {
                continue;
            };
            checked += 1;
            let grading_scope =
                GradingScope::new(&result.department, &result.academic_year, &result.term);
            let (d, y, t) = grading_scope.cache_key();
            let config_key = (d, y, t, result.assessment_type.to_ascii_lowercase());
            let config = configs
                .entry(config_key)
                .or_insert_with(|| self.assessment_config(&grading_scope, &result.assessment_type));

            let outcome = match config {
                Ok(config) => self.compute_subject_score(&stored.components, config, policy),
                Err(e) => Err(e.clone()),
            };
            match outcome {
                Ok(score) => {
                    if score.total == stored.total
                        && score.max_total == stored.max_total
                        && score.grade == stored.grade
                        && score.remark == stored.remark
                    {
                        continue;
                    }
                    let fields = SubjectScoreFields {
                        components: stored.components.clone(),
                        total: score.total,
                        max_total: score.max_total,
                        grade: score.grade,
                        remark: score.remark,
                    };
                    self.store
                        .upsert_subject_score(&stored.result_id, &stored.subject, &fields)?;
                    changed += 1;
                }
                Err(e) if e.is_fatal() => {
                    self.ranks.invalidate(scope);
                    return Err(e);
                }
                Err(e) if e.is_configuration() => {
                    let name = grading_scope.to_string();
                    scope_errors
                        .entry(name.clone())
                        .or_insert_with(|| ScopeError {
                            scope: name,
                            code: e.code().to_string(),
                            message: e.to_string(),
                            rows: 0,
                        })
                        .rows += 1;
                }
                Err(e) => failed.push(RecomputeFailure {
                    student_no: stored.student_no.clone(),
                    subject: stored.subject.clone(),
                    code: e.code().to_string(),
                    message: e.to_string(),
                }),
            }
        }

        self.ranks.invalidate(scope);
        for err in scope_errors.values() {
            tracing::warn!(scope = %err.scope, code = %err.code, rows = err.rows, "scope skipped during recompute");
        }
        tracing::info!(scope = %scope, checked, changed, failed = failed.len(), "scope recomputed");
        Ok(RecomputeSummary {
            scope: scope.clone(),
            checked,
            changed,
            failed,
            scope_errors: scope_errors.into_values().collect(),
        })
    }

    pub fn set_approved(&self, result_ids: &[String], approved: bool) -> EngineResult<usize> {
        let n = self.store.set_approved(result_ids, approved)?;
        // Cached rankings carry the approval flag of each result.
        self.ranks.clear();
        Ok(n)
    }

    pub fn delete_results(&self, result_ids: &[String]) -> EngineResult<Deleted> {
        let deleted = self.store.delete_results(result_ids)?;
        for scope in &deleted.scopes {
            self.ranks.invalidate(scope);
        }
        tracing::info!(
            requested = result_ids.len(),
            deleted = deleted.results,
            scopes = deleted.scopes.len(),
            "results deleted"
        );
        Ok(deleted)
    }

    pub fn upsert_mock_score(
        &self,
        student_no: &str,
        student: Option<&StudentFields>,
        session: &str,
        subject: &str,
        percentage: f64,
    ) -> EngineResult<Upserted<MockScoreRecord>> {
        if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
            return Err(EngineError::ScoreOutOfRange {
                score: percentage,
                min: 0.0,
                max: 100.0,
            });
        }
        let session = session.trim();
        let subject = subject.trim();
        if session.is_empty() {
            return Err(EngineError::validation("session", "session is required"));
        }
        if subject.is_empty() {
            return Err(EngineError::validation("subject", "subject is required"));
        }
        let student = self.ensure_student(student_no, student)?;
        self.store
            .upsert_mock_score(&student.record.id, session, subject, percentage)
    }

    pub fn mock_ranking(&self, session: &str, scheme: &MockScheme) -> EngineResult<MockRanking> {
        let mut candidates: Vec<MockCandidate> = Vec::new();
        for row in self.store.mock_scores(session.trim())? {
            match candidates.last_mut() {
                Some((no, _, scores)) if no.eq_ignore_ascii_case(&row.student_no) => {
                    scores.push((row.subject, row.percentage));
                }
                _ => candidates.push((
                    row.student_no,
                    row.display_name,
                    vec![(row.subject, row.percentage)],
                )),
            }
        }
        Ok(rank_mock(scheme, candidates))
    }
}
