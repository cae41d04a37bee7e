use crate::error::{EngineError, EngineResult};
use crate::store::{RecordStore, ResultRecord, SubjectScoreRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

const TIE_EPSILON: f64 = 1e-9;

/// Comparability bound for positions: (class, term, academic year).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankScope {
    pub class_name: String,
    pub term: String,
    pub academic_year: String,
}

impl RankScope {
    pub fn new(class_name: &str, term: &str, academic_year: &str) -> Self {
        Self {
            class_name: class_name.trim().to_string(),
            term: term.trim().to_string(),
            academic_year: academic_year.trim().to_string(),
        }
    }

    pub fn cache_key(&self) -> (String, String, String) {
        (
            self.class_name.to_ascii_lowercase(),
            self.term.to_ascii_lowercase(),
            self.academic_year.to_ascii_lowercase(),
        )
    }
}

impl fmt::Display for RankScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.class_name, self.term, self.academic_year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOrder {
    HigherIsBetter,
    LowerIsBetter,
}

/// Standard competition ranking ("1224"). Returns the 1-based position of
/// each input value, in input order. Equal values share a position and the
/// next distinct value skips the shared slots.
pub fn competition_rank(values: &[f64], order: RankOrder) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        let ord = values[a].total_cmp(&values[b]);
        match order {
            RankOrder::HigherIsBetter => ord.reverse(),
            RankOrder::LowerIsBetter => ord,
        }
        .then(a.cmp(&b))
    });

    let mut positions = vec![0usize; values.len()];
    for (slot, &i) in idx.iter().enumerate() {
        positions[i] = match slot.checked_sub(1).map(|p| idx[p]) {
            Some(prev) if (values[prev] - values[i]).abs() < TIE_EPSILON => positions[prev],
            _ => slot + 1,
        };
    }
    positions
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    pub position: usize,
    pub average: f64,
    #[serde(flatten)]
    pub result: ResultRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedSubject {
    pub position: usize,
    #[serde(flatten)]
    pub score: SubjectScoreRecord,
}

/// Positions for one scope, overall and per subject. Rows are ordered by
/// position, then student number.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRanking {
    pub scope: RankScope,
    pub results: Vec<RankedResult>,
    pub subjects: BTreeMap<String, Vec<RankedSubject>>,
}

impl ScopeRanking {
    pub fn compute(
        scope: RankScope,
        results: Vec<ResultRecord>,
        subject_scores: Vec<SubjectScoreRecord>,
    ) -> Self {
        let totals: Vec<f64> = results.iter().map(|r| r.total_score).collect();
        let positions = competition_rank(&totals, RankOrder::HigherIsBetter);
        let mut ranked: Vec<RankedResult> = results
            .into_iter()
            .zip(positions)
            .map(|(result, position)| RankedResult {
                position,
                average: crate::scoring::round_off_1_decimal(result.average()),
                result,
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.result.student_no.cmp(&b.result.student_no))
        });

        let mut by_subject: BTreeMap<String, Vec<SubjectScoreRecord>> = BTreeMap::new();
        for s in subject_scores {
            by_subject
                .entry(s.subject.to_ascii_lowercase())
                .or_default()
                .push(s);
        }
        let subjects = by_subject
            .into_iter()
            .map(|(subject, rows)| {
                let totals: Vec<f64> = rows.iter().map(|s| s.total).collect();
                let positions = competition_rank(&totals, RankOrder::HigherIsBetter);
                let mut ranked: Vec<RankedSubject> = rows
                    .into_iter()
                    .zip(positions)
                    .map(|(score, position)| RankedSubject { position, score })
                    .collect();
                ranked.sort_by(|a, b| {
                    a.position
                        .cmp(&b.position)
                        .then_with(|| a.score.student_no.cmp(&b.score.student_no))
                });
                (subject, ranked)
            })
            .collect();

        Self {
            scope,
            results: ranked,
            subjects,
        }
    }

    #[cfg(test)]
    pub fn position_of(&self, student_no: &str) -> Option<usize> {
        self.results
            .iter()
            .find(|r| r.result.student_no.eq_ignore_ascii_case(student_no))
            .map(|r| r.position)
    }
}

/// Materialized positions keyed by scope. Writers invalidate the scope after
/// committing; readers compute under the lock, so an invalidation can never
/// be overtaken by a computation that started before it.
#[derive(Debug, Default)]
pub struct RankCache {
    entries: Mutex<HashMap<(String, String, String), Arc<ScopeRanking>>>,
}

impl RankCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String, String), Arc<ScopeRanking>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_or_compute(
        &self,
        scope: &RankScope,
        store: &dyn RecordStore,
    ) -> EngineResult<Arc<ScopeRanking>> {
        let mut entries = self.lock();
        if let Some(hit) = entries.get(&scope.cache_key()) {
            return Ok(hit.clone());
        }
        let snapshot = store.scope_snapshot(scope)?;
        let ranking = Arc::new(ScopeRanking::compute(
            scope.clone(),
            snapshot.results,
            snapshot.subject_scores,
        ));
        tracing::debug!(scope = %scope, results = ranking.results.len(), "ranking recomputed");
        entries.insert(scope.cache_key(), ranking.clone());
        Ok(ranking)
    }

    pub fn invalidate(&self, scope: &RankScope) {
        self.lock().remove(&scope.cache_key());
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[cfg(test)]
    pub fn is_cached(&self, scope: &RankScope) -> bool {
        self.lock().contains_key(&scope.cache_key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradePointBand {
    pub min_percentage: f64,
    pub points: u32,
}

/// Fixed percentage to grade-point table; 1 is best.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradePointTable(Vec<GradePointBand>);

impl Default for GradePointTable {
    fn default() -> Self {
        let bands = [
            (80.0, 1),
            (70.0, 2),
            (65.0, 3),
            (60.0, 4),
            (55.0, 5),
            (50.0, 6),
            (45.0, 7),
            (40.0, 8),
            (0.0, 9),
        ];
        Self(
            bands
                .into_iter()
                .map(|(min_percentage, points)| GradePointBand {
                    min_percentage,
                    points,
                })
                .collect(),
        )
    }
}

impl GradePointTable {
    /// Sorts bands by descending floor and checks that points never improve
    /// as the floor drops, and that 0 is covered.
    pub fn new(mut bands: Vec<GradePointBand>) -> EngineResult<Self> {
        let invalid = |reason: &str| EngineError::InvalidAssessmentConfig {
            reason: format!("grade point table: {reason}"),
        };
        if bands.is_empty() {
            return Err(invalid("no bands"));
        }
        bands.sort_by(|a, b| b.min_percentage.total_cmp(&a.min_percentage));
        for pair in bands.windows(2) {
            if pair[0].min_percentage == pair[1].min_percentage {
                return Err(invalid("duplicate floor"));
            }
            if pair[0].points > pair[1].points {
                return Err(invalid("points must not improve as the floor drops"));
            }
        }
        if bands.last().map(|b| b.min_percentage > 0.0).unwrap_or(true) {
            return Err(invalid("lowest floor must be 0"));
        }
        Ok(Self(bands))
    }

    pub fn points_for(&self, percentage: f64) -> u32 {
        self.0
            .iter()
            .find(|b| percentage >= b.min_percentage)
            .or(self.0.last())
            .map(|b| b.points)
            .unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockScheme {
    pub core_subjects: Vec<String>,
    pub optional_count: usize,
    #[serde(default)]
    pub grade_points: GradePointTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedSubject {
    pub subject: String,
    pub percentage: f64,
    pub points: u32,
    pub core: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockAggregate {
    pub selected: Vec<SelectedSubject>,
    pub aggregate: u32,
}

/// Core subjects plus the best `optional_count` remaining subjects, summed
/// as grade points. Lower is better.
pub fn compute_mock_aggregate(
    scheme: &MockScheme,
    scores: &[(String, f64)],
) -> EngineResult<MockAggregate> {
    let table = &scheme.grade_points;
    let is_core = |subject: &str| {
        scheme
            .core_subjects
            .iter()
            .any(|c| c.trim().eq_ignore_ascii_case(subject.trim()))
    };

    let mut missing = Vec::new();
    let mut selected = Vec::new();
    for core in &scheme.core_subjects {
        match scores
            .iter()
            .find(|(s, _)| s.trim().eq_ignore_ascii_case(core.trim()))
        {
            Some((subject, pct)) => selected.push(SelectedSubject {
                subject: subject.clone(),
                percentage: *pct,
                points: table.points_for(*pct),
                core: true,
            }),
            None => missing.push(core.clone()),
        }
    }

    let mut optional: Vec<SelectedSubject> = scores
        .iter()
        .filter(|(s, _)| !is_core(s))
        .map(|(subject, pct)| SelectedSubject {
            subject: subject.clone(),
            percentage: *pct,
            points: table.points_for(*pct),
            core: false,
        })
        .collect();
    optional.sort_by(|a, b| {
        a.points
            .cmp(&b.points)
            .then_with(|| b.percentage.total_cmp(&a.percentage))
            .then_with(|| a.subject.cmp(&b.subject))
    });
    if optional.len() < scheme.optional_count {
        missing.push(format!(
            "{} more optional subject(s)",
            scheme.optional_count - optional.len()
        ));
    }
    if !missing.is_empty() {
        return Err(EngineError::IncompleteSubjectSet { missing });
    }

    selected.extend(optional.into_iter().take(scheme.optional_count));
    let aggregate = selected.iter().map(|s| s.points).sum();
    Ok(MockAggregate {
        selected,
        aggregate,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedMock {
    pub position: usize,
    pub student_no: String,
    pub display_name: String,
    #[serde(flatten)]
    pub aggregate: MockAggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedMock {
    pub student_no: String,
    pub display_name: String,
    pub code: String,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRanking {
    pub ranked: Vec<RankedMock>,
    pub excluded: Vec<ExcludedMock>,
}

/// One candidate: student number, display name, per-subject percentages.
pub type MockCandidate = (String, String, Vec<(String, f64)>);

pub fn rank_mock(scheme: &MockScheme, candidates: Vec<MockCandidate>) -> MockRanking {
    let mut eligible = Vec::new();
    let mut excluded = Vec::new();
    for (student_no, display_name, scores) in candidates {
        match compute_mock_aggregate(scheme, &scores) {
            Ok(aggregate) => eligible.push((student_no, display_name, aggregate)),
            Err(e) => {
                let missing = match &e {
                    EngineError::IncompleteSubjectSet { missing } => missing.clone(),
                    _ => Vec::new(),
                };
                excluded.push(ExcludedMock {
                    student_no,
                    display_name,
                    code: e.code().to_string(),
                    missing,
                });
            }
        }
    }

    let aggregates: Vec<f64> = eligible.iter().map(|(_, _, a)| a.aggregate as f64).collect();
    let positions = competition_rank(&aggregates, RankOrder::LowerIsBetter);
    let mut ranked: Vec<RankedMock> = eligible
        .into_iter()
        .zip(positions)
        .map(|((student_no, display_name, aggregate), position)| RankedMock {
            position,
            student_no,
            display_name,
            aggregate,
        })
        .collect();
    ranked.sort_by(|a, b| match a.position.cmp(&b.position) {
        Ordering::Equal => a.student_no.cmp(&b.student_no),
        other => other,
    });
    MockRanking { ranked, excluded }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(student_no: &str, total: f64) -> ResultRecord {
        ResultRecord {
            id: format!("r-{student_no}"),
            student_no: student_no.into(),
            display_name: student_no.into(),
            class_name: "JSS1A".into(),
            term: "first".into(),
            academic_year: "2024/2025".into(),
            department: "Science".into(),
            assessment_type: "ca_exam".into(),
            subject_count: 2,
            total_marks: 200.0,
            total_score: total,
            approved: false,
        }
    }

    #[test]
    fn ties_share_position_and_next_skips() {
        assert_eq!(
            competition_rank(&[180.0, 175.0, 180.0], RankOrder::HigherIsBetter),
            vec![1, 3, 1]
        );
        assert_eq!(
            competition_rank(&[10.0, 10.0, 10.0, 4.0], RankOrder::HigherIsBetter),
            vec![1, 1, 1, 4]
        );
        assert_eq!(
            competition_rank(&[12.0, 9.0, 9.0, 30.0], RankOrder::LowerIsBetter),
            vec![3, 1, 1, 4]
        );
        assert!(competition_rank(&[], RankOrder::HigherIsBetter).is_empty());
    }

    #[test]
    fn ranking_is_idempotent() {
        let values = [55.0, 91.5, 70.0, 91.5, 12.0, 70.0];
        let once = competition_rank(&values, RankOrder::HigherIsBetter);
        let twice = competition_rank(&values, RankOrder::HigherIsBetter);
        assert_eq!(once, twice);
    }

    #[test]
    fn new_top_record_shifts_each_rank_by_one() {
        let values = vec![80.0, 80.0, 60.0, 40.0];
        let before = competition_rank(&values, RankOrder::HigherIsBetter);
        let mut with_top = values.clone();
        with_top.push(99.0);
        let after = competition_rank(&with_top, RankOrder::HigherIsBetter);
        for i in 0..values.len() {
            assert_eq!(after[i], before[i] + 1);
        }
        assert_eq!(after[4], 1);
    }

    #[test]
    fn scope_ranking_orders_by_position_then_student_no() {
        let ranking = ScopeRanking::compute(
            RankScope::new("JSS1A", "first", "2024/2025"),
            vec![result("S3", 175.0), result("S2", 180.0), result("S1", 180.0)],
            Vec::new(),
        );
        let order: Vec<(&str, usize)> = ranking
            .results
            .iter()
            .map(|r| (r.result.student_no.as_str(), r.position))
            .collect();
        assert_eq!(order, vec![("S1", 1), ("S2", 1), ("S3", 3)]);
        assert_eq!(ranking.position_of("s3"), Some(3));
        assert_eq!(ranking.results[0].average, 90.0);
    }

    fn waec_scheme() -> MockScheme {
        MockScheme {
            core_subjects: vec!["English".into(), "Mathematics".into()],
            optional_count: 2,
            grade_points: GradePointTable::default(),
        }
    }

    fn subjects(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn mock_aggregate_takes_core_and_best_optional() {
        let agg = compute_mock_aggregate(
            &waec_scheme(),
            &subjects(&[
                ("English", 72.0),
                ("Mathematics", 81.0),
                ("Physics", 45.0),
                ("Biology", 66.0),
                ("Chemistry", 90.0),
            ]),
        )
        .unwrap();
        // English 2 + Mathematics 1 + Chemistry 1 + Biology 3
        assert_eq!(agg.aggregate, 7);
        assert_eq!(agg.selected.len(), 4);
        assert!(!agg.selected.iter().any(|s| s.subject == "Physics"));
    }

    #[test]
    fn mock_aggregate_reports_incomplete_sets() {
        let err = compute_mock_aggregate(
            &waec_scheme(),
            &subjects(&[("English", 72.0), ("Physics", 45.0)]),
        )
        .unwrap_err();
        match err {
            EngineError::IncompleteSubjectSet { missing } => {
                assert_eq!(missing[0], "Mathematics");
                assert_eq!(missing[1], "1 more optional subject(s)");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn improving_a_subject_never_worsens_the_aggregate() {
        let scheme = waec_scheme();
        let base = subjects(&[
            ("English", 52.0),
            ("Mathematics", 61.0),
            ("Physics", 47.0),
            ("Biology", 66.0),
            ("Chemistry", 39.0),
        ]);
        let base_agg = compute_mock_aggregate(&scheme, &base).unwrap().aggregate;
        for i in 0..base.len() {
            let mut step = 0.0;
            while base[i].1 + step <= 100.0 {
                let mut improved = base.clone();
                improved[i].1 += step;
                let agg = compute_mock_aggregate(&scheme, &improved).unwrap().aggregate;
                assert!(agg <= base_agg, "{} +{step} worsened", base[i].0);
                step += 5.0;
            }
        }
    }

    #[test]
    fn rank_mock_is_ascending_and_excludes_incomplete() {
        let ranking = rank_mock(
            &waec_scheme(),
            vec![
                (
                    "S1".into(),
                    "Ada".into(),
                    subjects(&[("English", 85.0), ("Mathematics", 85.0), ("Physics", 85.0), ("Biology", 85.0)]),
                ),
                (
                    "S2".into(),
                    "Bola".into(),
                    subjects(&[("English", 50.0), ("Mathematics", 85.0), ("Physics", 85.0), ("Biology", 85.0)]),
                ),
                (
                    "S3".into(),
                    "Chi".into(),
                    subjects(&[("English", 85.0), ("Mathematics", 85.0), ("Physics", 85.0), ("Biology", 85.0)]),
                ),
                ("S4".into(), "Dayo".into(), subjects(&[("English", 85.0)])),
            ],
        );
        let order: Vec<(&str, usize, u32)> = ranking
            .ranked
            .iter()
            .map(|r| (r.student_no.as_str(), r.position, r.aggregate.aggregate))
            .collect();
        assert_eq!(order, vec![("S1", 1, 4), ("S3", 1, 4), ("S2", 3, 9)]);
        assert_eq!(ranking.excluded.len(), 1);
        assert_eq!(ranking.excluded[0].code, "incomplete_subject_set");
    }

    #[test]
    fn grade_point_table_rejects_non_monotonic() {
        let bad = GradePointTable::new(vec![
            GradePointBand { min_percentage: 80.0, points: 3 },
            GradePointBand { min_percentage: 50.0, points: 1 },
            GradePointBand { min_percentage: 0.0, points: 9 },
        ]);
        assert!(bad.is_err());
        let no_floor = GradePointTable::new(vec![GradePointBand { min_percentage: 40.0, points: 1 }]);
        assert!(no_floor.is_err());
        let table = GradePointTable::default();
        assert_eq!(table.points_for(100.0), 1);
        assert_eq!(table.points_for(80.0), 1);
        assert_eq!(table.points_for(79.9), 2);
        assert_eq!(table.points_for(12.0), 9);
    }
}
