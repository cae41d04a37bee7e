use crate::error::{EngineError, EngineResult};
use crate::store::RecordStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Widest allowed distance between one band's upper bound and the next band's
/// lower bound. Integer-authored scales (0-74, 75-89) leave a one point seam.
const MAX_BAND_SEAM: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScope {
    pub department: String,
    pub academic_year: String,
    pub term: String,
}

impl GradingScope {
    pub fn new(department: &str, academic_year: &str, term: &str) -> Self {
        Self {
            department: department.trim().to_string(),
            academic_year: academic_year.trim().to_string(),
            term: term.trim().to_string(),
        }
    }

    /// Case-insensitive identity used for caching.
    pub fn cache_key(&self) -> (String, String, String) {
        (
            self.department.to_ascii_lowercase(),
            self.academic_year.to_ascii_lowercase(),
            self.term.to_ascii_lowercase(),
        )
    }
}

impl fmt::Display for GradingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.department, self.academic_year, self.term)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub from_percentage: f64,
    pub to_percentage: f64,
    pub grade: String,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRangePolicy {
    #[default]
    Reject,
    Clamp,
}

impl OutOfRangePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "clamp" => Some(Self::Clamp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Clamp => "clamp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedGrade {
    pub grade: String,
    pub remark: String,
}

/// A validated scale. Bands are kept sorted ascending by lower bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingScale {
    pub scope: GradingScope,
    pub bands: Vec<GradeBand>,
}

impl GradingScale {
    pub fn new(scope: GradingScope, mut bands: Vec<GradeBand>) -> EngineResult<Self> {
        validate_bands(&scope, &mut bands)?;
        Ok(Self { scope, bands })
    }

    pub fn min(&self) -> f64 {
        self.bands.first().map(|b| b.from_percentage).unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.bands.last().map(|b| b.to_percentage).unwrap_or(0.0)
    }

    /// Bounds are inclusive. A score sitting in the seam between two bands
    /// (74.5 between 0-74 and 75-89) belongs to the lower band.
    pub fn resolve(&self, score: f64, policy: OutOfRangePolicy) -> EngineResult<ResolvedGrade> {
        let (min, max) = (self.min(), self.max());
        let out_of_range = !score.is_finite() || score < min || score > max;
        let score = if out_of_range {
            match policy {
                OutOfRangePolicy::Clamp if score.is_finite() => score.clamp(min, max),
                _ => return Err(EngineError::ScoreOutOfRange { score, min, max }),
            }
        } else {
            score
        };

        let idx = self.bands.partition_point(|b| b.from_percentage <= score);
        let band = idx
            .checked_sub(1)
            .and_then(|i| self.bands.get(i))
            .ok_or(EngineError::ScoreOutOfRange { score, min, max })?;
        Ok(ResolvedGrade {
            grade: band.grade.clone(),
            remark: band.remark.clone(),
        })
    }
}

fn invalid(scope: &GradingScope, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidScale {
        scope: scope.to_string(),
        reason: reason.into(),
    }
}

/// Sorts `bands` ascending and rejects anything that would make lookup
/// ambiguous or partial.
pub fn validate_bands(scope: &GradingScope, bands: &mut [GradeBand]) -> EngineResult<()> {
    if bands.is_empty() {
        return Err(invalid(scope, "scale has no bands"));
    }
    for b in bands.iter() {
        if !b.from_percentage.is_finite() || !b.to_percentage.is_finite() {
            return Err(invalid(scope, format!("band '{}' has a non-numeric bound", b.grade)));
        }
        if b.from_percentage < 0.0 || b.to_percentage > 100.0 {
            return Err(invalid(
                scope,
                format!("band '{}' must lie within 0..=100", b.grade),
            ));
        }
        if b.from_percentage > b.to_percentage {
            return Err(invalid(
                scope,
                format!(
                    "band '{}' starts above its end ({} > {})",
                    b.grade, b.from_percentage, b.to_percentage
                ),
            ));
        }
        if b.grade.trim().is_empty() {
            return Err(invalid(scope, "band grade label is empty"));
        }
    }

    bands.sort_by(|a, b| a.from_percentage.total_cmp(&b.from_percentage));
    for pair in bands.windows(2) {
        let (lo, hi) = (&pair[0], &pair[1]);
        if hi.from_percentage <= lo.to_percentage {
            return Err(invalid(
                scope,
                format!("bands '{}' and '{}' overlap", lo.grade, hi.grade),
            ));
        }
        if hi.from_percentage - lo.to_percentage > MAX_BAND_SEAM {
            return Err(invalid(
                scope,
                format!(
                    "gap between '{}' (to {}) and '{}' (from {})",
                    lo.grade, lo.to_percentage, hi.grade, hi.from_percentage
                ),
            ));
        }
    }
    Ok(())
}

/// Scope-keyed cache of validated scales. Saving a scale must invalidate
/// its scope after the store commits. Loads run under the cache lock, so an
/// invalidation can never be overtaken by a load that read the old bands.
#[derive(Debug, Default)]
pub struct ScaleCache {
    scales: Mutex<HashMap<(String, String, String), Arc<GradingScale>>>,
}

impl ScaleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load<F>(&self, scope: &GradingScope, load: F) -> EngineResult<Arc<GradingScale>>
    where
        F: FnOnce() -> EngineResult<Option<Vec<GradeBand>>>,
    {
        let key = scope.cache_key();
        let mut scales = self.lock();
        if let Some(hit) = scales.get(&key) {
            return Ok(hit.clone());
        }
        let Some(bands) = load()? else {
            return Err(EngineError::NoScaleConfigured {
                scope: scope.to_string(),
            });
        };
        let scale = Arc::new(GradingScale::new(scope.clone(), bands)?);
        scales.insert(key, scale.clone());
        Ok(scale)
    }

    pub fn invalidate(&self, scope: &GradingScope) {
        self.lock().remove(&scope.cache_key());
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String, String), Arc<GradingScale>>> {
        // A poisoned cache only ever held validated scales.
        self.scales.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves scores against the scale stored for a scope.
pub struct GradeResolver<'a> {
    store: &'a dyn RecordStore,
    cache: &'a ScaleCache,
    policy: OutOfRangePolicy,
}

impl<'a> GradeResolver<'a> {
    pub fn new(store: &'a dyn RecordStore, cache: &'a ScaleCache, policy: OutOfRangePolicy) -> Self {
        Self {
            store,
            cache,
            policy,
        }
    }

    pub fn scale(&self, scope: &GradingScope) -> EngineResult<Arc<GradingScale>> {
        self.cache
            .get_or_load(scope, || self.store.grading_bands(scope))
    }

    pub fn resolve_grade(&self, score: f64, scope: &GradingScope) -> EngineResult<ResolvedGrade> {
        self.scale(scope)?.resolve(score, self.policy)
    }
}
