use crate::error::{EngineError, EngineResult};
use crate::grading::{GradingScope, ResolvedGrade};
use crate::store::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Always-available scheme: one required `score` component out of 100.
pub const RAW_ASSESSMENT_TYPE: &str = "raw";
pub const RAW_COMPONENT: &str = "score";

const WEIGHT_EPSILON: f64 = 1e-6;

/// Component name (lowercase) to entered value; `None` means not entered.
pub type ComponentScores = BTreeMap<String, Option<f64>>;

/// Half-up rounding to one decimal: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDef {
    pub name: String,
    pub max: f64,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentConfig {
    pub scope: GradingScope,
    pub assessment_type: String,
    pub components: Vec<ComponentDef>,
    pub total: f64,
    #[serde(default)]
    pub normalize_to: Option<f64>,
}

impl AssessmentConfig {
    pub fn raw(scope: GradingScope) -> Self {
        Self {
            scope,
            assessment_type: RAW_ASSESSMENT_TYPE.to_string(),
            components: vec![ComponentDef {
                name: RAW_COMPONENT.to_string(),
                max: 100.0,
                optional: false,
            }],
            total: 100.0,
            normalize_to: None,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDef> {
        self.components
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Largest total a subject can reach under this scheme.
    pub fn max_total(&self) -> f64 {
        self.normalize_to.unwrap_or(self.total)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidAssessmentConfig { reason };
        if self.assessment_type.trim().is_empty() {
            return Err(invalid("assessment type is empty".into()));
        }
        if self.components.is_empty() {
            return Err(invalid("no components".into()));
        }
        let mut seen = HashSet::new();
        let mut sum = 0.0;
        for c in &self.components {
            let key = c.name.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(invalid("component name is empty".into()));
            }
            if !seen.insert(key) {
                return Err(invalid(format!("component '{}' is declared twice", c.name)));
            }
            if !c.max.is_finite() || c.max <= 0.0 {
                return Err(invalid(format!("component '{}' must have a positive max", c.name)));
            }
            sum += c.max;
        }
        if !self.total.is_finite() || (sum - self.total).abs() > WEIGHT_EPSILON {
            return Err(invalid(format!(
                "component maxima sum to {} but total is {}",
                sum, self.total
            )));
        }
        if let Some(n) = self.normalize_to {
            if !n.is_finite() || n <= 0.0 {
                return Err(invalid("normalizeTo must be positive".into()));
            }
        }
        Ok(())
    }
}

/// Loads the configuration for a scope. The `raw` type falls back to the
/// built-in scheme when nothing is stored under that name.
pub fn load_assessment_config(
    store: &dyn RecordStore,
    scope: &GradingScope,
    assessment_type: &str,
) -> EngineResult<AssessmentConfig> {
    let config = match store.assessment_config(scope, assessment_type)? {
        Some(c) => c,
        None if assessment_type.eq_ignore_ascii_case(RAW_ASSESSMENT_TYPE) => {
            AssessmentConfig::raw(scope.clone())
        }
        None => {
            return Err(EngineError::NoAssessmentConfig {
                scope: scope.to_string(),
                assessment_type: assessment_type.to_string(),
            })
        }
    };
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTotal {
    pub total: f64,
    pub max_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectScore {
    pub total: f64,
    pub max_total: f64,
    pub grade: String,
    pub remark: String,
}

/// Sums component contributions on their own scales. Absent required
/// components count as zero; absent optional ones are left out of both the
/// sum and the normalization denominator.
pub fn compute_total(
    components: &ComponentScores,
    config: &AssessmentConfig,
) -> EngineResult<SubjectTotal> {
    for name in components.keys() {
        if config.component(name).is_none() {
            return Err(EngineError::UnknownComponent {
                component: name.clone(),
            });
        }
    }

    let mut raw = 0.0_f64;
    let mut included_max = 0.0_f64;
    for def in &config.components {
        let value = components
            .get(&def.name.to_ascii_lowercase())
            .copied()
            .flatten();
        match value {
            Some(v) => {
                if !v.is_finite() || v < 0.0 || v > def.max + WEIGHT_EPSILON {
                    return Err(EngineError::InvalidComponentScore {
                        component: def.name.clone(),
                        value: v,
                        max: def.max,
                    });
                }
                raw += v;
                included_max += def.max;
            }
            None if def.optional => {}
            None => included_max += def.max,
        }
    }

    let (total, max_total) = match config.normalize_to {
        Some(n) if included_max > 0.0 => (raw / included_max * n, n),
        Some(n) => (0.0, n),
        None => (raw, included_max),
    };
    Ok(SubjectTotal {
        total: round_off_1_decimal(total),
        max_total,
    })
}

/// Computes the subject total and grades it with `grade`, which is handed
/// the rounded total.
pub fn compute_subject_score<G>(
    components: &ComponentScores,
    config: &AssessmentConfig,
    grade: G,
) -> EngineResult<SubjectScore>
where
    G: FnOnce(f64) -> EngineResult<ResolvedGrade>,
{
    let SubjectTotal { total, max_total } = compute_total(components, config)?;
    let resolved = grade(total)?;
    Ok(SubjectScore {
        total,
        max_total,
        grade: resolved.grade,
        remark: resolved.remark,
    })
}

/// Reads `{"ca1": 8, "exam": null}` style input.
pub fn components_from_json(raw: &Value) -> EngineResult<ComponentScores> {
    let Some(obj) = raw.as_object() else {
        return Err(EngineError::validation(
            "components",
            "components must be an object",
        ));
    };
    let mut out = ComponentScores::new();
    for (name, v) in obj {
        let key = name.trim().to_ascii_lowercase();
        let value = match v {
            Value::Null => None,
            Value::Number(n) => n.as_f64(),
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().parse::<f64>().map_err(|_| {
                EngineError::validation(name.clone(), format!("'{}' is not a number", s))
            })?),
            _ => {
                return Err(EngineError::validation(
                    name.clone(),
                    "component value must be a number or null",
                ))
            }
        };
        out.insert(key, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca_exam() -> AssessmentConfig {
        AssessmentConfig {
            scope: GradingScope::new("Science", "2024/2025", "first"),
            assessment_type: "ca_exam".into(),
            components: vec![
                ComponentDef { name: "CA1".into(), max: 10.0, optional: false },
                ComponentDef { name: "CA2".into(), max: 10.0, optional: false },
                ComponentDef { name: "CA3".into(), max: 10.0, optional: false },
                ComponentDef { name: "CA4".into(), max: 10.0, optional: true },
                ComponentDef { name: "Exam".into(), max: 60.0, optional: false },
            ],
            total: 100.0,
            normalize_to: None,
        }
    }

    fn scores(pairs: &[(&str, Option<f64>)]) -> ComponentScores {
        pairs
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), *v))
            .collect()
    }

    fn pass_fail(total: f64) -> EngineResult<ResolvedGrade> {
        Ok(ResolvedGrade {
            grade: if total >= 50.0 { "P" } else { "F" }.into(),
            remark: String::new(),
        })
    }

    #[test]
    fn sums_components_without_rescaling() {
        let config = ca_exam();
        config.validate().unwrap();
        let s = compute_subject_score(
            &scores(&[
                ("ca1", Some(8.0)),
                ("ca2", Some(7.5)),
                ("ca3", Some(9.0)),
                ("ca4", Some(6.0)),
                ("exam", Some(48.0)),
            ]),
            &config,
            pass_fail,
        )
        .unwrap();
        assert_eq!(s.total, 78.5);
        assert_eq!(s.max_total, 100.0);
        assert_eq!(s.grade, "P");
    }

    #[test]
    fn missing_required_is_zero_and_missing_optional_is_excluded() {
        let config = ca_exam();
        let t = compute_total(
            &scores(&[("ca1", Some(10.0)), ("ca2", None), ("exam", Some(30.0))]),
            &config,
        )
        .unwrap();
        assert_eq!(t.total, 40.0);
        // ca4 is optional and absent, so it does not count toward the maximum.
        assert_eq!(t.max_total, 90.0);
    }

    #[test]
    fn normalization_uses_included_components_only() {
        let mut config = ca_exam();
        config.normalize_to = Some(100.0);
        let t = compute_total(
            &scores(&[
                ("ca1", Some(9.0)),
                ("ca2", Some(9.0)),
                ("ca3", Some(9.0)),
                ("exam", Some(45.0)),
            ]),
            &config,
        )
        .unwrap();
        assert_eq!(t.total, 80.0);
        assert_eq!(t.max_total, 100.0);
    }

    #[test]
    fn rejects_negative_over_max_and_unknown_components() {
        let config = ca_exam();
        let over = compute_total(&scores(&[("ca1", Some(11.0))]), &config).unwrap_err();
        assert_eq!(over.code(), "invalid_component_score");
        let neg = compute_total(&scores(&[("exam", Some(-1.0))]), &config).unwrap_err();
        assert_eq!(neg.code(), "invalid_component_score");
        let unknown = compute_total(&scores(&[("project", Some(5.0))]), &config).unwrap_err();
        assert_eq!(unknown.code(), "unknown_component");
    }

    #[test]
    fn grading_failure_propagates() {
        let config = AssessmentConfig::raw(GradingScope::new("Arts", "2024/2025", "first"));
        let err = compute_subject_score(&scores(&[("score", Some(55.0))]), &config, |_| {
            Err(EngineError::NoScaleConfigured {
                scope: "Arts/2024/2025/first".into(),
            })
        })
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn validate_requires_maxima_to_sum_to_total() {
        let mut config = ca_exam();
        config.total = 90.0;
        assert!(config.validate().is_err());
        let mut dup = ca_exam();
        dup.components[1].name = "ca1".into();
        assert!(dup.validate().is_err());
    }

    #[test]
    fn components_from_json_accepts_numbers_strings_and_nulls() {
        let parsed = components_from_json(&serde_json::json!({
            "CA1": 7,
            "ca2": "8.5",
            "exam": null,
            "ca3": ""
        }))
        .unwrap();
        assert_eq!(parsed.get("ca1"), Some(&Some(7.0)));
        assert_eq!(parsed.get("ca2"), Some(&Some(8.5)));
        assert_eq!(parsed.get("exam"), Some(&None));
        assert_eq!(parsed.get("ca3"), Some(&None));
        assert!(components_from_json(&serde_json::json!({ "ca1": "x" })).is_err());
    }

    #[test]
    fn round_off_is_half_up() {
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(35.6818), 35.7);
    }
}
