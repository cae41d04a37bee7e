//! Workspace settings, stored as JSON sections in the `settings` table and
//! merged over defaults on read.

use crate::grading::OutOfRangePolicy;
use crate::ranking::{GradePointBand, GradePointTable, MockScheme};
use crate::store::SqliteStore;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Grading,
    Import,
    Mock,
}

impl SetupSection {
    pub const ALL: [SetupSection; 3] = [Self::Grading, Self::Import, Self::Mock];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "import" => Some(Self::Import),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::Import => "import",
            Self::Mock => "mock",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Import => "setup.import",
            Self::Mock => "setup.mock",
        }
    }
}

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "outOfRangePolicy": OutOfRangePolicy::default().as_str()
        }),
        SetupSection::Import => json!({
            "maxReportedIssues": 200,
            "requireNamesForNewStudents": true
        }),
        SetupSection::Mock => json!({
            "coreSubjects": ["English Language", "Mathematics", "Integrated Science", "Social Studies"],
            "optionalCount": 2,
            "gradePoints": GradePointTable::default()
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_subject_list(v: &Value, key: &str) -> Result<Vec<String>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} entries must be non-empty strings", key))?;
        if out.iter().any(|o| o.eq_ignore_ascii_case(s)) {
            return Err(format!("{} lists '{}' twice", key, s));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

/// Applies `patch` to `current`, validating each field. Unknown fields are
/// rejected so typos surface instead of being silently stored.
pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "outOfRangePolicy" => {
                    let policy = v
                        .as_str()
                        .and_then(OutOfRangePolicy::parse)
                        .ok_or_else(|| "outOfRangePolicy must be one of: reject, clamp".to_string())?;
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Import => match k.as_str() {
                "maxReportedIssues" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10_000)?));
                }
                "requireNamesForNewStudents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown import field: {}", k)),
            },
            SetupSection::Mock => match k.as_str() {
                "coreSubjects" => {
                    obj.insert(k.clone(), json!(parse_subject_list(v, k)?));
                }
                "optionalCount" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 20)?));
                }
                "gradePoints" => {
                    let bands: Vec<GradePointBand> = serde_json::from_value(v.clone())
                        .map_err(|e| format!("gradePoints: {}", e))?;
                    let table = GradePointTable::new(bands).map_err(|e| e.to_string())?;
                    obj.insert(k.clone(), json!(table));
                }
                _ => return Err(format!("unknown mock field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(store: &SqliteStore, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = store.settings_get(section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                if let Err(e) = merge_section_patch(section, &mut current, &single) {
                    tracing::warn!(section = section.name(), field = %k, error = %e, "ignoring stored setting");
                }
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    store: &SqliteStore,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(store, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    store.settings_set(section.key(), &current)?;
    Ok(Ok(current))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingSettings {
    pub out_of_range_policy: OutOfRangePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    pub max_reported_issues: usize,
    pub require_names_for_new_students: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_reported_issues: 200,
            require_names_for_new_students: true,
        }
    }
}

pub fn grading_settings(store: &SqliteStore) -> anyhow::Result<GradingSettings> {
    Ok(serde_json::from_value(load_section(store, SetupSection::Grading)?)?)
}

pub fn import_settings(store: &SqliteStore) -> anyhow::Result<ImportSettings> {
    Ok(serde_json::from_value(load_section(store, SetupSection::Import)?)?)
}

pub fn mock_scheme(store: &SqliteStore) -> anyhow::Result<MockScheme> {
    Ok(serde_json::from_value(load_section(store, SetupSection::Mock)?)?)
}
