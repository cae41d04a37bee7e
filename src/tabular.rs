//! Tabular boundary: row payload parsing (CSV text or a JSON array of flat
//! objects) and export grids.

use crate::error::{EngineError, EngineResult};
use crate::ranking::ScopeRanking;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Csv,
    Json,
}

impl PayloadFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// One source row. Keys are normalized column names; `line` is the 1-based
/// source position (CSV physical line, JSON array element).
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub line: usize,
    pub fields: BTreeMap<String, String>,
    pub extra_cells: usize,
}

impl RawRow {
    /// Trimmed, non-empty value of a column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabularPayload {
    /// Normalized column names in source order.
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// `Student No`, `student_no` and `studentNo` all become `studentno`.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn parse_payload(format: PayloadFormat, text: &str) -> EngineResult<TabularPayload> {
    match format {
        PayloadFormat::Csv => parse_csv(text),
        PayloadFormat::Json => parse_json_rows(text),
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

/// Splits text into logical records, keeping quoted line breaks inside a
/// record. Each record carries the line it starts on.
fn split_records(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut current: Option<(usize, String)> = None;
    let mut quotes = 0usize;
    for (idx, line) in text.lines().enumerate() {
        match current.as_mut() {
            Some((_, buf)) => {
                buf.push('\n');
                buf.push_str(line);
            }
            None => current = Some((idx + 1, line.to_string())),
        }
        quotes += line.matches('"').count();
        if quotes % 2 == 0 {
            if let Some(done) = current.take() {
                out.push(done);
            }
            quotes = 0;
        }
    }
    if let Some(rest) = current {
        out.push(rest);
    }
    out
}

pub fn parse_csv(text: &str) -> EngineResult<TabularPayload> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = split_records(text)
        .into_iter()
        .filter(|(_, r)| !r.trim().is_empty());

    let Some((_, header_line)) = records.next() else {
        return Err(EngineError::Parse("payload is empty".into()));
    };
    let columns = parse_columns(parse_csv_record(&header_line).iter().map(String::as_str))?;

    let rows = records
        .map(|(line, record)| {
            let cells = parse_csv_record(&record);
            let extra_cells = cells
                .iter()
                .skip(columns.len())
                .filter(|c| !c.trim().is_empty())
                .count();
            let fields = columns.iter().cloned().zip(cells).collect();
            RawRow {
                line,
                fields,
                extra_cells,
            }
        })
        .collect();
    Ok(TabularPayload { columns, rows })
}

fn parse_columns<'a>(raw: impl Iterator<Item = &'a str>) -> EngineResult<Vec<String>> {
    let mut columns = Vec::new();
    let mut seen = BTreeSet::new();
    for (i, h) in raw.enumerate() {
        let key = normalize_header(h);
        if key.is_empty() {
            return Err(EngineError::Parse(format!("header column {} is blank", i + 1)));
        }
        if !seen.insert(key.clone()) {
            return Err(EngineError::Parse(format!("header column '{}' appears twice", h.trim())));
        }
        columns.push(key);
    }
    Ok(columns)
}

fn json_cell(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

pub fn parse_json_rows(text: &str) -> EngineResult<TabularPayload> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(EngineError::Parse("payload is empty".into()));
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| EngineError::Parse(format!("invalid JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(EngineError::Parse("JSON payload must be an array of objects".into()));
    };

    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(EngineError::Parse(format!("element {} is not an object", i + 1)));
        };
        let mut fields = BTreeMap::new();
        for (k, v) in obj {
            let key = normalize_header(k);
            if key.is_empty() {
                continue;
            }
            if !columns.contains(&key) {
                columns.push(key.clone());
            }
            fields.insert(key, json_cell(v));
        }
        rows.push(RawRow {
            line: i + 1,
            fields,
            extra_cells: 0,
        });
    }
    Ok(TabularPayload { columns, rows })
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Integers print bare, everything else with one decimal.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{:.0}", v)
    } else {
        format!("{:.1}", v)
    }
}

/// A spreadsheet-ready cell grid: header rows followed by data rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportGrid {
    pub header_rows: Vec<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

impl ExportGrid {
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for row in self.header_rows.iter().chain(self.rows.iter()) {
            let line: Vec<String> = row.iter().map(|c| csv_quote(c)).collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        out
    }
}

/// Broadsheet for one scope: a title row, a column header row, then one row
/// per result in position order with every subject total of the scope.
pub fn results_grid(ranking: &ScopeRanking) -> ExportGrid {
    let subjects: Vec<&String> = ranking.subjects.keys().collect();
    let display_subjects: Vec<String> = ranking
        .subjects
        .values()
        .map(|rows| {
            rows.first()
                .map(|r| r.score.subject.clone())
                .unwrap_or_default()
        })
        .collect();

    let scope = &ranking.scope;
    let title = vec![
        "Class".to_string(),
        scope.class_name.clone(),
        "Term".to_string(),
        scope.term.clone(),
        "Academic Year".to_string(),
        scope.academic_year.clone(),
    ];
    let mut columns = vec![
        "Position".to_string(),
        "Student No".to_string(),
        "Name".to_string(),
    ];
    columns.extend(display_subjects);
    columns.extend(
        ["Total Score", "Total Marks", "Average", "Approved"]
            .iter()
            .map(|s| s.to_string()),
    );

    let rows = ranking
        .results
        .iter()
        .map(|ranked| {
            let r = &ranked.result;
            let mut row = vec![
                ranked.position.to_string(),
                r.student_no.clone(),
                r.display_name.clone(),
            ];
            for subject in &subjects {
                let cell = ranking.subjects[*subject]
                    .iter()
                    .find(|s| s.score.result_id == r.id)
                    .map(|s| format_number(s.score.total))
                    .unwrap_or_default();
                row.push(cell);
            }
            row.push(format_number(r.total_score));
            row.push(format_number(r.total_marks));
            row.push(format_number(ranked.average));
            row.push(if r.approved { "Y" } else { "N" }.to_string());
            row
        })
        .collect();

    ExportGrid {
        header_rows: vec![title, columns],
        rows,
    }
}
