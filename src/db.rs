use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "results.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // WAL lets a second reader (another operator's export) proceed during an import.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grading_bands(
            id TEXT PRIMARY KEY,
            department TEXT NOT NULL COLLATE NOCASE,
            academic_year TEXT NOT NULL COLLATE NOCASE,
            term TEXT NOT NULL COLLATE NOCASE,
            sort_order INTEGER NOT NULL,
            from_percentage REAL NOT NULL,
            to_percentage REAL NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT NOT NULL DEFAULT '',
            UNIQUE(department, academic_year, term, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grading_bands_scope
         ON grading_bands(department, academic_year, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_configs(
            id TEXT PRIMARY KEY,
            department TEXT NOT NULL COLLATE NOCASE,
            academic_year TEXT NOT NULL COLLATE NOCASE,
            term TEXT NOT NULL COLLATE NOCASE,
            assessment_type TEXT NOT NULL COLLATE NOCASE,
            components_json TEXT NOT NULL,
            total REAL NOT NULL,
            normalize_to REAL,
            updated_at TEXT,
            UNIQUE(department, academic_year, term, assessment_type)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_no TEXT NOT NULL COLLATE NOCASE UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            class_name TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_name TEXT NOT NULL COLLATE NOCASE,
            term TEXT NOT NULL COLLATE NOCASE,
            academic_year TEXT NOT NULL COLLATE NOCASE,
            department TEXT NOT NULL,
            assessment_type TEXT NOT NULL,
            subject_count INTEGER NOT NULL DEFAULT 0,
            total_marks REAL NOT NULL DEFAULT 0,
            total_score REAL NOT NULL DEFAULT 0,
            approved INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, class_name, term, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_scope ON results(class_name, term, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_scores(
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL,
            subject TEXT NOT NULL COLLATE NOCASE,
            components_json TEXT NOT NULL,
            total REAL NOT NULL,
            max_total REAL NOT NULL,
            grade TEXT NOT NULL,
            remark TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(result_id) REFERENCES results(id),
            UNIQUE(result_id, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_scores_result ON subject_scores(result_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mock_scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            session TEXT NOT NULL COLLATE NOCASE,
            subject TEXT NOT NULL COLLATE NOCASE,
            percentage REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, session, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mock_scores_session ON mock_scores(session)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_log(
            batch_id TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            total INTEGER NOT NULL,
            imported INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            cancelled INTEGER NOT NULL,
            fatal TEXT
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text).with_context(|| {
            format!("settings value for {} is not valid JSON", key)
        })?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
