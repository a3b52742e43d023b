use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("results.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            subject_id TEXT PRIMARY KEY,
            subject_code TEXT NOT NULL UNIQUE,
            subject_name TEXT NOT NULL,
            category TEXT NOT NULL,
            eval_type TEXT NOT NULL DEFAULT 'MARKS'
        )",
        [],
    )?;

    // Workspaces created before grade-only subjects (PE/EVS) were split out
    // lack the eval_type column. Add it; existing rows are all MARKS.
    ensure_subjects_eval_type(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            student_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            roll_no TEXT NOT NULL,
            name TEXT NOT NULL,
            division TEXT NOT NULL,
            optional_subject TEXT,
            optional_subject_2 TEXT,
            UNIQUE(batch_id, roll_no, division)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_division ON students(batch_id, division)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            mark_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            roll_no TEXT NOT NULL,
            division TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            unit1 REAL,
            unit2 REAL,
            internal REAL,
            term REAL,
            annual REAL,
            tot REAL,
            sub_avg REAL,
            FOREIGN KEY(subject_id) REFERENCES subjects(subject_id),
            UNIQUE(batch_id, division, roll_no, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_division ON marks(batch_id, division)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_roll ON marks(batch_id, division, roll_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            result_id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            roll_no TEXT NOT NULL,
            name TEXT,
            division TEXT NOT NULL,
            eng_avg REAL,
            eng_grace REAL NOT NULL DEFAULT 0,
            eco_avg REAL,
            eco_grace REAL NOT NULL DEFAULT 0,
            bk_avg REAL,
            bk_grace REAL NOT NULL DEFAULT 0,
            oc_avg REAL,
            oc_grace REAL NOT NULL DEFAULT 0,
            opt1_code TEXT,
            opt1_avg REAL,
            opt1_grace REAL NOT NULL DEFAULT 0,
            opt2_code TEXT,
            opt2_avg REAL,
            opt2_grace REAL NOT NULL DEFAULT 0,
            overall_tot REAL,
            total_grace REAL NOT NULL DEFAULT 0,
            percentage REAL,
            overall_grade TEXT,
            evs_grade TEXT,
            pe_grade TEXT,
            published INTEGER NOT NULL DEFAULT 0,
            UNIQUE(batch_id, roll_no, division)
        )",
        [],
    )?;
    ensure_results_letter_grades(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_division ON results(batch_id, division)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_subjects_eval_type(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "eval_type")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE subjects ADD COLUMN eval_type TEXT NOT NULL DEFAULT 'MARKS'",
        [],
    )?;
    Ok(())
}

fn ensure_results_letter_grades(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "results", "evs_grade")? {
        conn.execute("ALTER TABLE results ADD COLUMN evs_grade TEXT", [])?;
    }
    if !table_has_column(conn, "results", "pe_grade")? {
        conn.execute("ALTER TABLE results ADD COLUMN pe_grade TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
