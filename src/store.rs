use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{DivisionProjection, DivisionSnapshot, ResultRow, StudentRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(#[source] rusqlite::Error),
    #[error("write failed: {0}")]
    Write(#[source] rusqlite::Error),
    #[error("transaction failed: {0}")]
    Tx(#[source] rusqlite::Error),
}

impl StoreError {
    /// IPC error-envelope code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Query(_) => "db_query_failed",
            StoreError::Write(_) => "db_write_failed",
            StoreError::Tx(_) => "db_tx_failed",
        }
    }
}

/// Reads one division's students and marks into an immutable snapshot
/// before any scoring begins. Only MARKS-evaluated subjects are indexed;
/// marks on grade-only or unknown subjects never enter averaging, so a
/// required code pointing at one of them reads as a lookup miss.
pub fn load_division_snapshot(
    conn: &Connection,
    division: &str,
    batch_id: &str,
) -> Result<DivisionSnapshot, StoreError> {
    let mut subject_stmt = conn
        .prepare("SELECT subject_id, subject_code FROM subjects WHERE eval_type = 'MARKS'")
        .map_err(StoreError::Query)?;
    let code_by_id: HashMap<String, String> = subject_stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect())
        .map_err(StoreError::Query)?;

    let mut student_stmt = conn
        .prepare(
            "SELECT roll_no, name, optional_subject, optional_subject_2
             FROM students
             WHERE division = ? AND batch_id = ?
             ORDER BY roll_no",
        )
        .map_err(StoreError::Query)?;
    let students: Vec<StudentRow> = student_stmt
        .query_map((division, batch_id), |r| {
            Ok(StudentRow {
                roll_no: r.get(0)?,
                name: r.get(1)?,
                optional_subject: r
                    .get::<_, Option<String>>(2)?
                    .filter(|s| !s.trim().is_empty()),
                optional_subject_2: r
                    .get::<_, Option<String>>(3)?
                    .filter(|s| !s.trim().is_empty()),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StoreError::Query)?;

    let mut mark_stmt = conn
        .prepare(
            "SELECT roll_no, subject_id, sub_avg
             FROM marks
             WHERE division = ? AND batch_id = ?",
        )
        .map_err(StoreError::Query)?;
    let mark_rows = mark_stmt
        .query_map((division, batch_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
            ))
        })
        .map_err(StoreError::Query)?;

    let mut marks: HashMap<(String, String), Option<f64>> = HashMap::new();
    for row in mark_rows {
        let (roll_no, subject_id, sub_avg) = row.map_err(StoreError::Query)?;
        let Some(code) = code_by_id.get(&subject_id) else {
            continue;
        };
        marks.insert((roll_no, code.clone()), sub_avg);
    }

    tracing::debug!(
        division,
        batch_id,
        students = students.len(),
        marks = marks.len(),
        "loaded division snapshot"
    );

    Ok(DivisionSnapshot {
        division: division.to_string(),
        batch_id: batch_id.to_string(),
        students,
        marks,
    })
}

/// A persisted result row, including the externally owned columns the
/// engine itself never writes (publish flag, letter grades).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub roll_no: String,
    pub name: Option<String>,
    pub division: String,
    pub batch_id: String,
    pub eng_avg: Option<f64>,
    pub eng_grace: f64,
    pub eco_avg: Option<f64>,
    pub eco_grace: f64,
    pub bk_avg: Option<f64>,
    pub bk_grace: f64,
    pub oc_avg: Option<f64>,
    pub oc_grace: f64,
    pub opt1_code: Option<String>,
    pub opt1_avg: Option<f64>,
    pub opt1_grace: f64,
    pub opt2_code: Option<String>,
    pub opt2_avg: Option<f64>,
    pub opt2_grace: f64,
    pub overall_tot: Option<f64>,
    pub total_grace: f64,
    pub percentage: Option<f64>,
    pub overall_grade: Option<String>,
    pub evs_grade: Option<String>,
    pub pe_grade: Option<String>,
    pub published: bool,
}

/// Upsert-by-natural-key persistence for results. The engine and the
/// division writer depend only on this capability, never on a concrete
/// store.
pub trait ResultStore {
    fn find(
        &self,
        roll_no: &str,
        division: &str,
        batch_id: &str,
    ) -> Result<Option<StoredResult>, StoreError>;

    /// Creates or fully re-materializes the derived fields of one result.
    /// On an existing row the student name, publish flag and letter grades
    /// are left as-is.
    fn save(&mut self, row: &ResultRow) -> Result<(), StoreError>;

    /// Flags a result as not currently computable: percentage is cleared
    /// and total grace zeroed while subject averages stay put.
    fn invalidate(
        &mut self,
        roll_no: &str,
        division: &str,
        batch_id: &str,
    ) -> Result<(), StoreError>;
}

pub struct SqliteResultStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteResultStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

fn map_stored_result(r: &Row<'_>) -> rusqlite::Result<StoredResult> {
    Ok(StoredResult {
        roll_no: r.get("roll_no")?,
        name: r.get("name")?,
        division: r.get("division")?,
        batch_id: r.get("batch_id")?,
        eng_avg: r.get("eng_avg")?,
        eng_grace: r.get("eng_grace")?,
        eco_avg: r.get("eco_avg")?,
        eco_grace: r.get("eco_grace")?,
        bk_avg: r.get("bk_avg")?,
        bk_grace: r.get("bk_grace")?,
        oc_avg: r.get("oc_avg")?,
        oc_grace: r.get("oc_grace")?,
        opt1_code: r.get("opt1_code")?,
        opt1_avg: r.get("opt1_avg")?,
        opt1_grace: r.get("opt1_grace")?,
        opt2_code: r.get("opt2_code")?,
        opt2_avg: r.get("opt2_avg")?,
        opt2_grace: r.get("opt2_grace")?,
        overall_tot: r.get("overall_tot")?,
        total_grace: r.get("total_grace")?,
        percentage: r.get("percentage")?,
        overall_grade: r.get("overall_grade")?,
        evs_grade: r.get("evs_grade")?,
        pe_grade: r.get("pe_grade")?,
        published: r.get::<_, i64>("published")? != 0,
    })
}

const RESULT_COLUMNS: &str = "roll_no, name, division, batch_id,
    eng_avg, eng_grace, eco_avg, eco_grace, bk_avg, bk_grace, oc_avg, oc_grace,
    opt1_code, opt1_avg, opt1_grace, opt2_code, opt2_avg, opt2_grace,
    overall_tot, total_grace, percentage, overall_grade,
    evs_grade, pe_grade, published";

impl ResultStore for SqliteResultStore<'_> {
    fn find(
        &self,
        roll_no: &str,
        division: &str,
        batch_id: &str,
    ) -> Result<Option<StoredResult>, StoreError> {
        let sql = format!(
            "SELECT {} FROM results WHERE roll_no = ? AND division = ? AND batch_id = ?",
            RESULT_COLUMNS
        );
        self.conn
            .query_row(&sql, (roll_no, division, batch_id), |r| {
                map_stored_result(r)
            })
            .optional()
            .map_err(StoreError::Query)
    }

    fn save(&mut self, row: &ResultRow) -> Result<(), StoreError> {
        let result_id = Uuid::new_v4().to_string();
        // The UPDATE arm rewrites derived fields only: name sticks to its
        // first-write value, and published/evs_grade/pe_grade belong to
        // other writers.
        self.conn
            .execute(
                "INSERT INTO results(
                    result_id, batch_id, roll_no, name, division,
                    eng_avg, eng_grace, eco_avg, eco_grace,
                    bk_avg, bk_grace, oc_avg, oc_grace,
                    opt1_code, opt1_avg, opt1_grace,
                    opt2_code, opt2_avg, opt2_grace,
                    overall_tot, total_grace, percentage, overall_grade)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(batch_id, roll_no, division) DO UPDATE SET
                    eng_avg = excluded.eng_avg,
                    eng_grace = excluded.eng_grace,
                    eco_avg = excluded.eco_avg,
                    eco_grace = excluded.eco_grace,
                    bk_avg = excluded.bk_avg,
                    bk_grace = excluded.bk_grace,
                    oc_avg = excluded.oc_avg,
                    oc_grace = excluded.oc_grace,
                    opt1_code = excluded.opt1_code,
                    opt1_avg = excluded.opt1_avg,
                    opt1_grace = excluded.opt1_grace,
                    opt2_code = excluded.opt2_code,
                    opt2_avg = excluded.opt2_avg,
                    opt2_grace = excluded.opt2_grace,
                    overall_tot = excluded.overall_tot,
                    total_grace = excluded.total_grace,
                    percentage = excluded.percentage,
                    overall_grade = excluded.overall_grade",
                params![
                    result_id,
                    row.batch_id,
                    row.roll_no,
                    row.name,
                    row.division,
                    row.eng.average,
                    row.eng.grace,
                    row.eco.average,
                    row.eco.grace,
                    row.bk.average,
                    row.bk.grace,
                    row.oc.average,
                    row.oc.grace,
                    row.opt1.as_ref().map(|s| s.code.clone()),
                    row.opt1.as_ref().map(|s| s.average),
                    row.opt1.as_ref().map(|s| s.grace).unwrap_or(0.0),
                    row.opt2.as_ref().map(|s| s.code.clone()),
                    row.opt2.as_ref().map(|s| s.average),
                    row.opt2.as_ref().map(|s| s.grace).unwrap_or(0.0),
                    row.overall_tot,
                    row.total_grace,
                    row.percentage,
                    row.overall_grade,
                ],
            )
            .map_err(StoreError::Write)?;
        Ok(())
    }

    fn invalidate(
        &mut self,
        roll_no: &str,
        division: &str,
        batch_id: &str,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE results SET percentage = NULL, total_grace = 0
                 WHERE roll_no = ? AND division = ? AND batch_id = ?",
                (roll_no, division, batch_id),
            )
            .map_err(StoreError::Write)?;
        Ok(())
    }
}

/// In-memory `ResultStore` with the same upsert/invalidate semantics as
/// the SQLite one; backs engine-level tests.
#[derive(Debug, Default)]
#[allow(dead_code)]
pub struct MemoryResultStore {
    rows: HashMap<(String, String, String), StoredResult>,
}

fn key_of(roll_no: &str, division: &str, batch_id: &str) -> (String, String, String) {
    (
        batch_id.to_string(),
        roll_no.to_string(),
        division.to_string(),
    )
}

fn derived_fields(target: &mut StoredResult, row: &ResultRow) {
    target.eng_avg = Some(row.eng.average);
    target.eng_grace = row.eng.grace;
    target.eco_avg = Some(row.eco.average);
    target.eco_grace = row.eco.grace;
    target.bk_avg = Some(row.bk.average);
    target.bk_grace = row.bk.grace;
    target.oc_avg = Some(row.oc.average);
    target.oc_grace = row.oc.grace;
    target.opt1_code = row.opt1.as_ref().map(|s| s.code.clone());
    target.opt1_avg = row.opt1.as_ref().map(|s| s.average);
    target.opt1_grace = row.opt1.as_ref().map(|s| s.grace).unwrap_or(0.0);
    target.opt2_code = row.opt2.as_ref().map(|s| s.code.clone());
    target.opt2_avg = row.opt2.as_ref().map(|s| s.average);
    target.opt2_grace = row.opt2.as_ref().map(|s| s.grace).unwrap_or(0.0);
    target.overall_tot = Some(row.overall_tot);
    target.total_grace = row.total_grace;
    target.percentage = Some(row.percentage);
    target.overall_grade = Some(row.overall_grade.clone());
}

impl ResultStore for MemoryResultStore {
    fn find(
        &self,
        roll_no: &str,
        division: &str,
        batch_id: &str,
    ) -> Result<Option<StoredResult>, StoreError> {
        Ok(self.rows.get(&key_of(roll_no, division, batch_id)).cloned())
    }

    fn save(&mut self, row: &ResultRow) -> Result<(), StoreError> {
        let key = key_of(&row.roll_no, &row.division, &row.batch_id);
        let entry = self.rows.entry(key).or_insert_with(|| StoredResult {
            roll_no: row.roll_no.clone(),
            name: Some(row.name.clone()),
            division: row.division.clone(),
            batch_id: row.batch_id.clone(),
            eng_avg: None,
            eng_grace: 0.0,
            eco_avg: None,
            eco_grace: 0.0,
            bk_avg: None,
            bk_grace: 0.0,
            oc_avg: None,
            oc_grace: 0.0,
            opt1_code: None,
            opt1_avg: None,
            opt1_grace: 0.0,
            opt2_code: None,
            opt2_avg: None,
            opt2_grace: 0.0,
            overall_tot: None,
            total_grace: 0.0,
            percentage: None,
            overall_grade: None,
            evs_grade: None,
            pe_grade: None,
            published: false,
        });
        derived_fields(entry, row);
        Ok(())
    }

    fn invalidate(
        &mut self,
        roll_no: &str,
        division: &str,
        batch_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.rows.get_mut(&key_of(roll_no, division, batch_id)) {
            existing.percentage = None;
            existing.total_grace = 0.0;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteStats {
    pub saved: usize,
    pub invalidated: usize,
}

/// Persists one projection through a store: every computed row is saved,
/// every incomplete student's existing row is invalidated. An incomplete
/// student with no prior row gets nothing.
pub fn apply_projection(
    store: &mut dyn ResultStore,
    projection: &DivisionProjection,
) -> Result<WriteStats, StoreError> {
    let mut stats = WriteStats::default();
    for row in &projection.computed {
        store.save(row)?;
        stats.saved += 1;
    }
    for roll_no in &projection.incomplete {
        let existing = store.find(roll_no, &projection.division, &projection.batch_id)?;
        if existing.is_some() {
            store.invalidate(roll_no, &projection.division, &projection.batch_id)?;
            stats.invalidated += 1;
        }
    }
    Ok(stats)
}

/// Commits a projection for one division atomically: all rows land or
/// none do.
pub fn commit_division(
    conn: &Connection,
    projection: &DivisionProjection,
) -> Result<WriteStats, StoreError> {
    let tx = conn.unchecked_transaction().map_err(StoreError::Tx)?;
    let mut store = SqliteResultStore::new(&tx);
    let stats = match apply_projection(&mut store, projection) {
        Ok(stats) => stats,
        Err(e) => {
            let _ = tx.rollback();
            return Err(e);
        }
    };
    tx.commit().map_err(StoreError::Tx)?;
    Ok(stats)
}

pub fn list_division_results(
    conn: &Connection,
    division: &str,
    batch_id: &str,
) -> Result<Vec<StoredResult>, StoreError> {
    let sql = format!(
        "SELECT {} FROM results WHERE division = ? AND batch_id = ? ORDER BY roll_no",
        RESULT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(StoreError::Query)?;
    stmt.query_map((division, batch_id), |r| map_stored_result(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(StoreError::Query)
}
