use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn open_db(workspace: &PathBuf) -> Connection {
    Connection::open(workspace.join("results.sqlite3")).expect("open db")
}

fn seed_catalog(conn: &Connection) {
    for (id, code, category) in [
        ("sub-eng", "ENG", "CORE"),
        ("sub-eco", "ECO", "CORE"),
        ("sub-bk", "BK", "CORE"),
        ("sub-oc", "OC", "CORE"),
        ("sub-hindi", "HINDI", "OPTIONAL"),
        ("sub-maths", "MATHS", "OPTIONAL"),
    ] {
        conn.execute(
            "INSERT INTO subjects(subject_id, subject_code, subject_name, category, eval_type)
             VALUES(?, ?, ?, ?, 'MARKS')",
            (id, code, code, category),
        )
        .expect("seed subject");
    }
}

fn seed_six_subject_student(conn: &Connection, roll: &str, vals: [f64; 6]) {
    conn.execute(
        "INSERT INTO students(student_id, batch_id, roll_no, name, division,
                              optional_subject, optional_subject_2)
         VALUES(?, '2025', ?, ?, 'A', 'HINDI', 'MATHS')",
        (format!("stu-{}", roll), roll, format!("Student {}", roll)),
    )
    .expect("seed student");
    for (sid, avg) in [
        "sub-eng", "sub-eco", "sub-bk", "sub-oc", "sub-hindi", "sub-maths",
    ]
    .iter()
    .zip(vals.iter())
    {
        conn.execute(
            "INSERT INTO marks(mark_id, batch_id, roll_no, division, subject_id, sub_avg)
             VALUES(?, '2025', ?, 'A', ?, ?)",
            (format!("mk-{}-{}", roll, sid), roll, sid, avg),
        )
        .expect("seed mark");
    }
}

fn seed_core_only_student(conn: &Connection, roll: &str, vals: [f64; 4]) {
    conn.execute(
        "INSERT INTO students(student_id, batch_id, roll_no, name, division,
                              optional_subject, optional_subject_2)
         VALUES(?, '2025', ?, ?, 'A', NULL, NULL)",
        (format!("stu-{}", roll), roll, format!("Student {}", roll)),
    )
    .expect("seed student");
    for (sid, avg) in ["sub-eng", "sub-eco", "sub-bk", "sub-oc"].iter().zip(vals.iter()) {
        conn.execute(
            "INSERT INTO marks(mark_id, batch_id, roll_no, division, subject_id, sub_avg)
             VALUES(?, '2025', ?, 'A', ?, ?)",
            (format!("mk-{}-{}", roll, sid), roll, sid, avg),
        )
        .expect("seed mark");
    }
}

fn generate(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "results.generate",
        json!({ "division": "A", "batchId": "2025" }),
    );
}

fn fetch_row(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    roll: &str,
) -> serde_json::Value {
    let listing = request_ok(
        stdin,
        reader,
        id,
        "results.get",
        json!({ "division": "A", "batchId": "2025" }),
    );
    listing["results"]
        .as_array()
        .expect("results array")
        .iter()
        .find(|r| r["rollNo"] == roll)
        .unwrap_or_else(|| panic!("no result row for {}", roll))
        .clone()
}

#[test]
fn single_failing_subject_is_condoned() {
    let workspace = temp_dir("resultd-condonation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let conn = open_db(&workspace);
    seed_catalog(&conn);
    seed_six_subject_student(&conn, "401", [28.0, 70.0, 56.0, 61.0, 81.0, 91.0]);

    generate(&mut stdin, &mut reader, "2");
    let row = fetch_row(&mut stdin, &mut reader, "3", "401");

    assert_eq!(row["engGrace"], 7.0);
    assert_eq!(row["totalGrace"], 7.0);
    assert_eq!(row["overallGrade"], "Promoted – Passed with Condonation");
    // The grant is advisory: raw totals stay as aggregated.
    assert_eq!(row["overallTot"], 387.0);
    assert_eq!(row["percentage"], 64.5);

    let _ = child.kill();
}

#[test]
fn too_many_failures_or_oversized_deficits_fail_outright() {
    let workspace = temp_dir("resultd-grace-refused");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let conn = open_db(&workspace);
    seed_catalog(&conn);
    // Four failing subjects.
    seed_six_subject_student(&conn, "402", [30.0, 31.0, 32.0, 33.0, 80.0, 80.0]);
    // One deficit of 11, above the per-subject cap.
    seed_six_subject_student(&conn, "403", [24.0, 70.0, 70.0, 70.0, 70.0, 70.0]);
    // Combined deficit of 18, above the shared budget.
    seed_six_subject_student(&conn, "404", [29.0, 29.0, 29.0, 70.0, 70.0, 70.0]);

    generate(&mut stdin, &mut reader, "2");

    for (id, roll) in [("3", "402"), ("4", "403"), ("5", "404")] {
        let row = fetch_row(&mut stdin, &mut reader, id, roll);
        assert_eq!(row["overallGrade"], "Fail", "roll {}", roll);
        assert_eq!(row["totalGrace"], 0.0, "roll {}", roll);
        assert_eq!(row["engGrace"], 0.0, "roll {}", roll);
    }

    let _ = child.kill();
}

#[test]
fn grade_two_total_just_below_the_bar_is_promoted() {
    let workspace = temp_dir("resultd-promotion");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let conn = open_db(&workspace);
    seed_catalog(&conn);
    seed_six_subject_student(&conn, "405", [60.0, 60.0, 60.0, 60.0, 60.0, 58.0]);

    generate(&mut stdin, &mut reader, "2");
    let row = fetch_row(&mut stdin, &mut reader, "3", "405");

    assert_eq!(row["overallTot"], 358.0);
    assert_eq!(row["percentage"], 59.67);
    assert_eq!(row["overallGrade"], "Grade I");
    assert_eq!(row["totalGrace"], 2.0);

    let _ = child.kill();
}

#[test]
fn promotion_window_is_switchable_per_workspace() {
    let workspace = temp_dir("resultd-promotion-config");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let conn = open_db(&workspace);
    seed_catalog(&conn);
    // 238 of 400: Grade II, two marks short of a scaled 60% target.
    seed_core_only_student(&conn, "406", [60.0, 60.0, 60.0, 58.0]);

    let config = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.config.get",
        json!({}),
    );
    assert_eq!(config["promotionWindow"], "fixed");

    // The literal window assumes six subjects, so it never fires here.
    generate(&mut stdin, &mut reader, "3");
    let row = fetch_row(&mut stdin, &mut reader, "4", "406");
    assert_eq!(row["overallGrade"], "Grade II");
    assert_eq!(row["totalGrace"], 0.0);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.config.update",
        json!({ "promotionWindow": "scaled" }),
    );
    assert_eq!(updated["promotionWindow"], "scaled");

    generate(&mut stdin, &mut reader, "6");
    let row = fetch_row(&mut stdin, &mut reader, "7", "406");
    assert_eq!(row["overallGrade"], "Grade I");
    assert_eq!(row["totalGrace"], 2.0);

    // Switching back restores the literal behavior.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "results.config.update",
        json!({ "promotionWindow": "fixed" }),
    );
    generate(&mut stdin, &mut reader, "9");
    let row = fetch_row(&mut stdin, &mut reader, "10", "406");
    assert_eq!(row["overallGrade"], "Grade II");
    assert_eq!(row["totalGrace"], 0.0);

    let _ = child.kill();
}
