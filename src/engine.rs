use std::collections::HashMap;

/// Core subjects every student sits, in the fixed slot order results are
/// written in. Optional selections follow as slot 1 and slot 2.
pub const CORE_SUBJECT_CODES: [&str; 4] = ["ENG", "ECO", "BK", "OC"];

const PASS_MARK: f64 = 35.0;
const GRACE_MAX_PER_SUBJECT: f64 = 10.0;
const GRACE_MAX_TOTAL: f64 = 15.0;
const GRACE_MAX_FAILING_SUBJECTS: usize = 3;

pub const GRADE_CONDONED: &str = "Promoted – Passed with Condonation";

/// VB6-compatible 2-decimal rounding used for percentages:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

pub fn grade_for_percentage(pct: f64) -> &'static str {
    if pct >= 75.0 {
        "Grade I with Distinction"
    } else if pct >= 60.0 {
        "Grade I"
    } else if pct >= 45.0 {
        "Grade II"
    } else if pct >= 35.0 {
        "Pass Class"
    } else {
        "Fail"
    }
}

/// How condonation grace is distributed across failing subjects. Single
/// strategy today; alternates slot in as sibling variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraceAllocation {
    #[default]
    ExactDeficit,
}

/// Which total-marks window qualifies a Grade II result for promotion.
///
/// `FixedSixSubject` keeps the literal 357..=359 window against a 360
/// target no matter how many subjects the student actually sat; the
/// constants assume 6 subjects of 100. `ScaledToSubjectCount` re-derives
/// the target as 60% of the student's own maximum, with the same 3-mark
/// window below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromotionWindow {
    #[default]
    FixedSixSubject,
    ScaledToSubjectCount,
}

impl PromotionWindow {
    pub fn from_setting(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::FixedSixSubject),
            "scaled" => Some(Self::ScaledToSubjectCount),
            _ => None,
        }
    }

    pub fn as_setting(self) -> &'static str {
        match self {
            Self::FixedSixSubject => "fixed",
            Self::ScaledToSubjectCount => "scaled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub promotion_window: PromotionWindow,
    pub grace_allocation: GraceAllocation,
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub roll_no: String,
    pub name: String,
    pub optional_subject: Option<String>,
    pub optional_subject_2: Option<String>,
}

/// Immutable in-memory view of one division's students and marks. The
/// projection never reads storage while scoring; everything it may need is
/// loaded into this snapshot up front.
#[derive(Debug, Clone, Default)]
pub struct DivisionSnapshot {
    pub division: String,
    pub batch_id: String,
    pub students: Vec<StudentRow>,
    /// (roll_no, subject_code) -> sub_avg. `None` means a mark row exists
    /// but carries no usable average yet.
    pub marks: HashMap<(String, String), Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectScore {
    pub average: f64,
    pub grace: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionalSlot {
    pub code: String,
    pub average: f64,
    pub grace: f64,
}

/// One fully recomputed result. Every field here is derived; externally
/// owned result columns (publish flag, letter grades) are not represented.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub roll_no: String,
    pub name: String,
    pub division: String,
    pub batch_id: String,
    pub eng: SubjectScore,
    pub eco: SubjectScore,
    pub bk: SubjectScore,
    pub oc: SubjectScore,
    pub opt1: Option<OptionalSlot>,
    pub opt2: Option<OptionalSlot>,
    pub overall_tot: f64,
    pub total_grace: f64,
    pub percentage: f64,
    pub overall_grade: String,
}

#[derive(Debug, Clone, Default)]
pub struct DivisionProjection {
    pub division: String,
    pub batch_id: String,
    pub computed: Vec<ResultRow>,
    /// Roll numbers that failed the completeness gate this run.
    pub incomplete: Vec<String>,
}

/// The exact set of subject codes that must have marks for a student:
/// the four core subjects plus any selected optionals, in slot order.
pub fn required_subjects(student: &StudentRow) -> Vec<String> {
    let mut codes: Vec<String> = CORE_SUBJECT_CODES.iter().map(|c| c.to_string()).collect();
    if let Some(code) = &student.optional_subject {
        codes.push(code.clone());
    }
    if let Some(code) = &student.optional_subject_2 {
        codes.push(code.clone());
    }
    codes
}

pub fn project_division(snapshot: &DivisionSnapshot, config: &EngineConfig) -> DivisionProjection {
    let mut projection = DivisionProjection {
        division: snapshot.division.clone(),
        batch_id: snapshot.batch_id.clone(),
        ..DivisionProjection::default()
    };
    for student in &snapshot.students {
        match project_student(snapshot, student, config) {
            Some(row) => projection.computed.push(row),
            None => projection.incomplete.push(student.roll_no.clone()),
        }
    }
    projection
}

fn project_student(
    snapshot: &DivisionSnapshot,
    student: &StudentRow,
    config: &EngineConfig,
) -> Option<ResultRow> {
    // Completeness gate: every required subject needs a mark row with a
    // usable sub_avg. A code missing from the mark map (including an
    // optional selection that names no catalog subject) is the same miss.
    let mut rounded: Vec<(String, f64)> = Vec::new();
    for code in required_subjects(student) {
        let mark = snapshot
            .marks
            .get(&(student.roll_no.clone(), code.clone()))
            .copied();
        let Some(Some(sub_avg)) = mark else {
            return None;
        };
        // sub_avg arrives already ceiling-rounded at entry time; re-applying
        // ceil guards against fractional values from any other writer.
        rounded.push((code, sub_avg.ceil()));
    }

    let overall_tot: f64 = rounded.iter().map(|(_, m)| m).sum();
    let subject_count = rounded.len();
    let percentage = round_off_2_decimals(overall_tot / subject_count as f64);

    let core = |i: usize| SubjectScore {
        average: rounded[i].1,
        grace: 0.0,
    };
    let mut slot_idx = CORE_SUBJECT_CODES.len();
    let opt1 = student.optional_subject.as_ref().map(|code| {
        let slot = OptionalSlot {
            code: code.clone(),
            average: rounded[slot_idx].1,
            grace: 0.0,
        };
        slot_idx += 1;
        slot
    });
    let opt2 = student.optional_subject_2.as_ref().map(|code| OptionalSlot {
        code: code.clone(),
        average: rounded[slot_idx].1,
        grace: 0.0,
    });

    let mut row = ResultRow {
        roll_no: student.roll_no.clone(),
        name: student.name.clone(),
        division: snapshot.division.clone(),
        batch_id: snapshot.batch_id.clone(),
        eng: core(0),
        eco: core(1),
        bk: core(2),
        oc: core(3),
        opt1,
        opt2,
        overall_tot,
        total_grace: 0.0,
        percentage,
        overall_grade: String::new(),
    };

    let failing: Vec<(String, f64)> = rounded
        .iter()
        .filter(|(_, mark)| *mark < PASS_MARK)
        .cloned()
        .collect();

    if failing.is_empty() {
        row.overall_grade = grade_for_percentage(percentage).to_string();
        if row.overall_grade == "Grade II" {
            if let Some(deficit) =
                promotion_deficit(config.promotion_window, overall_tot, subject_count)
            {
                row.total_grace = deficit;
                row.overall_grade = "Grade I".to_string();
            }
        }
    } else {
        match allocate_condonation(&failing, config.grace_allocation) {
            Some(grants) => {
                // Grace is advisory on top of the raw totals: percentage
                // and overall_tot stay exactly as aggregated.
                row.total_grace = grants.values().sum();
                row.overall_grade = GRADE_CONDONED.to_string();
                apply_grants(&mut row, &grants);
            }
            None => {
                row.overall_grade = "Fail".to_string();
            }
        }
    }

    Some(row)
}

/// Grace needed per failing subject, or `None` when the student is not
/// eligible: more than 3 failing subjects, any single deficit above 10, or
/// a combined deficit above 15. Each eligible subject receives exactly the
/// marks it is short of 35.
fn allocate_condonation(
    failing: &[(String, f64)],
    allocation: GraceAllocation,
) -> Option<HashMap<String, f64>> {
    match allocation {
        GraceAllocation::ExactDeficit => {
            if failing.len() > GRACE_MAX_FAILING_SUBJECTS {
                return None;
            }
            let mut grants = HashMap::new();
            let mut total = 0.0;
            for (code, mark) in failing {
                let deficit = PASS_MARK - mark;
                if deficit > GRACE_MAX_PER_SUBJECT {
                    return None;
                }
                total += deficit;
                grants.insert(code.clone(), deficit);
            }
            if total > GRACE_MAX_TOTAL {
                return None;
            }
            Some(grants)
        }
    }
}

fn apply_grants(row: &mut ResultRow, grants: &HashMap<String, f64>) {
    for (code, grace) in grants {
        match code.as_str() {
            "ENG" => row.eng.grace = *grace,
            "ECO" => row.eco.grace = *grace,
            "BK" => row.bk.grace = *grace,
            "OC" => row.oc.grace = *grace,
            _ => {
                if let Some(slot) = row.opt1.as_mut().filter(|s| s.code == *code) {
                    slot.grace = *grace;
                } else if let Some(slot) = row.opt2.as_mut().filter(|s| s.code == *code) {
                    slot.grace = *grace;
                }
            }
        }
    }
}

/// Grace needed to lift `overall_tot` to the promotion target, when the
/// total sits inside the closed 3-mark window just below it.
pub fn promotion_deficit(
    window: PromotionWindow,
    overall_tot: f64,
    subject_count: usize,
) -> Option<f64> {
    let target = match window {
        PromotionWindow::FixedSixSubject => 360.0,
        PromotionWindow::ScaledToSubjectCount => {
            (0.6 * (subject_count as f64) * 100.0).round()
        }
    };
    if overall_tot >= target - 3.0 && overall_tot <= target - 1.0 {
        Some(target - overall_tot)
    } else {
        None
    }
}
