use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

/// Placeholder shown instead of an average when nothing has been graded.
pub const NO_DATA: &str = "-";

const WEIGHT_EPSILON: f64 = 1e-9;

/// Weighted final average: `Σ score_i × weight_i / 100` over the periods that
/// have a score. Periods without a score are left out (not counted as zero).
/// Weights are used as given, even when they do not add up to 100.
///
/// Returns `None` when no period has a score.
pub fn weighted_average<I>(pairs: I) -> Option<f64>
where
    I: IntoIterator<Item = (Option<f64>, f64)>,
{
    let mut sum = 0.0_f64;
    let mut graded = 0_usize;
    for (score, weight_percent) in pairs {
        let Some(score) = score else {
            continue;
        };
        sum += score * weight_percent / 100.0;
        graded += 1;
    }
    if graded == 0 {
        None
    } else {
        Some(sum)
    }
}

pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn display_average(avg: Option<f64>) -> String {
    match avg {
        Some(v) => format!("{:.2}", v),
        None => NO_DATA.to_string(),
    }
}

pub fn weights_balanced(total: f64) -> bool {
    (total - 100.0).abs() < WEIGHT_EPSILON
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for CalcError {
    fn from(e: rusqlite::Error) -> Self {
        CalcError::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferingHeader {
    pub id: i64,
    pub subject_id: i64,
    pub subject_name: String,
    pub subject_code: String,
    pub teacher_id: i64,
    pub teacher_name: String,
    pub cycle: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodDef {
    pub period_id: i64,
    pub label: String,
    pub start_date: String,
    pub end_date: String,
    pub school_cycle: String,
    pub weight_percent: f64,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSlot {
    pub id: i64,
    pub weekday: String,
    pub start: String,
    pub end: String,
    pub room: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub student_id: i64,
    pub display_name: String,
    pub enrollment_no: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodScore {
    pub period_id: i64,
    pub grade_id: Option<i64>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverage {
    pub student_id: i64,
    pub display_name: String,
    pub enrollment_no: String,
    pub scores: Vec<PeriodScore>,
    pub absences_total: i64,
    pub average: Option<f64>,
    pub average_display: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferingSummary {
    pub offering: OfferingHeader,
    pub periods: Vec<PeriodDef>,
    pub weight_total: f64,
    pub weights_balanced: bool,
    #[serde(rename = "perStudent")]
    pub per_student: Vec<StudentAverage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGrade {
    pub period_id: i64,
    pub grade_id: Option<i64>,
    pub label: String,
    pub weight_percent: f64,
    pub score: Option<f64>,
    pub absences: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub present: i64,
    pub absent: i64,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOffering {
    pub offering: OfferingHeader,
    pub schedule: Vec<ScheduleSlot>,
    pub grades: Vec<ReportGrade>,
    pub weight_total: f64,
    pub average: Option<f64>,
    pub average_display: String,
    pub attendance: AttendanceTally,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHeader {
    pub id: i64,
    pub display_name: String,
    pub enrollment_no: String,
    pub email: String,
    pub career_name: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student: StudentHeader,
    pub offerings: Vec<ReportOffering>,
}

pub fn load_offering_header(conn: &Connection, offering_id: i64) -> Result<Option<OfferingHeader>, CalcError> {
    Ok(conn
        .query_row(
            "SELECT o.id, s.id, s.name, s.code, t.id, t.first_name, t.last_name, o.cycle
             FROM offerings o
             JOIN subjects s ON s.id = o.subject_id
             JOIN teachers t ON t.id = o.teacher_id
             WHERE o.id = ?",
            [offering_id],
            |r| {
                let first: String = r.get(5)?;
                let last: String = r.get(6)?;
                Ok(OfferingHeader {
                    id: r.get(0)?,
                    subject_id: r.get(1)?,
                    subject_name: r.get(2)?,
                    subject_code: r.get(3)?,
                    teacher_id: r.get(4)?,
                    teacher_name: format!("{} {}", first, last),
                    cycle: r.get(7)?,
                })
            },
        )
        .optional()?)
}

pub fn load_offering_periods(conn: &Connection, offering_id: i64) -> Result<Vec<PeriodDef>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.label, p.start_date, p.end_date, p.school_cycle, p.weight_percent, op.sort_order
         FROM offering_periods op
         JOIN evaluation_periods p ON p.id = op.period_id
         WHERE op.offering_id = ?
         ORDER BY op.sort_order, p.start_date",
    )?;
    let rows = stmt
        .query_map([offering_id], |r| {
            Ok(PeriodDef {
                period_id: r.get(0)?,
                label: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
                school_cycle: r.get(4)?,
                weight_percent: r.get(5)?,
                sort_order: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_schedule(conn: &Connection, offering_id: i64) -> Result<Vec<ScheduleSlot>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT id, weekday, start_time, end_time, room
         FROM schedule_slots
         WHERE offering_id = ?
         ORDER BY CASE weekday
           WHEN 'monday' THEN 1 WHEN 'tuesday' THEN 2 WHEN 'wednesday' THEN 3
           WHEN 'thursday' THEN 4 WHEN 'friday' THEN 5 WHEN 'saturday' THEN 6
           ELSE 7 END, start_time",
    )?;
    let rows = stmt
        .query_map([offering_id], |r| {
            Ok(ScheduleSlot {
                id: r.get(0)?,
                weekday: r.get(1)?,
                start: r.get(2)?,
                end: r.get(3)?,
                room: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_roster(conn: &Connection, offering_id: i64) -> Result<Vec<RosterStudent>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.enrollment_no, s.active
         FROM offering_students os
         JOIN students s ON s.id = os.student_id
         WHERE os.offering_id = ?
         ORDER BY s.last_name, s.first_name, s.id",
    )?;
    let rows = stmt
        .query_map([offering_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterStudent {
                student_id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                enrollment_no: r.get(3)?,
                active: r.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

struct GradeRow {
    id: i64,
    score: f64,
    absences: i64,
    notes: Option<String>,
}

/// Period grades for one offering, keyed by `(student_id, period_id)`.
fn load_grade_rows(conn: &Connection, offering_id: i64) -> Result<HashMap<(i64, i64), GradeRow>, CalcError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, period_id, id, score, absences, notes
         FROM grades
         WHERE offering_id = ?",
    )?;
    let rows = stmt
        .query_map([offering_id], |r| {
            Ok((
                (r.get::<_, i64>(0)?, r.get::<_, i64>(1)?),
                GradeRow {
                    id: r.get(2)?,
                    score: r.get(3)?,
                    absences: r.get(4)?,
                    notes: r.get(5)?,
                },
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn offering_summary(conn: &Connection, offering_id: i64) -> Result<OfferingSummary, CalcError> {
    let Some(offering) = load_offering_header(conn, offering_id)? else {
        return Err(CalcError::new("not_found", "offering not found"));
    };
    let periods = load_offering_periods(conn, offering_id)?;
    let roster = load_roster(conn, offering_id)?;
    let grades = load_grade_rows(conn, offering_id)?;
    let weight_total: f64 = periods.iter().map(|p| p.weight_percent).sum();

    let per_student = roster
        .into_iter()
        .map(|s| {
            let scores: Vec<PeriodScore> = periods
                .iter()
                .map(|p| {
                    let row = grades.get(&(s.student_id, p.period_id));
                    PeriodScore {
                        period_id: p.period_id,
                        grade_id: row.map(|g| g.id),
                        score: row.map(|g| g.score),
                    }
                })
                .collect();
            let absences_total = periods
                .iter()
                .filter_map(|p| grades.get(&(s.student_id, p.period_id)).map(|g| g.absences))
                .sum();
            let average = weighted_average(
                scores
                    .iter()
                    .zip(periods.iter())
                    .map(|(sc, p)| (sc.score, p.weight_percent)),
            );
            StudentAverage {
                student_id: s.student_id,
                display_name: s.display_name,
                enrollment_no: s.enrollment_no,
                scores,
                absences_total,
                average,
                average_display: display_average(average),
            }
        })
        .collect();

    Ok(OfferingSummary {
        offering,
        periods,
        weight_total,
        weights_balanced: weights_balanced(weight_total),
        per_student,
    })
}

fn attendance_tally(conn: &Connection, offering_id: i64, student_id: i64) -> Result<AttendanceTally, CalcError> {
    let (present, absent): (i64, i64) = conn.query_row(
        "SELECT
           COALESCE(SUM(CASE WHEN present != 0 THEN 1 ELSE 0 END), 0),
           COALESCE(SUM(CASE WHEN present = 0 THEN 1 ELSE 0 END), 0)
         FROM attendance
         WHERE offering_id = ? AND student_id = ?",
        (offering_id, student_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let total = present + absent;
    let rate = if total > 0 {
        Some(round_2_decimals(100.0 * present as f64 / total as f64))
    } else {
        None
    };
    Ok(AttendanceTally {
        present,
        absent,
        rate,
    })
}

pub fn student_report(conn: &Connection, student_id: i64) -> Result<StudentReport, CalcError> {
    let student = conn
        .query_row(
            "SELECT s.id, s.last_name, s.first_name, s.enrollment_no, s.email, c.name, s.active
             FROM students s
             LEFT JOIN careers c ON c.id = s.career_id
             WHERE s.id = ?",
            [student_id],
            |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(StudentHeader {
                    id: r.get(0)?,
                    display_name: format!("{}, {}", last, first),
                    enrollment_no: r.get(3)?,
                    email: r.get(4)?,
                    career_name: r.get(5)?,
                    active: r.get::<_, i64>(6)? != 0,
                })
            },
        )
        .optional()?;
    let Some(student) = student else {
        return Err(CalcError::new("not_found", "student not found"));
    };

    let mut stmt = conn.prepare(
        "SELECT os.offering_id
         FROM offering_students os
         JOIN offerings o ON o.id = os.offering_id
         WHERE os.student_id = ?
         ORDER BY o.cycle DESC, o.id",
    )?;
    let offering_ids = stmt
        .query_map([student_id], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut offerings = Vec::with_capacity(offering_ids.len());
    for offering_id in offering_ids {
        let Some(offering) = load_offering_header(conn, offering_id)? else {
            continue;
        };
        let periods = load_offering_periods(conn, offering_id)?;
        let grade_rows = load_grade_rows(conn, offering_id)?;
        let grades: Vec<ReportGrade> = periods
            .iter()
            .map(|p| {
                let row = grade_rows.get(&(student_id, p.period_id));
                ReportGrade {
                    period_id: p.period_id,
                    label: p.label.clone(),
                    weight_percent: p.weight_percent,
                    grade_id: row.map(|g| g.id),
                    score: row.map(|g| g.score),
                    absences: row.map(|g| g.absences),
                    notes: row.and_then(|g| g.notes.clone()),
                }
            })
            .collect();
        let average = weighted_average(grades.iter().map(|g| (g.score, g.weight_percent)));
        offerings.push(ReportOffering {
            schedule: load_schedule(conn, offering_id)?,
            weight_total: periods.iter().map(|p| p.weight_percent).sum(),
            attendance: attendance_tally(conn, offering_id, student_id)?,
            offering,
            grades,
            average,
            average_display: display_average(average),
        });
    }

    Ok(StudentReport { student, offerings })
}
