//! Merges nested client submissions (`offering -> student -> date|period -> value`)
//! into grade and attendance records.
//!
//! The nested JSON is flattened into explicit [`RawLeaf`] tuples at the boundary.
//! Every leaf is validated and written on its own: a bad leaf is counted and
//! skipped, the rest of the batch still lands. Only request-level problems
//! (payload shape, missing teacher session) stop the batch before any write.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Persistence operations the reconciler needs. Writes are keyed by the natural
/// composite key, so replaying an entry is harmless.
pub trait RecordStore {
    fn offering_teacher(&self, offering_id: i64) -> anyhow::Result<Option<i64>>;
    fn is_rostered(&self, offering_id: i64, student_id: i64) -> anyhow::Result<bool>;
    fn period_attached(&self, offering_id: i64, period_id: i64) -> anyhow::Result<bool>;
    fn upsert_grade(&self, g: &GradeWrite) -> anyhow::Result<()>;
    fn upsert_attendance(&self, a: &AttendanceWrite) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeWrite {
    pub student_id: i64,
    pub offering_id: i64,
    pub period_id: i64,
    pub score: f64,
    /// `None` keeps whatever is stored (0 for new rows).
    pub absences: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceWrite {
    pub student_id: i64,
    pub offering_id: i64,
    pub date: NaiveDate,
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ledger {
    Grades,
    Attendance,
}

impl Ledger {
    fn noun(self) -> &'static str {
        match self {
            Ledger::Grades => "grades",
            Ledger::Attendance => "attendance entries",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("data must be an object keyed by offering id")]
    NotAnObject,
    #[error("invalid period id: {0:?}")]
    BadPeriod(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum LeafError {
    #[error("invalid {what} id: {raw:?}")]
    BadKey { what: &'static str, raw: String },
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    BadDate(String),
    #[error("{0}")]
    BadValue(String),
    #[error("offering {0} not found")]
    OfferingNotFound(i64),
    #[error("offering {offering_id} is not assigned to this teacher")]
    Forbidden { offering_id: i64 },
    #[error("student {student_id} is not enrolled in offering {offering_id}")]
    NotEnrolled { offering_id: i64, student_id: i64 },
    #[error("period {period_id} is not attached to offering {offering_id}")]
    PeriodNotAttached { offering_id: i64, period_id: i64 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl LeafError {
    pub fn code(&self) -> &'static str {
        match self {
            LeafError::BadKey { .. } | LeafError::BadDate(_) => "bad_key",
            LeafError::BadValue(_) => "bad_value",
            LeafError::OfferingNotFound(_) => "not_found",
            LeafError::Forbidden { .. } => "forbidden",
            LeafError::NotEnrolled { .. } => "not_enrolled",
            LeafError::PeriodNotAttached { .. } => "period_not_attached",
            LeafError::Storage(_) => "db_error",
        }
    }
}

impl From<anyhow::Error> for LeafError {
    fn from(e: anyhow::Error) -> Self {
        LeafError::Storage(format!("{e:#}"))
    }
}

/// One `(offering, student, key, value)` tuple, still unparsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLeaf {
    pub student: String,
    pub key: String,
    pub value: Value,
}

/// Everything submitted for one offering.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferingBatch {
    pub offering: String,
    pub leaves: Vec<RawLeaf>,
    /// Shape problems found while flattening, as `(student, message)`.
    pub malformed: Vec<(Option<String>, String)>,
}

/// Flattens `{ offering: { student: { key: value } } }`.
pub fn flatten_nested(data: &Value) -> Result<Vec<OfferingBatch>, ReconcileError> {
    let obj = data.as_object().ok_or(ReconcileError::NotAnObject)?;
    let mut out = Vec::with_capacity(obj.len());
    for (offering, students) in obj {
        let mut batch = OfferingBatch {
            offering: offering.clone(),
            leaves: Vec::new(),
            malformed: Vec::new(),
        };
        let Some(students) = students.as_object() else {
            batch
                .malformed
                .push((None, "student map must be an object".to_string()));
            out.push(batch);
            continue;
        };
        for (student, entries) in students {
            let Some(entries) = entries.as_object() else {
                batch.malformed.push((
                    Some(student.clone()),
                    "entries must be an object keyed by date or period".to_string(),
                ));
                continue;
            };
            for (key, value) in entries {
                batch.leaves.push(RawLeaf {
                    student: student.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        out.push(batch);
    }
    Ok(out)
}

/// Flattens the single-period grade form `{ offering: { student: score } }`.
pub fn flatten_single_period(period: &Value, data: &Value) -> Result<Vec<OfferingBatch>, ReconcileError> {
    let period_key = match period {
        Value::Number(n) if n.as_i64().is_some() => n.to_string(),
        Value::String(s) if s.trim().parse::<i64>().is_ok() => s.trim().to_string(),
        other => return Err(ReconcileError::BadPeriod(other.to_string())),
    };
    let obj = data.as_object().ok_or(ReconcileError::NotAnObject)?;
    let mut out = Vec::with_capacity(obj.len());
    for (offering, students) in obj {
        let mut batch = OfferingBatch {
            offering: offering.clone(),
            leaves: Vec::new(),
            malformed: Vec::new(),
        };
        match students.as_object() {
            Some(students) => {
                for (student, value) in students {
                    batch.leaves.push(RawLeaf {
                        student: student.clone(),
                        key: period_key.clone(),
                        value: value.clone(),
                    });
                }
            }
            None => batch
                .malformed
                .push((None, "student map must be an object".to_string())),
        }
        out.push(batch);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryError {
    pub offering: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub processed: usize,
    pub errors: Vec<EntryError>,
    pub unauthorized_offerings: Vec<String>,
}

impl ReconcileReport {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn message(&self, ledger: Ledger) -> String {
        let mut msg = format!("{} {} processed", self.processed, ledger.noun());
        if !self.errors.is_empty() {
            msg.push_str(&format!(", {} errors", self.errors.len()));
        }
        msg
    }

    pub fn to_json(&self, ledger: Ledger) -> Value {
        json!({
            "processed": self.processed,
            "errorCount": self.error_count(),
            "errors": self.errors,
            "unauthorizedOfferings": self.unauthorized_offerings,
            "message": self.message(ledger),
        })
    }

    fn reject(&mut self, offering: &str, leaf: Option<&RawLeaf>, e: &LeafError) {
        warn!(
            offering,
            student = leaf.map(|l| l.student.as_str()),
            key = leaf.map(|l| l.key.as_str()),
            code = e.code(),
            "skipping entry: {e}"
        );
        self.errors.push(EntryError {
            offering: offering.to_string(),
            student: leaf.map(|l| l.student.clone()),
            key: leaf.map(|l| l.key.clone()),
            code: e.code(),
            message: e.to_string(),
        });
    }
}

fn parse_id(what: &'static str, raw: &str) -> Result<i64, LeafError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| LeafError::BadKey {
            what,
            raw: raw.to_string(),
        })
}

/// Checks that `teacher_id` owns the offering named by `raw`.
fn authorize_offering<S: RecordStore + ?Sized>(
    store: &S,
    teacher_id: i64,
    raw: &str,
) -> Result<i64, LeafError> {
    let offering_id = parse_id("offering", raw)?;
    match store.offering_teacher(offering_id)? {
        None => Err(LeafError::OfferingNotFound(offering_id)),
        Some(owner) if owner != teacher_id => Err(LeafError::Forbidden { offering_id }),
        Some(_) => Ok(offering_id),
    }
}

pub fn parse_grade_value(value: &Value) -> Result<(f64, Option<i64>, Option<String>), LeafError> {
    let (score_v, absences_v, notes_v) = match value {
        Value::Number(_) => (Some(value), None, None),
        Value::Object(obj) => (obj.get("score"), obj.get("absences"), obj.get("notes")),
        _ => {
            return Err(LeafError::BadValue(
                "grade must be a number or {score, absences, notes}".to_string(),
            ))
        }
    };

    let score = score_v
        .and_then(|v| v.as_f64())
        .ok_or_else(|| LeafError::BadValue("score must be a number".to_string()))?;
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(LeafError::BadValue(format!(
            "score {score} is outside 0..=100"
        )));
    }

    let absences = match absences_v {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Some(n),
            _ => {
                return Err(LeafError::BadValue(
                    "absences must be a non-negative integer".to_string(),
                ))
            }
        },
    };

    let notes = match notes_v {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => return Err(LeafError::BadValue("notes must be a string".to_string())),
    };

    Ok((score, absences, notes))
}

pub fn parse_attendance_value(value: &Value) -> Result<bool, LeafError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.eq_ignore_ascii_case("present") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("absent") => Ok(false),
        _ => Err(LeafError::BadValue(
            "attendance must be true/false or \"present\"/\"absent\"".to_string(),
        )),
    }
}

pub fn parse_date_key(raw: &str) -> Result<NaiveDate, LeafError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| LeafError::BadDate(raw.to_string()))
}

fn apply_leaf<S: RecordStore + ?Sized>(
    store: &S,
    ledger: Ledger,
    offering_id: i64,
    leaf: &RawLeaf,
) -> Result<(), LeafError> {
    let student_id = parse_id("student", &leaf.student)?;
    match ledger {
        Ledger::Grades => {
            let period_id = parse_id("period", &leaf.key)?;
            let (score, absences, notes) = parse_grade_value(&leaf.value)?;
            if !store.is_rostered(offering_id, student_id)? {
                return Err(LeafError::NotEnrolled {
                    offering_id,
                    student_id,
                });
            }
            if !store.period_attached(offering_id, period_id)? {
                return Err(LeafError::PeriodNotAttached {
                    offering_id,
                    period_id,
                });
            }
            store.upsert_grade(&GradeWrite {
                student_id,
                offering_id,
                period_id,
                score,
                absences,
                notes,
            })?;
        }
        Ledger::Attendance => {
            let date = parse_date_key(&leaf.key)?;
            let present = parse_attendance_value(&leaf.value)?;
            if !store.is_rostered(offering_id, student_id)? {
                return Err(LeafError::NotEnrolled {
                    offering_id,
                    student_id,
                });
            }
            store.upsert_attendance(&AttendanceWrite {
                student_id,
                offering_id,
                date,
                present,
            })?;
        }
    }
    Ok(())
}

/// Applies every batch on behalf of `teacher_id`. Never aborts midway: each
/// failure becomes an [`EntryError`] and the next entry is tried.
pub fn reconcile<S: RecordStore + ?Sized>(
    store: &S,
    teacher_id: i64,
    ledger: Ledger,
    batches: &[OfferingBatch],
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for batch in batches {
        let offering_id = match authorize_offering(store, teacher_id, &batch.offering) {
            Ok(id) => id,
            Err(e) => {
                if matches!(e, LeafError::Forbidden { .. } | LeafError::OfferingNotFound(_)) {
                    report.unauthorized_offerings.push(batch.offering.clone());
                }
                report.reject(&batch.offering, None, &e);
                continue;
            }
        };

        for (student, message) in &batch.malformed {
            let e = LeafError::BadValue(message.clone());
            match student {
                Some(s) => {
                    let leaf = RawLeaf {
                        student: s.clone(),
                        key: String::new(),
                        value: Value::Null,
                    };
                    report.reject(&batch.offering, Some(&leaf), &e);
                }
                None => report.reject(&batch.offering, None, &e),
            }
        }

        for leaf in &batch.leaves {
            match apply_leaf(store, ledger, offering_id, leaf) {
                Ok(()) => {
                    debug!(offering_id, student = %leaf.student, key = %leaf.key, "upserted");
                    report.processed += 1;
                }
                Err(e) => report.reject(&batch.offering, Some(leaf), &e),
            }
        }
    }

    info!(
        teacher_id,
        processed = report.processed,
        errors = report.error_count(),
        "{} reconciled",
        ledger.noun()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MemoryStore {
        owners: HashMap<i64, i64>,
        roster: HashSet<(i64, i64)>,
        periods: HashSet<(i64, i64)>,
        grades: RefCell<HashMap<(i64, i64, i64), GradeWrite>>,
        attendance: RefCell<HashMap<(i64, i64, NaiveDate), bool>>,
    }

    impl RecordStore for MemoryStore {
        fn offering_teacher(&self, offering_id: i64) -> anyhow::Result<Option<i64>> {
            Ok(self.owners.get(&offering_id).copied())
        }
        fn is_rostered(&self, offering_id: i64, student_id: i64) -> anyhow::Result<bool> {
            Ok(self.roster.contains(&(offering_id, student_id)))
        }
        fn period_attached(&self, offering_id: i64, period_id: i64) -> anyhow::Result<bool> {
            Ok(self.periods.contains(&(offering_id, period_id)))
        }
        fn upsert_grade(&self, g: &GradeWrite) -> anyhow::Result<()> {
            let mut grades = self.grades.borrow_mut();
            let key = (g.student_id, g.offering_id, g.period_id);
            let merged = match grades.get(&key) {
                Some(prev) => GradeWrite {
                    absences: g.absences.or(prev.absences),
                    notes: g.notes.clone().or_else(|| prev.notes.clone()),
                    ..g.clone()
                },
                None => g.clone(),
            };
            grades.insert(key, merged);
            Ok(())
        }
        fn upsert_attendance(&self, a: &AttendanceWrite) -> anyhow::Result<()> {
            self.attendance
                .borrow_mut()
                .insert((a.student_id, a.offering_id, a.date), a.present);
            Ok(())
        }
    }

    fn store() -> MemoryStore {
        let mut s = MemoryStore::default();
        s.owners.insert(10, 1);
        s.owners.insert(20, 2);
        for student in [100, 101, 102] {
            s.roster.insert((10, student));
        }
        s.periods.insert((10, 7));
        s
    }

    #[test]
    fn flatten_nested_rejects_non_object_payload() {
        assert_eq!(
            flatten_nested(&json!([1, 2])),
            Err(ReconcileError::NotAnObject)
        );
    }

    #[test]
    fn flatten_nested_records_malformed_student_maps() {
        let batches = flatten_nested(&json!({
            "10": { "100": { "2025-03-01": true }, "101": 5 }
        }))
        .expect("flatten");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].leaves.len(), 1);
        assert_eq!(batches[0].malformed.len(), 1);
        assert_eq!(batches[0].malformed[0].0.as_deref(), Some("101"));
    }

    #[test]
    fn same_attendance_key_twice_keeps_latest_value() {
        let s = store();
        let first = flatten_nested(&json!({ "10": { "100": { "2025-03-01": true } } })).unwrap();
        let second = flatten_nested(&json!({ "10": { "100": { "2025-03-01": false } } })).unwrap();
        reconcile(&s, 1, Ledger::Attendance, &first);
        let report = reconcile(&s, 1, Ledger::Attendance, &second);
        assert_eq!(report.processed, 1);
        let rows = s.attendance.borrow();
        assert_eq!(rows.len(), 1);
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(rows.get(&(100, 10, date)), Some(&false));
    }

    #[test]
    fn invalid_student_id_is_counted_and_skipped() {
        let s = store();
        let batches = flatten_nested(&json!({
            "10": {
                "100": { "2025-03-01": true },
                "abc": { "2025-03-01": true },
                "101": { "2025-03-01": false }
            }
        }))
        .unwrap();
        let report = reconcile(&s, 1, Ledger::Attendance, &batches);
        assert_eq!(report.processed, 2);
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.errors[0].code, "bad_key");
        assert_eq!(s.attendance.borrow().len(), 2);
        assert_eq!(report.message(Ledger::Attendance), "2 attendance entries processed, 1 errors");
    }

    #[test]
    fn foreign_offering_writes_nothing() {
        let s = store();
        let batches = flatten_nested(&json!({
            "20": { "100": { "2025-03-01": true } }
        }))
        .unwrap();
        let report = reconcile(&s, 1, Ledger::Attendance, &batches);
        assert_eq!(report.processed, 0);
        assert_eq!(report.unauthorized_offerings, vec!["20".to_string()]);
        assert_eq!(report.errors[0].code, "forbidden");
        assert!(s.attendance.borrow().is_empty());
    }

    #[test]
    fn grade_resubmission_keeps_absences_and_notes() {
        let s = store();
        let first = flatten_nested(&json!({
            "10": { "100": { "7": { "score": 8.0, "absences": 2, "notes": "late work" } } }
        }))
        .unwrap();
        let second = flatten_single_period(&json!(7), &json!({ "10": { "100": 9.5 } })).unwrap();
        reconcile(&s, 1, Ledger::Grades, &first);
        reconcile(&s, 1, Ledger::Grades, &second);
        let grades = s.grades.borrow();
        let g = grades.get(&(100, 10, 7)).expect("grade row");
        assert_eq!(g.score, 9.5);
        assert_eq!(g.absences, Some(2));
        assert_eq!(g.notes.as_deref(), Some("late work"));
    }

    #[test]
    fn grade_rules_reject_bad_period_and_score() {
        let s = store();
        let batches = flatten_nested(&json!({
            "10": {
                "100": { "8": 9.0, "7": 120.0 },
                "102": { "x": 7.0 },
                "999": { "7": 6.0 }
            }
        }))
        .unwrap();
        let report = reconcile(&s, 1, Ledger::Grades, &batches);
        assert_eq!(report.processed, 0);
        let mut codes: Vec<&str> = report.errors.iter().map(|e| e.code).collect();
        codes.sort();
        assert_eq!(
            codes,
            vec!["bad_key", "bad_value", "not_enrolled", "period_not_attached"]
        );
    }

    #[test]
    fn single_period_form_requires_numeric_period() {
        assert!(matches!(
            flatten_single_period(&json!("first"), &json!({})),
            Err(ReconcileError::BadPeriod(_))
        ));
    }
}
