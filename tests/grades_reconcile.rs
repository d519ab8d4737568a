mod common;

use common::{seed_school, School, Sidecar, PASSWORD, TEACHER_A_EMAIL, TEACHER_B_EMAIL};
use serde_json::{json, Value};

fn as_teacher_a(prefix: &str) -> (Sidecar, School) {
    let mut sc = Sidecar::spawn();
    let school = seed_school(&mut sc, prefix);
    sc.request_ok("auth.logout", json!({}));
    sc.login("teacher", TEACHER_A_EMAIL, PASSWORD);
    (sc, school)
}

fn stored(grades: &Value, offering: i64, student: i64, period: i64) -> Value {
    grades[offering.to_string()][student.to_string()][period.to_string()].clone()
}

#[test]
fn valid_entries_land_even_when_one_student_id_is_invalid() {
    let (mut sc, school) = as_teacher_a("campusd-grades-partial");
    let [s1, s2, _] = school.students;
    let p1 = school.periods[0].to_string();

    let report = sc.request_ok(
        "grades.reconcile",
        json!({
            "data": {
                school.offering_a.to_string(): {
                    s1.to_string(): { p1.clone(): 9.0 },
                    s2.to_string(): { p1.clone(): 8.5 },
                    "abc": { p1.clone(): 7.0 }
                }
            }
        }),
    );
    assert_eq!(report["processed"], 2);
    assert_eq!(report["errorCount"], 1);
    assert_eq!(report["errors"][0]["code"], "bad_key");
    assert_eq!(report["errors"][0]["student"], "abc");
    assert_eq!(report["message"], "2 grades processed, 1 errors");

    let grades = sc.request_ok("grades.get", json!({}));
    assert_eq!(stored(&grades, school.offering_a, s1, school.periods[0]), 9.0);
    assert_eq!(stored(&grades, school.offering_a, s2, school.periods[0]), 8.5);
}

#[test]
fn offerings_of_other_teachers_are_never_written() {
    let (mut sc, school) = as_teacher_a("campusd-grades-foreign");
    let s1 = school.students[0];

    let report = sc.request_ok(
        "grades.reconcile",
        json!({
            "data": {
                school.offering_b.to_string(): {
                    s1.to_string(): { school.periods[0].to_string(): 10.0 }
                },
                "777": {
                    s1.to_string(): { school.periods[0].to_string(): 10.0 }
                }
            }
        }),
    );
    assert_eq!(report["processed"], 0);
    assert_eq!(report["errorCount"], 2);
    let unauthorized: Vec<&str> = report["unauthorizedOfferings"]
        .as_array()
        .expect("unauthorizedOfferings")
        .iter()
        .map(|v| v.as_str().expect("offering key"))
        .collect();
    assert!(unauthorized.contains(&school.offering_b.to_string().as_str()));
    assert!(unauthorized.contains(&"777"));
    let codes: Vec<&str> = report["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .map(|e| e["code"].as_str().expect("code"))
        .collect();
    assert!(codes.contains(&"forbidden"));
    assert!(codes.contains(&"not_found"));

    sc.request_ok("auth.logout", json!({}));
    sc.login("teacher", TEACHER_B_EMAIL, PASSWORD);
    let grades = sc.request_ok("grades.get", json!({}));
    let offering_b = &grades[school.offering_b.to_string()];
    assert_eq!(offering_b[s1.to_string()], json!({}));
}

#[test]
fn roster_and_period_links_are_enforced_per_entry() {
    let (mut sc, school) = as_teacher_a("campusd-grades-integrity");
    let s1 = school.students[0];

    // Period 4242 exists nowhere, so it is not attached to the offering.
    let report = sc.request_ok(
        "grades.reconcile",
        json!({
            "data": {
                school.offering_a.to_string(): {
                    s1.to_string(): {
                        school.periods[0].to_string(): 9.0,
                        "4242": 8.0,
                        "P2": 8.0,
                        school.periods[1].to_string(): 101.0,
                        school.periods[2].to_string(): "nine"
                    },
                    "9999": { school.periods[0].to_string(): 9.0 },
                    school.students[1].to_string(): "not an object"
                }
            }
        }),
    );
    assert_eq!(report["processed"], 1);
    let mut codes: Vec<String> = report["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .map(|e| e["code"].as_str().expect("code").to_string())
        .collect();
    codes.sort();
    assert_eq!(
        codes,
        vec![
            "bad_key",
            "bad_value",
            "bad_value",
            "bad_value",
            "not_enrolled",
            "period_not_attached"
        ]
    );
    assert_eq!(report["errorCount"], 6);
}

#[test]
fn resubmission_updates_one_record_and_keeps_absences() {
    let (mut sc, school) = as_teacher_a("campusd-grades-upsert");
    let s1 = school.students[0];
    let offering = school.offering_a.to_string();
    let period = school.periods[0].to_string();

    sc.request_ok(
        "grades.reconcile",
        json!({ "data": { offering.clone(): { s1.to_string(): {
            period.clone(): { "score": 6.0, "absences": 2, "notes": "late work" }
        } } } }),
    );
    // Short form: one period for the whole payload.
    let report = sc.request_ok(
        "grades.reconcile",
        json!({
            "periodId": school.periods[0],
            "data": { offering.clone(): { s1.to_string(): 8.0 } }
        }),
    );
    assert_eq!(report["processed"], 1);
    assert_eq!(report["errorCount"], 0);
    assert_eq!(report["message"], "1 grades processed");

    let grades = sc.request_ok("grades.get", json!({ "periodId": school.periods[0] }));
    assert_eq!(stored(&grades, school.offering_a, s1, school.periods[0]), 8.0);

    let summary = sc.request_ok("grades.summary", json!({ "offeringId": school.offering_a }));
    let row = summary["perStudent"]
        .as_array()
        .expect("perStudent")
        .iter()
        .find(|r| r["studentId"] == s1)
        .expect("student row")
        .clone();
    assert_eq!(row["absencesTotal"], 2);
    let scored: Vec<&Value> = row["scores"]
        .as_array()
        .expect("scores")
        .iter()
        .filter(|s| !s["score"].is_null())
        .collect();
    assert_eq!(scored.len(), 1);
}

#[test]
fn request_level_failures_write_nothing() {
    let (mut sc, school) = as_teacher_a("campusd-grades-request");

    assert_eq!(
        sc.request_err("grades.reconcile", json!({ "data": [1, 2, 3] })),
        "bad_params"
    );
    assert_eq!(sc.request_err("grades.reconcile", json!({})), "bad_params");
    assert_eq!(
        sc.request_err(
            "grades.reconcile",
            json!({ "periodId": "first", "data": {} }),
        ),
        "bad_params"
    );

    sc.request_ok("auth.logout", json!({}));
    sc.login("student", &common::student_email(0), PASSWORD);
    assert_eq!(
        sc.request_err(
            "grades.reconcile",
            json!({ "data": { school.offering_a.to_string(): {} } }),
        ),
        "forbidden"
    );
    sc.request_ok("auth.logout", json!({}));
    assert_eq!(
        sc.request_err("grades.reconcile", json!({ "data": {} })),
        "unauthenticated"
    );
}

#[test]
fn admin_can_edit_and_delete_single_grades() {
    let (mut sc, school) = as_teacher_a("campusd-grades-admin-edit");
    let s1 = school.students[0];
    sc.request_ok(
        "grades.reconcile",
        json!({
            "periodId": school.periods[1],
            "data": {
                school.offering_a.to_string(): {
                    s1.to_string(): { "score": 7.0, "absences": 3 }
                }
            }
        }),
    );
    sc.request_ok("auth.logout", json!({}));
    sc.login_admin();

    let report = sc.request_ok("reports.student", json!({ "studentId": s1 }));
    let grade = &report["offerings"][0]["grades"][1];
    assert_eq!(grade["periodId"], school.periods[1]);
    assert_eq!(grade["score"], 7.0);
    let grade_id = grade["gradeId"].as_i64().expect("gradeId");
    assert!(report["offerings"][0]["grades"][0]["gradeId"].is_null());

    sc.request_ok(
        "grades.update",
        json!({ "gradeId": grade_id, "score": 9.5, "absences": null, "notes": "regraded" }),
    );
    assert_eq!(
        sc.request_err("grades.update", json!({ "gradeId": grade_id, "score": -1 })),
        "bad_params"
    );
    let report = sc.request_ok("reports.student", json!({ "studentId": s1 }));
    let grade = &report["offerings"][0]["grades"][1];
    assert_eq!(grade["score"], 9.5);
    assert_eq!(grade["notes"], "regraded");
    assert_eq!(grade["absences"], 3);

    sc.request_ok("grades.update", json!({ "gradeId": grade_id, "absences": 1 }));
    let report = sc.request_ok("reports.student", json!({ "studentId": s1 }));
    let grade = &report["offerings"][0]["grades"][1];
    assert_eq!(grade["absences"], 1);
    assert_eq!(grade["score"], 9.5);

    sc.request_ok("grades.delete", json!({ "gradeId": grade_id }));
    assert_eq!(
        sc.request_err("grades.delete", json!({ "gradeId": grade_id })),
        "not_found"
    );
}
