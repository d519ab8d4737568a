mod common;

use common::{seed_school, Sidecar, PASSWORD, TEACHER_A_EMAIL, TEACHER_B_EMAIL};
use serde_json::{json, Value};

fn row_for(summary: &Value, student: i64) -> Value {
    summary["perStudent"]
        .as_array()
        .expect("perStudent")
        .iter()
        .find(|r| r["studentId"] == student)
        .expect("student row")
        .clone()
}

#[test]
fn weighted_average_and_no_data_placeholder() {
    let mut sc = Sidecar::spawn();
    let school = seed_school(&mut sc, "campusd-summary");
    let [s1, s2, s3] = school.students;
    let [p1, p2, p3] = school.periods;
    sc.request_ok("auth.logout", json!({}));
    sc.login("teacher", TEACHER_A_EMAIL, PASSWORD);

    sc.request_ok(
        "grades.reconcile",
        json!({ "data": { school.offering_a.to_string(): {
            s1.to_string(): { p1.to_string(): 9.0, p2.to_string(): 8.0, p3.to_string(): 7.0 },
            s2.to_string(): { p1.to_string(): 9.0 }
        } } }),
    );

    let summary = sc.request_ok("grades.summary", json!({ "offeringId": school.offering_a }));
    assert_eq!(summary["weightTotal"], 100.0);
    assert_eq!(summary["weightsBalanced"], true);
    assert_eq!(summary["offering"]["subjectCode"], "MAT101");
    assert_eq!(summary["periods"].as_array().expect("periods").len(), 3);

    let full = row_for(&summary, s1);
    let avg = full["average"].as_f64().expect("average");
    assert!((avg - 7.9).abs() < 1e-9, "got {}", avg);
    assert_eq!(full["averageDisplay"], "7.90");

    // Missing periods are left out, not counted as zero, and nothing is rescaled.
    let partial = row_for(&summary, s2);
    let avg = partial["average"].as_f64().expect("average");
    assert!((avg - 2.7).abs() < 1e-9, "got {}", avg);

    let empty = row_for(&summary, s3);
    assert!(empty["average"].is_null());
    assert_eq!(empty["averageDisplay"], "-");

    sc.request_ok("auth.logout", json!({}));
    sc.login("teacher", TEACHER_B_EMAIL, PASSWORD);
    assert_eq!(
        sc.request_err("grades.summary", json!({ "offeringId": school.offering_a })),
        "forbidden"
    );
    assert_eq!(
        sc.request_err("grades.summary", json!({ "offeringId": 4040 })),
        "not_found"
    );
}
