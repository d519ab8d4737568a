mod common;

use common::{id_of, seed_school, Sidecar, PASSWORD, TEACHER_A_EMAIL, TEACHER_B_EMAIL};
use serde_json::json;

#[test]
fn attached_periods_report_weight_balance_without_normalizing() {
    let mut sc = Sidecar::spawn();
    let school = seed_school(&mut sc, "campusd-periods-weights");

    let periods = sc.request_ok("offerings.periods", json!({ "offeringId": school.offering_a }));
    assert_eq!(periods["weightTotal"], 100.0);
    assert_eq!(periods["weightsBalanced"], true);
    let labels: Vec<&str> = periods["periods"]
        .as_array()
        .expect("periods")
        .iter()
        .map(|p| p["label"].as_str().expect("label"))
        .collect();
    assert_eq!(labels, vec!["P1", "P2", "P3"]);

    // Re-attaching in a new order keeps one link per period.
    let extra = id_of(
        &sc.request_ok(
            "periods.create",
            json!({
                "label": "Extra", "startDate": "2025-01-27", "endDate": "2025-02-07",
                "schoolCycle": "2024-2025", "weightPercent": 10
            }),
        ),
        "periodId",
    );
    let attached = sc.request_ok(
        "offerings.attachPeriods",
        json!({
            "offeringId": school.offering_a,
            "periods": [
                { "periodId": school.periods[2] },
                { "periodId": school.periods[0] },
                { "periodId": school.periods[1] },
                { "periodId": extra }
            ]
        }),
    );
    assert_eq!(attached["created"], 0);
    assert_eq!(attached["weightsBalanced"], false);

    let periods = sc.request_ok("offerings.periods", json!({ "offeringId": school.offering_a }));
    let list = periods["periods"].as_array().expect("periods");
    assert_eq!(list.len(), 4);
    assert_eq!(list[0]["periodId"], school.periods[2]);
    assert_eq!(list[3]["periodId"], extra);
    assert_eq!(periods["weightTotal"], 110.0);
    assert_eq!(periods["weightsBalanced"], false);
}

#[test]
fn period_validation() {
    let mut sc = Sidecar::spawn();
    let school = seed_school(&mut sc, "campusd-periods-validation");

    let base = json!({
        "label": "Bad", "startDate": "2024-10-11", "endDate": "2024-08-26",
        "schoolCycle": "2024-2025", "weightPercent": 30
    });
    assert_eq!(sc.request_err("periods.create", base.clone()), "bad_params");

    let mut heavy = base.clone();
    heavy["startDate"] = json!("2024-08-26");
    heavy["endDate"] = json!("2024-10-11");
    heavy["weightPercent"] = json!(120);
    assert_eq!(sc.request_err("periods.create", heavy), "bad_params");

    let mut bad_date = base;
    bad_date["startDate"] = json!("26/08/2024");
    assert_eq!(sc.request_err("periods.create", bad_date), "bad_params");

    sc.request_ok(
        "periods.update",
        json!({ "periodId": school.periods[0], "label": "First partial", "weightPercent": 25 }),
    );
    let listed = sc.request_ok("periods.list", json!({ "schoolCycle": "2024-2025" }));
    let first = listed["periods"]
        .as_array()
        .expect("periods")
        .iter()
        .find(|p| p["id"] == school.periods[0])
        .expect("updated period")
        .clone();
    assert_eq!(first["label"], "First partial");
    assert_eq!(first["weightPercent"], 25.0);
    assert_eq!(first["startDate"], "2024-08-26");

    assert_eq!(
        sc.request_err(
            "offerings.attachPeriods",
            json!({ "offeringId": school.offering_a, "periods": [{ "periodId": 9999 }] }),
        ),
        "not_found"
    );
    assert_eq!(
        sc.request_err("periods.delete", json!({ "periodId": school.periods[1] })),
        "conflict"
    );
}

#[test]
fn offerings_schedule_and_roster() {
    let mut sc = Sidecar::spawn();
    let school = seed_school(&mut sc, "campusd-offerings-schedule");

    let subjects = sc.request_ok("subjects.list", json!({}));
    let calculus = subjects["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|s| s["code"] == "MAT101")
        .and_then(|s| s["id"].as_i64())
        .expect("calculus");
    assert_eq!(
        sc.request_err(
            "offerings.create",
            json!({ "subjectId": calculus, "teacherId": school.teacher_a, "cycle": "2024-2025" }),
        ),
        "conflict"
    );
    assert_eq!(
        sc.request_err(
            "offerings.create",
            json!({ "subjectId": calculus, "teacherId": school.teacher_b }),
        ),
        "bad_params"
    );
    sc.request_ok(
        "settings.set",
        json!({ "key": "school.currentCycle", "value": "2025-2026" }),
    );
    let next = sc.request_ok(
        "offerings.create",
        json!({ "subjectId": calculus, "teacherId": school.teacher_b }),
    );
    assert_eq!(next["cycle"], "2025-2026");
    // The reassignment is undone when the cycle in the same request is rejected.
    assert_eq!(
        sc.request_err(
            "offerings.update",
            json!({
                "offeringId": id_of(&next, "offeringId"),
                "teacherId": school.teacher_a,
                "cycle": 2026
            }),
        ),
        "bad_params"
    );

    for (weekday, start, end) in [("wednesday", "09:00", "11:00"), ("monday", "07:00", "09:00")] {
        sc.request_ok(
            "schedules.create",
            json!({
                "offeringId": school.offering_a, "weekday": weekday,
                "start": start, "end": end, "room": "B-12"
            }),
        );
    }
    assert_eq!(
        sc.request_err(
            "schedules.create",
            json!({
                "offeringId": school.offering_a, "weekday": "monday",
                "start": "10:00", "end": "09:00", "room": "B-12"
            }),
        ),
        "bad_params"
    );
    assert_eq!(
        sc.request_err(
            "schedules.create",
            json!({
                "offeringId": school.offering_a, "weekday": "funday",
                "start": "08:00", "end": "09:00", "room": "B-12"
            }),
        ),
        "bad_params"
    );

    assert_eq!(
        sc.request_err(
            "offerings.enrollStudent",
            json!({ "offeringId": school.offering_a, "studentId": school.students[0] }),
        ),
        "conflict"
    );
    assert_eq!(
        sc.request_err("offerings.delete", json!({ "offeringId": school.offering_a })),
        "conflict"
    );

    sc.request_ok("auth.logout", json!({}));
    sc.login("teacher", TEACHER_A_EMAIL, PASSWORD);
    let mine = sc.request_ok("offerings.mine", json!({}));
    let mine = mine["offerings"].as_array().expect("offerings");
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0]["id"], school.offering_a);
    assert_eq!(mine[0]["studentCount"], 3);

    let slots = sc.request_ok("schedules.list", json!({ "offeringId": school.offering_a }));
    let days: Vec<&str> = slots["slots"]
        .as_array()
        .expect("slots")
        .iter()
        .map(|s| s["weekday"].as_str().expect("weekday"))
        .collect();
    assert_eq!(days, vec!["monday", "wednesday"]);

    let roster = sc.request_ok("offerings.roster", json!({ "offeringId": school.offering_a }));
    assert_eq!(roster["students"].as_array().expect("students").len(), 3);
    assert_eq!(
        sc.request_err("offerings.roster", json!({ "offeringId": school.offering_b })),
        "forbidden"
    );

    sc.request_ok("auth.logout", json!({}));
    sc.login("teacher", TEACHER_B_EMAIL, PASSWORD);
    let slots = sc.request_ok("schedules.list", json!({}));
    assert!(slots["slots"].as_array().expect("slots").is_empty());
}
