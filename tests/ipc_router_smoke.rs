mod common;

use common::Sidecar;
use serde_json::json;

#[test]
fn health_and_protocol_errors() {
    let mut sc = Sidecar::spawn();

    let health = sc.request_ok("health", json!({}));
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert!(health["workspacePath"].is_null());
    assert!(health["role"].is_null());

    let bad = sc.send_raw("{not json");
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");

    assert_eq!(sc.request_err("nope.method", json!({})), "not_implemented");
    assert_eq!(sc.request_err("careers.list", json!({})), "no_workspace");
    assert_eq!(sc.request_err("workspace.select", json!({})), "bad_params");
}

#[test]
fn every_handler_family_is_routed() {
    let mut sc = Sidecar::spawn();
    let workspace = sc.open_workspace("campusd-router-smoke");
    assert!(workspace.join("campus.sqlite3").is_file());

    // Without a session every gated method answers `unauthenticated`, which
    // proves it was routed rather than reported as unknown.
    for method in [
        "settings.get",
        "auth.me",
        "careers.list",
        "subjects.create",
        "teachers.list",
        "students.setStatus",
        "offerings.mine",
        "offerings.roster",
        "schedules.list",
        "periods.list",
        "offerings.attachPeriods",
        "groups.list",
        "enrollments.create",
        "grades.reconcile",
        "grades.summary",
        "attendance.reconcile",
        "attendance.get",
        "reports.me",
        "stats.overview",
    ] {
        assert_eq!(sc.request_err(method, json!({})), "unauthenticated", "{}", method);
    }

    let logout = sc.request_ok("auth.logout", json!({}));
    assert_eq!(logout["loggedOut"], false);
}
