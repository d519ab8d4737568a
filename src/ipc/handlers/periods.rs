use crate::auth::Session;
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    begin, commit, delete_by_id, dispatch, ensure_exists, ensure_offering_access, get_optional_f64,
    get_optional_i64, get_optional_str, get_required_i64, get_required_str, parse_iso_date,
    ADMIN, ANY_ROLE, STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct PeriodInput {
    label: String,
    start_date: String,
    end_date: String,
    school_cycle: String,
    weight_percent: f64,
}

fn check_weight(weight: f64) -> Result<f64, HandlerErr> {
    if !(0.0..=100.0).contains(&weight) {
        return Err(HandlerErr::bad_params("weightPercent must be between 0 and 100"));
    }
    Ok(weight)
}

fn check_range(start: &str, end: &str) -> Result<(String, String), HandlerErr> {
    let s = parse_iso_date("startDate", start)?;
    let e = parse_iso_date("endDate", end)?;
    if s > e {
        return Err(HandlerErr::bad_params("startDate must not be after endDate"));
    }
    Ok((s.format("%Y-%m-%d").to_string(), e.format("%Y-%m-%d").to_string()))
}

fn parse_period_input(params: &serde_json::Value) -> Result<PeriodInput, HandlerErr> {
    let label = get_required_str(params, "label")?;
    let (start_date, end_date) = check_range(
        &get_required_str(params, "startDate")?,
        &get_required_str(params, "endDate")?,
    )?;
    let school_cycle = get_required_str(params, "schoolCycle")?;
    let weight_percent = get_optional_f64(params, "weightPercent")?
        .ok_or_else(|| HandlerErr::bad_params("missing weightPercent"))?;
    Ok(PeriodInput {
        label,
        start_date,
        end_date,
        school_cycle,
        weight_percent: check_weight(weight_percent)?,
    })
}

fn insert_period(conn: &Connection, p: &PeriodInput) -> Result<i64, HandlerErr> {
    conn.execute(
        "INSERT INTO evaluation_periods(label, start_date, end_date, school_cycle, weight_percent)
         VALUES(?, ?, ?, ?, ?)",
        (
            &p.label,
            &p.start_date,
            &p.end_date,
            &p.school_cycle,
            p.weight_percent,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(conn.last_insert_rowid())
}

fn periods_list(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, label, start_date, end_date, school_cycle, weight_percent
         FROM evaluation_periods",
    );
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(cycle) = get_optional_str(params, "schoolCycle")?.filter(|s| !s.is_empty()) {
        sql.push_str(" WHERE school_cycle = ?");
        args.push(SqlValue::Text(cycle));
    }
    sql.push_str(" ORDER BY start_date, id");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let periods = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "label": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "schoolCycle": r.get::<_, String>(4)?,
                "weightPercent": r.get::<_, f64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "periods": periods }))
}

fn periods_create(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let input = parse_period_input(params)?;
    let period_id = insert_period(conn, &input)?;
    info!(period_id, label = %input.label, "period created");
    Ok(json!({ "periodId": period_id }))
}

fn periods_update(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_i64(params, "periodId")?;
    let current = conn
        .query_row(
            "SELECT label, start_date, end_date, school_cycle, weight_percent
             FROM evaluation_periods WHERE id = ?",
            [period_id],
            |r| {
                Ok(PeriodInput {
                    label: r.get(0)?,
                    start_date: r.get(1)?,
                    end_date: r.get(2)?,
                    school_cycle: r.get(3)?,
                    weight_percent: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("period not found"))?;

    let label = get_optional_str(params, "label")?
        .filter(|s| !s.is_empty())
        .unwrap_or(current.label);
    let start = get_optional_str(params, "startDate")?.unwrap_or(current.start_date);
    let end = get_optional_str(params, "endDate")?.unwrap_or(current.end_date);
    let (start_date, end_date) = check_range(&start, &end)?;
    let school_cycle = get_optional_str(params, "schoolCycle")?
        .filter(|s| !s.is_empty())
        .unwrap_or(current.school_cycle);
    let weight_percent = match get_optional_f64(params, "weightPercent")? {
        Some(w) => check_weight(w)?,
        None => current.weight_percent,
    };

    conn.execute(
        "UPDATE evaluation_periods
         SET label = ?, start_date = ?, end_date = ?, school_cycle = ?, weight_percent = ?
         WHERE id = ?",
        (
            &label,
            &start_date,
            &end_date,
            &school_cycle,
            weight_percent,
            period_id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn periods_delete(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_i64(params, "periodId")?;
    delete_by_id(conn, "evaluation_periods", period_id, "period")
}

/// Links periods to an offering in the order given, creating inline ones.
fn offerings_attach_periods(conn: &Connection, _: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_exists(conn, "offerings", offering_id, "offering")?;
    let Some(items) = params.get("periods").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing periods"));
    };

    let tx = begin(conn)?;
    let mut attached: Vec<i64> = Vec::with_capacity(items.len());
    let mut created = 0usize;
    for (idx, item) in items.iter().enumerate() {
        let period_id = match get_optional_i64(item, "periodId")? {
            Some(id) => {
                ensure_exists(&tx, "evaluation_periods", id, "period")
                    .map_err(|e| e.with_details(json!({ "index": idx })))?;
                id
            }
            None => {
                let input = parse_period_input(item)
                    .map_err(|e| e.with_details(json!({ "index": idx })))?;
                created += 1;
                insert_period(&tx, &input)?
            }
        };
        tx.execute(
            "INSERT INTO offering_periods(offering_id, period_id, sort_order)
             VALUES(?, ?, ?)
             ON CONFLICT(offering_id, period_id) DO UPDATE SET
               sort_order = excluded.sort_order",
            (offering_id, period_id, idx as i64),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
        attached.push(period_id);
    }
    commit(tx)?;

    let weight_total: f64 = calc::load_offering_periods(conn, offering_id)?
        .iter()
        .map(|p| p.weight_percent)
        .sum();
    warn_if_unbalanced(offering_id, weight_total);
    info!(offering_id, attached = attached.len(), created, "periods attached");
    Ok(json!({
        "periodIds": attached,
        "created": created,
        "weightTotal": weight_total,
        "weightsBalanced": calc::weights_balanced(weight_total),
    }))
}

fn warn_if_unbalanced(offering_id: i64, weight_total: f64) {
    if !calc::weights_balanced(weight_total) {
        warn!(offering_id, weight_total, "period weights do not add up to 100");
    }
}

fn offerings_periods(conn: &Connection, session: &Session, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let offering_id = get_required_i64(params, "offeringId")?;
    ensure_offering_access(conn, session, offering_id)?;
    let periods = calc::load_offering_periods(conn, offering_id)?;
    let weight_total: f64 = periods.iter().map(|p| p.weight_percent).sum();
    warn_if_unbalanced(offering_id, weight_total);
    Ok(json!({
        "offeringId": offering_id,
        "periods": periods,
        "weightTotal": weight_total,
        "weightsBalanced": calc::weights_balanced(weight_total),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "periods.list" => dispatch(state, req, ANY_ROLE, periods_list),
        "periods.create" => dispatch(state, req, ADMIN, periods_create),
        "periods.update" => dispatch(state, req, ADMIN, periods_update),
        "periods.delete" => dispatch(state, req, ADMIN, periods_delete),
        "offerings.attachPeriods" => dispatch(state, req, ADMIN, offerings_attach_periods),
        "offerings.periods" => dispatch(state, req, STAFF, offerings_periods),
        _ => return None,
    };
    Some(resp)
}
