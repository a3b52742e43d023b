use crate::db;
use crate::engine::{self, EngineConfig, PromotionWindow};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::Connection;
use serde_json::json;

const PROMOTION_WINDOW_SETTING: &str = "results.promotion_window";

/// The active engine configuration for a workspace. Missing or
/// unparseable settings fall back to the defaults.
fn engine_config(conn: &Connection) -> EngineConfig {
    let mut config = EngineConfig::default();
    if let Ok(Some(value)) = db::settings_get_json(conn, PROMOTION_WINDOW_SETTING) {
        if let Some(s) = value.get("promotionWindow").and_then(|v| v.as_str()) {
            if let Some(window) = PromotionWindow::from_setting(s) {
                config.promotion_window = window;
            }
        }
    }
    config
}

fn handle_results_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let division = match req.params.get("division").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing division", None),
    };
    let batch_id = match req.params.get("batchId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing batchId", None),
    };

    let snapshot = match store::load_division_snapshot(conn, &division, &batch_id) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };

    // A division with no students is a no-op success.
    if snapshot.students.is_empty() {
        return ok(
            &req.id,
            json!({ "students": 0, "computed": 0, "incomplete": 0, "invalidated": 0 }),
        );
    }

    let config = engine_config(conn);
    let projection = engine::project_division(&snapshot, &config);
    let stats = match store::commit_division(conn, &projection) {
        Ok(s) => s,
        Err(e) => return err(&req.id, e.code(), e.to_string(), None),
    };

    tracing::info!(
        %division,
        %batch_id,
        students = snapshot.students.len(),
        computed = stats.saved,
        incomplete = projection.incomplete.len(),
        "division results regenerated"
    );

    ok(
        &req.id,
        json!({
            "students": snapshot.students.len(),
            "computed": stats.saved,
            "incomplete": projection.incomplete.len(),
            "invalidated": stats.invalidated,
        }),
    )
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let division = match req.params.get("division").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing division", None),
    };
    let batch_id = match req.params.get("batchId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing batchId", None),
    };

    match store::list_division_results(conn, &division, &batch_id) {
        Ok(rows) => ok(&req.id, json!({ "results": rows })),
        Err(e) => err(&req.id, e.code(), e.to_string(), None),
    }
}

fn handle_results_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let config = engine_config(conn);
    ok(
        &req.id,
        json!({ "promotionWindow": config.promotion_window.as_setting() }),
    )
}

fn handle_results_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let raw = match req.params.get("promotionWindow").and_then(|v| v.as_str()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing promotionWindow", None),
    };
    let Some(window) = PromotionWindow::from_setting(raw) else {
        return err(
            &req.id,
            "bad_params",
            "promotionWindow must be one of: fixed, scaled",
            Some(json!({ "promotionWindow": raw })),
        );
    };

    if let Err(e) = db::settings_set_json(
        conn,
        PROMOTION_WINDOW_SETTING,
        &json!({ "promotionWindow": window.as_setting() }),
    ) {
        return err(&req.id, "db_write_failed", format!("{e:?}"), None);
    }

    ok(&req.id, json!({ "promotionWindow": window.as_setting() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.generate" => Some(handle_results_generate(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        "results.config.get" => Some(handle_results_config_get(state, req)),
        "results.config.update" => Some(handle_results_config_update(state, req)),
        _ => None,
    }
}
