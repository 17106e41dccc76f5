//! Health tool handlers: logging measurements and summarizing them.
//!
//! All range validation happens here; the store accepts whatever it is
//! given. Mood is categorical on the wire and numeric in the store
//! (stressed=1 … great=5); this module owns the mapping in both directions.

use serde_json::{json, Map, Value};

use super::{arg_date, arg_f64, arg_i64, arg_str, days_back, round2, today_start, ToolResult};
use crate::error::ToolError;
use crate::store::Store;

pub(crate) const MOOD_LABELS: [(&str, f64); 5] = [
    ("stressed", 1.0),
    ("tired", 2.0),
    ("okay", 3.0),
    ("good", 4.0),
    ("great", 5.0),
];

pub(crate) fn mood_code(label: &str) -> Option<f64> {
    MOOD_LABELS.iter().find(|(l, _)| *l == label).map(|(_, c)| *c)
}

pub(crate) fn mood_label(code: f64) -> &'static str {
    let idx = (code.round().clamp(1.0, 5.0) as usize) - 1;
    MOOD_LABELS[idx].0
}

fn check_range(name: &str, value: f64, lo: f64, hi: f64) -> Result<f64, ToolError> {
    if value < lo || value > hi {
        return Err(ToolError::Validation(format!(
            "'{}' must be between {} and {}, got {}",
            name, lo, hi, value
        )));
    }
    Ok(value)
}

/// Pull validated (metric, value) pairs out of the argument map.
fn collect_metrics(args: &Value) -> Result<Vec<(&'static str, f64)>, ToolError> {
    let mut metrics = Vec::new();

    if let Some(v) = arg_f64(args, "sleep_hours")? {
        metrics.push(("sleep_hours", check_range("sleep_hours", v, 3.0, 12.0)?));
    }
    if let Some(v) = arg_i64(args, "steps")? {
        metrics.push(("steps", check_range("steps", v as f64, 0.0, 20_000.0)?));
    }
    if let Some(v) = arg_i64(args, "heart_rate")? {
        metrics.push(("heart_rate", check_range("heart_rate", v as f64, 40.0, 120.0)?));
    }
    if let Some(label) = arg_str(args, "mood")? {
        let code = mood_code(label).ok_or_else(|| {
            ToolError::Validation(format!(
                "'mood' must be one of great, good, okay, tired, stressed; got '{}'",
                label
            ))
        })?;
        metrics.push(("mood", code));
    }
    if let Some(v) = arg_f64(args, "weight")? {
        metrics.push(("weight", check_range("weight", v, 80.0, 400.0)?));
    }
    if let Some(v) = arg_i64(args, "water")? {
        metrics.push(("water", check_range("water", v as f64, 0.0, 20.0)?));
    }
    if let Some(v) = arg_i64(args, "exercise_minutes")? {
        metrics.push(("exercise_minutes", check_range("exercise_minutes", v as f64, 0.0, 300.0)?));
    }

    Ok(metrics)
}

/// One store insert per provided metric, all in a single transaction.
pub fn log_health(store: &Store, args: &Value) -> ToolResult {
    let metrics = collect_metrics(args)?;
    if metrics.is_empty() {
        return Err(ToolError::Validation(
            "at least one health metric is required (sleep_hours, steps, heart_rate, mood, \
             weight, water, exercise_minutes)"
                .into(),
        ));
    }
    let notes = arg_str(args, "notes")?.unwrap_or_default();
    let (ts, date) = arg_date(args)?;

    let ids = store.transaction(|tx| {
        let mut ids = Map::new();
        for (metric, value) in &metrics {
            let id = tx.log_health(metric, *value, notes, ts)?;
            ids.insert(metric.to_string(), json!(id));
        }
        Ok(ids)
    })?;

    Ok(json!({
        "status": "ok",
        "logged": ids,
        "date": date.format("%Y-%m-%d").to_string(),
    }))
}

/// Aggregated view of everything recorded today.
pub fn get_health_today(store: &Store) -> ToolResult {
    let rows = store.query_health(None, Some(today_start()), None, false)?;
    Ok(json!({
        "date": chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        "entries": rows.len(),
        "metrics": summarize(&rows),
    }))
}

/// Averages per metric over the last N days (default 7).
pub fn get_health_summary(store: &Store, args: &Value) -> ToolResult {
    let days = arg_i64(args, "days")?.unwrap_or(7);
    if days <= 0 {
        return Err(ToolError::Validation("'days' must be positive".into()));
    }
    let rows = store.query_health(None, Some(days_back(days)), None, false)?;
    Ok(json!({
        "days": days,
        "entries": rows.len(),
        "metrics": summarize(&rows),
    }))
}

/// Group rows by metric into `{avg, min, max, count}`; mood reports its most
/// recent label instead of an average.
fn summarize(rows: &[crate::store::HealthLog]) -> Value {
    let mut out = Map::new();
    let mut names: Vec<&str> = rows.iter().map(|r| r.metric.as_str()).collect();
    names.sort_unstable();
    names.dedup();

    for name in names {
        let values: Vec<&crate::store::HealthLog> =
            rows.iter().filter(|r| r.metric == name).collect();
        let count = values.len();
        if name == "mood" {
            let latest = values
                .iter()
                .max_by_key(|r| r.timestamp)
                .map(|r| mood_label(r.value))
                .unwrap_or("okay");
            out.insert(name.to_string(), json!({ "latest": latest, "count": count }));
        } else {
            let sum: f64 = values.iter().map(|r| r.value).sum();
            let min = values.iter().map(|r| r.value).fold(f64::INFINITY, f64::min);
            let max = values.iter().map(|r| r.value).fold(f64::NEG_INFINITY, f64::max);
            out.insert(
                name.to_string(),
                json!({
                    "avg": round2(sum / count as f64),
                    "min": min,
                    "max": max,
                    "count": count,
                }),
            );
        }
    }
    Value::Object(out)
}
