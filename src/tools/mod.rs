//! Tool registry: the catalog of operations the LLM may invoke.
//!
//! The registry is read-only after startup. `definitions()` hands the shared
//! schema slice to the LLM client; `dispatch()` resolves a call by name,
//! checks required keys, runs the handler, and always returns a JSON
//! envelope — success payload, `{"error": …}` for validation problems the
//! model can read and correct, or a generic failure envelope whose detail is
//! only logged.

mod finance;
mod health;
mod insights;

pub(crate) use health::{mood_code, mood_label};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::ToolError;
use crate::store::Store;

pub type ToolResult = Result<Value, ToolError>;

/// Machine-readable description of one tool, in the shape the provider
/// expects (`name`, `description`, JSON-schema `input_schema`).
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Fixed tool catalog bound to the store.
pub struct ToolRegistry {
    store: Arc<Store>,
    specs: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store, specs: catalog() }
    }

    /// Shared immutable tool schemas for the provider request.
    pub fn definitions(&self) -> &[ToolSpec] {
        &self.specs
    }

    /// Dispatch a tool call by name. Always returns valid JSON.
    pub fn dispatch(&self, name: &str, args: &Value) -> String {
        let Some(spec) = self.specs.iter().find(|s| s.name == name) else {
            return json!({ "error": format!("Unknown tool: {}", name) }).to_string();
        };

        if let Err(detail) = check_required(spec, args) {
            return json!({
                "error": format!("Invalid arguments for {}: {}", name, detail)
            })
            .to_string();
        }

        debug!(tool = name, "Dispatching tool call");
        let result = match name {
            "log_health" => health::log_health(&self.store, args),
            "get_health_today" => health::get_health_today(&self.store),
            "get_health_summary" => health::get_health_summary(&self.store, args),
            "track_expense" => finance::track_expense(&self.store, args),
            "get_spending_today" => finance::get_spending_today(&self.store),
            "get_spending_summary" => finance::get_spending_summary(&self.store, args),
            "get_budget_status" => finance::get_budget_status(&self.store, args),
            "calculate_savings_goal" => finance::calculate_savings_goal(args),
            "save_user_insight" => insights::save_user_insight(&self.store, args),
            // The catalog and this match are maintained together.
            _ => Err(ToolError::Internal(format!("no handler for {}", name))),
        };

        match result {
            Ok(value) => value.to_string(),
            Err(ToolError::Validation(detail)) => json!({ "error": detail }).to_string(),
            Err(ToolError::Internal(detail)) => {
                error!(tool = name, %detail, "Tool execution failed");
                json!({
                    "error": "Tool execution failed. Please try again.",
                    "function": name,
                })
                .to_string()
            }
        }
    }
}

fn check_required(spec: &ToolSpec, args: &Value) -> Result<(), String> {
    let required = spec.input_schema["required"].as_array();
    let Some(required) = required else { return Ok(()) };
    for key in required {
        let key = key.as_str().unwrap_or_default();
        if args.get(key).map_or(true, Value::is_null) {
            return Err(format!("missing required field '{}'", key));
        }
    }
    Ok(())
}

fn catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "log_health".into(),
            description: "Record one or more health measurements for a day. Provide any \
                          subset of the metric fields; at least one is required."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sleep_hours": { "type": "number", "description": "Hours slept (3-12)" },
                    "steps": { "type": "integer", "description": "Step count (0-20000)" },
                    "heart_rate": { "type": "integer", "description": "Resting heart rate bpm (40-120)" },
                    "mood": { "type": "string", "enum": ["great", "good", "okay", "tired", "stressed"] },
                    "weight": { "type": "number", "description": "Body weight in pounds (80-400)" },
                    "water": { "type": "integer", "description": "Glasses of water (0-20)" },
                    "exercise_minutes": { "type": "integer", "description": "Exercise minutes (0-300)" },
                    "notes": { "type": "string" },
                    "date": { "type": "string", "description": "YYYY-MM-DD, defaults to today" }
                },
                "required": []
            }),
        },
        ToolSpec {
            name: "get_health_today".into(),
            description: "Summarize all health measurements recorded today.".into(),
            input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        ToolSpec {
            name: "get_health_summary".into(),
            description: "Summarize health measurements over the last N days.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "days": { "type": "integer", "description": "Window in days, default 7" }
                },
                "required": []
            }),
        },
        ToolSpec {
            name: "track_expense".into(),
            description: "Record a single expense.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "amount": { "type": "number", "description": "Amount spent, must be positive" },
                    "category": {
                        "type": "string",
                        "enum": ["food", "transport", "shopping", "health", "entertainment", "utilities"]
                    },
                    "description": { "type": "string" },
                    "date": { "type": "string", "description": "YYYY-MM-DD, defaults to today" }
                },
                "required": ["amount", "category"]
            }),
        },
        ToolSpec {
            name: "get_spending_today".into(),
            description: "Today's expenses grouped by category.".into(),
            input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        ToolSpec {
            name: "get_spending_summary".into(),
            description: "Spending summary over the last N days: totals, daily average, \
                          per-category breakdown, and the most recent items."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "days": { "type": "integer", "description": "Window in days, default 30" },
                    "category": { "type": "string", "description": "Restrict to one category" }
                },
                "required": []
            }),
        },
        ToolSpec {
            name: "get_budget_status".into(),
            description: "Current month spending against a monthly budget, with a \
                          month-end projection."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "monthly_budget": { "type": "number", "description": "Budget in dollars, default 3000" }
                },
                "required": []
            }),
        },
        ToolSpec {
            name: "calculate_savings_goal".into(),
            description: "Compute the monthly savings needed to reach a target amount in a \
                          number of months, and whether that is feasible on a given income."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "target_amount": { "type": "number", "description": "Dollars to save, must be positive" },
                    "target_months": { "type": "integer", "description": "Months to reach the target, must be positive" },
                    "monthly_income": { "type": "number", "description": "Monthly income in dollars, may be zero" }
                },
                "required": ["target_amount", "target_months", "monthly_income"]
            }),
        },
        ToolSpec {
            name: "save_user_insight".into(),
            description: "Persist a durable observation about the user for future turns.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "insight": { "type": "string" }
                },
                "required": ["insight"]
            }),
        },
    ]
}

// ─── Argument helpers shared by handlers ─────────────────────

pub(crate) fn arg_f64(args: &Value, key: &str) -> Result<Option<f64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| ToolError::Validation(format!("'{}' must be a number", key))),
    }
}

pub(crate) fn arg_i64(args: &Value, key: &str) -> Result<Option<i64>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            if let Some(i) = v.as_i64() {
                return Ok(Some(i));
            }
            // Models frequently send integers as floats.
            match v.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Some(f as i64)),
                _ => Err(ToolError::Validation(format!("'{}' must be an integer", key))),
            }
        }
    }
}

pub(crate) fn arg_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| ToolError::Validation(format!("'{}' must be a string", key))),
    }
}

/// Parse an optional `date` argument (`YYYY-MM-DD`) into a midday UTC instant,
/// returning the date actually used.
pub(crate) fn arg_date(args: &Value) -> Result<(Option<DateTime<Utc>>, NaiveDate), ToolError> {
    match arg_str(args, "date")? {
        Some(raw) => {
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ToolError::Validation(format!("'date' must be YYYY-MM-DD, got '{}'", raw))
            })?;
            let ts = Utc
                .from_utc_datetime(&date.and_hms_opt(12, 0, 0).expect("valid time"));
            Ok((Some(ts), date))
        }
        None => Ok((None, Utc::now().date_naive())),
    }
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Start of today, UTC.
pub(crate) fn today_start() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    Utc.from_utc_datetime(&today.and_hms_opt(0, 0, 0).expect("valid time"))
}

/// Start of the window `days` days back from now.
pub(crate) fn days_back(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

/// Start of the current ISO week (Monday 00:00 UTC).
pub(crate) fn week_start() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    let monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
    Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).expect("valid time"))
}

/// Start of the current month (UTC).
pub(crate) fn month_start() -> DateTime<Utc> {
    let today = Utc::now().date_naive();
    let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).expect("valid date");
    Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0).expect("valid time"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn dispatch(reg: &ToolRegistry, name: &str, args: Value) -> Value {
        let raw = reg.dispatch(name, &args);
        serde_json::from_str(&raw).expect("dispatch must return valid JSON")
    }

    #[test]
    fn unknown_tool_envelope() {
        let reg = registry();
        let out = dispatch(&reg, "frobnicate", json!({}));
        assert_eq!(out, json!({ "error": "Unknown tool: frobnicate" }));
    }

    #[test]
    fn missing_required_key_envelope() {
        let reg = registry();
        let out = dispatch(&reg, "track_expense", json!({ "amount": 5.0 }));
        let msg = out["error"].as_str().unwrap();
        assert!(msg.starts_with("Invalid arguments for track_expense:"), "{}", msg);
        assert!(msg.contains("category"));
    }

    #[test]
    fn every_definition_dispatches_to_a_handler() {
        let reg = registry();
        for spec in reg.definitions() {
            let raw = reg.dispatch(&spec.name, &json!({}));
            let parsed: Value = serde_json::from_str(&raw).unwrap();
            // Never the unknown-tool envelope for a cataloged name.
            assert_ne!(
                parsed["error"].as_str().unwrap_or_default(),
                format!("Unknown tool: {}", spec.name)
            );
        }
    }

    #[test]
    fn all_dispatches_return_json() {
        let reg = registry();
        for (name, args) in [
            ("log_health", json!({ "steps": 9000 })),
            ("get_health_today", json!({})),
            ("get_health_summary", json!({ "days": 3 })),
            ("track_expense", json!({ "amount": 12.5, "category": "food" })),
            ("get_spending_today", json!({})),
            ("get_spending_summary", json!({})),
            ("get_budget_status", json!({})),
            (
                "calculate_savings_goal",
                json!({ "target_amount": 100.0, "target_months": 2, "monthly_income": 50.0 }),
            ),
            ("save_user_insight", json!({ "insight": "prefers morning walks" })),
        ] {
            let raw = reg.dispatch(name, &args);
            serde_json::from_str::<Value>(&raw)
                .unwrap_or_else(|_| panic!("{} returned invalid JSON: {}", name, raw));
        }
    }

    #[test]
    fn week_start_is_monday() {
        assert_eq!(week_start().date_naive().weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn arg_i64_accepts_whole_floats() {
        let args = json!({ "steps": 8000.0 });
        assert_eq!(arg_i64(&args, "steps").unwrap(), Some(8000));
        let args = json!({ "steps": 80.5 });
        assert!(arg_i64(&args, "steps").is_err());
    }
}
