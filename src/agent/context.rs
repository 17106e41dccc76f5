//! Builds the dynamic user-context segment of the system prompt.
//!
//! One short paragraph summarizing recent health and spending, regenerated
//! every turn from the store. Returns an empty string when there is nothing
//! to say, so the prompt assembly can skip the segment entirely.

use std::sync::Arc;

use crate::store::{HealthLog, Store};
use crate::tools::mood_label;

#[derive(Clone)]
pub struct ContextBuilder {
    store: Arc<Store>,
}

impl ContextBuilder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Summarize the last `days` days. No side effects.
    pub fn build(&self, days: i64) -> String {
        let from = chrono::Utc::now() - chrono::Duration::days(days);

        let health = self
            .store
            .query_health(None, Some(from), None, false)
            .unwrap_or_default();
        let spending = self
            .store
            .sum_expenses_by_category(Some(from), None)
            .unwrap_or_default();

        let mut parts = Vec::new();
        if let Some(line) = health_clause(&health, days) {
            parts.push(line);
        }
        if let Some(line) = spending_clause(&spending, days) {
            parts.push(line);
        }
        parts.join(" ")
    }
}

fn health_clause(rows: &[HealthLog], days: i64) -> Option<String> {
    if rows.is_empty() {
        return None;
    }

    // Fixed presentation order; only metrics with data appear.
    let mut clauses = Vec::new();
    for metric in ["sleep_hours", "steps", "heart_rate", "mood", "weight", "water", "exercise_minutes"] {
        let values: Vec<&HealthLog> = rows.iter().filter(|r| r.metric == metric).collect();
        if values.is_empty() {
            continue;
        }
        let avg = values.iter().map(|r| r.value).sum::<f64>() / values.len() as f64;
        let clause = match metric {
            "sleep_hours" => format!("sleep {:.1}h avg", avg),
            "steps" => format!("steps {:.0} avg", avg),
            "heart_rate" => format!("heart rate {:.0} bpm avg", avg),
            // Categorical: report the most recent reading, not an average.
            "mood" => {
                let latest = values.iter().max_by_key(|r| r.timestamp)?;
                format!("mood {}", mood_label(latest.value))
            }
            "weight" => format!("weight {:.1} avg", avg),
            "water" => format!("water {:.0} glasses avg", avg),
            _ => format!("exercise {:.0}min avg", avg),
        };
        clauses.push(clause);
    }

    Some(format!("Recent health ({}d): {}.", days, clauses.join("; ")))
}

fn spending_clause(totals: &[crate::store::CategoryTotal], days: i64) -> Option<String> {
    if totals.is_empty() {
        return None;
    }
    let total: f64 = totals.iter().map(|t| t.total).sum();
    // `totals` is ordered by total desc, so the first entry is the top category.
    let top = &totals[0];
    Some(format!(
        "Spending ({}d): ${:.2} total, most on {}.",
        days, total, top.category
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> (Arc<Store>, ContextBuilder) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        (store.clone(), ContextBuilder::new(store))
    }

    #[test]
    fn empty_store_yields_empty_string() {
        let (_, ctx) = builder();
        assert_eq!(ctx.build(7), "");
    }

    #[test]
    fn summarizes_health_and_spending() {
        let (store, ctx) = builder();
        store.log_health("sleep_hours", 6.0, "", None).unwrap();
        store.log_health("sleep_hours", 6.4, "", None).unwrap();
        store.log_health("steps", 8500.0, "", None).unwrap();
        store.log_health("mood", 4.0, "", None).unwrap();
        store.log_expense(80.0, "food", "", None).unwrap();
        store.log_expense(20.0, "transport", "", None).unwrap();

        let summary = ctx.build(7);
        assert!(summary.starts_with("Recent health (7d): sleep 6.2h avg"), "{}", summary);
        assert!(summary.contains("steps 8500 avg"), "{}", summary);
        assert!(summary.contains("mood good"), "{}", summary);
        assert!(summary.contains("Spending (7d): $100.00 total, most on food."), "{}", summary);
    }

    #[test]
    fn health_only_when_no_expenses() {
        let (store, ctx) = builder();
        store.log_health("water", 5.0, "", None).unwrap();
        let summary = ctx.build(3);
        assert!(summary.contains("water 5 glasses avg"), "{}", summary);
        assert!(!summary.contains("Spending"), "{}", summary);
    }

    #[test]
    fn old_rows_outside_window_are_ignored() {
        let (store, ctx) = builder();
        store
            .log_health("steps", 1000.0, "", Some(chrono::Utc::now() - chrono::Duration::days(30)))
            .unwrap();
        assert_eq!(ctx.build(7), "");
    }
}
