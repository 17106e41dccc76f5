//! Expense and budget tool handlers.

use chrono::{Datelike, Utc};
use serde_json::{json, Map, Value};

use super::{
    arg_date, arg_f64, arg_i64, arg_str, days_back, month_start, round2, today_start,
    week_start, ToolResult,
};
use crate::error::ToolError;
use crate::store::Store;

pub(crate) const CATEGORIES: [&str; 6] =
    ["food", "transport", "shopping", "health", "entertainment", "utilities"];

fn check_category(raw: &str) -> Result<&str, ToolError> {
    CATEGORIES
        .iter()
        .find(|c| **c == raw)
        .copied()
        .ok_or_else(|| {
            ToolError::Validation(format!(
                "'category' must be one of {}; got '{}'",
                CATEGORIES.join(", "),
                raw
            ))
        })
}

/// Record one expense; reply includes the week-to-date total for its category.
pub fn track_expense(store: &Store, args: &Value) -> ToolResult {
    let amount = arg_f64(args, "amount")?
        .ok_or_else(|| ToolError::Validation("'amount' must be a number".into()))?;
    if amount <= 0.0 {
        return Err(ToolError::Validation(format!(
            "'amount' must be positive, got {}",
            amount
        )));
    }
    let category = check_category(
        arg_str(args, "category")?
            .ok_or_else(|| ToolError::Validation("'category' must be a string".into()))?,
    )?;
    let description = arg_str(args, "description")?.unwrap_or_default();
    let (ts, date) = arg_date(args)?;

    let id = store.log_expense(amount, category, description, ts)?;
    let week_total: f64 = store
        .query_expenses(Some(category), Some(week_start()), None, None)?
        .iter()
        .map(|e| e.amount)
        .sum();

    Ok(json!({
        "status": "ok",
        "id": id,
        "amount": round2(amount),
        "category": category,
        "date": date.format("%Y-%m-%d").to_string(),
        "week_total": round2(week_total),
    }))
}

/// Today's expenses grouped by category.
pub fn get_spending_today(store: &Store) -> ToolResult {
    let rows = store.query_expenses(None, Some(today_start()), None, None)?;
    let total: f64 = rows.iter().map(|e| e.amount).sum();

    let mut by_category = Map::new();
    for cat in CATEGORIES {
        let sum: f64 = rows.iter().filter(|e| e.category == cat).map(|e| e.amount).sum();
        if sum > 0.0 {
            by_category.insert(cat.to_string(), json!(round2(sum)));
        }
    }

    Ok(json!({
        "date": Utc::now().date_naive().format("%Y-%m-%d").to_string(),
        "total": round2(total),
        "count": rows.len(),
        "by_category": by_category,
        "items": rows.iter().map(expense_json).collect::<Vec<_>>(),
    }))
}

/// Totals, daily average, per-category breakdown, and the 5 most recent
/// items over the last N days (default 30).
pub fn get_spending_summary(store: &Store, args: &Value) -> ToolResult {
    let days = arg_i64(args, "days")?.unwrap_or(30);
    if days <= 0 {
        return Err(ToolError::Validation("'days' must be positive".into()));
    }
    let category = match arg_str(args, "category")? {
        Some(raw) => Some(check_category(raw)?),
        None => None,
    };
    let from = days_back(days);

    let rows = store.query_expenses(category, Some(from), None, None)?;
    let total: f64 = rows.iter().map(|e| e.amount).sum();
    let by_category = store
        .sum_expenses_by_category(Some(from), None)?
        .into_iter()
        .filter(|c| category.map_or(true, |only| c.category == only))
        .map(|c| json!({ "category": c.category, "total": round2(c.total), "count": c.count }))
        .collect::<Vec<_>>();
    let recent = store.query_expenses(category, Some(from), None, Some(5))?;

    Ok(json!({
        "days": days,
        "total": round2(total),
        "count": rows.len(),
        "daily_average": round2(total / days as f64),
        "by_category": by_category,
        "recent": recent.iter().map(expense_json).collect::<Vec<_>>(),
    }))
}

/// Month-to-date spend against a budget, with a run-rate projection.
pub fn get_budget_status(store: &Store, args: &Value) -> ToolResult {
    let budget = arg_f64(args, "monthly_budget")?.unwrap_or(3000.0);
    if budget <= 0.0 {
        return Err(ToolError::Validation(format!(
            "'monthly_budget' must be positive, got {}",
            budget
        )));
    }

    let rows = store.query_expenses(None, Some(month_start()), None, None)?;
    let spent: f64 = rows.iter().map(|e| e.amount).sum();

    let today = Utc::now().date_naive();
    let days_elapsed = today.day() as f64;
    let days_in_month = days_in_month(today.year(), today.month()) as f64;
    let projected = spent / days_elapsed * days_in_month;

    Ok(json!({
        "monthly_budget": round2(budget),
        "spent": round2(spent),
        "remaining": round2(budget - spent),
        "days_elapsed": days_elapsed as i64,
        "days_in_month": days_in_month as i64,
        "projected_month_end": round2(projected),
        "on_track": projected <= budget,
    }))
}

/// Pure compute: no store access.
pub fn calculate_savings_goal(args: &Value) -> ToolResult {
    let target_amount = arg_f64(args, "target_amount")?
        .ok_or_else(|| ToolError::Validation("'target_amount' must be a number".into()))?;
    if target_amount <= 0.0 {
        return Err(ToolError::Validation(format!(
            "'target_amount' must be positive, got {}",
            target_amount
        )));
    }
    let target_months = arg_i64(args, "target_months")?
        .ok_or_else(|| ToolError::Validation("'target_months' must be an integer".into()))?;
    if target_months <= 0 {
        return Err(ToolError::Validation(format!(
            "'target_months' must be positive, got {}",
            target_months
        )));
    }
    let monthly_income = arg_f64(args, "monthly_income")?
        .ok_or_else(|| ToolError::Validation("'monthly_income' must be a number".into()))?;
    if monthly_income < 0.0 {
        return Err(ToolError::Validation(format!(
            "'monthly_income' must not be negative, got {}",
            monthly_income
        )));
    }

    let needed = target_amount / target_months as f64;
    // Feasible when the required saving fits inside half the income.
    let feasible = monthly_income > 0.0 && needed <= monthly_income * 0.5;
    let percentage = if monthly_income > 0.0 {
        needed / monthly_income * 100.0
    } else {
        0.0
    };

    Ok(json!({
        "status": "ok",
        "monthly_savings_needed": round2(needed),
        "target_amount": round2(target_amount),
        "target_months": target_months,
        "feasible": feasible,
        "percentage_of_income": round2(percentage),
        "remaining_after_savings": round2(monthly_income - needed),
    }))
}

fn expense_json(e: &crate::store::Expense) -> Value {
    json!({
        "id": e.id,
        "amount": round2(e.amount),
        "category": e.category,
        "description": e.description,
        "date": e.timestamp.date_naive().format("%Y-%m-%d").to_string(),
    })
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_y, next_m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_next = chrono::NaiveDate::from_ymd_opt(next_y, next_m, 1).expect("valid date");
    first_next.pred_opt().expect("valid date").day()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }

    #[test]
    fn zero_amount_rejected_without_store_write() {
        let s = store();
        let err = track_expense(&s, &json!({ "amount": 0.0, "category": "food" })).unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
        assert!(s.query_expenses(None, None, None, None).unwrap().is_empty());
    }

    #[test]
    fn bad_category_rejected() {
        let s = store();
        let err = track_expense(&s, &json!({ "amount": 5.0, "category": "crypto" })).unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[test]
    fn track_expense_reports_week_total() {
        let s = store();
        track_expense(&s, &json!({ "amount": 10.0, "category": "food" })).unwrap();
        let out =
            track_expense(&s, &json!({ "amount": 45.5, "category": "food", "description": "dinner" }))
                .unwrap();
        assert_eq!(out["status"], "ok");
        assert_eq!(out["week_total"], 55.5);
    }

    #[test]
    fn spending_today_includes_just_tracked_expense() {
        let s = store();
        track_expense(&s, &json!({ "amount": 45.5, "category": "food", "description": "dinner" }))
            .unwrap();
        let out = get_spending_today(&s).unwrap();
        assert_eq!(out["total"], 45.5);
        assert_eq!(out["by_category"]["food"], 45.5);
        assert_eq!(out["items"][0]["description"], "dinner");
    }

    #[test]
    fn spending_summary_shape() {
        let s = store();
        track_expense(&s, &json!({ "amount": 30.0, "category": "food" })).unwrap();
        track_expense(&s, &json!({ "amount": 60.0, "category": "transport" })).unwrap();
        for i in 0..6 {
            track_expense(&s, &json!({ "amount": 1.0 + i as f64, "category": "shopping" })).unwrap();
        }

        let out = get_spending_summary(&s, &json!({})).unwrap();
        assert_eq!(out["days"], 30);
        assert_eq!(out["total"], 111.0);
        assert_eq!(out["daily_average"], 3.7);
        assert_eq!(out["recent"].as_array().unwrap().len(), 5);
        // by_category ordered by total descending.
        assert_eq!(out["by_category"][0]["category"], "transport");
    }

    #[test]
    fn spending_summary_category_filter() {
        let s = store();
        track_expense(&s, &json!({ "amount": 30.0, "category": "food" })).unwrap();
        track_expense(&s, &json!({ "amount": 60.0, "category": "transport" })).unwrap();
        let out = get_spending_summary(&s, &json!({ "category": "food" })).unwrap();
        assert_eq!(out["total"], 30.0);
        assert_eq!(out["by_category"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn budget_status_projection() {
        let s = store();
        track_expense(&s, &json!({ "amount": 100.0, "category": "utilities" })).unwrap();
        let out = get_budget_status(&s, &json!({ "monthly_budget": 3000.0 })).unwrap();
        assert_eq!(out["monthly_budget"], 3000.0);
        assert_eq!(out["spent"], 100.0);
        assert_eq!(out["remaining"], 2900.0);
        assert!(out["projected_month_end"].as_f64().unwrap() >= 100.0);
    }

    #[test]
    fn savings_goal_reference_case() {
        let out = calculate_savings_goal(
            &json!({ "target_amount": 1200.0, "target_months": 6, "monthly_income": 4000.0 }),
        )
        .unwrap();
        assert_eq!(out["status"], "ok");
        assert_eq!(out["monthly_savings_needed"], 200.0);
        assert_eq!(out["target_amount"], 1200.0);
        assert_eq!(out["target_months"], 6);
        assert_eq!(out["feasible"], true);
        assert_eq!(out["percentage_of_income"], 5.0);
        assert_eq!(out["remaining_after_savings"], 3800.0);
    }

    #[test]
    fn savings_goal_zero_months_rejected() {
        let err = calculate_savings_goal(
            &json!({ "target_amount": 100.0, "target_months": 0, "monthly_income": 100.0 }),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[test]
    fn savings_goal_zero_income_accepted() {
        let out = calculate_savings_goal(
            &json!({ "target_amount": 100.0, "target_months": 4, "monthly_income": 0.0 }),
        )
        .unwrap();
        assert_eq!(out["percentage_of_income"], 0.0);
        assert_eq!(out["feasible"], false);
    }
}
