//! User-insight tool handler.

use serde_json::{json, Value};

use super::{arg_str, ToolResult};
use crate::error::ToolError;
use crate::store::Store;

pub fn save_user_insight(store: &Store, args: &Value) -> ToolResult {
    let insight = arg_str(args, "insight")?
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::Validation("'insight' must be a non-empty string".into()))?;

    let id = store.save_insight(insight)?;
    Ok(json!({ "status": "ok", "id": id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn saves_and_lists_insight() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let out = save_user_insight(&store, &json!({ "insight": "walks after lunch" })).unwrap();
        assert_eq!(out["status"], "ok");
        let recent = store.recent_insights(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].1, "walks after lunch");
    }

    #[test]
    fn empty_insight_rejected() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let err = save_user_insight(&store, &json!({ "insight": "  " })).unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }
}
