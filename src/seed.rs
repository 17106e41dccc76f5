//! Demo-data seeding for manual testing.
//!
//! Fills the store with two weeks of plausible health logs and expenses so
//! the context builder and summary tools have something to chew on.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rand::Rng;

use crate::config::Config;
use crate::store::Store;
use crate::tools::mood_code;

pub fn run(config: &Config) -> Result<()> {
    let store = if config.in_memory_store() {
        Store::open_in_memory()
    } else {
        Store::open(&config.server.db_path)
    }
    .context("Failed to open store")?;

    let mut rng = rand::rng();
    let moods = ["great", "good", "good", "okay", "okay", "tired", "stressed"];
    let mut health_rows = 0usize;
    let mut expense_rows = 0usize;

    for day in 0..14 {
        let ts = Some(Utc::now() - Duration::days(day));

        store.log_health("sleep_hours", rng.random_range(5.5..8.5), "", ts)?;
        store.log_health("steps", rng.random_range(3000..12000) as f64, "", ts)?;
        store.log_health("water", rng.random_range(3..9) as f64, "", ts)?;
        let mood = moods[rng.random_range(0..moods.len())];
        store.log_health("mood", mood_code(mood).expect("known mood"), "", ts)?;
        health_rows += 4;

        if rng.random_bool(0.8) {
            store.log_expense(rng.random_range(8.0..40.0), "food", "groceries and meals", ts)?;
            expense_rows += 1;
        }
        if rng.random_bool(0.4) {
            store.log_expense(rng.random_range(2.0..25.0), "transport", "transit", ts)?;
            expense_rows += 1;
        }
        if rng.random_bool(0.2) {
            store.log_expense(rng.random_range(10.0..80.0), "entertainment", "", ts)?;
            expense_rows += 1;
        }
    }
    store.log_expense(95.0, "utilities", "electricity bill", None)?;
    expense_rows += 1;

    println!(
        "Seeded {} health rows and {} expenses into {}",
        health_rows, expense_rows, config.server.db_path
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_populates_in_memory_store() {
        let mut config = Config::default();
        config.server.db_path = ":memory:".to_string();
        // In-memory store is dropped afterwards; this just proves the seed
        // path writes valid rows.
        run(&config).unwrap();
    }
}
