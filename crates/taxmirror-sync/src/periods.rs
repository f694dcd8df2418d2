//! Reporting-period windows.

use std::collections::BTreeSet;

use chrono::{NaiveDate, Utc};
use taxmirror_core::SyncPeriod;

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Upper bound on a requested window; larger requests are clamped.
pub const MAX_MONTHS_BACK: usize = 240;
pub const MAX_YEARS_BACK: usize = MAX_MONTHS_BACK / 12;

/// The `n` most recent periods up to and including the one containing `today`,
/// distinct and in ascending order. `n` is clamped to [`MAX_MONTHS_BACK`].
pub fn last_n_months(n: usize, today: NaiveDate) -> Vec<SyncPeriod> {
    let mut periods = BTreeSet::new();
    let mut current = SyncPeriod::containing(today);
    for _ in 0..n.min(MAX_MONTHS_BACK) {
        periods.insert(current);
        current = current.previous();
    }
    periods.into_iter().collect()
}

/// The `n` most recent calendar years, ascending. `n` is clamped to [`MAX_YEARS_BACK`].
pub fn last_n_years(n: usize, today: NaiveDate) -> Vec<i32> {
    let year = SyncPeriod::containing(today).year;
    (0..n.min(MAX_YEARS_BACK)).rev().map(|back| year - back as i32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn months_cross_year_boundary_in_order() {
        let periods = last_n_months(3, date(2025, 1, 15));
        let codes: Vec<String> = periods.iter().map(SyncPeriod::code).collect();
        assert_eq!(codes, ["202411", "202412", "202501"]);
    }

    #[test]
    fn zero_months_is_empty_and_window_is_deterministic() {
        assert!(last_n_months(0, date(2024, 10, 1)).is_empty());
        let clock = FixedClock(date(2024, 10, 31));
        assert_eq!(last_n_months(13, clock.today()).len(), 13);
        assert_eq!(last_n_months(2, clock.today()), last_n_months(2, clock.today()));
    }

    #[test]
    fn years_ascending() {
        assert_eq!(last_n_years(3, date(2024, 6, 1)), [2022, 2023, 2024]);
    }

    #[test]
    fn oversized_windows_are_clamped() {
        let today = date(2024, 10, 1);
        let months = last_n_months(usize::MAX, today);
        assert_eq!(months.len(), MAX_MONTHS_BACK);
        assert_eq!(months.last().map(SyncPeriod::code).as_deref(), Some("202410"));
        assert_eq!(months.first().map(SyncPeriod::code).as_deref(), Some("200411"));

        let years = last_n_years(usize::MAX, today);
        assert_eq!(years.len(), MAX_YEARS_BACK);
        assert_eq!(years.first(), Some(&2005));
        assert_eq!(years.last(), Some(&2024));
    }
}
