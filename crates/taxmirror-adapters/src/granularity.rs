//! Chooses how each period-summary entry is represented.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::parser::SummaryEntry;

/// Boletas (39) and comprobantes de pago electrónico (48).
pub const DEFAULT_DAILY_CAPABLE: [&str; 2] = ["39", "48"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranularityPolicy {
    /// Aggregate-only types whose totals are fetched per day instead of per month.
    #[serde(default = "default_daily_capable")]
    pub daily_capable: BTreeSet<String>,
    /// Daily-capable types that also keep their monthly aggregate row.
    #[serde(default)]
    pub both: BTreeSet<String>,
}

fn default_daily_capable() -> BTreeSet<String> {
    DEFAULT_DAILY_CAPABLE.iter().map(|s| s.to_string()).collect()
}

impl Default for GranularityPolicy {
    fn default() -> Self {
        Self {
            daily_capable: default_daily_capable(),
            both: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPlan {
    /// Nothing was issued; no call needed.
    Skip,
    Detail,
    Daily { with_aggregate: bool },
    MonthlyAggregate,
}

impl GranularityPolicy {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let policy: Self = serde_yaml::from_str(text).context("parsing granularity rules")?;
        Ok(policy)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading granularity rules {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn is_daily_capable(&self, document_type: &str) -> bool {
        self.daily_capable.contains(document_type) || self.both.contains(document_type)
    }

    pub fn resolve(&self, entry: &SummaryEntry) -> ExtractionPlan {
        if entry.document_count == 0 && entry.total_amount == 0 && !entry.aggregated {
            return ExtractionPlan::Skip;
        }
        if entry.aggregated && !entry.has_detail {
            if self.is_daily_capable(&entry.document_type) {
                return ExtractionPlan::Daily {
                    with_aggregate: self.both.contains(&entry.document_type),
                };
            }
            return ExtractionPlan::MonthlyAggregate;
        }
        ExtractionPlan::Detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(document_type: &str, aggregated: bool, has_detail: bool) -> SummaryEntry {
        SummaryEntry {
            document_type: document_type.into(),
            document_count: 3,
            net_amount: 0,
            tax_amount: 0,
            exempt_amount: 0,
            total_amount: 300,
            aggregated,
            has_detail,
        }
    }

    #[test]
    fn decision_table() {
        let policy = GranularityPolicy::default();
        assert_eq!(policy.resolve(&entry("33", false, true)), ExtractionPlan::Detail);
        assert_eq!(
            policy.resolve(&entry("39", true, false)),
            ExtractionPlan::Daily { with_aggregate: false }
        );
        assert_eq!(policy.resolve(&entry("35", true, false)), ExtractionPlan::MonthlyAggregate);
        // An aggregate that still offers drill-down goes to detail.
        assert_eq!(policy.resolve(&entry("39", true, true)), ExtractionPlan::Detail);

        let mut empty = entry("33", false, true);
        empty.document_count = 0;
        empty.total_amount = 0;
        assert_eq!(policy.resolve(&empty), ExtractionPlan::Skip);
    }

    #[test]
    fn yaml_rules_override_defaults() {
        let policy = GranularityPolicy::from_yaml_str("daily_capable: ['39']\nboth: ['41']\n").unwrap();
        assert!(!policy.is_daily_capable("48"));
        assert_eq!(
            policy.resolve(&entry("41", true, false)),
            ExtractionPlan::Daily { with_aggregate: true }
        );

        let defaults = GranularityPolicy::from_yaml_str("both: []\n").unwrap();
        assert_eq!(defaults, GranularityPolicy::default());
    }
}
