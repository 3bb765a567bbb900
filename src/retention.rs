//! Retention rule table compiled from configuration.
//!
//! The table is rendered as a SQL common table expression that the expiry
//! delete joins against:
//!
//! ```sql
//! WITH periods(rule, value, period) AS (VALUES
//!   ('default-period', NULL, ?),
//!   ('responsible-department', ?, ?),
//!   ('bundle-profile', ?, ?)
//! )
//! ```
//!
//! Values are bound as parameters, never interpolated. Precedence (department,
//! then profile, then default) is resolved by the expiry delete itself.
use crate::config::{ConfigError, Retention};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleKind {
    /// Most specific: the owning health department.
    Department,
    Profile,
    Default,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Department => "responsible-department",
            RuleKind::Profile => "bundle-profile",
            RuleKind::Default => "default-period",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRule {
    pub kind: RuleKind,
    pub value: Option<String>,
    pub days: u32,
}

/// Rule table, ordered most specific first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    rules: Vec<RetentionRule>,
}

/// A rendered common table expression together with the values to bind, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodsCte {
    pub sql: String,
    pub binds: Vec<PeriodBind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodBind {
    Text(String),
    Days(i64),
}

impl RuleTable {
    /// Build the table; fails when no default period is configured.
    pub fn compile(cfg: &Retention) -> Result<Self, ConfigError> {
        let default_days = cfg
            .default_days
            .ok_or(ConfigError::Invalid("purger.retention.default_days must be set"))?;

        let mut rules: Vec<RetentionRule> = cfg
            .departments
            .iter()
            .map(|(dept, days)| RetentionRule {
                kind: RuleKind::Department,
                value: Some(dept.clone()),
                days: *days,
            })
            .chain(cfg.profiles.iter().map(|(uri, days)| RetentionRule {
                kind: RuleKind::Profile,
                value: Some(uri.clone()),
                days: *days,
            }))
            .collect();
        rules.push(RetentionRule {
            kind: RuleKind::Default,
            value: None,
            days: default_days,
        });
        rules.sort_by_key(|r| r.kind);

        Ok(Self { rules })
    }

    pub fn to_cte(&self) -> PeriodsCte {
        let mut rows = Vec::with_capacity(self.rules.len());
        let mut binds = Vec::new();
        for rule in &self.rules {
            match &rule.value {
                Some(value) => {
                    rows.push(format!("('{}', ?, ?)", rule.kind.as_str()));
                    binds.push(PeriodBind::Text(value.clone()));
                }
                None => rows.push(format!("('{}', NULL, ?)", rule.kind.as_str())),
            }
            binds.push(PeriodBind::Days(i64::from(rule.days)));
        }
        let sql = format!(
            "WITH periods(rule, value, period) AS (VALUES\n  {}\n)\n",
            rows.join(",\n  ")
        );
        debug!(rules = self.rules.len(), "prepared periods common table expression:\n{}", sql);
        PeriodsCte { sql, binds }
    }
}
