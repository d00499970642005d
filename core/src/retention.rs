//! Generational retention policy.
//!
//! Rules look like `latest3,hours24,days30,weeks4,months12,years2`. The
//! `latest N` versions are always kept. Every other version is placed into the
//! first category whose age bucket index is within that category's count, and
//! only the oldest version of each bucket survives. Versions that fit no
//! category are dismissed.

use crate::{Error, Result, Version};
use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetentionCategory {
    Latest,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl RetentionCategory {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "latest" => Some(Self::Latest),
            "hours" => Some(Self::Hours),
            "days" => Some(Self::Days),
            "weeks" => Some(Self::Weeks),
            "months" => Some(Self::Months),
            "years" => Some(Self::Years),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionFilter {
    rules: BTreeMap<RetentionCategory, u64>,
    reference_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RetentionOutcome {
    pub keep: Vec<Version>,
    pub dismiss: Vec<Version>,
}

fn rule_regex() -> &'static Regex {
    static RULE: OnceLock<Regex> = OnceLock::new();
    RULE.get_or_init(|| Regex::new(r"^([a-z]+)([0-9]+)$").expect("static regex"))
}

impl RetentionFilter {
    pub fn new(rules: &str) -> Result<Self> {
        Ok(Self {
            rules: Self::parse_rules(rules)?,
            reference_time: Utc::now(),
        })
    }

    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    fn parse_rules(text: &str) -> Result<BTreeMap<RetentionCategory, u64>> {
        let mut rules = BTreeMap::new();
        for rule in text.split(',').map(str::trim) {
            let captures = rule_regex()
                .captures(rule)
                .ok_or_else(|| Error::Usage(format!("Invalid retention rule {:?}", rule)))?;
            let category = RetentionCategory::from_name(&captures[1])
                .ok_or_else(|| Error::Usage(format!("Unknown retention category {:?}", &captures[1])))?;
            let count: u64 = captures[2]
                .parse()
                .map_err(|_| Error::Usage(format!("Invalid count in retention rule {:?}", rule)))?;
            if count == 0 {
                return Err(Error::Usage(format!("Retention rule {:?} needs a positive count", rule)));
            }
            if rules.insert(category, count).is_some() {
                return Err(Error::Usage(format!("Retention category in {:?} given twice", rule)));
            }
        }
        Ok(rules)
    }

    pub fn filter(&self, versions: &[Version]) -> RetentionOutcome {
        let mut sorted: Vec<&Version> = versions.iter().collect();
        sorted.sort_by(|a, b| b.date.cmp(&a.date).then(b.uid.cmp(&a.uid)));

        let mut outcome = RetentionOutcome::default();
        let latest = self.rules.get(&RetentionCategory::Latest).copied().unwrap_or(0) as usize;
        let split = latest.min(sorted.len());
        outcome.keep.extend(sorted[..split].iter().map(|v| (*v).clone()));

        let mut buckets: BTreeMap<(RetentionCategory, u64), Vec<&Version>> = BTreeMap::new();
        for version in &sorted[split..] {
            let Some(age) = Age::between(version.date, self.reference_time) else {
                warn!(version = %version.uid, date = %version.date, "Version is dated in the future, keeping it");
                outcome.keep.push((*version).clone());
                continue;
            };

            let placed = self
                .rules
                .iter()
                .filter(|(category, _)| **category != RetentionCategory::Latest)
                .find(|(category, count)| age.in_units(**category) <= **count);

            match placed {
                Some((category, _)) => {
                    debug!(version = %version.uid, ?category, bucket = age.in_units(*category), "Version fits category");
                    buckets.entry((*category, age.in_units(*category))).or_default().push(version);
                }
                None => {
                    debug!(version = %version.uid, "Version fits no category, dismissing");
                    outcome.dismiss.push((*version).clone());
                }
            }
        }

        for (_, bucket) in buckets {
            // Youngest first, so the last entry is the oldest and survives.
            if let Some((oldest, rest)) = bucket.split_last() {
                outcome.keep.push((*oldest).clone());
                outcome.dismiss.extend(rest.iter().map(|v| (*v).clone()));
            }
        }

        outcome.keep.sort_by(|a, b| b.date.cmp(&a.date));
        outcome.dismiss.sort_by(|a, b| b.date.cmp(&a.date));
        outcome
    }
}

struct Age {
    seconds: u64,
    months: u64,
}

impl Age {
    fn between(date: DateTime<Utc>, reference: DateTime<Utc>) -> Option<Self> {
        let seconds = u64::try_from((reference - date).num_seconds()).ok()?;
        let mut months = (reference.year() as i64 - date.year() as i64) * 12 + reference.month() as i64 - date.month() as i64;
        let reference_in_month = (reference.day(), reference.num_seconds_from_midnight());
        let date_in_month = (date.day(), date.num_seconds_from_midnight());
        if reference_in_month < date_in_month {
            months -= 1;
        }
        Some(Self {
            seconds,
            months: months.max(0) as u64,
        })
    }

    fn in_units(&self, category: RetentionCategory) -> u64 {
        match category {
            RetentionCategory::Latest => 0,
            RetentionCategory::Hours => self.seconds / 3600,
            RetentionCategory::Days => self.seconds / 86400,
            RetentionCategory::Weeks => self.seconds / (7 * 86400),
            RetentionCategory::Months => self.months,
            RetentionCategory::Years => self.months / 12,
        }
    }
}
