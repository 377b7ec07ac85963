//! Retention selection for pruning old backups.
//!
//! Rules are applied in order and are purely additive: a manifest kept
//! by any rule stays kept. Anything unmarked at the end is pruned.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dbkp_tools::error::{Error, Result};

use crate::manifest::Manifest;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PruneMark {
    Keep,
    Remove,
}

impl PruneMark {
    pub fn keep(self) -> bool {
        self == PruneMark::Keep
    }
}

impl std::fmt::Display for PruneMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PruneMark::Keep => "keep",
            PruneMark::Remove => "remove",
        })
    }
}

/// Which backups to keep. Zero disables a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepOptions {
    /// Keep the newest N backups.
    pub keep: usize,
    pub keep_daily: usize,
    pub keep_weekly: usize,
    pub keep_monthly: usize,
    pub keep_yearly: usize,
    /// Keep everything younger than this, e.g. `"7d"` (`d` = 24 hours).
    pub retention: Option<String>,
}

impl KeepOptions {
    pub fn keeps_anything(&self) -> bool {
        self.keep > 0
            || self.keep_daily > 0
            || self.keep_weekly > 0
            || self.keep_monthly > 0
            || self.keep_yearly > 0
            || self.retention.is_some()
    }
}

/// Parse a retention window: plain seconds or an integer with one of
/// the suffixes `s`, `m`, `h`, `d`. The `d` suffix means a fixed 24
/// hour window, not a calendar day.
pub fn parse_retention(value: &str) -> Result<std::time::Duration> {
    let value = value.trim();
    let (number, unit) = match value.char_indices().last() {
        Some((last, suffix)) if suffix.is_ascii_alphabetic() => (&value[..last], suffix),
        _ => (value, 's'),
    };
    let count: u64 = number
        .parse()
        .map_err(|_| Error::Config(format!("invalid retention window '{value}'")))?;
    let seconds = match unit {
        's' => count,
        'm' => count * 60,
        'h' => count * 3600,
        'd' => count * 24 * 3600,
        other => {
            return Err(Error::Config(format!(
                "invalid retention unit '{other}' in '{value}'"
            )));
        }
    };
    Ok(std::time::Duration::from_secs(seconds))
}

/// Mark the newest manifest of up to `keep` time buckets as kept.
///
/// Buckets already covered by a previously kept manifest do not consume
/// the budget, matching how overlapping rules compose.
fn mark_selections<F: Fn(&Manifest) -> String>(
    mark: &mut HashMap<String, PruneMark>,
    list: &[Manifest],
    keep: usize,
    select_id: F,
) {
    let mut already_included = HashSet::new();
    for manifest in list {
        if let Some(PruneMark::Keep) = mark.get(&manifest.id) {
            already_included.insert(select_id(manifest));
        }
    }

    let mut include_hash = HashSet::new();
    for manifest in list {
        let sel_id = select_id(manifest);
        if already_included.contains(&sel_id) {
            continue;
        }
        if !include_hash.contains(&sel_id) {
            if include_hash.len() >= keep {
                break;
            }
            include_hash.insert(sel_id);
            mark.insert(manifest.id.clone(), PruneMark::Keep);
        }
    }
}

/// Compute the keep/remove decision for every manifest.
///
/// `list` is typically pre-filtered by engine and database name; the
/// result is ordered newest first.
pub fn compute_prune_list(
    mut list: Vec<Manifest>,
    now: DateTime<Utc>,
    options: &KeepOptions,
) -> Result<Vec<(Manifest, PruneMark)>> {
    let mut mark: HashMap<String, PruneMark> = HashMap::new();

    list.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if options.keep > 0 {
        mark_selections(&mut mark, &list, options.keep, |manifest| {
            manifest.id.clone()
        });
    }

    if let Some(window) = &options.retention {
        let window = chrono::Duration::from_std(parse_retention(window)?)
            .map_err(|_| Error::Config("retention window out of range".into()))?;
        for manifest in &list {
            if now - manifest.created_at <= window {
                mark.entry(manifest.id.clone()).or_insert(PruneMark::Keep);
            }
        }
    }

    if options.keep_daily > 0 {
        mark_selections(&mut mark, &list, options.keep_daily, |manifest| {
            manifest.created_at.format("%Y/%m/%d").to_string()
        });
    }

    if options.keep_weekly > 0 {
        mark_selections(&mut mark, &list, options.keep_weekly, |manifest| {
            // Note: Use iso-week year/week here. This year number
            // might not match the calendar year number.
            manifest.created_at.format("%G/%V").to_string()
        });
    }

    if options.keep_monthly > 0 {
        mark_selections(&mut mark, &list, options.keep_monthly, |manifest| {
            manifest.created_at.format("%Y/%m").to_string()
        });
    }

    if options.keep_yearly > 0 {
        mark_selections(&mut mark, &list, options.keep_yearly, |manifest| {
            manifest.created_at.format("%Y").to_string()
        });
    }

    Ok(list
        .into_iter()
        .map(|manifest| {
            let decision = mark
                .get(&manifest.id)
                .copied()
                .unwrap_or(PruneMark::Remove);
            (manifest, decision)
        })
        .collect())
}
