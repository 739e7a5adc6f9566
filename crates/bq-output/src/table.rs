// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destination table naming.
//!
//! Tables are either a fixed, pre-existing name or derived from the current
//! time: `<prefix><separator><strftime(date_pattern)>`, e.g.
//! `logstash_2012_09_08T07_00` for an hourly pattern.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, TimeZone};
use std::fmt::{self, Write as _};

/// How the destination table name is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableNaming {
    /// Existing table, never created by the output.
    Fixed(String),
    /// Time-derived table, created on first use.
    Dated {
        prefix: String,
        separator: String,
        date_pattern: String,
    },
}

impl TableNaming {
    /// Time-derived naming.
    pub fn dated(
        prefix: impl Into<String>,
        separator: impl Into<String>,
        date_pattern: impl Into<String>,
    ) -> Self {
        Self::Dated {
            prefix: prefix.into(),
            separator: separator.into(),
            date_pattern: date_pattern.into(),
        }
    }

    /// Whether tables must be created when missing.
    pub fn auto_create(&self) -> bool {
        matches!(self, Self::Dated { .. })
    }

    /// Check that the naming can always be resolved.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Fixed(_) => Ok(()),
            Self::Dated { date_pattern, .. } => validate_pattern(date_pattern),
        }
    }

    /// Resolve the table name for the current local time.
    pub fn resolve(&self) -> Result<String, fmt::Error> {
        self.resolve_at(&Local::now())
    }

    /// Resolve the table name for a given time.
    ///
    /// Fails only if `date_pattern` cannot be rendered.
    pub fn resolve_at<Tz>(&self, time: &DateTime<Tz>) -> Result<String, fmt::Error>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        match self {
            Self::Fixed(name) => Ok(name.clone()),
            Self::Dated {
                prefix,
                separator,
                date_pattern,
            } => {
                let mut raw = format!("{}{}", prefix, separator);
                write!(raw, "{}", time.format(date_pattern))?;
                Ok(normalize_table_id(&raw))
            }
        }
    }
}

/// Replace every character that is not ASCII alphanumeric or `_` with `_`.
pub fn normalize_table_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Check that chrono can render a strftime pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        Err(format!("invalid date_pattern '{}'", pattern))
    } else {
        Ok(())
    }
}
