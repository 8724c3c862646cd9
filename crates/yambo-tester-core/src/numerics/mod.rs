use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Values at or above this magnitude are treated as a blown-up run.
pub const TOO_LARGE: f64 = 1.0e99;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Tolerance {
    pub absolute: f64,
    pub relative: f64,
}

impl Tolerance {
    pub const fn new(absolute: f64, relative: f64) -> Self {
        Self { absolute, relative }
    }

    pub const fn absolute(absolute: f64) -> Self {
        Self::new(absolute, 0.0)
    }

    pub const fn relative(relative: f64) -> Self {
        Self::new(0.0, relative)
    }
}

/// Tolerances applied when an observable does not declare its own.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ToleranceDefaults {
    pub relative: f64,
    pub absolute: f64,
}

impl ToleranceDefaults {
    pub fn resolve(&self, absolute: Option<f64>, relative: Option<f64>) -> Tolerance {
        Tolerance {
            absolute: absolute.unwrap_or(self.absolute),
            relative: relative.unwrap_or(self.relative),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ToleranceComparison {
    pub abs_diff: f64,
    pub rel_diff: f64,
    pub passes: bool,
}

/// Accepts when either enabled branch holds:
/// `|actual - expected| <= absolute` or `|actual - expected| <= relative * |expected|`.
/// A zero tolerance disables its branch; with both disabled only an exact
/// match passes.
pub fn compare_with_tolerance(expected: f64, actual: f64, tolerance: Tolerance) -> ToleranceComparison {
    let abs_diff = (actual - expected).abs();
    let rel_diff = if expected == 0.0 {
        if abs_diff == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        abs_diff / expected.abs()
    };

    let absolute_ok = tolerance.absolute > 0.0 && abs_diff <= tolerance.absolute;
    let relative_ok = tolerance.relative > 0.0 && abs_diff <= tolerance.relative * expected.abs();
    let exact_ok = tolerance.absolute <= 0.0 && tolerance.relative <= 0.0 && abs_diff == 0.0;

    ToleranceComparison {
        abs_diff,
        rel_diff,
        passes: absolute_ok || relative_ok || exact_ok,
    }
}

pub fn is_sane_value(value: f64) -> bool {
    value.is_finite() && value.abs() < TOO_LARGE
}

pub fn format_numeric(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }

    if value == f64::INFINITY {
        return "inf".to_string();
    }

    if value == f64::NEG_INFINITY {
        return "-inf".to_string();
    }

    format!("{value:.9E}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericParseError {
    pub line: usize,
    pub token_index: usize,
    pub token: String,
}

impl Display for NumericParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}, token {} ('{}') is not a valid number",
            self.line, self.token_index, self.token
        )
    }
}

impl std::error::Error for NumericParseError {}

const COMMENT_PREFIXES: [&str; 2] = ["#", "!"];

/// Parses a whitespace separated numeric table as written by the simulation
/// code: comment lines and blank lines are skipped, Fortran `D` exponents
/// are accepted.
pub fn parse_numeric_rows(input: &str) -> Result<Vec<Vec<f64>>, NumericParseError> {
    let mut rows = Vec::new();

    for (line_index, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || COMMENT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            continue;
        }

        let mut row = Vec::new();
        for (token_index, token) in line.split_whitespace().enumerate() {
            let value = parse_numeric_token(token).ok_or_else(|| NumericParseError {
                line: line_index + 1,
                token_index: token_index + 1,
                token: token.to_string(),
            })?;
            row.push(value);
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }

    Ok(rows)
}

pub fn parse_numeric_token(token: &str) -> Option<f64> {
    if let Ok(value) = token.parse::<f64>() {
        return Some(value);
    }
    let normalized = token.replace(['D', 'd'], "E");
    normalized.parse::<f64>().ok()
}
