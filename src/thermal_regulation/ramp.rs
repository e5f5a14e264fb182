// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Temperature ramp plans
//!
//! A ramp plan is a start time followed by rows of `(offset, targets)`. The
//! text form is the one operators edit:
//!
//! ```text
//! // comment
//! START 13:00
//! INTERP LINEAR
//! 0:00    30  30  30  30
//! 3:00    30  30  33  33
//! ```
//!
//! Offsets are relative to START and may exceed 24 hours. INTERP may be left
//! out and defaults to LINEAR. A saved plan starts with an
//! `// anchored YYYY-MM-DD` comment giving the date START refers to.
//!
//! A plan is validated as a whole when it is built; a plan that fails
//! validation is never partially applied and never clamped into range.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::config::RampConfig;

/// Reasons a ramp plan is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RampPlanError {
    #[error("line {line}: missing or malformed START directive")]
    MissingStart { line: usize },

    #[error("line {line}: invalid time '{value}', expected h:mm")]
    InvalidTime { line: usize, value: String },

    #[error("unknown interpolation mode '{0}'")]
    UnknownInterpolation(String),

    #[error("line {line}: duplicate {directive} directive")]
    DuplicateDirective { line: usize, directive: String },

    #[error("line {line}: invalid temperature '{value}'")]
    InvalidTemperature { line: usize, value: String },

    #[error("row {row}: expected {expected} temperatures, found {found}")]
    TankCountMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("a plan needs at least 2 points, found {0}")]
    TooFewPoints(usize),

    #[error("a plan accepts at most {max} points, found {found}")]
    TooManyPoints { found: usize, max: usize },

    #[error("row {row}: offset is not after the previous row")]
    NonIncreasingOffset { row: usize },

    #[error("row {row}, tank {tank}: {value} °C is outside {min}..={max} °C")]
    TemperatureOutOfRange {
        row: usize,
        tank: usize,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Interpolation between ramp points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InterpolationMode {
    Linear,
}

impl FromStr for InterpolationMode {
    type Err = RampPlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LINEAR" => Ok(InterpolationMode::Linear),
            _ => Err(RampPlanError::UnknownInterpolation(s.to_string())),
        }
    }
}

impl fmt::Display for InterpolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpolationMode::Linear => write!(f, "LINEAR"),
        }
    }
}

/// Validation limits applied to every plan
#[derive(Debug, Clone, PartialEq)]
pub struct RampLimits {
    pub tank_count: usize,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub max_points: usize,
}

impl RampLimits {
    pub fn from_config(config: &RampConfig, tank_count: usize) -> Self {
        Self {
            tank_count,
            min_temperature: config.min_temperature,
            max_temperature: config.max_temperature,
            max_points: config.max_points,
        }
    }
}

/// One row of a plan
#[derive(Debug, Clone, PartialEq)]
pub struct RampPoint {
    /// Time since plan start
    pub offset: Duration,
    /// Target per tank, °C
    pub targets: Vec<f64>,
}

/// A validated ramp plan
#[derive(Debug, Clone, PartialEq)]
pub struct RampPlan {
    start: NaiveDateTime,
    interpolation: InterpolationMode,
    points: Vec<RampPoint>,
}

impl RampPlan {
    /// Build a plan, validating it against `limits`
    pub fn new(
        start: NaiveDateTime,
        interpolation: InterpolationMode,
        points: Vec<RampPoint>,
        limits: &RampLimits,
    ) -> Result<Self, RampPlanError> {
        if points.len() < 2 {
            return Err(RampPlanError::TooFewPoints(points.len()));
        }
        if points.len() > limits.max_points {
            return Err(RampPlanError::TooManyPoints {
                found: points.len(),
                max: limits.max_points,
            });
        }

        for (index, point) in points.iter().enumerate() {
            let row = index + 1;
            if point.targets.len() != limits.tank_count {
                return Err(RampPlanError::TankCountMismatch {
                    row,
                    expected: limits.tank_count,
                    found: point.targets.len(),
                });
            }
            if index > 0 && point.offset <= points[index - 1].offset {
                return Err(RampPlanError::NonIncreasingOffset { row });
            }
            for (tank, &value) in point.targets.iter().enumerate() {
                // NaN fails both comparisons and lands here as well
                if !(value >= limits.min_temperature && value <= limits.max_temperature) {
                    return Err(RampPlanError::TemperatureOutOfRange {
                        row,
                        tank: tank + 1,
                        value,
                        min: limits.min_temperature,
                        max: limits.max_temperature,
                    });
                }
            }
        }

        Ok(Self {
            start,
            interpolation,
            points,
        })
    }

    /// Parse the text form. START is anchored to `anchor_date`.
    pub fn parse(
        text: &str,
        anchor_date: NaiveDate,
        limits: &RampLimits,
    ) -> Result<Self, RampPlanError> {
        let mut start: Option<NaiveTime> = None;
        let mut interpolation: Option<InterpolationMode> = None;
        let mut points = Vec::new();
        let mut first_data_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with("//") {
                continue;
            }

            let mut fields = content.split_whitespace();
            let Some(head) = fields.next() else {
                continue;
            };

            match head.to_ascii_uppercase().as_str() {
                "START" => {
                    if start.is_some() {
                        return Err(RampPlanError::DuplicateDirective {
                            line,
                            directive: "START".to_string(),
                        });
                    }
                    let value = fields.next().unwrap_or_default();
                    start = Some(parse_time_of_day(value, line)?);
                }
                "INTERP" => {
                    if interpolation.is_some() {
                        return Err(RampPlanError::DuplicateDirective {
                            line,
                            directive: "INTERP".to_string(),
                        });
                    }
                    let value = fields.next().unwrap_or_default();
                    interpolation = Some(value.parse()?);
                }
                _ => {
                    if first_data_line == 0 {
                        first_data_line = line;
                    }
                    let offset = parse_offset(head, line)?;
                    let targets = fields
                        .map(|value| {
                            value
                                .parse::<f64>()
                                .map_err(|_| RampPlanError::InvalidTemperature {
                                    line,
                                    value: value.to_string(),
                                })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    points.push(RampPoint { offset, targets });
                }
            }
        }

        let start = start.ok_or(RampPlanError::MissingStart {
            line: first_data_line.max(1),
        })?;

        Self::new(
            anchor_date.and_time(start),
            interpolation.unwrap_or(InterpolationMode::Linear),
            points,
            limits,
        )
    }

    /// Default plan for `limits.tank_count` tanks: the first half of the tanks
    /// hold 30 °C as controls, the others ramp to 33 °C, hold, and return.
    ///
    /// The default is validated like any other plan, so it is refused when
    /// the configured limits do not admit it.
    pub fn default_plan(
        anchor_date: NaiveDate,
        limits: &RampLimits,
    ) -> Result<Self, RampPlanError> {
        let tank_count = limits.tank_count;
        let controls = tank_count.div_ceil(2);
        let row = |hours: i64, stressed: f64| RampPoint {
            offset: Duration::hours(hours),
            targets: (0..tank_count)
                .map(|tank| if tank < controls { 30.0 } else { stressed })
                .collect(),
        };
        let start = NaiveTime::from_hms_opt(13, 0, 0).unwrap_or(NaiveTime::MIN);

        Self::new(
            anchor_date.and_time(start),
            InterpolationMode::Linear,
            vec![row(0, 30.0), row(3, 33.0), row(6, 33.0), row(7, 30.0)],
            limits,
        )
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn interpolation(&self) -> InterpolationMode {
        self.interpolation
    }

    pub fn points(&self) -> &[RampPoint] {
        &self.points
    }

    pub fn tank_count(&self) -> usize {
        self.points.first().map(|p| p.targets.len()).unwrap_or(0)
    }

    /// Offset of the last point
    pub fn duration(&self) -> Duration {
        self.points.last().map(|p| p.offset).unwrap_or_else(Duration::zero)
    }

    /// Targets after `elapsed` since the plan start
    pub fn targets_at(&self, elapsed: Duration) -> Vec<f64> {
        let elapsed = elapsed.max(Duration::zero());
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return Vec::new();
        };

        if elapsed <= first.offset {
            return first.targets.clone();
        }
        if elapsed >= last.offset {
            return last.targets.clone();
        }

        // Index of the first point strictly after `elapsed`; the one before brackets it.
        let next = self.points.partition_point(|p| p.offset <= elapsed);
        let a = &self.points[next - 1];
        let b = &self.points[next];
        match self.interpolation {
            InterpolationMode::Linear => {
                let span = (b.offset - a.offset).num_milliseconds() as f64;
                let fraction = (elapsed - a.offset).num_milliseconds() as f64 / span;
                a.targets
                    .iter()
                    .zip(&b.targets)
                    .map(|(from, to)| from + (to - from) * fraction)
                    .collect()
            }
        }
    }

    /// Text form, accepted back by [`RampPlan::parse`]
    pub fn to_text(&self) -> String {
        let mut text = format!(
            "START {}\nINTERP {}\n",
            self.start.format("%H:%M"),
            self.interpolation
        );
        for point in &self.points {
            text.push_str(&format_offset(point.offset));
            for target in &point.targets {
                text.push('\t');
                text.push_str(&target.to_string());
            }
            text.push('\n');
        }
        text
    }

    /// Text form preceded by an `// anchored YYYY-MM-DD` line, so that a
    /// reload restores the absolute start instead of re-anchoring it
    pub fn to_persisted_text(&self) -> String {
        anchored_text(&self.to_text(), self.start.date())
    }
}

const ANCHOR_PREFIX: &str = "// anchored ";

/// Plan text with the anchor date recorded in a leading comment line
pub fn anchored_text(text: &str, anchor: NaiveDate) -> String {
    format!("{}{}\n{}", ANCHOR_PREFIX, anchor.format("%Y-%m-%d"), text)
}

/// Anchor date recorded by [`RampPlan::to_persisted_text`], if any
pub fn persisted_anchor(text: &str) -> Option<NaiveDate> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(ANCHOR_PREFIX))
        .and_then(|date| NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok())
}

fn parse_time_of_day(value: &str, line: usize) -> Result<NaiveTime, RampPlanError> {
    let offset = parse_offset(value, line)?;
    let minutes = offset.num_minutes();
    NaiveTime::from_hms_opt((minutes / 60) as u32, (minutes % 60) as u32, 0).ok_or_else(|| {
        RampPlanError::InvalidTime {
            line,
            value: value.to_string(),
        }
    })
}

fn parse_offset(value: &str, line: usize) -> Result<Duration, RampPlanError> {
    let invalid = || RampPlanError::InvalidTime {
        line,
        value: value.to_string(),
    };
    let (hours, minutes) = value.split_once(':').ok_or_else(invalid)?;
    let hours: i64 = hours.parse().map_err(|_| invalid())?;
    let minutes: i64 = minutes.parse().map_err(|_| invalid())?;
    if !(0..10_000).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    Ok(Duration::minutes(hours * 60 + minutes))
}

fn format_offset(offset: Duration) -> String {
    let minutes = offset.num_minutes();
    format!("{}:{:02}", minutes / 60, minutes % 60)
}

/// JSON form of a plan, as submitted by the web client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampPlanRequest {
    /// Time of day, `hh:mm`
    pub start: String,
    /// Interpolation mode, LINEAR when absent
    #[serde(default)]
    pub interpolation: Option<String>,
    pub rows: Vec<RampRowRequest>,
}

/// One plan row in JSON form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampRowRequest {
    /// Offset since START, `h:mm`
    pub offset: String,
    pub targets: Vec<f64>,
}

impl RampPlanRequest {
    /// Validate into a plan anchored to `anchor_date`
    pub fn into_plan(
        self,
        anchor_date: NaiveDate,
        limits: &RampLimits,
    ) -> Result<RampPlan, RampPlanError> {
        let start = parse_time_of_day(&self.start, 0)?;
        let interpolation = match self.interpolation {
            Some(mode) => mode.parse()?,
            None => InterpolationMode::Linear,
        };
        let points = self
            .rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| {
                Ok(RampPoint {
                    offset: parse_offset(&row.offset, index + 1)?,
                    targets: row.targets,
                })
            })
            .collect::<Result<Vec<_>, RampPlanError>>()?;
        RampPlan::new(anchor_date.and_time(start), interpolation, points, limits)
    }
}

/// Read-only view of a plan for the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampPlanView {
    pub start: String,
    pub start_datetime: NaiveDateTime,
    pub interpolation: InterpolationMode,
    pub rows: Vec<RampRowRequest>,
    pub text: String,
}

impl From<&RampPlan> for RampPlanView {
    fn from(plan: &RampPlan) -> Self {
        Self {
            start: format!("{:02}:{:02}", plan.start.hour(), plan.start.minute()),
            start_datetime: plan.start,
            interpolation: plan.interpolation,
            rows: plan
                .points
                .iter()
                .map(|p| RampRowRequest {
                    offset: format_offset(p.offset),
                    targets: p.targets.clone(),
                })
                .collect(),
            text: plan.to_text(),
        }
    }
}

/// Holds the plan in force and turns time into per-tank targets
///
/// The plan is shared behind an `Arc`; replacing it swaps the handle and the
/// next call to [`RampScheduler::targets`] sees the new plan.
#[derive(Debug, Clone)]
pub struct RampScheduler {
    plan: Arc<RampPlan>,
}

impl RampScheduler {
    pub fn new(plan: RampPlan) -> Self {
        Self {
            plan: Arc::new(plan),
        }
    }

    pub fn plan(&self) -> Arc<RampPlan> {
        Arc::clone(&self.plan)
    }

    pub fn replace(&mut self, plan: RampPlan) {
        self.plan = Arc::new(plan);
    }

    /// Time since the plan start, never negative
    pub fn elapsed(&self, now: NaiveDateTime) -> Duration {
        (now - self.plan.start).max(Duration::zero())
    }

    /// Targets at absolute time `now`
    pub fn targets(&self, now: NaiveDateTime) -> Vec<f64> {
        self.plan.targets_at(self.elapsed(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    fn limits(tanks: usize) -> RampLimits {
        RampLimits {
            tank_count: tanks,
            min_temperature: 5.0,
            max_temperature: 50.0,
            max_points: 20,
        }
    }

    const TWO_ROWS: &str = "START 13:00\nINTERP LINEAR\n0:00\t30\t30\t30\t30\n3:00\t30\t30\t33\t33\n";

    #[test]
    fn test_parse_and_interpolate() {
        let plan = RampPlan::parse(TWO_ROWS, day(), &limits(4)).unwrap();
        assert_eq!(plan.start(), day().and_hms_opt(13, 0, 0).unwrap());
        let scheduler = RampScheduler::new(plan);

        let mid = scheduler.targets(day().and_hms_opt(14, 30, 0).unwrap());
        assert_eq!(mid.len(), 4);
        assert_relative_eq!(mid[0], 30.0);
        assert_relative_eq!(mid[1], 30.0);
        assert_relative_eq!(mid[2], 31.5);
        assert_relative_eq!(mid[3], 31.5);
    }

    #[test]
    fn test_holds_before_and_after() {
        let scheduler = RampScheduler::new(RampPlan::parse(TWO_ROWS, day(), &limits(4)).unwrap());
        let before = scheduler.targets(day().and_hms_opt(8, 0, 0).unwrap());
        assert_eq!(before, vec![30.0; 4]);
        let after = scheduler.targets(day().and_hms_opt(23, 59, 0).unwrap());
        assert_eq!(after, vec![30.0, 30.0, 33.0, 33.0]);
    }

    #[test]
    fn test_interp_is_optional_and_comments_are_skipped() {
        let text = "// test ramp\nSTART 9:30\n  // indented comment\n0:00 20\n27:15 25\n";
        let plan = RampPlan::parse(text, day(), &limits(1)).unwrap();
        assert_eq!(plan.interpolation(), InterpolationMode::Linear);
        assert_eq!(plan.points()[1].offset, Duration::minutes(27 * 60 + 15));
    }

    #[test]
    fn test_rejections() {
        let cases = [
            ("START 13:00\n0:00 30 30\n", RampPlanError::TooFewPoints(1)),
            (
                "START 13:00\nINTERP CUBIC\n0:00 30 30\n1:00 30 30\n",
                RampPlanError::UnknownInterpolation("CUBIC".to_string()),
            ),
            (
                "START 13:00\n0:00 30 30\n0:00 31 31\n",
                RampPlanError::NonIncreasingOffset { row: 2 },
            ),
            (
                "START 13:00\n0:00 30 30\n1:00 31\n",
                RampPlanError::TankCountMismatch {
                    row: 2,
                    expected: 2,
                    found: 1,
                },
            ),
            (
                "0:00 30 30\n1:00 31 31\n",
                RampPlanError::MissingStart { line: 1 },
            ),
        ];
        for (text, expected) in cases {
            assert_eq!(RampPlan::parse(text, day(), &limits(2)).unwrap_err(), expected);
        }

        let hot = RampPlan::parse("START 13:00\n0:00 30 30\n1:00 30 80\n", day(), &limits(2));
        assert!(matches!(
            hot,
            Err(RampPlanError::TemperatureOutOfRange { row: 2, tank: 2, .. })
        ));

        let bad_time = RampPlan::parse("START 25:00\n0:00 30\n1:00 30\n", day(), &limits(1));
        assert!(matches!(bad_time, Err(RampPlanError::InvalidTime { line: 1, .. })));
    }

    #[test]
    fn test_default_plan_shape() {
        let plan = RampPlan::default_plan(day(), &limits(4)).unwrap();
        assert_eq!(plan.to_text(), "START 13:00\nINTERP LINEAR\n0:00\t30\t30\t30\t30\n3:00\t30\t30\t33\t33\n6:00\t30\t30\t33\t33\n7:00\t30\t30\t30\t30\n");

        let odd = RampPlan::default_plan(day(), &limits(3)).unwrap();
        assert_eq!(odd.points()[1].targets, vec![30.0, 30.0, 33.0]);
    }

    #[test]
    fn test_default_plan_respects_limits() {
        let cool = RampLimits {
            max_temperature: 31.0,
            ..limits(4)
        };
        assert!(matches!(
            RampPlan::default_plan(day(), &cool),
            Err(RampPlanError::TemperatureOutOfRange { row: 2, tank: 3, .. })
        ));

        let short = RampLimits {
            max_points: 3,
            ..limits(4)
        };
        assert_eq!(
            RampPlan::default_plan(day(), &short).unwrap_err(),
            RampPlanError::TooManyPoints { found: 4, max: 3 }
        );
    }

    #[test]
    fn test_text_form_reparses() {
        let plan = RampPlan::default_plan(day(), &limits(8)).unwrap();
        let reparsed = RampPlan::parse(&plan.to_text(), day(), &limits(8)).unwrap();
        assert_eq!(plan, reparsed);
    }

    #[test]
    fn test_persisted_text_keeps_the_anchor() {
        let plan = RampPlan::parse(TWO_ROWS, day(), &limits(4)).unwrap();
        let text = plan.to_persisted_text();
        assert!(text.starts_with("// anchored 2024-07-01\nSTART 13:00\n"));

        let anchor = persisted_anchor(&text).unwrap();
        assert_eq!(anchor, day());
        let next_day = day().succ_opt().unwrap();
        assert_eq!(RampPlan::parse(&text, anchor, &limits(4)).unwrap(), plan);
        assert_eq!(persisted_anchor(TWO_ROWS), None);
        assert_eq!(persisted_anchor("// anchored yesterday\n"), None);
        assert_ne!(RampPlan::parse(&text, next_day, &limits(4)).unwrap(), plan);
    }

    #[test]
    fn test_json_request() {
        let request: RampPlanRequest = serde_json::from_value(serde_json::json!({
            "start": "06:15",
            "rows": [
                { "offset": "0:00", "targets": [28.0, 28.0] },
                { "offset": "1:30", "targets": [28.0, 32.5] }
            ]
        }))
        .unwrap();
        let plan = request.into_plan(day(), &limits(2)).unwrap();
        assert_eq!(plan.start(), day().and_hms_opt(6, 15, 0).unwrap());
        let view = RampPlanView::from(&plan);
        assert_eq!(view.start, "06:15");
        assert_eq!(view.rows[1].offset, "1:30");
    }
}
