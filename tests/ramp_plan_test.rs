// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-thermal-stress project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

mod common;

use anyhow::Result;
use approx::assert_relative_eq;
use chrono::Duration;
use common::{at, PLAN_1300};
use rust_thermal_stress::config::RampConfig;
use rust_thermal_stress::thermal_regulation::ramp::{RampLimits, RampPlan, RampScheduler};
use tempfile::tempdir;

fn limits() -> RampLimits {
    RampLimits::from_config(&RampConfig::default(), 4)
}

#[test]
fn test_plan_file_with_windows_line_endings() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("ramp_plan.txt");
    std::fs::write(&path, PLAN_1300.replace('\n', "\r\n"))?;

    let text = std::fs::read_to_string(&path)?;
    let plan = RampPlan::parse(&text, at(0, 0).date(), &limits())?;
    assert_eq!(plan.start(), at(13, 0));
    assert_eq!(plan.points().len(), 2);
    Ok(())
}

#[test]
fn test_plan_runs_past_midnight() -> Result<()> {
    let text = "START 22:00\n0:00\t30\t30\t30\t30\n4:00\t30\t30\t34\t34\n26:00\t30\t30\t34\t34\n";
    let plan = RampPlan::parse(text, at(0, 0).date(), &limits())?;
    let scheduler = RampScheduler::new(plan);

    let next_day_one_am = at(22, 0) + Duration::hours(3);
    let targets = scheduler.targets(next_day_one_am);
    assert_relative_eq!(targets[2], 33.0, epsilon = 1e-9);
    assert_eq!(scheduler.plan().duration(), Duration::hours(26));
    Ok(())
}

#[test]
fn test_targets_are_pure() -> Result<()> {
    let scheduler = RampScheduler::new(RampPlan::parse(PLAN_1300, at(0, 0).date(), &limits())?);
    let first = scheduler.targets(at(14, 10));
    for _ in 0..10 {
        assert_eq!(scheduler.targets(at(14, 10)), first);
    }
    Ok(())
}

#[test]
fn test_replacement_is_seen_on_next_query() -> Result<()> {
    let mut scheduler =
        RampScheduler::new(RampPlan::parse(PLAN_1300, at(0, 0).date(), &limits())?);
    let held = scheduler.plan();

    scheduler.replace(RampPlan::default_plan(at(0, 0).date(), &limits())?);
    assert_eq!(scheduler.targets(at(20, 30)), vec![30.0; 4]);
    // Handles taken before the swap keep the old plan
    assert_eq!(held.points().len(), 2);
    Ok(())
}
