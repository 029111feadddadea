//! Synthetic pedestal scan: no hardware, random readouts, a per-channel
//! linear fit and a board verdict. Exercises every part of the run path.

use crate::capability::{Capabilities, CapabilityKind};
use crate::contract::{ArgDecl, BoundArguments, InterfaceDecl, TaskType};
use crate::procedure::{Procedure, ProcedureContext};
use crate::validate::Range;
use anyhow::{anyhow, Result};
use qc_core::{DataEntry, SingularResult};
use rand::Rng;
use serde_json::{json, Value};
use std::f64::consts::PI;
use std::time::Duration;

pub const NAME: &str = "dummy_procedure";
pub const N_CHANNELS: u32 = 72;

const BASE_PEDESTAL: f64 = 75.0;
const SHIFT_SLOPE: f64 = 1.5;
const NOISE_SIGMA: f64 = 2.0;

const STATUS_OUT_OF_RANGE: i64 = 2;
const STATUS_FIT_FAILED: i64 = 2;

pub fn task() -> Result<TaskType> {
    Ok(TaskType {
        name: NAME,
        doc: "Dummy procedure for testing: scans a shift setting over random readouts and fits the optimal shift per channel.",
        arguments: vec![
            ArgDecl::int("target", "Target normalization value"),
            ArgDecl::int("n_events", "Number of events to collect").with_default(200),
            ArgDecl::int("lower_range", "Lower shift range")
                .with_default(-5)
                .validate(Range::new(-10.0, 0.0)?),
            ArgDecl::int("upper_range", "Upper shift range")
                .with_default(5)
                .validate(Range::new(0.0, 10.0)?),
            ArgDecl::float("pause", "Time between DAQ calls (seconds)")
                .with_default(0.5)
                .validate(Range::new(0.1, 2.0)?),
        ],
        interfaces: vec![
            InterfaceDecl::capability("iterate", CapabilityKind::Iterate),
            InterfaceDecl::capability("session_log", CapabilityKind::SessionLog),
        ],
        build,
    })
}

fn build(args: &BoundArguments) -> Result<Box<dyn Procedure>> {
    let n_events = args.int("n_events")?;
    if n_events <= 0 {
        return Err(anyhow!("n_events must be positive (got {})", n_events));
    }
    Ok(Box::new(DummyProcedure {
        target: args.int("target")?,
        n_events: n_events as usize,
        lower_range: args.int("lower_range")?,
        upper_range: args.int("upper_range")?,
        pause: Duration::from_secs_f64(args.float("pause")?),
    }))
}

/// Response shape of the simulated channels; rotates with session history
/// so repeated runs do not all look alike.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Profile {
    Linear,
    Mild,
    Steep,
}

impl Profile {
    fn from_history(prior_runs: usize) -> Self {
        match prior_runs % 3 {
            0 => Self::Linear,
            1 => Self::Mild,
            _ => Self::Steep,
        }
    }

    fn curvature(self) -> f64 {
        match self {
            Self::Linear => 0.0,
            Self::Mild => 0.5,
            Self::Steep => 2.0,
        }
    }

    fn pedestal(self, shift: i64) -> f64 {
        let s = shift as f64;
        BASE_PEDESTAL - s * SHIFT_SLOPE - s * s * self.curvature()
    }
}

/// Per-channel mean and spread at one shift value.
struct ScanPoint {
    shift: i64,
    stats: Vec<(f64, f64)>,
}

struct DummyProcedure {
    target: i64,
    n_events: usize,
    lower_range: i64,
    upper_range: i64,
    pause: Duration,
}

impl DummyProcedure {
    fn readout(
        &self,
        ctx: &mut ProcedureContext,
        profile: Profile,
        shift: i64,
        file: &str,
        desc: &str,
    ) -> Result<Vec<Vec<i64>>> {
        let mut rng = rand::thread_rng();
        let loc = profile.pedestal(shift);
        let data: Vec<Vec<i64>> = (0..N_CHANNELS)
            .map(|_| {
                (0..self.n_events)
                    .map(|_| gaussian(&mut rng, loc, NOISE_SIGMA).round() as i64)
                    .collect()
            })
            .collect();
        ctx.write_json(
            file,
            &json!({"shift": shift, "n_events": self.n_events, "readout": data}),
        )?;
        ctx.record_data(DataEntry::new(file, desc).with("shift", shift));
        Ok(data)
    }

    fn fit_channel(&self, channel: u32, scan: &[ScanPoint]) -> SingularResult {
        let points: Vec<(f64, f64, f64)> = scan
            .iter()
            .map(|p| {
                let (mean, std) = p.stats[channel as usize];
                (p.shift as f64, mean, std)
            })
            .collect();
        let Some((slope, intercept)) = weighted_linear_fit(&points) else {
            return SingularResult::channel(channel, STATUS_FIT_FAILED, "FIT FAILED")
                .with("shift", 0)
                .with("fit_param", json!([Value::Null, Value::Null]));
        };
        let fit_param = json!([slope, intercept]);
        let opt = ((self.target as f64 - intercept) / slope).round() as i64;
        if opt > self.upper_range || opt < self.lower_range {
            return SingularResult::channel(channel, STATUS_OUT_OF_RANGE, "OUT OF RANGE")
                .with("shift", 0)
                .with("fit_param", fit_param);
        }
        SingularResult::channel(channel, 0, "SUCCESS")
            .with("shift", opt)
            .with("fit_param", fit_param)
    }
}

impl Procedure for DummyProcedure {
    fn run(&mut self, ctx: &mut ProcedureContext, caps: &mut Capabilities<'_>) -> Result<()> {
        let profile = Profile::from_history(caps.session_log()?.len());
        let iterate = caps.iterate()?.clone();

        ctx.log_info("Running initial scan with no shift");
        self.readout(ctx, profile, 0, "dummy_initial.json", "Initial readout")?;

        ctx.log_info("Running scan");
        let mut scan = Vec::new();
        for shift in iterate.over(self.lower_range..self.upper_range, "Shifting settings value") {
            let shift = shift?;
            let data = self.readout(
                ctx,
                profile,
                shift,
                &format!("dummy_shift{}.json", shift),
                &format!("shifted_readout_{}", shift),
            )?;
            scan.push(ScanPoint {
                shift,
                stats: data.iter().map(|events| mean_std(events)).collect(),
            });
            std::thread::sleep(self.pause);
        }

        ctx.log_info("Running fit");
        let mut channels = Vec::with_capacity(N_CHANNELS as usize);
        for channel in iterate.over(0..N_CHANNELS, "Running fit on channels") {
            channels.push(self.fit_channel(channel?, &scan));
        }

        ctx.log_info("Generating summary");
        let board = board_summary(&channels);
        ctx.set_channel_summary(channels)?;
        ctx.set_board_summary(board)?;

        ctx.log_info("Saving final readout");
        self.readout(ctx, profile, 0, "dummy_final.json", "Final_readout")?;
        Ok(())
    }
}

fn board_summary(channels: &[SingularResult]) -> SingularResult {
    let failed: Vec<usize> = channels
        .iter()
        .enumerate()
        .filter(|(_, c)| c.status != 0)
        .map(|(i, _)| i)
        .collect();
    if failed.is_empty() {
        SingularResult::board(0, "SUCCESS")
    } else {
        SingularResult::board(1, "HAS FAILED").with("fail_idx", json!(failed))
    }
}

fn gaussian(rng: &mut impl Rng, mean: f64, sigma: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    mean + sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn mean_std(events: &[i64]) -> (f64, f64) {
    if events.is_empty() {
        return (0.0, 0.0);
    }
    let n = events.len() as f64;
    let mean = events.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = events
        .iter()
        .map(|v| (*v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

/// Least squares `y = slope * x + intercept` with per-point sigma weights.
/// `None` when the fit is degenerate.
fn weighted_linear_fit(points: &[(f64, f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let (mut s, mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y, sigma) in points {
        let w = if *sigma > 0.0 { 1.0 / (sigma * sigma) } else { 1.0 };
        s += w;
        sx += w * x;
        sy += w * y;
        sxx += w * x * x;
        sxy += w * x * y;
    }
    let delta = s * sxx - sx * sx;
    if delta.abs() < f64::EPSILON {
        return None;
    }
    let slope = (s * sxy - sx * sy) / delta;
    let intercept = (sxx * sy - sx * sxy) / delta;
    if !slope.is_finite() || !intercept.is_finite() || slope == 0.0 {
        return None;
    }
    Some((slope, intercept))
}
