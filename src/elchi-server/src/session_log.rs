// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! In-memory session log and its CSV export.
//!
//! Every polled reading is appended to its own series while logging is on.
//! Each series keeps at most a fixed number of samples and drops its oldest
//! once full, so a session left running does not grow without bound.
//! Export folds the series onto whole UTC seconds; a second missing from a
//! series is written as `NaN`.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

/// Per-series cap by default, a week of 1 s polling.
pub const DEFAULT_MAX_SAMPLES: usize = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    SensorValue,
    ControllerPv,
    WorkingSetpoint,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// One exported line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRow {
    pub timestamp: i64,
    pub controller_pv: f64,
    pub power: f64,
    pub sensor_value: f64,
}

impl LogRow {
    fn empty(timestamp: i64) -> Self {
        Self {
            timestamp,
            controller_pv: f64::NAN,
            power: f64::NAN,
            sensor_value: f64::NAN,
        }
    }
}

#[derive(Debug)]
pub struct SessionLog {
    logging: bool,
    started: Option<DateTime<Utc>>,
    max_samples: usize,
    sensor_value: VecDeque<Sample>,
    controller_pv: VecDeque<Sample>,
    working_setpoint: VecDeque<Sample>,
    power: VecDeque<Sample>,
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_SAMPLES)
    }
}

impl SessionLog {
    /// Empty log keeping at most `max_samples` per series.
    pub fn with_limit(max_samples: usize) -> Self {
        Self {
            logging: false,
            started: None,
            max_samples: max_samples.max(1),
            sensor_value: VecDeque::new(),
            controller_pv: VecDeque::new(),
            working_setpoint: VecDeque::new(),
            power: VecDeque::new(),
        }
    }

    /// Start or resume. A paused session keeps its original start time.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.logging = true;
        self.started.get_or_insert(now);
    }

    pub fn stop(&mut self) {
        self.logging = false;
    }

    /// Drop all samples and the start time.
    pub fn clear(&mut self) {
        *self = Self::with_limit(self.max_samples);
    }

    /// Seconds since the session started, 0 without a session.
    pub fn elapsed(&self, now: DateTime<Utc>) -> f64 {
        match self.started {
            Some(start) => (now - start).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }

    pub fn record(&mut self, series: Series, value: f64, now: DateTime<Utc>) {
        if !self.logging {
            return;
        }
        let max = self.max_samples;
        let samples = self.series_mut(series);
        if samples.len() >= max {
            samples.pop_front();
        }
        samples.push_back(Sample { time: now, value });
    }

    fn series_mut(&mut self, series: Series) -> &mut VecDeque<Sample> {
        match series {
            Series::SensorValue => &mut self.sensor_value,
            Series::ControllerPv => &mut self.controller_pv,
            Series::WorkingSetpoint => &mut self.working_setpoint,
            Series::Power => &mut self.power,
        }
    }

    /// Align the exported series on whole seconds. The last sample within a
    /// second wins.
    pub fn rows(&self) -> Vec<LogRow> {
        let mut rows: BTreeMap<i64, LogRow> = BTreeMap::new();
        let mut fold = |samples: &VecDeque<Sample>, set: fn(&mut LogRow, f64)| {
            for sample in samples {
                let ts = sample.time.timestamp();
                set(rows.entry(ts).or_insert_with(|| LogRow::empty(ts)), sample.value);
            }
        };
        fold(&self.controller_pv, |row, v| row.controller_pv = v);
        fold(&self.power, |row, v| row.power = v);
        fold(&self.sensor_value, |row, v| row.sensor_value = v);
        rows.into_values().collect()
    }
}

/// Write rows as CSV. `unit` labels the PV and sensor columns.
pub fn write_csv<W: Write>(out: W, rows: &[LogRow], unit: &str) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record([
        "UTC".to_string(),
        "Unix timestamp (s)".to_string(),
        format!("Process Variable ({})", unit),
        "Output Power (%)".to_string(),
        format!("Sensor Value ({})", unit),
    ])?;
    for row in rows {
        let utc = DateTime::<Utc>::from_timestamp(row.timestamp, 0)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_default();
        writer.write_record([
            utc,
            row.timestamp.to_string(),
            format!("{:.1}", row.controller_pv),
            format!("{:.1}", row.power),
            format!("{:.1}", row.sensor_value),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Create `path` (and its directory) and export into it. Blocking.
pub fn export_csv(path: &Path, rows: &[LogRow], unit: &str) -> Result<usize, String> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_dir_all(dir).map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;
    }
    let file =
        File::create(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    write_csv(BufWriter::new(file), rows, unit).map_err(|e| e.to_string())?;
    Ok(rows.len())
}
