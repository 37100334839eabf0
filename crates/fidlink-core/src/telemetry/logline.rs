//! CSV log lines for accepted samples

use super::TelemetrySample;

type FieldFn = fn(&TelemetrySample) -> String;

fn flag(value: bool) -> String {
    let text = if value { "1" } else { "0" };
    text.to_string()
}

/// Logged columns, in order
pub static TELEMETRY_FIELDS: &[(&str, FieldFn)] = &[
    ("ppm", |s| format!("{}", s.composite_ppm)),
    ("short_ppm", |s| format!("{}", s.short_average_ppm)),
    ("long_ppm", |s| format!("{}", s.long_average_ppm)),
    ("raw_ppm", |s| format!("{:.1}", s.raw.raw_ppm)),
    ("pico_amps", |s| format!("{:.1}", s.raw.pico_amps)),
    ("thermocouple_c", |s| format!("{:.1}", s.raw.thermocouple_c)),
    ("internal_temp_c", |s| format!("{:.1}", s.raw.internal_temp_c)),
    ("battery_v", |s| format!("{:.2}", s.raw.battery_volts)),
    ("h2_tank_psi", |s| format!("{:.1}", s.raw.h2_tank_psi)),
    ("h2_low_psi", |s| format!("{:.1}", s.raw.h2_low_psi)),
    ("sample_psia", |s| format!("{:.2}", s.raw.sample_psia)),
    ("pump_power_pct", |s| format!("{:.1}", s.raw.pump_power_pct)),
    ("pump_current_ma", |s| format!("{:.0}", s.raw.pump_current_ma)),
    ("ignited", |s| flag(s.ignited)),
    ("range", |s| s.range.as_str().to_string()),
    ("stable", |s| flag(s.stable)),
    ("hw_avg", |s| s.raw.hardware_averaging.to_string()),
];

pub fn header_line() -> String {
    let mut line = String::from("timestamp");
    for (name, _) in TELEMETRY_FIELDS {
        line.push(',');
        line.push_str(name);
    }
    line
}

pub fn format_line(sample: &TelemetrySample) -> String {
    let mut line = sample.timestamp.to_rfc3339();
    for (_, field) in TELEMETRY_FIELDS {
        line.push(',');
        line.push_str(&field(sample));
    }
    line
}

/// Lines waiting to be flushed to a sink
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Vec<String>,
    flush_every: usize,
}

impl LogBuffer {
    pub fn new(flush_every: usize) -> Self {
        Self {
            lines: Vec::new(),
            flush_every: flush_every.max(1),
        }
    }

    /// Buffer a line; true once enough lines are waiting to flush
    pub fn push(&mut self, line: String) -> bool {
        self.lines.push(line);
        self.lines.len() >= self.flush_every
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }
}
