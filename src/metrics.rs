use crate::types::{PowerModel, PORT_COUNT};

/// Per-port fields carried by the telemetry feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    Current,
    Voltage,
    State,
    Protocol,
}

impl MetricField {
    pub const ALL: [MetricField; 4] = [
        MetricField::Current,
        MetricField::Voltage,
        MetricField::State,
        MetricField::Protocol,
    ];

    /// Exposition-format metric name for this field.
    pub fn metric_name(self) -> &'static str {
        match self {
            MetricField::Current => "ionbridge_port_current",
            MetricField::Voltage => "ionbridge_port_voltage",
            MetricField::State => "ionbridge_port_state",
            MetricField::Protocol => "ionbridge_port_fc_protocol",
        }
    }
}

/// One `(port, field, value)` triple taken from a feed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub port: usize,
    pub field: MetricField,
    pub value: i64,
}

/// Sparse set of readings extracted from one payload, in feed order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialReadings {
    pub readings: Vec<Reading>,
    pub skipped_lines: usize,
}

impl PartialReadings {
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Merge into `model`. Ports and fields not present keep their previous values;
    /// power and total are recomputed for every port afterwards.
    pub fn fold_into(&self, model: &mut PowerModel) {
        for r in &self.readings {
            let Some(port) = model.ports.get_mut(r.port) else {
                continue;
            };
            match r.field {
                MetricField::Current => port.current_milliamps = r.value,
                MetricField::Voltage => port.voltage_millivolts = r.value,
                MetricField::State => port.state = r.value,
                MetricField::Protocol => port.protocol = r.value,
            }
        }
        model.recompute();
    }
}

/// Parse a feed payload into readings.
///
/// Lines look like `metric{id="<n>"} <value>`. Unknown metrics, comments, and lines
/// that do not fit the brace/quote structure are counted in `skipped_lines` and
/// otherwise ignored. Port ids outside `0..PORT_COUNT` are dropped.
pub fn parse(payload: &str) -> PartialReadings {
    let mut out = PartialReadings::default();
    for raw_line in payload.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            LineResult::Reading(r) => out.readings.push(r),
            LineResult::Skip => out.skipped_lines += 1,
        }
    }
    out
}

enum LineResult {
    Reading(Reading),
    Skip,
}

fn parse_line(line: &str) -> LineResult {
    let Some((field, rest)) = match_metric(line) else {
        return LineResult::Skip;
    };

    // rest = `id="<n>"} <value>`; the id sits between the first two quotes.
    let mut quoted = rest.splitn(3, '"');
    let (Some(_), Some(id_str), Some(after_id)) = (quoted.next(), quoted.next(), quoted.next())
    else {
        return LineResult::Skip;
    };
    let Ok(id) = id_str.trim().parse::<i64>() else {
        return LineResult::Skip;
    };

    let Some((_, value_part)) = after_id.split_once('}') else {
        return LineResult::Skip;
    };
    let Some(value) = value_part.split_whitespace().next().and_then(parse_value) else {
        return LineResult::Skip;
    };

    if id < 0 || id as usize >= PORT_COUNT {
        return LineResult::Skip;
    }

    LineResult::Reading(Reading {
        port: id as usize,
        field,
        value,
    })
}

fn match_metric(line: &str) -> Option<(MetricField, &str)> {
    MetricField::ALL.iter().find_map(|&field| {
        line.strip_prefix(field.metric_name())
            .and_then(|rest| rest.strip_prefix('{'))
            .map(|rest| (field, rest))
    })
}

/// Integers are taken as-is; floats are truncated toward zero.
fn parse_value(s: &str) -> Option<i64> {
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() => Some(f.trunc() as i64),
        _ => None,
    }
}
