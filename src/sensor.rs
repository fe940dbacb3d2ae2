use crate::register::{OperatingMode, SensorValue};

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;

/// The logical sensor groups the poll boundary exposes. Each maps to a
/// handful of registers the dispatcher reads in as few bursts as the
/// table allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorGroup {
    Battery,
    Pv,
    Grid,
    Output,
    System,
}

impl SensorGroup {
    pub fn all() -> &'static [SensorGroup] {
        &[
            Self::Battery,
            Self::Pv,
            Self::Grid,
            Self::Output,
            Self::System,
        ]
    }

    pub fn sensors(&self) -> &'static [&'static str] {
        match self {
            Self::Battery => &[
                "battery_voltage",
                "battery_current",
                "battery_power",
                "battery_soc",
                "battery_temperature",
            ],
            Self::Pv => &[
                "pv_total_power",
                "pv_charging_power",
                "pv_charging_current",
                "pv_temperature",
                "pv1_voltage",
                "pv1_current",
                "pv1_power",
                "pv2_voltage",
                "pv2_current",
                "pv2_power",
            ],
            Self::Grid => &["grid_voltage", "grid_power", "grid_frequency"],
            Self::Output => &[
                "output_voltage",
                "output_current",
                "output_power",
                "output_apparent_power",
                "output_load_percentage",
                "output_frequency",
            ],
            Self::System => &["serial_number", "operating_mode", "fault_bits"],
        }
    }
}

impl std::fmt::Display for SensorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Battery => "battery",
            Self::Pv => "pv",
            Self::Grid => "grid",
            Self::Output => "output",
            Self::System => "system",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SensorGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "battery" => Ok(Self::Battery),
            "pv" | "solar" => Ok(Self::Pv),
            "grid" => Ok(Self::Grid),
            "output" => Ok(Self::Output),
            "system" => Ok(Self::System),
            _ => Err(anyhow::anyhow!("unknown sensor group '{}'", s)),
        }
    }
}

// {{{ typed views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryData {
    pub voltage: f64,
    pub current: f64,
    pub power: i64,
    pub soc: i64,
    pub temperature: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PvData {
    pub total_power: i64,
    pub charging_power: i64,
    pub charging_current: f64,
    pub temperature: i64,
    pub pv1_voltage: f64,
    pub pv1_current: f64,
    pub pv1_power: i64,
    // absent on single-string models
    pub pv2_voltage: Option<f64>,
    pub pv2_current: Option<f64>,
    pub pv2_power: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridData {
    pub voltage: f64,
    pub power: i64,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputData {
    pub voltage: f64,
    pub current: f64,
    pub power: i64,
    pub apparent_power: i64,
    pub load_percentage: i64,
    pub frequency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub operating_mode: OperatingMode,
    pub mode_name: String,
    pub serial_number: Option<String>,
    pub fault_bits: Option<u16>,
}
// }}}

fn float(values: &HashMap<String, SensorValue>, name: &str) -> Option<f64> {
    match values.get(name)? {
        SensorValue::Float(v) => Some(*v),
        SensorValue::Integer(v) => Some(*v as f64),
        _ => None,
    }
}

fn integer(values: &HashMap<String, SensorValue>, name: &str) -> Option<i64> {
    match values.get(name)? {
        SensorValue::Integer(v) => Some(*v),
        _ => None,
    }
}

impl BatteryData {
    pub fn from_values(values: &HashMap<String, SensorValue>) -> Option<Self> {
        Some(Self {
            voltage: float(values, "battery_voltage")?,
            current: float(values, "battery_current")?,
            power: integer(values, "battery_power")?,
            soc: integer(values, "battery_soc")?,
            temperature: integer(values, "battery_temperature")?,
        })
    }
}

impl PvData {
    pub fn from_values(values: &HashMap<String, SensorValue>) -> Option<Self> {
        Some(Self {
            total_power: integer(values, "pv_total_power")?,
            charging_power: integer(values, "pv_charging_power")?,
            charging_current: float(values, "pv_charging_current")?,
            temperature: integer(values, "pv_temperature")?,
            pv1_voltage: float(values, "pv1_voltage")?,
            pv1_current: float(values, "pv1_current")?,
            pv1_power: integer(values, "pv1_power")?,
            pv2_voltage: float(values, "pv2_voltage"),
            pv2_current: float(values, "pv2_current"),
            pv2_power: integer(values, "pv2_power"),
        })
    }
}

impl GridData {
    pub fn from_values(values: &HashMap<String, SensorValue>) -> Option<Self> {
        Some(Self {
            voltage: float(values, "grid_voltage")?,
            power: integer(values, "grid_power")?,
            frequency: float(values, "grid_frequency")?,
        })
    }
}

impl OutputData {
    pub fn from_values(values: &HashMap<String, SensorValue>) -> Option<Self> {
        Some(Self {
            voltage: float(values, "output_voltage")?,
            current: float(values, "output_current")?,
            power: integer(values, "output_power")?,
            apparent_power: integer(values, "output_apparent_power")?,
            load_percentage: integer(values, "output_load_percentage")?,
            frequency: float(values, "output_frequency")?,
        })
    }
}

impl SystemStatus {
    pub fn from_values(values: &HashMap<String, SensorValue>) -> Option<Self> {
        let mode = match values.get("operating_mode")? {
            SensorValue::Mode(m) => *m,
            _ => return None,
        };

        let serial_number = match values.get("serial_number") {
            Some(SensorValue::Text(s)) => Some(s.clone()),
            _ => None,
        };

        let fault_bits = match values.get("fault_bits") {
            Some(SensorValue::Bits(b)) => Some(*b),
            _ => None,
        };

        Some(Self {
            operating_mode: mode,
            mode_name: mode.to_string(),
            serial_number,
            fault_bits,
        })
    }
}

/// One full poll cycle's worth of readings, typed views included.
/// Published on the reporting channel; consumers keep the previous
/// snapshot when a cycle fails.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub time: DateTime<Local>,
    pub values: HashMap<String, SensorValue>,
    pub battery: Option<BatteryData>,
    pub pv: Option<PvData>,
    pub grid: Option<GridData>,
    pub output: Option<OutputData>,
    pub system: Option<SystemStatus>,
}

impl SensorSnapshot {
    pub fn from_values(values: HashMap<String, SensorValue>) -> Self {
        Self {
            time: Local::now(),
            battery: BatteryData::from_values(&values),
            pv: PvData::from_values(&values),
            grid: GridData::from_values(&values),
            output: OutputData::from_values(&values),
            system: SystemStatus::from_values(&values),
            values,
        }
    }
}
