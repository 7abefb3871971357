//! Telemetry point schema, its compressed wire form, and the per-lap unit.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::stats::{compute_metadata, sector_timings};

/// One sampled instant of vehicle state.
///
/// Times are milliseconds since the Unix epoch. `received_at` is when the
/// logger stored the sample; `device_time` is the ECU clock, which can drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub received_at: f64,
    pub device_time: Option<f64>,
    pub lap: u32,
    pub speed: Option<f64>,
    pub steering_angle: Option<f64>,
    pub brake_front: Option<f64>,
    pub brake_rear: Option<f64>,
    pub throttle: Option<f64>,
    pub rpm: Option<f64>,
    pub gear: Option<f64>,
    pub acc_x: Option<f64>,
    pub acc_y: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub lap_distance: Option<f64>,
}

impl TelemetryPoint {
    /// A point with only its timing fields set
    pub fn at(received_at: f64, lap: u32) -> Self {
        Self {
            received_at,
            device_time: None,
            lap,
            speed: None,
            steering_angle: None,
            brake_front: None,
            brake_rear: None,
            throttle: None,
            rpm: None,
            gear: None,
            acc_x: None,
            acc_y: None,
            latitude: None,
            longitude: None,
            lap_distance: None,
        }
    }

    pub fn value(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::Speed => self.speed,
            Channel::SteeringAngle => self.steering_angle,
            Channel::BrakeFront => self.brake_front,
            Channel::BrakeRear => self.brake_rear,
            Channel::Throttle => self.throttle,
            Channel::Rpm => self.rpm,
            Channel::Gear => self.gear,
            Channel::AccX => self.acc_x,
            Channel::AccY => self.acc_y,
            Channel::Latitude => self.latitude,
            Channel::Longitude => self.longitude,
            Channel::LapDistance => self.lap_distance,
        }
    }

    pub(crate) fn value_mut(&mut self, channel: Channel) -> &mut Option<f64> {
        match channel {
            Channel::Speed => &mut self.speed,
            Channel::SteeringAngle => &mut self.steering_angle,
            Channel::BrakeFront => &mut self.brake_front,
            Channel::BrakeRear => &mut self.brake_rear,
            Channel::Throttle => &mut self.throttle,
            Channel::Rpm => &mut self.rpm,
            Channel::Gear => &mut self.gear,
            Channel::AccX => &mut self.acc_x,
            Channel::AccY => &mut self.acc_y,
            Channel::Latitude => &mut self.latitude,
            Channel::Longitude => &mut self.longitude,
            Channel::LapDistance => &mut self.lap_distance,
        }
    }
}

/// Numeric channels a point can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Speed,
    SteeringAngle,
    BrakeFront,
    BrakeRear,
    Throttle,
    Rpm,
    Gear,
    AccX,
    AccY,
    Latitude,
    Longitude,
    LapDistance,
}

impl Channel {
    pub const ALL: [Channel; 12] = [
        Channel::Speed,
        Channel::SteeringAngle,
        Channel::BrakeFront,
        Channel::BrakeRear,
        Channel::Throttle,
        Channel::Rpm,
        Channel::Gear,
        Channel::AccX,
        Channel::AccY,
        Channel::Latitude,
        Channel::Longitude,
        Channel::LapDistance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Speed => "speed",
            Channel::SteeringAngle => "steering_angle",
            Channel::BrakeFront => "brake_front",
            Channel::BrakeRear => "brake_rear",
            Channel::Throttle => "throttle",
            Channel::Rpm => "rpm",
            Channel::Gear => "gear",
            Channel::AccX => "acc_x",
            Channel::AccY => "acc_y",
            Channel::Latitude => "latitude",
            Channel::Longitude => "longitude",
            Channel::LapDistance => "lap_distance",
        }
    }

    /// Column name used by the trackside data logger exports
    pub fn logger_name(&self) -> &'static str {
        match self {
            Channel::Speed => "speed",
            Channel::SteeringAngle => "Steering_Angle",
            Channel::BrakeFront => "pbrake_f",
            Channel::BrakeRear => "pbrake_r",
            Channel::Throttle => "aps",
            Channel::Rpm => "nmot",
            Channel::Gear => "gear",
            Channel::AccX => "accx_can",
            Channel::AccY => "accy_can",
            Channel::Latitude => "VBOX_Lat_Min",
            Channel::Longitude => "VBOX_Long_Minutes",
            Channel::LapDistance => "Laptrigger_lapdist_dls",
        }
    }

    pub fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| {
            c.name().eq_ignore_ascii_case(name) || c.logger_name().eq_ignore_ascii_case(name)
        })
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Short-key wire form of a `TelemetryPoint`.
///
/// A missing key and an explicit `null` both mean "no reading"; zero is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedPoint {
    pub t: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<f64>,
    pub l: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sa: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bf: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub br: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub th: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ax: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub la: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lo: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld: Option<f64>,
}

impl CompressedPoint {
    /// Expand to the full schema
    pub fn expand(self) -> TelemetryPoint {
        TelemetryPoint {
            received_at: self.t,
            device_time: self.d,
            lap: self.l,
            speed: self.s,
            steering_angle: self.sa,
            brake_front: self.bf,
            brake_rear: self.br,
            throttle: self.th,
            rpm: self.r,
            gear: self.g,
            acc_x: self.ax,
            acc_y: self.ay,
            latitude: self.la,
            longitude: self.lo,
            lap_distance: self.ld,
        }
    }
}

impl From<&TelemetryPoint> for CompressedPoint {
    fn from(p: &TelemetryPoint) -> Self {
        Self {
            t: p.received_at,
            d: p.device_time,
            l: p.lap,
            s: p.speed,
            sa: p.steering_angle,
            bf: p.brake_front,
            br: p.brake_rear,
            th: p.throttle,
            r: p.rpm,
            g: p.gear,
            ax: p.acc_x,
            ay: p.acc_y,
            la: p.latitude,
            lo: p.longitude,
            ld: p.lap_distance,
        }
    }
}

impl From<CompressedPoint> for TelemetryPoint {
    fn from(c: CompressedPoint) -> Self {
        c.expand()
    }
}

/// Cache identity of a lap: `{track}_{driver}_{lap}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LapKey {
    pub track: String,
    pub driver: u32,
    pub lap: u32,
}

impl LapKey {
    pub fn new(track: impl Into<String>, driver: u32, lap: u32) -> Self {
        Self {
            track: track.into(),
            driver,
            lap,
        }
    }
}

impl fmt::Display for LapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.track, self.driver, self.lap)
    }
}

/// Summary statistics for a processed lap
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LapMetadata {
    pub duration_ms: f64,
    pub max_speed: Option<f64>,
    pub avg_speed: Option<f64>,
    pub point_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorTiming {
    /// 1-based sector number
    pub sector: usize,
    pub start_ms: f64,
    pub end_ms: f64,
    pub duration_ms: f64,
}

/// Where a lap's points came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LapSource {
    Remote { url: String },
    Upload { filename: String },
}

/// A lap's ordered points plus metadata derived from all of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapTelemetry {
    pub key: LapKey,
    pub source: LapSource,
    points: Vec<TelemetryPoint>,
    metadata: LapMetadata,
    sectors: Vec<SectorTiming>,
}

impl LapTelemetry {
    /// Build a lap from points in any order. Points are stable-sorted by
    /// `received_at`, so rows sharing a timestamp keep their input order.
    pub fn from_points(key: LapKey, source: LapSource, mut points: Vec<TelemetryPoint>) -> Self {
        if !points.is_sorted_by(|a, b| a.received_at <= b.received_at) {
            points.sort_by(|a, b| a.received_at.total_cmp(&b.received_at));
        }
        let metadata = compute_metadata(&points);
        let sectors = sector_timings(&points);
        Self {
            key,
            source,
            points,
            metadata,
            sectors,
        }
    }

    pub fn points(&self) -> &[TelemetryPoint] {
        &self.points
    }

    pub fn metadata(&self) -> &LapMetadata {
        &self.metadata
    }

    pub fn sectors(&self) -> &[SectorTiming] {
        &self.sectors
    }

    pub fn into_points(self) -> Vec<TelemetryPoint> {
        self.points
    }
}
