//! GPS rescue: a closed-loop return-to-home flight mode for a multirotor
//! flight controller.
//!
//! When activated by a pilot switch or a loss-of-signal failsafe, the
//! controller takes authority over throttle, pitch, roll and yaw, climbs to a
//! safe altitude, turns toward a recorded home point, flies back, descends,
//! and lands, disarming on touchdown. A phase machine sequences the flight;
//! three PID loops (altitude to throttle, heading to yaw with a roll mix,
//! velocity to pitch) attain each phase's targets; a sanity supervisor
//! watches for flyaways, GPS loss and stuck climbs and escalates per the
//! configured policy.
//!
//! The crate is hardware-agnostic: the host firmware's scheduler calls
//! [`RescueContext::update`] at the task rate (nominally 100 Hz) with that
//! tick's sensor data and mode flags, applies the returned disarm event if
//! any, and feeds the outputs to its mixer and angle-mode PID stage. There is
//! no I/O and no allocation; time comes in through [`TickInput::now_us`] so
//! everything runs against a virtual clock under test.

#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod config;
pub mod filters;
pub mod rescue;
pub mod sensors;

mod pid;
mod safety;

pub use config::{AltitudeMode, RescueConfig, SanityCheckMode};
pub use rescue::{
    CtrlOutputs, DisarmEvent, DisarmReason, FailureKind, RescueContext, RescuePhase,
};
pub use sensors::{AccelSample, FlightState, GpsSample, GpsStatus, TickInput};

/// Nominal rescue task rate. Interval computations use the measured tick
/// interval; this only seeds the very first tick and the filter gains.
pub const TASK_RATE_HZ: f32 = 100.;

pub const NOMINAL_TASK_INTERVAL_S: f32 = 1. / TASK_RATE_HZ;

/// PWM throttle range the pilot and mixer speak, microseconds.
pub const PWM_RANGE_MIN: f32 = 1_000.;
pub const PWM_RANGE_MAX: f32 = 2_000.;
