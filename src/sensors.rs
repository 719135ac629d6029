//! Sensor ingestion: the per-tick inputs handed over by the collaborating
//! drivers and estimators, and the conditioned view of them the controllers
//! read. GPS-derived quantities refresh only when a new packet arrived; all
//! other values update every tick.

use num_traits::float::Float;

use crate::rescue::RescuePhase;
use crate::NOMINAL_TASK_INTERVAL_S;

/// Quantities computed by the GPS driver from one received packet.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsSample {
    pub distance_to_home_cm: u32,
    /// Bearing to home, degrees x 10.
    pub direction_to_home_ddeg: i16,
    pub ground_speed_cm_s: u16,
    /// Measured interval between this packet and the previous one, seconds.
    pub data_interval_s: f32,
}

/// GPS driver status, readable every tick.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsStatus {
    pub healthy: bool,
    pub fix_3d: bool,
    pub have_home: bool,
    pub num_sats: u8,
}

/// Raw accelerometer data in ADC units, with the 1 g scale and its
/// reciprocal, as the accelerometer driver publishes them.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AccelSample {
    /// X, Y, Z.
    pub adc: [f32; 3],
    pub acc_1g: f32,
    pub acc_1g_rec: f32,
}

impl Default for AccelSample {
    fn default() -> Self {
        Self {
            adc: [0.0; 3],
            acc_1g: 1.0,
            acc_1g_rec: 1.0,
        }
    }
}

/// Everything the mode arbiter, RC layer and estimators supply each tick.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlightState {
    pub rescue_mode_active: bool,
    pub armed: bool,
    /// RC link is up.
    pub rx_signal: bool,
    pub crash_flip_active: bool,
    /// A magnetometer is fitted and enabled.
    pub has_mag: bool,
    /// From the altitude estimator, cm.
    pub altitude_cm: f32,
    /// Attitude yaw, degrees x 10.
    pub yaw_ddeg: i16,
    /// Cosine of the tilt angle, from the attitude estimator.
    pub cos_tilt_angle: f32,
    pub acc: AccelSample,
    /// Pilot throttle, PWM microseconds; passed through while idle.
    pub throttle_stick: f32,
}

/// One `update` invocation's worth of input. `gps_fresh` doubles as the
/// new-packet edge flag: `Some` exactly when the GPS driver received a packet
/// since the previous tick.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickInput {
    /// Monotonic microsecond clock, injected for testability.
    pub now_us: u64,
    pub flight: FlightState,
    pub gps: GpsStatus,
    pub gps_fresh: Option<GpsSample>,
}

/// The conditioned sensor values the phase machine and controllers read.
/// GPS-derived fields hold their last good value across GPS gaps.
#[derive(Clone, Debug)]
pub(crate) struct SensorView {
    pub current_altitude_cm: f32,
    pub distance_to_home_cm: f32,
    pub distance_to_home_m: f32,
    pub ground_speed_cm_s: f32,
    /// Bearing to home, degrees x 10.
    pub direction_to_home_ddeg: f32,
    /// Heading minus bearing-to-home, degrees, in (-180, 180].
    pub error_angle_deg: f32,
    pub abs_error_angle_deg: f32,
    /// Approach speed, from the change in distance across GPS packets.
    pub velocity_to_home_cm_s: f32,
    /// Acceleration magnitude in g; refreshed only while landing.
    pub acc_magnitude: f32,
    /// GPS driver healthy.
    pub healthy: bool,
    pub gps_data_interval_s: f32,
    pub altitude_data_interval_s: f32,
    pub task_interval_s: f32,

    prev_distance_to_home_cm: f32,
    prev_tick_us: Option<u64>,
}

impl Default for SensorView {
    fn default() -> Self {
        Self {
            current_altitude_cm: 0.0,
            distance_to_home_cm: 0.0,
            distance_to_home_m: 0.0,
            ground_speed_cm_s: 0.0,
            direction_to_home_ddeg: 0.0,
            error_angle_deg: 0.0,
            abs_error_angle_deg: 0.0,
            velocity_to_home_cm_s: 0.0,
            acc_magnitude: 0.0,
            healthy: false,
            gps_data_interval_s: 0.1,
            altitude_data_interval_s: NOMINAL_TASK_INTERVAL_S,
            task_interval_s: NOMINAL_TASK_INTERVAL_S,
            prev_distance_to_home_cm: 0.0,
            prev_tick_us: None,
        }
    }
}

/// Normalize an angle in degrees to (-180, 180].
pub(crate) fn wrap_180(mut angle_deg: f32) -> f32 {
    while angle_deg > 180.0 {
        angle_deg -= 360.0;
    }
    while angle_deg <= -180.0 {
        angle_deg += 360.0;
    }
    angle_deg
}

impl SensorView {
    /// Ingest one tick of input. Derivative intervals come from the injected
    /// clock, never from the nominal task rate.
    pub(crate) fn ingest(&mut self, tick: &TickInput, phase: RescuePhase) {
        self.task_interval_s = match self.prev_tick_us {
            Some(prev) => tick.now_us.saturating_sub(prev) as f32 * 1e-6,
            None => NOMINAL_TASK_INTERVAL_S,
        };
        self.prev_tick_us = Some(tick.now_us);
        self.altitude_data_interval_s = self.task_interval_s;

        self.current_altitude_cm = tick.flight.altitude_cm;
        self.healthy = tick.gps.healthy;

        // Impact detection input; only meaningful while landing, left stale
        // otherwise so pitch and roll maneuvers en route don't look like hits.
        if phase == RescuePhase::Landing {
            let acc = &tick.flight.acc;
            let vertical = acc.adc[2] - acc.acc_1g;
            self.acc_magnitude = (vertical * vertical
                + acc.adc[0] * acc.adc[0]
                + acc.adc[1] * acc.adc[1])
                .sqrt()
                * acc.acc_1g_rec;
        }

        self.error_angle_deg =
            wrap_180((tick.flight.yaw_ddeg as f32 - self.direction_to_home_ddeg) / 10.0);
        self.abs_error_angle_deg = self.error_angle_deg.abs();

        if let Some(gps) = &tick.gps_fresh {
            self.distance_to_home_cm = gps.distance_to_home_cm as f32;
            self.distance_to_home_m = self.distance_to_home_cm * 0.01;
            self.ground_speed_cm_s = gps.ground_speed_cm_s as f32;
            self.direction_to_home_ddeg = gps.direction_to_home_ddeg as f32;
            // The GPS driver's contract is 0.01 .. 1.0 s between packets.
            self.gps_data_interval_s = gps.data_interval_s.clamp(0.01, 1.0);
            self.velocity_to_home_cm_s = (self.prev_distance_to_home_cm
                - self.distance_to_home_cm)
                / self.gps_data_interval_s;
            self.prev_distance_to_home_cm = self.distance_to_home_cm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-4;

    fn tick_at(now_us: u64) -> TickInput {
        TickInput {
            now_us,
            ..Default::default()
        }
    }

    #[test]
    fn error_angle_is_wrapped_into_half_open_range() {
        assert!((wrap_180(190.0) - -170.0).abs() < EPS);
        assert!((wrap_180(-190.0) - 170.0).abs() < EPS);
        assert_eq!(wrap_180(180.0), 180.0);
        assert_eq!(wrap_180(-180.0), 180.0);
        assert_eq!(wrap_180(540.0), 180.0);
    }

    #[test]
    fn full_rotations_yield_identical_error_angle() {
        let mut view = SensorView::default();
        let mut tick = tick_at(10_000);
        tick.flight.yaw_ddeg = 450; // 45 degrees
        view.ingest(&tick, RescuePhase::Idle);
        let base = view.error_angle_deg;

        // One full turn later the heading error must be bit-identical.
        tick.now_us += 10_000;
        tick.flight.yaw_ddeg = 450 + 3600;
        view.ingest(&tick, RescuePhase::Idle);
        assert_eq!(view.error_angle_deg, base);
    }

    #[test]
    fn intervals_come_from_the_clock() {
        let mut view = SensorView::default();
        view.ingest(&tick_at(1_000_000), RescuePhase::Idle);
        // First tick has no previous timestamp; nominal interval.
        assert!((view.task_interval_s - NOMINAL_TASK_INTERVAL_S).abs() < EPS);

        view.ingest(&tick_at(1_020_000), RescuePhase::Idle);
        assert!((view.task_interval_s - 0.02).abs() < EPS);
        assert!((view.altitude_data_interval_s - 0.02).abs() < EPS);
    }

    #[test]
    fn gps_quantities_hold_across_gaps() {
        let mut view = SensorView::default();
        let mut tick = tick_at(10_000);
        tick.gps_fresh = Some(GpsSample {
            distance_to_home_cm: 10_000,
            direction_to_home_ddeg: 900,
            ground_speed_cm_s: 500,
            data_interval_s: 0.1,
        });
        view.ingest(&tick, RescuePhase::Idle);
        assert!((view.distance_to_home_m - 100.0).abs() < EPS);

        // A tick without a fresh packet recomputes nothing GPS-derived.
        let velocity = view.velocity_to_home_cm_s;
        tick.now_us += 10_000;
        tick.gps_fresh = None;
        view.ingest(&tick, RescuePhase::Idle);
        assert_eq!(view.distance_to_home_m, 100.0);
        assert_eq!(view.ground_speed_cm_s, 500.0);
        assert_eq!(view.velocity_to_home_cm_s, velocity);
    }

    #[test]
    fn velocity_to_home_derives_from_consecutive_packets() {
        let mut view = SensorView::default();
        let mut tick = tick_at(10_000);
        tick.gps_fresh = Some(GpsSample {
            distance_to_home_cm: 10_000,
            direction_to_home_ddeg: 0,
            ground_speed_cm_s: 0,
            data_interval_s: 0.1,
        });
        view.ingest(&tick, RescuePhase::Idle);

        tick.now_us += 100_000;
        tick.gps_fresh = Some(GpsSample {
            distance_to_home_cm: 9_925, // 75 cm closer in 0.1 s
            direction_to_home_ddeg: 0,
            ground_speed_cm_s: 0,
            data_interval_s: 0.1,
        });
        view.ingest(&tick, RescuePhase::Idle);
        assert!((view.velocity_to_home_cm_s - 750.0).abs() < EPS);
    }

    #[test]
    fn acc_magnitude_refreshes_only_while_landing() {
        let mut view = SensorView::default();
        let mut tick = tick_at(10_000);
        tick.flight.acc = AccelSample {
            adc: [0.0, 0.0, 3.5],
            acc_1g: 1.0,
            acc_1g_rec: 1.0,
        };
        view.ingest(&tick, RescuePhase::FlyHome);
        assert_eq!(view.acc_magnitude, 0.0);

        tick.now_us += 10_000;
        view.ingest(&tick, RescuePhase::Landing);
        assert!((view.acc_magnitude - 2.5).abs() < EPS);
    }
}
