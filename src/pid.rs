//! The three rescue control loops: altitude to throttle, heading to yaw with
//! a roll mix, and velocity-to-home to pitch. The altitude and heading loops
//! run every task tick; the velocity loop only when a fresh GPS packet
//! arrived, with its output upsampled through a PT3 so the slow GPS rate
//! never steps the airframe.

use num_traits::float::Float;

use crate::config::RescueConfig;
use crate::filters::{low_pass_gain, LowPass, Pt1Filter, Pt2Filter, Pt3Filter};
use crate::rescue::{CtrlOutputs, RescueIntent, RescuePhase};
use crate::sensors::{FlightState, SensorView};
use crate::NOMINAL_TASK_INTERVAL_S;

/// Commanded yaw rate is never allowed past this, deg/s.
const MAX_YAW_RATE_DPS: f32 = 180.0;

/// Altitude integrator clamp; up to this much throttle from I alone.
const MAX_THROTTLE_ITERM: f32 = 200.0;

/// Roll mix fade: roll reaches zero as the yaw rate reaches 100 deg/s.
const ROLL_MIX_FADE_PER_DPS: f32 = 0.01;

/// Integrator and filter state for the three loops. The filters are
/// conditioned continuously and survive between rescues; the integrators are
/// re-zeroed each time a rescue initializes.
pub(crate) struct Controllers {
    throttle_i: f32,
    prev_altitude_error_m: f32,
    prev_velocity_error_cm_s: f32,
    /// Velocity-loop output held between GPS packets, deg x 100.
    pitch_adjustment_cd: f32,

    throttle_d_lpf: Pt2Filter,
    velocity_d_lpf: Pt1Filter,
    velocity_upsample_lpf: Pt3Filter,
}

impl Controllers {
    pub(crate) fn new(cfg: &RescueConfig) -> Self {
        let pitch_cutoff_hz = cfg.pitch_cutoff_centihz as f32 / 100.0;
        Self {
            throttle_i: 0.0,
            prev_altitude_error_m: 0.0,
            prev_velocity_error_cm_s: 0.0,
            pitch_adjustment_cd: 0.0,
            throttle_d_lpf: Pt2Filter::new(low_pass_gain(
                cfg.altitude_d_lpf_centihz as f32 / 100.0,
                NOMINAL_TASK_INTERVAL_S,
            )),
            // Conditioned at the GPS rate; the gain is re-derived from the
            // measured packet interval every time the loop runs.
            velocity_d_lpf: Pt1Filter::new(low_pass_gain(pitch_cutoff_hz, 1.0)),
            velocity_upsample_lpf: Pt3Filter::new(low_pass_gain(
                4.0 * pitch_cutoff_hz,
                NOMINAL_TASK_INTERVAL_S,
            )),
        }
    }

    /// Compute the rescue outputs for this tick. Runs after the phase machine
    /// and sanity supervisor have settled on a phase.
    pub(crate) fn attain_position(
        &mut self,
        phase: RescuePhase,
        sensor: &SensorView,
        intent: &mut RescueIntent,
        cfg: &RescueConfig,
        flight: &FlightState,
        new_gps: bool,
        out: &mut CtrlOutputs,
    ) {
        match phase {
            RescuePhase::Idle => {
                // Not in a rescue; pass the pilot's throttle through.
                out.pitch_cd = 0.0;
                out.roll_cd = 0.0;
                out.throttle = flight.throttle_stick;
                return;
            }
            RescuePhase::Initialize => {
                // A rescue is starting; zero the accumulated state.
                self.throttle_i = 0.0;
                self.prev_altitude_error_m = 0.0;
                self.prev_velocity_error_cm_s = 0.0;
                self.pitch_adjustment_cd = 0.0;
                intent.velocity_i_term = 0.0;
                return;
            }
            RescuePhase::DoNothing => {
                // Semi-controlled descent: level, slightly below hover.
                out.pitch_cd = 0.0;
                out.roll_cd = 0.0;
                out.throttle = cfg.throttle_hover - 100.0;
                return;
            }
            _ => {}
        }

        // Altitude -> throttle, every tick.
        let altitude_error_m = (intent.target_altitude_cm - sensor.current_altitude_cm) * 0.01;

        let throttle_p = cfg.throttle_p * altitude_error_m;

        self.throttle_i +=
            0.1 * cfg.throttle_i * altitude_error_m * sensor.altitude_data_interval_s;
        self.throttle_i = self.throttle_i.clamp(-MAX_THROTTLE_ITERM, MAX_THROTTLE_ITERM);

        let mut vertical_speed =
            (altitude_error_m - self.prev_altitude_error_m) / sensor.altitude_data_interval_s;
        self.prev_altitude_error_m = altitude_error_m;
        // Stronger damping while descending fast.
        vertical_speed *= 1.0 + intent.descent_rate_modifier;
        let throttle_d = cfg.throttle_d * self.throttle_d_lpf.apply(vertical_speed);

        // Compensate thrust lost to the tilt of the thrust vector.
        let tilt_correction = (1.0 - flight.cos_tilt_angle) * (cfg.throttle_hover - 1000.0);

        let throttle_adjustment = throttle_p + self.throttle_i + throttle_d + tilt_correction;
        out.throttle =
            (cfg.throttle_hover + throttle_adjustment).clamp(cfg.throttle_min, cfg.throttle_max);

        // Heading -> yaw, with a roll mix opposing the turn.
        let mut rescue_yaw = (sensor.error_angle_deg * cfg.yaw_p * intent.yaw_attenuator * 0.1)
            .clamp(-MAX_YAW_RATE_DPS, MAX_YAW_RATE_DPS);

        let roll_mix_attenuator =
            (1.0 - rescue_yaw.abs() * ROLL_MIX_FADE_PER_DPS).clamp(0.0, 1.0);
        let roll_adjustment_cd = -rescue_yaw * cfg.roll_mix * roll_mix_attenuator;
        let roll_limit_cd = 100.0 * intent.roll_angle_limit_deg;
        out.roll_cd = roll_adjustment_cd.clamp(-roll_limit_cd, roll_limit_cd);

        if cfg.yaw_control_reversed {
            rescue_yaw = -rescue_yaw;
        }
        out.yaw_dps = rescue_yaw;

        // Velocity -> pitch, only when the GPS delivered a new packet.
        let pitch_limit_cd = 100.0 * intent.pitch_angle_limit_deg;
        if new_gps {
            let interval_normalizer = sensor.gps_data_interval_s * 10.0;
            let velocity_error = intent.target_velocity_cm_s - sensor.velocity_to_home_cm_s;

            let velocity_p = cfg.vel_p * velocity_error;

            intent.velocity_i_term += 0.01
                * cfg.vel_i
                * velocity_error
                * interval_normalizer
                * intent.velocity_iterm_relax;
            // Decays toward zero on the approach so no wound-up pitch is left
            // over the landing area.
            intent.velocity_i_term *= intent.proximity_to_landing_area;
            let iterm_limit = 0.5 * pitch_limit_cd;
            intent.velocity_i_term = intent.velocity_i_term.clamp(-iterm_limit, iterm_limit);

            let mut velocity_d =
                (velocity_error - self.prev_velocity_error_cm_s) / interval_normalizer;
            self.prev_velocity_error_cm_s = velocity_error;
            velocity_d *= cfg.vel_d;
            let cutoff_hz = intent.velocity_pid_cutoff * intent.velocity_pid_cutoff_modifier;
            self.velocity_d_lpf
                .update_cutoff(low_pass_gain(cutoff_hz, sensor.gps_data_interval_s));
            let velocity_d = self.velocity_d_lpf.apply(velocity_d);

            self.pitch_adjustment_cd = (velocity_p + intent.velocity_i_term + velocity_d)
                .clamp(-pitch_limit_cd, pitch_limit_cd);
        }
        // Upsample to the task rate whether or not the loop ran; between
        // packets the held adjustment behaves as a zero-order hold.
        out.pitch_cd = self.velocity_upsample_lpf.apply(self.pitch_adjustment_cd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (Controllers, SensorView, RescueIntent, RescueConfig, FlightState) {
        let cfg = RescueConfig::default();
        let ctrl = Controllers::new(&cfg);
        let mut sensor = SensorView::default();
        sensor.current_altitude_cm = 1000.0;
        let mut intent = RescueIntent::default();
        intent.target_altitude_cm = 1000.0;
        intent.pitch_angle_limit_deg = cfg.max_rescue_angle_deg;
        intent.roll_angle_limit_deg = cfg.max_rescue_angle_deg;
        intent.yaw_attenuator = 1.0;
        intent.velocity_iterm_relax = 1.0;
        intent.proximity_to_landing_area = 1.0;
        intent.velocity_pid_cutoff = 0.75;
        intent.velocity_pid_cutoff_modifier = 1.0;
        let mut flight = FlightState::default();
        flight.cos_tilt_angle = 1.0;
        flight.throttle_stick = 1450.0;
        (ctrl, sensor, intent, cfg, flight)
    }

    #[test]
    fn idle_passes_pilot_throttle_through_and_levels_angles() {
        let (mut ctrl, sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();
        out.pitch_cd = 123.0;
        out.roll_cd = -55.0;
        ctrl.attain_position(
            RescuePhase::Idle, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(out.pitch_cd, 0.0);
        assert_eq!(out.roll_cd, 0.0);
        assert_eq!(out.throttle, 1450.0);
    }

    #[test]
    fn initialize_zeroes_integrators() {
        let (mut ctrl, sensor, mut intent, cfg, flight) = fixtures();
        ctrl.throttle_i = 55.0;
        ctrl.pitch_adjustment_cd = 900.0;
        intent.velocity_i_term = 300.0;
        let mut out = CtrlOutputs::default();
        ctrl.attain_position(
            RescuePhase::Initialize, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(ctrl.throttle_i, 0.0);
        assert_eq!(ctrl.pitch_adjustment_cd, 0.0);
        assert_eq!(intent.velocity_i_term, 0.0);
    }

    #[test]
    fn do_nothing_descends_slightly_below_hover() {
        let (mut ctrl, sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();
        ctrl.attain_position(
            RescuePhase::DoNothing, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(out.throttle, cfg.throttle_hover - 100.0);
        assert_eq!(out.pitch_cd, 0.0);
        assert_eq!(out.roll_cd, 0.0);
    }

    #[test]
    fn throttle_stays_inside_configured_range() {
        let (mut ctrl, mut sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();

        // Far below target: full climb demand.
        intent.target_altitude_cm = 100_000.0;
        for _ in 0..200 {
            ctrl.attain_position(
                RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
            );
            assert!(out.throttle <= cfg.throttle_max);
            assert!(out.throttle >= cfg.throttle_min);
        }
        assert_eq!(out.throttle, cfg.throttle_max);
        assert_eq!(ctrl.throttle_i, MAX_THROTTLE_ITERM);

        // Far above target: clamps at the bottom.
        sensor.current_altitude_cm = 300_000.0;
        for _ in 0..400 {
            ctrl.attain_position(
                RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
            );
        }
        assert_eq!(out.throttle, cfg.throttle_min);
        assert_eq!(ctrl.throttle_i, -MAX_THROTTLE_ITERM);
    }

    #[test]
    fn yaw_rate_is_attenuated_and_clamped() {
        let (mut ctrl, mut sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();

        sensor.error_angle_deg = 10.0;
        intent.yaw_attenuator = 0.5;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        // 10 deg * 20 * 0.5 * 0.1 = 10 deg/s
        assert!((out.yaw_dps - 10.0).abs() < 1e-3);

        sensor.error_angle_deg = 180.0;
        intent.yaw_attenuator = 1.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(out.yaw_dps, MAX_YAW_RATE_DPS);
    }

    #[test]
    fn roll_mix_fades_to_zero_at_high_yaw_rates() {
        let (mut ctrl, mut sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();

        // Saturated yaw rate: the fade leaves no roll at all.
        sensor.error_angle_deg = 179.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(out.roll_cd, 0.0);

        // Gentle yaw: some opposing roll, inside the limit.
        sensor.error_angle_deg = 10.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert!(out.roll_cd < 0.0);
        assert!(out.roll_cd.abs() <= 100.0 * intent.roll_angle_limit_deg);
    }

    #[test]
    fn yaw_sign_follows_the_reversed_flag() {
        let (mut ctrl, mut sensor, mut intent, mut cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();
        sensor.error_angle_deg = 10.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        let forward = out.yaw_dps;

        cfg.yaw_control_reversed = true;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(out.yaw_dps, -forward);
    }

    #[test]
    fn velocity_loop_only_runs_on_gps_ticks() {
        let (mut ctrl, mut sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();

        sensor.velocity_to_home_cm_s = 0.0;
        intent.target_velocity_cm_s = 500.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, true, &mut out,
        );
        let held = ctrl.pitch_adjustment_cd;
        assert!(held > 0.0);

        // Changing the measured velocity without a fresh packet must not move
        // the held adjustment.
        sensor.velocity_to_home_cm_s = 2_000.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert_eq!(ctrl.pitch_adjustment_cd, held);
    }

    #[test]
    fn velocity_iterm_respects_half_pitch_limit() {
        let (mut ctrl, mut sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();
        sensor.velocity_to_home_cm_s = -2_000.0;
        intent.target_velocity_cm_s = 2_000.0;
        for _ in 0..100 {
            ctrl.attain_position(
                RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, true, &mut out,
            );
        }
        let limit = 0.5 * 100.0 * intent.pitch_angle_limit_deg;
        assert_eq!(intent.velocity_i_term, limit);
        // And the summed output respects the full limit.
        assert!(out.pitch_cd.abs() <= 100.0 * intent.pitch_angle_limit_deg + 1e-3);
    }

    #[test]
    fn pitch_output_is_smoothed_toward_the_held_adjustment() {
        let (mut ctrl, mut sensor, mut intent, cfg, flight) = fixtures();
        let mut out = CtrlOutputs::default();
        sensor.velocity_to_home_cm_s = 0.0;
        intent.target_velocity_cm_s = 500.0;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, true, &mut out,
        );
        // The PT3 upsampler must not jump to the full adjustment in one tick.
        assert!(out.pitch_cd < ctrl.pitch_adjustment_cd);
        let first = out.pitch_cd;
        ctrl.attain_position(
            RescuePhase::FlyHome, &sensor, &mut intent, &cfg, &flight, false, &mut out,
        );
        assert!(out.pitch_cd >= first);
    }
}
