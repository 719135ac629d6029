//! Rescue configuration, mirroring the flight controller's config store. The
//! numeric defaults are the stock tune for a 5-inch quad; integer-repr enums
//! decode from the raw bytes a config store holds.

use num_enum::TryFromPrimitive;

/// How the cruise (return) altitude is chosen when a rescue starts.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AltitudeMode {
    /// Always climb or descend to the configured initial altitude.
    Fixed = 0,
    /// Current altitude plus the safety buffer.
    Current = 1,
    /// Highest altitude seen this flight plus the safety buffer.
    Max = 2,
}

impl Default for AltitudeMode {
    fn default() -> Self {
        Self::Max
    }
}

/// Policy selecting how aggressively detected failures are escalated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SanityCheckMode {
    Off = 0,
    On = 1,
    /// Abort only when the RC link is also down.
    FsOnly = 2,
}

impl Default for SanityCheckMode {
    fn default() -> Self {
        Self::On
    }
}

/// All tunables the rescue controller reads. Angles in degrees, altitudes and
/// distances in the unit named by the field, throttle values in PWM
/// microseconds.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RescueConfig {
    // Altitude -> throttle controller
    pub throttle_p: f32,
    pub throttle_i: f32,
    pub throttle_d: f32,
    /// Throttle producing near-zero vertical velocity in still air.
    pub throttle_hover: f32,
    pub throttle_min: f32,
    pub throttle_max: f32,
    /// Bottom of the pilot throttle range, for rescaling the output.
    pub throttle_mincheck: f32,
    /// Throttle D-term lowpass cutoff, Hz x 100.
    pub altitude_d_lpf_centihz: u16,

    // Velocity -> pitch controller
    pub vel_p: f32,
    pub vel_i: f32,
    pub vel_d: f32,
    /// Velocity D-term lowpass cutoff, Hz x 100.
    pub pitch_cutoff_centihz: u16,

    // Heading -> yaw controller
    pub yaw_p: f32,
    /// How much roll is mixed in against the commanded yaw rate.
    pub roll_mix: f32,
    pub yaw_control_reversed: bool,

    // Rescue geometry and rates
    pub initial_altitude_m: f32,
    pub rescue_altitude_buffer_m: f32,
    pub target_landing_altitude_m: f32,
    pub ascend_rate_cm_s: f32,
    pub descend_rate_cm_s: f32,
    pub descent_distance_m: f32,
    pub rescue_groundspeed_cm_s: f32,
    pub max_rescue_angle_deg: f32,
    /// Rescues initiated closer than this land instead of flying home.
    pub min_rescue_dth_m: f32,

    // Supervision
    pub altitude_mode: AltitudeMode,
    pub sanity_checks: SanityCheckMode,
    pub min_sats: u8,
    pub use_mag: bool,
    pub allow_arming_without_fix: bool,
    /// Keep the home point (and max altitude) across disarms.
    pub set_home_point_once: bool,
    /// Impact disarm threshold, tenths of a g.
    pub disarm_threshold_dg: f32,

    // Activation paths; their disjunction is "rescue is configured".
    pub failsafe_procedure_rescue: bool,
    pub mode_switch_assigned: bool,
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            throttle_p: 15.0,
            throttle_i: 15.0,
            throttle_d: 15.0,
            throttle_hover: 1275.0,
            throttle_min: 1100.0,
            throttle_max: 1700.0,
            throttle_mincheck: 1050.0,
            altitude_d_lpf_centihz: 100,

            vel_p: 8.0,
            vel_i: 40.0,
            vel_d: 12.0,
            pitch_cutoff_centihz: 75,

            yaw_p: 20.0,
            roll_mix: 150.0,
            yaw_control_reversed: false,

            initial_altitude_m: 30.0,
            rescue_altitude_buffer_m: 10.0,
            target_landing_altitude_m: 4.0,
            ascend_rate_cm_s: 750.0,
            descend_rate_cm_s: 150.0,
            descent_distance_m: 20.0,
            rescue_groundspeed_cm_s: 750.0,
            max_rescue_angle_deg: 45.0,
            min_rescue_dth_m: 30.0,

            altitude_mode: AltitudeMode::Max,
            sanity_checks: SanityCheckMode::On,
            min_sats: 8,
            use_mag: true,
            allow_arming_without_fix: false,
            set_home_point_once: false,
            disarm_threshold_dg: 20.0,

            failsafe_procedure_rescue: true,
            mode_switch_assigned: false,
        }
    }
}
