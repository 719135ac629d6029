//! Safety supervision for an active rescue: failure classification, the 1 Hz
//! sanity counters, policy-driven escalation, and the availability report the
//! OSD shows before a rescue is ever needed.
//!
//! The supervisor is the single owner of failure classification. It runs
//! every tick, after the phase machine, so its downgrades override the
//! phase's choice before the controllers run.

use crate::config::{RescueConfig, SanityCheckMode};
use crate::fmt::{info, rescue_warn as warn};
use crate::rescue::{DisarmEvent, DisarmReason, FailureKind, RescueIntent, RescuePhase};
use crate::sensors::{SensorView, TickInput};

/// Sanity counters saturate at these many seconds.
const MAX_SECONDS_FAILING: i32 = 15;
const MAX_SECONDS_STUCK: i32 = 10;
const MAX_SECONDS_LOW_SATS: i32 = 10;
const MAX_SECONDS_DOING_NOTHING: i32 = 20;

/// The low-rate checks run once per this many microseconds of wall clock.
const CHECK_INTERVAL_US: u64 = 1_000_000;

/// State for the 1 Hz sanity checks. Snapshots are (re)taken while the phase
/// machine is in `Initialize`.
#[derive(Default)]
pub(crate) struct SanityMonitor {
    prev_time_us: u64,
    prev_altitude_cm: f32,
    prev_target_altitude_cm: f32,
    prev_distance_to_home_cm: f32,
    seconds_low_sats: i32,
    seconds_doing_nothing: i32,
}

impl SanityMonitor {
    /// Classify failures and escalate them per the configured policy. May
    /// rewrite the phase; returns a disarm for the crash-flip case.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn perform(
        &mut self,
        phase: &mut RescuePhase,
        failure: &mut FailureKind,
        sensor: &SensorView,
        intent: &mut RescueIntent,
        cfg: &RescueConfig,
        tick: &TickInput,
        mag_force_disable: &mut bool,
    ) -> Option<DisarmEvent> {
        if *phase == RescuePhase::Idle {
            *failure = FailureKind::Healthy;
            return None;
        }
        if *phase == RescuePhase::Initialize {
            self.prev_time_us = tick.now_us;
            self.prev_altitude_cm = sensor.current_altitude_cm;
            self.prev_target_altitude_cm = intent.target_altitude_cm;
            self.prev_distance_to_home_cm = sensor.distance_to_home_cm;
            self.seconds_low_sats = 0;
            self.seconds_doing_nothing = 0;
        }

        // Escalate an existing failure. The default response is 20 s of
        // semi-controlled descent with impact detection.
        let hard_failsafe = !tick.flight.rx_signal;
        if *failure != FailureKind::Healthy {
            *phase = RescuePhase::DoNothing;
            match cfg.sanity_checks {
                SanityCheckMode::On => *phase = RescuePhase::Abort,
                SanityCheckMode::FsOnly => {
                    if hard_failsafe {
                        *phase = RescuePhase::Abort;
                    }
                }
                SanityCheckMode::Off => {
                    // Armed without a fix, no home point, and no pilot in the
                    // loop: nothing useful is left to try.
                    if cfg.allow_arming_without_fix && !tick.gps.have_home && hard_failsafe {
                        *phase = RescuePhase::Abort;
                    }
                }
            }
        }

        // Crash protection applies in every rescue and disarms immediately.
        if tick.flight.crash_flip_active {
            warn!("gps rescue: crash flip detected, disarming");
            *phase = RescuePhase::Idle;
            return Some(DisarmEvent {
                reason: DisarmReason::CrashProtection,
                disable_arming: false,
            });
        }

        if !sensor.healthy {
            if *failure != FailureKind::GpsLost {
                warn!("gps rescue: gps communications lost");
            }
            *failure = FailureKind::GpsLost;
        }

        // Everything below runs at 1 Hz.
        if tick.now_us.saturating_sub(self.prev_time_us) < CHECK_INTERVAL_US {
            return None;
        }
        self.prev_time_us = tick.now_us;

        // Flyaway: while flying home we must actually close on home.
        if *phase == RescuePhase::FlyHome {
            // cm over one second, so cm/s.
            let velocity_to_home_cm_s =
                self.prev_distance_to_home_cm - sensor.distance_to_home_cm;
            self.prev_distance_to_home_cm = sensor.distance_to_home_cm;

            intent.seconds_failing +=
                if velocity_to_home_cm_s < 0.5 * intent.target_velocity_cm_s {
                    1
                } else {
                    -1
                };
            intent.seconds_failing = intent.seconds_failing.clamp(0, MAX_SECONDS_FAILING);
            if intent.seconds_failing == MAX_SECONDS_FAILING {
                if tick.flight.has_mag && cfg.use_mag && !*mag_force_disable {
                    // One-shot retry without the magnetometer; a bad compass
                    // produces exactly this signature.
                    info!("gps rescue: disabling magnetometer and retrying");
                    *mag_force_disable = true;
                    intent.seconds_failing = 0;
                } else {
                    warn!("gps rescue: flyaway detected");
                    *failure = FailureKind::Flyaway;
                }
            }
        }

        self.seconds_low_sats += if !tick.gps.fix_3d || tick.gps.num_sats < cfg.min_sats {
            1
        } else {
            -1
        };
        self.seconds_low_sats = self.seconds_low_sats.clamp(0, MAX_SECONDS_LOW_SATS);
        if self.seconds_low_sats == MAX_SECONDS_LOW_SATS {
            warn!("gps rescue: satellite count too low");
            *failure = FailureKind::LowSats;
        }

        // Stuck-altitude checks ignore the sanity policy; they handle being
        // unable to climb or descend in any rescue.
        let actual_altitude_change = sensor.current_altitude_cm - self.prev_altitude_cm;
        let target_altitude_change = intent.target_altitude_cm - self.prev_target_altitude_cm;
        let ratio = actual_altitude_change / target_altitude_change;
        self.prev_altitude_cm = sensor.current_altitude_cm;
        self.prev_target_altitude_cm = intent.target_altitude_cm;

        match *phase {
            RescuePhase::Landing => {
                intent.seconds_failing += if ratio > 0.5 { -1 } else { 1 };
                intent.seconds_failing = intent.seconds_failing.clamp(0, MAX_SECONDS_STUCK);
                if intent.seconds_failing == MAX_SECONDS_STUCK {
                    // A landing should never take this long.
                    *phase = RescuePhase::Abort;
                }
            }
            RescuePhase::AttainAlt | RescuePhase::Descent => {
                intent.seconds_failing += if ratio > 0.5 { -1 } else { 1 };
                intent.seconds_failing = intent.seconds_failing.clamp(0, MAX_SECONDS_STUCK);
                if intent.seconds_failing == MAX_SECONDS_STUCK {
                    // Can't make the commanded climb or descent; land where
                    // we are, with impact detection armed.
                    *phase = RescuePhase::Landing;
                    intent.seconds_failing = 0;
                }
            }
            RescuePhase::DoNothing => {
                self.seconds_doing_nothing =
                    (self.seconds_doing_nothing + 1).min(MAX_SECONDS_DOING_NOTHING);
                if self.seconds_doing_nothing == MAX_SECONDS_DOING_NOTHING {
                    *phase = RescuePhase::Abort;
                }
            }
            _ => {}
        }

        None
    }
}

/// Could a rescue succeed if it started right now? Cached between the 1 Hz
/// refreshes; the OSD polls this for its warning line.
#[derive(Default)]
pub(crate) struct AvailabilityMonitor {
    prev_time_us: u64,
    seconds_low_sats: i32,
    low_sats: bool,
    no_fix: bool,
}

impl AvailabilityMonitor {
    pub(crate) fn check(&mut self, now_us: u64, tick: &TickInput, cfg: &RescueConfig) -> bool {
        if !tick.gps.healthy || !tick.gps.have_home {
            return false;
        }

        if now_us.saturating_sub(self.prev_time_us) < CHECK_INTERVAL_US {
            return !(self.no_fix || self.low_sats);
        }
        self.prev_time_us = now_us;

        let mut result = true;

        if !tick.gps.fix_3d {
            self.no_fix = true;
            result = false;
        } else {
            self.no_fix = false;
        }

        self.seconds_low_sats = (self.seconds_low_sats
            + if tick.gps.num_sats < cfg.min_sats { 1 } else { -1 })
        .clamp(0, 2);
        if self.seconds_low_sats == 2 {
            self.low_sats = true;
            result = false;
        } else {
            self.low_sats = false;
        }

        result
    }
}
