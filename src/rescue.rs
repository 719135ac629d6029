//! The rescue phase machine and its owning context. `RescueContext` is the
//! single writer of all rescue state: the scheduler calls `update` once per
//! task tick, and the mixer/PID stage reads the outputs back between ticks.
//!
//! Phases run one per tick. A phase assignment made during a tick is acted on
//! by that phase's body on the following tick, which keeps every transition
//! observable from outside.

use crate::config::RescueConfig;
use crate::fmt::{info, rescue_warn as warn};
use crate::pid::Controllers;
use crate::safety::{AvailabilityMonitor, SanityMonitor};
use crate::sensors::{SensorView, TickInput};
use crate::{PWM_RANGE_MAX, PWM_RANGE_MIN};

/// Heading error below which the craft is considered pointed at home and
/// forward flight may begin, degrees.
const HEADING_ACQUIRED_DEG: f32 = 30.0;

/// Inside this distance of home, an on-the-ground activation is refused.
const INSTANT_ABORT_DISTANCE_M: f32 = 5.0;

/// Return altitudes below this attenuate the descent rate, cm.
const DESCENT_ATTENUATION_ALT_CM: f32 = 2_000.0;

/// Target altitudes above this descend at the full boosted rate, cm.
const DESCENT_BOOST_ALT_CM: f32 = 5_000.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RescuePhase {
    /// No rescue active; tracking return altitude while armed.
    Idle,
    /// First tick of a rescue: integrators zeroed, route decided.
    Initialize,
    /// Climb (or descend) to the return altitude before moving.
    AttainAlt,
    /// Turn to face home before pitching forward.
    Rotate,
    /// Fly toward home at the configured groundspeed.
    FlyHome,
    /// Slow and sink on the approach.
    Descent,
    /// Final vertical descent with impact detection.
    Landing,
    /// Unrecoverable; disarm and stop.
    Abort,
    Complete,
    /// Level slow fall while supervision decides what is left to try.
    DoNothing,
}

/// Failure classification owned by the sanity supervisor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailureKind {
    Healthy,
    Flyaway,
    GpsLost,
    LowSats,
    CrashFlipDetected,
    Stalled,
    TooClose,
    NoHomePoint,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisarmReason {
    /// Impact detected while landing.
    GpsRescue,
    /// Rescue aborted.
    Failsafe,
    /// Crash-flip recovery triggered mid-rescue.
    CrashProtection,
}

/// Returned from `update` when the controller wants the motors stopped. The
/// caller owns the arming state and applies this.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisarmEvent {
    pub reason: DisarmReason,
    /// Also latch arming off until the arm switch is cycled.
    pub disable_arming: bool,
}

/// The controller's plan: targets, limits and gain schedules. Mutated by the
/// phase machine, read by the controllers.
#[derive(Clone, Debug, Default)]
pub(crate) struct RescueIntent {
    /// Highest altitude seen while armed, cm.
    pub max_altitude_cm: f32,
    /// Cruise altitude for the return leg, cm.
    pub return_altitude_cm: f32,
    /// Instantaneous altitude setpoint, cm.
    pub target_altitude_cm: f32,
    pub target_landing_altitude_cm: f32,
    pub target_velocity_cm_s: f32,
    pub pitch_angle_limit_deg: f32,
    pub roll_angle_limit_deg: f32,
    pub descent_distance_m: f32,
    /// Per-tick change applied to the altitude target, cm.
    pub altitude_step_cm: f32,
    /// 0..1, boosts descent rate and throttle damping from high altitude.
    pub descent_rate_modifier: f32,
    /// 1 far out, 0 over the landing area.
    pub proximity_to_landing_area: f32,
    /// Yaw authority ramp, 0..1.
    pub yaw_attenuator: f32,
    /// Velocity integrator ramp-in, 0..1.
    pub velocity_iterm_relax: f32,
    /// Base cutoff for the velocity D filter, Hz.
    pub velocity_pid_cutoff: f32,
    pub velocity_pid_cutoff_modifier: f32,
    /// Velocity loop integrator, deg x 100. Shared with the supervisor.
    pub velocity_i_term: f32,
    /// Consecutive failing seconds counted by the 1 Hz sanity checks.
    pub seconds_failing: i32,
    /// Impact disarm threshold, g.
    pub disarm_threshold_g: f32,
}

/// What the downstream stages consume: angle offsets for the angle-mode PID
/// stack (deg x 100), a yaw rate (deg/s) and a throttle (PWM microseconds,
/// rescaled on the way out).
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CtrlOutputs {
    pub pitch_cd: f32,
    pub roll_cd: f32,
    pub yaw_dps: f32,
    pub throttle: f32,
}

/// All rescue state, owned by the rescue task. Single writer; the accessors
/// are plain word-sized reads for the higher-rate PID thread on the same
/// cooperative scheduler.
pub struct RescueContext {
    cfg: RescueConfig,
    phase: RescuePhase,
    failure: FailureKind,
    sensor: SensorView,
    intent: RescueIntent,
    controllers: Controllers,
    sanity: SanityMonitor,
    availability: AvailabilityMonitor,
    outputs: CtrlOutputs,
    is_available: bool,
    /// One-shot magnetometer disable latch; survives until disarm.
    mag_force_disable: bool,
    home_fix: bool,
    /// Whether the rescue began below the return altitude; signs the climb.
    initial_altitude_low: bool,
    /// Captured when forward flight begins.
    #[allow(dead_code)]
    initial_velocity_low: bool,
}

impl RescueContext {
    pub fn new(cfg: RescueConfig) -> Self {
        let controllers = Controllers::new(&cfg);
        let intent = RescueIntent {
            velocity_pid_cutoff: cfg.pitch_cutoff_centihz as f32 / 100.0,
            velocity_pid_cutoff_modifier: 1.0,
            target_landing_altitude_cm: cfg.target_landing_altitude_m * 100.0,
            disarm_threshold_g: cfg.disarm_threshold_dg * 0.1,
            ..Default::default()
        };
        Self {
            cfg,
            phase: RescuePhase::Idle,
            failure: FailureKind::Healthy,
            sensor: SensorView::default(),
            intent,
            controllers,
            sanity: SanityMonitor::default(),
            availability: AvailabilityMonitor::default(),
            outputs: CtrlOutputs::default(),
            is_available: false,
            mag_force_disable: false,
            home_fix: false,
            initial_altitude_low: true,
            initial_velocity_low: true,
        }
    }

    /// One pass of the rescue task. Runs whether or not a rescue is active;
    /// the fresh-GPS edge flag is `tick.gps_fresh` and is consumed here.
    pub fn update(&mut self, tick: &TickInput) -> Option<DisarmEvent> {
        let new_gps = tick.gps_fresh.is_some();
        let mut event = None;

        if !tick.flight.rescue_mode_active {
            self.stop();
        } else if self.phase == RescuePhase::Idle {
            self.start();
            // Seed controller and supervisor state before the first real
            // pass; sensor data is not reliable yet on this tick.
            self.controllers.attain_position(
                self.phase,
                &self.sensor,
                &mut self.intent,
                &self.cfg,
                &tick.flight,
                false,
                &mut self.outputs,
            );
            event = self.sanity.perform(
                &mut self.phase,
                &mut self.failure,
                &self.sensor,
                &mut self.intent,
                &self.cfg,
                tick,
                &mut self.mag_force_disable,
            );
        }

        self.sensor.ingest(tick, self.phase);
        self.home_fix = tick.gps.have_home;
        self.is_available = self.availability.check(tick.now_us, tick, &self.cfg);

        event = event.or(self.run_phase(tick, new_gps));
        event = event.or(self.sanity.perform(
            &mut self.phase,
            &mut self.failure,
            &self.sensor,
            &mut self.intent,
            &self.cfg,
            tick,
            &mut self.mag_force_disable,
        ));

        self.controllers.attain_position(
            self.phase,
            &self.sensor,
            &mut self.intent,
            &self.cfg,
            &tick.flight,
            new_gps,
            &mut self.outputs,
        );

        // The mag latch survives the rescue but not a disarm.
        if !tick.flight.armed {
            self.mag_force_disable = false;
        }

        event
    }

    fn start(&mut self) {
        info!("gps rescue: activated");
        self.phase = RescuePhase::Initialize;
    }

    fn stop(&mut self) {
        self.phase = RescuePhase::Idle;
    }

    fn run_phase(&mut self, tick: &TickInput, new_gps: bool) -> Option<DisarmEvent> {
        match self.phase {
            RescuePhase::Idle => {
                self.set_return_altitude(tick, new_gps);
                None
            }
            RescuePhase::Initialize => {
                self.initialize_rescue(tick);
                None
            }
            RescuePhase::AttainAlt => {
                // Walk the altitude target toward the return altitude; the
                // craft follows via the throttle loop.
                let step_rate = if self.initial_altitude_low {
                    self.cfg.ascend_rate_cm_s
                } else {
                    -self.cfg.descend_rate_cm_s
                };
                self.intent.altitude_step_cm = step_rate * self.sensor.task_interval_s;

                let current_altitude_low =
                    self.sensor.current_altitude_cm < self.intent.return_altitude_cm;
                if current_altitude_low == self.initial_altitude_low {
                    self.intent.target_altitude_cm += self.intent.altitude_step_cm;
                } else {
                    // Crossed the return altitude.
                    self.intent.target_altitude_cm = self.intent.return_altitude_cm;
                    self.phase = RescuePhase::Rotate;
                }
                None
            }
            RescuePhase::Rotate => {
                // Acquire yaw authority gradually to avoid a step command.
                self.intent.yaw_attenuator =
                    (self.intent.yaw_attenuator + self.sensor.task_interval_s).min(1.0);
                if self.sensor.abs_error_angle_deg < HEADING_ACQUIRED_DEG {
                    self.intent.pitch_angle_limit_deg = self.cfg.max_rescue_angle_deg;
                    self.intent.proximity_to_landing_area = 1.0;
                    self.initial_velocity_low =
                        self.sensor.velocity_to_home_cm_s < self.cfg.rescue_groundspeed_cm_s;
                    self.phase = RescuePhase::FlyHome;
                }
                None
            }
            RescuePhase::FlyHome => {
                self.intent.yaw_attenuator =
                    (self.intent.yaw_attenuator + self.sensor.task_interval_s).min(1.0);

                // Glide the velocity target in with a 1 s time constant, and
                // the integrator relax with a 2 s one.
                self.intent.target_velocity_cm_s += self.sensor.task_interval_s
                    * (self.cfg.rescue_groundspeed_cm_s - self.intent.target_velocity_cm_s);
                self.intent.velocity_iterm_relax += 0.5
                    * self.sensor.task_interval_s
                    * (1.0 - self.intent.velocity_iterm_relax);
                self.intent.velocity_pid_cutoff_modifier = 2.0 - self.intent.velocity_iterm_relax;
                self.intent.roll_angle_limit_deg =
                    0.5 * self.intent.velocity_iterm_relax * self.cfg.max_rescue_angle_deg;

                if new_gps && self.sensor.distance_to_home_m <= self.intent.descent_distance_m {
                    self.intent.seconds_failing = 0;
                    self.phase = RescuePhase::Descent;
                }
                None
            }
            RescuePhase::Descent => {
                if self.sensor.current_altitude_cm < self.intent.target_landing_altitude_cm {
                    self.intent.seconds_failing = 0;
                    self.phase = RescuePhase::Landing;
                }
                self.descend(new_gps);
                None
            }
            RescuePhase::Landing => {
                let event = self.disarm_on_impact();
                self.descend(new_gps);
                event
            }
            RescuePhase::DoNothing => self.disarm_on_impact(),
            RescuePhase::Abort => {
                warn!("gps rescue: aborting");
                self.intent.seconds_failing = 0;
                self.stop();
                Some(DisarmEvent {
                    reason: DisarmReason::Failsafe,
                    disable_arming: true,
                })
            }
            RescuePhase::Complete => {
                self.stop();
                None
            }
        }
    }

    /// Idle-phase bookkeeping: keep the return altitude and descent distance
    /// valid at all times so a rescue can start on any tick.
    fn set_return_altitude(&mut self, tick: &TickInput, new_gps: bool) {
        use crate::config::AltitudeMode;

        if !tick.flight.armed && !self.cfg.set_home_point_once {
            self.intent.max_altitude_cm = 0.0;
            return;
        }

        self.intent.max_altitude_cm = self
            .sensor
            .current_altitude_cm
            .max(self.intent.max_altitude_cm);

        if new_gps {
            // Seed the setpoint at the current altitude so entry produces no
            // derivative kick.
            self.intent.target_altitude_cm = self.sensor.current_altitude_cm;

            self.intent.descent_distance_m = self
                .sensor
                .distance_to_home_m
                .min(self.cfg.descent_distance_m)
                .max(5.0);

            let buffer_cm = self.cfg.rescue_altitude_buffer_m * 100.0;
            self.intent.return_altitude_cm = match self.cfg.altitude_mode {
                AltitudeMode::Fixed => self.cfg.initial_altitude_m * 100.0,
                AltitudeMode::Current => self.sensor.current_altitude_cm + buffer_cm,
                AltitudeMode::Max => self.intent.max_altitude_cm + buffer_cm,
            };
        }
    }

    /// Decide the route on the first rescue tick.
    fn initialize_rescue(&mut self, tick: &TickInput) {
        if !tick.gps.have_home {
            warn!("gps rescue: no home point");
            self.failure = FailureKind::NoHomePoint;
            // The supervisor escalates this per policy.
            return;
        }

        if self.sensor.distance_to_home_m < self.cfg.min_rescue_dth_m {
            if self.sensor.distance_to_home_m < INSTANT_ABORT_DISTANCE_M
                && self.sensor.current_altitude_cm < self.intent.target_landing_altitude_cm
            {
                // On the ground next to home; flying anywhere is worse than
                // refusing.
                self.phase = RescuePhase::Abort;
            } else {
                // Too close for a climb-out; descend vertically from here.
                self.intent.return_altitude_cm = self.sensor.current_altitude_cm;
                self.intent.target_altitude_cm = self.sensor.current_altitude_cm;
                self.intent.altitude_step_cm = 0.0;
                self.intent.target_velocity_cm_s = 0.0;
                self.intent.pitch_angle_limit_deg = 0.0;
                self.intent.roll_angle_limit_deg = 0.0;
                self.intent.proximity_to_landing_area = 0.0;
                self.intent.velocity_iterm_relax = 0.0;
                self.intent.yaw_attenuator = 0.0;
                self.phase = RescuePhase::Landing;
            }
            return;
        }

        self.intent.yaw_attenuator = 0.0;
        self.intent.velocity_iterm_relax = 0.0;
        self.intent.proximity_to_landing_area = 0.0;
        self.intent.pitch_angle_limit_deg = 0.0;
        self.intent.roll_angle_limit_deg = 0.0;
        self.initial_altitude_low =
            self.sensor.current_altitude_cm < self.intent.return_altitude_cm;
        self.phase = RescuePhase::AttainAlt;
    }

    /// Step the altitude target down, and on fresh GPS data re-derive the
    /// approach geometry from the distance still to cover.
    fn descend(&mut self, new_gps: bool) {
        if new_gps {
            // The landing area is a circle of half the landing altitude
            // around home, so the approach can end short of overshooting.
            let distance_to_landing_area_m = self.sensor.distance_to_home_m
                - 0.5 * self.cfg.target_landing_altitude_m;
            let proximity =
                (distance_to_landing_area_m / self.intent.descent_distance_m).clamp(0.0, 1.0);
            self.intent.proximity_to_landing_area = proximity;
            // Sharper velocity filtering response closer in.
            self.intent.velocity_pid_cutoff_modifier = 2.5 - proximity;
            self.intent.target_velocity_cm_s = self.cfg.rescue_groundspeed_cm_s * proximity;
            self.intent.roll_angle_limit_deg = self.cfg.max_rescue_angle_deg * proximity;
        }

        self.intent.altitude_step_cm =
            -self.sensor.altitude_data_interval_s * self.cfg.descend_rate_cm_s;

        // Low return altitudes descend more gently.
        let descent_attenuator = self.intent.return_altitude_cm / DESCENT_ATTENUATION_ALT_CM;
        if descent_attenuator < 1.0 {
            self.intent.altitude_step_cm *= descent_attenuator;
        }
        // And high targets descend up to 3x faster.
        self.intent.descent_rate_modifier =
            (self.intent.target_altitude_cm / DESCENT_BOOST_ALT_CM).clamp(0.0, 1.0);
        self.intent.target_altitude_cm +=
            self.intent.altitude_step_cm * (1.0 + 2.0 * self.intent.descent_rate_modifier);
    }

    fn disarm_on_impact(&mut self) -> Option<DisarmEvent> {
        if self.sensor.acc_magnitude > self.intent.disarm_threshold_g {
            warn!("gps rescue: impact detected, disarming");
            self.stop();
            return Some(DisarmEvent {
                reason: DisarmReason::GpsRescue,
                disable_arming: false,
            });
        }
        None
    }

    // Status and output accessors.

    pub fn phase(&self) -> RescuePhase {
        self.phase
    }

    pub fn failure(&self) -> FailureKind {
        self.failure
    }

    /// Raw controller outputs: angle offsets in deg x 100, yaw in deg/s,
    /// throttle in PWM microseconds.
    pub fn outputs(&self) -> &CtrlOutputs {
        &self.outputs
    }

    /// Commanded yaw rate in deg/s.
    pub fn yaw_rate(&self) -> f32 {
        self.outputs.yaw_dps
    }

    /// Commanded throttle rescaled to 0..1 for the mixer. The pilot range
    /// starts at mincheck, so the rescale compensates for it.
    pub fn throttle(&self) -> f32 {
        let range_min = self.cfg.throttle_mincheck.max(PWM_RANGE_MIN);
        ((self.outputs.throttle - range_min) / (PWM_RANGE_MAX - range_min)).clamp(0.0, 1.0)
    }

    /// Cached result of the 1 Hz availability check.
    pub fn is_available(&self) -> bool {
        self.is_available
    }

    /// A rescue can be triggered at all: assigned to a switch or set as the
    /// failsafe procedure.
    pub fn is_configured(&self) -> bool {
        self.cfg.failsafe_procedure_rescue || self.cfg.mode_switch_assigned
    }

    /// No home point was captured; a rescue cannot navigate.
    pub fn is_disabled(&self) -> bool {
        !self.home_fix
    }

    /// The attitude estimator must ignore the magnetometer: the pilot opted
    /// out, or the flyaway monitor force-disabled it mid-rescue.
    pub fn disable_mag(&self) -> bool {
        (!self.cfg.use_mag || self.mag_force_disable)
            && matches!(
                self.phase,
                RescuePhase::Initialize
                    | RescuePhase::AttainAlt
                    | RescuePhase::Rotate
                    | RescuePhase::FlyHome
                    | RescuePhase::Descent
                    | RescuePhase::Landing
            )
    }
}
