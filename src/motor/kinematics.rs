//! Speed profile of a motor as a pure state machine.
//!
//! A [`Profile`] is fixed at construction (after the ramp clamp). A
//! [`KinematicState`] is advanced by [`Profile::advance`], which returns the
//! next state and the commanded speed for that step. Speeds are per
//! nanosecond: rad/ns for rotary motors, nm/ns for linear ones.

/// Time-limited or distance-limited cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleLimit {
    /// Cycle length in ns.
    Time(f64),
    /// Distance per cycle in rad (rotary) or nm (linear).
    Distance(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclePolicy {
    pub limit: CycleLimit,
    /// Pause after each cycle, ns. Zero means no pause.
    pub pause: f64,
    /// Stop for good once this many cycles completed.
    pub stop_after: Option<u32>,
    pub swap_polarity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    top_speed: f64,
    ramp_in: f64,
    ramp_out: f64,
    acceleration: f64,
    deceleration: f64,
    /// Cycle reference (time or distance) past which deceleration starts.
    stop_at: f64,
    cycle: Option<CyclePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Paused,
    Running,
    Decelerating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KinematicState {
    /// +1 or -1.
    pub polarity: f64,
    /// Time driven since start, ns. Excludes steps after stopping.
    pub elapsed: f64,
    /// Distance covered since start, in speed units × ns.
    pub distance: f64,
    pub cycle_time: f64,
    pub cycle_distance: f64,
    /// Cycle time at which the current deceleration began.
    pub decelerating_since: Option<f64>,
    pub pause_time: f64,
    pub paused: bool,
    pub completed_cycles: u32,
    pub stopped: bool,
}

impl KinematicState {
    pub fn new(polarity: f64) -> Self {
        Self {
            polarity,
            elapsed: 0.0,
            distance: 0.0,
            cycle_time: 0.0,
            cycle_distance: 0.0,
            decelerating_since: None,
            pause_time: 0.0,
            paused: false,
            completed_cycles: 0,
            stopped: false,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.stopped {
            Phase::Stopped
        } else if self.paused {
            Phase::Paused
        } else if self.decelerating_since.is_some() {
            Phase::Decelerating
        } else {
            Phase::Running
        }
    }
}

fn rate(top_speed: f64, ramp: f64) -> f64 {
    if ramp <= 0.0 { 0.0 } else { top_speed / ramp }
}

impl Profile {
    /// A motor that ramps in and then holds its top speed forever.
    pub fn continuous(top_speed: f64, ramp_in: f64) -> Self {
        let ramp_in = ramp_in.max(0.0);
        Self {
            top_speed,
            ramp_in,
            ramp_out: 0.0,
            acceleration: rate(top_speed, ramp_in),
            deceleration: 0.0,
            stop_at: f64::INFINITY,
            cycle: None,
        }
    }

    /// A cycling motor. Ramps that do not fit in one cycle are shortened
    /// together and the top speed lowered to what the acceleration reaches.
    pub fn cycling(top_speed: f64, ramp_in: f64, ramp_out: f64, policy: CyclePolicy) -> Self {
        let mut profile = Self {
            top_speed,
            ramp_in: ramp_in.max(0.0),
            ramp_out: ramp_out.max(0.0),
            acceleration: rate(top_speed, ramp_in),
            deceleration: rate(top_speed, ramp_out),
            stop_at: 0.0,
            cycle: Some(policy),
        };
        match policy.limit {
            CycleLimit::Time(limit) => profile.fit_time(limit.max(0.0)),
            CycleLimit::Distance(limit) => profile.fit_distance(limit.max(0.0)),
        }
        profile
    }

    fn fit_time(&mut self, limit: f64) {
        let ramps = self.ramp_in + self.ramp_out;
        if limit < ramps {
            let ratio = self.ramp_in / ramps;
            self.ramp_in = limit * ratio;
            self.ramp_out = limit - self.ramp_in;
            self.lower_top_speed();
        }
        self.stop_at = limit - self.ramp_out;
    }

    fn fit_distance(&mut self, limit: f64) {
        let ramp_distances = |profile: &Self| {
            (
                0.5 * profile.acceleration * profile.ramp_in * profile.ramp_in,
                0.5 * profile.deceleration * profile.ramp_out * profile.ramp_out,
            )
        };
        let (accelerating, decelerating) = ramp_distances(self);
        if self.top_speed > 0.0 {
            let constant_time = (limit - accelerating - decelerating) / self.top_speed;
            if constant_time < 0.0 {
                let ratio = self.ramp_in / (self.ramp_in + self.ramp_out);
                self.ramp_in += constant_time * (1.0 - ratio);
                self.ramp_out += constant_time * ratio;

                let (accelerating, decelerating) = ramp_distances(self);
                if self.ramp_in < 0.0 || self.ramp_out < 0.0 || accelerating + decelerating > limit {
                    // Scale both ramps by one factor so the two ramp areas cover the limit exactly.
                    let denominator = self.acceleration * ratio * ratio + self.deceleration * (1.0 - ratio) * (1.0 - ratio);
                    let scale = if denominator > 0.0 { (2.0 * limit / denominator).sqrt() } else { 0.0 };
                    self.ramp_in = ratio * scale;
                    self.ramp_out = (1.0 - ratio) * scale;
                }
                self.lower_top_speed();
            }
        }
        let (_, decelerating) = ramp_distances(self);
        self.stop_at = limit - decelerating;
    }

    /// Top speed reachable within the shortened ramp in. Without acceleration
    /// that is zero: a clamped motor with no ramp in does not move.
    fn lower_top_speed(&mut self) {
        self.top_speed = self.ramp_in * self.acceleration;
    }

    pub fn top_speed(&self) -> f64 {
        self.top_speed
    }

    pub fn ramp_in(&self) -> f64 {
        self.ramp_in
    }

    pub fn ramp_out(&self) -> f64 {
        self.ramp_out
    }

    pub fn stop_at(&self) -> f64 {
        self.stop_at
    }

    pub fn cycle(&self) -> Option<&CyclePolicy> {
        self.cycle.as_ref()
    }

    /// Advances `state` by `dt` ns and returns it with the speed for this step.
    pub fn advance(&self, mut state: KinematicState, dt: f64) -> (KinematicState, f64) {
        if state.stopped {
            return (state, 0.0);
        }
        state.elapsed += dt;

        if state.paused {
            state.pause_time += dt;
            let pause = self.cycle.map(|policy| policy.pause).unwrap_or(0.0);
            if state.pause_time >= pause {
                state.pause_time = 0.0;
                state.paused = false;
            }
            return (state, 0.0);
        }

        state.cycle_time += dt;
        let mut speed = if state.cycle_time < self.ramp_in {
            self.top_speed * state.cycle_time / self.ramp_in
        } else {
            self.top_speed
        };

        if let Some(policy) = self.cycle {
            let reference = match policy.limit {
                CycleLimit::Time(_) => state.cycle_time,
                // distance once this step is driven, like cycle_time above
                CycleLimit::Distance(_) => state.cycle_distance + speed * dt,
            };
            if reference > self.stop_at {
                let since = *state.decelerating_since.get_or_insert(state.cycle_time);
                let overshoot = state.cycle_time - since;
                if overshoot >= self.ramp_out {
                    complete_cycle(&mut state, &policy);
                    speed = 0.0;
                } else {
                    speed = speed.min(self.top_speed * (1.0 - overshoot / self.ramp_out));
                }
            }
        }

        state.cycle_distance += speed * dt;
        state.distance += speed * dt;
        (state, speed)
    }
}

fn complete_cycle(state: &mut KinematicState, policy: &CyclePolicy) {
    state.decelerating_since = None;
    state.cycle_distance = 0.0;
    state.cycle_time = 0.0;
    state.completed_cycles += 1;
    if policy.pause > 0.0 {
        state.paused = true;
        state.pause_time = 0.0;
    }
    match policy.stop_after {
        Some(cycles) if state.completed_cycles >= cycles => state.stopped = true,
        _ if policy.swap_polarity => state.polarity = -state.polarity,
        _ => {}
    }
}
