//! Orbit ephemeris from a single state vector
//!
//! The product's Earth-fixed state vector is rotated into a pseudo-inertial
//! (true-equator, mean-sidereal) frame and integrated with an adaptive
//! Dormand-Prince 5(4) scheme over the acquisition window plus a margin. The
//! force model is a point mass with J2-J4 zonal terms and Sun/Moon third-body
//! attraction from low-precision analytic ephemerides.

use crate::types::{datetime_to_mjd2000, StateVector, UngridError, UngridResult, SECONDS_PER_DAY};
use chrono::{DateTime, Utc};

/// Earth gravitational parameter (m^3/s^2)
pub const EARTH_MU: f64 = 3.986_004_415e14;
/// Equatorial radius used by the zonal harmonics (m)
pub const EARTH_RADIUS: f64 = 6_378_137.0;
/// Earth rotation rate (rad/s)
pub const EARTH_ROTATION_RATE: f64 = 7.292_115e-5;

const J2: f64 = 1.082_626_68e-3;
const J3: f64 = -2.532_656_49e-6;
const J4: f64 = -1.619_621_59e-6;

const SUN_MU: f64 = 1.327_124_400_18e20;
const MOON_MU: f64 = 4.902_8e12;

/// Days between the MJD2000 epoch and J2000.0 (2000-01-01T12:00)
const J2000_OFFSET_DAYS: f64 = 0.5;
const OBLIQUITY_DEG: f64 = 23.439_291_11;

type State = [f64; 6];

/// Position (m) and velocity (m/s) in the pseudo-inertial frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialState {
    pub position: [f64; 3],
    pub velocity: [f64; 3],
}

/// Builds an [`Ephemeris`] covering an acquisition window
pub trait Propagator: Send + Sync {
    fn propagate(
        &self,
        initial: &StateVector,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> UngridResult<Ephemeris>;
}

/// Integrator and force model settings
#[derive(Debug, Clone)]
pub struct PropagatorSettings {
    pub min_step_s: f64,
    pub max_step_s: f64,
    pub initial_step_s: f64,
    /// Absolute position tolerance per step (m)
    pub position_tolerance: f64,
    /// Absolute velocity tolerance per step (m/s)
    pub velocity_tolerance: f64,
    /// Extension of the window on each side (s)
    pub margin_s: f64,
    /// Include J2-J4 and Sun/Moon terms; point mass only when false
    pub perturbations: bool,
}

impl Default for PropagatorSettings {
    fn default() -> Self {
        Self {
            min_step_s: 1.0,
            max_step_s: 1000.0,
            initial_step_s: 60.0,
            position_tolerance: 1e-3,
            velocity_tolerance: 1e-6,
            margin_s: 600.0,
            perturbations: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NumericalPropagator {
    settings: PropagatorSettings,
}

impl NumericalPropagator {
    pub fn new(settings: PropagatorSettings) -> Self {
        Self { settings }
    }

    fn derivative(&self, epoch_mjd2000: f64, t: f64, y: &State) -> State {
        let r = [y[0], y[1], y[2]];
        let mut acc = point_mass(&r);
        if self.settings.perturbations {
            let zonal = zonal_harmonics(&r);
            let mjd = epoch_mjd2000 + t / SECONDS_PER_DAY;
            let sun = third_body(&r, &sun_position(mjd), SUN_MU);
            let moon = third_body(&r, &moon_position(mjd), MOON_MU);
            for i in 0..3 {
                acc[i] += zonal[i] + sun[i] + moon[i];
            }
        }
        [y[3], y[4], y[5], acc[0], acc[1], acc[2]]
    }

    /// One Dormand-Prince step: 5th order solution and scaled error norm
    fn step(&self, epoch: f64, t: f64, y: &State, h: f64) -> (State, f64) {
        const C: [f64; 5] = [1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0];
        const A: [[f64; 6]; 6] = [
            [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
            [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
            [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0],
            [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0],
            [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
        ];
        const E: [f64; 7] = [
            71.0 / 57600.0,
            0.0,
            -71.0 / 16695.0,
            71.0 / 1920.0,
            -17253.0 / 339200.0,
            22.0 / 525.0,
            -1.0 / 40.0,
        ];

        let mut k = [[0.0; 6]; 7];
        k[0] = self.derivative(epoch, t, y);
        let mut solution = *y;
        for stage in 0..6 {
            let mut yi = *y;
            for (j, kj) in k.iter().enumerate().take(stage + 1) {
                let a = A[stage][j];
                if a != 0.0 {
                    for n in 0..6 {
                        yi[n] += h * a * kj[n];
                    }
                }
            }
            // the last stage evaluates at the 5th order solution itself
            let offset = if stage < 5 { C[stage] } else { 1.0 };
            k[stage + 1] = self.derivative(epoch, t + offset * h, &yi);
            solution = yi;
        }

        let mut err = 0.0_f64;
        for n in 0..6 {
            let e: f64 = (0..7).map(|j| E[j] * k[j][n]).sum::<f64>() * h;
            let tol = if n < 3 {
                self.settings.position_tolerance
            } else {
                self.settings.velocity_tolerance
            };
            err = err.max(e.abs() / tol);
        }
        (solution, err)
    }

    /// Integrate from t=0 to `t_end`, returning every accepted step
    fn integrate(&self, epoch: f64, y0: &State, t_end: f64) -> UngridResult<Vec<(f64, State)>> {
        let s = &self.settings;
        let direction = if t_end >= 0.0 { 1.0 } else { -1.0 };
        let mut samples = vec![(0.0, *y0)];
        let mut t = 0.0;
        let mut y = *y0;
        let mut h = s.initial_step_s.clamp(s.min_step_s, s.max_step_s);

        while (t_end - t) * direction > 1e-9 {
            let remaining = (t_end - t).abs();
            let step = h.min(remaining);
            let (next, err) = self.step(epoch, t, &y, direction * step);

            if !err.is_finite() || next.iter().any(|v| !v.is_finite()) {
                return Err(UngridError::Propagation(format!(
                    "Integration diverged at t = {:.1} s",
                    t
                )));
            }

            let factor = if err > 0.0 {
                (0.9 * err.powf(-0.2)).clamp(0.2, 5.0)
            } else {
                5.0
            };

            if err <= 1.0 || step <= s.min_step_s {
                t += direction * step;
                y = next;
                samples.push((t, y));
            }
            h = (step * factor).clamp(s.min_step_s, s.max_step_s);
        }
        Ok(samples)
    }
}

impl Propagator for NumericalPropagator {
    fn propagate(
        &self,
        initial: &StateVector,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> UngridResult<Ephemeris> {
        if stop < start {
            return Err(UngridError::Propagation(format!(
                "Acquisition stop {} precedes start {}",
                stop, start
            )));
        }
        let epoch = datetime_to_mjd2000(initial.time);
        let window_start = (datetime_to_mjd2000(start) - epoch) * SECONDS_PER_DAY - self.settings.margin_s;
        let window_end = (datetime_to_mjd2000(stop) - epoch) * SECONDS_PER_DAY + self.settings.margin_s;

        log::info!(
            "Propagating orbit from {} over [{:.0} s, {:.0} s] relative to epoch",
            initial.time,
            window_start,
            window_end
        );

        let inertial = earth_fixed_to_inertial(epoch, &initial.position, &initial.velocity);
        let y0 = [
            inertial.position[0],
            inertial.position[1],
            inertial.position[2],
            inertial.velocity[0],
            inertial.velocity[1],
            inertial.velocity[2],
        ];

        let mut backward = self.integrate(epoch, &y0, window_start.min(0.0))?;
        let forward = self.integrate(epoch, &y0, window_end.max(0.0))?;
        backward.reverse();
        backward.pop();
        backward.extend(forward);

        log::debug!("Ephemeris holds {} integration steps", backward.len());
        Ok(Ephemeris {
            epoch_mjd2000: epoch,
            window_start,
            window_end,
            samples: backward,
        })
    }
}

/// Time-queryable orbit over a bounded window
#[derive(Debug, Clone)]
pub struct Ephemeris {
    epoch_mjd2000: f64,
    /// Window bounds in seconds from the epoch
    window_start: f64,
    window_end: f64,
    /// Ascending (seconds from epoch, state)
    samples: Vec<(f64, State)>,
}

impl Ephemeris {
    /// Valid time range in MJD2000 days
    pub fn window(&self) -> (f64, f64) {
        (
            self.epoch_mjd2000 + self.window_start / SECONDS_PER_DAY,
            self.epoch_mjd2000 + self.window_end / SECONDS_PER_DAY,
        )
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Inertial state at `mjd2000`, cubic Hermite between integration steps
    pub fn state_at(&self, mjd2000: f64) -> UngridResult<InertialState> {
        let t = (mjd2000 - self.epoch_mjd2000) * SECONDS_PER_DAY;
        if !(t >= self.window_start - 1e-6 && t <= self.window_end + 1e-6) {
            return Err(UngridError::Propagation(format!(
                "MJD2000 {:.8} is outside the ephemeris window",
                mjd2000
            )));
        }
        if self.samples.len() < 2 {
            let (_, y) = self.samples.first().ok_or_else(|| {
                UngridError::Propagation("Ephemeris holds no states".to_string())
            })?;
            return Ok(to_inertial(y));
        }

        let upper = self
            .samples
            .partition_point(|(ts, _)| *ts <= t)
            .clamp(1, self.samples.len() - 1);
        let (t0, y0) = &self.samples[upper - 1];
        let (t1, y1) = &self.samples[upper];
        let dt = t1 - t0;
        let s = (t - t0) / dt;

        let h00 = 2.0 * s.powi(3) - 3.0 * s * s + 1.0;
        let h10 = s.powi(3) - 2.0 * s * s + s;
        let h01 = -2.0 * s.powi(3) + 3.0 * s * s;
        let h11 = s.powi(3) - s * s;
        let d00 = 6.0 * s * s - 6.0 * s;
        let d10 = 3.0 * s * s - 4.0 * s + 1.0;
        let d01 = -6.0 * s * s + 6.0 * s;
        let d11 = 3.0 * s * s - 2.0 * s;

        let mut position = [0.0; 3];
        let mut velocity = [0.0; 3];
        for i in 0..3 {
            let (p0, v0, p1, v1) = (y0[i], y0[i + 3], y1[i], y1[i + 3]);
            position[i] = h00 * p0 + h10 * dt * v0 + h01 * p1 + h11 * dt * v1;
            velocity[i] = (d00 * p0 + d10 * dt * v0 + d01 * p1 + d11 * dt * v1) / dt;
        }
        Ok(InertialState { position, velocity })
    }

    /// Earth-fixed satellite position (m) at `mjd2000`
    pub fn position_ecef(&self, mjd2000: f64) -> UngridResult<[f64; 3]> {
        let state = self.state_at(mjd2000)?;
        Ok(rotate_z(&state.position, -gmst(mjd2000)))
    }
}

fn to_inertial(y: &State) -> InertialState {
    InertialState {
        position: [y[0], y[1], y[2]],
        velocity: [y[3], y[4], y[5]],
    }
}

/// Greenwich mean sidereal time (rad) at `mjd2000` (UT1 taken as UTC)
pub fn gmst(mjd2000: f64) -> f64 {
    let d = mjd2000 - J2000_OFFSET_DAYS;
    let t = d / 36525.0;
    let degrees = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t - t.powi(3) / 38_710_000.0;
    degrees.rem_euclid(360.0).to_radians()
}

fn rotate_z(v: &[f64; 3], angle: f64) -> [f64; 3] {
    let (s, c) = angle.sin_cos();
    [c * v[0] - s * v[1], s * v[0] + c * v[1], v[2]]
}

/// Rotate an Earth-fixed state into the pseudo-inertial frame
pub fn earth_fixed_to_inertial(mjd2000: f64, position: &[f64; 3], velocity: &[f64; 3]) -> InertialState {
    let theta = gmst(mjd2000);
    // v_i = R(v_e + w x r_e)
    let transport = [
        velocity[0] - EARTH_ROTATION_RATE * position[1],
        velocity[1] + EARTH_ROTATION_RATE * position[0],
        velocity[2],
    ];
    InertialState {
        position: rotate_z(position, theta),
        velocity: rotate_z(&transport, theta),
    }
}

/// Inverse of [`earth_fixed_to_inertial`]; returns (position, velocity)
pub fn inertial_to_earth_fixed(mjd2000: f64, state: &InertialState) -> ([f64; 3], [f64; 3]) {
    let theta = gmst(mjd2000);
    let position = rotate_z(&state.position, -theta);
    let rotated = rotate_z(&state.velocity, -theta);
    let velocity = [
        rotated[0] + EARTH_ROTATION_RATE * position[1],
        rotated[1] - EARTH_ROTATION_RATE * position[0],
        rotated[2],
    ];
    (position, velocity)
}

fn norm(v: &[f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn point_mass(r: &[f64; 3]) -> [f64; 3] {
    let d = norm(r);
    let k = -EARTH_MU / d.powi(3);
    [k * r[0], k * r[1], k * r[2]]
}

fn zonal_harmonics(r: &[f64; 3]) -> [f64; 3] {
    let d = norm(r);
    let (x, y, z) = (r[0], r[1], r[2]);
    let z2 = (z / d).powi(2);
    let z4 = z2 * z2;

    let k2 = -1.5 * J2 * EARTH_MU * EARTH_RADIUS.powi(2) / d.powi(5);
    let j2 = [k2 * x * (1.0 - 5.0 * z2), k2 * y * (1.0 - 5.0 * z2), k2 * z * (3.0 - 5.0 * z2)];

    let k3 = -2.5 * J3 * EARTH_MU * EARTH_RADIUS.powi(3) / d.powi(7);
    let j3 = [
        k3 * x * (3.0 * z - 7.0 * z.powi(3) / (d * d)),
        k3 * y * (3.0 * z - 7.0 * z.powi(3) / (d * d)),
        k3 * (6.0 * z * z - 7.0 * z.powi(4) / (d * d) - 0.6 * d * d),
    ];

    let k4 = 1.875 * J4 * EARTH_MU * EARTH_RADIUS.powi(4) / d.powi(7);
    let j4 = [
        k4 * x * (1.0 - 14.0 * z2 + 21.0 * z4),
        k4 * y * (1.0 - 14.0 * z2 + 21.0 * z4),
        k4 * z * (5.0 - 70.0 / 3.0 * z2 + 21.0 * z4),
    ];

    [j2[0] + j3[0] + j4[0], j2[1] + j3[1] + j4[1], j2[2] + j3[2] + j4[2]]
}

fn third_body(r: &[f64; 3], body: &[f64; 3], mu: f64) -> [f64; 3] {
    let rel = [body[0] - r[0], body[1] - r[1], body[2] - r[2]];
    let d_rel = norm(&rel).powi(3);
    let d_body = norm(body).powi(3);
    [
        mu * (rel[0] / d_rel - body[0] / d_body),
        mu * (rel[1] / d_rel - body[1] / d_body),
        mu * (rel[2] / d_rel - body[2] / d_body),
    ]
}

fn ecliptic_to_equatorial(v: [f64; 3]) -> [f64; 3] {
    let (s, c) = OBLIQUITY_DEG.to_radians().sin_cos();
    [v[0], c * v[1] - s * v[2], s * v[1] + c * v[2]]
}

/// Geocentric Sun position (m), low-precision analytic series
pub fn sun_position(mjd2000: f64) -> [f64; 3] {
    let t = (mjd2000 - J2000_OFFSET_DAYS) / 36525.0;
    let m = (357.5256 + 35_999.049 * t).to_radians();
    let longitude = (282.94 + m.to_degrees() + (6892.0 * m.sin() + 72.0 * (2.0 * m).sin()) / 3600.0).to_radians();
    let r = (149.619 - 2.499 * m.cos() - 0.021 * (2.0 * m).cos()) * 1e9;
    ecliptic_to_equatorial([r * longitude.cos(), r * longitude.sin(), 0.0])
}

/// Geocentric Moon position (m), low-precision analytic series
pub fn moon_position(mjd2000: f64) -> [f64; 3] {
    let t = (mjd2000 - J2000_OFFSET_DAYS) / 36525.0;
    let l0 = 218.316_17 + 481_267.880_88 * t - 1.3972 * t;
    let l = (134.962_92 + 477_198.867_53 * t).to_radians();
    let lp = (357.525_43 + 35_999.049_44 * t).to_radians();
    let f = (93.272_83 + 483_202.018_73 * t).to_radians();
    let d = (297.850_27 + 445_267.111_35 * t).to_radians();

    let longitude = l0
        + (22640.0 * l.sin() + 769.0 * (2.0 * l).sin() - 4586.0 * (l - 2.0 * d).sin()
            + 2370.0 * (2.0 * d).sin()
            - 668.0 * lp.sin()
            - 412.0 * (2.0 * f).sin()
            - 212.0 * (2.0 * l - 2.0 * d).sin()
            - 206.0 * (l + lp - 2.0 * d).sin()
            + 192.0 * (l + 2.0 * d).sin()
            - 165.0 * (lp - 2.0 * d).sin()
            + 148.0 * (l - lp).sin()
            - 125.0 * d.sin()
            - 110.0 * (l + lp).sin()
            - 55.0 * (2.0 * f - 2.0 * d).sin())
            / 3600.0;

    let arg = f + (longitude - l0).to_radians() + ((412.0 * (2.0 * f).sin() + 541.0 * lp.sin()) / 3600.0).to_radians();
    let latitude = (18520.0 * arg.sin() - 526.0 * (f - 2.0 * d).sin() + 44.0 * (l + f - 2.0 * d).sin()
        - 31.0 * (-l + f - 2.0 * d).sin()
        - 25.0 * (-2.0 * l + f).sin()
        - 23.0 * (lp + f - 2.0 * d).sin()
        + 21.0 * (-l + f).sin()
        + 11.0 * (-lp + f - 2.0 * d).sin())
        / 3600.0;

    let r = (385_000.0 - 20_905.0 * l.cos() - 3699.0 * (2.0 * d - l).cos() - 2956.0 * (2.0 * d).cos()
        - 570.0 * (2.0 * l).cos()
        + 246.0 * (2.0 * l - 2.0 * d).cos()
        - 205.0 * (lp - 2.0 * d).cos()
        - 171.0 * (l + 2.0 * d).cos()
        - 152.0 * (l + lp - 2.0 * d).cos())
        * 1e3;

    let (lon, lat) = (longitude.to_radians(), latitude.to_radians());
    ecliptic_to_equatorial([r * lat.cos() * lon.cos(), r * lat.cos() * lon.sin(), r * lat.sin()])
}
