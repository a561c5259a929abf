//! Adaptive ODE integration over batched burn tensors.
//!
//! Solves
//! \[
//! \frac{dz}{dt} = f(t, z), \qquad z(t_0) = z_0
//! \]
//! for a batch of states `[batch, width]` with the Dormand–Prince 5(4) pair (FSAL, local
//! extrapolation). Only the endpoint \(z(t_1)\) is returned; `t1 < t0` integrates backwards.
//!
//! The solver is written against `Backend`, not a concrete tensor type:
//! - on an autodiff backend every stage is recorded, so the endpoint can be differentiated
//!   through the whole discretization;
//! - on an inner backend it is a plain forward solve.
//!
//! Step-size control only ever looks at detached values, so the graph never contains the
//! controller itself.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use crate::{Error, Result};

/// Nodes `c_i` of the Dormand–Prince tableau.
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

/// Rows `a_i` of the tableau (row 0 is empty).
const A: [&[f64]; 7] = [
    &[],
    &[1.0 / 5.0],
    &[3.0 / 40.0, 9.0 / 40.0],
    &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
    &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
    &[
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
    &DOPRI5_B,
];

/// 5th-order solution weights. Stage 7 is FSAL and has weight zero.
pub const DOPRI5_B: [f64; 7] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
    0.0,
];

/// Difference between the 5th- and embedded 4th-order weights.
const E: [f64; 7] = [
    35.0 / 384.0 - 5179.0 / 57600.0,
    0.0,
    500.0 / 1113.0 - 7571.0 / 16695.0,
    125.0 / 192.0 - 393.0 / 640.0,
    -2187.0 / 6784.0 + 92097.0 / 339200.0,
    11.0 / 84.0 - 187.0 / 2100.0,
    -1.0 / 40.0,
];

/// Adaptive solver settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    /// Relative tolerance.
    pub rtol: f64,
    /// Absolute tolerance.
    pub atol: f64,
    /// Accepted + rejected steps allowed before giving up.
    pub max_steps: usize,
    /// Safety factor on the optimal step size.
    pub safety: f64,
    /// Largest step growth factor.
    pub ifactor: f64,
    /// Smallest step shrink factor.
    pub dfactor: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-3,
            max_steps: 100_000,
            safety: 0.9,
            ifactor: 10.0,
            dfactor: 0.2,
        }
    }
}

impl SolverOptions {
    /// Same value for `rtol` and `atol`.
    pub fn with_tol(tol: f64) -> Self {
        Self {
            rtol: tol,
            atol: tol,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(Error::Domain("rtol must be positive and finite"));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(Error::Domain("atol must be positive and finite"));
        }
        if self.max_steps == 0 {
            return Err(Error::Domain("max_steps must be >= 1"));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(Error::Domain("safety must be in (0, 1]"));
        }
        if !(self.dfactor > 0.0 && self.dfactor < 1.0 && self.ifactor > 1.0) {
            return Err(Error::Domain("need 0 < dfactor < 1 < ifactor"));
        }
        Ok(())
    }
}

/// Step counts of one solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolveStats {
    pub accepted: usize,
    pub rejected: usize,
}

/// An accepted step, handed to the observer of [`dopri5`].
///
/// `stages[i]` is the stage input `(t_i, y_i)`; the step's update is
/// `y_new = y + h * sum_i DOPRI5_B[i] * f(t_i, y_i)`.
pub struct AcceptedStep<'a, B: Backend> {
    pub t: f64,
    /// Signed step (negative when integrating backwards).
    pub h: f64,
    pub stages: &'a [(f64, Tensor<B, 2>)],
}

/// `sum_i h * coeffs[i] * ks[i]`, skipping zero coefficients.
fn weighted_sum<B: Backend>(h: f64, coeffs: &[f64], ks: &[Tensor<B, 2>]) -> Tensor<B, 2> {
    let mut acc: Option<Tensor<B, 2>> = None;
    for (c, k) in coeffs.iter().zip(ks.iter()) {
        if *c == 0.0 {
            continue;
        }
        let term = k.clone().mul_scalar(h * c);
        acc = Some(match acc {
            Some(a) => a + term,
            None => term,
        });
    }
    acc.unwrap_or_else(|| ks[0].zeros_like())
}

fn rms<B: Backend>(x: Tensor<B, 2>) -> f64 {
    let ms = x.powf_scalar(2.0).mean().into_scalar().elem::<f64>();
    ms.sqrt()
}

/// Tolerance scale `atol + rtol * max(|a|, |b|)` on detached values.
fn tol_scale<B: Backend>(a: &Tensor<B, 2>, b: &Tensor<B, 2>, opts: &SolverOptions) -> Tensor<B, 2> {
    a.clone()
        .detach()
        .abs()
        .max_pair(b.clone().detach().abs())
        .mul_scalar(opts.rtol)
        .add_scalar(opts.atol)
}

/// Hairer's starting step heuristic (order 5). Returns a step magnitude.
fn initial_step<B, F>(
    f: &mut F,
    t0: f64,
    y0: &Tensor<B, 2>,
    f0: &Tensor<B, 2>,
    dir: f64,
    opts: &SolverOptions,
) -> Result<f64>
where
    B: Backend,
    F: FnMut(f64, Tensor<B, 2>) -> Result<Tensor<B, 2>>,
{
    let y0 = y0.clone().detach();
    let f0 = f0.clone().detach();
    let scale = tol_scale(&y0, &y0, opts);

    let d0 = rms(y0.clone() / scale.clone());
    let d1 = rms(f0.clone() / scale.clone());
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };

    let y1 = y0 + f0.clone().mul_scalar(dir * h0);
    let f1 = f(t0 + dir * h0, y1)?.detach();
    let d2 = rms((f1 - f0) / scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / 5.0)
    };
    let h = (100.0 * h0).min(h1);
    if !h.is_finite() || h <= 0.0 {
        return Err(Error::Solver {
            t: t0,
            reason: "could not select a finite initial step",
        });
    }
    Ok(h)
}

/// Integrate from `t0` to `t1` and return the endpoint.
pub fn integrate<B, F>(
    f: F,
    y0: Tensor<B, 2>,
    t0: f64,
    t1: f64,
    opts: &SolverOptions,
) -> Result<(Tensor<B, 2>, SolveStats)>
where
    B: Backend,
    F: FnMut(f64, Tensor<B, 2>) -> Result<Tensor<B, 2>>,
{
    dopri5(f, y0, t0, t1, opts, |_| {})
}

/// Dormand–Prince 5(4) with adaptive steps; `observe` sees every accepted step.
///
/// Errors (all fatal, no retry):
/// - `Error::Domain` for invalid options or non-finite times,
/// - `Error::Solver` when `max_steps` is exceeded or the step size underflows
///   (this includes a field that produces NaN/inf).
pub fn dopri5<B, F, O>(
    mut f: F,
    y0: Tensor<B, 2>,
    t0: f64,
    t1: f64,
    opts: &SolverOptions,
    mut observe: O,
) -> Result<(Tensor<B, 2>, SolveStats)>
where
    B: Backend,
    F: FnMut(f64, Tensor<B, 2>) -> Result<Tensor<B, 2>>,
    O: FnMut(&AcceptedStep<'_, B>),
{
    opts.validate()?;
    if !t0.is_finite() || !t1.is_finite() {
        return Err(Error::Domain("t0 and t1 must be finite"));
    }

    let mut stats = SolveStats::default();
    if t0 == t1 {
        return Ok((y0, stats));
    }

    let dir = (t1 - t0).signum();
    let mut t = t0;
    let mut y = y0;
    let mut k1 = f(t, y.clone())?;
    let mut h = initial_step(&mut f, t, &y, &k1, dir, opts)?;

    let mut stages: Vec<(f64, Tensor<B, 2>)> = Vec::with_capacity(7);
    let mut ks: Vec<Tensor<B, 2>> = Vec::with_capacity(7);

    loop {
        let remaining = (t1 - t) * dir;
        if remaining <= 0.0 {
            break;
        }
        if stats.accepted + stats.rejected >= opts.max_steps {
            return Err(Error::Solver {
                t,
                reason: "exceeded max_steps",
            });
        }

        let last = h >= remaining;
        let hs = if last { remaining } else { h };
        let hh = dir * hs;

        stages.clear();
        ks.clear();
        stages.push((t, y.clone()));
        ks.push(k1.clone());
        for s in 1..7 {
            let yi = y.clone() + weighted_sum(hh, A[s], &ks);
            let ti = t + C[s] * hh;
            let ki = f(ti, yi.clone())?;
            stages.push((ti, yi));
            ks.push(ki);
        }

        // FSAL: the last stage input is the 5th-order solution.
        let y_new = stages[6].1.clone();
        let err = weighted_sum(hh, &E, &ks);
        let ratio = rms(err.detach() / tol_scale(&y, &y_new, opts));

        let factor = if !ratio.is_finite() {
            stats.rejected += 1;
            opts.dfactor
        } else if ratio <= 1.0 {
            stats.accepted += 1;
            observe(&AcceptedStep {
                t,
                h: hh,
                stages: &stages,
            });
            t = if last { t1 } else { t + hh };
            y = y_new;
            k1 = ks[6].clone();
            if ratio == 0.0 {
                opts.ifactor
            } else {
                // Never shrink after an accepted step.
                (opts.safety * ratio.powf(-1.0 / 5.0)).clamp(1.0, opts.ifactor)
            }
        } else {
            stats.rejected += 1;
            (opts.safety * ratio.powf(-1.0 / 5.0)).clamp(opts.dfactor, 1.0)
        };

        // Reached t1: the next step size is irrelevant, even if it is a sliver.
        if t == t1 {
            break;
        }
        h = hs * factor;
        if !h.is_finite() || h <= 1e-14 * t.abs().max(1.0) {
            return Err(Error::Solver {
                t,
                reason: "step size underflow",
            });
        }
    }

    Ok((y, stats))
}
