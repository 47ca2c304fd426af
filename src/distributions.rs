/*!
The generalized inverse-Gaussian (GIG) distribution used for the local shrinkage scales.

A GIG(p, a, b) variate has density proportional to

```text
x^(p-1) exp(-(a x + b / x) / 2),   x > 0.
```

Draws use the exponential-envelope rejection scheme of Devroye (2014), "Random variate
generation for the generalized inverse Gaussian distribution", evaluated entirely on the log
scale. The sampler never owns a generator: randomness is always injected by the caller, so two
calls with identically seeded generators produce identical variates.

# Examples

```rust
use mini_csx::distributions::Gig;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::Distribution;

let gig = Gig::new(0.0, 2.0, 1.5).expect("valid parameters");
let mut rng = SmallRng::seed_from_u64(42);
let x = gig.sample(&mut rng);
assert!(x > 0.0);
```
*/

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::error::{CsxError, Result};

/// ω below which the two-parameter envelope is replaced by its gamma limit.
const OMEGA_LIMIT: f64 = 1e-150;
/// Smallest ω for which the envelope of a zero-order GIG, which has no gamma limit, stays
/// representable.
const OMEGA_MIN_ZERO_ORDER: f64 = 1e-300;

/// A validated GIG(p, a, b) distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gig {
    p: f64,
    a: f64,
    b: f64,
    form: Form,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Form {
    /// General case: Devroye rejection in the two-parameter form gig(λ, ω).
    Devroye(Envelope),
    /// ω ≈ 0 with p > 0: Gamma(p, rate a/2).
    Gamma { shape: f64, scale: f64 },
    /// ω ≈ 0 with p < 0: 1 / Gamma(-p, rate b/2).
    InverseGamma { shape: f64, scale: f64 },
}

/// Precomputed envelope constants of the Devroye sampler for gig(λ, ω) with λ ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Envelope {
    alpha: f64,
    lambda: f64,
    /// log of the mode-shift factor λ/ω + sqrt(1 + λ²/ω²).
    log_shift: f64,
    /// Whether the original p was negative (sample the reciprocal).
    swap: bool,
    /// log sqrt(b / a), the scale of the three-parameter form.
    log_scale: f64,
    t: f64,
    s: f64,
    eta: f64,
    zeta: f64,
    theta: f64,
    xi: f64,
    p_len: f64,
    r_len: f64,
    td: f64,
    sd: f64,
    q_len: f64,
}

impl Gig {
    /// Creates GIG(p, a, b). Requires `a > 0`, `b >= 0` and finite parameters; `b == 0` is only
    /// proper when `p > 0`.
    pub fn new(p: f64, a: f64, b: f64) -> Result<Self> {
        if !(p.is_finite() && a.is_finite() && b.is_finite()) {
            return Err(CsxError::InvalidParameter(format!(
                "GIG parameters must be finite, got p={p}, a={a}, b={b}"
            )));
        }
        if a <= 0.0 {
            return Err(CsxError::InvalidParameter(format!(
                "GIG requires a > 0, got a={a}"
            )));
        }
        if b < 0.0 {
            return Err(CsxError::InvalidParameter(format!(
                "GIG requires b >= 0, got b={b}"
            )));
        }

        let omega = (a * b).sqrt();
        let form = if omega > OMEGA_LIMIT || (p == 0.0 && omega >= OMEGA_MIN_ZERO_ORDER) {
            Form::Devroye(Envelope::new(p, a, b, omega))
        } else if p > 0.0 {
            Form::Gamma {
                shape: p,
                scale: 2.0 / a,
            }
        } else if p < 0.0 && b > 0.0 {
            Form::InverseGamma {
                shape: -p,
                scale: 2.0 / b,
            }
        } else {
            return Err(CsxError::InvalidParameter(format!(
                "GIG(p={p}, a={a}, b={b}) is improper"
            )));
        };

        Ok(Self { p, a, b, form })
    }

    /// Unnormalized log-density at `x`.
    pub fn unnorm_log_prob(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return f64::NEG_INFINITY;
        }
        (self.p - 1.0) * x.ln() - 0.5 * (self.a * x + self.b / x)
    }
}

impl Envelope {
    fn new(p: f64, a: f64, b: f64, omega: f64) -> Self {
        let swap = p < 0.0;
        let lambda = p.abs();
        // sqrt(ω² + λ²) - λ without cancellation for λ >> ω.
        let alpha = omega * omega / ((omega * omega + lambda * lambda).sqrt() + lambda);

        let t = {
            let x = -log_h(1.0, alpha, lambda);
            if (0.5..=2.0).contains(&x) {
                1.0
            } else if x > 2.0 {
                (2.0 / (alpha + lambda)).sqrt()
            } else {
                (4.0 / (alpha + 2.0 * lambda)).ln()
            }
        };

        let s = {
            let x = -log_h(-1.0, alpha, lambda);
            if (0.5..=2.0).contains(&x) {
                1.0
            } else if x > 2.0 {
                (4.0 / (alpha * 1f64.cosh() + lambda)).sqrt()
            } else {
                // ln(1 + 1/α + sqrt(1/α² + 2/α)), arranged to avoid overflow for tiny α.
                let tail = ((1.0 + (1.0 + 2.0 * alpha).sqrt()) / alpha).ln_1p();
                if lambda > 0.0 {
                    (1.0 / lambda).min(tail)
                } else {
                    tail
                }
            }
        };

        let eta = -log_h(t, alpha, lambda);
        let zeta = -dlog_h(t, alpha, lambda);
        let theta = -log_h(-s, alpha, lambda);
        let xi = dlog_h(-s, alpha, lambda);
        let p_len = 1.0 / xi;
        let r_len = 1.0 / zeta;
        let td = t - r_len * eta;
        let sd = s - p_len * theta;

        Self {
            alpha,
            lambda,
            log_shift: (lambda / omega).asinh(),
            swap,
            log_scale: 0.5 * (b.ln() - a.ln()),
            t,
            s,
            eta,
            zeta,
            theta,
            xi,
            p_len,
            r_len,
            td,
            sd,
            q_len: td + sd,
        }
    }

    /// Draws log(x) for the two-parameter variate before swapping and scaling.
    fn sample_log<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let total = self.p_len + self.q_len + self.r_len;
        loop {
            let u: f64 = rng.gen();
            // (0, 1] so that logarithms stay finite.
            let v: f64 = 1.0 - rng.gen::<f64>();
            let w: f64 = 1.0 - rng.gen::<f64>();

            let x = if u < self.q_len / total {
                -self.sd + self.q_len * v
            } else if u < (self.q_len + self.r_len) / total {
                self.td - self.r_len * v.ln()
            } else {
                -self.sd + self.p_len * v.ln()
            };

            let log_env = if x > self.td {
                -self.eta - self.zeta * (x - self.t)
            } else if x < -self.sd {
                -self.theta + self.xi * (x + self.s)
            } else {
                0.0
            };

            let log_target = log_h(x, self.alpha, self.lambda);
            if log_target.is_finite() && w.ln() + log_env <= log_target {
                return x;
            }
        }
    }
}

/// log h(x) of the Devroye envelope, h(x) = exp(-α(cosh x - 1) - λ(eˣ - x - 1)).
fn log_h(x: f64, alpha: f64, lambda: f64) -> f64 {
    let mut out = -alpha * (x.cosh() - 1.0);
    if lambda > 0.0 {
        out -= lambda * (x.exp_m1() - x);
    }
    out
}

fn dlog_h(x: f64, alpha: f64, lambda: f64) -> f64 {
    let mut out = -alpha * x.sinh();
    if lambda > 0.0 {
        out -= lambda * x.exp_m1();
    }
    out
}

impl Distribution<f64> for Gig {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.form {
            Form::Devroye(env) => {
                let mut log_x = env.sample_log(rng) + env.log_shift;
                if env.swap {
                    log_x = -log_x;
                }
                (log_x + env.log_scale).exp()
            }
            Form::Gamma { shape, scale } => gamma_draw(shape, scale, rng),
            Form::InverseGamma { shape, scale } => 1.0 / gamma_draw(shape, scale, rng),
        }
    }
}

fn gamma_draw<R: Rng + ?Sized>(shape: f64, scale: f64, rng: &mut R) -> f64 {
    // Parameters were validated in `Gig::new`, so construction cannot fail here.
    match Gamma::new(shape, scale) {
        Ok(g) => g.sample(rng),
        Err(_) => f64::NAN,
    }
}
