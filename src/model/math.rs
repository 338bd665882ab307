use libm::lgamma;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

pub fn relerr(a: f64, b: f64) -> f64 {
    ((a - b) / a).abs()
}

pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

// Terms of the negative binomial log-pmf that don't depend on the mean.
pub fn negbin_logpmf_const(r: f64, lgamma_r: f64, k: u32) -> f64 {
    if k == 0 {
        0.0
    } else {
        lgamma(r + k as f64) - lgamma_r - lgamma(k as f64 + 1.0)
    }
}

// Negative binomial log-pmf with mean μ (given as ln μ) and inverse dispersion
// r, omitting `negbin_logpmf_const`.
pub fn negbin_logpmf_part(r: f64, r_ln_r: f64, ln_μ: f64, k: u32) -> f64 {
    let ln_rpμ = (r.ln()).max(ln_μ) + (-(r.ln() - ln_μ).abs()).exp().ln_1p();
    if k == 0 {
        // handle common case in sparse data efficiently
        r_ln_r - r * ln_rpμ
    } else {
        let k = k as f64;
        k * ln_μ + r_ln_r - (k + r) * ln_rpμ
    }
}

// First and (negated) second derivative of the negative binomial log-pmf with
// respect to ln μ.
pub fn negbin_log_mean_derivs(r: f64, μ: f64, k: u32) -> (f64, f64) {
    let k = k as f64;
    let rpμ = r + μ;
    let grad = r * (k - μ) / rpμ;
    let neg_hess = r * μ * (r + k) / (rpμ * rpμ);
    (grad, neg_hess)
}

pub fn randn(rng: &mut StdRng) -> f64 {
    rng.sample::<f64, StandardNormal>(StandardNormal)
}
