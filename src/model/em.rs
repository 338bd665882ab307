// CellAssign-style negative binomial mixture fit by expectation-maximization.
//
// Counts follow y[n,g] ~ NB(s[n] * exp(β[g] + ρ[g,c] * δ[g,c]), r) when cell n
// has type c, where s is the size factor, ρ the binary marker matrix, and
// δ[g,c] >= min_delta the log fold change of marker g in type c.

use indicatif::{ProgressBar, ProgressStyle};
use libm::lgamma;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::time::Instant;

use super::math::{
    logsumexp, negbin_log_mean_derivs, negbin_logpmf_const, negbin_logpmf_part, randn, relerr,
};
use super::{InferenceBackend, PredictionResult};
use crate::error::{CellAssignError, Result};
use crate::markers::{MarkerMatrix, MarkerSubsettedView};

// Floor for size factors of empty cells, which would otherwise have ln(0).
const MIN_SIZE_FACTOR: f64 = 1e-8;

// Largest change to β or δ in one Newton step.
const MAX_NEWTON_STEP: f64 = 1.0;

/// Initialization of the per-gene baseline β.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackgroundInit {
    Zero,
    Random,
}

#[derive(Clone, Debug)]
pub struct EmParams {
    pub max_iter: usize,

    // stop when the relative change in log-likelihood falls below this
    pub tolerance: f64,

    // NB inverse dispersion
    pub r: f64,

    pub min_delta: f64,
    pub max_delta: f64,

    // Newton steps per M-step
    pub newton_steps: usize,

    // pseudocount on mixture weights
    pub π_pseudocount: f64,

    pub background_init: BackgroundInit,
    pub show_progress: bool,
}

impl Default for EmParams {
    fn default() -> Self {
        EmParams {
            max_iter: 400,
            tolerance: 1e-6,
            r: 10.0,
            min_delta: 2.0,
            max_delta: 10.0,
            newton_steps: 3,
            π_pseudocount: 1e-2,
            background_init: BackgroundInit::Zero,
            show_progress: true,
        }
    }
}

pub struct FittedModel {
    pub genes: Vec<String>,
    pub cell_types: Vec<String>,

    // [ngenes, ncelltypes]
    pub ρ: Array2<f64>,

    // [ngenes]
    pub β: Array1<f64>,

    // [ngenes, ncelltypes], zero where ρ is zero
    pub δ: Array2<f64>,

    // [ncelltypes]
    pub π: Array1<f64>,

    pub log_likelihood: f64,
    pub niter: usize,
    pub converged: bool,
}

pub struct CellAssignEm {
    pub params: EmParams,
}

// Per-fit constants derived from the data.
struct Observations<'a> {
    counts: &'a Array2<u32>,

    // [ncells]
    ln_s: Array1<f64>,

    // sum of count-only NB terms over all entries
    loglik_const: f64,
}

impl CellAssignEm {
    pub fn new(params: EmParams) -> CellAssignEm {
        CellAssignEm { params }
    }

    fn observations<'a>(&self, data: &'a MarkerSubsettedView) -> Result<Observations<'a>> {
        let size_factor = data.size_factor()?;
        if size_factor.len() != data.ncells() {
            return Err(CellAssignError::Inference(format!(
                "{} size factors for {} cells",
                size_factor.len(),
                data.ncells()
            )));
        }

        let ln_s = size_factor.map(|&s| (s as f64).max(MIN_SIZE_FACTOR).ln());
        let lgamma_r = lgamma(self.params.r);
        let loglik_const = data
            .counts
            .iter()
            .map(|&k| negbin_logpmf_const(self.params.r, lgamma_r, k))
            .sum();

        Ok(Observations {
            counts: &data.counts,
            ln_s,
            loglik_const,
        })
    }

    fn initialize(&self, markers: &MarkerMatrix, seed: u64) -> FittedModel {
        let mut rng = StdRng::seed_from_u64(seed);
        let ngenes = markers.ngenes();
        let ncelltypes = markers.ncelltypes();

        let β = match self.params.background_init {
            BackgroundInit::Zero => Array1::zeros(ngenes),
            BackgroundInit::Random => Array1::from_shape_fn(ngenes, |_| randn(&mut rng)),
        };

        let ρ = markers.ρ.map(|&x| x as f64);
        let min_δ = self.params.min_delta;
        let δ = ρ.map(|&ρ_gc| {
            let u: f64 = rng.random();
            ρ_gc * min_δ * u.exp()
        });

        FittedModel {
            genes: markers.genes.clone(),
            cell_types: markers.cell_types.clone(),
            ρ,
            β,
            δ,
            π: Array1::from_elem(ncelltypes, 1.0 / ncelltypes as f64),
            log_likelihood: f64::NEG_INFINITY,
            niter: 0,
            converged: false,
        }
    }

    // Compute responsibilities γ[n,c] under the current parameters, returning
    // the data log-likelihood.
    fn expectation(&self, model: &FittedModel, obs: &Observations, γ: &mut Array2<f64>) -> f64 {
        let r = self.params.r;
        let r_ln_r = r * r.ln();
        let ln_π = model.π.map(|π_c| π_c.ln());

        let mut cell_loglik = Array1::<f64>::zeros(γ.nrows());
        Zip::from(γ.rows_mut())
            .and(obs.counts.rows())
            .and(&obs.ln_s)
            .and(&mut cell_loglik)
            .par_for_each(|mut γ_n, y_n, &ln_s_n, loglik_n| {
                let mut lp = ln_π.to_vec();
                for (c, lp_c) in lp.iter_mut().enumerate() {
                    for (g, &k) in y_n.iter().enumerate() {
                        let ln_μ = ln_s_n + model.β[g] + model.ρ[[g, c]] * model.δ[[g, c]];
                        *lp_c += negbin_logpmf_part(r, r_ln_r, ln_μ, k);
                    }
                }

                let lse = logsumexp(&lp);
                for (γ_nc, lp_c) in γ_n.iter_mut().zip(&lp) {
                    *γ_nc = (lp_c - lse).exp();
                }
                *loglik_n = lse;
            });

        cell_loglik.iter().sum::<f64>() + obs.loglik_const
    }

    fn maximization(&self, model: &mut FittedModel, obs: &Observations, γ: &Array2<f64>) {
        let ncells = γ.nrows() as f64;
        let ncelltypes = model.cell_types.len() as f64;
        let pseudocount = self.params.π_pseudocount;
        let total = ncells + ncelltypes * pseudocount;
        Zip::from(&mut model.π)
            .and(&γ.sum_axis(Axis(0)))
            .for_each(|π_c, &n_c| *π_c = (n_c + pseudocount) / total);

        let updates: Vec<(f64, Array1<f64>)> = (0..model.genes.len())
            .into_par_iter()
            .map(|g| {
                self.update_gene(
                    model.β[g],
                    model.δ.row(g),
                    model.ρ.row(g),
                    obs.counts.column(g),
                    &obs.ln_s,
                    γ,
                )
            })
            .collect();

        for (g, (β_g, δ_g)) in updates.into_iter().enumerate() {
            model.β[g] = β_g;
            model.δ.row_mut(g).assign(&δ_g);
        }
    }

    // Damped Newton steps on β[g] and δ[g,:] given fixed responsibilities.
    fn update_gene(
        &self,
        mut β_g: f64,
        δ_g: ArrayView1<f64>,
        ρ_g: ArrayView1<f64>,
        y_g: ArrayView1<u32>,
        ln_s: &Array1<f64>,
        γ: &Array2<f64>,
    ) -> (f64, Array1<f64>) {
        let r = self.params.r;
        let mut δ_g = δ_g.to_owned();
        let ncelltypes = δ_g.len();
        let mut grad_δ = vec![0.0; ncelltypes];
        let mut hess_δ = vec![0.0; ncelltypes];

        for _ in 0..self.params.newton_steps {
            let mut grad_β = 0.0;
            let mut hess_β = 0.0;
            grad_δ.fill(0.0);
            hess_δ.fill(0.0);

            for ((&k, &ln_s_n), γ_n) in y_g.iter().zip(ln_s).zip(γ.rows()) {
                for c in 0..ncelltypes {
                    let μ = (ln_s_n + β_g + ρ_g[c] * δ_g[c]).exp();
                    let (grad, neg_hess) = negbin_log_mean_derivs(r, μ, k);
                    let γ_nc = γ_n[c];
                    grad_β += γ_nc * grad;
                    hess_β += γ_nc * neg_hess;
                    if ρ_g[c] > 0.0 {
                        grad_δ[c] += γ_nc * grad;
                        hess_δ[c] += γ_nc * neg_hess;
                    }
                }
            }

            β_g += newton_step(grad_β, hess_β);
            for c in 0..ncelltypes {
                if ρ_g[c] > 0.0 {
                    δ_g[c] = (δ_g[c] + newton_step(grad_δ[c], hess_δ[c]))
                        .clamp(self.params.min_delta, self.params.max_delta);
                }
            }
        }

        (β_g, δ_g)
    }
}

fn newton_step(grad: f64, neg_hess: f64) -> f64 {
    if neg_hess <= f64::EPSILON {
        return 0.0;
    }
    (grad / neg_hess).clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP)
}

fn check_genes(model: &FittedModel, data: &MarkerSubsettedView) -> Result<()> {
    if model.genes != data.genes {
        return Err(CellAssignError::Inference(format!(
            "model was fit on {} genes but data has {} genes",
            model.genes.len(),
            data.genes.len()
        )));
    }
    Ok(())
}

impl InferenceBackend for CellAssignEm {
    type Model = FittedModel;

    fn train(
        &self,
        data: &MarkerSubsettedView,
        markers: &MarkerMatrix,
        seed: u64,
    ) -> Result<FittedModel> {
        if markers.genes != data.genes {
            return Err(CellAssignError::Inference(format!(
                "marker matrix has {} genes but expression view has {}",
                markers.ngenes(),
                data.ngenes()
            )));
        }
        if data.ncells() == 0 {
            return Err(CellAssignError::Inference("no cells to fit".to_string()));
        }

        let obs = self.observations(data)?;
        let mut model = self.initialize(markers, seed);
        let mut γ = Array2::<f64>::zeros((data.ncells(), markers.ncelltypes()));

        let prog = if self.params.show_progress {
            ProgressBar::new(self.params.max_iter as u64)
        } else {
            ProgressBar::hidden()
        };
        prog.set_style(
            ProgressStyle::with_template("{prefix} {bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        prog.set_prefix("Fitting");

        let t0 = Instant::now();
        for iter in 0..self.params.max_iter {
            let loglik = self.expectation(&model, &obs, &mut γ);
            if !loglik.is_finite() {
                prog.abandon();
                return Err(CellAssignError::Inference(format!(
                    "log-likelihood became {} at iteration {}",
                    loglik, iter
                )));
            }

            let previous = model.log_likelihood;
            model.log_likelihood = loglik;
            model.niter = iter + 1;
            prog.set_message(format!("log-likelihood: {:.3}", loglik));
            prog.inc(1);
            debug!("iteration {}: log-likelihood {}", iter, loglik);

            if previous.is_finite() && relerr(previous, loglik) < self.params.tolerance {
                model.converged = true;
                break;
            }

            self.maximization(&mut model, &obs, &γ);
        }
        prog.finish_and_clear();

        if model.converged {
            info!(
                "Converged after {} iterations in {:?} (log-likelihood {:.3})",
                model.niter,
                t0.elapsed(),
                model.log_likelihood
            );
        } else {
            warn!(
                "Did not converge within {} iterations (log-likelihood {:.3})",
                self.params.max_iter, model.log_likelihood
            );
        }

        Ok(model)
    }

    fn predict(&self, model: &FittedModel, data: &MarkerSubsettedView) -> Result<PredictionResult> {
        check_genes(model, data)?;
        let obs = self.observations(data)?;
        let mut γ = Array2::<f64>::zeros((data.ncells(), model.cell_types.len()));
        let loglik = self.expectation(model, &obs, &mut γ);
        if !loglik.is_finite() {
            return Err(CellAssignError::Inference(format!(
                "log-likelihood is {} under the fitted model",
                loglik
            )));
        }

        Ok(PredictionResult {
            cell_ids: data.cell_ids().to_vec(),
            cell_types: model.cell_types.clone(),
            probabilities: γ.map(|&p| p as f32),
        })
    }
}
