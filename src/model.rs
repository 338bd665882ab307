// Cell type inference over marker-restricted expression.
//
// Backends implement `InferenceBackend`; the rest of the pipeline only sees
// `PredictionResult`s.

mod em;
pub mod math;

pub use em::{BackgroundInit, CellAssignEm, EmParams};

use ndarray::Array2;

use crate::error::Result;
use crate::markers::{MarkerMatrix, MarkerSubsettedView};

/// Per-cell scores over cell types, one row per cell in view order. Rows are
/// expected to be non-negative and sum to one, but that is up to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictionResult {
    pub cell_ids: Vec<String>,
    pub cell_types: Vec<String>,

    // [ncells, ncelltypes]
    pub probabilities: Array2<f32>,
}

pub trait InferenceBackend {
    type Model;

    /// Fit a model. All randomness must derive from `seed`.
    fn train(
        &self,
        data: &MarkerSubsettedView,
        markers: &MarkerMatrix,
        seed: u64,
    ) -> Result<Self::Model>;

    fn predict(&self, model: &Self::Model, data: &MarkerSubsettedView)
        -> Result<PredictionResult>;
}
