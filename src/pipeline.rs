// One pass over a tissue sample: build markers, assemble counts, normalize,
// subset, infer, and project.

use log::info;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::Config;
use crate::error::Result;
use crate::expression::{read_expression_chunks, ExpressionObject};
use crate::markers::{subset_to_markers, MarkerMatrix, MarkerPanel};
use crate::model::{InferenceBackend, PredictionResult};
use crate::normalize::compute_size_factors;
use crate::results::{project_results, write_probabilities, AnnotatedResult};

pub const DEFAULT_OUTPUT_FILENAME: &str = "merged_results.csv";

/// Label every cell of an assembled expression object.
pub fn annotate<B: InferenceBackend>(
    expression: &mut ExpressionObject,
    panel: &MarkerPanel,
    backend: &B,
    seed: u64,
) -> Result<(PredictionResult, AnnotatedResult)> {
    let markers = MarkerMatrix::from_panel(panel);
    info!(
        "Marker matrix: {} genes x {} cell types",
        markers.ngenes(),
        markers.ncelltypes()
    );

    compute_size_factors(expression)?;
    let expression = &*expression;
    let (view, reduced) = subset_to_markers(&markers, expression)?;

    let t0 = Instant::now();
    let model = backend.train(&view, &reduced, seed)?;
    let prediction = backend.predict(&model, &view)?;
    info!("Inference finished in {:?}", t0.elapsed());

    let result = project_results(&prediction, expression)?;
    Ok((prediction, result))
}

/// Run the whole pipeline described by `config`, returning the path of the
/// results table.
pub fn run_pipeline<B: InferenceBackend>(
    config: &Config,
    backend: &B,
    output_filename: &str,
    output_probabilities: Option<&Path>,
) -> Result<PathBuf> {
    let mut expression = read_expression_chunks(
        &config.bin_assign_dir,
        &config.cell_lookup_dir,
        config.alignment,
    )?;

    let (prediction, result) = annotate(&mut expression, &config.panel, backend, config.seed)?;

    let path = config.results_dir.join(output_filename);
    result.write(&path, config.output_format)?;
    info!("Wrote {} annotated cells", result.len());

    if let Some(output_probabilities) = output_probabilities {
        write_probabilities(&prediction, output_probabilities, config.output_format)?;
        info!(
            "Wrote cell type probabilities to {}",
            output_probabilities.display()
        );
    }

    Ok(path)
}
