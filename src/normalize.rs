// Library-size normalization.

use log::{info, warn};
use ndarray::{Array1, Axis};

use crate::error::{CellAssignError, Result};
use crate::expression::ExpressionObject;

/// Compute per-cell library sizes over every gene (not only markers) and
/// size factors `lib_size / mean(lib_size)`, storing both on the object.
pub fn compute_size_factors(expression: &mut ExpressionObject) -> Result<()> {
    let lib_size: Array1<u64> = expression
        .counts
        .map(|&count| count as u64)
        .sum_axis(Axis(1));

    let ncells = lib_size.len();
    if ncells == 0 {
        return Err(CellAssignError::numeric(
            "size factor normalization",
            "expression matrix has no cells",
        ));
    }

    let mean = lib_size.iter().map(|&l| l as f64).sum::<f64>() / ncells as f64;
    if mean == 0.0 {
        return Err(CellAssignError::numeric(
            "size factor normalization",
            format!(
                "mean library size is zero across {} cells x {} genes",
                ncells,
                expression.ngenes()
            ),
        ));
    }

    let nempty = lib_size.iter().filter(|&&l| l == 0).count();
    if nempty > 0 {
        warn!("{} cells have no counts and a size factor of zero", nempty);
    }

    let size_factor = lib_size.map(|&l| (l as f64 / mean) as f32);
    info!("Mean library size: {:.2}", mean);

    expression.lib_size = Some(lib_size);
    expression.size_factor = Some(size_factor);
    Ok(())
}
