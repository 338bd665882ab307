// Turning per-cell probabilities into labels and attaching the cell metadata
// carried on the expression object.

use arrow::array::{
    ArrayRef, Float32Array, LargeStringArray, RecordBatch, StringArray, UInt32Array, UInt64Array,
};
use ndarray::{Array1, Array2, ArrayView1};
use std::path::Path;
use std::sync::Arc;

use crate::error::{CellAssignError, Result};
use crate::expression::ExpressionObject;
use crate::model::PredictionResult;
use crate::output::{determine_format, write_table};
use crate::schemas::{annotated_result_schema, probabilities_schema, OutputFormat};

pub struct AnnotatedResult {
    pub cell_ids: Vec<String>,
    pub cell_types: Vec<String>,

    // [ncells, 2]
    pub spatial: Array2<f32>,

    // [ncells, 3]
    pub stats: Array2<u32>,

    pub chunk_names: Vec<String>,
    pub size_factor: Array1<f32>,
    pub lib_size: Array1<u64>,
}

/// Index of the largest score, preferring the earliest on ties. NaN scores are
/// never selected.
pub fn argmax(scores: ArrayView1<f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

/// Label every cell with its highest-scoring cell type and attach its
/// spatial, statistics, chunk, and normalization columns.
pub fn project_results(
    prediction: &PredictionResult,
    expression: &ExpressionObject,
) -> Result<AnnotatedResult> {
    if prediction.cell_ids != expression.cell_ids {
        return Err(CellAssignError::Inference(format!(
            "prediction covers {} cells that do not match the {} assembled cells",
            prediction.cell_ids.len(),
            expression.ncells()
        )));
    }
    if prediction.probabilities.dim() != (prediction.cell_ids.len(), prediction.cell_types.len())
    {
        return Err(CellAssignError::Inference(format!(
            "probability table is {:?}, expected {} cells x {} cell types",
            prediction.probabilities.dim(),
            prediction.cell_ids.len(),
            prediction.cell_types.len()
        )));
    }

    let cell_types = prediction
        .probabilities
        .rows()
        .into_iter()
        .zip(&prediction.cell_ids)
        .map(|(row, id)| {
            argmax(row)
                .map(|c| prediction.cell_types[c].clone())
                .ok_or_else(|| {
                    CellAssignError::Inference(format!("no valid probability for cell '{}'", id))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(AnnotatedResult {
        cell_ids: expression.cell_ids.clone(),
        cell_types,
        spatial: expression.spatial.clone(),
        stats: expression.stats.clone(),
        chunk_names: expression.chunk_names.clone(),
        size_factor: expression.size_factor()?.clone(),
        lib_size: expression.lib_size()?.clone(),
    })
}

fn string_column(values: &[String], fmt: OutputFormat) -> ArrayRef {
    match fmt {
        OutputFormat::Parquet => Arc::new(LargeStringArray::from_iter_values(values)),
        _ => Arc::new(StringArray::from_iter_values(values)),
    }
}

impl AnnotatedResult {
    pub fn len(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn to_record_batch(&self, fmt: OutputFormat) -> Result<RecordBatch> {
        let columns: Vec<ArrayRef> = vec![
            string_column(&self.cell_ids, fmt),
            string_column(&self.cell_types, fmt),
            Arc::new(Float32Array::from_iter_values(self.spatial.column(0).iter().cloned())),
            Arc::new(Float32Array::from_iter_values(self.spatial.column(1).iter().cloned())),
            Arc::new(UInt32Array::from_iter_values(self.stats.column(0).iter().cloned())),
            Arc::new(UInt32Array::from_iter_values(self.stats.column(1).iter().cloned())),
            Arc::new(UInt32Array::from_iter_values(self.stats.column(2).iter().cloned())),
            string_column(&self.chunk_names, fmt),
            Arc::new(Float32Array::from_iter_values(self.size_factor.iter().cloned())),
            Arc::new(UInt64Array::from_iter_values(self.lib_size.iter().cloned())),
        ];

        Ok(RecordBatch::try_new(
            Arc::new(annotated_result_schema(fmt)),
            columns,
        )?)
    }

    pub fn write(&self, filename: &Path, fmt: OutputFormat) -> Result<()> {
        let fmt = determine_format(filename, fmt)?;
        write_table(filename, fmt, &self.to_record_batch(fmt)?)
    }
}

pub fn write_probabilities(
    prediction: &PredictionResult,
    filename: &Path,
    fmt: OutputFormat,
) -> Result<()> {
    let fmt = determine_format(filename, fmt)?;

    let mut columns: Vec<ArrayRef> = vec![string_column(&prediction.cell_ids, fmt)];
    for column in prediction.probabilities.columns() {
        columns.push(Arc::new(Float32Array::from_iter_values(
            column.iter().cloned(),
        )));
    }

    let batch = RecordBatch::try_new(
        Arc::new(probabilities_schema(&prediction.cell_types, fmt)),
        columns,
    )?;
    write_table(filename, fmt, &batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::test_expression;
    use crate::normalize::compute_size_factors;
    use ndarray::{arr1, arr2};

    fn prediction(probabilities: Array2<f32>) -> PredictionResult {
        PredictionResult {
            cell_ids: vec!["cell_0".to_string(), "cell_1".to_string()],
            cell_types: vec!["Tcell".to_string(), "Bcell".to_string()],
            probabilities,
        }
    }

    #[test]
    fn test_argmax_ties_and_nan() {
        assert_eq!(argmax(arr1(&[0.2, 0.5, 0.3]).view()), Some(1));
        assert_eq!(argmax(arr1(&[0.5, 0.5]).view()), Some(0));
        assert_eq!(argmax(arr1(&[0.25, 0.25, 0.5, 0.5]).view()), Some(2));
        assert_eq!(argmax(arr1(&[f32::NAN, 0.1]).view()), Some(1));
        assert_eq!(argmax(arr1(&[f32::NAN, f32::NAN]).view()), None);
    }

    #[test]
    fn test_project_results() {
        let mut expression = test_expression(&["CD3", "CD19", "ACTB"], &[[5, 0, 2], [0, 7, 1]]);
        compute_size_factors(&mut expression).unwrap();

        let result =
            project_results(&prediction(arr2(&[[0.9, 0.1], [0.5, 0.5]])), &expression).unwrap();

        assert_eq!(result.cell_types, vec!["Tcell", "Tcell"]);
        assert_eq!(result.cell_ids, expression.cell_ids);
        assert_eq!(result.spatial, expression.spatial);
        assert_eq!(result.stats, expression.stats);
        assert_eq!(result.lib_size.to_vec(), vec![7, 8]);

        let batch = result.to_record_batch(OutputFormat::Csv).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 10);
    }

    #[test]
    fn test_project_rejects_misaligned_prediction() {
        let mut expression = test_expression(&["CD3"], &[[5], [1], [2]]);
        compute_size_factors(&mut expression).unwrap();

        assert!(matches!(
            project_results(&prediction(arr2(&[[0.9, 0.1], [0.5, 0.5]])), &expression),
            Err(CellAssignError::Inference(_))
        ));
    }

    #[test]
    fn test_write_results_csv() {
        let mut expression = test_expression(&["CD3", "CD19"], &[[5, 0], [0, 7]]);
        compute_size_factors(&mut expression).unwrap();
        let prediction = prediction(arr2(&[[0.9, 0.1], [0.2, 0.8]]));
        let result = project_results(&prediction, &expression).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotation").join("merged_results.csv");
        result.write(&path, OutputFormat::Infer).unwrap();

        let mut rdr = ::csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = rdr.headers().unwrap().iter().map(|h| h.to_string()).collect();
        assert_eq!(
            headers,
            vec![
                "id",
                "cell_type",
                "cell_x",
                "cell_y",
                "num_shared_bins",
                "num_unique_bins",
                "num_transcripts",
                "chunk_name",
                "size_factor",
                "lib_size"
            ]
        );
        let rows: Vec<::csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "cell_0");
        assert_eq!(&rows[0][1], "Tcell");
        assert_eq!(&rows[1][1], "Bcell");
        assert_eq!(&rows[1][7], "chunk_0");
    }

    #[test]
    fn test_write_probabilities_parquet() {
        let prediction = prediction(arr2(&[[0.9, 0.1], [0.2, 0.8]]));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probabilities.parquet");
        write_probabilities(&prediction, &path, OutputFormat::Infer).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
