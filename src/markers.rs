// Marker panels, the binary gene x cell type marker matrix, and restriction of
// an expression matrix to the marker genes it actually measures.

use itertools::Itertools;
use log::{info, warn};
use ndarray::{Array1, Array2, Axis};
use std::collections::{HashMap, HashSet};

use crate::error::{CellAssignError, Result};
use crate::expression::ExpressionObject;

/// Cell type names mapped to their marker genes, in declaration order.
#[derive(Clone, Debug)]
pub struct MarkerPanel {
    entries: Vec<(String, Vec<String>)>,
}

impl MarkerPanel {
    /// Rejects an empty panel, a cell type without markers, and repeated cell
    /// type names.
    pub fn new(entries: Vec<(String, Vec<String>)>) -> Result<MarkerPanel> {
        if entries.is_empty() {
            return Err(CellAssignError::Configuration(
                "marker panel contains no cell types".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (cell_type, genes) in &entries {
            if !seen.insert(cell_type.as_str()) {
                return Err(CellAssignError::Configuration(format!(
                    "cell type '{}' is declared more than once in the marker panel",
                    cell_type
                )));
            }
            if genes.is_empty() {
                return Err(CellAssignError::Configuration(format!(
                    "cell type '{}' has an empty marker gene list",
                    cell_type
                )));
            }
        }

        Ok(MarkerPanel { entries })
    }

    pub fn cell_types(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(cell_type, _)| cell_type.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(cell_type, genes)| (cell_type.as_str(), genes.as_slice()))
    }
}

/// Binary gene x cell type indicator matrix. Rows are sorted gene names,
/// columns follow the panel's declaration order.
#[derive(Clone, Debug)]
pub struct MarkerMatrix {
    pub genes: Vec<String>,
    pub cell_types: Vec<String>,

    // [ngenes, ncelltypes]
    pub ρ: Array2<f32>,
}

impl MarkerMatrix {
    pub fn from_panel(panel: &MarkerPanel) -> MarkerMatrix {
        let genes: Vec<String> = panel
            .iter()
            .flat_map(|(_, genes)| genes.iter().cloned())
            .sorted()
            .dedup()
            .collect();

        let gene_index: HashMap<&str, usize> = genes
            .iter()
            .enumerate()
            .map(|(i, gene)| (gene.as_str(), i))
            .collect();

        let cell_types: Vec<String> = panel.cell_types().map(|c| c.to_string()).collect();
        let mut ρ = Array2::<f32>::zeros((genes.len(), cell_types.len()));
        for (j, (_, markers)) in panel.iter().enumerate() {
            for gene in markers {
                ρ[[gene_index[gene.as_str()], j]] = 1.0;
            }
        }

        MarkerMatrix {
            genes,
            cell_types,
            ρ,
        }
    }

    pub fn ngenes(&self) -> usize {
        self.genes.len()
    }

    pub fn ncelltypes(&self) -> usize {
        self.cell_types.len()
    }

    #[cfg(test)]
    pub fn is_marker(&self, gene: &str, cell_type: &str) -> Option<bool> {
        let i = self.genes.binary_search_by(|g| g.as_str().cmp(gene)).ok()?;
        let j = self.cell_types.iter().position(|c| c == cell_type)?;
        Some(self.ρ[[i, j]] > 0.0)
    }

    // Restrict to the given rows. Columns are never dropped.
    fn select_rows(&self, rows: &[usize]) -> MarkerMatrix {
        MarkerMatrix {
            genes: rows.iter().map(|&i| self.genes[i].clone()).collect(),
            cell_types: self.cell_types.clone(),
            ρ: self.ρ.select(Axis(0), rows),
        }
    }

    /// Names of cell types with no marker among the current rows.
    pub fn empty_cell_types(&self) -> Vec<&str> {
        self.ρ
            .sum_axis(Axis(0))
            .iter()
            .zip(&self.cell_types)
            .filter(|(&total, _)| total == 0.0)
            .map(|(_, cell_type)| cell_type.as_str())
            .collect()
    }
}

/// An expression object restricted to the marker genes it measures.
pub struct MarkerSubsettedView<'a> {
    pub expression: &'a ExpressionObject,

    // sorted ascending
    pub genes: Vec<String>,

    // [ncells, ngenes]
    pub counts: Array2<u32>,
}

impl MarkerSubsettedView<'_> {
    pub fn ncells(&self) -> usize {
        self.counts.nrows()
    }

    pub fn ngenes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.expression.cell_ids
    }

    pub fn size_factor(&self) -> Result<&Array1<f32>> {
        self.expression.size_factor()
    }
}

/// Intersect marker genes with expressed genes, returning the expression
/// view and the matching reduced marker matrix.
pub fn subset_to_markers<'a>(
    markers: &MarkerMatrix,
    expression: &'a ExpressionObject,
) -> Result<(MarkerSubsettedView<'a>, MarkerMatrix)> {
    let gene_columns: HashMap<&str, usize> = expression
        .gene_names
        .iter()
        .enumerate()
        .map(|(j, gene)| (gene.as_str(), j))
        .collect();

    // marker genes are already sorted, so the intersection inherits that order
    let (rows, columns): (Vec<usize>, Vec<usize>) = markers
        .genes
        .iter()
        .enumerate()
        .filter_map(|(i, gene)| gene_columns.get(gene.as_str()).map(|&j| (i, j)))
        .unzip();

    if rows.is_empty() {
        return Err(CellAssignError::data(
            "marker subsetting",
            format!(
                "none of the {} marker genes occur among the {} expressed genes",
                markers.ngenes(),
                expression.ngenes()
            ),
        ));
    }

    let counts = expression.counts.select(Axis(1), &columns);
    let reduced = markers.select_rows(&rows);

    info!(
        "Using {} of {} marker genes across {} cell types",
        reduced.ngenes(),
        markers.ngenes(),
        reduced.ncelltypes()
    );

    let missing = markers
        .genes
        .iter()
        .filter(|gene| !gene_columns.contains_key(gene.as_str()))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        info!("Marker genes absent from expression data: {:?}", missing);
    }

    for cell_type in reduced.empty_cell_types() {
        warn!(
            "No marker genes for cell type '{}' are present in the expression data",
            cell_type
        );
    }

    Ok((
        MarkerSubsettedView {
            expression,
            genes: reduced.genes.clone(),
            counts,
        },
        reduced,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::test_expression;

    fn panel(entries: &[(&str, &[&str])]) -> MarkerPanel {
        MarkerPanel::new(
            entries
                .iter()
                .map(|(c, genes)| (c.to_string(), genes.iter().map(|g| g.to_string()).collect()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_marker_matrix_rows_and_columns() {
        let panel = panel(&[
            ("Tcell", &["CD3E", "CD3D", "PTPRC"]),
            ("Bcell", &["CD19", "PTPRC"]),
            ("Fibroblast", &["COL1A1"]),
        ]);
        let markers = MarkerMatrix::from_panel(&panel);

        assert_eq!(
            markers.genes,
            vec!["CD19", "CD3D", "CD3E", "COL1A1", "PTPRC"]
        );
        assert_eq!(markers.cell_types, vec!["Tcell", "Bcell", "Fibroblast"]);
        assert_eq!(markers.ρ.dim(), (5, 3));

        for (cell_type, genes) in panel.iter() {
            for gene in &markers.genes {
                let expected = genes.contains(gene);
                assert_eq!(markers.is_marker(gene, cell_type), Some(expected));
            }
        }
        assert_eq!(markers.ρ.sum(), 6.0);
    }

    #[test]
    fn test_duplicate_marker_within_type() {
        let markers = MarkerMatrix::from_panel(&panel(&[("Tcell", &["CD3E", "CD3E"])]));
        assert_eq!(markers.genes, vec!["CD3E"]);
        assert_eq!(markers.ρ[[0, 0]], 1.0);
    }

    #[test]
    fn test_invalid_panels() {
        assert!(matches!(
            MarkerPanel::new(Vec::new()),
            Err(CellAssignError::Configuration(_))
        ));
        assert!(matches!(
            MarkerPanel::new(vec![("Tcell".to_string(), Vec::new())]),
            Err(CellAssignError::Configuration(_))
        ));
        assert!(matches!(
            MarkerPanel::new(vec![
                ("Tcell".to_string(), vec!["CD3E".to_string()]),
                ("Tcell".to_string(), vec!["CD3D".to_string()]),
            ]),
            Err(CellAssignError::Configuration(_))
        ));
    }

    #[test]
    fn test_subset_to_markers() {
        let markers =
            MarkerMatrix::from_panel(&panel(&[("Tcell", &["CD3"]), ("Bcell", &["CD19"])]));
        let expression = test_expression(&["CD3", "CD19", "ACTB"], &[[5, 0, 2], [0, 7, 1]]);

        let (view, reduced) = subset_to_markers(&markers, &expression).unwrap();
        assert_eq!(view.genes, vec!["CD19", "CD3"]);
        assert_eq!(reduced.genes, view.genes);
        assert_eq!(view.counts, ndarray::arr2(&[[0, 5], [7, 0]]));
        assert_eq!(reduced.ρ, ndarray::arr2(&[[0.0, 1.0], [1.0, 0.0]]));
        assert_eq!(view.ncells(), 2);
    }

    #[test]
    fn test_subset_keeps_cell_types_without_markers() {
        let markers = MarkerMatrix::from_panel(&panel(&[
            ("Tcell", &["CD3"]),
            ("Neuron", &["RBFOX3"]),
        ]));
        let expression = test_expression(&["ACTB", "CD3"], &[[1, 4]]);

        let (view, reduced) = subset_to_markers(&markers, &expression).unwrap();
        assert_eq!(view.genes, vec!["CD3"]);
        assert_eq!(reduced.cell_types, vec!["Tcell", "Neuron"]);
        assert_eq!(reduced.empty_cell_types(), vec!["Neuron"]);

        for gene in &view.genes {
            assert!(markers.genes.contains(gene));
            assert!(expression.gene_names.contains(gene));
        }
        assert!(view.genes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_subset_empty_intersection() {
        let markers = MarkerMatrix::from_panel(&panel(&[("Tcell", &["CD3"])]));
        let expression = test_expression(&["ACTB", "GAPDH"], &[[1, 4]]);

        assert!(matches!(
            subset_to_markers(&markers, &expression),
            Err(CellAssignError::Data { .. })
        ));
    }
}
