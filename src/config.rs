// Run configuration, read from a JSON file.

use json::JsonValue;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use crate::error::{CellAssignError, Result};
use crate::expression::AlignmentPolicy;
use crate::markers::MarkerPanel;
use crate::model::{BackgroundInit, EmParams};
use crate::schemas::OutputFormat;

pub const DEFAULT_SEED: u64 = 42;

pub struct Config {
    pub panel: MarkerPanel,
    pub bin_assign_dir: PathBuf,
    pub cell_lookup_dir: PathBuf,
    pub results_dir: PathBuf,

    pub seed: u64,
    pub random_b_g_0: bool,
    pub alignment: AlignmentPolicy,
    pub output_format: OutputFormat,
    pub em: EmParams,
}

fn invalid(key: &str, expected: &str) -> CellAssignError {
    CellAssignError::Configuration(format!("'{}' must be {}", key, expected))
}

/// Iteration cap from the config file or the command line. Zero is rejected.
pub fn checked_max_iter(max_iter: usize) -> Result<usize> {
    if max_iter == 0 {
        return Err(invalid("max_iter", "a positive integer"));
    }
    Ok(max_iter)
}

fn required_path(value: &JsonValue, key: &str) -> Result<PathBuf> {
    value[key]
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| invalid(key, "a path string"))
}

fn optional<T>(
    value: &JsonValue,
    key: &str,
    expected: &str,
    get: impl Fn(&JsonValue) -> Option<T>,
) -> Result<Option<T>> {
    let field = &value[key];
    if field.is_null() {
        Ok(None)
    } else {
        get(field).map(Some).ok_or_else(|| invalid(key, expected))
    }
}

fn parse_panel(value: &JsonValue) -> Result<MarkerPanel> {
    if !value.is_object() {
        return Err(invalid("cell_markers", "an object of cell type to gene list"));
    }

    let mut entries = Vec::new();
    for (cell_type, genes) in value.entries() {
        if !genes.is_array() {
            return Err(invalid(
                &format!("cell_markers.{}", cell_type),
                "a list of gene names",
            ));
        }
        let genes = genes
            .members()
            .map(|gene| gene.as_str().map(|g| g.to_string()))
            .collect::<Option<Vec<String>>>()
            .ok_or_else(|| invalid(&format!("cell_markers.{}", cell_type), "a list of strings"))?;
        entries.push((cell_type.to_string(), genes));
    }

    MarkerPanel::new(entries)
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = read_to_string(path).map_err(|err| {
            CellAssignError::Configuration(format!("unable to read '{}': {}", path.display(), err))
        })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let value = json::parse(text)?;
        if !value.is_object() {
            return Err(CellAssignError::Configuration(
                "configuration must be a JSON object".to_string(),
            ));
        }

        let panel = parse_panel(&value["cell_markers"])?;

        let seed = optional(&value, "seed", "a non-negative integer", |v| v.as_u64())?
            .unwrap_or(DEFAULT_SEED);
        let random_b_g_0 =
            optional(&value, "random_b_g_0", "a boolean", |v| v.as_bool())?.unwrap_or(false);
        let alignment = optional(&value, "alignment", "\"positional\" or \"keyed\"", |v| {
            v.as_str().and_then(AlignmentPolicy::parse)
        })?
        .unwrap_or(AlignmentPolicy::Positional);
        let output_format = optional(
            &value,
            "output_format",
            "\"csv\", \"csv.gz\" or \"parquet\"",
            |v| match v.as_str() {
                Some("csv") => Some(OutputFormat::Csv),
                Some("csv.gz") => Some(OutputFormat::CsvGz),
                Some("parquet") => Some(OutputFormat::Parquet),
                _ => None,
            },
        )?
        .unwrap_or(OutputFormat::Infer);

        let mut em = EmParams::default();
        if let Some(max_iter) =
            optional(&value, "max_iter", "a positive integer", |v| v.as_usize())?
        {
            em.max_iter = checked_max_iter(max_iter)?;
        }
        if let Some(tolerance) = optional(&value, "tolerance", "a positive number", |v| {
            v.as_f64().filter(|&x| x > 0.0)
        })? {
            em.tolerance = tolerance;
        }
        if let Some(r) = optional(&value, "inverse_dispersion", "a positive number", |v| {
            v.as_f64().filter(|&x| x > 0.0)
        })? {
            em.r = r;
        }
        if let Some(min_delta) = optional(&value, "min_delta", "a non-negative number", |v| {
            v.as_f64().filter(|&x| x >= 0.0)
        })? {
            em.min_delta = min_delta;
            em.max_delta = em.max_delta.max(min_delta);
        }
        em.background_init = if random_b_g_0 {
            BackgroundInit::Random
        } else {
            BackgroundInit::Zero
        };

        Ok(Config {
            panel,
            bin_assign_dir: required_path(&value, "bin_assign_dir")?,
            cell_lookup_dir: required_path(&value, "cell_ix_lookup_dir")?,
            results_dir: required_path(&value, "cellannotation_results_dir")?,
            seed,
            random_b_g_0,
            alignment,
            output_format,
            em,
        })
    }
}
