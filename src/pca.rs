// pca.rs

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Axis};
use std::io::Write;
use std::path::Path;

use crate::process::{FrequencyMatrix, MixError};
use crate::progress::{create_spinner, log, set_stage, LogLevel, ProcessingStage};

/// Components whose loading norm falls below this are left at zero.
const NORM_EPSILON: f64 = 1e-12;

/// Principal components of a set of population frequency vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct PcaResult {
    pub populations: Vec<String>,
    /// One row per population, one column per component (descending variance).
    pub components: Array2<f64>,
    /// Eigenvalues of the scaled Gram matrix, descending.
    pub eigenvalues: Vec<f64>,
    /// Percent of variance carried by the first (up to) three components.
    pub explained_variance: Vec<f64>,
}

/// Computes PCA over the frequency rows of `populations`.
///
/// Rows are centred on the per-marker mean, the population Gram matrix
/// `A·Aᵗ / (p − 1)` is eigendecomposed, and each population is projected onto
/// the unit-normalised marker loadings of every component.
pub fn compute_pca(matrix: &FrequencyMatrix, populations: &[String]) -> Result<PcaResult, MixError> {
    set_stage(ProcessingStage::PcaAnalysis);
    if populations.len() < 3 {
        return Err(MixError::InsufficientData(format!(
            "PCA needs at least 3 populations, {} given",
            populations.len()
        )));
    }

    let spinner = create_spinner("Computing PCA");

    let num_pops = populations.len();
    let num_markers = matrix.num_valid_markers();

    let mut freqs = Array2::<f64>::zeros((num_pops, num_markers));
    for (row, pop) in populations.iter().enumerate() {
        freqs.row_mut(row).assign(&matrix.row(pop)?);
    }

    let centers: Array1<f64> = freqs
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(num_markers));
    let centered = &freqs - &centers;

    let gram = centered.dot(&centered.t()) / (num_pops - 1) as f64;
    let gram = DMatrix::from_fn(num_pops, num_pops, |i, j| gram[[i, j]]);
    let eigen = SymmetricEigen::new(gram);

    let mut order: Vec<usize> = (0..num_pops).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let eigenvalues: Vec<f64> = order.iter().map(|&k| eigen.eigenvalues[k]).collect();
    let mut eigenvectors = Array2::<f64>::zeros((num_pops, num_pops));
    for (col, &k) in order.iter().enumerate() {
        for row in 0..num_pops {
            eigenvectors[[row, col]] = eigen.eigenvectors[(row, k)];
        }
    }

    // Marker loadings, one column per component.
    let mut loadings = centered.t().dot(&eigenvectors);
    for mut column in loadings.columns_mut() {
        let norm = column.dot(&column).sqrt();
        if norm > NORM_EPSILON {
            column /= norm;
        } else {
            column.fill(0.0);
        }
    }

    let components = centered.dot(&loadings);

    let total: f64 = eigenvalues.iter().sum();
    let explained_variance: Vec<f64> = eigenvalues
        .iter()
        .take(3)
        .map(|&e| if total != 0.0 { 100.0 * e / total } else { 0.0 })
        .collect();

    spinner.finish_and_clear();
    log(
        LogLevel::Info,
        &format!(
            "PCA of {} populations over {} markers, explained variance {:?}",
            num_pops, num_markers, explained_variance
        ),
    );

    Ok(PcaResult {
        populations: populations.to_vec(),
        components,
        eigenvalues,
        explained_variance,
    })
}

/// Writes the first six components per population, then the eigenvalues.
pub fn write_pca_results_to_file(result: &PcaResult, output_file: &Path) -> Result<(), MixError> {
    set_stage(ProcessingStage::Export);
    let file = std::fs::File::create(output_file)?;
    let mut writer = std::io::BufWriter::new(file);

    let col_width = crate::session::SCI_PRECISION + 7;
    let pops_width = result
        .populations
        .iter()
        .map(|p| p.len())
        .chain(std::iter::once("Populations".len()))
        .max()
        .unwrap_or(0);

    writeln!(
        writer,
        "{:^pw$} {:^cw$} {:^cw$} {:^cw$} {:^cw$}",
        "Populations",
        "PC1",
        "PC2",
        "PC3",
        "...",
        pw = pops_width,
        cw = col_width
    )?;

    for (idx, pop) in result.populations.iter().enumerate() {
        let row = result.components.row(idx);
        let cells: Vec<String> = row
            .iter()
            .take(6)
            .map(|&v| crate::session::format_sci(v, col_width))
            .collect();
        writeln!(writer, "{:^pw$}{}", pop, cells.join(" "), pw = pops_width)?;
    }

    writeln!(writer, "\nPC eigenvalues")?;
    let eigs: Vec<String> = result
        .eigenvalues
        .iter()
        .map(|&v| crate::session::format_sci(v, col_width))
        .collect();
    writeln!(writer, "{}", eigs.join(" "))?;
    writer.flush()?;

    log(LogLevel::Info, &format!("PCA results written to {}", output_file.display()));
    Ok(())
}
