use crate::parse::{GenotypeSource, PopulationIndexMap};
use crate::progress::{format_duration, log, set_stage, LogLevel, ProcessingStage, ProgressEvent, ProgressSink};
use crate::stats::{allele_frequency, INVALID_FREQUENCY};

use ndarray::{Array2, ArrayView1};
use rayon::ThreadPoolBuilder;
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum MixError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid genotype format: {0}")]
    Format(String),
    #[error("Genotype row {row} has {found} columns, expected {expected}")]
    RaggedGenotypeRows { row: usize, expected: usize, found: usize },
    #[error("Number of individuals ({ind_rows}) in .ind file is not equal to number of columns ({geno_columns}) in genotype file")]
    IndividualCountMismatch { ind_rows: usize, geno_columns: usize },
    #[error("Number of markers ({snp_rows}) in .snp file is not equal to number of rows ({geno_rows}) in genotype file")]
    MarkerCountMismatch { snp_rows: usize, geno_rows: usize },
    #[error("Unknown population: {0}")]
    UnknownPopulation(String),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Not ready: {0}")]
    NotReady(&'static str),
    #[error("Computation cancelled")]
    Cancelled,
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

/// Shared abort flag polled by frequency workers between markers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests abort of the in-flight computation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Fills `out` with one allele frequency per marker for the individuals in
/// `columns`. Stops after the current marker once `token` is cancelled,
/// leaving the remaining entries untouched. Returns the markers processed.
pub fn population_allele_frequencies(
    source: &GenotypeSource,
    columns: &[usize],
    out: &mut [f64],
    token: &CancellationToken,
) -> Result<usize, MixError> {
    let mut reader = source.open()?;
    let mut codes = Vec::with_capacity(columns.len());
    let mut processed = 0;

    for slot in out.iter_mut().take(source.num_markers()) {
        reader.read_marker(columns, &mut codes)?;
        *slot = allele_frequency(&codes);
        processed += 1;
        if token.is_cancelled() {
            break;
        }
    }

    Ok(processed)
}

/// Computes one frequency vector per population, in the order given.
///
/// Populations are processed in batches of `num_workers`; every population in
/// a batch gets its own worker and its own output vector, and the batch is
/// joined before the next one starts. A cancelled token observed after a join
/// aborts the run with `MixError::Cancelled`.
pub fn compute_population_frequencies(
    source: &GenotypeSource,
    populations: &[(String, Vec<usize>)],
    num_workers: usize,
    token: &CancellationToken,
    progress: &dyn ProgressSink,
) -> Result<Vec<Vec<f64>>, MixError> {
    set_stage(ProcessingStage::FrequencyComputation);
    let num_workers = num_workers.max(1);
    let num_markers = source.num_markers();
    let num_batches = populations.len().div_ceil(num_workers);

    progress.emit(ProgressEvent::line(
        "main",
        format!(
            "Computing {} frequencies per population for {} populations in {} batches of {} parallel processes...",
            num_markers,
            populations.len(),
            num_batches,
            num_workers
        ),
        0,
    ));
    progress.emit(ProgressEvent::Step(0));

    let pool = ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .map_err(|e| MixError::ThreadPool(e.to_string()))?;

    let mut frequencies = vec![vec![0.0f64; num_markers]; populations.len()];
    let total_individuals: usize = populations.iter().map(|(_, cols)| cols.len()).sum();
    let mut individuals_done = 0usize;
    let mut populations_done = 0usize;
    let start = Instant::now();

    for (slots, batch) in frequencies
        .chunks_mut(num_workers)
        .zip(populations.chunks(num_workers))
    {
        let names: Vec<&str> = batch.iter().map(|(name, _)| name.as_str()).collect();
        progress.emit(ProgressEvent::line(
            "progress",
            format!("Computing populations: {}", names.join(" ")),
            0,
        ));

        let mut outcomes: Vec<Result<usize, MixError>> = batch.iter().map(|_| Ok(0)).collect();
        pool.scope(|scope| {
            for ((slot, (_, columns)), outcome) in slots.iter_mut().zip(batch).zip(outcomes.iter_mut()) {
                scope.spawn(move |_| {
                    *outcome = population_allele_frequencies(source, columns, slot, token);
                });
            }
        });

        for (outcome, name) in outcomes.into_iter().zip(&names) {
            if let Err(e) = outcome {
                log(LogLevel::Error, &format!("Frequency worker for {} failed: {}", name, e));
                return Err(e);
            }
        }

        if token.is_cancelled() {
            break;
        }

        populations_done += batch.len();
        individuals_done += batch.iter().map(|(_, cols)| cols.len()).sum::<usize>();

        let elapsed = start.elapsed().as_secs_f64();
        let per_individual = if individuals_done > 0 {
            elapsed / individuals_done as f64
        } else {
            0.0
        };
        let remaining = (total_individuals - individuals_done) as f64 * per_individual;

        progress.emit(ProgressEvent::line(
            "timing",
            format!("Estimated remaining time: {}", format_duration(remaining)),
            0,
        ));
        progress.emit(ProgressEvent::line(
            "timing",
            format!("Elapsed time: {}", format_duration(elapsed)),
            1,
        ));
        progress.emit(ProgressEvent::Step(populations_done as u32));
    }

    if token.is_cancelled() {
        progress.emit(ProgressEvent::line("main", "Computation stopped!", 0));
        progress.emit(ProgressEvent::line(
            "progress",
            "Allele frequencies unchanged from previous computation.",
            0,
        ));
        progress.emit(ProgressEvent::line("timing", "", 0));
        log(LogLevel::Warning, "Frequency computation cancelled");
        return Err(MixError::Cancelled);
    }

    progress.emit(ProgressEvent::line("main", "Computation finished.", 0));
    progress.emit(ProgressEvent::line("progress", "", 0));
    Ok(frequencies)
}

/// Resolves population names to their column lists, preserving order.
pub fn population_columns(
    index_map: &PopulationIndexMap,
    populations: &[String],
) -> Result<Vec<(String, Vec<usize>)>, MixError> {
    populations
        .iter()
        .map(|name| {
            index_map
                .get(name)
                .map(|cols| (name.clone(), cols.to_vec()))
                .ok_or_else(|| MixError::UnknownPopulation(name.clone()))
        })
        .collect()
}

/// Sorted marker indices that are invalid in at least one vector.
pub fn invalid_marker_indices(vectors: &[Vec<f64>]) -> Vec<usize> {
    let invalid: BTreeSet<usize> = vectors
        .iter()
        .flat_map(|freqs| {
            freqs
                .iter()
                .enumerate()
                .filter(|(_, f)| **f == INVALID_FREQUENCY)
                .map(|(index, _)| index)
        })
        .collect();
    invalid.into_iter().collect()
}

/// Per-population allele frequencies restricted to markers valid in every
/// population. Rows follow the order of `populations()`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyMatrix {
    populations: Vec<String>,
    frequencies: Array2<f64>,
    total_markers: usize,
}

impl FrequencyMatrix {
    /// Consolidates raw frequency vectors: every marker that is invalid in
    /// any population is removed from all of them.
    pub fn consolidate(populations: Vec<String>, vectors: Vec<Vec<f64>>) -> Result<Self, MixError> {
        set_stage(ProcessingStage::Consolidation);
        if populations.len() != vectors.len() {
            return Err(MixError::InsufficientData(format!(
                "{} population names for {} frequency vectors",
                populations.len(),
                vectors.len()
            )));
        }
        let total_markers = vectors.first().map_or(0, |v| v.len());
        if let Some(bad) = vectors.iter().position(|v| v.len() != total_markers) {
            return Err(MixError::InsufficientData(format!(
                "frequency vector of {} has {} markers, expected {}",
                populations[bad],
                vectors[bad].len(),
                total_markers
            )));
        }

        let invalid = invalid_marker_indices(&vectors);
        let kept: Vec<usize> = (0..total_markers)
            .filter(|index| invalid.binary_search(index).is_err())
            .collect();

        let mut frequencies = Array2::<f64>::zeros((vectors.len(), kept.len()));
        for (row, freqs) in vectors.iter().enumerate() {
            for (col, &marker) in kept.iter().enumerate() {
                frequencies[[row, col]] = freqs[marker];
            }
        }

        log(
            LogLevel::Info,
            &format!(
                "Excluded {} invalid markers, {} / {} valid",
                invalid.len(),
                kept.len(),
                total_markers
            ),
        );

        Ok(FrequencyMatrix {
            populations,
            frequencies,
            total_markers,
        })
    }

    pub fn populations(&self) -> &[String] {
        &self.populations
    }

    pub fn num_valid_markers(&self) -> usize {
        self.frequencies.ncols()
    }

    pub fn total_markers(&self) -> usize {
        self.total_markers
    }

    pub fn num_excluded_markers(&self) -> usize {
        self.total_markers - self.num_valid_markers()
    }

    pub fn position(&self, population: &str) -> Option<usize> {
        self.populations.iter().position(|p| p == population)
    }

    pub fn get(&self, population: &str) -> Option<ArrayView1<'_, f64>> {
        self.position(population).map(|row| self.frequencies.row(row))
    }

    /// Like `get`, but an absent name is an error.
    pub fn row(&self, population: &str) -> Result<ArrayView1<'_, f64>, MixError> {
        self.get(population)
            .ok_or_else(|| MixError::UnknownPopulation(population.to_string()))
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.frequencies
    }

    pub fn to_vectors(&self) -> Vec<Vec<f64>> {
        self.frequencies.rows().into_iter().map(|row| row.to_vec()).collect()
    }
}
