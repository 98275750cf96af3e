use crate::model::AdmixtureModel;
use crate::parse::MISSING;
use crate::process::{FrequencyMatrix, MixError};
use crate::progress::{log, set_stage, LogLevel, ProcessingStage, ProgressEvent, ProgressSink};

use itertools::Itertools;
use ndarray::{Array1, ArrayView1};
use rand::seq::index::sample;
use rand::Rng;

/// Frequency reported for a marker with no called genotype in a population.
pub const INVALID_FREQUENCY: f64 = -1.0;

/// Fixed two-sided multiplier used for every "95% CI" reported here.
pub const CI95_MULTIPLIER: f64 = 1.98;

/// Below this magnitude an f4 denominator counts as zero.
pub const RATIO_ZERO_TOLERANCE: f64 = 1e-15;

pub const DEFAULT_HISTOGRAM_BINS: usize = 20;

pub const MAX_BOOTSTRAP_ITERATIONS: usize = 50;

/// Number of progress steps emitted by `compute_results`.
pub const RESULT_STAGES: u32 = 9;

/// Reference-allele frequency of one marker over one population.
///
/// Each called genotype contributes `(2 - code) / 2`; missing calls are
/// skipped. Returns `INVALID_FREQUENCY` when every call is missing.
pub fn allele_frequency(codes: &[u8]) -> f64 {
    let mut freq = 0.0;
    let mut called = 0usize;

    for &code in codes {
        if code != MISSING && code <= 2 {
            freq += (2 - code) as f64 / 2.0;
            called += 1;
        }
    }

    if called == 0 {
        return INVALID_FREQUENCY;
    }

    freq / called as f64
}

fn difference(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    &a - &b
}

/// cos of the angle between two difference vectors; 0 when either is null.
fn cosine(dot: f64, norm_sq_a: f64, norm_sq_b: f64) -> f64 {
    let denom = (norm_sq_a * norm_sq_b).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (dot / denom).clamp(-1.0, 1.0)
}

fn degrees(radians: f64) -> f64 {
    radians * 180.0 / std::f64::consts::PI
}

/// f2(A, B): mean squared frequency difference.
pub fn f2(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let ab = difference(a, b);
    if ab.is_empty() {
        return 0.0;
    }
    ab.dot(&ab) / ab.len() as f64
}

/// f3(A, B; C) together with the angle in degrees between A−C and B−C.
pub fn f3(a: ArrayView1<f64>, b: ArrayView1<f64>, c: ArrayView1<f64>) -> (f64, f64) {
    let ac = difference(a, c);
    let bc = difference(b, c);
    let dot = ac.dot(&bc);
    let markers = ac.len().max(1) as f64;
    let angle = degrees(cosine(dot, ac.dot(&ac), bc.dot(&bc)).acos());
    (dot / markers, angle)
}

/// f4(A, B; C, D) together with the angle in degrees between A−B and C−D.
pub fn f4(a: ArrayView1<f64>, b: ArrayView1<f64>, c: ArrayView1<f64>, d: ArrayView1<f64>) -> (f64, f64) {
    let ab = difference(a, b);
    let cd = difference(c, d);
    let dot = ab.dot(&cd);
    let markers = ab.len().max(1) as f64;
    let angle = degrees(cosine(dot, ab.dot(&ab), cd.dot(&cd)).acos());
    (dot / markers, angle)
}

/// Auxiliary index pairs (i, j), i < j, i ascending then j ascending.
pub fn auxiliary_pairs(num_aux: usize) -> Vec<(usize, usize)> {
    (0..num_aux).tuple_combinations().collect()
}

pub fn num_auxiliary_pairs(num_aux: usize) -> usize {
    num_aux * num_aux.saturating_sub(1) / 2
}

/// Frequencies of the three main roles, borrowed from a matrix.
#[derive(Clone, Copy)]
pub struct ModelFrequencies<'a> {
    pub hybrid: ArrayView1<'a, f64>,
    pub parent1: ArrayView1<'a, f64>,
    pub parent2: ArrayView1<'a, f64>,
}

impl<'a> ModelFrequencies<'a> {
    pub fn from_matrix(matrix: &'a FrequencyMatrix, model: &AdmixtureModel) -> Result<Self, MixError> {
        Ok(ModelFrequencies {
            hybrid: matrix.row(model.hybrid())?,
            parent1: matrix.row(model.parent1())?,
            parent2: matrix.row(model.parent2())?,
        })
    }

    /// P1 − P2
    fn ab(&self) -> Array1<f64> {
        difference(self.parent1, self.parent2)
    }

    /// H − P1
    fn xa(&self) -> Array1<f64> {
        difference(self.hybrid, self.parent1)
    }

    /// H − P2
    fn xb(&self) -> Array1<f64> {
        difference(self.hybrid, self.parent2)
    }

    fn num_markers(&self) -> usize {
        self.hybrid.len()
    }
}

pub fn auxiliary_rows<'a>(matrix: &'a FrequencyMatrix, aux: &[String]) -> Result<Vec<ArrayView1<'a, f64>>, MixError> {
    aux.iter().map(|name| matrix.row(name)).collect()
}

/// Projection of H onto the P1–P2 axis.
pub fn mixing_coefficient_pre(freqs: &ModelFrequencies) -> f64 {
    let ab = freqs.ab();
    let norm_sq = ab.dot(&ab);
    if norm_sq == 0.0 {
        return 0.0;
    }
    freqs.xb().dot(&ab) / norm_sq
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AdmixtureAngle {
    pub cosine: f64,
    /// Degrees.
    pub angle: f64,
    /// Angle as a fraction of a straight angle.
    pub percentage: f64,
}

impl AdmixtureAngle {
    fn from_cosine(cosine: f64) -> Self {
        let radians = cosine.acos();
        AdmixtureAngle {
            cosine,
            angle: degrees(radians),
            percentage: radians / std::f64::consts::PI,
        }
    }
}

pub fn admixture_angle_pre(freqs: &ModelFrequencies) -> AdmixtureAngle {
    let xa = freqs.xa();
    let xb = freqs.xb();
    AdmixtureAngle::from_cosine(cosine(xa.dot(&xb), xa.dot(&xa), xb.dot(&xb)))
}

/// f3(P1, P2; H). Negative values reject a simple two-way admixture.
pub fn f3_test(freqs: &ModelFrequencies) -> f64 {
    let markers = freqs.num_markers().max(1) as f64;
    freqs.xa().dot(&freqs.xb()) / markers
}

/// Renormalised f4′(P1,P2; i,j) and f4′(H,P2; i,j) for every auxiliary pair.
pub fn f4_prime(freqs: &ModelFrequencies, aux: &[ArrayView1<f64>]) -> (Vec<f64>, Vec<f64>) {
    let ab = freqs.ab();
    let xb = freqs.xb();
    let pairs = auxiliary_pairs(aux.len());
    let mut f4ab = Vec::with_capacity(pairs.len());
    let mut f4xb = Vec::with_capacity(pairs.len());

    for (i, j) in pairs {
        let ij = difference(aux[i], aux[j]);
        let norm = ij.dot(&ij).sqrt();
        if norm == 0.0 {
            f4ab.push(0.0);
            f4xb.push(0.0);
        } else {
            f4ab.push(ab.dot(&ij) / norm);
            f4xb.push(xb.dot(&ij) / norm);
        }
    }

    (f4ab, f4xb)
}

/// Standard f4(P1,P2; i,j) and f4(H,P2; i,j) for every auxiliary pair.
pub fn f4_standard(freqs: &ModelFrequencies, aux: &[ArrayView1<f64>]) -> (Vec<f64>, Vec<f64>) {
    let ab = freqs.ab();
    let xb = freqs.xb();
    let markers = freqs.num_markers().max(1) as f64;

    auxiliary_pairs(aux.len())
        .into_iter()
        .map(|(i, j)| {
            let ij = difference(aux[i], aux[j]);
            (ab.dot(&ij) / markers, xb.dot(&ij) / markers)
        })
        .unzip()
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LeastSquaresFit {
    pub alpha: f64,
    /// Half-width of the 95% interval on alpha.
    pub error: f64,
}

/// Fits y = αx through the origin.
///
/// The error is `sqrt(Q / ((n − 2) Σ(x − x̄)²)) * 1.98` with
/// `Q = Σ(y − αx)²`; it is reported as 0 when fewer than three points are
/// given or the x values do not vary.
pub fn least_squares(x: &[f64], y: &[f64]) -> LeastSquaresFit {
    let n = x.len().min(y.len());
    let x = &x[..n];
    let y = &y[..n];

    let xx: f64 = x.iter().map(|v| v * v).sum();
    let xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let alpha = if xx == 0.0 { 0.0 } else { xy / xx };

    if n < 3 {
        log::debug!("least squares error undefined for {} points", n);
        return LeastSquaresFit { alpha, error: 0.0 };
    }

    let q: f64 = x.iter().zip(y).map(|(a, b)| (b - alpha * a).powi(2)).sum();
    let x_avg = x.iter().sum::<f64>() / n as f64;
    let x_dev: f64 = x.iter().map(|a| (a - x_avg).powi(2)).sum();

    if x_dev == 0.0 {
        log::debug!("least squares error undefined for constant abscissae");
        return LeastSquaresFit { alpha, error: 0.0 };
    }

    let s_alpha = (q / ((n - 2) as f64 * x_dev)).sqrt();
    LeastSquaresFit {
        alpha,
        error: s_alpha * CI95_MULTIPLIER,
    }
}

/// Angle between H−P1 and H−P2 after projecting onto every auxiliary axis.
pub fn admixture_angle_post(freqs: &ModelFrequencies, aux: &[ArrayView1<f64>]) -> AdmixtureAngle {
    let xa = freqs.xa();
    let xb = freqs.xb();
    let (mut sum1, mut sum2, mut sum3) = (0.0, 0.0, 0.0);

    for (i, j) in auxiliary_pairs(aux.len()) {
        let ij = difference(aux[i], aux[j]);
        let ijij = ij.dot(&ij);
        if ijij == 0.0 {
            continue;
        }
        let xaij = xa.dot(&ij);
        let xbij = xb.dot(&ij);
        sum1 += xaij * xbij / ijij;
        sum2 += xaij * xaij / ijij;
        sum3 += xbij * xbij / ijij;
    }

    AdmixtureAngle::from_cosine(cosine(sum1, sum2, sum3))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Histogram {
    pub counts: Vec<usize>,
    /// `counts.len() + 1` ascending bin edges.
    pub edges: Vec<f64>,
}

/// Equal-width histogram over the range of `values`; the last bin is closed.
pub fn histogram(values: &[f64], bins: usize) -> Histogram {
    let bins = bins.max(1);
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();

    let (mut lo, mut hi) = match finite.iter().copied().minmax().into_option() {
        Some((lo, hi)) => (lo, hi),
        None => (0.0, 1.0),
    };
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }

    let width = (hi - lo) / bins as f64;
    let edges: Vec<f64> = (0..=bins).map(|k| lo + width * k as f64).collect();
    let mut counts = vec![0usize; bins];

    for v in finite {
        let bin = (((v - lo) / (hi - lo)) * bins as f64).floor() as usize;
        counts[bin.min(bins - 1)] += 1;
    }

    Histogram { counts, edges }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct F4RatioSummary {
    pub ratios: Vec<f64>,
    /// Mean of the ratios inside [0, 1].
    pub average: f64,
    /// 1.98 × population standard deviation of the ratios inside [0, 1].
    pub std_dev: f64,
    pub histogram: Histogram,
    /// Number of ratios inside [0, 1].
    pub num_cases: usize,
}

pub fn f4_ratios(freqs: &ModelFrequencies, aux: &[ArrayView1<f64>]) -> Vec<f64> {
    let ab = freqs.ab();
    let xb = freqs.xb();

    auxiliary_pairs(aux.len())
        .into_iter()
        .map(|(i, j)| {
            let ij = difference(aux[i], aux[j]);
            let denom = ab.dot(&ij);
            if denom.abs() <= RATIO_ZERO_TOLERANCE {
                0.0
            } else {
                xb.dot(&ij) / denom
            }
        })
        .collect()
}

pub fn summarize_f4_ratios(ratios: Vec<f64>, bins: usize) -> F4RatioSummary {
    let in_range: Vec<f64> = ratios
        .iter()
        .copied()
        .filter(|r| (0.0..=1.0).contains(r))
        .collect();

    let (average, std_dev) = if in_range.is_empty() {
        (0.0, 0.0)
    } else {
        let n = in_range.len() as f64;
        let mean = in_range.iter().sum::<f64>() / n;
        let var = in_range.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt() * CI95_MULTIPLIER)
    };

    F4RatioSummary {
        histogram: histogram(&ratios, bins),
        num_cases: in_range.len(),
        average,
        std_dev,
        ratios,
    }
}

/// Outputs of one full f-statistics run. Replaced wholesale by the next run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatisticResultSet {
    pub hybrid: String,
    pub parent1: String,
    pub parent2: String,
    pub auxiliaries: Vec<String>,
    pub num_valid_markers: usize,
    pub total_markers: usize,
    pub alpha_pre: f64,
    pub angle_pre: AdmixtureAngle,
    pub f3_test: f64,
    pub f4ab_prime: Vec<f64>,
    pub f4xb_prime: Vec<f64>,
    pub alpha: LeastSquaresFit,
    pub f4ab_std: Vec<f64>,
    pub f4xb_std: Vec<f64>,
    pub alpha_std: LeastSquaresFit,
    pub angle_post: AdmixtureAngle,
    pub f4_ratio: F4RatioSummary,
}

impl StatisticResultSet {
    pub fn num_auxiliary_pairs(&self) -> usize {
        self.f4ab_prime.len()
    }

    /// Names of the auxiliary pair stored at `index`, in enumeration order.
    pub fn aux_pair(&self, index: usize) -> Option<(&str, &str)> {
        auxiliary_pairs(self.auxiliaries.len())
            .get(index)
            .map(|&(i, j)| (self.auxiliaries[i].as_str(), self.auxiliaries[j].as_str()))
    }

    pub fn rebin_histogram(&mut self, bins: usize) {
        self.f4_ratio.histogram = histogram(&self.f4_ratio.ratios, bins);
    }
}

/// Runs the nine statistic stages for `model` over `matrix`.
pub fn compute_results(
    matrix: &FrequencyMatrix,
    model: &AdmixtureModel,
    histogram_bins: usize,
    progress: &dyn ProgressSink,
) -> Result<StatisticResultSet, MixError> {
    set_stage(ProcessingStage::Statistics);
    if model.auxiliaries().len() < 3 {
        return Err(MixError::InsufficientData(format!(
            "at least 3 auxiliary populations are needed, {} selected",
            model.auxiliaries().len()
        )));
    }

    let freqs = ModelFrequencies::from_matrix(matrix, model)?;
    let aux = auxiliary_rows(matrix, model.auxiliaries())?;
    progress.emit(ProgressEvent::Step(0));

    let alpha_pre = mixing_coefficient_pre(&freqs);
    progress.emit(ProgressEvent::Step(1));

    let angle_pre = admixture_angle_pre(&freqs);
    progress.emit(ProgressEvent::Step(2));

    let f3 = f3_test(&freqs);
    progress.emit(ProgressEvent::Step(3));

    let (f4ab_prime, f4xb_prime) = f4_prime(&freqs, &aux);
    progress.emit(ProgressEvent::Step(4));

    let alpha = least_squares(&f4ab_prime, &f4xb_prime);
    progress.emit(ProgressEvent::Step(5));

    let (f4ab_std, f4xb_std) = f4_standard(&freqs, &aux);
    progress.emit(ProgressEvent::Step(6));

    let alpha_std = least_squares(&f4ab_std, &f4xb_std);
    progress.emit(ProgressEvent::Step(7));

    let angle_post = admixture_angle_post(&freqs, &aux);
    progress.emit(ProgressEvent::Step(8));

    let f4_ratio = summarize_f4_ratios(f4_ratios(&freqs, &aux), histogram_bins);
    progress.emit(ProgressEvent::Step(RESULT_STAGES));

    log(
        LogLevel::Info,
        &format!(
            "{} = {} + {}: alpha {:.4} +/- {:.4}, post-projection angle {:.2} deg",
            model.hybrid(),
            model.parent1(),
            model.parent2(),
            alpha.alpha,
            alpha.error,
            angle_post.angle
        ),
    );

    Ok(StatisticResultSet {
        hybrid: model.hybrid().to_string(),
        parent1: model.parent1().to_string(),
        parent2: model.parent2().to_string(),
        auxiliaries: model.auxiliaries().to_vec(),
        num_valid_markers: matrix.num_valid_markers(),
        total_markers: matrix.total_markers(),
        alpha_pre,
        angle_pre,
        f3_test: f3,
        f4ab_prime,
        f4xb_prime,
        alpha,
        f4ab_std,
        f4xb_std,
        alpha_std,
        angle_post,
        f4_ratio,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BootstrapEstimate {
    /// 1.98 × RMS deviation of the resampled alpha from the full-sample alpha.
    pub std_dev_alpha: f64,
    /// 1.98 × RMS deviation of the resampled post-projection angle (degrees).
    pub std_dev_angle: f64,
    pub iterations: usize,
    pub resample_size: usize,
}

/// (resample size, iterations) for `num_aux` auxiliary populations.
pub fn bootstrap_conditions(num_aux: usize) -> (usize, usize) {
    let n = num_aux as f64;
    let iterations = (n * (n * 0.5 - 1.0) * 0.25).max(0.0).floor() as usize;
    (num_aux / 2, iterations.min(MAX_BOOTSTRAP_ITERATIONS))
}

/// Indices of one bootstrap subset: `resample_size` distinct auxiliaries
/// out of `num_aux`.
pub fn bootstrap_draw<R: Rng + ?Sized>(rng: &mut R, num_aux: usize, resample_size: usize) -> Vec<usize> {
    sample(rng, num_aux, resample_size.min(num_aux)).into_vec()
}

/// Resamples auxiliary subsets without replacement and measures how far
/// alpha and the post-projection angle move from `results`.
pub fn compute_bootstrap<R: Rng + ?Sized>(
    matrix: &FrequencyMatrix,
    results: &StatisticResultSet,
    rng: &mut R,
    progress: &dyn ProgressSink,
) -> Result<BootstrapEstimate, MixError> {
    set_stage(ProcessingStage::Bootstrap);
    let (resample_size, iterations) = bootstrap_conditions(results.auxiliaries.len());
    if iterations == 0 {
        return Err(MixError::InsufficientData(format!(
            "{} auxiliary populations give no bootstrap iterations",
            results.auxiliaries.len()
        )));
    }

    let freqs = ModelFrequencies {
        hybrid: matrix.row(&results.hybrid)?,
        parent1: matrix.row(&results.parent1)?,
        parent2: matrix.row(&results.parent2)?,
    };
    let aux = auxiliary_rows(matrix, &results.auxiliaries)?;

    progress.emit(ProgressEvent::Step(0));

    let mut sq_alpha = 0.0;
    let mut sq_angle = 0.0;

    for it in 0..iterations {
        let picked: Vec<ArrayView1<f64>> = bootstrap_draw(rng, aux.len(), resample_size)
            .into_iter()
            .map(|index| aux[index])
            .collect();

        let (f4ab, f4xb) = f4_prime(&freqs, &picked);
        let fit = least_squares(&f4ab, &f4xb);
        sq_alpha += (fit.alpha - results.alpha.alpha).powi(2);

        let angle = admixture_angle_post(&freqs, &picked);
        sq_angle += (angle.angle - results.angle_post.angle).powi(2);

        progress.emit(ProgressEvent::Step((it + 1) as u32));
    }

    let estimate = BootstrapEstimate {
        std_dev_alpha: CI95_MULTIPLIER * (sq_alpha / iterations as f64).sqrt(),
        std_dev_angle: CI95_MULTIPLIER * (sq_angle / iterations as f64).sqrt(),
        iterations,
        resample_size,
    };

    log(
        LogLevel::Info,
        &format!(
            "Bootstrap over {} iterations of {} populations: alpha +/- {:.4}, angle +/- {:.2} deg",
            iterations, resample_size, estimate.std_dev_alpha, estimate.std_dev_angle
        ),
    );

    Ok(estimate)
}
