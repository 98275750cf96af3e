use crate::model::AdmixtureModel;
use crate::parse::{
    describe_file_size, detect_encoding, geno_table_shape, parse_ind_file, parse_selected_populations,
    parse_snp_file, read_packed_header, GenotypeEncoding, GenotypeSource, PopulationIndexMap,
};
use crate::pca::{compute_pca, write_pca_results_to_file, PcaResult};
use crate::process::{compute_population_frequencies, population_columns, CancellationToken, FrequencyMatrix, MixError};
use crate::progress::{display_status_box, log, set_stage, LogLevel, ProcessingStage, ProgressEvent, ProgressSink, StatusBox};
use crate::stats::{
    self, compute_bootstrap, compute_results, num_auxiliary_pairs, BootstrapEstimate, StatisticResultSet,
    DEFAULT_HISTOGRAM_BINS,
};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const SCI_PRECISION: usize = 6;

/// Formats `value` like a space-signed, right-aligned `%E` field with a
/// two-digit exponent, e.g. ` 1.250000E-01`.
pub fn format_sci(value: f64, width: usize) -> String {
    let body = if value.is_finite() {
        let raw = format!("{:.*E}", SCI_PRECISION, value.abs());
        let (mantissa, exp) = raw.split_once('E').unwrap_or((raw.as_str(), "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        format!("{}E{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs())
    } else if value.is_nan() {
        "NAN".to_string()
    } else {
        "INF".to_string()
    };
    let sign = if value.is_sign_negative() && !value.is_nan() { '-' } else { ' ' };
    format!("{:>width$}", format!("{}{}", sign, body), width = width)
}

fn percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

/// Default roles for a fresh matrix; a selection that cannot form a model
/// is logged and leaves the session without one.
fn default_model(selected: &[String]) -> Option<AdmixtureModel> {
    match AdmixtureModel::from_selection(selected) {
        Ok(model) => Some(model),
        Err(e) => {
            log(LogLevel::Warning, &format!("No admixture model: {}", e));
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub num_workers: usize,
    pub histogram_bins: usize,
    pub bootstrap: bool,
    /// Fixed seed for the bootstrap resampler; entropy when `None`.
    pub bootstrap_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            num_workers: 1,
            histogram_bins: DEFAULT_HISTOGRAM_BINS,
            bootstrap: false,
            bootstrap_seed: None,
        }
    }
}

/// Everything known about one genotype triad and the analyses run on it.
///
/// Results are published only by successful runs: a failed or cancelled
/// frequency computation leaves the previous matrix in place.
pub struct Session {
    config: SessionConfig,
    source: Option<GenotypeSource>,
    populations: PopulationIndexMap,
    marker_names: Vec<String>,
    parsed_pops: Vec<String>,
    selected_pops: Vec<String>,
    token: CancellationToken,
    matrix: Option<FrequencyMatrix>,
    model: Option<AdmixtureModel>,
    results: Option<StatisticResultSet>,
    bootstrap: Option<BootstrapEstimate>,
    pca: Option<PcaResult>,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(mut config: SessionConfig) -> Self {
        config.num_workers = config.num_workers.max(1);
        Session {
            config,
            source: None,
            populations: PopulationIndexMap::default(),
            marker_names: Vec::new(),
            parsed_pops: Vec::new(),
            selected_pops: Vec::new(),
            token: CancellationToken::new(),
            matrix: None,
            model: None,
            results: None,
            bootstrap: None,
            pca: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sets the worker count; values below 1 are clamped to 1.
    pub fn set_num_workers(&mut self, workers: i64) {
        self.config.num_workers = workers.max(1) as usize;
    }

    /// Parses and cross-checks the genotype, individual and marker files.
    /// Nothing is stored unless every check passes.
    pub fn check_input_files(
        &mut self,
        geno: &Path,
        ind: &Path,
        snp: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<(), MixError> {
        set_stage(ProcessingStage::InputCheck);
        progress.emit(ProgressEvent::line("main", "Checking input files...", 0));
        log(
            LogLevel::Info,
            &format!("Genotype file {} ({})", geno.display(), describe_file_size(geno)?),
        );

        let encoding = detect_encoding(geno)?;
        let source = match encoding {
            GenotypeEncoding::Text => GenotypeSource::text(geno, geno_table_shape(geno, progress)?),
            GenotypeEncoding::Packed => {
                let header = read_packed_header(geno)?;
                progress.emit(ProgressEvent::category(
                    "geno",
                    format!("{} ind x {} snp", header.num_individuals, header.num_markers),
                ));
                GenotypeSource::packed(geno, header)
            }
        };

        let populations = parse_ind_file(ind, progress)?;
        let marker_names = parse_snp_file(snp, progress)?;

        if populations.num_individuals() != source.num_individuals() {
            return Err(MixError::IndividualCountMismatch {
                ind_rows: populations.num_individuals(),
                geno_columns: source.num_individuals(),
            });
        }
        if marker_names.len() != source.num_markers() {
            return Err(MixError::MarkerCountMismatch {
                snp_rows: marker_names.len(),
                geno_rows: source.num_markers(),
            });
        }

        progress.emit(ProgressEvent::category(
            "check",
            "Parsed input files seem to have a valid structure.",
        ));
        display_status_box(StatusBox {
            title: "Input files".to_string(),
            stats: vec![
                ("Encoding".to_string(), format!("{:?}", encoding)),
                ("Individuals".to_string(), source.num_individuals().to_string()),
                ("Markers".to_string(), source.num_markers().to_string()),
                ("Populations".to_string(), populations.len().to_string()),
            ],
        });

        self.source = Some(source);
        self.populations = populations;
        self.marker_names = marker_names;
        Ok(())
    }

    pub fn genotype_source(&self) -> Option<&GenotypeSource> {
        self.source.as_ref()
    }

    pub fn available_populations(&self) -> &[String] {
        self.populations.names()
    }

    pub fn marker_names(&self) -> &[String] {
        &self.marker_names
    }

    /// Reads a selected-populations file. Names absent from the `.ind` file
    /// are dropped and returned.
    pub fn load_selected_populations(
        &mut self,
        path: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<String>, MixError> {
        let parsed = parse_selected_populations(path, progress)?;
        self.set_parsed_populations(parsed)
    }

    pub fn set_parsed_populations(&mut self, parsed: Vec<String>) -> Result<Vec<String>, MixError> {
        if self.populations.is_empty() {
            return Err(MixError::NotReady("input files have not been checked"));
        }
        let (kept, missing): (Vec<String>, Vec<String>) =
            parsed.into_iter().partition(|pop| self.populations.contains(pop));

        if !missing.is_empty() {
            log(
                LogLevel::Warning,
                &format!("Populations not found in .ind file: {}", missing.join(", ")),
            );
        }

        let mut distinct: Vec<String> = Vec::with_capacity(kept.len());
        for pop in kept {
            if distinct.contains(&pop) {
                log(LogLevel::Warning, &format!("Population {} selected more than once", pop));
            } else {
                distinct.push(pop);
            }
        }

        self.parsed_pops = distinct;
        self.reset_populations();
        Ok(missing)
    }

    pub fn selected_populations(&self) -> &[String] {
        &self.selected_pops
    }

    /// Appends the given populations not already selected, keeping order.
    pub fn append_populations<S: AsRef<str>>(&mut self, pops: &[S]) {
        for pop in pops.iter().map(|p| p.as_ref()) {
            if !self.selected_pops.iter().any(|s| s == pop) {
                self.selected_pops.push(pop.to_string());
            }
        }
    }

    pub fn remove_populations<S: AsRef<str>>(&mut self, pops: &[S]) {
        self.selected_pops
            .retain(|s| !pops.iter().any(|p| p.as_ref() == s.as_str()));
    }

    /// Restores the selection read from the populations file.
    pub fn reset_populations(&mut self) {
        self.selected_pops = self.parsed_pops.clone();
    }

    /// Handle for aborting `compute_frequencies` from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stop_computation(&self) {
        self.token.cancel();
    }

    /// Computes, consolidates and publishes the frequency matrix of the
    /// selected populations, then installs the default admixture model.
    pub fn compute_frequencies(&mut self, progress: &dyn ProgressSink) -> Result<&FrequencyMatrix, MixError> {
        self.token.reset();
        let source = self
            .source
            .as_ref()
            .ok_or(MixError::NotReady("input files have not been checked"))?;
        if self.selected_pops.is_empty() {
            return Err(MixError::NotReady("no populations selected"));
        }

        let columns = population_columns(&self.populations, &self.selected_pops)?;
        let vectors = compute_population_frequencies(
            source,
            &columns,
            self.config.num_workers,
            &self.token,
            progress,
        )?;

        progress.emit(ProgressEvent::line("check", "Checking and removing invalid SNPs...", 0));
        let matrix = FrequencyMatrix::consolidate(self.selected_pops.clone(), vectors)?;
        progress.emit(ProgressEvent::line("check", "Checking SNPs finished.", 0));
        progress.emit(ProgressEvent::line(
            "check",
            format!("Number of excluded SNPs: {}", matrix.num_excluded_markers()),
            1,
        ));

        self.model = default_model(&self.selected_pops);
        self.results = None;
        self.bootstrap = None;
        self.pca = None;
        Ok(&*self.matrix.insert(matrix))
    }

    /// Publishes an externally computed matrix, as if by `compute_frequencies`.
    pub fn set_frequency_matrix(&mut self, matrix: FrequencyMatrix) {
        self.selected_pops = matrix.populations().to_vec();
        self.model = default_model(&self.selected_pops);
        self.results = None;
        self.bootstrap = None;
        self.pca = None;
        self.matrix = Some(matrix);
    }

    pub fn frequency_matrix(&self) -> Option<&FrequencyMatrix> {
        self.matrix.as_ref()
    }

    fn require_matrix(&self) -> Result<&FrequencyMatrix, MixError> {
        self.matrix
            .as_ref()
            .ok_or(MixError::NotReady("allele frequencies have not been computed"))
    }

    pub fn model(&self) -> Option<&AdmixtureModel> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Result<&mut AdmixtureModel, MixError> {
        self.model
            .as_mut()
            .ok_or(MixError::NotReady("no admixture model; select at least 3 populations"))
    }

    pub fn compute_results(&mut self, progress: &dyn ProgressSink) -> Result<&StatisticResultSet, MixError> {
        let matrix = self.require_matrix()?;
        let model = self
            .model
            .as_ref()
            .ok_or(MixError::NotReady("no admixture model; select at least 3 populations"))?;
        let results = compute_results(matrix, model, self.config.histogram_bins, progress)?;
        self.bootstrap = None;
        Ok(&*self.results.insert(results))
    }

    pub fn results(&self) -> Option<&StatisticResultSet> {
        self.results.as_ref()
    }

    pub fn compute_bootstrap(&mut self, progress: &dyn ProgressSink) -> Result<&BootstrapEstimate, MixError> {
        let matrix = self.require_matrix()?;
        let results = self
            .results
            .as_ref()
            .ok_or(MixError::NotReady("f-statistics have not been computed"))?;
        let mut rng = match self.config.bootstrap_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let estimate = compute_bootstrap(matrix, results, &mut rng, progress)?;
        Ok(&*self.bootstrap.insert(estimate))
    }

    pub fn bootstrap(&self) -> Option<&BootstrapEstimate> {
        self.bootstrap.as_ref()
    }

    /// (resample size, iterations) the bootstrap would use for the current model.
    pub fn bootstrap_conditions(&self) -> Option<(usize, usize)> {
        self.model
            .as_ref()
            .map(|m| stats::bootstrap_conditions(m.auxiliaries().len()))
    }

    /// Rebins the f4-ratio histogram of the last run.
    pub fn set_histogram_bins(&mut self, bins: usize) {
        self.config.histogram_bins = bins.max(1);
        if let Some(results) = self.results.as_mut() {
            results.rebin_histogram(self.config.histogram_bins);
        }
    }

    pub fn compute_pca<S: AsRef<str>>(&mut self, pops: &[S]) -> Result<&PcaResult, MixError> {
        let matrix = self.require_matrix()?;
        let pops: Vec<String> = pops.iter().map(|p| p.as_ref().to_string()).collect();
        let result = compute_pca(matrix, &pops)?;
        Ok(&*self.pca.insert(result))
    }

    pub fn pca(&self) -> Option<&PcaResult> {
        self.pca.as_ref()
    }

    pub fn f2(&self, a: &str, b: &str) -> Result<f64, MixError> {
        let m = self.require_matrix()?;
        Ok(stats::f2(m.row(a)?, m.row(b)?))
    }

    /// f3(A, B; C) and its angle in degrees.
    pub fn f3(&self, a: &str, b: &str, c: &str) -> Result<(f64, f64), MixError> {
        let m = self.require_matrix()?;
        Ok(stats::f3(m.row(a)?, m.row(b)?, m.row(c)?))
    }

    /// f4(A, B; C, D) and its angle in degrees.
    pub fn f4(&self, a: &str, b: &str, c: &str, d: &str) -> Result<(f64, f64), MixError> {
        let m = self.require_matrix()?;
        Ok(stats::f4(m.row(a)?, m.row(b)?, m.row(c)?, m.row(d)?))
    }

    pub fn aux_pair(&self, index: usize) -> (String, String) {
        self.results
            .as_ref()
            .and_then(|r| r.aux_pair(index))
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .unwrap_or_default()
    }

    /// Human-readable summary of the last f-statistics run.
    pub fn admixture_report(&self) -> Result<String, MixError> {
        let r = self
            .results
            .as_ref()
            .ok_or(MixError::NotReady("f-statistics have not been computed"))?;

        let (angle_bootstrap, alpha_bootstrap) = match self.bootstrap.as_ref() {
            Some(b) => (
                format!("+/- {:5.2} deg (bootstrap, 95% CI)", b.std_dev_angle),
                format!(" +/- {:6.4} (bootstrap, 95% CI)", b.std_dev_alpha),
            ),
            None => ("deg".to_string(), String::new()),
        };

        let mut text = String::new();
        text += &format!("Admixture model: {} = {} + {}\n", r.hybrid, r.parent1, r.parent2);
        text += &format!("SNPs used: {} / {}\n", r.num_valid_markers, r.total_markers);
        text += &format!("Auxiliary populations: {}\n", r.auxiliaries.len());
        text += &format!("Auxiliary pairs: {}\n", num_auxiliary_pairs(r.auxiliaries.len()));
        text += &format!(
            "Cos pre-JL:  {:7.4} ---> Angle pre-JL:  {:7.2} deg vs 180 deg: {}\n",
            r.angle_pre.cosine,
            r.angle_pre.angle,
            percent(r.angle_pre.percentage)
        );
        text += &format!(
            "Cos post-JL: {:7.4} ---> Angle post-JL: {:7.2} {} vs 180 deg: {}\n",
            r.angle_post.cosine,
            r.angle_post.angle,
            angle_bootstrap,
            percent(r.angle_post.percentage)
        );
        text += &format!(
            "Alpha post-JL: {:6.4} +/- {:6.4} (fit, 95% CI){}\n",
            r.alpha.alpha, r.alpha.error, alpha_bootstrap
        );
        text += "---\nAdditional indices:\n";
        text += &format!("Alpha pre-JL: {:6.4}\n", r.alpha_pre);
        text += &format!(
            "Alpha (Non-Renormalized) post-JL: {:6.4} +/- {:6.4} (fit, 95% CI)\n",
            r.alpha_std.alpha, r.alpha_std.error
        );
        text += &format!(
            "f4-ratio average if in [0, 1]: {:6.4} +/- {:6.4} (95% CI), {} cases\n",
            r.f4_ratio.average, r.f4_ratio.std_dev, r.f4_ratio.num_cases
        );
        text += &format!(
            "Standard admixture test: f3(donor1, donor2; admix) < 0 ? {:8.6}",
            r.f3_test
        );
        Ok(text)
    }

    /// One column per population, one row per valid marker.
    pub fn save_population_allele_frequencies(&self, path: &Path) -> Result<(), MixError> {
        set_stage(ProcessingStage::Export);
        let matrix = self.require_matrix()?;
        let pops = matrix.populations();
        let pops_width = pops.iter().map(|p| p.len()).max().unwrap_or(0);
        let col_width = (SCI_PRECISION + 7).max(pops_width);

        let mut writer = BufWriter::new(File::create(path)?);
        let headers: Vec<String> = pops.iter().map(|p| format!("{:^w$}", p, w = col_width)).collect();
        writeln!(writer, "{}", headers.join(" "))?;

        let freqs = matrix.as_array();
        for marker in 0..matrix.num_valid_markers() {
            let row: Vec<String> = freqs
                .column(marker)
                .iter()
                .map(|&f| format_sci(f, col_width))
                .collect();
            writeln!(writer, "{}", row.join(" "))?;
        }
        writer.flush()?;
        log(LogLevel::Info, &format!("Allele frequencies written to {}", path.display()));
        Ok(())
    }

    /// One row per auxiliary pair, in enumeration order.
    pub fn save_f4_points(&self, path: &Path) -> Result<(), MixError> {
        set_stage(ProcessingStage::Export);
        let r = self
            .results
            .as_ref()
            .ok_or(MixError::NotReady("f-statistics have not been computed"))?;
        let aux_width = r.auxiliaries.iter().map(|p| p.len()).max().unwrap_or(0);
        let col_width = SCI_PRECISION + 7;

        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "{:^cw$} {:^cw$} {:^cw$} {:^cw$} {:^cw$} {:^aw$} {:^aw$}",
            "f4primeAB",
            "f4primeXB",
            "f4AB",
            "f4XB",
            "f4-ratio",
            "Aux1",
            "Aux2",
            cw = col_width,
            aw = aux_width
        )?;

        for index in 0..r.num_auxiliary_pairs() {
            let (aux1, aux2) = r.aux_pair(index).unwrap_or(("", ""));
            let values = [
                r.f4ab_prime[index],
                r.f4xb_prime[index],
                r.f4ab_std[index],
                r.f4xb_std[index],
                r.f4_ratio.ratios[index],
            ];
            let cells: Vec<String> = values.iter().map(|&v| format_sci(v, col_width)).collect();
            writeln!(
                writer,
                "{} {:aw$} {:aw$}",
                cells.join(" "),
                aux1,
                aux2,
                aw = aux_width
            )?;
        }
        writer.flush()?;
        log(LogLevel::Info, &format!("f4 points written to {}", path.display()));
        Ok(())
    }

    pub fn save_admixture_data(&self, path: &Path) -> Result<(), MixError> {
        set_stage(ProcessingStage::Export);
        let report = self.admixture_report()?;
        let auxiliaries = self
            .results
            .as_ref()
            .map(|r| r.auxiliaries.join("\n"))
            .unwrap_or_default();

        let mut writer = BufWriter::new(File::create(path)?);
        write!(writer, "{}", report)?;
        write!(writer, "\nAuxiliary population names:\n{}", auxiliaries)?;
        writer.flush()?;
        log(LogLevel::Info, &format!("Admixture summary written to {}", path.display()));
        Ok(())
    }

    pub fn save_pca_data(&self, path: &Path) -> Result<(), MixError> {
        let pca = self
            .pca
            .as_ref()
            .ok_or(MixError::NotReady("PCA has not been computed"))?;
        write_pca_results_to_file(pca, path)
    }
}
