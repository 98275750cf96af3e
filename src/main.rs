use ferromix::progress::{display_status_box, ConsoleProgress, StatusBox};
use ferromix::stats::RESULT_STAGES;
use ferromix::{Session, SessionConfig};

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about = "Admixture geometry from allele frequencies", long_about = None)]
struct Args {
    /// Genotype file (text or packed)
    #[arg(long)]
    geno: PathBuf,

    /// Individual file; the last column is the population label
    #[arg(long)]
    ind: PathBuf,

    /// Marker file
    #[arg(long)]
    snp: PathBuf,

    /// Selected populations: hybrid, parent 1, parent 2, then auxiliaries
    #[arg(long)]
    pops: PathBuf,

    /// Output directory
    #[arg(long)]
    outdir: PathBuf,

    /// Number of parallel frequency workers
    #[arg(long, default_value_t = num_cpus::get() as i64)]
    nprocs: i64,

    /// Bins of the f4-ratio histogram
    #[arg(long, default_value = "20")]
    bins: usize,

    /// Estimate bootstrap errors for alpha and the post-projection angle
    #[arg(long)]
    bootstrap: bool,

    /// Seed for the bootstrap resampler
    #[arg(long)]
    seed: Option<u64>,

    /// Also run PCA over all selected populations
    #[arg(long)]
    pca: bool,
}

fn check_file_path(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("File {} does not exist", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    println!("{}", "Starting admixture analysis...".green());

    for path in [&args.geno, &args.ind, &args.snp, &args.pops] {
        check_file_path(path)?;
    }
    if !args.outdir.is_dir() {
        bail!("Directory {} does not exist", args.outdir.display());
    }

    let mut session = Session::new(SessionConfig {
        num_workers: 1,
        histogram_bins: args.bins,
        bootstrap: args.bootstrap,
        bootstrap_seed: args.seed,
    });
    session.set_num_workers(args.nprocs);

    let mut timings: Vec<(&str, f64)> = vec![("num_processes", session.config().num_workers as f64)];

    let t = Instant::now();
    let quiet = ferromix::progress::NullProgress;
    session
        .check_input_files(&args.geno, &args.ind, &args.snp, &quiet)
        .context("Checking input files failed")?;
    let missing = session.load_selected_populations(&args.pops, &quiet)?;
    if !missing.is_empty() {
        warn!("Dropped populations missing from {}: {}", args.ind.display(), missing.join(" "));
    }
    timings.push(("check_inputs", t.elapsed().as_secs_f64()));

    let t = Instant::now();
    let selected = session.selected_populations().len() as u64;
    let bar = ConsoleProgress::new("Allele frequencies", selected);
    let matrix = session.compute_frequencies(&bar)?;
    bar.finish("Allele frequencies computed");
    info!(
        "SNPs used: {} / {}",
        matrix.num_valid_markers(),
        matrix.total_markers()
    );
    timings.push(("compute_frequencies", t.elapsed().as_secs_f64()));

    let t = Instant::now();
    let bar = ConsoleProgress::new("f-statistics", RESULT_STAGES as u64);
    session.compute_results(&bar)?;
    bar.finish("f-statistics computed");

    if session.config().bootstrap {
        let iterations = session.bootstrap_conditions().map_or(0, |(_, its)| its as u64);
        let bar = ConsoleProgress::new("Bootstrap", iterations);
        session.compute_bootstrap(&bar)?;
        bar.finish("Bootstrap finished");
    }
    timings.push(("compute_results", t.elapsed().as_secs_f64()));

    if args.pca {
        let pops = session.selected_populations().to_vec();
        session.compute_pca(&pops)?;
        session.save_pca_data(&args.outdir.join("pca.dat"))?;
    }

    let t = Instant::now();
    session.save_population_allele_frequencies(&args.outdir.join("frequencies.dat"))?;
    session.save_f4_points(&args.outdir.join("f4-points.dat"))?;
    session.save_admixture_data(&args.outdir.join("results.dat"))?;
    timings.push(("save_outputs", t.elapsed().as_secs_f64()));

    let mut timing_file = fs::File::create(args.outdir.join("timings.dat"))?;
    for (key, value) in &timings {
        writeln!(timing_file, "{}: {}", key, value)?;
    }

    if let Some(results) = session.results() {
        display_status_box(StatusBox {
            title: format!("{} = {} + {}", results.hybrid, results.parent1, results.parent2),
            stats: vec![
                ("alpha".to_string(), format!("{:.4} +/- {:.4}", results.alpha.alpha, results.alpha.error)),
                ("angle post-JL".to_string(), format!("{:.2} deg", results.angle_post.angle)),
                ("f3 test".to_string(), format!("{:.6}", results.f3_test)),
                ("f4-ratio cases".to_string(), results.f4_ratio.num_cases.to_string()),
            ],
        });
    }

    println!("{}", session.admixture_report()?);
    println!("{}", "Analysis complete.".green());
    Ok(())
}
