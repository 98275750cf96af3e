// tests/cli_tests.rs

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const POPULATIONS: [&str; 7] = ["Mix", "Left", "Right", "O1", "O2", "O3", "O4"];

fn write_triad(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let individuals = POPULATIONS.len() * 4;
    let mut geno = String::new();
    let mut snp = String::new();
    for m in 0..12 {
        for k in 0..individuals {
            geno.push_str(&(((m * 13 + 7) * (k * 11 + 3) % 29) % 3).to_string());
        }
        geno.push('\n');
        snp.push_str(&format!("rs{} 1 0.0 {}\n", m, m * 100));
    }
    let ind: String = (0..individuals)
        .map(|k| format!("ind{} U {}\n", k, POPULATIONS[k / 4]))
        .collect();

    fs::write(dir.join("panel.geno"), geno)?;
    fs::write(dir.join("panel.snp"), snp)?;
    fs::write(dir.join("panel.ind"), ind)?;
    fs::write(dir.join("pops.txt"), POPULATIONS.join("\n"))?;
    Ok(())
}

fn command(dir: &Path, out: &Path) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("ferromix")?;
    cmd.arg("--geno")
        .arg(dir.join("panel.geno"))
        .arg("--ind")
        .arg(dir.join("panel.ind"))
        .arg("--snp")
        .arg(dir.join("panel.snp"))
        .arg("--pops")
        .arg(dir.join("pops.txt"))
        .arg("--outdir")
        .arg(out)
        .arg("--nprocs")
        .arg("2");
    Ok(cmd)
}

#[test]
fn test_full_run_writes_outputs() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_triad(dir.path())?;
    let out = dir.path().join("out");
    fs::create_dir(&out)?;

    command(dir.path(), &out)?
        .arg("--bootstrap")
        .arg("--seed")
        .arg("3")
        .arg("--pca")
        .assert()
        .success()
        .stdout(predicate::str::contains("Admixture model: Mix = Left + Right"))
        .stdout(predicate::str::contains("SNPs used: 12 / 12"))
        .stdout(predicate::str::contains("(bootstrap, 95% CI)"));

    for name in ["frequencies.dat", "f4-points.dat", "results.dat", "timings.dat", "pca.dat"] {
        assert!(out.join(name).is_file(), "{} was not written", name);
    }
    let timings = fs::read_to_string(out.join("timings.dat"))?;
    assert!(timings.starts_with("num_processes: 2"));
    Ok(())
}

#[test]
fn test_missing_output_directory_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_triad(dir.path())?;

    command(dir.path(), &dir.path().join("absent"))?
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
    Ok(())
}

#[test]
fn test_mismatched_marker_file_fails() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_triad(dir.path())?;
    fs::write(dir.path().join("panel.snp"), "rs0 1 0.0 0\n")?;
    let out = dir.path().join("out");
    fs::create_dir(&out)?;

    command(dir.path(), &out)?
        .assert()
        .failure()
        .stderr(predicate::str::contains("Number of markers (1) in .snp file"));
    Ok(())
}
