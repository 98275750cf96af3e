#[cfg(test)]
mod session_tests {
    use crate::process::{FrequencyMatrix, MixError};
    use crate::progress::{NullProgress, ProgressEvent};
    use crate::session::{format_sci, Session, SessionConfig};
    use crate::tests::fixtures::{
        expected_frequencies, five_population_genotypes, panel_genotypes, write_packed_triad, write_text_triad,
        Triad,
    };
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    const PANEL: [&str; 7] = ["Mix", "Left", "Right", "O1", "O2", "O3", "O4"];

    fn checked_session(triad: &Triad, config: SessionConfig) -> Session {
        let mut session = Session::new(config);
        session
            .check_input_files(&triad.geno, &triad.ind, &triad.snp, &NullProgress)
            .unwrap();
        session
    }

    fn select(session: &mut Session, dir: &Path, pops: &[&str]) -> Vec<String> {
        let path = dir.join("selection.txt");
        fs::write(&path, pops.join("\n")).unwrap();
        session.load_selected_populations(&path, &NullProgress).unwrap()
    }

    fn panel_session(dir: &Path, config: SessionConfig) -> Session {
        let (genotypes, labels) = panel_genotypes(&PANEL, 12);
        let triad = write_text_triad(dir, &genotypes, &labels);
        let mut session = checked_session(&triad, config);
        select(&mut session, dir, &PANEL);
        session.compute_frequencies(&NullProgress).unwrap();
        session
    }

    #[test]
    fn test_format_sci() {
        assert_eq!(format_sci(0.125, 13), " 1.250000E-01");
        assert_eq!(format_sci(-2.0, 13), "-2.000000E+00");
        assert_eq!(format_sci(0.0, 13), " 0.000000E+00");
        assert_eq!(format_sci(12345.678, 13), " 1.234568E+04");
        assert_eq!(format_sci(1e-120, 14), " 1.000000E-120");
        assert_eq!(format_sci(0.5, 15), "   5.000000E-01");
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let mut session = Session::new(SessionConfig {
            num_workers: 0,
            ..SessionConfig::default()
        });
        assert_eq!(session.config().num_workers, 1);
        session.set_num_workers(-3);
        assert_eq!(session.config().num_workers, 1);
        session.set_num_workers(6);
        assert_eq!(session.config().num_workers, 6);
    }

    #[test]
    fn test_check_input_files() {
        let dir = tempdir().unwrap();
        let (genotypes, labels) = five_population_genotypes();
        let triad = write_text_triad(dir.path(), &genotypes, &labels);
        let session = checked_session(&triad, SessionConfig::default());

        assert_eq!(session.available_populations(), &["A", "B", "C", "D", "E"]);
        assert_eq!(session.marker_names().len(), 10);
        let source = session.genotype_source().unwrap();
        assert_eq!(source.num_individuals(), 20);
        assert_eq!(source.num_markers(), 10);
    }

    #[test]
    fn test_count_mismatches_store_nothing() {
        let dir = tempdir().unwrap();
        let (genotypes, labels) = five_population_genotypes();
        let triad = write_text_triad(dir.path(), &genotypes, &labels);

        let short_ind = dir.path().join("short.ind");
        let ind = fs::read_to_string(&triad.ind).unwrap();
        fs::write(&short_ind, ind.lines().skip(1).collect::<Vec<_>>().join("\n")).unwrap();
        let mut session = Session::default();
        let err = session
            .check_input_files(&triad.geno, &short_ind, &triad.snp, &NullProgress)
            .unwrap_err();
        assert!(matches!(
            err,
            MixError::IndividualCountMismatch {
                ind_rows: 19,
                geno_columns: 20
            }
        ));
        assert!(session.genotype_source().is_none());
        assert!(session.available_populations().is_empty());

        let long_snp = dir.path().join("long.snp");
        let snp = fs::read_to_string(&triad.snp).unwrap();
        fs::write(&long_snp, snp + "rs99 1 0.0 9900\n").unwrap();
        let err = session
            .check_input_files(&triad.geno, &triad.ind, &long_snp, &NullProgress)
            .unwrap_err();
        assert!(matches!(
            err,
            MixError::MarkerCountMismatch {
                snp_rows: 11,
                geno_rows: 10
            }
        ));
        assert!(session.genotype_source().is_none());
    }

    #[test]
    fn test_selection_editing() {
        let dir = tempdir().unwrap();
        let (genotypes, labels) = five_population_genotypes();
        let triad = write_text_triad(dir.path(), &genotypes, &labels);

        let mut unchecked = Session::default();
        assert!(matches!(
            unchecked.set_parsed_populations(vec!["A".to_string()]),
            Err(MixError::NotReady(_))
        ));

        let mut session = checked_session(&triad, SessionConfig::default());
        let missing = select(&mut session, dir.path(), &["C", "Z", "A", "B"]);
        assert_eq!(missing, vec!["Z"]);
        assert_eq!(session.selected_populations(), &["C", "A", "B"]);

        session.append_populations(&["E", "A", "D"]);
        assert_eq!(session.selected_populations(), &["C", "A", "B", "E", "D"]);
        session.remove_populations(&["A", "E"]);
        assert_eq!(session.selected_populations(), &["C", "B", "D"]);
        session.reset_populations();
        assert_eq!(session.selected_populations(), &["C", "A", "B"]);
    }

    #[test]
    fn test_compute_frequencies_end_to_end() {
        let dir = tempdir().unwrap();
        let (genotypes, labels) = five_population_genotypes();
        let triad = write_text_triad(dir.path(), &genotypes, &labels);
        let mut session = checked_session(&triad, SessionConfig::default());
        select(&mut session, dir.path(), &["A", "B", "C", "D", "E"]);

        let matrix = session.compute_frequencies(&NullProgress).unwrap();
        assert_eq!(matrix.total_markers(), 10);
        assert_eq!(matrix.num_valid_markers(), 9);

        // Marker 3 is dropped, marker 6 keeps A's two remaining calls.
        let mut expected_a = expected_frequencies(&genotypes, &labels, "A");
        expected_a.remove(3);
        assert_eq!(matrix.row("A").unwrap().to_vec(), expected_a);

        let model = session.model().unwrap();
        assert_eq!((model.hybrid(), model.parent1(), model.parent2()), ("A", "B", "C"));
        assert_eq!(model.auxiliaries(), &["D", "E"]);

        assert!(matches!(
            session.compute_results(&NullProgress),
            Err(MixError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_packed_session_matches_text_session() {
        let (genotypes, labels) = five_population_genotypes();
        let pops = ["E", "C", "A"];

        let text_dir = tempdir().unwrap();
        let text = write_text_triad(text_dir.path(), &genotypes, &labels);
        let mut text_session = checked_session(&text, SessionConfig::default());
        select(&mut text_session, text_dir.path(), &pops);

        let packed_dir = tempdir().unwrap();
        let packed = write_packed_triad(packed_dir.path(), &genotypes, &labels);
        let mut packed_session = checked_session(
            &packed,
            SessionConfig {
                num_workers: 3,
                ..SessionConfig::default()
            },
        );
        select(&mut packed_session, packed_dir.path(), &pops);

        let a = text_session.compute_frequencies(&NullProgress).unwrap().clone();
        let b = packed_session.compute_frequencies(&NullProgress).unwrap().clone();
        assert_eq!(a, b);
        assert_eq!(a.populations(), &["E", "C", "A"]);
    }

    #[test]
    fn test_cancelled_run_keeps_previous_matrix() {
        let dir = tempdir().unwrap();
        let (genotypes, labels) = five_population_genotypes();
        let triad = write_text_triad(dir.path(), &genotypes, &labels);
        let mut session = checked_session(&triad, SessionConfig::default());
        select(&mut session, dir.path(), &["A", "B", "C"]);
        let previous = session.compute_frequencies(&NullProgress).unwrap().clone();

        session.append_populations(&["D", "E"]);
        let token = session.cancellation_token();
        let cancel_on_first_batch = move |event: ProgressEvent| {
            if let ProgressEvent::CategoryLine { category, .. } = &event {
                if category == "progress" {
                    token.cancel();
                }
            }
        };
        assert!(matches!(
            session.compute_frequencies(&cancel_on_first_batch),
            Err(MixError::Cancelled)
        ));
        assert_eq!(session.frequency_matrix(), Some(&previous));

        // The next run starts from a cleared token.
        let matrix = session.compute_frequencies(&NullProgress).unwrap();
        assert_eq!(matrix.populations().len(), 5);
    }

    #[test]
    fn test_results_bootstrap_and_report() {
        let dir = tempdir().unwrap();
        let mut session = panel_session(
            dir.path(),
            SessionConfig {
                num_workers: 2,
                bootstrap_seed: Some(5),
                ..SessionConfig::default()
            },
        );

        assert_eq!(session.bootstrap_conditions(), Some((2, 1)));
        let results = session.compute_results(&NullProgress).unwrap().clone();
        assert_eq!(results.auxiliaries, vec!["O1", "O2", "O3", "O4"]);
        assert_eq!(results.num_auxiliary_pairs(), 6);
        assert_eq!(session.aux_pair(1), ("O1".to_string(), "O3".to_string()));
        assert_eq!(session.aux_pair(6), (String::new(), String::new()));

        let report = session.admixture_report().unwrap();
        assert!(report.starts_with("Admixture model: Mix = Left + Right\n"));
        assert!(report.contains("SNPs used: 12 / 12"));
        assert!(report.contains("Auxiliary pairs: 6"));
        assert!(!report.contains("bootstrap"));

        let estimate = *session.compute_bootstrap(&NullProgress).unwrap();
        assert_eq!(estimate.iterations, 1);
        let report = session.admixture_report().unwrap();
        assert!(report.contains("(bootstrap, 95% CI)"));

        // A fresh model run discards the old bootstrap.
        session.model_mut().unwrap().set_hybrid("O4").unwrap();
        let results = session.compute_results(&NullProgress).unwrap();
        assert_eq!(results.hybrid, "O4");
        assert!(session.bootstrap().is_none());
    }

    #[test]
    fn test_histogram_bins_rebin_last_run() {
        let dir = tempdir().unwrap();
        let mut session = panel_session(dir.path(), SessionConfig::default());
        session.compute_results(&NullProgress).unwrap();
        let ratios = session.results().unwrap().f4_ratio.ratios.clone();

        session.set_histogram_bins(3);
        let results = session.results().unwrap();
        assert_eq!(results.f4_ratio.histogram.counts.len(), 3);
        assert_eq!(results.f4_ratio.ratios, ratios);
        assert_eq!(session.config().histogram_bins, 3);
    }

    #[test]
    fn test_adhoc_statistics() {
        let mut session = Session::default();
        assert!(matches!(session.f2("A", "B"), Err(MixError::NotReady(_))));

        let matrix = FrequencyMatrix::consolidate(
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]],
        )
        .unwrap();
        session.set_frequency_matrix(matrix);

        assert!((session.f2("A", "C").unwrap() - 0.5).abs() < 1e-12);
        let (f3, angle) = session.f3("A", "B", "C").unwrap();
        assert!(f3.abs() < 1e-12);
        assert!((angle - 90.0).abs() < 1e-9);
        let (f4, _) = session.f4("A", "C", "B", "C").unwrap();
        assert!(f4.abs() < 1e-12);
        assert!(matches!(session.f2("A", "Q"), Err(MixError::UnknownPopulation(_))));
        assert!(session.model().is_some());
    }

    #[test]
    fn test_exports() {
        let dir = tempdir().unwrap();
        let mut session = panel_session(dir.path(), SessionConfig::default());
        session.compute_results(&NullProgress).unwrap();
        session.compute_pca(&PANEL).unwrap();

        let freqs = dir.path().join("frequencies.dat");
        session.save_population_allele_frequencies(&freqs).unwrap();
        let content = fs::read_to_string(&freqs).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1 + 12);
        assert!(lines[0].contains("Mix") && lines[0].contains("O4"));
        assert_eq!(lines[1].split_whitespace().count(), PANEL.len());

        let points = dir.path().join("f4-points.dat");
        session.save_f4_points(&points).unwrap();
        let content = fs::read_to_string(&points).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1 + 6);
        assert!(lines[0].contains("f4primeAB"));
        assert!(lines[1].ends_with("O1 O2"));

        let results = dir.path().join("results.dat");
        session.save_admixture_data(&results).unwrap();
        let content = fs::read_to_string(&results).unwrap();
        assert!(content.starts_with("Admixture model: Mix = Left + Right"));
        assert!(content.ends_with("Auxiliary population names:\nO1\nO2\nO3\nO4"));

        let pca = dir.path().join("pca.dat");
        session.save_pca_data(&pca).unwrap();
        assert!(fs::read_to_string(&pca).unwrap().contains("PC eigenvalues"));
    }

    #[test]
    fn test_exports_need_computed_state() {
        let dir = tempdir().unwrap();
        let session = Session::default();
        assert!(matches!(
            session.save_f4_points(&dir.path().join("x.dat")),
            Err(MixError::NotReady(_))
        ));
        assert!(matches!(session.admixture_report(), Err(MixError::NotReady(_))));
        assert!(matches!(
            session.save_pca_data(&dir.path().join("p.dat")),
            Err(MixError::NotReady(_))
        ));
    }

    #[test]
    fn test_duplicate_selection_keeps_model() {
        let dir = tempdir().unwrap();
        let (genotypes, labels) = five_population_genotypes();
        let triad = write_text_triad(dir.path(), &genotypes, &labels);
        let mut session = checked_session(&triad, SessionConfig::default());

        let missing = select(&mut session, dir.path(), &["A", "B", "C", "D", "E", "D"]);
        assert!(missing.is_empty());
        assert_eq!(session.selected_populations(), &["A", "B", "C", "D", "E"]);

        let matrix = session.compute_frequencies(&NullProgress).unwrap();
        assert_eq!(matrix.populations(), &["A", "B", "C", "D", "E"]);
        let model = session.model().unwrap();
        assert_eq!(model.auxiliaries(), &["D", "E"]);
    }
}
