mod session_tests;

/// On-disk genotype triads for tests.
pub(crate) mod fixtures {
    use crate::parse::{encode_packed_block, PackedHeader, MISSING};
    use std::fs;
    use std::path::{Path, PathBuf};

    pub struct Triad {
        pub geno: PathBuf,
        pub ind: PathBuf,
        pub snp: PathBuf,
    }

    /// `genotypes[marker][individual]`, `labels[individual]`.
    pub fn write_text_triad(dir: &Path, genotypes: &[Vec<u8>], labels: &[&str]) -> Triad {
        let geno = dir.join("data.geno");
        let rows: Vec<String> = genotypes
            .iter()
            .map(|row| row.iter().map(|&c| char::from(b'0' + c.min(MISSING))).collect())
            .collect();
        fs::write(&geno, rows.join("\n") + "\n").expect("write geno");
        write_metadata(dir, geno, genotypes.len(), labels)
    }

    pub fn write_packed_triad(dir: &Path, genotypes: &[Vec<u8>], labels: &[&str]) -> Triad {
        let geno = dir.join("packed.geno");
        fs::write(&geno, packed_bytes(genotypes, labels.len(), genotypes.len())).expect("write geno");
        write_metadata(dir, geno, genotypes.len(), labels)
    }

    /// Packed file whose header may claim more markers than are stored.
    pub fn packed_bytes(genotypes: &[Vec<u8>], num_individuals: usize, declared_markers: usize) -> Vec<u8> {
        let header = PackedHeader::for_individuals(num_individuals, declared_markers);
        let mut bytes = format!("GENO {} {} 0 0", num_individuals, declared_markers).into_bytes();
        bytes.resize(header.block_size, 0);
        for row in genotypes {
            bytes.extend(encode_packed_block(row, header.block_size));
        }
        bytes
    }

    fn write_metadata(dir: &Path, geno: PathBuf, num_markers: usize, labels: &[&str]) -> Triad {
        let ind = dir.join("data.ind");
        let snp = dir.join("data.snp");
        let ind_rows: Vec<String> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| format!("ind{} U {}", i, label))
            .collect();
        fs::write(&ind, ind_rows.join("\n") + "\n").expect("write ind");
        let snp_rows: Vec<String> = (0..num_markers)
            .map(|m| format!("rs{} 1 0.0 {}", m, m * 100))
            .collect();
        fs::write(&snp, snp_rows.join("\n") + "\n").expect("write snp");
        Triad { geno, ind, snp }
    }

    /// Four individuals per population; codes are a fixed hash of
    /// (marker, individual) so that no two populations coincide.
    pub fn panel_genotypes(populations: &[&'static str], num_markers: usize) -> (Vec<Vec<u8>>, Vec<&'static str>) {
        let labels: Vec<&'static str> = populations
            .iter()
            .flat_map(|&p| std::iter::repeat(p).take(4))
            .collect();
        let genotypes = (0..num_markers)
            .map(|m| {
                (0..labels.len())
                    .map(|k| (((m * 13 + 7) * (k * 11 + 3) % 29) % 3) as u8)
                    .collect()
            })
            .collect();
        (genotypes, labels)
    }

    /// Five populations A..E, ten markers. Population C has no called
    /// genotype at marker 3; two calls of population A are missing at marker 6.
    pub fn five_population_genotypes() -> (Vec<Vec<u8>>, Vec<&'static str>) {
        let (mut genotypes, labels) = panel_genotypes(&["A", "B", "C", "D", "E"], 10);
        for k in 8..12 {
            genotypes[3][k] = MISSING;
        }
        genotypes[6][0] = MISSING;
        genotypes[6][1] = MISSING;
        (genotypes, labels)
    }

    /// Expected frequency of `population` at every marker, straight from the codes.
    pub fn expected_frequencies(genotypes: &[Vec<u8>], labels: &[&str], population: &str) -> Vec<f64> {
        genotypes
            .iter()
            .map(|row| {
                let codes: Vec<u8> = row
                    .iter()
                    .zip(labels)
                    .filter_map(|(&c, &l)| (l == population).then_some(c))
                    .collect();
                crate::stats::allele_frequency(&codes)
            })
            .collect()
    }
}
