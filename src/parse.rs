use crate::process::MixError;
use crate::progress::{ProgressEvent, ProgressSink};

use human_bytes::human_bytes;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Genotype code stored for an unreadable call.
pub const MISSING: u8 = 9;

const ASCII_PROBE_BYTES: usize = 64 * 1024;
const PACKED_HEADER_PROBE: usize = 20;
const MIN_PACKED_BLOCK: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeEncoding {
    /// One line of `0`/`1`/`2`/`9` digits per marker.
    Text,
    /// `GENO` header block followed by one 2-bit-per-individual block per marker.
    Packed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedHeader {
    pub num_individuals: usize,
    pub num_markers: usize,
    pub block_size: usize,
}

impl PackedHeader {
    pub fn for_individuals(num_individuals: usize, num_markers: usize) -> Self {
        PackedHeader {
            num_individuals,
            num_markers,
            block_size: MIN_PACKED_BLOCK.max(num_individuals.div_ceil(4)),
        }
    }
}

/// Row and column counts of a text genotype table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenoShape {
    pub rows: usize,
    pub columns: usize,
}

/// Population name -> individual columns, in first-appearance order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulationIndexMap {
    names: Vec<String>,
    indices: HashMap<String, Vec<usize>>,
    num_individuals: usize,
}

impl PopulationIndexMap {
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = PopulationIndexMap::default();
        for (column, label) in labels.into_iter().enumerate() {
            let label = label.into();
            match map.indices.get_mut(&label) {
                Some(columns) => columns.push(column),
                None => {
                    map.names.push(label.clone());
                    map.indices.insert(label, vec![column]);
                }
            }
            map.num_individuals += 1;
        }
        map
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, population: &str) -> Option<&[usize]> {
        self.indices.get(population).map(|v| v.as_slice())
    }

    pub fn contains(&self, population: &str) -> bool {
        self.indices.contains_key(population)
    }

    pub fn num_individuals(&self) -> usize {
        self.num_individuals
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Packed files open with a `GENO` tag; otherwise any non-ASCII byte in the
/// first 64 KiB marks the file as packed.
pub fn detect_encoding(path: &Path) -> Result<GenotypeEncoding, MixError> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; ASCII_PROBE_BYTES];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let probe = &buffer[..filled];
    if probe.starts_with(b"GENO") && probe.get(4).map_or(false, |b| b.is_ascii_whitespace()) {
        return Ok(GenotypeEncoding::Packed);
    }
    if probe.is_ascii() {
        Ok(GenotypeEncoding::Text)
    } else {
        Ok(GenotypeEncoding::Packed)
    }
}

pub fn read_packed_header(path: &Path) -> Result<PackedHeader, MixError> {
    let mut file = File::open(path)?;
    let mut probe = Vec::with_capacity(PACKED_HEADER_PROBE);
    file.by_ref()
        .take(PACKED_HEADER_PROBE as u64)
        .read_to_end(&mut probe)?;
    parse_packed_header(&probe)
}

pub fn parse_packed_header(bytes: &[u8]) -> Result<PackedHeader, MixError> {
    let fields: Vec<&[u8]> = bytes
        .split(|b| b.is_ascii_whitespace() || *b == 0)
        .filter(|f| !f.is_empty())
        .collect();

    if fields.first().copied() != Some(b"GENO".as_slice()) {
        return Err(MixError::Format(
            "packed genotype file does not start with a GENO header".to_string(),
        ));
    }

    let number = |pos: usize, what: &str| -> Result<usize, MixError> {
        fields
            .get(pos)
            .and_then(|f| std::str::from_utf8(f).ok())
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| MixError::Format(format!("packed header has no valid {} count", what)))
    };

    let num_individuals = number(1, "individual")?;
    let num_markers = number(2, "marker")?;
    Ok(PackedHeader::for_individuals(num_individuals, num_markers))
}

/// Counts rows of a text genotype file and verifies that every row has the
/// same number of columns.
pub fn geno_table_shape(path: &Path, progress: &dyn ProgressSink) -> Result<GenoShape, MixError> {
    let reader = BufReader::new(File::open(path)?);
    let mut rows = 0usize;
    let mut columns: Option<usize> = None;

    for line in reader.split(b'\n') {
        let line = line?;
        let width = trim_row(&line).len();
        match columns {
            None => columns = Some(width),
            Some(expected) if expected != width => {
                return Err(MixError::RaggedGenotypeRows {
                    row: rows,
                    expected,
                    found: width,
                });
            }
            Some(_) => {}
        }
        if rows % 1000 == 0 {
            progress.emit(ProgressEvent::category("geno", format!("Number of rows: {}", rows)));
        }
        rows += 1;
    }

    progress.emit(ProgressEvent::category("geno", format!("Number of rows: {}", rows)));

    Ok(GenoShape {
        rows,
        columns: columns.unwrap_or(0),
    })
}

/// Parses an `.ind` file: the last whitespace-separated column of each line
/// is the population label of the individual in that column position.
pub fn parse_ind_file(path: &Path, progress: &dyn ProgressSink) -> Result<PopulationIndexMap, MixError> {
    let reader = BufReader::new(File::open(path)?);
    let mut labels = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let label = line.split_whitespace().last().ok_or_else(|| {
            MixError::Parse(format!("line {} of {} has no population label", line_num + 1, path.display()))
        })?;
        labels.push(label.to_string());
        if line_num % 1000 == 0 {
            progress.emit(ProgressEvent::category("ind", format!("Number of rows: {}", line_num)));
        }
    }

    progress.emit(ProgressEvent::category("ind", format!("Number of rows: {}", labels.len())));
    Ok(PopulationIndexMap::from_labels(labels))
}

/// Parses a `.snp` file, keeping the first column of each line.
pub fn parse_snp_file(path: &Path, progress: &dyn ProgressSink) -> Result<Vec<String>, MixError> {
    let reader = BufReader::new(File::open(path)?);
    let mut names = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let name = line.split_whitespace().next().unwrap_or("").to_string();
        if names.len() % 1000 == 0 {
            progress.emit(ProgressEvent::category("snp", format!("Number of rows: {}", names.len())));
        }
        names.push(name);
    }

    progress.emit(ProgressEvent::category("snp", format!("Number of rows: {}", names.len())));
    Ok(names)
}

/// First column of each non-blank line names a selected population.
pub fn parse_selected_populations(path: &Path, progress: &dyn ProgressSink) -> Result<Vec<String>, MixError> {
    let reader = BufReader::new(File::open(path)?);
    let mut pops = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if let Some(name) = line.split_whitespace().next() {
            pops.push(name.to_string());
            progress.emit(ProgressEvent::category("pops", format!("Number of pops: {}", pops.len())));
        }
    }

    Ok(pops)
}

pub fn describe_file_size(path: &Path) -> Result<String, MixError> {
    let size = fs::metadata(path)?.len();
    Ok(human_bytes(size as f64))
}

fn trim_row(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &line[..end]
}

#[inline]
pub fn text_code(byte: u8) -> u8 {
    match byte {
        b'0' => 0,
        b'1' => 1,
        b'2' => 2,
        _ => MISSING,
    }
}

/// Genotype of individual `column` in a packed marker block. Each byte holds
/// four individuals, most significant bit pair first; pattern `11` is missing.
#[inline]
pub fn packed_code(block: &[u8], column: usize) -> u8 {
    let byte = block[column / 4];
    let shift = 6 - 2 * (column % 4);
    match (byte >> shift) & 0b11 {
        3 => MISSING,
        code => code,
    }
}

/// Unpacks every 2-bit field of a block, four individuals per byte.
pub fn decode_packed_block(block: &[u8]) -> Vec<u8> {
    (0..block.len() * 4).map(|column| packed_code(block, column)).collect()
}

/// Packs genotype codes into a block of `block_size` bytes; missing calls and
/// the unused tail are written as `11`.
pub fn encode_packed_block(codes: &[u8], block_size: usize) -> Vec<u8> {
    let mut block = vec![0xFFu8; block_size.max(codes.len().div_ceil(4))];
    for (column, &code) in codes.iter().enumerate() {
        let bits = if code > 2 { 0b11 } else { code };
        let shift = 6 - 2 * (column % 4);
        let byte = &mut block[column / 4];
        *byte = (*byte & !(0b11 << shift)) | (bits << shift);
    }
    block
}

/// A genotype file together with the layout needed to stream it.
#[derive(Debug, Clone)]
pub struct GenotypeSource {
    path: PathBuf,
    encoding: GenotypeEncoding,
    num_markers: usize,
    num_individuals: usize,
    block_size: usize,
}

impl GenotypeSource {
    pub fn text(path: impl Into<PathBuf>, shape: GenoShape) -> Self {
        GenotypeSource {
            path: path.into(),
            encoding: GenotypeEncoding::Text,
            num_markers: shape.rows,
            num_individuals: shape.columns,
            block_size: 0,
        }
    }

    pub fn packed(path: impl Into<PathBuf>, header: PackedHeader) -> Self {
        GenotypeSource {
            path: path.into(),
            encoding: GenotypeEncoding::Packed,
            num_markers: header.num_markers,
            num_individuals: header.num_individuals,
            block_size: header.block_size,
        }
    }

    pub fn num_markers(&self) -> usize {
        self.num_markers
    }

    pub fn num_individuals(&self) -> usize {
        self.num_individuals
    }

    /// Opens an independent read handle positioned at the first marker.
    pub fn open(&self) -> Result<GenotypeReader, MixError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        if self.encoding == GenotypeEncoding::Packed {
            reader.seek(SeekFrom::Start(self.block_size as u64))?;
        }
        Ok(GenotypeReader {
            reader,
            encoding: self.encoding,
            block: vec![0u8; self.block_size],
            line: Vec::new(),
            marker: 0,
        })
    }
}

/// Sequential marker-by-marker reader over one genotype file.
pub struct GenotypeReader {
    reader: BufReader<File>,
    encoding: GenotypeEncoding,
    block: Vec<u8>,
    line: Vec<u8>,
    marker: usize,
}

impl GenotypeReader {
    /// Reads the next marker and writes the codes of `columns` into `codes`.
    pub fn read_marker(&mut self, columns: &[usize], codes: &mut Vec<u8>) -> Result<(), MixError> {
        codes.clear();
        match self.encoding {
            GenotypeEncoding::Text => {
                self.line.clear();
                let n = self.reader.read_until(b'\n', &mut self.line)?;
                if n == 0 {
                    return Err(MixError::Format(format!(
                        "genotype file ended before marker {}",
                        self.marker
                    )));
                }
                let row = trim_row(&self.line);
                for &column in columns {
                    let byte = *row.get(column).ok_or_else(|| {
                        MixError::Format(format!(
                            "marker {} has {} columns, individual {} requested",
                            self.marker,
                            row.len(),
                            column
                        ))
                    })?;
                    codes.push(text_code(byte));
                }
            }
            GenotypeEncoding::Packed => {
                self.reader.read_exact(&mut self.block).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        MixError::Format(format!("truncated packed block for marker {}", self.marker))
                    } else {
                        MixError::Io(e)
                    }
                })?;
                for &column in columns {
                    if column / 4 >= self.block.len() {
                        return Err(MixError::Format(format!(
                            "individual {} lies outside the {}-byte packed block",
                            column,
                            self.block.len()
                        )));
                    }
                    codes.push(packed_code(&self.block, column));
                }
            }
        }
        self.marker += 1;
        Ok(())
    }
}
