//! # VCF Reading and Writing
//!
//! Hand-tokenised VCF 4.x input with a hard-called GT field first in
//! FORMAT, and VCF 4.2 phased output. Both sides speak BGZF through the
//! `noodles` bgzf codec; the writer emits the empty EOF block on finish.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use noodles::bgzf as bgzf_io;
use tracing::info;

use crate::data::gt::{GtRec, HapsGt};
use crate::data::haplotype::{SampleIdx, Samples};
use crate::data::marker::{Allele, ChromRegistry, Marker, MarkerIdx, Markers, MISSING_ALLELE};
use crate::error::{HaploomError, Result};

/// A `chrom` or `chrom:start-end` restriction
#[derive(Clone, Debug)]
pub struct ChromInterval {
    pub chrom: String,
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl ChromInterval {
    /// Parse a `chrom[:start-end]` argument
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None => Ok(Self {
                chrom: s.to_string(),
                start: None,
                end: None,
            }),
            Some((chrom, range)) => {
                let (start, end) = range.split_once('-').ok_or_else(|| {
                    HaploomError::config(format!("invalid chrom interval: {}", s))
                })?;
                let parse_bound = |v: &str| -> Result<Option<u32>> {
                    if v.is_empty() {
                        Ok(None)
                    } else {
                        v.parse()
                            .map(Some)
                            .map_err(|_| HaploomError::config(format!("invalid chrom interval: {}", s)))
                    }
                };
                Ok(Self {
                    chrom: chrom.to_string(),
                    start: parse_bound(start)?,
                    end: parse_bound(end)?,
                })
            }
        }
    }

    fn contains(&self, chrom: &str, pos: u32) -> bool {
        self.chrom == chrom
            && self.start.map_or(true, |s| pos >= s)
            && self.end.map_or(true, |e| pos <= e)
    }
}

/// Streaming VCF record reader
pub struct VcfReader {
    reader: Box<dyn BufRead + Send>,
    samples: Arc<Samples>,
    /// Sample column indices kept after exclusion (None = all)
    keep_cols: Option<Vec<usize>>,
    exclude_markers: HashSet<String>,
    interval: Option<ChromInterval>,
    registry: Arc<Mutex<ChromRegistry>>,
    line: String,
    line_num: usize,
    path: String,
}

impl VcfReader {
    /// Open a VCF file (plain or BGZF-compressed) and read its header
    pub fn open(path: &Path, registry: Arc<Mutex<ChromRegistry>>) -> Result<Self> {
        let file = File::open(path)?;
        let is_gzipped = path
            .extension()
            .map(|e| e == "gz" || e == "bgz")
            .unwrap_or(false);

        let reader: Box<dyn BufRead + Send> = if is_gzipped {
            Box::new(BufReader::new(bgzf_io::Reader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Self::from_reader(reader, registry, path.display().to_string())
    }

    /// Create from a buffered reader (header is consumed here)
    pub fn from_reader(
        mut reader: Box<dyn BufRead + Send>,
        registry: Arc<Mutex<ChromRegistry>>,
        path: String,
    ) -> Result<Self> {
        let mut line = String::new();
        let mut line_num = 0usize;
        let samples = loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(HaploomError::vcf(format!(
                    "{}: missing #CHROM header line",
                    path
                )));
            }
            line_num += 1;
            if line.starts_with("##") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#CHROM") {
                let fields: Vec<&str> = rest.trim_end().split('\t').collect();
                if fields.len() < 9 || fields[8] != "FORMAT" {
                    return Err(HaploomError::vcf(format!(
                        "{}: header line has no FORMAT/sample columns",
                        path
                    )));
                }
                break Arc::new(Samples::from_ids(fields[9..].iter().copied()));
            }
            return Err(HaploomError::vcf(format!(
                "{}: unexpected line before #CHROM header",
                path
            )));
        };

        info!(samples = samples.len(), file = %path, "opened VCF");
        Ok(Self {
            reader,
            samples,
            keep_cols: None,
            exclude_markers: HashSet::new(),
            interval: None,
            registry,
            line: String::new(),
            line_num,
            path,
        })
    }

    /// Exclude samples by identifier; the sample list shrinks accordingly
    pub fn set_exclude_samples(&mut self, exclude: &HashSet<String>) {
        if exclude.is_empty() {
            return;
        }
        let mut keep = Vec::new();
        let mut kept_ids = Vec::new();
        for (i, id) in self.samples.ids().iter().enumerate() {
            if !exclude.contains(id.as_ref()) {
                keep.push(i);
                kept_ids.push(id.to_string());
            }
        }
        self.samples = Arc::new(Samples::from_ids(kept_ids));
        self.keep_cols = Some(keep);
    }

    /// Exclude markers by identifier
    pub fn set_exclude_markers(&mut self, exclude: HashSet<String>) {
        self.exclude_markers = exclude;
    }

    /// Restrict records to a chromosome interval
    pub fn set_interval(&mut self, interval: Option<ChromInterval>) {
        self.interval = interval;
    }

    /// The (possibly filtered) sample list
    pub fn samples_arc(&self) -> Arc<Samples> {
        Arc::clone(&self.samples)
    }

    /// Read the next record passing all filters
    pub fn next_rec(&mut self) -> Result<Option<(Marker, GtRec)>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_num += 1;
            let line = self.line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rec) = self.parse_record(line)? {
                return Ok(Some(rec));
            }
        }
    }

    fn parse_record(&self, line: &str) -> Result<Option<(Marker, GtRec)>> {
        let mut fields = line.split('\t');
        let chrom = self.required(fields.next(), "CHROM")?;
        let pos: u32 = self
            .required(fields.next(), "POS")?
            .parse()
            .map_err(|_| self.rec_err("invalid POS"))?;
        let id_field = self.required(fields.next(), "ID")?;
        let ref_field = self.required(fields.next(), "REF")?;
        let alt_field = self.required(fields.next(), "ALT")?;
        let _qual = self.required(fields.next(), "QUAL")?;
        let _filter = self.required(fields.next(), "FILTER")?;
        let info = self.required(fields.next(), "INFO")?;
        let format = self.required(fields.next(), "FORMAT")?;

        // pre-tokenisation filters
        if let Some(interval) = &self.interval {
            if !interval.contains(chrom, pos) {
                return Ok(None);
            }
        }
        if !self.exclude_markers.is_empty()
            && id_field
                .split(';')
                .any(|id| self.exclude_markers.contains(id))
        {
            return Ok(None);
        }

        if format != "GT" && !format.starts_with("GT:") {
            return Err(self.rec_err("GT must be the first FORMAT field"));
        }
        if ref_field.is_empty() || ref_field == "." {
            return Err(self.rec_err("missing REF allele"));
        }

        let ids: Vec<Arc<str>> = if id_field == "." {
            Vec::new()
        } else {
            id_field.split(';').map(|s| s.into()).collect()
        };
        let mut alleles = vec![Allele::from_str(ref_field)];
        if alt_field != "." {
            alleles.extend(alt_field.split(',').map(Allele::from_str));
        }
        let n_alleles = alleles.len();
        let end = parse_info_end(info, || self.rec_err("invalid END field"))?;

        let chrom_idx = self
            .registry
            .lock()
            .expect("chromosome registry poisoned")
            .get_or_insert(chrom);
        let marker = Marker::with_end(chrom_idx, pos, end, ids, alleles);

        let n_cols = self.keep_cols.as_ref().map(|k| k.len()).unwrap_or(self.samples.len());
        let mut a1 = Vec::with_capacity(n_cols);
        let mut a2 = Vec::with_capacity(n_cols);
        let mut phased = Vec::with_capacity(n_cols);

        let mut col = 0usize;
        let mut kept = 0usize;
        for sample_field in fields {
            let keep = match &self.keep_cols {
                None => true,
                Some(keep_cols) => keep_cols.binary_search(&col).is_ok(),
            };
            col += 1;
            if !keep {
                continue;
            }
            kept += 1;
            let gt = sample_field.split(':').next().unwrap_or("");
            let (al1, al2, is_phased) = self.parse_gt(gt, n_alleles)?;
            a1.push(al1);
            a2.push(al2);
            phased.push(is_phased);
        }
        if kept != self.samples.len() {
            return Err(self.rec_err(format!(
                "expected {} genotype columns, found {}",
                self.samples.len(),
                kept
            )));
        }

        Ok(Some((marker, GtRec::new(a1, a2, phased))))
    }

    fn parse_gt(&self, gt: &str, n_alleles: usize) -> Result<(u8, u8, bool)> {
        let (left, right, is_phased) = match gt.split_once('|') {
            Some((l, r)) => (l, r, true),
            None => match gt.split_once('/') {
                Some((l, r)) => (l, r, false),
                // haploid genotypes count as phased homozygotes
                None => (gt, gt, true),
            },
        };
        let a1 = self.parse_allele(left, n_alleles)?;
        let a2 = self.parse_allele(right, n_alleles)?;
        // a missing genotype carries no phase information
        let is_phased = is_phased && a1 != MISSING_ALLELE && a2 != MISSING_ALLELE;
        Ok((a1, a2, is_phased))
    }

    fn parse_allele(&self, s: &str, n_alleles: usize) -> Result<u8> {
        if s == "." {
            return Ok(MISSING_ALLELE);
        }
        let allele: usize = s
            .parse()
            .map_err(|_| self.rec_err(format!("invalid allele index: {:?}", s)))?;
        if allele >= n_alleles {
            return Err(self.rec_err(format!("allele index {} out of range", allele)));
        }
        Ok(allele as u8)
    }

    fn required<'a>(&self, field: Option<&'a str>, name: &str) -> Result<&'a str> {
        field.ok_or_else(|| self.rec_err(format!("missing {} field", name)))
    }

    fn rec_err(&self, message: impl std::fmt::Display) -> HaploomError {
        HaploomError::vcf(format!(
            "{} line {}: {}",
            self.path, self.line_num, message
        ))
    }
}

impl Iterator for VcfReader {
    type Item = Result<(Marker, GtRec)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_rec().transpose()
    }
}

fn parse_info_end(
    info: &str,
    err: impl Fn() -> HaploomError,
) -> Result<Option<u32>> {
    for entry in info.split(';') {
        if let Some(value) = entry.strip_prefix("END=") {
            return value.parse().map(Some).map_err(|_| err());
        }
    }
    Ok(None)
}

/// BGZF-framed phased VCF writer
pub struct VcfWriter {
    writer: bgzf_io::Writer<File>,
    samples: Arc<Samples>,
    buf: String,
}

impl VcfWriter {
    /// Create the output file and remember the sample list
    pub fn create(path: &Path, samples: Arc<Samples>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: bgzf_io::Writer::new(file),
            samples,
            buf: String::new(),
        })
    }

    /// Write the meta lines and the #CHROM header
    pub fn write_header(&mut self) -> Result<()> {
        let mut header = String::new();
        header.push_str("##fileformat=VCFv4.2\n");
        header.push_str(concat!(
            "##source=haploom.v",
            env!("CARGO_PKG_VERSION"),
            "\n"
        ));
        header.push_str("##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n");
        header.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
        for id in self.samples.ids() {
            header.push('\t');
            header.push_str(id);
        }
        header.push('\n');
        self.writer.write_all(header.as_bytes())?;
        Ok(())
    }

    /// Write phased genotypes for markers `[start, end)`
    pub fn write_phased(&mut self, gt: &HapsGt, start: usize, end: usize) -> Result<()> {
        let markers: &Markers = gt.markers();
        for m in start..end {
            let idx = MarkerIdx::new(m as u32);
            self.buf.clear();
            self.format_record(markers, gt, idx)?;
            self.writer.write_all(self.buf.as_bytes())?;
        }
        Ok(())
    }

    fn format_record(&mut self, markers: &Markers, gt: &HapsGt, m: MarkerIdx) -> Result<()> {
        let marker = markers.marker(m);
        let buf = &mut self.buf;
        write!(buf, "{}\t{}\t", markers.chrom_name(marker.chrom), marker.pos).ok();
        if marker.ids.is_empty() {
            buf.push('.');
        } else {
            for (j, id) in marker.ids.iter().enumerate() {
                if j > 0 {
                    buf.push(';');
                }
                buf.push_str(id);
            }
        }
        write!(buf, "\t{}\t", marker.allele(0)).ok();
        if marker.n_alleles() == 1 {
            buf.push('.');
        } else {
            for a in 1..marker.n_alleles() {
                if a > 1 {
                    buf.push(',');
                }
                write!(buf, "{}", marker.allele(a)).ok();
            }
        }
        buf.push_str("\t.\tPASS\t");
        match marker.end {
            Some(end) => {
                write!(buf, "END={}", end).ok();
            }
            None => buf.push('.'),
        }
        buf.push_str("\tGT");
        for s in 0..self.samples.len() {
            let sample = SampleIdx::new(s as u32);
            let a1 = gt.allele(m, sample.hap1());
            let a2 = gt.allele(m, sample.hap2());
            write!(buf, "\t{}|{}", a1, a2).ok();
        }
        buf.push('\n');
        Ok(())
    }

    /// Flush all pending blocks and write the empty BGZF EOF block
    pub fn finish(self) -> Result<()> {
        self.writer.finish()?;
        Ok(())
    }
}

/// Convert a reference-panel record to haplotype alleles, verifying that it
/// is phased and non-missing.
pub fn ref_alleles(marker: &Marker, rec: &GtRec, path: &str) -> Result<Vec<u8>> {
    let n_samples = rec.n_samples();
    let mut alleles = Vec::with_capacity(2 * n_samples);
    for s in 0..n_samples {
        let sample = SampleIdx::new(s as u32);
        let a1 = rec.allele1(sample);
        let a2 = rec.allele2(sample);
        if a1 == MISSING_ALLELE || a2 == MISSING_ALLELE {
            return Err(HaploomError::invalid_data(format!(
                "{}: missing reference genotype at position {}",
                path, marker.pos
            )));
        }
        if !rec.is_phased(sample) {
            return Err(HaploomError::invalid_data(format!(
                "{}: unphased reference genotype at position {}",
                path, marker.pos
            )));
        }
        alleles.push(a1);
        alleles.push(a2);
    }
    Ok(alleles)
}
