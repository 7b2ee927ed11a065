//! # Binary Reference Codec
//!
//! Random-access readable reference panel format. The file carries a
//! sample table followed by per-chromosome blocks of marker records; each
//! record is tagged dense (packed allele bits for all haplotypes) or
//! sparse (major allele plus sorted carrier lists per minor allele).
//!
//! Layout (all integers little-endian):
//! - magic `u32`, format version `u8`
//! - sample count `u32`, then length-prefixed UTF-8 sample ids
//! - blocks: chrom name, record count `u32`, records; a record count of 0
//!   terminates the file
//! - record: pos `u32`, END flag/value, id list, allele strings,
//!   flag byte (0 = dense, 1 = sparse), payload

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};

use crate::data::haplotype::Samples;
use crate::data::marker::{Allele, ChromIdx, ChromRegistry, Marker};
use crate::data::storage::{DenseRec, RefColumn, SparseRec};
use crate::error::Result;

/// File magic: "HPLM" read as a little-endian u32
const MAGIC: u32 = 0x4D4C5048;

/// Format version
const VERSION: u8 = 3;

/// Dense record flag
const DENSE: u8 = 0;

/// Sparse record flag
const SPARSE: u8 = 1;

/// Records per block written by `Bref3Writer`
const BLOCK_SIZE: usize = 500;

/// Reader for the binary reference format
pub struct Bref3Reader {
    reader: BufReader<File>,
    samples: Arc<Samples>,
    n_haps: usize,
    registry: Arc<Mutex<ChromRegistry>>,
    /// Records remaining in the current block
    block_remaining: u32,
    /// Chromosome of the current block
    block_chrom: ChromIdx,
    finished: bool,
    path: String,
}

impl Bref3Reader {
    /// Open a file and read its header
    pub fn open(path: &Path, registry: Arc<Mutex<ChromRegistry>>) -> Result<Self> {
        let inner = || -> anyhow::Result<Self> {
            let file = File::open(path).context("failed to open reference file")?;
            let mut reader = BufReader::new(file);

            let magic = read_u32(&mut reader)?;
            if magic != MAGIC {
                bail!("bad magic number {magic:#x} (not a bref3 file)");
            }
            let version = read_u8(&mut reader)?;
            if version != VERSION {
                bail!("unsupported bref3 version {version}");
            }

            let n_samples = read_u32(&mut reader)? as usize;
            let mut ids = Vec::with_capacity(n_samples);
            for _ in 0..n_samples {
                ids.push(read_string(&mut reader)?);
            }
            let samples = Arc::new(Samples::from_ids(ids));
            let n_haps = samples.n_haps();

            Ok(Bref3Reader {
                reader,
                samples,
                n_haps,
                registry,
                block_remaining: 0,
                block_chrom: ChromIdx(0),
                finished: false,
                path: path.display().to_string(),
            })
        };
        inner().map_err(|e| crate::error::HaploomError::bref(format!("{}: {e:#}", path.display())))
    }

    /// The reference sample list
    pub fn samples_arc(&self) -> Arc<Samples> {
        Arc::clone(&self.samples)
    }

    /// Number of reference haplotypes
    pub fn n_haps(&self) -> usize {
        self.n_haps
    }

    /// Read the next record, or `None` at end of data
    pub fn next_rec(&mut self) -> Result<Option<(Marker, Arc<RefColumn>)>> {
        if self.finished {
            return Ok(None);
        }
        let rec = self
            .read_rec()
            .map_err(|e| crate::error::HaploomError::bref(format!("{}: {e:#}", self.path)))?;
        Ok(rec)
    }

    fn read_rec(&mut self) -> anyhow::Result<Option<(Marker, Arc<RefColumn>)>> {
        while self.block_remaining == 0 {
            let chrom_name = read_string(&mut self.reader).context("block header")?;
            let n_recs = read_u32(&mut self.reader).context("block record count")?;
            if n_recs == 0 {
                self.finished = true;
                return Ok(None);
            }
            self.block_chrom = self
                .registry
                .lock()
                .expect("chromosome registry poisoned")
                .get_or_insert(&chrom_name);
            self.block_remaining = n_recs;
        }
        self.block_remaining -= 1;

        let reader = &mut self.reader;
        let pos = read_u32(reader)?;
        let end = match read_u8(reader)? {
            0 => None,
            _ => Some(read_u32(reader)?),
        };
        let n_ids = read_u8(reader)? as usize;
        let mut ids = Vec::with_capacity(n_ids);
        for _ in 0..n_ids {
            ids.push(Arc::from(read_string(reader)?));
        }
        let n_alleles = read_u16(reader)? as usize;
        if n_alleles == 0 {
            bail!("record at position {pos} has no alleles");
        }
        let mut alleles = Vec::with_capacity(n_alleles);
        for _ in 0..n_alleles {
            alleles.push(Allele::from_str(&read_string(reader)?));
        }
        let marker = Marker::with_end(self.block_chrom, pos, end, ids, alleles);

        let flag = read_u8(reader)?;
        let col = match flag {
            DENSE => {
                let n_words = read_u32(reader)? as usize;
                let expected =
                    (self.n_haps * marker.bits_per_allele() as usize).div_ceil(64);
                if n_words != expected {
                    bail!("dense record at position {pos} has {n_words} words, expected {expected}");
                }
                let mut words = Vec::with_capacity(n_words);
                for _ in 0..n_words {
                    words.push(read_u64(reader)?);
                }
                RefColumn::Dense(DenseRec::from_raw(words, n_alleles, self.n_haps))
            }
            SPARSE => {
                let major = read_u8(reader)?;
                if major as usize >= n_alleles {
                    bail!("sparse record at position {pos} has invalid major allele {major}");
                }
                let mut carriers = vec![Vec::new(); n_alleles];
                for (allele, list) in carriers.iter_mut().enumerate() {
                    if allele == major as usize {
                        continue;
                    }
                    let count = read_u32(reader)? as usize;
                    let mut haps = Vec::with_capacity(count);
                    for _ in 0..count {
                        let h = read_u32(reader)?;
                        if h as usize >= self.n_haps {
                            bail!("carrier index {h} out of range at position {pos}");
                        }
                        haps.push(h);
                    }
                    if haps.windows(2).any(|w| w[0] >= w[1]) {
                        bail!("unsorted carrier list at position {pos}");
                    }
                    *list = haps;
                }
                RefColumn::Sparse(SparseRec::from_carriers(major, carriers, self.n_haps as u32))
            }
            other => bail!("unknown record flag {other} at position {pos}"),
        };

        Ok(Some((marker, Arc::new(col))))
    }
}

impl Iterator for Bref3Reader {
    type Item = Result<(Marker, Arc<RefColumn>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_rec().transpose()
    }
}

/// Writer for the binary reference format
pub struct Bref3Writer {
    writer: BufWriter<File>,
    n_haps: usize,
    /// Buffered records of the current block
    block: Vec<u8>,
    block_count: u32,
    block_chrom: Option<String>,
}

impl Bref3Writer {
    /// Create a file and write its header
    pub fn create(path: &Path, samples: &Samples) -> Result<Self> {
        let inner = || -> anyhow::Result<Self> {
            let file = File::create(path).context("failed to create output file")?;
            let mut writer = BufWriter::new(file);
            write_u32(&mut writer, MAGIC)?;
            write_u8(&mut writer, VERSION)?;
            write_u32(&mut writer, samples.len() as u32)?;
            for id in samples.ids() {
                write_string(&mut writer, id)?;
            }
            Ok(Bref3Writer {
                writer,
                n_haps: samples.n_haps(),
                block: Vec::new(),
                block_count: 0,
                block_chrom: None,
            })
        };
        inner().map_err(|e| crate::error::HaploomError::bref(format!("{}: {e:#}", path.display())))
    }

    /// Append a record
    pub fn write_rec(&mut self, chrom_name: &str, marker: &Marker, col: &RefColumn) -> Result<()> {
        self.write_rec_inner(chrom_name, marker, col)
            .map_err(|e| crate::error::HaploomError::bref(format!("{e:#}")))
    }

    fn write_rec_inner(
        &mut self,
        chrom_name: &str,
        marker: &Marker,
        col: &RefColumn,
    ) -> anyhow::Result<()> {
        if col.n_haplotypes() != self.n_haps {
            bail!(
                "record at position {} has {} haplotypes, expected {}",
                marker.pos,
                col.n_haplotypes(),
                self.n_haps
            );
        }
        let chrom_changed = self.block_chrom.as_deref() != Some(chrom_name);
        if chrom_changed || self.block_count as usize >= BLOCK_SIZE {
            self.flush_block()?;
            self.block_chrom = Some(chrom_name.to_string());
        }

        let buf = &mut self.block;
        buf.extend_from_slice(&marker.pos.to_le_bytes());
        match marker.end {
            None => buf.push(0),
            Some(end) => {
                buf.push(1);
                buf.extend_from_slice(&end.to_le_bytes());
            }
        }
        buf.push(marker.ids.len() as u8);
        for id in &marker.ids {
            append_string(buf, id);
        }
        buf.extend_from_slice(&(marker.n_alleles() as u16).to_le_bytes());
        for allele in marker.alleles() {
            append_string(buf, &allele.to_string());
        }
        match col {
            RefColumn::Dense(rec) => {
                buf.push(DENSE);
                let words = rec.as_raw_slice();
                buf.extend_from_slice(&(words.len() as u32).to_le_bytes());
                for &w in words {
                    buf.extend_from_slice(&w.to_le_bytes());
                }
            }
            RefColumn::Sparse(rec) => {
                buf.push(SPARSE);
                buf.push(rec.major_allele());
                for allele in 0..rec.n_alleles() {
                    if allele == rec.major_allele() as usize {
                        continue;
                    }
                    let list = rec.carriers(allele as u8);
                    buf.extend_from_slice(&(list.len() as u32).to_le_bytes());
                    for &h in list {
                        buf.extend_from_slice(&h.to_le_bytes());
                    }
                }
            }
        }
        self.block_count += 1;
        Ok(())
    }

    fn flush_block(&mut self) -> anyhow::Result<()> {
        if self.block_count > 0 {
            let chrom = self.block_chrom.as_deref().expect("block without chromosome");
            write_string(&mut self.writer, chrom)?;
            write_u32(&mut self.writer, self.block_count)?;
            self.writer.write_all(&self.block)?;
            self.block.clear();
            self.block_count = 0;
        }
        Ok(())
    }

    /// Flush the final block and write the end-of-data sentinel
    pub fn finish(mut self) -> Result<()> {
        (|| -> anyhow::Result<()> {
            self.flush_block()?;
            // terminating block: empty chromosome name, zero records
            write_string(&mut self.writer, "")?;
            write_u32(&mut self.writer, 0)?;
            self.writer.flush()?;
            Ok(())
        })()
        .map_err(|e| crate::error::HaploomError::bref(format!("{e:#}")))
    }
}

fn read_u8<R: Read>(reader: &mut R) -> anyhow::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> anyhow::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> anyhow::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> anyhow::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> anyhow::Result<String> {
    let len = read_u16(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).context("invalid UTF-8 in bref3 string")
}

fn write_u8<W: Write>(writer: &mut W, v: u8) -> anyhow::Result<()> {
    writer.write_all(&[v])?;
    Ok(())
}

fn write_u32<W: Write>(writer: &mut W, v: u32) -> anyhow::Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> anyhow::Result<()> {
    if s.len() > u16::MAX as usize {
        bail!("string too long for bref3 encoding");
    }
    writer.write_all(&(s.len() as u16).to_le_bytes())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

fn append_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::haplotype::HapIdx;
    use crate::data::marker::MarkerIdx;
    use crate::data::marker::Markers;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("haploom_bref3_{}_{}.bref3", tag, std::process::id()));
        path
    }

    fn test_panel(n_markers: usize, n_samples: usize) -> (Markers, Samples, Vec<RefColumn>) {
        let ids: Vec<String> = (0..n_samples).map(|s| format!("R{}", s)).collect();
        let samples = Samples::from_ids(&ids);
        let n_haps = samples.n_haps();
        let mut markers = Markers::new();
        markers.add_chrom("chr7");
        let mut cols = Vec::with_capacity(n_markers);
        for m in 0..n_markers {
            let n_alleles = if m % 5 == 0 { 3 } else { 2 };
            let alleles = (0..n_alleles as u8).map(Allele::Base).collect();
            markers.push(Marker::new(ChromIdx(0), (m as u32 + 1) * 50, Vec::new(), alleles));
            let rec_alleles: Vec<u8> = (0..n_haps)
                .map(|h| {
                    if m % 3 == 0 {
                        // rare column: a couple of carriers
                        u8::from(h == m % n_haps || h == (m + 7) % n_haps)
                    } else {
                        ((h * 31 + m * 17) % n_alleles) as u8
                    }
                })
                .collect();
            cols.push(RefColumn::from_alleles(&rec_alleles, n_alleles));
        }
        (markers, samples, cols)
    }

    #[test]
    fn test_round_trip() {
        let (markers, samples, cols) = test_panel(40, 25);
        let path = temp_path("round_trip");

        let mut writer = Bref3Writer::create(&path, &samples).unwrap();
        for (m, col) in cols.iter().enumerate() {
            writer.write_rec("chr7", markers.marker(MarkerIdx(m as u32)), col).unwrap();
        }
        writer.finish().unwrap();

        let registry = Arc::new(Mutex::new(ChromRegistry::new()));
        let mut reader = Bref3Reader::open(&path, registry).unwrap();
        assert_eq!(reader.samples_arc().len(), 25);

        for m in 0..cols.len() {
            let (marker, col) = reader.next_rec().unwrap().unwrap();
            let expected = markers.marker(MarkerIdx(m as u32));
            assert_eq!(marker.pos, expected.pos);
            assert_eq!(marker.n_alleles(), expected.n_alleles());
            for h in 0..samples.n_haps() {
                assert_eq!(
                    col.get(HapIdx::new(h as u32)),
                    cols[m].get(HapIdx::new(h as u32)),
                    "allele mismatch at marker {} hap {}",
                    m,
                    h
                );
            }
        }
        assert!(reader.next_rec().unwrap().is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let path = temp_path("bad_magic");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let registry = Arc::new(Mutex::new(ChromRegistry::new()));
        assert!(Bref3Reader::open(&path, registry).is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_block_boundaries() {
        // more records than one block to exercise multi-block reads
        let (markers, samples, cols) = test_panel(3, 4);
        let path = temp_path("blocks");
        let mut writer = Bref3Writer::create(&path, &samples).unwrap();
        // interleave chromosomes to force block breaks
        writer.write_rec("chr7", markers.marker(MarkerIdx(0)), &cols[0]).unwrap();
        writer.write_rec("chr8", markers.marker(MarkerIdx(1)), &cols[1]).unwrap();
        writer.write_rec("chr8", markers.marker(MarkerIdx(2)), &cols[2]).unwrap();
        writer.finish().unwrap();

        let registry = Arc::new(Mutex::new(ChromRegistry::new()));
        let reader = Bref3Reader::open(&path, Arc::clone(&registry)).unwrap();
        let recs: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(recs.len(), 3);
        assert_ne!(recs[0].0.chrom, recs[1].0.chrom);
        assert_eq!(recs[1].0.chrom, recs[2].0.chrom);
        std::fs::remove_file(&path).ok();
    }
}
