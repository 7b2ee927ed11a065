//! # Sliding Window Infrastructure
//!
//! Streams ordered marker records into overlapping windows of `window` cM
//! with `overlap` cM shared between adjacent windows, and maps between
//! reference-marker and target-marker index spaces within each window.

use std::sync::{Arc, Mutex};

use crate::data::genetic_map::GeneticMaps;
use crate::data::gt::{BasicGt, GtRec, RefGt, TargGt};
use crate::data::haplotype::Samples;
use crate::data::marker::{ChromRegistry, Marker, Markers};
use crate::data::storage::RefColumn;
use crate::error::{HaploomError, Result};

/// One marker record entering the sliding window.
///
/// `targ` is `None` for markers absent from the target genotypes (present
/// only in the reference panel); `ref_col` is `None` when no reference
/// panel is in use.
#[derive(Clone, Debug)]
pub struct WindowRec {
    pub marker: Marker,
    pub targ: Option<GtRec>,
    pub ref_col: Option<Arc<RefColumn>>,
}

/// Bidirectional map between window marker indices and target marker
/// indices, with splice points for overlap handling.
#[derive(Clone, Debug)]
pub struct MarkerIndices {
    prev_splice: usize,
    next_overlap: usize,
    next_splice: usize,

    targ_to_ref: Vec<u32>,
    ref_to_targ: Vec<i32>,

    prev_targ_splice: usize,
    next_targ_overlap: usize,
    next_targ_splice: usize,
}

impl MarkerIndices {
    /// Construct from a target-membership mask and the overlap boundaries.
    ///
    /// `prev_overlap` is the exclusive end index of the leading region
    /// shared with the previous window; `next_overlap` is the inclusive
    /// start index of the trailing region shared with the next window
    /// (`in_targ.len()` when there is none).
    pub fn new(in_targ: &[bool], prev_overlap: usize, next_overlap: usize) -> Self {
        let n_markers = in_targ.len();
        assert!(prev_overlap <= n_markers, "prev_overlap out of range");
        assert!(next_overlap <= n_markers, "next_overlap out of range");
        assert!(
            prev_overlap <= next_overlap,
            "window shorter than its overlaps"
        );

        let prev_splice = prev_overlap / 2;
        let next_splice = (n_markers + next_overlap) / 2;

        let targ_to_ref: Vec<u32> = in_targ
            .iter()
            .enumerate()
            .filter(|(_, &t)| t)
            .map(|(m, _)| m as u32)
            .collect();
        let mut ref_to_targ = vec![-1i32; n_markers];
        for (t, &r) in targ_to_ref.iter().enumerate() {
            ref_to_targ[r as usize] = t as i32;
        }

        let prev_targ_splice = Self::targ_index(&targ_to_ref, prev_splice);
        let next_targ_overlap = Self::targ_index(&targ_to_ref, next_overlap);
        let next_targ_splice = Self::targ_index(&targ_to_ref, next_splice);

        Self {
            prev_splice,
            next_overlap,
            next_splice,
            targ_to_ref,
            ref_to_targ,
            prev_targ_splice,
            next_targ_overlap,
            next_targ_splice,
        }
    }

    /// First target marker index on or after the specified window marker
    fn targ_index(targ_to_ref: &[u32], marker: usize) -> usize {
        targ_to_ref.partition_point(|&r| (r as usize) < marker)
    }

    /// Number of window markers
    pub fn n_markers(&self) -> usize {
        self.ref_to_targ.len()
    }

    /// Number of target markers
    pub fn n_targ_markers(&self) -> usize {
        self.targ_to_ref.len()
    }

    /// Window marker index of the target marker with the given index
    pub fn targ_to_ref(&self, targ_marker: usize) -> usize {
        self.targ_to_ref[targ_marker] as usize
    }

    /// The full target-to-window index map
    pub fn targ_to_ref_all(&self) -> &[u32] {
        &self.targ_to_ref
    }

    /// Target marker index of a window marker, or -1 if it is not genotyped
    pub fn ref_to_targ(&self, marker: usize) -> i32 {
        self.ref_to_targ[marker]
    }

    /// First window marker index whose output belongs to this window
    pub fn prev_splice(&self) -> usize {
        self.prev_splice
    }

    /// First window marker index of the overlap with the next window
    pub fn next_overlap(&self) -> usize {
        self.next_overlap
    }

    /// Exclusive end window marker index of this window's output
    pub fn next_splice(&self) -> usize {
        self.next_splice
    }

    /// First target marker index whose output belongs to this window
    pub fn prev_targ_splice(&self) -> usize {
        self.prev_targ_splice
    }

    /// First target marker index of the overlap with the next window
    pub fn next_targ_overlap(&self) -> usize {
        self.next_targ_overlap
    }

    /// Exclusive end target marker index of this window's output
    pub fn next_targ_splice(&self) -> usize {
        self.next_targ_splice
    }
}

/// A marker window with its genotype data and index maps
#[derive(Clone, Debug)]
pub struct Window {
    /// 1-based window number
    pub index: usize,
    /// All window markers (reference marker space)
    pub markers: Markers,
    /// Target genotypes at the genotyped subset of markers
    pub targ_gt: TargGt,
    /// Reference genotypes at all window markers, if a panel is in use
    pub ref_gt: Option<RefGt>,
    /// Index maps and splice points
    pub indices: MarkerIndices,
    /// True if this is the last window on its chromosome
    pub last_on_chrom: bool,
}

impl Window {
    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn n_targ_markers(&self) -> usize {
        self.targ_gt.n_markers()
    }
}

/// Streams records from an ordered source into overlapping windows
pub struct SlidingWindow<I>
where
    I: Iterator<Item = Result<WindowRec>>,
{
    source: I,
    gen_maps: Arc<GeneticMaps>,
    targ_samples: Arc<Samples>,
    ref_samples: Option<Arc<Samples>>,
    registry: Arc<Mutex<ChromRegistry>>,
    window_cm: f64,
    overlap_cm: f64,
    /// Trailing overlap of the previous window, carried into the next
    carry: Vec<WindowRec>,
    /// Record pulled from the source but not yet placed in a window
    lookahead: Option<WindowRec>,
    window_index: usize,
    done: bool,
}

impl<I> SlidingWindow<I>
where
    I: Iterator<Item = Result<WindowRec>>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: I,
        gen_maps: Arc<GeneticMaps>,
        targ_samples: Arc<Samples>,
        ref_samples: Option<Arc<Samples>>,
        registry: Arc<Mutex<ChromRegistry>>,
        window_cm: f64,
        overlap_cm: f64,
    ) -> Self {
        Self {
            source,
            gen_maps,
            targ_samples,
            ref_samples,
            registry,
            window_cm,
            overlap_cm,
            carry: Vec::new(),
            lookahead: None,
            window_index: 0,
            done: false,
        }
    }

    fn pull(&mut self) -> Result<Option<WindowRec>> {
        if let Some(rec) = self.lookahead.take() {
            return Ok(Some(rec));
        }
        self.source.next().transpose()
    }

    /// Produce the next window, or `None` when the source is exhausted
    pub fn next_window(&mut self) -> Result<Option<Window>> {
        if self.done {
            return Ok(None);
        }

        let mut recs = std::mem::take(&mut self.carry);
        let prev_overlap = recs.len();
        let mut last_on_chrom = false;

        let first_rec = match recs.first() {
            Some(rec) => rec.marker.clone(),
            None => match self.pull()? {
                Some(rec) => {
                    let marker = rec.marker.clone();
                    recs.push(rec);
                    marker
                }
                None => {
                    self.done = true;
                    return Ok(None);
                }
            },
        };
        let chrom = first_rec.chrom;
        let start_cm = self.gen_maps.gen_pos(chrom, first_rec.pos);
        let mut last_pos = recs.last().map(|r| r.marker.pos).unwrap_or(0);

        loop {
            match self.pull()? {
                None => {
                    self.done = true;
                    last_on_chrom = true;
                    break;
                }
                Some(rec) => {
                    if rec.marker.chrom != chrom {
                        self.lookahead = Some(rec);
                        last_on_chrom = true;
                        break;
                    }
                    if rec.marker.pos < last_pos {
                        return Err(HaploomError::invalid_data(format!(
                            "marker positions out of order at position {}",
                            rec.marker.pos
                        )));
                    }
                    let cm = self.gen_maps.gen_pos(chrom, rec.marker.pos);
                    if cm - start_cm > self.window_cm {
                        self.lookahead = Some(rec);
                        break;
                    }
                    last_pos = rec.marker.pos;
                    recs.push(rec);
                }
            }
        }

        let n = recs.len();
        let next_overlap = if last_on_chrom {
            self.carry.clear();
            n
        } else {
            let end_cm = self.gen_maps.gen_pos(chrom, last_pos);
            let overlap_start = recs.partition_point(|r| {
                end_cm - self.gen_maps.gen_pos(chrom, r.marker.pos) > self.overlap_cm
            });
            // the next window must start strictly inside this one
            let overlap_start = overlap_start.max(prev_overlap + 1).min(n);
            self.carry = recs[overlap_start..].to_vec();
            overlap_start
        };

        self.window_index += 1;
        let window = self.build_window(recs, prev_overlap, next_overlap, last_on_chrom)?;
        Ok(Some(window))
    }

    fn build_window(
        &self,
        recs: Vec<WindowRec>,
        prev_overlap: usize,
        next_overlap: usize,
        last_on_chrom: bool,
    ) -> Result<Window> {
        let has_ref = self.ref_samples.is_some();
        let chrom_names = self
            .registry
            .lock()
            .expect("chromosome registry poisoned")
            .names();
        let mut markers = Markers::from_vec(Vec::new(), chrom_names.clone());
        let mut in_targ = Vec::with_capacity(recs.len());
        let mut targ_markers = Markers::from_vec(Vec::new(), chrom_names);
        let mut targ_recs = Vec::new();
        let mut ref_recs = Vec::with_capacity(recs.len());

        for rec in recs {
            in_targ.push(rec.targ.is_some());
            if let Some(gt_rec) = rec.targ {
                targ_markers.push(rec.marker.clone());
                targ_recs.push(gt_rec);
            }
            if has_ref {
                let col = rec.ref_col.ok_or_else(|| {
                    HaploomError::invalid_data(format!(
                        "missing reference record at position {}",
                        rec.marker.pos
                    ))
                })?;
                ref_recs.push(col);
            }
            markers.push(rec.marker);
        }

        if targ_recs.is_empty() {
            return Err(HaploomError::invalid_data(
                "window contains no target markers",
            ));
        }

        let indices = MarkerIndices::new(&in_targ, prev_overlap, next_overlap);
        let targ_gt = TargGt::Basic(Arc::new(BasicGt::new(
            targ_markers,
            Arc::clone(&self.targ_samples),
            targ_recs,
        )));
        let ref_gt = self
            .ref_samples
            .as_ref()
            .map(|samples| RefGt::new(markers.clone(), Arc::clone(samples), ref_recs));

        Ok(Window {
            index: self.window_index,
            markers,
            targ_gt,
            ref_gt,
            indices,
            last_on_chrom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::marker::{Allele, ChromIdx, MarkerIdx};

    fn rec(chrom: u16, pos: u32) -> WindowRec {
        let marker = Marker::new(
            ChromIdx(chrom),
            pos,
            Vec::new(),
            vec![Allele::Base(0), Allele::Base(1)],
        );
        WindowRec {
            marker,
            targ: Some(GtRec::new(vec![0, 1], vec![1, 0], vec![false, false])),
            ref_col: None,
        }
    }

    fn window_stream(
        recs: Vec<WindowRec>,
        window_cm: f64,
        overlap_cm: f64,
    ) -> SlidingWindow<impl Iterator<Item = Result<WindowRec>>> {
        let samples = Arc::new(Samples::from_ids(["S1", "S2"]));
        let mut registry = ChromRegistry::new();
        registry.get_or_insert("chr1");
        registry.get_or_insert("chr2");
        SlidingWindow::new(
            recs.into_iter().map(Ok),
            Arc::new(GeneticMaps::new()),
            samples,
            None,
            Arc::new(Mutex::new(registry)),
            window_cm,
            overlap_cm,
        )
    }

    #[test]
    fn test_marker_indices_round_trip() {
        let in_targ = vec![true, false, true, true, false, true];
        let mi = MarkerIndices::new(&in_targ, 0, 6);
        assert_eq!(mi.n_targ_markers(), 4);
        for t in 0..mi.n_targ_markers() {
            assert_eq!(mi.ref_to_targ(mi.targ_to_ref(t)), t as i32);
        }
        for m in 0..in_targ.len() {
            assert_eq!(in_targ[m], mi.ref_to_targ(m) >= 0);
        }
    }

    #[test]
    fn test_splice_points() {
        let in_targ = vec![true; 10];
        let mi = MarkerIndices::new(&in_targ, 4, 8);
        assert_eq!(mi.prev_splice(), 2);
        assert_eq!(mi.next_splice(), 9);
        assert!(mi.prev_splice() <= mi.next_splice());
        assert!(mi.next_splice() <= mi.n_markers());
        // identity mask: target coordinates equal window coordinates
        assert_eq!(mi.prev_targ_splice(), 2);
        assert_eq!(mi.next_targ_splice(), 9);
    }

    #[test]
    fn test_single_window() {
        // 1 cM/Mb default rate: 10 markers over 0.9 cM
        let recs: Vec<WindowRec> = (0..10).map(|i| rec(0, 1_000_000 + i * 100_000)).collect();
        let mut sw = window_stream(recs, 40.0, 4.0);

        let w = sw.next_window().unwrap().unwrap();
        assert_eq!(w.n_markers(), 10);
        assert!(w.last_on_chrom);
        assert_eq!(w.indices.prev_splice(), 0);
        assert_eq!(w.indices.next_splice(), 10);
        assert!(sw.next_window().unwrap().is_none());
    }

    #[test]
    fn test_overlapping_windows() {
        // markers every 0.5 cM over 30 cM; 10 cM windows with 2 cM overlap
        let recs: Vec<WindowRec> = (0..60).map(|i| rec(0, 1_000_000 + i * 500_000)).collect();
        let mut sw = window_stream(recs, 10.0, 2.0);

        let w1 = sw.next_window().unwrap().unwrap();
        assert!(!w1.last_on_chrom);
        let n1 = w1.n_markers();
        let next_overlap_count = n1 - w1.indices.next_overlap();
        assert!(next_overlap_count >= 4, "expected ~2 cM of trailing overlap");

        let w2 = sw.next_window().unwrap().unwrap();
        // the leading markers of w2 are the trailing markers of w1
        let w1_tail = w1.markers.marker(MarkerIdx((w1.indices.next_overlap()) as u32));
        let w2_head = w2.markers.marker(MarkerIdx(0));
        assert_eq!(w1_tail.pos, w2_head.pos);
        assert_eq!(
            w2.indices.prev_splice(),
            next_overlap_count / 2,
            "prev splice is the overlap midpoint"
        );
    }

    #[test]
    fn test_chromosome_break() {
        let mut recs: Vec<WindowRec> = (0..5).map(|i| rec(0, 1_000_000 + i * 100_000)).collect();
        recs.extend((0..5).map(|i| rec(1, 2_000_000 + i * 100_000)));
        let mut sw = window_stream(recs, 40.0, 4.0);

        let w1 = sw.next_window().unwrap().unwrap();
        assert_eq!(w1.n_markers(), 5);
        assert!(w1.last_on_chrom);
        assert_eq!(w1.indices.next_overlap(), 5);

        let w2 = sw.next_window().unwrap().unwrap();
        assert_eq!(w2.n_markers(), 5);
        assert_eq!(w2.markers.marker(MarkerIdx(0)).chrom, ChromIdx(1));
        assert_eq!(w2.indices.prev_splice(), 0);
    }

    #[test]
    fn test_non_monotone_positions_fatal() {
        let recs = vec![rec(0, 2_000_000), rec(0, 1_000_000)];
        let mut sw = window_stream(recs, 40.0, 4.0);
        assert!(sw.next_window().is_err());
    }
}
