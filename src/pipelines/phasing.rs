//! # Phasing Pipeline
//!
//! The windowed driver: streams marker records into overlapping windows,
//! runs the burn-in and main phasing iterations per window, completes
//! low-frequency markers in stage 2, and writes the spliced phased output
//! while carrying the trailing overlap into the next window.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::data::genetic_map::GeneticMaps;
use crate::data::gt::{GtRec, HapsGt, TargGt};
use crate::data::haplotype::{HapIdx, Samples};
use crate::data::marker::{ChromRegistry, Marker, MarkerIdx, Markers, PackedAlleles};
use crate::data::storage::RefColumn;
use crate::error::{HaploomError, Result};
use crate::io::bref3::Bref3Reader;
use crate::io::vcf::{ref_alleles, ChromInterval, VcfReader, VcfWriter};
use crate::io::window::{SlidingWindow, Window, WindowRec};
use crate::model::est_phase::EstPhase;
use crate::model::fixed_phase_data::FixedPhaseData;
use crate::model::hap_imputer::HapImputer;
use crate::model::impute_baum::ImputeBaum;
use crate::model::best_match::LowFreqPhaseIbs;
use crate::model::phase_baum::PhaseBaum1;
use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::{IbsHaps, PbwtPhaseIbs};
use crate::model::regress::{RecombRegress, Regress};

/// Reference record source: bref3 or phased VCF
enum RefReader {
    Bref(Bref3Reader),
    Vcf { reader: VcfReader, path: String },
}

impl RefReader {
    fn samples_arc(&self) -> Arc<Samples> {
        match self {
            Self::Bref(r) => r.samples_arc(),
            Self::Vcf { reader, .. } => reader.samples_arc(),
        }
    }

    fn next_rec(&mut self) -> Result<Option<(Marker, Arc<RefColumn>)>> {
        match self {
            Self::Bref(r) => r.next_rec(),
            Self::Vcf { reader, path } => match reader.next_rec()? {
                None => Ok(None),
                Some((marker, rec)) => {
                    let alleles = ref_alleles(&marker, &rec, path)?;
                    let col = Arc::new(RefColumn::from_alleles(&alleles, marker.n_alleles()));
                    Ok(Some((marker, col)))
                }
            },
        }
    }
}

/// Merges the target stream with the optional reference stream into
/// window records ordered by marker.
struct RecAligner {
    targ: VcfReader,
    ref_src: Option<RefReader>,
    pending_targ: Option<(Marker, GtRec)>,
    pending_ref: Option<(Marker, Arc<RefColumn>)>,
    started: bool,
    n_dropped_targ: usize,
}

impl RecAligner {
    fn new(targ: VcfReader, ref_src: Option<RefReader>) -> Self {
        Self {
            targ,
            ref_src,
            pending_targ: None,
            pending_ref: None,
            started: false,
            n_dropped_targ: 0,
        }
    }

    fn next_rec(&mut self) -> Result<Option<WindowRec>> {
        if !self.started {
            self.started = true;
            self.pending_targ = self.targ.next_rec()?;
            if let Some(ref_src) = self.ref_src.as_mut() {
                self.pending_ref = ref_src.next_rec()?;
            }
        }
        if self.ref_src.is_none() {
            let next = self.pending_targ.take();
            if let Some((marker, rec)) = next {
                self.pending_targ = self.targ.next_rec()?;
                return Ok(Some(WindowRec {
                    marker,
                    targ: Some(rec),
                    ref_col: None,
                }));
            }
            return Ok(None);
        }

        loop {
            use std::cmp::Ordering;
            let order = match (&self.pending_targ, &self.pending_ref) {
                // target markers drive the analysis: trailing
                // reference-only records are not emitted
                (None, _) => return Ok(None),
                // target marker beyond the end of the reference panel
                (Some(_), None) => Ordering::Less,
                (Some((tm, _)), Some((rm, _))) => tm.cmp(rm),
            };
            match order {
                Ordering::Equal => {
                    let (marker, rec) = self.pending_targ.take().expect("pending target record");
                    let (_, col) = self.pending_ref.take().expect("pending reference record");
                    self.pending_targ = self.targ.next_rec()?;
                    self.pending_ref =
                        self.ref_src.as_mut().expect("reference source").next_rec()?;
                    return Ok(Some(WindowRec {
                        marker,
                        targ: Some(rec),
                        ref_col: Some(col),
                    }));
                }
                Ordering::Greater => {
                    // reference-only marker
                    let (marker, col) = self.pending_ref.take().expect("pending reference record");
                    self.pending_ref =
                        self.ref_src.as_mut().expect("reference source").next_rec()?;
                    return Ok(Some(WindowRec {
                        marker,
                        targ: None,
                        ref_col: Some(col),
                    }));
                }
                Ordering::Less => {
                    // target marker absent from the reference panel
                    let (marker, _) = self.pending_targ.take().expect("pending target record");
                    self.drop_targ_marker(&marker);
                    self.pending_targ = self.targ.next_rec()?;
                }
            }
        }
    }

    fn drop_targ_marker(&mut self, marker: &Marker) {
        if self.n_dropped_targ == 0 {
            warn!(
                pos = marker.pos,
                "target markers absent from the reference panel are dropped"
            );
        }
        self.n_dropped_targ += 1;
    }
}

/// Windowed phasing driver
pub struct PhasingPipeline {
    config: Config,
}

impl PhasingPipeline {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run phasing over all windows and write the phased VCF
    pub fn run(&self) -> Result<()> {
        let config = &self.config;
        let registry = Arc::new(Mutex::new(ChromRegistry::new()));

        let gen_maps = Arc::new(match &config.map {
            Some(path) => GeneticMaps::from_plink_file_registry(path, &registry)?,
            None => GeneticMaps::new(),
        });

        let mut targ_reader = VcfReader::open(&config.gt, Arc::clone(&registry))?;
        targ_reader.set_exclude_samples(&config.load_exclude_samples()?);
        targ_reader.set_exclude_markers(config.load_exclude_markers()?);
        let interval = config
            .chrom
            .as_deref()
            .map(ChromInterval::parse)
            .transpose()?;
        targ_reader.set_interval(interval.clone());
        let targ_samples = targ_reader.samples_arc();
        if targ_samples.is_empty() {
            return Err(HaploomError::invalid_data("no target samples remain"));
        }

        let ref_src = match &config.r#ref {
            None => None,
            Some(path) => {
                let is_bref = path.extension().is_some_and(|e| e == "bref3");
                let reader = if is_bref {
                    RefReader::Bref(Bref3Reader::open(path, Arc::clone(&registry))?)
                } else {
                    let mut reader = VcfReader::open(path, Arc::clone(&registry))?;
                    reader.set_interval(interval.clone());
                    RefReader::Vcf {
                        reader,
                        path: path.display().to_string(),
                    }
                };
                Some(reader)
            }
        };
        let ref_samples = ref_src.as_ref().map(|r| r.samples_arc());
        if let Some(ref_samples) = &ref_samples {
            for id in targ_samples.ids() {
                if ref_samples.index_of(id).is_some() {
                    return Err(HaploomError::invalid_data(format!(
                        "sample {} appears in both the target and the reference panel",
                        id
                    )));
                }
            }
        }

        let mut aligner = RecAligner::new(targ_reader, ref_src);
        let source = std::iter::from_fn(move || aligner.next_rec().transpose());
        let mut sliding = SlidingWindow::new(
            source,
            Arc::clone(&gen_maps),
            Arc::clone(&targ_samples),
            ref_samples,
            Arc::clone(&registry),
            config.window,
            config.overlap,
        );

        let output_path = config.output_path();
        let mut writer = VcfWriter::create(&output_path, Arc::clone(&targ_samples))?;
        writer.write_header()?;

        let mut phased_overlap: Option<TargGt> = None;
        let mut n_windows = 0usize;
        let mut n_markers_out = 0usize;
        while let Some(window) = sliding.next_window()? {
            info!(
                window = window.index,
                markers = window.n_markers(),
                targ_markers = window.n_targ_markers(),
                "phasing window"
            );
            let window_seed = config.base_seed().wrapping_add(window.index as u64);
            let phased = self.phase_window(&gen_maps, &window, phased_overlap.take(), window_seed)?;

            let start = window.indices.prev_targ_splice();
            let end = window.indices.next_targ_splice();
            writer.write_phased(&phased, start, end)?;
            n_markers_out += end - start;
            n_windows += 1;

            if !window.last_on_chrom {
                phased_overlap = Some(restrict_haps(
                    &phased,
                    window.indices.next_targ_overlap(),
                    window.indices.next_targ_splice(),
                ));
            }
        }
        writer.finish()?;

        if n_windows == 0 {
            return Err(HaploomError::invalid_data("no markers found in input"));
        }
        info!(
            windows = n_windows,
            markers = n_markers_out,
            output = %output_path.display(),
            "phasing complete"
        );
        Ok(())
    }

    /// Phase one window and return phased haplotypes over all its target
    /// markers.
    fn phase_window(
        &self,
        gen_maps: &GeneticMaps,
        window: &Window,
        phased_overlap: Option<TargGt>,
        seed: u64,
    ) -> Result<HapsGt> {
        let config = &self.config;
        if window.targ_gt.is_phased() {
            return Ok(repack_phased(&window.targ_gt));
        }

        let fpd = FixedPhaseData::new(config, gen_maps, window, phased_overlap);
        let mut seed_rng = StdRng::seed_from_u64(seed);

        let mut recomb_factor = 0.04 * config.ne / fpd.n_haps() as f32;
        let est_seed = seed_rng.gen::<u64>();
        let mut est = EstPhase::new(
            fpd.hi_freq_targ_gt(),
            fpd.hi_freq_ref_gt(),
            fpd.hi_freq_overlap(),
            est_seed,
        );

        let n_its = config.burnin + config.iterations;
        for it in 0..n_its {
            let it_seed = seed_rng.gen::<u64>();
            let mut pd = PhaseData::new(&fpd, config, est.haps_gt(), recomb_factor, it, it_seed);
            let update_recomb = it + 1 == config.burnin || it == config.burnin;
            self.run_stage1(&mut pd, &mut est, update_recomb);
            recomb_factor = pd.recomb_factor();
            info!(
                it = it + 1,
                burnin = it < config.burnin,
                unphased = est.total_unphased(),
                "finished phasing iteration"
            );
        }
        debug_assert_eq!(est.total_unphased(), 0);

        if fpd.has_low_freq_markers() {
            let pd = PhaseData::new(&fpd, config, est.haps_gt(), recomb_factor, n_its, seed_rng.gen());
            Ok(self.run_stage2(&pd))
        } else {
            Ok(est.haps_gt())
        }
    }

    /// One stage-1 iteration: PBWT sweep, optional recombination-factor
    /// regression, then the parallel phase update over all samples.
    fn run_stage1(&self, pd: &mut PhaseData<'_>, est: &mut EstPhase, update_recomb: bool) {
        let use_bwd = pd.it() & 1 == 0;
        let ibs = PbwtPhaseIbs::new(pd, use_bwd);
        if update_recomb {
            self.update_recomb_factor(pd, est, &ibs);
        }
        let updates = {
            let pd: &PhaseData<'_> = pd;
            let est_ref: &EstPhase = est;
            let n_samples = est_ref.n_samples();
            (0..n_samples as u32)
                .into_par_iter()
                .map_init(
                    || PhaseBaum1::new(pd),
                    |baum, sample| baum.phase(sample, est_ref, &ibs),
                )
                .filter_map(|update| update)
                .collect::<Vec<_>>()
        };
        for update in updates {
            est.apply(update);
        }
    }

    /// Re-estimate the recombination factor by linear regression of the
    /// per-marker switch probability on genetic distance. Each worker is
    /// thread-confined and samples until its share of the target sum is
    /// reached; a non-positive or non-finite slope leaves the factor
    /// unchanged.
    fn update_recomb_factor(&self, pd: &mut PhaseData<'_>, est: &EstPhase, ibs: &dyn IbsHaps) {
        if pd.n_markers() < 2 {
            return;
        }
        let nthreads = self.config.nthreads();
        let max_sum_y = (5000.0 / nthreads as f64).max(200.0);
        // draw cap: keeps a degenerate panel with near-zero switch
        // probabilities from spinning forever
        let max_draws = 100_000usize;
        let regress = Regress::new();
        let n_samples = est.n_samples();
        {
            let pd_ref: &PhaseData<'_> = pd;
            (0..nthreads).into_par_iter().for_each(|j| {
                let mut rng = StdRng::seed_from_u64(pd_ref.seed().wrapping_add(j as u64));
                let mut rr = RecombRegress::new(pd_ref, &regress);
                let mut draws = 0;
                while rr.sum_y() < max_sum_y && draws < max_draws {
                    rr.update(rng.gen_range(0..n_samples) as u32, est, ibs);
                    draws += 1;
                }
            });
        }
        let beta = regress.beta() as f32;
        if beta > 0.0 && beta.is_finite() {
            info!(recomb_factor = beta, "updated recombination factor");
            pd.set_recomb_factor(beta);
        } else {
            warn!(beta, "no recombination factor update");
        }
    }

    /// Stage-2 completion: phase and impute the low-frequency markers
    fn run_stage2(&self, pd: &PhaseData<'_>) -> HapsGt {
        let ibs = LowFreqPhaseIbs::new(pd);
        let all_markers = Arc::new(pd.fpd().targ_gt().markers().clone());
        let samples = Arc::clone(pd.phased_targ().samples());
        let n_samples = samples.len();
        let mut imputer = HapImputer::new(all_markers, samples);

        let results = (0..n_samples as u32)
            .into_par_iter()
            .map_init(
                || ImputeBaum::new(pd),
                |baum, sample| baum.phase(sample, &ibs),
            )
            .collect::<Vec<_>>();
        for result in results {
            let h1 = result.sample << 1;
            imputer.set_hap(h1, &result.hap1);
            imputer.set_hap(h1 | 1, &result.hap2);
            let [partly1, partly2] = result.partly;
            imputer.set_partly_imputed(h1, partly1);
            imputer.set_partly_imputed(h1 | 1, partly2);
        }
        imputer.imputed_haps()
    }
}

/// Repack already-phased target genotypes as packed haplotypes
fn repack_phased(gt: &TargGt) -> HapsGt {
    let markers = Arc::new(gt.markers().clone());
    let n_markers = markers.len();
    let haps: Vec<Arc<PackedAlleles>> = (0..gt.n_haps() as u32)
        .map(|h| {
            let alleles: Vec<u8> = (0..n_markers)
                .map(|m| gt.allele(MarkerIdx::new(m as u32), HapIdx::new(h)))
                .collect();
            Arc::new(markers.alleles_to_bits(&alleles))
        })
        .collect();
    HapsGt::new(markers, Arc::clone(gt.samples()), haps)
}

/// Restrict phased haplotypes to markers `[start, end)` for the next
/// window's phased overlap.
fn restrict_haps(phased: &HapsGt, start: usize, end: usize) -> TargGt {
    let markers: &Markers = phased.markers();
    let restricted = Arc::new(markers.restrict_range(start, end));
    let haps: Vec<Arc<PackedAlleles>> = (0..phased.n_haps() as u32)
        .map(|h| {
            let alleles: Vec<u8> = (start..end)
                .map(|m| phased.allele(MarkerIdx::new(m as u32), HapIdx::new(h)))
                .collect();
            Arc::new(restricted.alleles_to_bits(&alleles))
        })
        .collect();
    TargGt::Haps(HapsGt::new(
        restricted,
        Arc::clone(phased.samples()),
        haps,
    ))
}
