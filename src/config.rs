//! # Configuration Logic
//!
//! CLI argument parsing and validation using clap derive.

use clap::Parser;
use std::path::{Path, PathBuf};

use crate::error::{HaploomError, Result};

/// Default value of the `phase-states` parameter; the ratio of the actual
/// value to this default is the scale factor applied to coded steps.
const DEFAULT_PHASE_STATES: usize = 280;

/// Haploom: statistical phasing of diploid genotypes
#[derive(Parser, Debug, Clone)]
#[command(name = "haploom")]
#[command(version = "0.1.0")]
#[command(about = "Statistical phasing of diploid genotypes", long_about = None)]
pub struct Config {
    // ============ Data Parameters ============
    /// Input VCF file with a GT FORMAT field (required)
    #[arg(long, value_name = "FILE")]
    pub gt: PathBuf,

    /// Reference panel (bref3 or VCF file with phased genotypes)
    #[arg(long, value_name = "FILE")]
    pub r#ref: Option<PathBuf>,

    /// Output file prefix (required)
    #[arg(long, short, value_name = "PREFIX")]
    pub out: PathBuf,

    /// PLINK map file with cM units
    #[arg(long, value_name = "FILE")]
    pub map: Option<PathBuf>,

    /// Chromosome or region [chrom] or [chrom]:[start]-[end]
    #[arg(long, value_name = "REGION")]
    pub chrom: Option<String>,

    /// File with sample IDs to exclude (one per line)
    #[arg(long, value_name = "FILE")]
    pub excludesamples: Option<PathBuf>,

    /// File with marker IDs to exclude (one per line)
    #[arg(long, value_name = "FILE")]
    pub excludemarkers: Option<PathBuf>,

    // ============ Phasing Parameters ============
    /// Burn-in iterations
    #[arg(long, default_value = "6")]
    pub burnin: usize,

    /// Phasing iterations
    #[arg(long, default_value = "12")]
    pub iterations: usize,

    /// Model states for phasing
    #[arg(long = "phase-states", default_value = "280")]
    pub phase_states: usize,

    /// Coded-step length in cM
    #[arg(long = "phase-step", default_value = "0.006")]
    pub phase_step: f64,

    /// Rare variant frequency threshold
    #[arg(long, default_value = "0.0015")]
    pub rare: f32,

    // ============ Imputation Parameters ============
    /// Impute ungenotyped markers
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    pub impute: bool,

    /// Model states for imputation
    #[arg(long = "imp-states", default_value = "1600")]
    pub imp_states: usize,

    /// Imputation segment length in cM
    #[arg(long = "imp-segment", default_value = "6.0")]
    pub imp_segment: f32,

    /// Imputation step size in cM
    #[arg(long = "imp-step", default_value = "0.1")]
    pub imp_step: f32,

    /// Number of imputation steps per segment
    #[arg(long = "imp-nsteps", default_value = "7")]
    pub imp_nsteps: usize,

    /// Maximum cM in a marker cluster
    #[arg(long, default_value = "0.005")]
    pub cluster: f32,

    /// Print posterior allele probabilities
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, value_name = "BOOL")]
    pub ap: bool,

    /// Print posterior genotype probabilities
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, value_name = "BOOL")]
    pub gp: bool,

    // ============ General Parameters ============
    /// Effective population size
    #[arg(long, default_value = "1000000")]
    pub ne: f32,

    /// Allele mismatch probability (data-dependent if not specified)
    #[arg(long)]
    pub err: Option<f32>,

    /// Window length in cM
    #[arg(long, default_value = "40.0")]
    pub window: f64,

    /// Window overlap in cM
    #[arg(long, default_value = "4.0")]
    pub overlap: f64,

    /// PBWT buffer length in cM
    #[arg(long, default_value = "0.6")]
    pub buffer: f64,

    /// Random seed for reproducibility
    #[arg(long, default_value = "-99999", allow_hyphen_values = true)]
    pub seed: i64,

    /// Number of threads (default: all available cores)
    #[arg(long)]
    pub nthreads: Option<usize>,
}

impl Config {
    /// Parse command line arguments and validate
    pub fn parse_and_validate() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if !self.gt.exists() {
            return Err(HaploomError::FileNotFound {
                path: self.gt.clone(),
            });
        }
        if let Some(ref ref_path) = self.r#ref {
            if !ref_path.exists() {
                return Err(HaploomError::FileNotFound {
                    path: ref_path.clone(),
                });
            }
        }
        if let Some(ref map_path) = self.map {
            if !map_path.exists() {
                return Err(HaploomError::FileNotFound {
                    path: map_path.clone(),
                });
            }
        }

        if 1.1 * self.overlap >= self.window {
            return Err(HaploomError::config(
                "the 'window' parameter must be at least 1.1 times the 'overlap' parameter",
            ));
        }
        if self.ne <= 0.0 {
            return Err(HaploomError::config(
                "effective population size (ne) must be positive",
            ));
        }
        if self.phase_step <= 0.0 || !self.phase_step.is_finite() {
            return Err(HaploomError::config(
                "the 'phase-step' parameter must be a positive finite number",
            ));
        }
        if self.phase_states < 1 {
            return Err(HaploomError::config(
                "the 'phase-states' parameter must be at least 1",
            ));
        }
        if self.buffer < 0.0 {
            return Err(HaploomError::config(
                "the 'buffer' parameter cannot be negative",
            ));
        }
        if let Some(err) = self.err {
            if !(0.0..=1.0).contains(&err) {
                return Err(HaploomError::config(
                    "the 'err' parameter must be between 0.0 and 1.0",
                ));
            }
        }

        if self.out.is_dir() {
            return Err(HaploomError::config(format!(
                "'out' parameter cannot be a directory: {:?}",
                self.out
            )));
        }
        let output = self.output_path();
        for input in [Some(&self.gt), self.r#ref.as_ref(), self.map.as_ref()]
            .into_iter()
            .flatten()
        {
            if same_file(&output, input) {
                return Err(HaploomError::config(format!(
                    "output file {:?} is also an input file",
                    output
                )));
            }
        }

        Ok(())
    }

    /// Load sample IDs to exclude from the exclusion file.
    ///
    /// Returns an empty set if no exclusion file is specified.
    pub fn load_exclude_samples(&self) -> Result<std::collections::HashSet<String>> {
        load_id_file(self.excludesamples.as_deref())
    }

    /// Load marker IDs to exclude from the exclusion file.
    ///
    /// Returns an empty set if no exclusion file is specified.
    pub fn load_exclude_markers(&self) -> Result<std::collections::HashSet<String>> {
        load_id_file(self.excludemarkers.as_deref())
    }

    /// Path of the phased output VCF
    pub fn output_path(&self) -> PathBuf {
        let mut s = self.out.as_os_str().to_owned();
        s.push(".vcf.gz");
        PathBuf::from(s)
    }

    /// Get the number of threads to use
    pub fn nthreads(&self) -> usize {
        self.nthreads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// The seed reinterpreted for seeding `StdRng` instances
    pub fn base_seed(&self) -> u64 {
        self.seed as u64
    }

    /// The allele mismatch probability for the given haplotype count.
    ///
    /// Uses the `err` parameter when set, otherwise the Li-Stephens
    /// approximation `theta / (2 (theta + nHaps))` with
    /// `theta = 1 / (ln(nHaps) + 0.5)`.
    pub fn err(&self, n_haps: usize) -> f32 {
        assert!(n_haps > 0, "no haplotypes");
        match self.err {
            Some(e) => e,
            None => {
                let theta = 1.0 / ((n_haps as f64).ln() + 0.5);
                (theta / (2.0 * (theta + n_haps as f64))) as f32
            }
        }
    }

    /// Ratio of the `phase-states` parameter to its default value.
    pub fn scale_factor(&self) -> f32 {
        if self.phase_states == DEFAULT_PHASE_STATES {
            1.0
        } else {
            self.phase_states as f32 / DEFAULT_PHASE_STATES as f32
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}

fn load_id_file(path: Option<&Path>) -> Result<std::collections::HashSet<String>> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let mut set = std::collections::HashSet::new();
    if let Some(path) = path {
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let id = line.trim();
            if !id.is_empty() && !id.starts_with('#') {
                set.insert(id.to_string());
            }
        }
    }
    Ok(set)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> Config {
        Config {
            gt: PathBuf::from("test.vcf"),
            r#ref: None,
            out: PathBuf::from("out"),
            map: None,
            chrom: None,
            excludesamples: None,
            excludemarkers: None,
            burnin: 6,
            iterations: 12,
            phase_states: 280,
            phase_step: 0.006,
            rare: 0.0015,
            impute: true,
            imp_states: 1600,
            imp_segment: 6.0,
            imp_step: 0.1,
            imp_nsteps: 7,
            cluster: 0.005,
            ap: false,
            gp: false,
            ne: 1_000_000.0,
            err: None,
            window: 40.0,
            overlap: 4.0,
            buffer: 0.6,
            seed: -99999,
            nthreads: Some(1),
        }
    }

    #[test]
    fn test_li_stephens_err() {
        let config = test_config();
        let err = config.err(1000);
        // theta = 1/(ln(1000) + 0.5) ~ 0.1346; err ~ theta/(2*(theta + 1000))
        assert!(err > 0.0 && err < 1e-4);
    }

    #[test]
    fn test_err_override() {
        let mut config = test_config();
        config.err = Some(0.001);
        assert_eq!(config.err(1000), 0.001);
    }

    #[test]
    fn test_scale_factor() {
        let mut config = test_config();
        assert_eq!(config.scale_factor(), 1.0);
        config.phase_states = 560;
        assert_eq!(config.scale_factor(), 2.0);
    }

    #[test]
    fn test_window_overlap_constraint() {
        let mut config = test_config();
        config.window = 4.0;
        config.overlap = 4.0;
        // gt does not exist, so bypass the file checks by validating directly
        assert!(1.1 * config.overlap >= config.window);
    }
}
