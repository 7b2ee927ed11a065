//! # Application Entry Point
//!
//! Parses the command line, initialises logging and the global thread
//! pool, and runs the phasing pipeline. Any error produces a single-line
//! diagnostic on stderr and a nonzero exit status.

use haploom::config::Config;
use haploom::pipelines::PhasingPipeline;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match Config::parse_and_validate() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("haploom: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(config.nthreads())
        .build_global()
    {
        eprintln!("haploom: failed to initialise thread pool: {}", err);
        std::process::exit(1);
    }

    let pipeline = PhasingPipeline::new(config);
    if let Err(err) = pipeline.run() {
        eprintln!("haploom: {}", err);
        std::process::exit(1);
    }
}
