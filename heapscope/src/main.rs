use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use heapscope::cli::Args;
use heapscope::pipeline::AnalysisPipeline;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    AnalysisPipeline::new(args).run()
}
