//! 把若干个丘脑核团 ROI 掩膜合并为单个标签 atlas, 并输出 Dice 评估.

mod runner;

use clap::Parser;
use log::error;
use std::path::PathBuf;
use std::process;

/// Merge thalamic nuclei masks into one integer-labeled atlas.
#[derive(Parser, Debug)]
#[command(author, about, version, long_about = None)]
pub struct Args {
    /// Precedence method, `numerical` or `metric` (case-insensitive).
    #[arg(long, default_value = "metric")]
    pub method: String,

    /// Number of worker threads. Defaults to all available cores.
    #[arg(short, long)]
    pub processes: Option<usize>,

    /// Directory of the ROI masks. Falls back to `$NUCLEI_MASK_DIR`, then the current directory.
    #[arg(long)]
    pub mask_dir: Option<PathBuf>,

    /// ROI names in declaration order; may be repeated or comma-separated.
    #[arg(long = "roi", value_delimiter = ',')]
    pub rois: Vec<String>,

    /// Count voxels with `c3d -overlap` instead of in-process.
    #[arg(long)]
    pub c3d: bool,

    /// The c3d executable used by `--c3d`.
    #[arg(long, default_value = "c3d")]
    pub c3d_program: String,

    /// Skip regions whose masks are missing instead of failing.
    #[arg(long)]
    pub tolerant: bool,

    /// On Ctrl-C, let started tasks finish before stopping.
    #[arg(long)]
    pub graceful: bool,

    /// Print debug messages.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output atlas path; the Dice record is written next to it.
    pub output_path: PathBuf,
}

fn main() {
    let args = Args::parse();
    utils::init_logger(args.verbose);

    if let Err(e) = runner::run(&args) {
        error!("{e}");
        process::exit(1);
    }
}
