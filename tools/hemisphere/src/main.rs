//! 半球相关工具: 次级 atlas 填缝, 左右合并, 翻转, 拆分, 以及完整的半球流水线.

use clap::{Parser, Subcommand};
use log::{error, info};
use nuclei_atlas::hemisphere::{prefixed_targets, split_atlas};
use nuclei_atlas::prelude::*;
use nuclei_atlas::secondary::parse_name_mapping;
use std::path::PathBuf;
use std::process;

/// Hemisphere-level atlas tools.
#[derive(Parser, Debug)]
#[command(author, about, version, long_about = None)]
struct Args {
    /// Print debug messages.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

/// `VALUE=FILE`.
fn name_mapping(s: &str) -> Result<(i32, String), String> {
    parse_name_mapping(s).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Fill the gaps of a primary atlas with new labels from a secondary atlas.
    Merge {
        /// Primary atlas, never overwritten.
        primary: PathBuf,
        /// Secondary atlas providing new labels.
        secondary: PathBuf,
        /// Directory receiving one mask per new label.
        out_dir: PathBuf,
        /// Extra output names as VALUE=FILE.
        #[arg(long = "name", value_parser = name_mapping)]
        names: Vec<(i32, String)>,
        /// Name unmapped labels `<value>.nii.gz` instead of failing.
        #[arg(long)]
        auto_name: bool,
    },

    /// Voxelwise sum of two label volumes.
    Combine {
        a: PathBuf,
        b: PathBuf,
        out: PathBuf,
    },

    /// Flip a volume along the left/right axis.
    Flip { input: PathBuf, out: PathBuf },

    /// Split an atlas into `<prefix>-<value>.nii.gz` masks.
    Split { atlas: PathBuf, prefix: String },

    /// Register, warp and merge both hemispheres of one subject.
    Pipeline {
        /// Subject image.
        subject: PathBuf,
        /// Template image.
        #[arg(long)]
        template: PathBuf,
        /// Secondary atlas in template space.
        #[arg(long)]
        atlas: PathBuf,
        /// Working directory holding `left/` and `right/`.
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
        /// Rebuild warps even if they exist.
        #[arg(long)]
        rebuild_warps: bool,
    },
}

fn run(cmd: Cmd) -> AtlasResult<()> {
    match cmd {
        Cmd::Merge {
            primary,
            secondary,
            out_dir,
            names,
            auto_name,
        } => {
            let policy = if auto_name {
                UnnamedPolicy::AutoName
            } else {
                UnnamedPolicy::Fail
            };
            let merger = SecondaryMerge::default().with_names(names).policy(policy);
            let primary = LabelVolume::open(primary)?;
            let merged = merger.merge(&primary, &LabelVolume::open(secondary)?)?;
            for p in merger.write_masks(&merged, &out_dir)? {
                println!("{}", p.display());
            }
        }
        Cmd::Combine { a, b, out } => {
            LabelVolume::open(a)?
                .combine(&LabelVolume::open(b)?)?
                .save(&out)?;
            info!("Wrote {}", out.display());
        }
        Cmd::Flip { input, out } => {
            ImageVolume::open(input)?.flip_lr().save(&out)?;
            info!("Wrote {}", out.display());
        }
        Cmd::Split { atlas, prefix } => {
            let atlas = LabelVolume::open(atlas)?;
            for p in split_atlas(&atlas, &prefixed_targets(&atlas, &prefix))? {
                println!("{}", p.display());
            }
        }
        Cmd::Pipeline {
            subject,
            template,
            atlas,
            work_dir,
            rebuild_warps,
        } => {
            let policy = if rebuild_warps {
                WarpPolicy::AlwaysRebuild
            } else {
                WarpPolicy::SkipIfExists
            };
            let registration = Registration::new(template, atlas);
            let written = HemispherePipeline::new(registration, subject, work_dir)
                .policy(policy)
                .run()?;
            for p in written {
                println!("{}", p.display());
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    utils::init_logger(args.verbose);

    if let Err(e) = run(args.command) {
        error!("{e}");
        process::exit(1);
    }
}
