//! 程序运行函数.

use crate::Args;
use log::{info, warn};
use nuclei_atlas::consts::DEFAULT_ROIS;
use nuclei_atlas::prelude::*;
use nuclei_atlas::validate::warn_lossy;
use std::path::Path;

/// Dice 低于该值的 ROI 会被警告.
const LOSSY_DICE: f64 = 0.9;

/// 实际运行.
pub fn run(args: &Args) -> AtlasResult<DiceReport> {
    let method: Method = args.method.parse()?;
    let mask_dir = utils::mask_dir_from_env_or(args.mask_dir.clone());
    let regions = if args.rois.is_empty() {
        RegionSet::from_names_in(DEFAULT_ROIS, &mask_dir)?
    } else {
        RegionSet::from_names_in(&args.rois, &mask_dir)?
    };
    let regions = if args.tolerant {
        let (present, missing) =
            regions.partition(|r| r.source_path().is_some_and(Path::is_file))?;
        for r in missing.iter() {
            warn!("Skipping {r}: mask not found in {}", mask_dir.display());
        }
        present
    } else {
        regions
    };
    info!("Merging {} regions from {}", regions.len(), mask_dir.display());

    let interrupt = Interrupt::new();
    utils::install_ctrl_c(&interrupt);
    let ctx = ExecContext::new(args.processes, interrupt)?.graceful(args.graceful);
    let masks = NiftiMasks;

    let stats = if !method.needs_stats() {
        None
    } else if args.c3d {
        let tool = CommandOverlap::new(&args.c3d_program);
        Some(PairwiseStats::compute(&regions, &tool, &ctx)?)
    } else {
        let tool = VoxelOverlap::load(&regions, &masks, &ctx)?;
        Some(PairwiseStats::compute(&regions, &tool, &ctx)?)
    };
    let order = resolve(method, &regions, stats.as_ref())?;

    let composite = compose(&regions, &order, &masks, args.tolerant)?;
    composite.volume.save(&args.output_path)?;
    info!(
        "Wrote atlas to {} (voxel {:.3} mm^3)",
        args.output_path.display(),
        composite.volume.voxel()
    );

    let report = DiceReport::evaluate(&composite, &regions, &masks, &ctx)?;
    publish(&report, &args.output_path, &ctx)?;
    Ok(report)
}

/// 打印并保存 Dice 结果. 期间发生的中断同样以错误返回.
fn publish(report: &DiceReport, output: &Path, ctx: &ExecContext) -> AtlasResult<()> {
    utils::sep();
    print!("{report}");
    utils::sep();
    warn_lossy(report, LOSSY_DICE);
    if let Some((name, d)) = report.worst() {
        info!("Lowest Dice: {name} ({d:.4})");
    }

    let record = record_path(output);
    report.save(&record)?;
    info!("Wrote Dice record to {}", record.display());
    ctx.check()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> DiceReport {
        [("1-A".to_string(), Some(0.95)), ("2-B".to_string(), None)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_publish_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("multiatlas.nii.gz");
        let ctx = ExecContext::new(Some(1), Interrupt::new()).unwrap();
        publish(&report(), &output, &ctx).unwrap();
        assert_eq!(DiceReport::load(record_path(&output)).unwrap(), report());
    }

    #[test]
    fn test_publish_reports_late_interrupt() {
        let dir = tempfile::tempdir().unwrap();
        let interrupt = Interrupt::new();
        let ctx = ExecContext::new(Some(1), interrupt.clone()).unwrap();
        interrupt.raise();
        let err = publish(&report(), &dir.path().join("out.nii.gz"), &ctx).unwrap_err();
        assert!(err.is_interrupted());
    }
}
