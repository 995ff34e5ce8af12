//! 合成后的 Dice 评估, 以及评估结果的持久化.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};

use crate::compositor::Composite;
use crate::exec::ExecContext;
use crate::overlap::MaskSource;
use crate::region::RegionSet;
use crate::{AtlasResult, MaskVolume};

/// Dice 系数: `2|A ∩ B| / (|A| + |B|)`. 两者都为空时无定义, 返回 `None`.
///
/// 形状不一致时 panic.
pub fn dice(recovered: &MaskVolume, original: &MaskVolume) -> Option<f64> {
    let denom = recovered.volume() + original.volume();
    if denom == 0 {
        None
    } else {
        Some(2.0 * recovered.intersection(original) as f64 / denom as f64)
    }
}

/// 按声明顺序排列的 `ROI 名 -> Dice`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiceReport {
    scores: Vec<(String, Option<f64>)>,
}

impl FromIterator<(String, Option<f64>)> for DiceReport {
    fn from_iter<T: IntoIterator<Item = (String, Option<f64>)>>(iter: T) -> Self {
        Self {
            scores: iter.into_iter().collect(),
        }
    }
}

impl DiceReport {
    /// 评估 `composite`: 对每个 ROI 从 atlas 中按标签值重新提取掩膜, 与原始掩膜比较.
    ///
    /// 合成时被跳过的 ROI 在此同样跳过. 各 ROI 在 `ctx` 上并行评估.
    pub fn evaluate<S: MaskSource + ?Sized>(
        composite: &Composite,
        regions: &RegionSet,
        masks: &S,
        ctx: &ExecContext,
    ) -> AtlasResult<Self> {
        let todo: Vec<usize> = (0..regions.len())
            .filter(|i| !composite.skipped.contains(i))
            .collect();
        let scores = ctx.map(&todo, |&i| {
            let region = &regions[i];
            let original = masks.load(region)?;
            let recovered = composite.volume.threshold(region.label_id());
            let d = dice(&recovered, &original);
            debug!("Dice of {region}: {d:?}");
            Ok((region.name().to_string(), d))
        })?;
        Ok(Self { scores })
    }

    /// 各 ROI 的得分, 按声明顺序.
    #[inline]
    pub fn scores(&self) -> &[(String, Option<f64>)] {
        &self.scores
    }

    /// 查询 `name` 的得分. ROI 不存在时返回 `None`, 得分无定义时返回 `Some(None)`.
    pub fn get(&self, name: &str) -> Option<Option<f64>> {
        self.scores
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, d)| d)
    }

    /// 得分最低的 ROI (忽略无定义的得分).
    pub fn worst(&self) -> Option<(&str, f64)> {
        self.scores
            .iter()
            .filter_map(|(n, d)| d.and_then(|d| NotNan::new(d).ok()).map(|d| (n.as_str(), d)))
            .min_by_key(|&(_, d)| d)
            .map(|(n, d)| (n, d.into_inner()))
    }

    /// 持久化到 `path` (bincode).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AtlasResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// 从 `path` 读取.
    pub fn load<P: AsRef<Path>>(path: P) -> AtlasResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

impl fmt::Display for DiceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Label\tDice")?;
        for (name, d) in self.scores.iter() {
            match d {
                Some(d) => writeln!(f, "{name}\t{d:.6}")?,
                None => writeln!(f, "{name}\tundefined")?,
            }
        }
        Ok(())
    }
}

/// atlas `output` 对应的 Dice 记录路径: 在文件名后追加 `.dice`.
pub fn record_path<P: AsRef<Path>>(output: P) -> PathBuf {
    let mut s = output.as_ref().as_os_str().to_owned();
    s.push(".dice");
    PathBuf::from(s)
}

/// 对可能丢失信息的 ROI 给出警告.
pub fn warn_lossy(report: &DiceReport, threshold: f64) {
    for (name, d) in report.scores() {
        match d {
            Some(d) if *d < threshold => warn!("`{name}` lost voxels in the merge: Dice {d:.4}"),
            None => warn!("`{name}` is empty in both the mask and the atlas"),
            _ => {}
        }
    }
}
