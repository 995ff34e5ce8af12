//! 按写入顺序把各 ROI 叠加 (overadd) 到同一个标签 atlas 上.

use log::{info, warn};

use crate::overlap::MaskSource;
use crate::precedence::PrecedenceOrder;
use crate::region::RegionSet;
use crate::{AtlasError, AtlasResult, LabelVolume, MaskVolume, NiftiHeaderAttr};

/// 合成结果.
#[derive(Debug, Clone)]
pub struct Composite {
    /// 合成后的 atlas.
    pub volume: LabelVolume,

    /// 宽松模式下因掩膜缺失而跳过的 ROI 下标, 按写入顺序.
    pub skipped: Vec<usize>,
}

/// 读取第 `index` 个 ROI 的掩膜. 宽松模式下缺失的掩膜返回 `None`.
fn load_or_skip<S: MaskSource + ?Sized>(
    regions: &RegionSet,
    index: usize,
    masks: &S,
    tolerant: bool,
) -> AtlasResult<Option<MaskVolume>> {
    match masks.load(&regions[index]) {
        Ok(m) => Ok(Some(m)),
        Err(AtlasError::MissingMask { region, path }) if tolerant => {
            warn!("Skipping `{region}`: {} does not exist", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// 按 `order` 依次写入各 ROI, 后写入者在重叠处覆盖先写入者.
///
/// atlas 的形状与 header 取自声明顺序中第一个可读取的 ROI. 任一掩膜形状不一致时返回
/// [`AtlasError::ShapeMismatch`]; 掩膜缺失时返回 [`AtlasError::MissingMask`],
/// 除非 `tolerant` 为真.
///
/// 写入过程严格串行.
pub fn compose<S: MaskSource + ?Sized>(
    regions: &RegionSet,
    order: &PrecedenceOrder,
    masks: &S,
    tolerant: bool,
) -> AtlasResult<Composite> {
    let mut loaded: Vec<Option<MaskVolume>> = Vec::with_capacity(regions.len());
    for i in 0..regions.len() {
        loaded.push(load_or_skip(regions, i, masks, tolerant)?);
    }

    let Some(reference) = loaded.iter().flatten().next() else {
        return Err(AtlasError::config("no mask of any region could be loaded"));
    };
    let mut volume = LabelVolume::zeros_like(reference);
    for (region, mask) in regions.iter().zip(loaded.iter()) {
        if let Some(mask) = mask {
            volume.ensure_same_shape(mask, region.name())?;
        }
    }

    let mut skipped = Vec::new();
    for i in order.iter() {
        let region = &regions[i];
        match &loaded[i] {
            Some(mask) => {
                info!("Stamping {region}");
                volume.overadd(mask.to_label_layer(region.label_id()).view());
            }
            None => skipped.push(i),
        }
    }
    Ok(Composite { volume, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlap::MemoryMasks;
    use crate::precedence::{resolve, Method};
    use crate::Idx3d;

    const SHAPE: Idx3d = (1, 1, 16);

    /// A 占据 0..10, B 占据 8..13 (与 A 重叠 2), C 占据 10..13 (完全位于 B 内).
    fn masks() -> MemoryMasks {
        let row = |r: std::ops::Range<usize>| {
            MaskVolume::fake_from_positions(SHAPE, r.map(|w| (0, 0, w)))
        };
        MemoryMasks::new()
            .with("1-A", row(0..10))
            .with("2-B", row(8..13))
            .with("3-C", row(10..13))
    }

    fn row_of(v: &LabelVolume) -> Vec<i32> {
        v.data().iter().copied().collect()
    }

    #[test]
    fn test_last_stamped_wins() {
        let set = RegionSet::from_names(["1-A", "2-B", "3-C"]).unwrap();
        let order = PrecedenceOrder::declared(3);
        let c = compose(&set, &order, &masks(), false).unwrap();
        assert_eq!(
            row_of(&c.volume),
            vec![1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 3, 3, 0, 0, 0]
        );
        assert!(c.skipped.is_empty());
        assert_eq!(c.volume.count(1), 8);
    }

    #[test]
    fn test_compose_is_idempotent() {
        let set = RegionSet::from_names(["1-A", "2-B", "3-C"]).unwrap();
        let order = PrecedenceOrder::declared(3);
        let a = compose(&set, &order, &masks(), false).unwrap();
        let b = compose(&set, &order, &masks(), false).unwrap();
        assert_eq!(a.volume, b.volume);
    }

    #[test]
    fn test_numerical_scenario() {
        let set = RegionSet::from_names(["3-C", "1-A", "2-B"]).unwrap();
        let order = resolve(Method::Numerical, &set, None).unwrap();
        let c = compose(&set, &order, &masks(), false).unwrap();
        // B 赢得自己的全部体素, C 只在 B 之外存活 (此处没有).
        assert_eq!(c.volume.count(2), 5);
        assert_eq!(c.volume.count(3), 0);
        assert_eq!(c.volume.count(1), 8);
    }

    #[test]
    fn test_missing_and_tolerant() {
        let set = RegionSet::from_names(["1-A", "4-D", "2-B"]).unwrap();
        let order = PrecedenceOrder::declared(3);
        let err = compose(&set, &order, &masks(), false).unwrap_err();
        assert!(matches!(err, AtlasError::MissingMask { .. }));

        let c = compose(&set, &order, &masks(), true).unwrap();
        assert_eq!(c.skipped, vec![1]);
        assert_eq!(c.volume.count(2), 5);
    }

    #[test]
    fn test_shape_mismatch() {
        let set = RegionSet::from_names(["1-A", "5-E"]).unwrap();
        let masks = masks().with("5-E", MaskVolume::fake_from_positions((2, 1, 16), [(1, 0, 0)]));
        let err = compose(&set, &PrecedenceOrder::declared(2), &masks, false).unwrap_err();
        match err {
            AtlasError::ShapeMismatch {
                region,
                expected,
                found,
            } => {
                assert_eq!(region, "5-E");
                assert_eq!(expected, SHAPE);
                assert_eq!(found, (2, 1, 16));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
