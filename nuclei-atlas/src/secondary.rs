//! 次级 atlas 填缝.
//!
//! 主 atlas 保持不变. 次级 atlas 中主 atlas 没有的新核团先膨胀一层,
//! 再只填入主 atlas 的背景体素.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::info;

use crate::consts::{is_background, BACKGROUND, DEFAULT_SECONDARY_NAMES};
use crate::{AtlasError, AtlasResult, LabelVolume, NiftiHeaderAttr};

/// 新标签没有注册输出文件名时的处理方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum UnnamedPolicy {
    /// 返回 [`AtlasError::UnnamedLabel`].
    #[default]
    Fail,

    /// 使用 `{value}.nii.gz`.
    AutoName,
}

/// 填缝配置: 新标签值到输出文件名的映射.
#[derive(Clone, Debug)]
pub struct SecondaryMerge {
    names: BTreeMap<i32, String>,
    policy: UnnamedPolicy,
}

impl Default for SecondaryMerge {
    /// `17 -> 17-CL.nii.gz`, `18 -> 18-VPM.nii.gz`.
    fn default() -> Self {
        Self::new(DEFAULT_SECONDARY_NAMES.clone(), UnnamedPolicy::default())
    }
}

/// 填缝结果.
#[derive(Clone, Debug)]
pub struct MergedAtlas {
    /// 合并后的 atlas.
    pub merged: LabelVolume,

    /// 次级 atlas 带来的新标签值.
    pub new_values: BTreeSet<i32>,
}

/// 解析 `VALUE=FILE` 形式的映射.
pub fn parse_name_mapping(s: &str) -> AtlasResult<(i32, String)> {
    let malformed = || AtlasError::config(format!("malformed mapping `{s}`, expected VALUE=FILE"));
    let (value, name) = s.split_once('=').ok_or_else(malformed)?;
    let value: i32 = value.trim().parse().map_err(|_| malformed())?;
    let name = name.trim();
    if name.is_empty() || is_background(value) {
        return Err(malformed());
    }
    Ok((value, name.to_string()))
}

impl SecondaryMerge {
    /// 使用给定映射和策略.
    pub fn new(names: BTreeMap<i32, String>, policy: UnnamedPolicy) -> Self {
        Self { names, policy }
    }

    /// 在默认映射基础上追加 (或覆盖) 若干项.
    pub fn with_names<I: IntoIterator<Item = (i32, String)>>(mut self, extra: I) -> Self {
        self.names.extend(extra);
        self
    }

    /// 设置处理策略.
    pub fn policy(mut self, policy: UnnamedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 标签值 `value` 的输出文件名.
    pub fn name_of(&self, value: i32) -> AtlasResult<String> {
        match (self.names.get(&value), self.policy) {
            (Some(n), _) => Ok(n.clone()),
            (None, UnnamedPolicy::AutoName) => Ok(format!("{value}.nii.gz")),
            (None, UnnamedPolicy::Fail) => Err(AtlasError::UnnamedLabel { value }),
        }
    }

    /// 用 `secondary` 中的新核团填补 `primary` 的缝隙.
    ///
    /// 所有新标签的输出文件名在返回前都已确认可用.
    pub fn merge(&self, primary: &LabelVolume, secondary: &LabelVolume) -> AtlasResult<MergedAtlas> {
        primary.ensure_same_shape(secondary, "secondary atlas")?;

        let labels_primary = primary.labels();
        let mask_primary = primary.data().mapv(|v| labels_primary.contains(&v));
        let new_nuclei = secondary.data().mapv(|v| {
            if is_background(v) || labels_primary.contains(&v) {
                BACKGROUND
            } else {
                v
            }
        });
        let new_nuclei = LabelVolume::with_header(primary.header(), new_nuclei);
        let new_values = new_nuclei.labels();
        for &v in new_values.iter() {
            self.name_of(v)?;
        }
        info!("New labels from the secondary atlas: {new_values:?}");

        let merged = primary.select(&mask_primary, &new_nuclei.dilate());
        Ok(MergedAtlas { merged, new_values })
    }

    /// 对每个新标签, 把 `merged == value` 写入 `dir` 下对应的文件. 返回写出的路径.
    pub fn write_masks<P: AsRef<Path>>(
        &self,
        atlas: &MergedAtlas,
        dir: P,
    ) -> AtlasResult<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(atlas.new_values.len());
        for &v in atlas.new_values.iter() {
            let path = dir.as_ref().join(self.name_of(v)?);
            atlas.merged.threshold(v).save(&path)?;
            info!("Wrote label {v} to {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MaskVolume;
    use ndarray::array;

    fn row(v: &LabelVolume) -> Vec<i32> {
        v.data().iter().copied().collect()
    }

    #[test]
    fn test_parse_name_mapping() {
        assert_eq!(
            parse_name_mapping("19=19-Pv.nii.gz").unwrap(),
            (19, "19-Pv.nii.gz".to_string())
        );
        assert!(parse_name_mapping("19").is_err());
        assert!(parse_name_mapping("x=a.nii").is_err());
        assert!(parse_name_mapping("0=bg.nii").is_err());
        assert!(parse_name_mapping("5=").is_err());
    }

    #[test]
    fn test_primary_never_overwritten() {
        let primary = LabelVolume::fake(array![[[2, 2, 0, 0, 0, 0, 0]]]);
        // 2 已存在于主 atlas, 被忽略.
        let secondary = LabelVolume::fake(array![[[0, 17, 0, 0, 0, 2, 0]]]);
        let out = SecondaryMerge::default().merge(&primary, &secondary).unwrap();

        assert_eq!(out.new_values, BTreeSet::from([17]));
        assert_eq!(row(&out.merged), vec![2, 2, 17, 0, 0, 0, 0]);
    }

    #[test]
    fn test_new_values_dilated_into_gaps() {
        let primary = LabelVolume::fake(array![[[5, 0, 0, 0, 0, 0, 0, 5]]]);
        let secondary = LabelVolume::fake(array![[[0, 0, 17, 0, 0, 18, 0, 0]]]);
        let out = SecondaryMerge::default().merge(&primary, &secondary).unwrap();
        // 位置 3, 4 分别与 17, 18 相邻; 膨胀后 3 取 17, 4 取 18.
        assert_eq!(row(&out.merged), vec![5, 17, 17, 17, 18, 18, 18, 5]);
    }

    #[test]
    fn test_unnamed_label() {
        let primary = LabelVolume::fake(array![[[1, 0, 0]]]);
        let secondary = LabelVolume::fake(array![[[0, 0, 19]]]);
        let err = SecondaryMerge::default().merge(&primary, &secondary).unwrap_err();
        assert!(matches!(err, AtlasError::UnnamedLabel { value: 19 }));

        let merger = SecondaryMerge::default().policy(UnnamedPolicy::AutoName);
        assert_eq!(merger.name_of(19).unwrap(), "19.nii.gz");
        assert!(merger.merge(&primary, &secondary).is_ok());
    }

    #[test]
    fn test_shape_mismatch() {
        let primary = LabelVolume::fake(array![[[1, 0, 0]]]);
        let secondary = LabelVolume::fake(array![[[0, 0]]]);
        assert!(matches!(
            SecondaryMerge::default().merge(&primary, &secondary),
            Err(AtlasError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_write_masks() {
        let dir = tempfile::tempdir().unwrap();
        let primary = LabelVolume::fake(array![[[1, 0, 0, 0], [0, 0, 0, 0]]]);
        let secondary = LabelVolume::fake(array![[[0, 0, 0, 0], [0, 0, 18, 0]]]);
        let merger = SecondaryMerge::default();
        let out = merger.merge(&primary, &secondary).unwrap();
        let written = merger.write_masks(&out, dir.path()).unwrap();

        assert_eq!(written, vec![dir.path().join("18-VPM.nii.gz")]);
        let mask = MaskVolume::open(&written[0]).unwrap();
        assert_eq!(mask.shape(), (1, 2, 4));
        // 中心加左右上三个邻居.
        assert_eq!(mask.volume(), 4);
        assert_eq!(mask[(0, 1, 2)], 1);
        assert_eq!(mask[(0, 0, 2)], 1);
        assert_eq!(mask[(0, 0, 0)], 0);
    }
}
