//! ROI 身份与标签值解析.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::consts::MASK_EXT;
use crate::{AtlasError, AtlasResult};

static FIND_NUM: Lazy<Regex> = Lazy::new(|| Regex::new("[0-9]+").unwrap());

/// 单个 ROI. 身份在一次运行内不可变.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    name: String,
    label_id: i32,
    source_path: Option<PathBuf>,
}

impl Region {
    /// ROI 名, 如 `12-MD-Pf`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 写入 atlas 的标签值, 保证为正.
    #[inline]
    pub fn label_id(&self) -> i32 {
        self.label_id
    }

    /// 二值掩膜文件路径. 纯内存运行时为 `None`.
    #[inline]
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.label_id)
    }
}

/// 去掉目录和 nifti 扩展名后的文件名.
fn stem(name: &str) -> &str {
    let base = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    base.strip_suffix(".nii.gz")
        .or_else(|| base.strip_suffix(".nii"))
        .unwrap_or(base)
}

/// 从 ROI 名中解析标签值: 文件名中第一段连续数字. 不存在时返回 `None`.
///
/// 数字过大 (超出 `i32`) 时同样返回 `None`.
pub fn parse_label_id(name: &str) -> Option<i32> {
    FIND_NUM
        .find(stem(name))
        .and_then(|m| m.as_str().parse::<i32>().ok())
}

/// 按声明顺序排列、已校验的 ROI 集合.
#[derive(Debug, Clone)]
pub struct RegionSet {
    regions: Vec<Region>,
}

impl RegionSet {
    /// 由 ROI 名构造集合. 名字中不含数字的 ROI 使用其在列表中的位置 (从 1 开始) 作为标签.
    ///
    /// 标签为 0 (与背景冲突) 或重复时返回 [`AtlasError::Configuration`],
    /// 错误信息中包含完整的 名字 -> 标签 映射.
    pub fn from_names<S: AsRef<str>, I: IntoIterator<Item = S>>(names: I) -> AtlasResult<Self> {
        let regions = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let name = name.as_ref();
                Region {
                    name: stem(name).to_string(),
                    label_id: parse_label_id(name).unwrap_or(i as i32 + 1),
                    source_path: None,
                }
            })
            .collect();
        Self::validated(regions)
    }

    /// 与 [`Self::from_names`] 相同, 但同时把每个 ROI 解析到 `dir` 下的掩膜文件.
    ///
    /// 不带扩展名的名字会补上 `.nii.gz`.
    pub fn from_names_in<S, I, P>(names: I, dir: P) -> AtlasResult<Self>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
        P: AsRef<Path>,
    {
        let names: Vec<String> = names.into_iter().map(|s| s.as_ref().to_string()).collect();
        let mut set = Self::from_names(&names)?;
        for (region, name) in set.regions.iter_mut().zip(names.iter()) {
            let file = if name.ends_with(".nii") || name.ends_with(MASK_EXT) {
                name.clone()
            } else {
                format!("{name}{MASK_EXT}")
            };
            region.source_path = Some(dir.as_ref().join(file));
        }
        Ok(set)
    }

    fn validated(regions: Vec<Region>) -> AtlasResult<Self> {
        if regions.is_empty() {
            return Err(AtlasError::config("no region of interest given"));
        }
        let mapping = || {
            regions
                .iter()
                .map(|r| format!("{}={}", r.name, r.label_id))
                .collect::<Vec<_>>()
                .join(", ")
        };

        if let Some(r) = regions.iter().find(|r| r.label_id <= 0) {
            return Err(AtlasError::config(format!(
                "label id of `{}` must be positive, got {} ({})",
                r.name,
                r.label_id,
                mapping()
            )));
        }

        let mut seen = HashMap::with_capacity(regions.len());
        for r in regions.iter() {
            if let Some(prev) = seen.insert(r.label_id, r.name.as_str()) {
                return Err(AtlasError::config(format!(
                    "`{prev}` and `{}` share label id {}; make sure the id number is at \
                     the beginning of the filename ({})",
                    r.name,
                    r.label_id,
                    mapping()
                )));
            }
        }
        Ok(Self { regions })
    }

    /// 按 `keep` 拆分集合, 保留原有标签值与相对顺序. 返回 (保留的集合, 被剔除的 ROI).
    ///
    /// 全部被剔除时返回配置错误.
    pub fn partition<F: FnMut(&Region) -> bool>(
        &self,
        mut keep: F,
    ) -> AtlasResult<(Self, Vec<Region>)> {
        let (kept, dropped): (Vec<_>, Vec<_>) =
            self.regions.iter().cloned().partition(|r| keep(r));
        Ok((Self::validated(kept)?, dropped))
    }

    /// ROI 个数, 至少为 1.
    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// 集合是否为空. 校验过的集合总是非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// 按声明顺序迭代.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Region> {
        self.regions.iter()
    }

    /// 以切片形式访问.
    #[inline]
    pub fn as_slice(&self) -> &[Region] {
        &self.regions
    }

    /// 第 `index` 个 ROI. 越界时 panic.
    #[inline]
    pub fn get(&self, index: usize) -> &Region {
        &self.regions[index]
    }
}

impl std::ops::Index<usize> for RegionSet {
    type Output = Region;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.regions[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_id() {
        assert_eq!(parse_label_id("12-MD-Pf"), Some(12));
        assert_eq!(parse_label_id("2-AV.nii.gz"), Some(2));
        assert_eq!(parse_label_id("/data/left/14-MTT.nii"), Some(14));
        assert_eq!(parse_label_id("/data/7/Pul.nii.gz"), None);
        assert_eq!(parse_label_id("CL"), None);
        assert_eq!(parse_label_id("roi_7b"), Some(7));
    }

    #[test]
    fn test_fallback_to_position() {
        let set = RegionSet::from_names(["AV", "5-VA", "CL"]).unwrap();
        let ids: Vec<_> = set.iter().map(Region::label_id).collect();
        assert_eq!(ids, vec![1, 5, 3]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = RegionSet::from_names(["12-MD", "12-Pf"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("12-MD=12"));
        assert!(msg.contains("12-Pf=12"));
    }

    #[test]
    fn test_zero_and_empty_rejected() {
        assert!(RegionSet::from_names(["0-bad"]).is_err());
        assert!(RegionSet::from_names(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_partition_keeps_ids() {
        let set = RegionSet::from_names(["AV", "VA", "CL"]).unwrap();
        let (kept, dropped) = set.partition(|r| r.name() != "VA").unwrap();
        let ids: Vec<_> = kept.iter().map(Region::label_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(dropped[0].name(), "VA");
        assert!(set.partition(|_| false).is_err());
    }

    #[test]
    fn test_paths_in_dir() {
        let set = RegionSet::from_names_in(["2-AV", "4-VA.nii"], "/masks").unwrap();
        assert_eq!(set[0].source_path(), Some(Path::new("/masks/2-AV.nii.gz")));
        assert_eq!(set[1].source_path(), Some(Path::new("/masks/4-VA.nii")));
        assert_eq!(set[1].name(), "4-VA");
    }
}
