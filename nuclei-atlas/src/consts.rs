//! 通用常量.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// 背景体素的标签值.
pub const BACKGROUND: i32 = 0;

/// 二值掩膜中前景体素的值.
pub const MASK_ON: u8 = 1;

/// 二值掩膜中背景体素的值.
pub const MASK_OFF: u8 = 0;

/// 未显式给出 ROI 列表时使用的丘脑核团列表 (按声明顺序).
///
/// 名字前缀的数字即为写入 atlas 的标签值.
pub const DEFAULT_ROIS: [&str; 12] = [
    "2-AV", "4-VA", "5-VLa", "6-VLP", "7-VPL", "8-Pul", "9-LGN", "10-MGN", "11-CM", "12-MD-Pf",
    "13-Hb", "14-MTT",
];

/// ROI 掩膜文件的默认扩展名.
pub const MASK_EXT: &str = ".nii.gz";

/// 次级 atlas 新核团的默认输出文件名 (标签值 -> 文件名).
pub static DEFAULT_SECONDARY_NAMES: Lazy<BTreeMap<i32, String>> = Lazy::new(|| {
    BTreeMap::from([
        (17, "17-CL.nii.gz".to_string()),
        (18, "18-VPM.nii.gz".to_string()),
    ])
});

/// 体素是否是背景?
#[inline]
pub const fn is_background(label: i32) -> bool {
    label == BACKGROUND
}
