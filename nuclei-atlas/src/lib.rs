#![warn(missing_docs)]

//! 核心库. 将若干个彼此独立 (且可能相互重叠) 的丘脑核团二值 ROI 合并为单个整数标签 atlas,
//! 并用 Dice 系数量化合并带来的信息损失.
//!
//! 配准 (ANTS) 与形变场应用 (WarpImageMultiTransform) 被视为外部工具,
//! 本 crate 只负责组织命令和检查结果.
//!
//! # 注意
//!
//! 1. 所有三维数据均按 `(z, h, w)` 访问, 即 nifti 文件 `[x, y, z]` 的逆序.
//! 2. 库内部不会 panic 于用户输入, 所有可预期的错误都以 [`AtlasError`] 返回.
//!
//! # 开发计划
//!
//! ### 两两重叠统计 ✅
//!
//! 对称缓存, 每个无序对只计算一次. 支持进程内统计和 `c3d -overlap`.
//!
//! 实现位于 `nuclei-atlas/src/overlap.rs`.
//!
//! ### 优先级决策 ✅
//!
//! `Numerical` 按声明顺序; `Metric` 按 "重叠占自身体积的比例" 排序,
//! 比例更大 (更容易被覆盖) 的 ROI 更晚写入.
//!
//! 比较关系在 "相等" 上不满足传递性 (互不重叠的两个 ROI 视为相等),
//! 因此不直接用排序算法, 而是拓扑排序. 同一轮可选时按声明顺序取最早的那个.
//!
//! 实现位于 `nuclei-atlas/src/precedence.rs`.
//!
//! ### overadd 合成 ✅
//!
//! 实现位于 `nuclei-atlas/src/compositor.rs`.
//!
//! ### Dice 评估与持久化 ✅
//!
//! 实现位于 `nuclei-atlas/src/validate.rs`.
//!
//! ### 次级 atlas 填缝 ✅
//!
//! 新核团做一次 6-邻域灰度膨胀后, 只填入主 atlas 的背景体素.
//!
//! 实现位于 `nuclei-atlas/src/secondary.rs`.
//!
//! ### 半球流水线 ✅
//!
//! 左右半球分别配准, 右侧通过左右翻转复用同一模板.
//!
//! 实现位于 `nuclei-atlas/src/hemisphere.rs`.

/// 三维索引 `(z, h, w)`.
pub type Idx3d = (usize, usize, usize);

/// 3D nii 文件基础数据结构.
mod data;

pub use data::{ImageVolume, LabelVolume, MaskVolume, NiftiHeaderAttr};

pub mod consts;

mod error;

pub use error::{AtlasError, AtlasResult};

pub mod exec;
pub mod region;
pub mod overlap;
pub mod precedence;
pub mod compositor;
pub mod validate;
pub mod secondary;
pub mod hemisphere;

pub mod prelude;
