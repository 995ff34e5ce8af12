//! 常用类型与函数.

pub use crate::compositor::{compose, Composite};
pub use crate::exec::{ExecContext, Interrupt};
pub use crate::hemisphere::{HemispherePipeline, Registration, WarpPolicy};
pub use crate::overlap::{
    CommandOverlap, MaskSource, MemoryMasks, NiftiMasks, OverlapTool, PairwiseStats, VoxelOverlap,
};
pub use crate::precedence::{resolve, Method, PrecedenceOrder};
pub use crate::region::{Region, RegionSet};
pub use crate::secondary::{MergedAtlas, SecondaryMerge, UnnamedPolicy};
pub use crate::validate::{dice, record_path, DiceReport};
pub use crate::{AtlasError, AtlasResult, ImageVolume, LabelVolume, MaskVolume, NiftiHeaderAttr};
