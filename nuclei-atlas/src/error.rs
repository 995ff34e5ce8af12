//! 运行时错误.

use crate::Idx3d;
use std::path::PathBuf;

/// 合并 / 评估流程中的全部错误.
#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// 配置错误, 在任何计算开始前报告.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// ROI 体积为零, 无法计算重叠比例.
    #[error("degenerate region `{region}`: volume is {volume} (maybe the mask is not 0/1?)")]
    DegenerateRegion {
        /// ROI 名.
        region: String,
        /// 实际测得的体积.
        volume: u64,
    },

    /// 外部工具无法启动, 返回非零状态, 或者输出无法解析.
    #[error("external tool failed: `{command}`: {detail}")]
    ExternalTool {
        /// 完整命令行.
        command: String,
        /// 出错原因, 包含原始输出文本.
        detail: String,
    },

    /// 参考体积形状不一致.
    #[error("shape mismatch for `{region}`: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// 出错的 ROI (或文件).
        region: String,
        /// 期望形状.
        expected: Idx3d,
        /// 实际形状.
        found: Idx3d,
    },

    /// ROI 掩膜文件不存在.
    #[error("mask of `{region}` is missing: {}", path.display())]
    MissingMask {
        /// ROI 名.
        region: String,
        /// 期望的文件路径.
        path: PathBuf,
    },

    /// 次级 atlas 中的新标签没有注册输出文件名.
    #[error("new label {value} from the secondary atlas has no registered output name")]
    UnnamedLabel {
        /// 标签值.
        value: i32,
    },

    /// 合并两个 atlas 时标签值相加溢出.
    #[error("label overflow at {position:?}: {a} + {b}")]
    LabelOverflow {
        /// 溢出体素的 `(z, h, w)` 索引.
        position: Idx3d,
        /// 第一个 atlas 的值.
        a: i32,
        /// 第二个 atlas 的值.
        b: i32,
    },

    /// 运行被中断.
    #[error("interrupted")]
    Interrupted,

    /// nifti 读写错误.
    #[error("nifti error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// 底层 I/O 错误.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dice 记录序列化错误.
    #[error("record error: {0}")]
    Record(#[from] bincode::Error),
}

impl AtlasError {
    /// 由任意描述构造配置错误.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 是否为中断?
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// 合并 / 评估运行时结果.
pub type AtlasResult<T> = Result<T, AtlasError>;
