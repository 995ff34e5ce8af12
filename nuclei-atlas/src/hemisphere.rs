//! 左右半球流水线: 配准到模板, 把次级 atlas 反向映射回被试空间, 再做填缝.
//!
//! 配准 (`ANTS`) 和形变场应用 (`WarpImageMultiTransform`) 是外部程序.
//! 右半球通过左右翻转被试影像复用同一个模板, 映射回来的 atlas 再翻转回去.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::info;

use crate::secondary::SecondaryMerge;
use crate::{AtlasError, AtlasResult, ImageVolume, LabelVolume};

/// 已有形变场的复用策略.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WarpPolicy {
    /// 形变场文件都存在时跳过配准.
    #[default]
    SkipIfExists,

    /// 总是重新配准.
    AlwaysRebuild,
}

impl WarpPolicy {
    /// 以 `warp` 为前缀的形变场是否需要 (重新) 计算?
    pub fn needs_registration(self, warp: &Path) -> bool {
        match self {
            Self::AlwaysRebuild => true,
            Self::SkipIfExists => {
                !(with_suffix(warp, "Affine.txt").is_file()
                    && with_suffix(warp, "InverseWarp.nii.gz").is_file())
            }
        }
    }
}

/// 半球.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Hemisphere {
    /// 左半球, 与模板同侧.
    Left,

    /// 右半球, 需要翻转.
    Right,
}

impl fmt::Display for Hemisphere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Left => "left",
            Self::Right => "right",
        })
    }
}

/// 在路径末尾直接拼接字符串 (不是扩展名).
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// 去掉目录和 nifti 扩展名后的文件名.
fn nifti_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name)
        .to_string()
}

/// 命令行的可读形式.
pub fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 运行外部命令. 无法启动或返回非零状态时返回 [`AtlasError::ExternalTool`].
pub fn run_command(cmd: &mut Command) -> AtlasResult<()> {
    let line = command_line(cmd);
    info!("Executing: {line}");
    let status = cmd.status().map_err(|e| AtlasError::ExternalTool {
        command: line.clone(),
        detail: e.to_string(),
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(AtlasError::ExternalTool {
            command: line,
            detail: format!("exit status {status}"),
        })
    }
}

/// 配准工具配置.
#[derive(Clone, Debug)]
pub struct Registration {
    template: PathBuf,
    atlas: PathBuf,
    ants: String,
    warp: String,
    cost: String,
    iterations: String,
}

impl Registration {
    /// 使用模板 `template` 和模板空间下的次级 atlas `atlas`.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(template: P, atlas: Q) -> Self {
        Self {
            template: template.into(),
            atlas: atlas.into(),
            ants: "ANTS".to_string(),
            warp: "WarpImageMultiTransform".to_string(),
            cost: "CC".to_string(),
            iterations: "30x90x20".to_string(),
        }
    }

    /// 替换外部程序名.
    pub fn programs<S: Into<String>, T: Into<String>>(mut self, ants: S, warp: T) -> Self {
        self.ants = ants.into();
        self.warp = warp.into();
        self
    }

    /// 把 `input` 配准到模板, 形变场以 `warp_out` 为前缀.
    pub fn register_command(&self, input: &Path, warp_out: &Path) -> Command {
        let mut cmd = Command::new(&self.ants);
        cmd.arg("3")
            .arg("-m")
            .arg(format!(
                "{}[{},{},1,5]",
                self.cost,
                self.template.display(),
                input.display()
            ))
            .args(["-t", "SyN[0.25]", "-r", "Gauss[3,0]", "-o"])
            .arg(warp_out)
            .arg("-i")
            .arg(&self.iterations)
            .args([
                "--use-Histogram-Matching",
                "--number-of-affine-iterations",
                "10000x10000x10000x10000x10000",
                "--MI-option",
                "32x16000",
            ]);
        cmd
    }

    /// 用 `warp` 的逆变换把次级 atlas 映射到 `base` 空间, 最近邻插值.
    pub fn warp_command(&self, base: &Path, warp: &Path, out: &Path) -> Command {
        let mut cmd = Command::new(&self.warp);
        cmd.arg("3")
            .arg(&self.atlas)
            .arg(out)
            .arg("-R")
            .arg(base)
            .arg("-i")
            .arg(with_suffix(warp, "Affine.txt"))
            .arg(with_suffix(warp, "InverseWarp.nii.gz"))
            .arg("--use-NN");
        cmd
    }
}

/// 把多标签 atlas 拆分为每个标签一个二值掩膜.
///
/// 对 atlas 中出现且在 `targets` 里有路径的标签值写出掩膜; 没有路径的标签值被跳过.
/// 返回写出的路径, 按标签值升序.
pub fn split_atlas(
    atlas: &LabelVolume,
    targets: &BTreeMap<i32, PathBuf>,
) -> AtlasResult<Vec<PathBuf>> {
    let mut written = Vec::new();
    for value in atlas.labels().into_iter().filter(|&v| v > 0) {
        match targets.get(&value) {
            Some(path) => {
                atlas.threshold(value).save(path)?;
                written.push(path.clone());
            }
            None => info!("No target for label {value}, skipping"),
        }
    }
    Ok(written)
}

/// 为 `atlas` 中出现的每个标签生成 `<prefix>-<value>.nii.gz`.
pub fn prefixed_targets(atlas: &LabelVolume, prefix: &str) -> BTreeMap<i32, PathBuf> {
    atlas
        .labels()
        .into_iter()
        .filter(|&v| v > 0)
        .map(|v| (v, PathBuf::from(format!("{prefix}-{v}.nii.gz"))))
        .collect()
}

/// 单个半球用到的全部路径.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HemispherePaths {
    /// 参与配准的被试影像. 右半球为翻转后的影像.
    pub input: PathBuf,

    /// 形变场前缀.
    pub warp: PathBuf,

    /// 映射回被试空间的次级 atlas.
    pub native_atlas: PathBuf,

    /// 右半球中翻转回去的次级 atlas. 左半球与 `native_atlas` 相同.
    pub corrected_atlas: PathBuf,

    /// 主 atlas.
    pub primary: PathBuf,

    /// 新核团掩膜的输出目录.
    pub out_dir: PathBuf,
}

/// 左右半球流水线.
#[derive(Clone, Debug)]
pub struct HemispherePipeline {
    registration: Registration,
    subject: PathBuf,
    work_dir: PathBuf,
    policy: WarpPolicy,
    merger: SecondaryMerge,
}

impl HemispherePipeline {
    /// 处理被试影像 `subject`, 所有相对路径都以 `work_dir` 为根.
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(
        registration: Registration,
        subject: P,
        work_dir: Q,
    ) -> Self {
        Self {
            registration,
            subject: subject.into(),
            work_dir: work_dir.into(),
            policy: WarpPolicy::default(),
            merger: SecondaryMerge::default(),
        }
    }

    /// 设置形变场复用策略.
    pub fn policy(mut self, policy: WarpPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 设置填缝配置.
    pub fn merger(mut self, merger: SecondaryMerge) -> Self {
        self.merger = merger;
        self
    }

    /// `hemi` 用到的路径.
    pub fn paths(&self, hemi: Hemisphere) -> HemispherePaths {
        let temp = self.work_dir.join(format!("temp-{hemi}"));
        let stem = nifti_stem(&self.subject);
        let input = match hemi {
            Hemisphere::Left => self.subject.clone(),
            Hemisphere::Right => temp.join(format!("{stem}.nii.gz")),
        };
        let native_atlas = temp.join("CLVPM-atlas-native.nii.gz");
        let corrected_atlas = match hemi {
            Hemisphere::Left => native_atlas.clone(),
            Hemisphere::Right => temp.join("CLVPM-atlas-native-corrected.nii.gz"),
        };
        let out_dir = self.work_dir.join(hemi.to_string());
        HemispherePaths {
            input,
            warp: temp.join("warps").join(stem),
            native_atlas,
            corrected_atlas,
            primary: out_dir.join("multiatlas_full.nii.gz"),
            out_dir,
        }
    }

    /// 处理单个半球, 返回写出的新核团掩膜.
    pub fn run_hemisphere(&self, hemi: Hemisphere) -> AtlasResult<Vec<PathBuf>> {
        let paths = self.paths(hemi);
        info!("Processing {hemi} hemisphere");

        if hemi == Hemisphere::Right {
            ImageVolume::open(&self.subject)?
                .flip_lr()
                .save(&paths.input)?;
        }

        if self.policy.needs_registration(&paths.warp) {
            if let Some(dir) = paths.warp.parent() {
                std::fs::create_dir_all(dir)?;
            }
            run_command(&mut self.registration.register_command(&paths.input, &paths.warp))?;
        } else {
            info!("Reusing warps at {}", paths.warp.display());
        }

        if paths.native_atlas.is_file() {
            info!("Atlas in native space already exists");
        } else {
            run_command(&mut self.registration.warp_command(
                &paths.input,
                &paths.warp,
                &paths.native_atlas,
            ))?;
        }

        if hemi == Hemisphere::Right {
            LabelVolume::open(&paths.native_atlas)?
                .flip_lr()
                .save(&paths.corrected_atlas)?;
        }

        let primary = LabelVolume::open(&paths.primary)?;
        let secondary = LabelVolume::open(&paths.corrected_atlas)?;
        let merged = self.merger.merge(&primary, &secondary)?;
        self.merger.write_masks(&merged, &paths.out_dir)
    }

    /// 依次处理左、右半球.
    pub fn run(&self) -> AtlasResult<Vec<PathBuf>> {
        let mut written = self.run_hemisphere(Hemisphere::Left)?;
        written.extend(self.run_hemisphere(Hemisphere::Right)?);
        Ok(written)
    }
}
