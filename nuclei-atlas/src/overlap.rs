//! 两两重叠统计.
//!
//! 对 ROI 集合中的每个无序对 (包括自身与自身) 统计两者体积和交集体积.
//! 结果以 `(min, max)` 为键对称存储, 每个无序对只计算一次.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use itertools::Itertools;
use log::{debug, info};

use crate::exec::ExecContext;
use crate::region::{Region, RegionSet};
use crate::{AtlasError, AtlasResult, MaskVolume, NiftiHeaderAttr};

/// 一次重叠统计的结果, 单位为体素.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OverlapCount {
    /// 第一个 ROI 的体积.
    pub volume_a: u64,

    /// 第二个 ROI 的体积.
    pub volume_b: u64,

    /// 两者同时为前景的体素个数.
    pub overlap: u64,
}

/// 体素统计工具: 给定两个 ROI, 返回两者体积和交集体积.
pub trait OverlapTool: Sync {
    /// 统计 `a` 与 `b`. `a == b` 时三个值必须相等.
    ///
    /// 长时间运行的实现应当周期性调用 `ctx.checkpoint()`.
    fn overlap(&self, a: &Region, b: &Region, ctx: &ExecContext) -> AtlasResult<OverlapCount>;
}

/// 提供 ROI 二值掩膜的数据源.
pub trait MaskSource: Sync {
    /// 读取 `region` 的掩膜. 文件不存在时返回 [`AtlasError::MissingMask`].
    fn load(&self, region: &Region) -> AtlasResult<MaskVolume>;
}

/// 从 [`Region::source_path`] 读取 nii 掩膜.
#[derive(Copy, Clone, Debug, Default)]
pub struct NiftiMasks;

impl MaskSource for NiftiMasks {
    fn load(&self, region: &Region) -> AtlasResult<MaskVolume> {
        let missing = |path: &Path| AtlasError::MissingMask {
            region: region.name().to_string(),
            path: path.to_owned(),
        };
        let path = region
            .source_path()
            .ok_or_else(|| missing(Path::new(region.name())))?;
        if !path.is_file() {
            return Err(missing(path));
        }
        MaskVolume::open(path)
    }
}

/// 内存中的掩膜, 以 ROI 名为键.
#[derive(Clone, Debug, Default)]
pub struct MemoryMasks {
    masks: HashMap<String, MaskVolume>,
}

impl MemoryMasks {
    /// 创建空数据源.
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 `name` 的掩膜, 返回自身以便链式调用.
    pub fn with<S: Into<String>>(mut self, name: S, mask: MaskVolume) -> Self {
        self.masks.insert(name.into(), mask);
        self
    }

    /// 登记 `name` 的掩膜.
    pub fn insert<S: Into<String>>(&mut self, name: S, mask: MaskVolume) {
        self.masks.insert(name.into(), mask);
    }
}

impl MaskSource for MemoryMasks {
    fn load(&self, region: &Region) -> AtlasResult<MaskVolume> {
        self.masks
            .get(region.name())
            .cloned()
            .ok_or_else(|| AtlasError::MissingMask {
                region: region.name().to_string(),
                path: region.name().into(),
            })
    }
}

/// 进程内体素统计. 构造时一次性读入全部掩膜.
#[derive(Debug)]
pub struct VoxelOverlap {
    masks: HashMap<i32, MaskVolume>,
}

impl VoxelOverlap {
    /// 借助 `ctx` 并行读入 `regions` 的全部掩膜.
    pub fn load<S: MaskSource + ?Sized>(
        regions: &RegionSet,
        source: &S,
        ctx: &ExecContext,
    ) -> AtlasResult<Self> {
        let masks = ctx.map(regions.as_slice(), |r| source.load(r))?;
        let masks = regions
            .iter()
            .map(Region::label_id)
            .zip(masks)
            .collect();
        Ok(Self { masks })
    }

    fn mask(&self, region: &Region) -> AtlasResult<&MaskVolume> {
        self.masks
            .get(&region.label_id())
            .ok_or_else(|| AtlasError::MissingMask {
                region: region.name().to_string(),
                path: region.name().into(),
            })
    }
}

impl OverlapTool for VoxelOverlap {
    fn overlap(&self, a: &Region, b: &Region, ctx: &ExecContext) -> AtlasResult<OverlapCount> {
        let (ma, mb) = (self.mask(a)?, self.mask(b)?);
        ma.ensure_same_shape(mb, &format!("{} vs {}", a.name(), b.name()))?;

        let mut ans = OverlapCount {
            volume_a: 0,
            volume_b: 0,
            overlap: 0,
        };
        for z in 0..ma.len_z() {
            ctx.checkpoint()?;
            ans.volume_a += ma.volume_at(z);
            ans.volume_b += mb.volume_at(z);
            ans.overlap += ma.intersection_at(mb, z);
        }
        Ok(ans)
    }
}

/// 调用外部 `c3d <a> <b> -overlap <label>` 统计.
#[derive(Clone, Debug)]
pub struct CommandOverlap {
    program: String,
    label: u32,
}

impl Default for CommandOverlap {
    fn default() -> Self {
        Self {
            program: "c3d".to_string(),
            label: 1,
        }
    }
}

impl CommandOverlap {
    /// 使用 `program` 作为 c3d 可执行文件.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// 统计 `-overlap` 的标签值, 默认为 1.
    pub fn label(mut self, label: u32) -> Self {
        self.label = label;
        self
    }
}

/// 解析 `c3d -overlap` 的输出.
///
/// 输出形如 `OVL: 1, 1200, 800, 400, 0.4, 0.25`, 取逗号分隔的第 1 到 3 个字段
/// (从 0 开始计), 分别为两者体积与交集体积. 字段缺失、不是数字或不是非负整数时返回错误描述.
pub fn parse_overlap_output(text: &str) -> Result<OverlapCount, String> {
    let fields: Vec<&str> = text.trim().split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(format!("expected at least 4 fields, got {:?}", text.trim()));
    }
    let mut nums = [0u64; 3];
    for (slot, field) in nums.iter_mut().zip(&fields[1..4]) {
        let v: f64 = field
            .parse()
            .map_err(|_| format!("non-numeric field {field:?} in {:?}", text.trim()))?;
        if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
            return Err(format!("field {field:?} is not a voxel count"));
        }
        *slot = v as u64;
    }
    let [volume_a, volume_b, overlap] = nums;
    Ok(OverlapCount {
        volume_a,
        volume_b,
        overlap,
    })
}

impl OverlapTool for CommandOverlap {
    fn overlap(&self, a: &Region, b: &Region, _ctx: &ExecContext) -> AtlasResult<OverlapCount> {
        let path_of = |r: &Region| {
            r.source_path()
                .map(Path::to_owned)
                .ok_or_else(|| AtlasError::MissingMask {
                    region: r.name().to_string(),
                    path: r.name().into(),
                })
        };
        let (pa, pb) = (path_of(a)?, path_of(b)?);
        let label = self.label.to_string();
        let command = format!(
            "{} {} {} -overlap {label}",
            self.program,
            pa.display(),
            pb.display()
        );
        let fail = |detail: String| AtlasError::ExternalTool {
            command: command.clone(),
            detail: format!("pair ({}, {}): {detail}", a.name(), b.name()),
        };

        debug!("Executing: {command}");
        let out = Command::new(&self.program)
            .arg(&pa)
            .arg(&pb)
            .arg("-overlap")
            .arg(&label)
            .output()
            .map_err(|e| fail(e.to_string()))?;
        if !out.status.success() {
            return Err(fail(format!(
                "exit status {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        parse_overlap_output(&String::from_utf8_lossy(&out.stdout)).map_err(fail)
    }
}

/// 两两重叠统计的对称缓存. 索引即 ROI 在 [`RegionSet`] 中的声明位置.
#[derive(Clone, Debug, PartialEq)]
pub struct PairwiseStats {
    volume: Vec<u64>,
    overlap: HashMap<(usize, usize), u64>,
}

/// 无序对的规范键.
#[inline]
fn key(i: usize, j: usize) -> (usize, usize) {
    (i.min(j), i.max(j))
}

impl PairwiseStats {
    /// 借助 `ctx` 并行统计 `regions` 的全部无序对 (含自身).
    ///
    /// 任一统计失败则整批失败, 不返回部分结果.
    pub fn compute<T: OverlapTool + ?Sized>(
        regions: &RegionSet,
        tool: &T,
        ctx: &ExecContext,
    ) -> AtlasResult<Self> {
        let pairs: Vec<(usize, usize)> = (0..regions.len())
            .combinations_with_replacement(2)
            .map(|v| (v[0], v[1]))
            .collect();
        info!(
            "Computing {} pairwise overlaps with {} workers",
            pairs.len(),
            ctx.workers()
        );

        let counts = ctx.map(&pairs, |&(i, j)| tool.overlap(&regions[i], &regions[j], ctx))?;

        let mut volume = vec![0u64; regions.len()];
        let mut overlap = HashMap::with_capacity(pairs.len());
        for (&(i, j), c) in pairs.iter().zip(counts.iter()) {
            if i == j {
                if c.volume_a != c.overlap || c.volume_b != c.overlap {
                    return Err(AtlasError::ExternalTool {
                        command: "self overlap".to_string(),
                        detail: format!(
                            "pair ({0}, {0}) gave volumes {1}, {2} and overlap {3}",
                            regions[i].name(),
                            c.volume_a,
                            c.volume_b,
                            c.overlap
                        ),
                    });
                }
                volume[i] = c.overlap;
            }
            overlap.insert(key(i, j), c.overlap);
        }
        for (&(i, j), c) in pairs.iter().zip(counts.iter()) {
            if c.overlap > volume[i].min(volume[j]) {
                return Err(AtlasError::ExternalTool {
                    command: "pairwise overlap".to_string(),
                    detail: format!(
                        "overlap of `{}` and `{}` is {}, larger than volumes {} and {}",
                        regions[i].name(),
                        regions[j].name(),
                        c.overlap,
                        volume[i],
                        volume[j]
                    ),
                });
            }
        }
        Ok(Self { volume, overlap })
    }

    /// 直接由体积和非自身无序对的交集构造. 缺失的对视为不重叠.
    ///
    /// 自身对的交集总是等于体积.
    pub fn from_parts<I: IntoIterator<Item = ((usize, usize), u64)>>(
        volume: Vec<u64>,
        pairs: I,
    ) -> Self {
        let mut overlap: HashMap<_, _> = pairs
            .into_iter()
            .map(|((i, j), v)| (key(i, j), v))
            .collect();
        for (i, &v) in volume.iter().enumerate() {
            overlap.insert((i, i), v);
        }
        Self { volume, overlap }
    }

    /// ROI 个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.volume.len()
    }

    /// 是否不包含任何 ROI?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.volume.is_empty()
    }

    /// 第 `i` 个 ROI 的体积. 越界时 panic.
    #[inline]
    pub fn volume(&self, i: usize) -> u64 {
        self.volume[i]
    }

    /// 第 `i` 与第 `j` 个 ROI 的交集体积, 与参数顺序无关.
    #[inline]
    pub fn overlap(&self, i: usize, j: usize) -> u64 {
        self.overlap.get(&key(i, j)).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Interrupt;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_parse_overlap_output() {
        let c = parse_overlap_output("OVL: 1, 1200, 800, 400, 0.4, 0.25\n").unwrap();
        assert_eq!(
            c,
            OverlapCount {
                volume_a: 1200,
                volume_b: 800,
                overlap: 400
            }
        );
        assert!(parse_overlap_output("").is_err());
        assert!(parse_overlap_output("OVL: 1, abc, 800, 400").is_err());
        assert!(parse_overlap_output("OVL: 1, 12.5, 800, 400").is_err());
        assert!(parse_overlap_output("Segmentation fault").is_err());
    }

    #[test]
    fn test_symmetric_stats() {
        let shape = (1, 1, 6);
        let masks = MemoryMasks::new()
            .with("1-a", MaskVolume::fake_from_positions(shape, (0..4).map(|w| (0, 0, w))))
            .with("2-b", MaskVolume::fake_from_positions(shape, (2..6).map(|w| (0, 0, w))));
        let set = RegionSet::from_names(["1-a", "2-b"]).unwrap();
        let ctx = ExecContext::new(Some(2), Interrupt::new()).unwrap();
        let tool = VoxelOverlap::load(&set, &masks, &ctx).unwrap();
        let stats = PairwiseStats::compute(&set, &tool, &ctx).unwrap();

        assert_eq!(stats.volume(0), 4);
        assert_eq!(stats.volume(1), 4);
        assert_eq!(stats.overlap(0, 1), 2);
        assert_eq!(stats.overlap(1, 0), 2);
        assert_eq!(stats.overlap(1, 1), 4);
    }

    #[test]
    fn test_shape_mismatch_names_pair() {
        let masks = MemoryMasks::new()
            .with("1-a", MaskVolume::fake_from_positions((1, 1, 2), [(0, 0, 0)]))
            .with("2-b", MaskVolume::fake_from_positions((1, 2, 2), [(0, 0, 0)]));
        let set = RegionSet::from_names(["1-a", "2-b"]).unwrap();
        let ctx = ExecContext::new(Some(1), Interrupt::new()).unwrap();
        let tool = VoxelOverlap::load(&set, &masks, &ctx).unwrap();
        match PairwiseStats::compute(&set, &tool, &ctx) {
            Err(AtlasError::ShapeMismatch { region, .. }) => assert_eq!(region, "1-a vs 2-b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    /// 统计开始后才触发中断, 并记录完成的统计次数.
    struct RaiseOnStart {
        inner: VoxelOverlap,
        interrupt: Interrupt,
        done: AtomicUsize,
    }

    impl OverlapTool for RaiseOnStart {
        fn overlap(&self, a: &Region, b: &Region, ctx: &ExecContext) -> AtlasResult<OverlapCount> {
            self.interrupt.raise();
            let ans = self.inner.overlap(a, b, ctx)?;
            self.done.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(ans)
        }
    }

    fn raising_tool(graceful: bool) -> (RegionSet, RaiseOnStart, ExecContext) {
        let shape = (8, 1, 2);
        let masks = MemoryMasks::new()
            .with("1-a", MaskVolume::fake_from_positions(shape, (0..8).map(|z| (z, 0, 0))))
            .with("2-b", MaskVolume::fake_from_positions(shape, (0..8).map(|z| (z, 0, 1))));
        let set = RegionSet::from_names(["1-a", "2-b"]).unwrap();
        let interrupt = Interrupt::new();
        let ctx = ExecContext::new(Some(1), interrupt.clone())
            .unwrap()
            .graceful(graceful);
        let tool = RaiseOnStart {
            inner: VoxelOverlap::load(&set, &masks, &ctx).unwrap(),
            interrupt,
            done: AtomicUsize::new(0),
        };
        (set, tool, ctx)
    }

    #[test]
    fn test_interrupt_within_slices() {
        let (set, tool, ctx) = raising_tool(false);
        let err = tool.overlap(&set[0], &set[1], &ctx).unwrap_err();
        assert!(err.is_interrupted());

        let (set, tool, ctx) = raising_tool(false);
        let err = PairwiseStats::compute(&set, &tool, &ctx).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(tool.done.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_graceful_finishes_started_slices() {
        let (set, tool, ctx) = raising_tool(true);
        let c = tool.overlap(&set[0], &set[1], &ctx).unwrap();
        assert_eq!((c.volume_a, c.volume_b, c.overlap), (8, 8, 0));

        // 已开始的统计完整结束, 但整批仍报告中断.
        let (set, tool, ctx) = raising_tool(true);
        let err = PairwiseStats::compute(&set, &tool, &ctx).unwrap_err();
        assert!(err.is_interrupted());
        assert!(tool.done.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[cfg(unix)]
    fn fake_c3d(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("c3d");
        let script = format!(
            "#!/bin/sh\n[ \"$3\" = -overlap ] && [ \"$4\" = 2 ] || exit 9\n{body}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn command_error(body: &str, names: &[&str]) -> String {
        let dir = tempfile::tempdir().unwrap();
        let tool = CommandOverlap::new(fake_c3d(dir.path(), body)).label(2);
        let set = RegionSet::from_names_in(names, dir.path()).unwrap();
        let ctx = ExecContext::new(Some(2), Interrupt::new()).unwrap();
        match PairwiseStats::compute(&set, &tool, &ctx) {
            Err(e @ AtlasError::ExternalTool { .. }) => e.to_string(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"if [ "$1" = "$2" ]; then echo "OVL: 2, 4, 4, 4"; else echo "OVL: 2, 4, 4, 1, 0.25"; fi"#;
        let tool = CommandOverlap::new(fake_c3d(dir.path(), body)).label(2);
        let set = RegionSet::from_names_in(["1-A", "2-B"], dir.path()).unwrap();
        let ctx = ExecContext::new(Some(2), Interrupt::new()).unwrap();
        let stats = PairwiseStats::compute(&set, &tool, &ctx).unwrap();
        assert_eq!(stats.volume(1), 4);
        assert_eq!(stats.overlap(1, 0), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_overlap_failures() {
        let pair = ["1-A", "2-B"];
        let self_ok = r#"if [ "$1" = "$2" ]; then echo "OVL: 2, 3, 3, 3"; exit 0; fi"#;

        let msg = command_error(&format!("{self_ok}\necho 'OVL: 1, nan-ish, 3, 2'"), &pair);
        assert!(msg.contains("pair (1-A, 2-B)"), "{msg}");
        assert!(msg.contains("nan-ish"), "{msg}");

        let msg = command_error(&format!("{self_ok}\necho oops >&2\nexit 2"), &pair);
        assert!(msg.contains("pair (1-A, 2-B)"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");

        let msg = command_error(&format!("{self_ok}\necho 'OVL: 2, 3, 3, 5'"), &pair);
        assert!(msg.contains("`1-A` and `2-B`"), "{msg}");

        let msg = command_error("echo 'OVL: 2, 3, 3, 2'", &["1-A"]);
        assert!(msg.contains("pair (1-A, 1-A)"), "{msg}");

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-c3d");
        let tool = CommandOverlap::new(missing.to_string_lossy());
        let set = RegionSet::from_names_in(pair, dir.path()).unwrap();
        let ctx = ExecContext::new(Some(1), Interrupt::new()).unwrap();
        match PairwiseStats::compute(&set, &tool, &ctx) {
            Err(AtlasError::ExternalTool { detail, .. }) => assert!(detail.contains("1-A")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_mask() {
        let set = RegionSet::from_names(["1-a"]).unwrap();
        let ctx = ExecContext::new(Some(1), Interrupt::new()).unwrap();
        let err = VoxelOverlap::load(&set, &MemoryMasks::new(), &ctx).unwrap_err();
        assert!(matches!(err, AtlasError::MissingMask { .. }));
    }
}
