//! 优先级决策: 决定各 ROI 写入 atlas 的顺序. 越晚写入的 ROI 在重叠处胜出.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use ordered_float::OrderedFloat;

use crate::overlap::PairwiseStats;
use crate::region::RegionSet;
use crate::{AtlasError, AtlasResult};

/// 优先级策略.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Method {
    /// 按声明顺序写入.
    Numerical,

    /// 按重叠占自身体积的比例写入, 比例小的先写.
    #[default]
    Metric,
}

impl FromStr for Method {
    type Err = AtlasError;

    /// 不区分大小写.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "numerical" => Ok(Self::Numerical),
            "metric" => Ok(Self::Metric),
            _ => Err(AtlasError::config(format!(
                "unknown method `{s}`, expected `numerical` or `metric`"
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Numerical => "numerical",
            Self::Metric => "metric",
        })
    }
}

impl Method {
    /// 该策略是否需要两两重叠统计?
    #[inline]
    pub fn needs_stats(self) -> bool {
        matches!(self, Self::Metric)
    }
}

/// 写入顺序, 元素为 ROI 在 [`RegionSet`] 中的下标. 总是 `0..n` 的一个排列.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrecedenceOrder(Vec<usize>);

impl PrecedenceOrder {
    /// 声明顺序.
    pub fn declared(n: usize) -> Self {
        Self((0..n).collect())
    }

    /// 以切片形式访问.
    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// 按写入顺序迭代下标.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// 元素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 按写入顺序给出 ROI 名.
    pub fn names<'a>(&self, regions: &'a RegionSet) -> Vec<&'a str> {
        self.iter().map(|i| regions[i].name()).collect()
    }
}

/// 按 `method` 决定写入顺序.
///
/// `Metric` 策略需要 `stats`, 缺失时返回配置错误.
pub fn resolve(
    method: Method,
    regions: &RegionSet,
    stats: Option<&PairwiseStats>,
) -> AtlasResult<PrecedenceOrder> {
    let order = match (method, stats) {
        (Method::Numerical, _) => PrecedenceOrder::declared(regions.len()),
        (Method::Metric, Some(stats)) => by_metric(regions, stats)?,
        (Method::Metric, None) => {
            return Err(AtlasError::config(
                "metric precedence needs pairwise overlap statistics",
            ))
        }
    };
    info!("Precedence ({method}): {}", order.names(regions).join(" < "));
    Ok(order)
}

/// 比较第 `a` 与第 `b` 个 ROI.
///
/// 令 `ratio_a = overlap / volume_a`, `ratio_b = overlap / volume_b`.
/// `ratio_a < ratio_b` 时返回 `Less`, 即 `a` 先写入. 比较通过整数交叉相乘精确完成.
///
/// 任一体积为零时返回 [`AtlasError::DegenerateRegion`].
pub fn compare(
    regions: &RegionSet,
    stats: &PairwiseStats,
    a: usize,
    b: usize,
) -> AtlasResult<Ordering> {
    let nonzero = |i: usize| match stats.volume(i) {
        0 => Err(AtlasError::DegenerateRegion {
            region: regions[i].name().to_string(),
            volume: 0,
        }),
        v => Ok(u128::from(v)),
    };
    let (va, vb) = (nonzero(a)?, nonzero(b)?);
    let overlap = u128::from(stats.overlap(a, b));
    Ok((overlap * vb).cmp(&(overlap * va)))
}

/// 按重叠比例排序. 比较关系只是偏序, 因此在 "先于" 关系上做拓扑排序,
/// 每一步从入度为零的 ROI 中取声明最早的一个.
pub fn by_metric(regions: &RegionSet, stats: &PairwiseStats) -> AtlasResult<PrecedenceOrder> {
    let n = regions.len();
    if stats.len() != n {
        return Err(AtlasError::config(format!(
            "statistics cover {} regions, expected {n}",
            stats.len()
        )));
    }
    if n == 1 {
        return Ok(PrecedenceOrder::declared(1));
    }

    // succ[i]: 必须排在 i 之后的 ROI.
    let mut succ = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for a in 0..n {
        for b in (a + 1)..n {
            let (first, second) = match compare(regions, stats, a, b)? {
                Ordering::Less => (a, b),
                Ordering::Greater => (b, a),
                Ordering::Equal => continue,
            };
            debug!(
                "{} before {}: ratios {:.4} < {:.4}",
                regions[first].name(),
                regions[second].name(),
                ratio(stats, first, second),
                ratio(stats, second, first),
            );
            succ[first].push(second);
            indegree[second] += 1;
        }
    }

    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = match (0..n).find(|&i| !placed[i] && indegree[i] == 0) {
            Some(i) => i,
            None => {
                // 仅当统计数据自相矛盾时发生.
                let Some(i) = (0..n).find(|&i| !placed[i]) else {
                    break;
                };
                warn!(
                    "Cyclic precedence among remaining regions, emitting `{}` first",
                    regions[i].name()
                );
                i
            }
        };
        placed[next] = true;
        order.push(next);
        for &s in succ[next].iter() {
            indegree[s] = indegree[s].saturating_sub(1);
        }
    }
    Ok(PrecedenceOrder(order))
}

/// `overlap(i, j) / volume(i)`, 仅用于日志.
fn ratio(stats: &PairwiseStats, i: usize, j: usize) -> OrderedFloat<f64> {
    OrderedFloat(stats.overlap(i, j) as f64 / stats.volume(i).max(1) as f64)
}
