//! 3D 形态学操作.

use ndarray::Array3;

use super::LabelVolume;
use crate::consts::BACKGROUND;
use crate::{Idx3d, NiftiHeaderAttr};

impl LabelVolume {
    /// 灰度膨胀一次. 结构元为 6-邻域十字形 (含中心),
    /// 即每个体素取自身与前后上下左右六个邻居中的最大值.
    ///
    /// 对标签 atlas 而言, 这会让每个非零区域向外生长一层体素.
    /// 两个不同标签相邻处取较大的标签值.
    pub fn dilate(&self) -> Self {
        let mut out = Array3::<i32>::from_elem(self.data.dim(), BACKGROUND);
        for (pos, v) in out.indexed_iter_mut() {
            let here = self.data[pos];
            *v = self
                .diamond_neighbours(pos)
                .into_iter()
                .map(|p| self.data[p])
                .fold(here, i32::max);
        }
        Self::with_header(&self.header, out)
    }

    /// 按 `mask` 取值: `mask` 为前景的体素取 `self`, 否则取 `fill`.
    ///
    /// 形状不一致时 panic.
    pub(crate) fn select(&self, mask: &Array3<bool>, fill: &LabelVolume) -> Self {
        assert_eq!(self.data.dim(), mask.dim(), "选择掩膜形状不一致");
        assert_eq!(self.data.dim(), fill.data.dim(), "填充体积形状不一致");
        let mut data = fill.data.clone();
        ndarray::Zip::from(&mut data)
            .and(&self.data)
            .and(mask)
            .for_each(|out, &keep, &m| {
                if m {
                    *out = keep;
                }
            });
        Self::with_header(&self.header, data)
    }

    /// 获取 `pos` 前后上下左右六个点的坐标.
    ///
    /// 在数据范围外的坐标会被过滤掉, 不会包含在返回值中.
    fn diamond_neighbours(&self, (z, h, w): Idx3d) -> Vec<Idx3d> {
        self.check_collect([
            (z.wrapping_sub(1), h, w),
            (z.saturating_add(1), h, w),
            (z, h.wrapping_sub(1), w),
            (z, h.saturating_add(1), w),
            (z, h, w.wrapping_sub(1)),
            (z, h, w.saturating_add(1)),
        ])
    }

    /// 收集 `data` 中不越界的索引.
    #[inline]
    fn check_collect<B: FromIterator<Idx3d>, const N: usize>(&self, data: [Idx3d; N]) -> B {
        data.into_iter().filter(|p| self.check(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::LabelVolume;
    use ndarray::Array3;

    #[test]
    fn test_dilate_single_voxel() {
        let mut data = Array3::<i32>::zeros((3, 3, 3));
        data[(1, 1, 1)] = 17;
        let d = LabelVolume::fake(data).dilate();
        // 中心加六个邻居.
        assert_eq!(d.count(17), 7);
        assert_eq!(d[(0, 1, 1)], 17);
        assert_eq!(d[(1, 1, 2)], 17);
        // 对角不在十字形结构元内.
        assert_eq!(d[(0, 0, 1)], 0);
        assert_eq!(d[(0, 0, 0)], 0);
    }

    #[test]
    fn test_dilate_border_and_max() {
        let mut data = Array3::<i32>::zeros((1, 1, 4));
        data[(0, 0, 0)] = 17;
        data[(0, 0, 3)] = 18;
        let d = LabelVolume::fake(data).dilate();
        assert_eq!(d.data().iter().copied().collect::<Vec<_>>(), vec![17, 17, 18, 18]);

        let mut data = Array3::<i32>::zeros((1, 1, 3));
        data[(0, 0, 0)] = 17;
        data[(0, 0, 2)] = 18;
        let d = LabelVolume::fake(data).dilate();
        // 中间体素同时与两者相邻, 取较大值.
        assert_eq!(d.data().iter().copied().collect::<Vec<_>>(), vec![17, 18, 18]);
    }
}
