use std::collections::BTreeSet;
use std::ops::Index;
use std::path::Path;

use ndarray::{Array3, ArrayView3, Axis, Zip};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::{is_background, BACKGROUND, MASK_OFF, MASK_ON};
use crate::{AtlasError, AtlasResult, Idx3d};

mod morph;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    // [W, H, z]. 体素个数数组.
    let [_, w, h, z, ..] = h.dim;
    (z as usize, h as usize, w as usize)
}

/// 让 `header` 的维度信息与 `(z, h, w)` 形状一致.
fn sync_header_dim(header: &mut NiftiHeader, (z, h, w): Idx3d) {
    header.dim = [3, w as u16, h as u16, z as u16, 1, 1, 1, 1];
}

/// 构造一个只包含形状信息的 header. 体素分辨率为 1mm 各向同性.
fn fake_header(shape: Idx3d) -> BoxedHeader {
    let mut header = Box::<NiftiHeader>::default();
    sync_header_dim(&mut header, shape);
    let [_, pw, ph, pz, ..] = &mut header.pixdim;
    (*pw, *ph, *pz) = (1.0, 1.0, 1.0);
    header.intent_name[..4].copy_from_slice(b"fake");
    header
}

/// 读取 nii 文件, 统一转换为 `f32` 并按 (z, H, W) 重新排列.
fn read_f32(path: &Path) -> AtlasResult<(BoxedHeader, Array3<f32>)> {
    let obj = ReaderOptions::new().read_file(path)?;
    let header = Box::new(obj.header().clone());
    let shape = get_shape_from_header(&header);

    // [W, H, z, ..] -> [.., z, H, W].
    // hint: 原第一维变化最快, 转置后按行优先遍历即得到 (z, H, W) 的标准布局.
    let data = obj.into_volume().into_ndarray::<f32>()?;
    let raw: Vec<f32> = data.t().iter().copied().collect();
    let found = raw.len();
    let data = Array3::from_shape_vec(shape, raw).map_err(|_| AtlasError::ShapeMismatch {
        region: path.display().to_string(),
        expected: shape,
        found: (found, 1, 1),
    })?;
    Ok((header, data))
}

/// 为写出形状为 `shape` 的数据准备 header, 并确保目标目录存在.
fn prepare_write(path: &Path, header: &NiftiHeader, shape: Idx3d) -> AtlasResult<NiftiHeader> {
    let mut header = header.clone();
    sync_header_dim(&mut header, shape);
    // 数据已经是最终值, 不需要写入端再做线性变换.
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    Ok(header)
}

/// 3D nii 文件 header 的共用属性和部分通用操作.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小.
    #[inline]
    fn shape(&self) -> Idx3d {
        get_shape_from_header(self.header())
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素分辨率 (毫米), 顺序为 (z, H, W).
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, w, h, z, ..] = self.header().pixdim;
        [z as f64, h as f64, w as f64]
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }

    /// 要求 `other` 与自身形状一致. 不一致时返回 [`AtlasError::ShapeMismatch`],
    /// 其中 `region` 用于标识 `other`.
    fn ensure_same_shape<O: NiftiHeaderAttr>(&self, other: &O, region: &str) -> AtlasResult<()> {
        if self.shape() == other.shape() {
            Ok(())
        } else {
            Err(AtlasError::ShapeMismatch {
                region: region.to_string(),
                expected: self.shape(),
                found: other.shape(),
            })
        }
    }
}

/// 二值 ROI 掩膜. 体素只可能是 [`MASK_OFF`] 或 [`MASK_ON`].
#[derive(Debug, Clone)]
pub struct MaskVolume {
    header: BoxedHeader,
    data: Array3<u8>,
}

impl NiftiHeaderAttr for MaskVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for MaskVolume {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl MaskVolume {
    /// 打开 nii 文件格式的 ROI 掩膜. 所有非零体素都被视为前景 (`-bin`).
    pub fn open<P: AsRef<Path>>(path: P) -> AtlasResult<Self> {
        let (header, data) = read_f32(path.as_ref())?;
        let data = data.mapv(|v| if v != 0.0 { MASK_ON } else { MASK_OFF });
        Ok(Self { header, data })
    }

    /// 以 `header` 为参考, 从任意 `u8` 数据构造掩膜. 非零值都会被二值化.
    pub fn with_header(header: &NiftiHeader, data: Array3<u8>) -> Self {
        let mut header = Box::new(header.clone());
        sync_header_dim(&mut header, data.dim());
        let data = data.mapv(|v| if v != MASK_OFF { MASK_ON } else { MASK_OFF });
        Self { header, data }
    }

    /// 根据裸数据直接创建掩膜, header 只包含形状信息.
    ///
    /// # 注意
    ///
    /// 该方法创建的实体不对应任何真实扫描, 你应仅将其用于实验目的.
    pub fn fake(data: Array3<u8>) -> Self {
        let header = fake_header(data.dim());
        Self::with_header(&header, data)
    }

    /// 在形状为 `shape` 的空白掩膜上, 把 `positions` 给出的体素设为前景.
    ///
    /// 越界索引会导致 panic.
    pub fn fake_from_positions<I: IntoIterator<Item = Idx3d>>(shape: Idx3d, positions: I) -> Self {
        let mut data = Array3::<u8>::zeros(shape);
        for pos in positions {
            data[pos] = MASK_ON;
        }
        Self::fake(data)
    }

    /// 存储为 nii 文件 (`u8`).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AtlasResult<()> {
        let path = path.as_ref();
        let header = prepare_write(path, &self.header, self.data.dim())?;
        // [z, H, W] -> [W, H, z].
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.data.view().permuted_axes([2, 1, 0]))?;
        Ok(())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    /// 前景体素个数.
    #[inline]
    pub fn volume(&self) -> u64 {
        self.data.iter().filter(|&&v| v != MASK_OFF).count() as u64
    }

    /// 与 `other` 同时为前景的体素个数. 形状不一致时 panic.
    pub fn intersection(&self, other: &MaskVolume) -> u64 {
        assert_eq!(self.shape(), other.shape(), "掩膜形状不一致");
        Zip::from(&self.data)
            .and(&other.data)
            .fold(0u64, |acc, &a, &b| acc + u64::from(a != MASK_OFF && b != MASK_OFF))
    }

    /// 第 `z_index` 层水平切片上与 `other` 同时为前景的体素个数.
    pub(crate) fn intersection_at(&self, other: &MaskVolume, z_index: usize) -> u64 {
        let a = self.data.index_axis(Axis(0), z_index);
        let b = other.data.index_axis(Axis(0), z_index);
        Zip::from(&a)
            .and(&b)
            .fold(0u64, |acc, &a, &b| acc + u64::from(a != MASK_OFF && b != MASK_OFF))
    }

    /// 第 `z_index` 层水平切片上的前景体素个数.
    pub(crate) fn volume_at(&self, z_index: usize) -> u64 {
        self.data
            .index_axis(Axis(0), z_index)
            .iter()
            .filter(|&&v| v != MASK_OFF)
            .count() as u64
    }

    /// 水平切片个数.
    #[inline]
    pub fn len_z(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// 生成标签层: 前景体素为 `label`, 其余为背景 (`-bin -mul label`).
    pub fn to_label_layer(&self, label: i32) -> Array3<i32> {
        self.data
            .mapv(|v| if v != MASK_OFF { label } else { BACKGROUND })
    }
}

/// 整数标签 atlas. 背景为 [`BACKGROUND`], 其余值为 ROI 的标签.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    header: BoxedHeader,
    data: Array3<i32>,
}

impl NiftiHeaderAttr for LabelVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for LabelVolume {
    type Output = i32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl LabelVolume {
    /// 打开 nii 文件格式的标签 atlas. 浮点体素值会被四舍五入为整数.
    pub fn open<P: AsRef<Path>>(path: P) -> AtlasResult<Self> {
        let (header, data) = read_f32(path.as_ref())?;
        let data = data.mapv(|v| v.round() as i32);
        Ok(Self { header, data })
    }

    /// 创建与 `reference` 形状、空间信息相同的全背景 atlas (`CreateImage ... 0`).
    pub fn zeros_like<R: NiftiHeaderAttr>(reference: &R) -> Self {
        let mut header = Box::new(reference.header().clone());
        let shape = reference.shape();
        sync_header_dim(&mut header, shape);
        Self {
            header,
            data: Array3::zeros(shape),
        }
    }

    /// 以 `header` 为参考, 从裸数据构造 atlas.
    pub fn with_header(header: &NiftiHeader, data: Array3<i32>) -> Self {
        let mut header = Box::new(header.clone());
        sync_header_dim(&mut header, data.dim());
        Self { header, data }
    }

    /// 根据裸数据直接创建 atlas, header 只包含形状信息.
    ///
    /// # 注意
    ///
    /// 该方法创建的实体不对应任何真实扫描, 你应仅将其用于实验目的.
    pub fn fake(data: Array3<i32>) -> Self {
        let header = fake_header(data.dim());
        Self { header, data }
    }

    /// 存储为 nii 文件 (`i32`).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AtlasResult<()> {
        let path = path.as_ref();
        let header = prepare_write(path, &self.header, self.data.dim())?;
        // [z, H, W] -> [W, H, z].
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.data.view().permuted_axes([2, 1, 0]))?;
        Ok(())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, i32> {
        self.data.view()
    }

    /// 获取值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: i32) -> usize {
        self.data.iter().filter(|&&p| p == label).count()
    }

    /// 除背景外出现过的所有标签值, 升序.
    pub fn labels(&self) -> BTreeSet<i32> {
        self.data
            .iter()
            .copied()
            .filter(|&p| !is_background(p))
            .collect()
    }

    /// 提取值为 `label` 的体素组成的二值掩膜 (`ThresholdImage label label`).
    pub fn threshold(&self, label: i32) -> MaskVolume {
        let data = self
            .data
            .mapv(|p| if p == label { MASK_ON } else { MASK_OFF });
        MaskVolume::with_header(&self.header, data)
    }

    /// overadd: `layer` 中的非零体素覆盖自身对应体素, 零体素保持不变.
    ///
    /// 形状不一致时 panic, 调用者应当提前检查.
    pub fn overadd(&mut self, layer: ArrayView3<'_, i32>) {
        assert_eq!(self.data.dim(), layer.dim(), "标签层形状不一致");
        let zip = Zip::from(&mut self.data).and(&layer);
        let stamp = |acc: &mut i32, &new: &i32| {
            if !is_background(new) {
                *acc = new;
            }
        };
        #[cfg(feature = "rayon")]
        zip.par_for_each(stamp);
        #[cfg(not(feature = "rayon"))]
        zip.for_each(stamp);
    }

    /// 左右翻转 (nifti 的 x 方向, 即此处的宽度方向).
    pub fn flip_lr(&self) -> Self {
        let mut data = self.data.clone();
        data.invert_axis(Axis(2));
        let data = data.as_standard_layout().to_owned();
        Self::with_header(&self.header, data)
    }

    /// 逐体素相加, 用于合并左右半球 atlas.
    ///
    /// 形状不一致或者相加溢出 `i32` 时返回错误.
    pub fn combine(&self, other: &LabelVolume) -> AtlasResult<Self> {
        self.ensure_same_shape(other, "combined volume")?;
        let mut data = Array3::<i32>::zeros(self.data.dim());
        let mut overflow = None;
        Zip::indexed(&mut data)
            .and(&self.data)
            .and(&other.data)
            .for_each(|position, out, &a, &b| match a.checked_add(b) {
                Some(v) => *out = v,
                None => {
                    overflow.get_or_insert(AtlasError::LabelOverflow { position, a, b });
                }
            });
        match overflow {
            Some(e) => Err(e),
            None => Ok(Self::with_header(&self.header, data)),
        }
    }
}

/// 任意标量影像 (如 T1 加权像), 体素值保持为 `f32`.
///
/// 只用于流水线中需要原样翻转的被试影像.
#[derive(Debug, Clone)]
pub struct ImageVolume {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl NiftiHeaderAttr for ImageVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl ImageVolume {
    /// 打开 nii 文件.
    pub fn open<P: AsRef<Path>>(path: P) -> AtlasResult<Self> {
        let (header, data) = read_f32(path.as_ref())?;
        Ok(Self { header, data })
    }

    /// 根据裸数据直接创建影像, header 只包含形状信息.
    pub fn fake(data: Array3<f32>) -> Self {
        let header = fake_header(data.dim());
        Self { header, data }
    }

    /// 存储为 nii 文件 (`f32`).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AtlasResult<()> {
        let path = path.as_ref();
        let header = prepare_write(path, &self.header, self.data.dim())?;
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&self.data.view().permuted_axes([2, 1, 0]))?;
        Ok(())
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// 左右翻转, 与 [`LabelVolume::flip_lr`] 相同.
    pub fn flip_lr(&self) -> Self {
        let mut data = self.data.clone();
        data.invert_axis(Axis(2));
        Self {
            header: self.header.clone(),
            data: data.as_standard_layout().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_mask_binarize_and_volume() {
        let m = MaskVolume::fake(array![[[0, 3], [1, 0]], [[0, 0], [255, 1]]]);
        assert_eq!(m.volume(), 4);
        assert_eq!(m[(0, 0, 1)], MASK_ON);
        assert_eq!(m.shape(), (2, 2, 2));
        assert_eq!(m.len_z(), 2);
    }

    #[test]
    fn test_overadd() {
        let mut v = LabelVolume::fake(array![[[1, 1, 0, 0]]]);
        v.overadd(array![[[0, 2, 2, 0]]].view());
        assert_eq!(v.data(), array![[[1, 2, 2, 0]]]);
    }

    #[test]
    fn test_threshold_and_labels() {
        let v = LabelVolume::fake(array![[[0, 4, 4], [7, 0, 4]]]);
        assert_eq!(v.labels().into_iter().collect::<Vec<_>>(), vec![4, 7]);
        assert_eq!(v.threshold(4).volume(), 3);
        assert_eq!(v.threshold(5).volume(), 0);
        assert_eq!(v.count(0), 2);
    }

    #[test]
    fn test_flip_and_combine() {
        let v = LabelVolume::fake(array![[[1, 2, 3]]]);
        let f = v.flip_lr();
        assert_eq!(f.data(), array![[[3, 2, 1]]]);
        assert_eq!(f.flip_lr(), v);

        let img = ImageVolume::fake(array![[[0.5, 1.5, 2.5]]]);
        assert_eq!(img.flip_lr().data(), array![[[2.5, 1.5, 0.5]]]);

        let c = v.combine(&f).unwrap();
        assert_eq!(c.data(), array![[[4, 4, 4]]]);

        let big = LabelVolume::fake(array![[[i32::MAX, 0, 0]]]);
        match big.combine(&v) {
            Err(AtlasError::LabelOverflow { position, a, b }) => {
                assert_eq!(position, (0, 0, 0));
                assert_eq!((a, b), (i32::MAX, 1));
            }
            other => panic!("unexpected {other:?}"),
        }

        let other = LabelVolume::fake(Array3::zeros((2, 1, 3)));
        assert!(matches!(
            v.combine(&other),
            Err(AtlasError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_zeros_like_keeps_shape() {
        let m = MaskVolume::fake_from_positions((3, 4, 5), [(0, 0, 0)]);
        let v = LabelVolume::zeros_like(&m);
        assert_eq!(v.shape(), (3, 4, 5));
        assert_eq!(v.labels().len(), 0);
    }
}
