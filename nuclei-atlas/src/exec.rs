//! 执行上下文: 固定大小的工作池与中断标记.
//!
//! 每次运行创建一次, 显式地传给需要并行的步骤. 不存在进程级的全局池.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{AtlasError, AtlasResult};

/// 可在线程间共享的中断标记.
///
/// 克隆得到的实例共享同一个标记.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// 创建未触发的标记.
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发中断.
    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// 是否已经被触发?
    #[inline]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// 已触发时返回 [`AtlasError::Interrupted`].
    #[inline]
    pub fn check(&self) -> AtlasResult<()> {
        if self.is_raised() {
            Err(AtlasError::Interrupted)
        } else {
            Ok(())
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

        type Pool = rayon::ThreadPool;

        fn build_pool(workers: usize) -> AtlasResult<Pool> {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("atlas-worker-{i}"))
                .build()
                .map_err(|e| AtlasError::config(format!("cannot build worker pool: {e}")))
        }
    } else {
        /// 未启用 `rayon` 时, 所有任务在调用线程上依次运行.
        type Pool = ();

        fn build_pool(_workers: usize) -> AtlasResult<Pool> {
            Ok(())
        }
    }
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 一次运行的执行上下文.
pub struct ExecContext {
    #[allow(dead_code)]
    pool: Pool,
    workers: usize,
    interrupt: Interrupt,
    graceful: bool,
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("workers", &self.workers)
            .field("interrupted", &self.interrupt.is_raised())
            .field("graceful", &self.graceful)
            .finish()
    }
}

impl ExecContext {
    /// 创建包含 `workers` 个工作线程的上下文. `None` 表示使用全部可用核心.
    ///
    /// `workers` 为 0 时返回配置错误.
    pub fn new(workers: Option<usize>, interrupt: Interrupt) -> AtlasResult<Self> {
        let workers = workers.unwrap_or_else(cpus);
        if workers == 0 {
            return Err(AtlasError::config("number of processes must be positive"));
        }
        Ok(Self {
            pool: build_pool(workers)?,
            workers,
            interrupt,
            graceful: false,
        })
    }

    /// 设置优雅退出模式: 中断发生时, 已开始的任务会运行到结束,
    /// 只有尚未开始的任务被取消.
    pub fn graceful(mut self, graceful: bool) -> Self {
        self.graceful = graceful;
        self
    }

    /// 工作线程数.
    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 中断标记.
    #[inline]
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// 任务开始前的检查点. 中断已触发时返回 [`AtlasError::Interrupted`].
    #[inline]
    pub fn check(&self) -> AtlasResult<()> {
        self.interrupt.check()
    }

    /// 任务内部的检查点. 优雅模式下总是放行, 否则与 [`Self::check`] 相同.
    #[inline]
    pub fn checkpoint(&self) -> AtlasResult<()> {
        if self.graceful {
            Ok(())
        } else {
            self.interrupt.check()
        }
    }

    /// 对 `items` 的每一项执行 `op`, 并按输入顺序收集结果.
    ///
    /// 任一任务失败则整批失败. 若运行期间发生中断, 即使所有任务都已完成,
    /// 也会返回 [`AtlasError::Interrupted`], 以保证中断一定传递给调用者.
    pub fn map<T, R, F>(&self, items: &[T], op: F) -> AtlasResult<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> AtlasResult<R> + Sync + Send,
    {
        let task = |item: &T| -> AtlasResult<R> {
            self.check()?;
            op(item)
        };

        #[cfg(feature = "rayon")]
        let ans = self
            .pool
            .install(|| items.par_iter().map(task).collect::<AtlasResult<Vec<R>>>());
        #[cfg(not(feature = "rayon"))]
        let ans = items.iter().map(task).collect::<AtlasResult<Vec<R>>>();

        // 中断优先于其他错误.
        self.check()?;
        ans
    }
}
