//! 命令行工具依赖的通用组件.

use log::{info, warn, LevelFilter};
use nuclei_atlas::exec::Interrupt;
use simple_logger::SimpleLogger;
use std::env;
use std::path::PathBuf;
use std::thread;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

/// 初始化日志. `verbose` 为真时输出调试信息.
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    // 重复初始化只会发生在测试中, 忽略即可.
    let _ = SimpleLogger::new().with_level(level).init();
}

/// 获取 ROI 掩膜目录.
///
/// 1. 若给出了 `arg`, 则返回其值;
/// 2. 若环境变量 `$NUCLEI_MASK_DIR` 非空, 则返回其值;
/// 3. 否则, 返回当前目录.
pub fn mask_dir_from_env_or(arg: Option<PathBuf>) -> PathBuf {
    if let Some(d) = arg {
        return d;
    }
    match env::var("NUCLEI_MASK_DIR") {
        Ok(d) if !d.is_empty() => PathBuf::from(d),
        _ => PathBuf::from("."),
    }
}

/// 收到 Ctrl-C 时触发 `interrupt`.
///
/// 信号在独立线程上的单线程 tokio 运行时中等待.
pub fn install_ctrl_c(interrupt: &Interrupt) {
    let flag = interrupt.clone();
    let spawned = thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("Cannot listen for Ctrl-C: {e}");
                    return;
                }
            };
            if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                info!("Received Ctrl-C, stopping");
                flag.raise();
            }
        });
    if let Err(e) = spawned {
        warn!("Cannot spawn Ctrl-C listener: {e}");
    }
}
