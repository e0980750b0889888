use tracing_subscriber::EnvFilter;

/// 默认日志级别，可用 `RUST_LOG` 覆盖
const DEFAULT_FILTER: &str = "info";

/// 安装全局日志订阅者，输出到 stderr
///
/// 只应由可执行程序调用一次；重复调用会被忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
