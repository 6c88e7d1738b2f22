use tracing_subscriber::EnvFilter;

/// 默认日志过滤器
pub const DEFAULT_FILTER: &str = "ramon=info";

/// 初始化 tracing 订阅器
///
/// `RUST_LOG` 优先于传入的过滤器。重复调用是安全的，第二次起返回 false。
pub fn init(filter: Option<&str>) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
