pub mod cooldown;
pub mod persist;
pub mod unique;
pub mod window;

pub use cooldown::CooldownTracker;
pub use persist::StateSnapshot;
pub use unique::UniqueCache;
pub use window::WindowCounter;

/// 将监视器名称编码为文件名
///
/// 百分号编码是可逆的，不同名称不会落到同一个文件。
pub fn encode_name(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}
