//! Default filesystem locations.

/// Persistence root used when a `dir` directive carries no path.
pub const LARDER_STATE_DIR: &str = "/var/lib/larder";

/// Prepend the configuration directory to a file name.
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => (concat!("/etc/larder", $subdir))
}
