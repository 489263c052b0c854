#[cfg(not(target_os = "android"))]
pub mod logging;
