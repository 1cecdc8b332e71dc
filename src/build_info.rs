// src/build_info.rs
use serde::Serialize;

/// Version and build metadata of the running binary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_commit: Option<&'static str>,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        git_commit: option_env!("GIT_HASH"),
        build_timestamp: env!("REGSCAN_BUILD_TIMESTAMP"),
        target: env!("REGSCAN_TARGET"),
        profile: env!("REGSCAN_PROFILE"),
    }
}

pub fn build_info_string() -> String {
    let info = build_info();
    format!(
        "version: {}, commit: {} built {} ({}, {})",
        info.version,
        info.git_commit.unwrap_or("unknown"),
        info.build_timestamp,
        info.target,
        info.profile
    )
}
