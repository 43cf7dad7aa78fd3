//! Build metadata stamped into every fleetload binary.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildStamp {
    id: &'static str,
    time: &'static str,
    git: &'static str,
}

static STAMP: Lazy<BuildStamp> = Lazy::new(|| BuildStamp {
    id: option_env!("FLEETLOAD_BUILD_ID").unwrap_or("unknown build"),
    time: option_env!("FLEETLOAD_BUILD_TIME").unwrap_or("unknown time"),
    git: option_env!("FLEETLOAD_BUILD_GIT").unwrap_or("unknown git"),
});

/// Full build identifier, e.g. `v0.1.0-3-g8a4f1d2 | 2026-01-05 15:47:12 UTC`.
pub fn build_id() -> &'static str {
    STAMP.id
}

pub fn build_timestamp() -> &'static str {
    STAMP.time
}

pub fn git_label() -> &'static str {
    STAMP.git
}

/// Startup line logged by the daemon, the test-process host and the console.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!("{} {} ({})", package, version, build_id())
}
