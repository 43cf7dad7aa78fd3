use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=FLEETLOAD_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let git_label = git_revision().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("FLEETLOAD_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("{} | {}", git_label, build_time));

    println!("cargo:rustc-env=FLEETLOAD_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=FLEETLOAD_BUILD_TIME={}", build_time);
    println!("cargo:rustc-env=FLEETLOAD_BUILD_GIT={}", git_label);
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let label = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!label.is_empty()).then_some(label)
}
