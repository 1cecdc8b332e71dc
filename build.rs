// build.rs - Build metadata for regscan
//
// Exposes the build timestamp, target, profile and git commit to the crate
// through `cargo:rustc-env` so `build_info` can report them at runtime.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=build.rs");

    set_build_env_vars();
}

fn set_build_env_vars() {
    println!(
        "cargo:rustc-env=REGSCAN_BUILD_TIMESTAMP={}",
        chrono::Utc::now().to_rfc3339()
    );

    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=REGSCAN_TARGET={}", target);

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=REGSCAN_PROFILE={}", profile);

    // Outside a git checkout the hash is simply left unset
    let git_hash = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty());
    if let Some(hash) = git_hash {
        println!("cargo:rustc-env=GIT_HASH={}", hash);
    }
}
