//! Stamp the binary with a version and git SHA.
//!
//! - AVC_VERSION: release version (falls back to CARGO_PKG_VERSION)
//! - AVC_GIT_SHA: short commit (falls back to GITHUB_SHA, then `git rev-parse`)

use std::process::Command;

fn main() {
    let version = env_or("AVC_VERSION", || {
        std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into())
    });
    println!("cargo:rustc-env=AVC_VERSION={}", version);

    let git_sha = env_or("AVC_GIT_SHA", || {
        std::env::var("GITHUB_SHA")
            .ok()
            .map(|sha| sha.chars().take(7).collect())
            .unwrap_or_else(git_rev_parse)
    });
    println!("cargo:rustc-env=AVC_GIT_SHA={}", git_sha);

    for var in ["AVC_VERSION", "AVC_GIT_SHA", "GITHUB_SHA"] {
        println!("cargo:rerun-if-env-changed={}", var);
    }
}

fn env_or(name: &str, fallback: impl FnOnce() -> String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(fallback)
}

fn git_rev_parse() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into())
}
