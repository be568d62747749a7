// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=RAWENC_VERSION");

    // Packagers can pin the version when building outside a git checkout
    let version = match std::env::var("RAWENC_VERSION") {
        Ok(v) => v,
        Err(_) => describe_version(),
    };

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// Build a version string from `git describe`
///
/// - exact tag `v0.1.0` becomes `0.1.0-abcdef1`
/// - `v0.1.0-5-gabcdef1` becomes `0.1.0-dirty-abcdef1`
/// - no git at all falls back to the crate version
fn describe_version() -> String {
    let fallback = std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());

    let Some(described) = git(&["describe", "--tags", "--always", "--match", "v*"]) else {
        return fallback;
    };
    let described = described.strip_prefix('v').unwrap_or(&described);

    let parts: Vec<&str> = described.rsplitn(3, '-').collect();
    if parts.len() == 3 {
        let hash = parts[0].strip_prefix('g').unwrap_or(parts[0]);
        return format!("{}-dirty-{}", parts[2], hash);
    }

    // `--always` yields a bare hash when no tag matches
    if !described.contains('.') {
        return format!("{}-{}", fallback, described);
    }

    match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) => format!("{}-{}", described, hash),
        None => described.to_string(),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
