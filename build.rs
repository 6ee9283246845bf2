use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=GIT_COMMIT");

    // An explicit GIT_COMMIT (release pipelines) wins over the local checkout.
    if env::var("GIT_COMMIT").is_ok_and(|v| !v.is_empty()) {
        return;
    }

    if let Some(commit) = short_commit() {
        println!("cargo:rustc-env=GIT_COMMIT={commit}");
    }
}

fn short_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if commit.is_empty() {
        None
    } else {
        Some(commit)
    }
}
