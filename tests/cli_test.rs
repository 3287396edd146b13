//! Integration tests for the isostage binary.
//!
//! These run the real executable against temporary trees. The mastering
//! tool is replaced by a small shell script that writes a fixed image.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn isostage_bin() -> String {
    env!("CARGO_BIN_EXE_isostage").to_string()
}

fn isostage(config_home: &Path, args: &[&str]) -> Output {
    Command::new(isostage_bin())
        .args(args)
        // Keep any real user config out of the run
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn sample_tree(dir: &Path) {
    fs::write(dir.join("a.txt"), "aaaa").unwrap();
    fs::create_dir(dir.join("sub")).unwrap();
    fs::write(dir.join("sub/b.txt"), "bbbbbbbbbb").unwrap();
}

#[cfg(unix)]
fn fake_tool(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("fake-mkisofs");
    fs::write(
        &script,
        "#!/bin/sh\n\
         while [ $# -gt 0 ]; do\n\
           if [ \"$1\" = \"-o\" ]; then shift; printf 'fake image' > \"$1\"; fi\n\
           shift\n\
         done\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script.display().to_string()
}

// =============================================================================
// Configuration errors
// =============================================================================

#[test]
fn test_rejects_non_iso_destination() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    let dest = out.path().join("image.img");

    let output = isostage(
        out.path(),
        &[src.path().to_str().unwrap(), "-o", dest.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(".iso"), "stderr: {}", stderr);
    assert!(!out.path().join("image.img.state.json").exists());
}

#[test]
fn test_rejects_unknown_compression_before_staging() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    let dest = out.path().join("out.iso");

    let output = isostage(
        out.path(),
        &[
            src.path().to_str().unwrap(),
            "-o",
            dest.to_str().unwrap(),
            "--compression",
            "rar",
        ],
    );
    assert!(!output.status.success());
    assert!(!out.path().join("out.iso.staging").exists());
}

#[test]
fn test_rejects_missing_source() {
    let out = TempDir::new().unwrap();
    let missing = out.path().join("nope");
    let dest = out.path().join("out.iso");

    let output = isostage(
        out.path(),
        &[missing.to_str().unwrap(), "-o", dest.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn test_bad_config_file_is_reported() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    let config = out.path().join("config.toml");
    fs::write(&config, "checksum = \"crc32\"\n").unwrap();
    let dest = out.path().join("out.iso");

    let output = isostage(
        out.path(),
        &[
            src.path().to_str().unwrap(),
            "-o",
            dest.to_str().unwrap(),
            "--config",
            config.to_str().unwrap(),
        ],
    );
    assert_eq!(output.status.code(), Some(1));
}

// =============================================================================
// Dry run
// =============================================================================

#[test]
fn test_dry_run_lists_short_names() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    fs::write(src.path().join(".hidden"), "h").unwrap();
    let dest = out.path().join("out.iso");

    let output = isostage(
        out.path(),
        &[
            src.path().to_str().unwrap(),
            "-o",
            dest.to_str().unwrap(),
            "--dry-run",
        ],
    );
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let listed: Vec<&str> = stdout
        .lines()
        .filter_map(|l| l.split_once('\t'))
        .map(|(_, path)| path)
        .collect();
    assert_eq!(listed.len(), 3);
    assert!(listed.contains(&"a.txt"));
    assert!(listed.contains(&"sub"));
    assert!(listed.contains(&"sub/b.txt"));
    assert!(!stdout.contains(".hidden"));

    for line in stdout.lines().filter(|l| l.contains('\t')) {
        let short = line.split('\t').next().unwrap();
        assert_eq!(short.len(), 9, "expected /XXXXXXXX, got {}", short);
        assert!(short.starts_with('/'));
    }

    // Nothing written
    assert!(!dest.exists());
    assert!(!out.path().join("out.iso.state.json").exists());
    assert!(!out.path().join("out.iso.staging").exists());
}

// =============================================================================
// Full runs
// =============================================================================

#[cfg(unix)]
#[test]
fn test_full_run_with_fake_tool() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    let tool = fake_tool(out.path());
    let dest = out.path().join("out.iso");
    let mapping = out.path().join("mapping.json");

    let output = isostage(
        out.path(),
        &[
            src.path().to_str().unwrap(),
            "-o",
            dest.to_str().unwrap(),
            "--tool",
            &tool,
            "--checksum",
            "md5",
            "--mapping-out",
            mapping.to_str().unwrap(),
            "--label",
            "test_disc",
            "--no-progress",
        ],
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {}", stderr);

    let stdout = String::from_utf8_lossy(&output.stdout);
    use md5::Digest;
    let expected = format!("md5:{}", hex::encode(md5::Md5::digest(b"fake image")));
    assert!(stdout.contains(&expected), "stdout: {}", stdout);

    let rows: Vec<serde_json::Value> =
        serde_json::from_str(&fs::read_to_string(&mapping).unwrap()).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["path"], "a.txt");

    // Payloads staged under their short names
    let staging = out.path().join("out.iso.staging");
    for row in &rows {
        let id = row["short_id"].as_str().unwrap();
        assert!(staging.join(id).exists());
    }
    assert!(staging.join("graft-points.lst").exists());

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.path().join("out.iso.state.json")).unwrap())
            .unwrap();
    assert_eq!(state["version"], 1);
    assert_eq!(state["entries"]["sub/b.txt"]["processed"], true);

    // Second run resumes: everything already done
    let output = isostage(
        out.path(),
        &[
            src.path().to_str().unwrap(),
            "-o",
            dest.to_str().unwrap(),
            "--tool",
            &tool,
            "--no-progress",
        ],
    );
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0 files (0 bytes) staged"), "stdout: {}", stdout);
    assert!(stdout.contains("2 already done"), "stdout: {}", stdout);
}

#[cfg(unix)]
#[test]
fn test_fresh_keeps_state_until_preflight_passes() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    let tool = fake_tool(out.path());
    let dest = out.path().join("out.iso");
    let state_file = out.path().join("out.iso.state.json");
    let staging = out.path().join("out.iso.staging");
    let base = [
        src.path().to_str().unwrap(),
        "-o",
        dest.to_str().unwrap(),
        "--tool",
        &tool,
        "--no-progress",
    ];

    assert!(isostage(out.path(), &base).status.success());
    fs::write(staging.join("STRAY001"), "left over").unwrap();

    // Rejected prefix fails in preflight; nothing is cleared
    let mut args = base.to_vec();
    args.extend(["--fresh", "--mount-prefix", "../x"]);
    let output = isostage(out.path(), &args);
    assert_eq!(output.status.code(), Some(1));
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&state_file).unwrap()).unwrap();
    assert_eq!(state["entries"]["sub/b.txt"]["processed"], true);
    assert!(staging.join("STRAY001").exists());

    let mut args = base.to_vec();
    args.push("--fresh");
    let output = isostage(out.path(), &args);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 files (14 bytes) staged"), "stdout: {}", stdout);
    assert!(stdout.contains("0 already done"), "stdout: {}", stdout);
    assert!(!staging.join("STRAY001").exists());
}

#[test]
fn test_failing_tool_is_fatal_but_keeps_state() {
    let src = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    sample_tree(src.path());
    let dest = out.path().join("out.iso");

    let output = isostage(
        out.path(),
        &[
            src.path().to_str().unwrap(),
            "-o",
            dest.to_str().unwrap(),
            "--tool",
            "/nonexistent/mkisofs",
            "--no-progress",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Image authoring failed"));

    // Staged files are recorded so a rerun only needs the commit
    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.path().join("out.iso.state.json")).unwrap())
            .unwrap();
    assert_eq!(state["entries"]["a.txt"]["processed"], true);
}
