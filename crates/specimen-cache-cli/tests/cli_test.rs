//! End-to-end tests for the `specimen-cache` binary.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn specimen_cache(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_specimen-cache"))
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("Failed to run specimen-cache")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[cfg(unix)]
fn write_config(dir: &Path) -> std::path::PathBuf {
    fs::create_dir_all(dir.join("scans")).unwrap();
    fs::write(dir.join("scans").join("sheet-1.jpg"), b"sheet one").unwrap();
    fs::write(dir.join("scans").join("sheet-2.jpg"), b"sheet two").unwrap();
    fs::write(
        dir.join("engine.sh"),
        "printf '{\"text\": \"Aster sp.\", \"confidence\": 0.9}'\n",
    )
    .unwrap();

    let config_path = dir.join("specimen-cache.toml");
    fs::write(
        &config_path,
        format!(
            r#"
state_dir = '{state}'

[storage]
kind = "local"
root = '{scans}'

[storage.cache]
dir = '{cache}'
max_bytes = 1048576

[engine]
name = "shell"
version = "1"
command = ["sh", '{engine}']
"#,
            state = dir.join("state").display(),
            scans = dir.join("scans").display(),
            cache = dir.join("copies").display(),
            engine = dir.join("engine.sh").display(),
        ),
    )
    .unwrap();
    config_path
}

#[test]
fn test_hash_command() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("abc.txt");
    fs::write(&file, b"abc").unwrap();

    let output = specimen_cache(&["hash", file.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(stdout(&output).starts_with("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"));
}

#[test]
fn test_show_rejects_malformed_hash() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("specimen-cache.toml");
    fs::write(&config, format!("state_dir = '{}'\n", dir.path().join("state").display())).unwrap();

    let output = specimen_cache(&["--config", config.to_str().unwrap(), "show", "not-a-hash"]);
    assert!(!output.status.success());
}

#[cfg(unix)]
#[test]
fn test_run_then_rerun_hits_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let config = config.to_str().unwrap();

    let first = specimen_cache(&["--config", config, "run", "--run-id", "first", "--all"]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    assert!(stdout(&first).contains("2 specimens (completed 2, cached 0, skipped 0, failed 0)"));

    let second = specimen_cache(&["--config", config, "run", "--run-id", "second", "--all"]);
    assert!(second.status.success());
    assert!(stdout(&second).contains("2 specimens (completed 0, cached 2, skipped 0, failed 0)"));

    let duplicate = specimen_cache(&["--config", config, "run", "--run-id", "second", "--all"]);
    assert!(!duplicate.status.success());

    let runs = stdout(&specimen_cache(&["--config", config, "runs"]));
    assert!(runs.contains("first"));
    assert!(runs.contains("second"));
    assert!(runs.contains("lookups: 2 (hits 0, misses 2, hit rate 0.0%)"));
    assert!(runs.contains("lookups: 2 (hits 2, misses 0, hit rate 100.0%)"));

    let lineage = stdout(&specimen_cache(&["--config", config, "lineage", "second"]));
    let entries: Vec<serde_json::Value> = lineage
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry["status"] == "cached"));

    let hash = String::from_utf8_lossy(
        &specimen_cache(&["hash", dir.path().join("scans").join("sheet-1.jpg").to_str().unwrap()]).stdout,
    )
    .split_whitespace()
    .next()
    .unwrap()
    .to_string();
    let shown = specimen_cache(&["--config", config, "show", &hash]);
    assert!(shown.status.success());
    let result: serde_json::Value = serde_json::from_slice(&shown.stdout).unwrap();
    assert_eq!(result["text"], "Aster sp.");
    assert_eq!(result["engine"], "shell");

    let exported = stdout(&specimen_cache(&["--config", config, "export"]));
    assert_eq!(exported.lines().count(), 2);

    let stats = stdout(&specimen_cache(&["--config", config, "cache", "stats"]));
    assert!(stats.contains("local copies: 2"));
    // Copy counters accumulate across both runs: two misses, then two hits.
    assert!(stats.contains("hits 2, misses 2, evictions 0, bypasses 0"));
    assert!(stats.contains("ocr results: 2 rows"));

    let cleared = stdout(&specimen_cache(&["--config", config, "cache", "clear"]));
    assert!(cleared.contains("Removed 2 local copies (18 bytes)"));
}
