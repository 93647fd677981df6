use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const SECRET_VARS: &[&str] = &[
    "LWA_CLIENT_ID",
    "LWA_CLIENT_SECRET",
    "LWA_REFRESH_TOKEN",
    "LWA_REFRESH_TOKEN_NA",
    "LWA_REFRESH_TOKEN_EU",
    "LWA_REFRESH_TOKEN_FE",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

fn mpull_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mpull");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/warehouse.sqlite"

[fetch]
page_size = 50
max_pages = 3
filter_mode = "LastUpdated"

[sink]
orders_raw = "it_orders_raw"
"#,
        root.display()
    );

    let config_path = config_dir.join("mpull.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mpull(config_path: &Path, args: &[&str], env: &[(&str, &str)]) -> (String, String, bool) {
    let binary = mpull_binary();
    let mut cmd = Command::new(&binary);
    for var in SECRET_VARS {
        cmd.env_remove(var);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    let output = cmd
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mpull binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_mpull(&config, &["init"], &[]);
    assert!(success, "init failed: {}", stderr);

    let v = json(&stdout);
    assert_eq!(v["ok"], true);
    assert!(v["tables"]
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t == "it_orders_raw"));
    assert!(tmp.path().join("data/warehouse.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (_, _, first) = run_mpull(&config, &["init"], &[]);
    let (_, stderr, second) = run_mpull(&config, &["init"], &[]);
    assert!(first);
    assert!(second, "second init failed: {}", stderr);
}

#[test]
fn test_env_reports_presence_only() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_mpull(
        &config,
        &["env"],
        &[("LWA_CLIENT_ID", "cid-value"), ("LWA_REFRESH_TOKEN_EU", "rt-value")],
    );
    assert!(success);

    let v = json(&stdout);
    assert_eq!(v["ok"], false);
    assert_eq!(v["present"]["LWA_CLIENT_ID"], true);
    assert_eq!(v["present"]["LWA_CLIENT_SECRET"], false);
    assert_eq!(v["LWA_REFRESH_TOKEN_READY"], true);
    assert!(!stdout.contains("cid-value"));
    assert!(!stdout.contains("rt-value"));
}

#[test]
fn test_orders_dry_run() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_mpull(
        &config,
        &["orders", "--scope", "uk", "--date", "2024-07-01", "--dry"],
        &[],
    );
    assert!(success, "dry run failed: {}", stderr);

    let v = json(&stdout);
    assert_eq!(v["status"], "DRY_RUN");
    assert_eq!(v["scope"], "UK");
    assert_eq!(v["snapshot_date"], "2024-07-01");
    assert_eq!(v["params"]["filter_mode"], "LastUpdated");
    assert_eq!(v["params"]["page_size"], 50);
    // BST: local midnight is 23:00 UTC the day before
    assert_eq!(v["params"]["window"]["start_utc"], "2024-06-30T23:00:00Z");
}

#[test]
fn test_orders_without_credentials_fails_cleanly() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_mpull(
        &config,
        &["orders", "--scope", "NA", "--date", "2024-07-01", "--no-write"],
        &[],
    );
    assert!(!success);

    let v = json(&stdout);
    assert_eq!(v["ok"], false);
    assert_eq!(v["stage"], "auth");
}

#[test]
fn test_inventory_dry_run() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _, success) = run_mpull(&config, &["inventory", "--scope", "EU", "--dry"], &[]);
    assert!(success);

    let v = json(&stdout);
    assert_eq!(v["status"], "DRY_RUN");
    assert_eq!(v["params"]["pools"], serde_json::json!(["DE", "UK"]));
    assert_eq!(v["params"]["awd"], false);
}

#[test]
fn test_rejects_unknown_scope_and_bad_date() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_mpull(&config, &["orders", "--scope", "JP", "--dry"], &[]);
    assert!(!success);
    assert!(stderr.contains("unknown scope"));

    let (_, stderr, success) = run_mpull(
        &config,
        &["orders", "--scope", "EU", "--date", "15/01/2024", "--dry"],
        &[],
    );
    assert!(!success);
    assert!(stderr.contains("YYYY-MM-DD"));
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (stdout, stderr, success) = run_mpull(
        &missing,
        &["orders", "--scope", "EU", "--date", "2024-01-15", "--dry"],
        &[],
    );
    assert!(success, "{}", stderr);
    let v = json(&stdout);
    assert_eq!(v["params"]["page_size"], 100);
    assert_eq!(v["params"]["filter_mode"], "Created");
}
