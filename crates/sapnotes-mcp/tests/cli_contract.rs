use assert_cmd::Command;
use predicates::str::contains;

fn sapnotes() -> Command {
    let mut cmd = Command::cargo_bin("sapnotes").expect("sapnotes binary");
    // Never pick up a real certificate or credential file from the developer's environment.
    cmd.env_remove("SAPNOTES_PFX_PATH")
        .env_remove("PFX_PATH")
        .env_remove("SAPNOTES_PFX_PASSPHRASE")
        .env_remove("PFX_PASSPHRASE")
        .env_remove("SAPNOTES_ENV_FILE")
        .env("SAPNOTES_TOKEN_CACHE", std::env::temp_dir().join("sapnotes-test-absent.json"));
    cmd
}

#[test]
fn version_text_output() {
    sapnotes()
        .args(["version", "--output", "text"])
        .assert()
        .success()
        .stdout(contains("sapnotes "));
}

#[test]
fn version_json_is_schema_versioned() {
    let out = sapnotes().arg("version").output().expect("run sapnotes version");
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(v["kind"], "version");
    assert_eq!(v["schema_version"], 1);
}

#[test]
fn doctor_reports_missing_certificate_without_secrets() {
    let out = sapnotes()
        .env("SAPNOTES_PFX_PASSPHRASE", "do-not-print-me")
        .arg("doctor")
        .output()
        .expect("run sapnotes doctor");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("do-not-print-me"));
    let v: serde_json::Value = serde_json::from_str(&stdout).expect("json");
    assert_eq!(v["kind"], "doctor");
    assert_eq!(v["passphrase_set"], true);
    let pfx = v["checks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "pfx_path_set")
        .unwrap()
        .clone();
    assert_eq!(pfx["ok"], false);
}

#[test]
fn doctor_text_output_lists_checks() {
    sapnotes()
        .args(["doctor", "--output", "text"])
        .assert()
        .success()
        .stdout(contains("checks:"));
}

#[test]
fn short_query_fails_before_any_login() {
    sapnotes()
        .args(["search", "a"])
        .assert()
        .failure()
        .stdout(contains("InvalidParamsError"));
}

#[test]
fn non_numeric_note_id_is_rejected() {
    sapnotes()
        .args(["get", "abc"])
        .assert()
        .failure()
        .stdout(contains("InvalidParamsError"));
}
