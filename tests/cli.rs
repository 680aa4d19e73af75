use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("robovm-test").unwrap()
}

#[test]
fn test_init_writes_template_once() {
    let dir = tempfile::tempdir().unwrap();

    cli()
        .arg("--basedir")
        .arg(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    let written = std::fs::read_to_string(dir.path().join("robovm-test.toml")).unwrap();
    assert!(written.contains("[target]"));

    cli()
        .arg("--basedir")
        .arg(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_validate_accepts_init_template() {
    let dir = tempfile::tempdir().unwrap();
    cli().arg("--basedir").arg(dir.path()).arg("init").assert().success();

    cli()
        .arg("--basedir")
        .arg(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Target: simulator (iphone)"));
}

#[test]
fn test_validate_rejects_bad_arch() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("robovm-test.toml"),
        "[compile]\narch = \"sparc\"\n",
    )
    .unwrap();

    cli()
        .arg("--basedir")
        .arg(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unsupported arch 'sparc'"));
}

#[test]
fn test_run_rejects_unknown_target() {
    cli()
        .args(["run", "--target", "watch"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown target 'watch'"));
}

#[test]
fn test_run_without_test_classes_fails_before_compiling() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("robovm-test.toml"),
        "[compile]\ncommand = \"/definitely/not/robovm\"\n",
    )
    .unwrap();

    cli()
        .arg("--basedir")
        .arg(dir.path())
        .args(["run", "--target", "simulator"])
        .assert()
        .failure();
}

const SIMCTL_JSON: &str = r#"{
  "devices": {
    "com.apple.CoreSimulator.SimRuntime.iOS-16-4": [
      {"name": "iPhone 14", "udid": "A1", "isAvailable": true}
    ],
    "com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
      {"name": "iPhone 15", "udid": "B2", "isAvailable": true},
      {"name": "iPad Air", "udid": "C3", "isAvailable": true}
    ],
    "com.apple.CoreSimulator.SimRuntime.watchOS-10-2": [
      {"name": "Apple Watch Series 9", "udid": "D4", "isAvailable": true}
    ]
  }
}"#;

#[test]
fn test_devices_from_json_selects_newest() {
    let dir = tempfile::tempdir().unwrap();
    let listing = dir.path().join("devices.json");
    std::fs::write(&listing, SIMCTL_JSON).unwrap();

    cli()
        .arg("devices")
        .arg("--from-json")
        .arg(&listing)
        .arg("--family")
        .arg("iphone")
        .assert()
        .success()
        .stdout(predicate::str::contains("Found 2 devices:"))
        .stdout(predicate::str::contains("Selected: iPhone-15 (iphone 17.2) [B2]"))
        .stdout(predicate::str::contains("Apple Watch").not());
}
