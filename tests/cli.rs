//! コマンドライン引数の扱い

use std::process::Command;

#[cfg(feature = "ml")]
#[test]
fn training_cli_rejects_wrong_argument_count() {
    let output = Command::new(env!("CARGO_BIN_EXE_image_finetune"))
        .arg("only_one_dir")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));

    let output = Command::new(env!("CARGO_BIN_EXE_image_finetune"))
        .args(["a", "b", "c"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn prepare_cli_requires_subcommand() {
    let output = Command::new(env!("CARGO_BIN_EXE_prepare")).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn prepare_cli_rolls_back_in_given_directory() {
    let dir = tempfile::tempdir().unwrap();
    let class_dir = dir.path().join("Abra");
    std::fs::create_dir_all(&class_dir).unwrap();
    std::fs::write(class_dir.join("Abra_0.jpeg"), b"x").unwrap();
    std::fs::write(class_dir.join("Abra_final.jpeg"), b"x").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_prepare"))
        .arg("rollback")
        .arg("--data-dir")
        .arg(dir.path())
        .status()
        .unwrap();
    assert!(status.success());
    assert!(!class_dir.join("Abra_0.jpeg").exists());
    assert!(class_dir.join("Abra_final.jpeg").exists());
}

#[cfg(feature = "ml")]
#[test]
fn training_cli_fails_on_unreadable_config() {
    let dir = tempfile::tempdir().unwrap();
    let malformed = dir.path().join("broken.json");
    std::fs::write(&malformed, "{ \"model\": ").unwrap();

    for config in [malformed, dir.path().join("missing.json")] {
        let model_dir = dir.path().join("model");
        let status = Command::new(env!("CARGO_BIN_EXE_image_finetune"))
            .arg(dir.path().join("data"))
            .arg(&model_dir)
            .arg("--config")
            .arg(&config)
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(1), "{}", config.display());
        assert!(!model_dir.exists());
    }
}

#[cfg(feature = "ml")]
#[test]
fn training_cli_fails_on_invalid_config_before_creating_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.json");
    std::fs::write(&config, r#"{"device_type": "Cpu", "model": {"num_classes": 1, "image_size": 32, "freeze_boundary": 0}, "training": {"num_epochs": 1, "top_epoch_divisor": 1, "batch_size": 1, "num_workers": 1, "learning_rate": 0.001, "fine_tune_learning_rate": 0.0001, "patience": 1, "seed": 9}}"#).unwrap();

    let model_dir = dir.path().join("model");
    let status = Command::new(env!("CARGO_BIN_EXE_image_finetune"))
        .arg(dir.path().join("data"))
        .arg(&model_dir)
        .arg("--config")
        .arg(&config)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
    assert!(!model_dir.exists());
    assert!(!dir.path().join("data/preview").exists());
}

#[test]
fn prepare_cli_rejects_unknown_log_level() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_prepare"))
        .arg("scan")
        .arg("--data-dir")
        .arg(dir.path())
        .args(["--log-level", "loud"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));

    let status = Command::new(env!("CARGO_BIN_EXE_prepare"))
        .arg("scan")
        .arg("--data-dir")
        .arg(dir.path())
        .args(["--log-level", "warn"])
        .status()
        .unwrap();
    assert!(status.success());
}
