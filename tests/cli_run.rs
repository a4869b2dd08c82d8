use std::fs;
use std::process::Command;

use tempfile::tempdir;

const DESIGN: &str = "x\ty\tdate\ttemperature\n\
0.0\t1.0\t2021-01-01\t12.5\n\
1.0\t1.5\t2021-04-15\t\n\
2.0\t2.0\t2021-07-30\t25.0\n\
3.0\t2.5\t2021-12-31\t3.0\n\
4.0\t3.0\t2022-02-28\t8.0\n";

const POSTERIOR: &str = "terms = [\"intercept\", \"x\", \"doy_sin\", \"temperature\"]\n\
draws = [[0.0, 0.1, 0.5, 0.01], [0.1, 0.1, 0.4, 0.0], [-0.1, 0.2, 0.5, 0.02], [0.0, 0.15, 0.45, 0.01]]\n";

#[test]
fn run_then_summarize_writes_one_line_per_design_row() {
    let tmp = tempdir().expect("temporary directory");
    let design_path = tmp.path().join("design.tsv");
    let posterior_path = tmp.path().join("posterior.toml");
    fs::write(&design_path, DESIGN).expect("write design");
    fs::write(&posterior_path, POSTERIOR).expect("write posterior");
    let out_dir = tmp.path().join("stores");

    let exe = env!("CARGO_BIN_EXE_postscan");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "run",
            design_path.to_str().expect("path str"),
            "--posterior",
            posterior_path.to_str().expect("path str"),
            "--model-id",
            "cli-model",
            "--output-dir",
            out_dir.to_str().expect("path str"),
            "--draws",
            "4",
            "--chunk-size",
            "2",
            "--threshold",
            "1.5",
        ])
        .status()
        .expect("run postscan cli");
    assert!(status.success(), "CLI exited with status {status:?}");

    let model_dir = out_dir.join("cli-model");
    assert!(model_dir.join("summary.parquet").exists(), "summary.parquet missing");
    assert!(model_dir.join("manifest.toml").exists(), "manifest.toml missing");
    let summary = fs::read_to_string(model_dir.join("summary.tsv")).expect("read summary");
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with("row_id\tx\ty\tdate\tdate_label"));
    assert!(lines[1].contains("1 January 2021"));
    // The row with a missing covariate has no usable draws.
    let second: Vec<&str> = lines[2].split('\t').collect();
    assert_eq!(second[8], "NA");
    assert_eq!(second[9], "0");
    let fourth: Vec<&str> = lines[4].split('\t').collect();
    assert_eq!(fourth[9], "4");

    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "summarize",
            "--model-id",
            "cli-model",
            "--output-dir",
            out_dir.to_str().expect("path str"),
            "--threshold",
            "0.0",
            "--draws",
            "4",
            "--chunk-size",
            "2",
        ])
        .status()
        .expect("run postscan summarize");
    assert!(status.success(), "summarize exited with status {status:?}");
    let resummarized = fs::read_to_string(model_dir.join("summary.tsv")).expect("read summary");
    let first: Vec<&str> = resummarized.lines().nth(1).expect("first row").split('\t').collect();
    assert_eq!(first.last().copied(), Some("1"));
}

#[test]
fn invalid_model_ids_fail_before_any_work() {
    let tmp = tempdir().expect("temporary directory");
    let design_path = tmp.path().join("design.tsv");
    let posterior_path = tmp.path().join("posterior.toml");
    fs::write(&design_path, DESIGN).expect("write design");
    fs::write(&posterior_path, POSTERIOR).expect("write posterior");

    let output = Command::new(env!("CARGO_BIN_EXE_postscan"))
        .current_dir(tmp.path())
        .args([
            "run",
            design_path.to_str().expect("path str"),
            "--posterior",
            posterior_path.to_str().expect("path str"),
            "--model-id",
            "../escape",
            "--draws",
            "2",
            "--threshold",
            "1.0",
        ])
        .output()
        .expect("run postscan cli");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "unexpected stderr: {stderr}");
    assert!(!tmp.path().join("escape").exists());
}
