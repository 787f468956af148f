use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn kinship() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kinship"))
}

#[test]
fn pack_then_compute_reports_the_related_pair() {
    let tmp = tempdir().expect("temporary directory");
    let table = tmp.path().join("genotypes.tsv");
    fs::write(
        &table,
        "# sample\tcalls\nA\t1111011\nB\t1111011\nC\t0000222\n",
    )
    .expect("write genotype table");
    let packed = tmp.path().join("packed");

    let status = kinship()
        .args(["pack", "--input"])
        .arg(&table)
        .args(["--output-dir", packed.to_str().expect("path str")])
        .status()
        .expect("run kinship pack");
    assert!(status.success(), "pack exited with status {status:?}");
    for name in ["A.king", "B.king", "C.king", "sample_map.json"] {
        assert!(packed.join(name).exists(), "{name} missing");
    }

    let output = tmp.path().join("kin.json");
    let status = kinship()
        .args(["compute", "--num-threads", "2", "--sample-map"])
        .arg(packed.join("sample_map.json"))
        .arg("--output")
        .arg(&output)
        .status()
        .expect("run kinship compute");
    assert!(status.success(), "compute exited with status {status:?}");

    let doc: serde_json::Value =
        serde_json::from_slice(&fs::read(&output).expect("read output")).expect("valid JSON");
    assert_eq!(doc, serde_json::json!({ "A": { "B": 0.5 } }));
}

#[test]
fn configuration_file_is_overridden_by_flags() {
    let tmp = tempdir().expect("temporary directory");
    let table = tmp.path().join("genotypes.tsv");
    fs::write(&table, "A\t1111\nB\t1111\n").expect("write genotype table");
    let status = kinship()
        .args(["pack", "--input"])
        .arg(&table)
        .args(["--output-dir", tmp.path().to_str().expect("path str")])
        .status()
        .expect("run kinship pack");
    assert!(status.success());

    let output = tmp.path().join("kin.json");
    let config = tmp.path().join("run.toml");
    fs::write(
        &config,
        format!(
            "sample_map = {:?}\noutput = {:?}\nkin_threshold = 0.9\n",
            tmp.path().join("sample_map.json").to_str().expect("path str"),
            output.to_str().expect("path str"),
        ),
    )
    .expect("write config");

    let status = kinship()
        .args(["compute", "--config"])
        .arg(&config)
        .args(["--kin-threshold", "0.25"])
        .status()
        .expect("run kinship compute");
    assert!(status.success(), "compute exited with status {status:?}");
    let doc: serde_json::Value =
        serde_json::from_slice(&fs::read(&output).expect("read output")).expect("valid JSON");
    assert_eq!(doc["A"]["B"], serde_json::json!(0.5));
}

#[test]
fn failures_exit_with_the_status_of_their_kind() {
    let tmp = tempdir().expect("temporary directory");

    let missing_map = kinship()
        .args(["compute", "--output"])
        .arg(tmp.path().join("kin.json"))
        .status()
        .expect("run kinship compute");
    assert_eq!(missing_map.code(), Some(2));

    let map = tmp.path().join("sample_map.json");
    fs::write(
        &map,
        format!(
            r#"{{"A": {:?}}}"#,
            tmp.path().join("absent.king").to_str().expect("path str")
        ),
    )
    .expect("write sample map");
    let unreadable = kinship()
        .args(["compute", "--sample-map"])
        .arg(&map)
        .arg("--output")
        .arg(tmp.path().join("kin.json"))
        .status()
        .expect("run kinship compute");
    assert_eq!(unreadable.code(), Some(3));
    assert!(!tmp.path().join("kin.json").exists());
}
