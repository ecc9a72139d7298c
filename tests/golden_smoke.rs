use std::process::Command;

#[test]
fn golden_smoke_decodes_a_capture() {
    let tmp = tempfile::tempdir().unwrap();
    let in_path = tmp.path().join("capture.st270");
    let out_path = tmp.path().join("out.json");

    std::fs::write(
        &in_path,
        concat!(
            "ST270ALV;DEV1\r",
            "ST270STT;DEV1;1.0;20160901;121500;CELL1;55.7500;37.6100;60;180;8;7;1;100;0;0;1500;120;0;0;0;0;0;0;0;0;0;M;123\r",
            "ST270EVT;DEV2;1.0;20160901;12:16:00;CELL1;55.7600;37.6200;0;0;9;6;1;100;0;0;2500;120;0;0;0;0;0;0;0;0;E1\r",
            "garbage\r",
            "ST270STT;DEV3;1.0\r",
        ),
    )
    .unwrap();

    let exe = env!("CARGO_BIN_EXE_tracker-daemon");
    let status = Command::new(exe)
        .args([
            "decode",
            "--file",
            in_path.to_str().unwrap(),
            "--type",
            "st270",
            "--out",
            out_path.to_str().unwrap(),
        ])
        .status()
        .unwrap();

    assert!(status.success());
    let out: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out_path).unwrap()).unwrap();
    assert_eq!(out["type"], "decode");
    assert_eq!(out["heartbeats"], 1);
    assert_eq!(out["corrupt"], 1);
    assert_eq!(out["short"], 1);

    let fixes = out["fixes"].as_array().unwrap();
    assert_eq!(fixes.len(), 2);
    assert_eq!(fixes[0]["num"], "DEV1");
    assert_eq!(fixes[0]["type"], "st270");
    assert_eq!(fixes[0]["datetime"], "2016-09-01 12:15:00");
    assert_eq!(fixes[1]["num"], "DEV2");
    assert_eq!(fixes[1]["odometer"], 2);
}

#[test]
fn check_rejects_a_bad_config() {
    let tmp = tempfile::tempdir().unwrap();
    let conf = tmp.path().join("trackerd.json");
    std::fs::write(&conf, r#"{"workers":1,"host":"0.0.0.0","db":["postgres://x"],"ports":[{"num":20100,"parser":"nope","typename":"x"}]}"#).unwrap();

    let exe = env!("CARGO_BIN_EXE_tracker-daemon");
    let status = Command::new(exe)
        .args(["check", "--config", conf.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(!status.success());
}
