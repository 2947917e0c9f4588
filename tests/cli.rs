use assert_cmd::Command;

fn wledflasher() -> Command {
    let mut cmd = Command::cargo_bin("wledflasher").unwrap();
    cmd.env_remove("WLEDFLASHER_PORT");
    cmd
}

#[test]
fn help_exits_successfully() {
    wledflasher().arg("--help").assert().success();
}

#[test]
fn usage_errors_exit_with_one() {
    wledflasher().assert().code(1);
    wledflasher()
        .args(["--esp32", "--esp8266", "firmware.bin"])
        .assert()
        .code(1);
}

#[test]
fn unreadable_binary_is_reported_on_one_line() {
    let output = wledflasher()
        .args(["--port", "/dev/null", "/nonexistent/firmware.bin"])
        .assert()
        .code(1)
        .get_output()
        .clone();

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines = stderr
        .lines()
        .filter(|line| line.contains("Failed to open file"))
        .collect::<Vec<_>>();
    assert_eq!(lines.len(), 1, "{stderr}");
    assert!(lines[0].contains("/nonexistent/firmware.bin"));
}
