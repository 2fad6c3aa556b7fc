/// ffmpeg command assertion utilities
#[allow(dead_code)]
pub fn assert_cmd_contains(cmd: &str, fragment: &str) {
    assert!(
        cmd.contains(fragment),
        "Expected command to contain '{}' but it didn't.\nCommand: {}",
        fragment,
        cmd
    );
}

#[allow(dead_code)]
pub fn assert_cmd_not_contains(cmd: &str, fragment: &str) {
    assert!(
        !cmd.contains(fragment),
        "Expected command to NOT contain '{}' but it did.\nCommand: {}",
        fragment,
        cmd
    );
}

/// Values are equal within `tol`
#[allow(dead_code)]
pub fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!(
        (actual - expected).abs() <= tol,
        "Expected {} within {} of {}",
        actual,
        tol,
        expected
    );
}
