//! End-to-end pipeline scenarios: homoglyph rejection, blocked commands
//! behind paths and extensions, and path traversal containment.

use std::collections::HashMap;

use shellgate::config::{SecuritySettings, ServerConfig, ShellProfile};
use shellgate::security::{ErrorCode, PolicyEngine, PolicyError};

fn profile() -> ShellProfile {
    let config = ServerConfig::default();
    config
        .shells
        .get("bash")
        .or_else(|| config.shells.get("cmd"))
        .expect("default shells")
        .clone()
}

fn engine_with(f: impl FnOnce(&mut SecuritySettings)) -> PolicyEngine {
    let mut settings = SecuritySettings::default();
    f(&mut settings);
    PolicyEngine::from_settings(&settings).expect("policy compiles")
}

#[test]
fn homoglyph_pipe_is_rejected_with_sec002() {
    let engine = engine_with(|_| {});
    let err = engine
        .validate("powershell", &profile(), "dir \u{FF5C} del", None, None)
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::BlockedOperator);
    assert_eq!(err.code().as_str(), "SEC002");
    let text = err.to_string();
    assert!(
        text.contains("Unicode variant of blocked operator: |"),
        "message was: {text}"
    );
    assert!(text.contains("U+FF5C"));
}

#[test]
fn bidi_override_is_rejected_with_codepoint_disclosed() {
    let engine = engine_with(|_| {});
    let err = engine
        .validate("bash", &profile(), "echo \u{202E}exe.gpj", None, None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MalformedCommand);
    assert!(err.to_string().contains("U+202E"));
}

#[test]
fn blocked_command_behind_path_and_extension() {
    let engine = engine_with(|_| {});
    let err = engine
        .validate("powershell", &profile(), r"C:\tools\RM.EXE -rf /", None, None)
        .unwrap_err();

    assert_eq!(err, PolicyError::BlockedCommand { name: "rm".into() });
    let reason = err.to_string().to_lowercase();
    assert!(reason.contains("command 'rm' is blocked"));
    assert_eq!(err.diagnostic_tool(), "check_security_config");
}

#[test]
fn traversal_and_sibling_paths_stay_outside() {
    let temp = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(temp.path()).unwrap();
    let engine = engine_with(|s| {
        s.allowed_paths = vec![root.to_string_lossy().into_owned()];
    });

    // join(T, "..", "outside") escapes
    let escape = root.join("..").join("outside");
    assert!(!engine.is_path_allowed(&escape.to_string_lossy()));

    // join(T, "subdir", "f") is inside even before it exists
    let inside = root.join("subdir").join("f");
    assert!(engine.is_path_allowed(&inside.to_string_lossy()));

    // T + "2" is a sibling, not a child
    let sibling = format!("{}2", root.to_string_lossy());
    assert!(!engine.is_path_allowed(&sibling));
}

#[test]
fn working_directory_survives_only_via_realpath() {
    let temp = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(temp.path()).unwrap();
    std::fs::create_dir(root.join("work")).unwrap();
    let engine = engine_with(|s| {
        s.allowed_paths = vec![root.to_string_lossy().into_owned()];
    });

    let validated = engine
        .validate(
            "bash",
            &profile(),
            "echo hi",
            Some(&root.join("work").to_string_lossy()),
            None,
        )
        .unwrap();
    assert_eq!(validated.working_dir, Some(root.join("work")));
}

#[test]
fn environment_stage_is_last_and_bounded() {
    let engine = engine_with(|_| {});
    let mut env = HashMap::new();
    for i in 0..25 {
        env.insert(format!("VAR_{i}"), "v".to_string());
    }
    let err = engine
        .validate("bash", &profile(), "echo hi", None, Some(&env))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BlockedEnvironment);
}

#[test]
fn every_rejection_carries_guidance_and_diagnostic() {
    let engine = engine_with(|s| s.max_command_length = 5);
    let cases = [
        "a | b",
        "echo \"unclosed",
        "rm x",
        "waytoolongcommand",
    ];
    for command in cases {
        let err = engine
            .validate("bash", &profile(), command, None, None)
            .unwrap_err();
        assert!(!err.user_guidance().is_empty(), "{command}");
        assert!(!err.diagnostic_tool().is_empty(), "{command}");
        assert!(err.code().is_validation(), "{command}");
    }
}
