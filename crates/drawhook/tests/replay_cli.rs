use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const CONFIG: &str = r#"
version = 1

[settings]
techniques = ["Bloom"]

[[groups]]
id = 1
name = "HUD"
pixel_shaders = ["0xABCD"]
techniques = ["Bloom"]
invocation = "before_draw"
match_mode = "resolution"
"#;

const TRACE: &str = r#"{
    "back_buffer": [1920, 1080],
    "techniques": ["Bloom"],
    "events": [
        { "event": "create_resource", "handle": 1,
          "desc": { "kind": "texture2d", "width": 1920, "height": 1080, "depth_or_layers": 1,
                    "levels": 1, "format": "r8_g8_b8_a8_unorm", "samples": 1,
                    "heap": "gpu_only", "usage": "RENDER_TARGET | SHADER_RESOURCE" } },
        { "event": "create_view", "handle": 2, "resource": 1 },
        { "event": "create_pipeline", "handle": 10, "pixel": "0xABCD" },
        { "event": "bind_render_targets", "targets": [2] },
        { "event": "bind_pipeline", "pipeline": 10 },
        { "event": "draw" },
        { "event": "draw" },
        { "event": "present" }
    ]
}"#;

fn drawhook(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_drawhook"))
        .env("DRAWHOOK_CONFIG_DIR", root.join("config"))
        .env("DRAWHOOK_DATA_DIR", root.join("data"))
        .env_remove("DRAWHOOK_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run drawhook")
}

fn frames(output: &Output) -> Vec<serde_json::Value> {
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    report["frames"].as_array().unwrap().clone()
}

#[test]
fn replay_reports_injected_effects_as_json() {
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("config")).unwrap();
    fs::write(root.path().join("config/drawhook.toml"), CONFIG).unwrap();
    let trace = root.path().join("frame.json");
    fs::write(&trace, TRACE).unwrap();

    let output = drawhook(root.path(), &["replay", trace.to_str().unwrap(), "--json"]);
    assert!(output.status.success());

    let frames = frames(&output);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["host_draws"], 2);
    assert_eq!(frames[0]["effects"], 1);
    assert_eq!(frames[0]["rendered"][0], "Bloom");
}

#[test]
fn back_buffer_override_changes_target_matching() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("groups.toml");
    fs::write(&config, CONFIG).unwrap();
    let traces = root.path().join("data/traces");
    fs::create_dir_all(&traces).unwrap();
    fs::write(traces.join("frame.json"), TRACE).unwrap();

    let output = drawhook(
        root.path(),
        &[
            "replay",
            "frame.json",
            "--json",
            "--back-buffer",
            "2560x1440",
            "--config",
            config.to_str().unwrap(),
        ],
    );
    assert!(output.status.success());
    assert_eq!(frames(&output)[0]["effects"], 0);
}

#[test]
fn check_rejects_invalid_configs() {
    let root = TempDir::new().unwrap();
    let valid = root.path().join("valid.toml");
    fs::write(&valid, CONFIG).unwrap();
    let output = drawhook(root.path(), &["check", "--config", valid.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("1 group(s)"));

    let idle = root.path().join("idle.toml");
    fs::write(&idle, CONFIG.replace("techniques = [\"Bloom\"]\ninvocation", "invocation")).unwrap();
    let output = drawhook(root.path(), &["check", "--config", idle.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("only takes part in edit previews"));

    let invalid = root.path().join("invalid.toml");
    fs::write(&invalid, CONFIG.replace("0xABCD", "0")).unwrap();
    let output = drawhook(root.path(), &["check", "--config", invalid.to_str().unwrap()]);
    assert!(!output.status.success());
}
