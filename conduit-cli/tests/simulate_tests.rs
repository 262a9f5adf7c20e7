use std::fs;
use tempfile::tempdir;

use conduit_cli::commands::simulate::{self, SimulateOptions, SimulationReport};
use conduit_core::{FecRatio, SessionConfig};

fn options(loss: f64, seed: u64) -> SimulateOptions {
    SimulateOptions {
        frames: 120,
        frame_size: 3000,
        loss,
        seed,
        ratio: FecRatio::new(6, 5).unwrap(),
    }
}

#[test]
fn simulate_lossless_delivers_everything() {
    let report = simulate::run(SessionConfig::default(), &options(0.0, 7)).unwrap();

    assert_eq!(report.delivered, 120);
    assert_eq!(report.corrupted, 0);
    assert_eq!(report.packets_lost, 0);
    assert_eq!(report.delivery_ratio, 1.0);
    assert_eq!(report.sender.frames_encoded, 120);
    assert_eq!(report.sender.feedback_received, 0);
    assert_eq!(report.receiver.recovered_packets, 0);
}

#[test]
fn simulate_lossy_link_never_corrupts() {
    let report = simulate::run(SessionConfig::default(), &options(0.05, 42)).unwrap();

    assert!(report.packets_lost > 0);
    assert_eq!(report.corrupted, 0);
    assert!(report.receiver.recovered_packets > 0);
    assert!(report.delivered > 60, "delivered only {}", report.delivered);
}

#[test]
fn simulate_is_deterministic_per_seed() {
    let a = simulate::run(SessionConfig::default(), &options(0.1, 9)).unwrap();
    let b = simulate::run(SessionConfig::default(), &options(0.1, 9)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn simulate_total_loss() {
    let report = simulate::run(SessionConfig::default(), &options(1.0, 3)).unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.receiver.packets_received, 0);
}

#[test]
fn simulate_rejects_bad_probability() {
    assert!(simulate::run(SessionConfig::default(), &options(1.5, 1)).is_err());
}

#[test]
fn simulate_writes_json_report() {
    let td = tempdir().unwrap();
    let out_path = td.path().join("report.json");

    simulate::execute(
        SessionConfig::default(),
        &options(0.02, 5),
        Some(out_path.to_str().unwrap()),
    )
    .unwrap();

    let report: SimulationReport =
        serde_json::from_str(&fs::read_to_string(&out_path).unwrap()).unwrap();
    assert_eq!(report.frames, 120);
    assert_eq!(report.corrupted, 0);
}
