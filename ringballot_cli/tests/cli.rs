use std::process::Command;

fn ringballot() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ringballot"));
    command.env("RINGBALLOT_MIN_BATCH_SIZE", "not-a-number");
    command
}

#[test]
fn keygen_ignores_simulation_settings() {
    let output = ringballot().args(["keygen", "--json"]).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let keys: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(keys["block_signing_public_key"].as_str().unwrap().len(), 64);
}

#[test]
fn verify_chain_ignores_simulation_settings() {
    let output = ringballot()
        .args(["verify-chain", "/nonexistent/params.json", "/nonexistent/chain.json"])
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("unable to read"), "{}", stderr);
    assert!(!stderr.contains("RINGBALLOT_MIN_BATCH_SIZE"), "{}", stderr);
}

#[test]
fn simulate_reports_bad_settings() {
    let output = ringballot().arg("simulate").output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("RINGBALLOT_MIN_BATCH_SIZE"), "{}", stderr);
}
