//! Assembling a line from its configuration file.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use servo_line::config::LineConfig;
use servo_line::prelude::*;
use std::collections::HashMap;
use std::io::Write;

const LINE: &str = r#"
    [application]
    name = "pumping line"

    [dispatch]
    response_timeout_ms = 30

    [[controllers]]
    name = "servo-a"
    port = "/dev/ttyUSB0"

    [[controllers]]
    name = "servo-b"
    port = "/dev/ttyUSB1"

    [[actuators]]
    name = "v_ip"
    controller = "servo-a"
    channel = 1

    [[actuators.actions]]
    name = "open"
    drive_signal = 2000
    limit1_enabled = true
    time_limit = 30.0

    [[actuators.actions]]
    name = "close"
    drive_signal = 1000
    limit0_enabled = true
    time_limit = 30.0

    [[actuators]]
    name = "v_inlet"
    controller = "servo-b"
    channel = 1

    [[actuators.actions]]
    name = "open"
    drive_signal = 2000
    limit1_enabled = true

    [[actuators.actions]]
    name = "close"
    drive_signal = 1000
    limit0_enabled = true

    [[actuators.actions]]
    name = "meter"
    drive_signal = 1500
    current_limit = 500
    time_limit = 0.5

    [[valves]]
    name = "ion pump"
    actuator = "v_ip"
    open_action = "open"
    close_action = "close"

    [[valves]]
    name = "inlet"
    actuator = "v_inlet"
    open_action = "open"
    close_action = "close"

    [valves.metering]
    open_position = 40
    max_increment = 20
    signal_per_step = 10
    move_action = "meter"
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn simulated_links(config: &LineConfig) -> (HashMap<String, SimulatedBoard>, HashMap<String, Link>) {
    let mut boards = HashMap::new();
    let mut links = HashMap::new();
    for controller in &config.controllers {
        let board = SimulatedBoard::new();
        links.insert(controller.name.clone(), board.link());
        boards.insert(controller.name.clone(), board);
    }
    (boards, links)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_assembled_line_operates_its_valves() {
    let file = write_config(LINE);
    let config = LineConfig::load_validated(file.path()).unwrap();
    let (boards, links) = simulated_links(&config);
    let line = LineRegistry::assemble(&config, links).unwrap();

    assert_eq!(line.controllers().count(), 2);
    assert_eq!(line.actuators().count(), 2);
    assert_eq!(line.valves().count(), 2);

    let ion_pump = line.valve(line.valve_id("ion pump").unwrap()).unwrap();
    let inlet = line.valve(line.valve_id("inlet").unwrap()).unwrap();
    assert!(!ion_pump.is_metering());
    assert!(inlet.is_metering());

    // same channel number on different controllers is not a conflict
    assert_eq!(ion_pump.actuator().channel(), inlet.actuator().channel());

    ion_pump.open().unwrap();
    inlet.open().unwrap();
    within("line idle", line.wait_idle()).await;

    assert_eq!(ion_pump.status(), ValveStatus::Opened);
    assert_eq!(inlet.status(), ValveStatus::Opened);
    assert_eq!(inlet.position(), Some(40));
    assert_eq!(boards["servo-a"].position(1), Some(20.0));

    // two 20-step sub-moves at drive signal 1700
    let sub_moves = boards["servo-b"]
        .exchanges()
        .iter()
        .filter(|line| line.starts_with("c01 d1700"))
        .count();
    assert!(sub_moves >= 2);

    line.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_link_is_reported() {
    let file = write_config(LINE);
    let config = LineConfig::load_validated(file.path()).unwrap();
    let (_boards, mut links) = simulated_links(&config);
    links.remove("servo-b");

    let err = LineRegistry::assemble(&config, links).unwrap_err();
    assert!(matches!(err, ServoError::UnknownName { ref name, .. } if name == "servo-b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_channel_conflict_fails_assembly() {
    let conflicting = LINE.replace(
        "controller = \"servo-b\"\n    channel = 1",
        "controller = \"servo-a\"\n    channel = 1",
    );
    let file = write_config(&conflicting);
    let config = LineConfig::load_validated(file.path()).unwrap();
    let (_boards, links) = simulated_links(&config);

    let err = LineRegistry::assemble(&config, links).unwrap_err();
    assert!(matches!(
        err,
        ServoError::ChannelConflict { channel: 1, ref existing, ref requested, .. }
            if existing == "v_ip" && requested == "v_inlet"
    ));
}

#[test]
fn test_invalid_line_is_rejected_on_load() {
    let broken = LINE.replace("move_action = \"meter\"", "move_action = \"trickle\"");
    let file = write_config(&broken);
    let err = LineConfig::load_validated(file.path()).unwrap_err();
    assert!(matches!(err, ServoError::Configuration(ref msg) if msg.contains("trickle")));
}
