use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use sensor_gateway_lib::{
    ConfigError, Gateway, GatewayConfig, GatewayError, GatewaySummary, Reading, SensorClient,
    TransportError,
};
use tempfile::TempDir;

fn config_in(dir: &Path, max_connections: usize) -> GatewayConfig {
    let map = dir.join("room_sensor.map");
    fs::write(&map, "1 7\n2 15\n").unwrap();

    let mut config = GatewayConfig {
        max_connections,
        receive_timeout_secs: 1,
        log_file: dir.join("gateway.log"),
        ..GatewayConfig::default()
    };
    config.analyzer.sensor_map = map;
    config.storage.data_file = dir.join("data.csv");
    config
}

type RunHandle = thread::JoinHandle<Result<GatewaySummary, GatewayError>>;

fn start(config: GatewayConfig) -> (SocketAddr, RunHandle) {
    let gateway = Gateway::bind(config, 0).unwrap();
    let port = gateway.local_addr().unwrap().port();
    let handle = thread::spawn(move || gateway.run());
    (([127, 0, 0, 1], port).into(), handle)
}

/// Event log lines without the sequence number and receipt time
fn log_messages(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .enumerate()
        .map(|(i, line)| {
            let mut parts = line.splitn(3, ' ');
            assert_eq!(parts.next().unwrap(), (i + 1).to_string());
            parts.next().unwrap();
            parts.next().unwrap().to_string()
        })
        .collect()
}

#[test]
fn test_readings_fan_out_to_storage_and_analyzer() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path(), 2);
    let (addr, handle) = start(config);

    let mut hot = SensorClient::connect(addr).unwrap();
    for ts in 1..=4 {
        hot.send_reading(&Reading::new(7, 30.0, 1000 + ts)).unwrap();
    }
    hot.close().unwrap();

    let mut unknown = SensorClient::connect(addr).unwrap();
    unknown.send_reading(&Reading::new(99, 20.0, 2000)).unwrap();
    unknown.close().unwrap();

    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.connections.connections, 2);
    assert_eq!(summary.connections.closed, 2);
    assert_eq!(summary.connections.readings, 5);
    assert_eq!(summary.analyzed, 5);
    assert_eq!(summary.persisted, 5);
    assert_eq!(summary.released, 6);

    let data = fs::read_to_string(tmp.path().join("data.csv")).unwrap();
    let mut lines: Vec<_> = data.lines().collect();
    lines.sort();
    assert_eq!(
        lines,
        vec![
            "7,30.000000,1001",
            "7,30.000000,1002",
            "7,30.000000,1003",
            "7,30.000000,1004",
            "99,20.000000,2000",
        ]
    );

    let messages = log_messages(&tmp.path().join("gateway.log"));
    // new file + 2 opened + 5 inserted + too hot + invalid id + 2 closed + file closed
    assert_eq!(messages.len(), 13);
    assert_eq!(summary.events, 13);

    let count = |text: &str| messages.iter().filter(|m| m.as_str() == text).count();
    assert_eq!(count("A new data.csv file has been created."), 1);
    assert_eq!(count("Sensor node 7 has opened a new connection."), 1);
    assert_eq!(count("Sensor node 99 has opened a new connection."), 1);
    assert_eq!(count("Data insertion from sensor 7 succeeded."), 4);
    assert_eq!(count("Data insertion from sensor 99 succeeded."), 1);
    assert_eq!(count("Sensor node 7 reports it's too hot (avg temp = 27.500000)."), 1);
    assert_eq!(count("Received sensor data with invalid sensor node ID 99."), 1);
    assert_eq!(count("Sensor node 7 has closed the connection."), 1);
    assert_eq!(count("Sensor node 99 has closed the connection."), 1);
    assert_eq!(count("The data.csv file has been closed."), 1);
}

#[test]
fn test_stalled_sensor_times_out() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path(), 1);
    let (addr, handle) = start(config);

    let mut client = SensorClient::connect(addr).unwrap();
    client.send(&15u16.to_le_bytes()).unwrap();
    client.send(&21.0f64.to_le_bytes()).unwrap();

    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.connections.timed_out, 1);
    assert_eq!(summary.persisted, 0);

    assert_eq!(fs::read_to_string(tmp.path().join("data.csv")).unwrap(), "");

    let messages = log_messages(&tmp.path().join("gateway.log"));
    assert_eq!(
        messages.iter().filter(|m| *m == "Sensor node 15 has timed-out.").count(),
        1
    );
    assert!(!messages.iter().any(|m| m.starts_with("Data insertion")));
    drop(client);
}

#[test]
fn test_connection_reset_stops_the_gateway() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(tmp.path(), 3);
    let gateway = Gateway::bind(config, 0).unwrap();
    let port = gateway.local_addr().unwrap().port();
    let buffer = gateway.buffer();
    let handle = thread::spawn(move || gateway.run());

    let mut ok = SensorClient::connect(("127.0.0.1", port)).unwrap();
    ok.send_reading(&Reading::new(7, 21.0, 10)).unwrap();
    ok.close().unwrap();

    let mut broken = SensorClient::connect(("127.0.0.1", port)).unwrap();
    broken.send(&15u16.to_le_bytes()).unwrap();
    broken.abort().unwrap();

    // Budget is 3 but no third sensor ever connects
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "gateway kept waiting for connections");
        thread::sleep(Duration::from_millis(10));
    }

    assert!(matches!(
        handle.join().unwrap(),
        Err(GatewayError::Transport(TransportError::Receive(_)))
    ));
    assert!(buffer.is_terminated());
}

#[test]
fn test_missing_sensor_map_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(tmp.path(), 1);
    config.analyzer.sensor_map = tmp.path().join("absent.map");

    let result = Gateway::bind(config, 0);
    assert!(matches!(
        result,
        Err(GatewayError::Config(ConfigError::Io { .. }))
    ));
}

#[test]
fn test_invalid_config_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut config = config_in(tmp.path(), 1);
    config.analyzer.window_length = 0;

    assert!(matches!(
        Gateway::bind(config, 0),
        Err(GatewayError::Config(ConfigError::Invalid(_)))
    ));
}
