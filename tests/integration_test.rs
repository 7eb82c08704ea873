use axum::{extract::Query, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::{
    collections::HashMap,
    future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_modbus::{
    prelude::*,
    server::{
        tcp::{accept_tcp_connection, Server},
        Service,
    },
};

use home_power_monitor::{
    acquisition::CURRENT_REGISTER_START,
    config::{parse_and_validate, RawConnectionParams, CHANNEL_COUNT},
    AggregationMode, CycleOutcome, MemoryPublisher, ModbusLink, PowerMonitor, ValueFetcher,
};

/// Mock current transducer exposing 16 holding registers from offset 8
#[derive(Clone)]
struct MockTransducer {
    registers: Arc<Mutex<Vec<u16>>>,
    read_count: Arc<AtomicU32>,
    should_fail: Arc<AtomicBool>,
}

impl MockTransducer {
    fn new() -> Self {
        Self {
            registers: Arc::new(Mutex::new(vec![0; CHANNEL_COUNT])),
            read_count: Arc::new(AtomicU32::new(0)),
            should_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    fn set_registers(&self, values: &[u16]) {
        *self.registers.lock().unwrap() = values.to_vec();
    }

    fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    fn get_read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
}

impl Service for MockTransducer {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        self.read_count.fetch_add(1, Ordering::Relaxed);

        if self.should_fail.load(Ordering::Relaxed) {
            return future::ready(Err(ExceptionCode::ServerDeviceFailure));
        }

        let res = match req {
            Request::ReadHoldingRegisters(addr, cnt)
                if addr == CURRENT_REGISTER_START && cnt as usize == CHANNEL_COUNT =>
            {
                Ok(Response::ReadHoldingRegisters(
                    self.registers.lock().unwrap().clone(),
                ))
            }
            _ => Err(ExceptionCode::IllegalDataAddress),
        };
        future::ready(res)
    }
}

/// Mock home-automation server answering device queries by id
struct MockDeviceStore {
    devices: Mutex<HashMap<String, serde_json::Value>>,
    request_count: AtomicU32,
}

impl MockDeviceStore {
    fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            request_count: AtomicU32::new(0),
        }
    }

    fn set_voltage(&self, idx: u32, voltage: f64) {
        self.devices
            .lock()
            .unwrap()
            .insert(idx.to_string(), json!({"Voltage": voltage}));
    }

    fn set_data(&self, idx: u32, data: &str) {
        self.devices
            .lock()
            .unwrap()
            .insert(idx.to_string(), json!({"Data": data}));
    }

    fn get_request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    fn create_router(self: Arc<Self>) -> Router {
        Router::new().route(
            "/json.htm",
            get({
                let store = self.clone();
                move |Query(params): Query<HashMap<String, String>>| async move {
                    store.request_count.fetch_add(1, Ordering::Relaxed);

                    let rid = params.get("rid").cloned().unwrap_or_default();
                    match store.devices.lock().unwrap().get(&rid) {
                        Some(device) => Ok(Json(json!({"status": "OK", "result": [device]}))),
                        None => Err(StatusCode::NOT_FOUND),
                    }
                }
            }),
        )
    }
}

async fn start_mock_transducer() -> (MockTransducer, SocketAddr, oneshot::Sender<()>) {
    let mock = MockTransducer::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = mock.clone();

    tokio::spawn(async move {
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(service.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            eprintln!("Mock transducer error: {}", err);
        };

        tokio::select! {
            _ = server.serve(&on_connected, on_process_error) => {},
            _ = shutdown_rx => {},
        }
    });

    (mock, addr, shutdown_tx)
}

async fn start_mock_store() -> (Arc<MockDeviceStore>, SocketAddr, oneshot::Sender<()>) {
    let store = Arc::new(MockDeviceStore::new());
    let app = store.clone().create_router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = axum::serve(listener, app) => {},
            _ = shutdown_rx => {},
        }
    });

    (store, addr, shutdown_tx)
}

/// Channels 1-5 on IDX 21, 6-10 on IDX 22, 11-16 on IDX 23; channel 1 reads
/// its power factor from IDX 40.
fn channel_json() -> String {
    let channels: Vec<serde_json::Value> = (0..CHANNEL_COUNT)
        .map(|i| {
            let mut channel = json!({
                "name": format!("Circuit {}", i + 1),
                "voltage": 230,
                "voltageSource": 21 + (i / 5).min(2),
                "powerFactor": 0.8,
            });
            if i == 0 {
                channel["powerFactorSource"] = json!(40);
            }
            channel
        })
        .collect();
    serde_json::Value::Array(channels).to_string()
}

fn build_monitor(
    transducer: SocketAddr,
    query_url: String,
) -> PowerMonitor<ModbusLink, ValueFetcher, MemoryPublisher> {
    let raw = RawConnectionParams {
        host: transducer.ip().to_string(),
        port: transducer.port().to_string(),
        unit_id: "14".to_string(),
        interval: "1".to_string(),
    };
    let (connection, channels) = parse_and_validate(&raw, &channel_json()).unwrap();
    let link = ModbusLink::new(&connection.host, connection.port, connection.unit_id);
    let values = ValueFetcher::new(query_url).unwrap();
    PowerMonitor::new(
        &connection,
        channels,
        AggregationMode::Phase,
        link,
        values,
        MemoryPublisher::new(),
    )
}

fn registers() -> Vec<u16> {
    let mut values = vec![100; CHANNEL_COUNT];
    values[0] = 2000;
    values[1] = 500;
    values
}

#[tokio::test]
async fn test_full_cycle_with_live_values() {
    let (transducer, transducer_addr, _transducer_shutdown) = start_mock_transducer().await;
    let (store, store_addr, _store_shutdown) = start_mock_store().await;

    transducer.set_registers(&registers());
    store.set_voltage(21, 240.0);
    store.set_voltage(22, 230.0);
    store.set_data(23, "220.0 V");
    store.set_data(40, "0.90");

    let mut monitor = build_monitor(transducer_addr, format!("http://{}", store_addr));
    monitor.start().await;

    let outcome = monitor.on_heartbeat().await;
    assert!(matches!(outcome, Some(CycleOutcome::Published { .. })));

    let published = monitor.publisher();
    assert_eq!(published.value(1), Some("20.00"));
    assert_eq!(published.value(2), Some("5.00"));
    // L1 at 240V with PF 0.90 from channel 1: 240 × 20 × 0.9
    assert_eq!(published.value(17), Some("4320.00"));
    // L1 current: 20 + 5 + 3 × 1
    assert_eq!(published.value(33), Some("28.00"));
    // L1 power: 240 × 28 × 0.9
    assert_eq!(published.value(34), Some("6048.00"));
    // L2: 5 × 1A × 230V × 0.8
    assert_eq!(published.value(36), Some("920.00"));
    // L3: 6 × 1A × 220V × 0.8
    assert_eq!(published.value(38), Some("1056.00"));
    assert_eq!(published.value(39), Some("8024.00"));

    // One voltage lookup per phase plus the first member's power factor
    assert_eq!(store.get_request_count(), 4);
    assert!(transducer.get_read_count() >= 1);
}

#[tokio::test]
async fn test_store_unavailable_falls_back_to_static_values() {
    let (transducer, transducer_addr, _transducer_shutdown) = start_mock_transducer().await;
    let (store, store_addr, _store_shutdown) = start_mock_store().await;
    transducer.set_registers(&registers());
    // Implausible power factor is ignored as well
    store.set_data(40, "1.5");

    let mut monitor = build_monitor(transducer_addr, format!("http://{}", store_addr));
    monitor.start().await;
    monitor.run_cycle().await;

    let published = monitor.publisher();
    // 230V × 20A × 0.8
    assert_eq!(published.value(17), Some("3680.00"));
    assert_eq!(published.value(34), Some("5152.00"));
}

#[tokio::test]
async fn test_transducer_failure_and_recovery() {
    let (transducer, transducer_addr, _transducer_shutdown) = start_mock_transducer().await;
    let (store, store_addr, _store_shutdown) = start_mock_store().await;
    store.set_voltage(21, 230.0);
    transducer.set_registers(&registers());

    let mut monitor = build_monitor(transducer_addr, format!("http://{}", store_addr));
    monitor.start().await;
    assert!(matches!(
        monitor.run_cycle().await,
        CycleOutcome::Published { .. }
    ));
    let before = monitor.publisher().values().clone();

    transducer.set_should_fail(true);
    for expected_failures in 1..=3 {
        assert_eq!(monitor.run_cycle().await, CycleOutcome::ReadFailed);
        assert_eq!(monitor.health().consecutive_failures(), expected_failures);
    }
    assert_eq!(monitor.publisher().values(), &before);

    transducer.set_should_fail(false);
    let mut changed = registers();
    changed[0] = 1500;
    transducer.set_registers(&changed);

    assert!(matches!(
        monitor.run_cycle().await,
        CycleOutcome::Published { .. }
    ));
    assert_eq!(monitor.health().consecutive_failures(), 0);
    assert_eq!(monitor.publisher().value(1), Some("15.00"));
}

#[tokio::test]
async fn test_repeated_cycles_are_idempotent() {
    let (transducer, transducer_addr, _transducer_shutdown) = start_mock_transducer().await;
    let (store, store_addr, _store_shutdown) = start_mock_store().await;
    transducer.set_registers(&registers());
    store.set_voltage(21, 231.0);
    store.set_voltage(22, 229.0);
    store.set_voltage(23, 233.0);

    let mut monitor = build_monitor(transducer_addr, format!("http://{}", store_addr));
    monitor.start().await;

    monitor.run_cycle().await;
    let first = monitor.publisher().values().clone();
    monitor.run_cycle().await;

    assert_eq!(&first, monitor.publisher().values());
}

#[tokio::test]
async fn test_unreachable_transducer_never_panics() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut monitor = build_monitor(addr, "http://127.0.0.1:1".to_string());
    monitor.start().await;
    assert_eq!(monitor.health().consecutive_failures(), 1);

    assert_eq!(monitor.run_cycle().await, CycleOutcome::ReadFailed);
    assert_eq!(monitor.health().consecutive_failures(), 2);
    assert!(monitor.publisher().values().is_empty());
}
