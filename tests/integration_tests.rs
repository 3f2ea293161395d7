//! Integration Tests for Modbus Simu
//!
//! These tests drive the simulator the way an operator and a real Modbus
//! master would: slaves are configured through the facade and polled over
//! TCP with raw frames.

use modbus_simu::codec::encode_rtu;
use modbus_simu::config::StateConfig;
use modbus_simu::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialStream};

fn config(engine: EngineKind) -> SimulatorConfig {
    let mut config = SimulatorConfig::default();
    config.engine = engine;
    config.tcp.port = 0;
    config.block.size = 10;
    config.logging.enabled = false;
    config
}

async fn running_simulator(engine: EngineKind) -> (Simulator, SocketAddr) {
    modbus_simu::utils::logging::init_test_logger();
    let simulator = Simulator::new(config(engine)).await.unwrap();
    simulator.add_slaves(1, 2).unwrap();
    simulator.add_entries(1, BlockKind::Coil, 4, 0).unwrap();
    simulator.set_value(1, BlockKind::Coil, 1, 1).unwrap();
    simulator.set_value(1, BlockKind::Coil, 3, 1).unwrap();
    simulator.add_entries(1, BlockKind::HoldingRegister, 3, 0).unwrap();
    simulator.set_value(1, BlockKind::HoldingRegister, 0, 0x1234).unwrap();
    simulator.set_value(1, BlockKind::HoldingRegister, 2, 7).unwrap();
    simulator.add_entries(2, BlockKind::InputRegister, 2, 99).unwrap();

    simulator.start_server().await.unwrap();
    let addr = simulator.local_addr().unwrap();
    (simulator, addr)
}

/// Wrap a PDU in an MBAP header
fn tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

async fn exchange(stream: &mut TcpStream, frame: &[u8]) -> Vec<u8> {
    stream.write_all(frame).await.unwrap();

    let mut header = [0u8; 7];
    timeout(Duration::from_secs(3), stream.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await.unwrap();

    let mut reply = header.to_vec();
    reply.extend_from_slice(&pdu);
    reply
}

/// Requests shared by both engines, each paired with the expected PDU
fn conversation() -> Vec<(u8, Vec<u8>, Vec<u8>)> {
    vec![
        // Read coils 0-3
        (1, vec![0x01, 0x00, 0x00, 0x00, 0x04], vec![0x01, 0x01, 0x0A]),
        // Read holding registers 0-2
        (
            1,
            vec![0x03, 0x00, 0x00, 0x00, 0x03],
            vec![0x03, 0x06, 0x12, 0x34, 0x00, 0x00, 0x00, 0x07],
        ),
        // Read input registers of slave 2
        (2, vec![0x04, 0x00, 0x00, 0x00, 0x02], vec![0x04, 0x04, 0x00, 0x63, 0x00, 0x63]),
        // Write single register 1
        (1, vec![0x06, 0x00, 0x01, 0xAB, 0xCD], vec![0x06, 0x00, 0x01, 0xAB, 0xCD]),
        // Write multiple registers 4-5
        (
            1,
            vec![0x10, 0x00, 0x04, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x00, 0x0B],
            vec![0x10, 0x00, 0x04, 0x00, 0x02],
        ),
        // Write single coil 0 on
        (1, vec![0x05, 0x00, 0x00, 0xFF, 0x00], vec![0x05, 0x00, 0x00, 0xFF, 0x00]),
        // Write multiple coils 4-6
        (1, vec![0x0F, 0x00, 0x04, 0x00, 0x03, 0x01, 0x05], vec![0x0F, 0x00, 0x04, 0x00, 0x03]),
        // Reads see the writes
        (
            1,
            vec![0x03, 0x00, 0x00, 0x00, 0x06],
            vec![
                0x03, 0x0C, 0x12, 0x34, 0xAB, 0xCD, 0x00, 0x07, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x0B,
            ],
        ),
        (1, vec![0x01, 0x00, 0x00, 0x00, 0x08], vec![0x01, 0x01, 0x5B]),
        // Past the end of a 10-register block
        (1, vec![0x03, 0x00, 0x08, 0x00, 0x03], vec![0x83, 0x02]),
        // Unknown slave
        (9, vec![0x03, 0x00, 0x00, 0x00, 0x01], vec![0x83, 0x0B]),
    ]
}

async fn replay_conversation(engine: EngineKind) -> Vec<Vec<u8>> {
    let (simulator, addr) = running_simulator(engine).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut replies = Vec::new();
    for (i, (unit_id, request, expected)) in conversation().into_iter().enumerate() {
        let transaction_id = i as u16 + 1;
        let reply = exchange(&mut stream, &tcp_frame(transaction_id, unit_id, &request)).await;
        assert_eq!(
            reply,
            tcp_frame(transaction_id, unit_id, &expected),
            "{} engine, request {}",
            engine,
            i
        );
        replies.push(reply);
    }

    simulator.shutdown().await.unwrap();
    replies
}

#[tokio::test]
async fn test_native_engine_conversation() {
    replay_conversation(EngineKind::Native).await;
}

#[tokio::test]
async fn test_tokio_modbus_engine_conversation() {
    replay_conversation(EngineKind::TokioModbus).await;
}

#[tokio::test]
async fn test_engines_answer_identically() {
    let native = replay_conversation(EngineKind::Native).await;
    let tokio_modbus = replay_conversation(EngineKind::TokioModbus).await;
    assert_eq!(native, tokio_modbus);
}

/// RTU requests shared by both engines, each paired with the expected reply
///
/// An empty reply means the engine must stay silent.
fn rtu_conversation() -> Vec<(&'static str, Vec<u8>, Vec<u8>)> {
    let bad_crc = {
        let mut frame = encode_rtu(1, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        frame[6] ^= 0xFF;
        frame
    };

    vec![
        (
            "read coils",
            encode_rtu(1, &[0x01, 0x00, 0x00, 0x00, 0x04]),
            encode_rtu(1, &[0x01, 0x01, 0x0A]),
        ),
        (
            "read past the block",
            encode_rtu(1, &[0x03, 0x00, 0x08, 0x00, 0x03]),
            encode_rtu(1, &[0x83, 0x02]),
        ),
        (
            "write single register",
            encode_rtu(1, &[0x06, 0x00, 0x01, 0xAB, 0xCD]),
            encode_rtu(1, &[0x06, 0x00, 0x01, 0xAB, 0xCD]),
        ),
        ("corrupted checksum", bad_crc, Vec::new()),
        ("broadcast write", encode_rtu(0, &[0x06, 0x00, 0x01, 0x00, 0x09]), Vec::new()),
        (
            "read holding registers",
            encode_rtu(1, &[0x03, 0x00, 0x00, 0x00, 0x02]),
            encode_rtu(1, &[0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD]),
        ),
        (
            "unknown slave",
            encode_rtu(9, &[0x03, 0x00, 0x00, 0x00, 0x01]),
            encode_rtu(9, &[0x83, 0x0B]),
        ),
    ]
}

/// Collect what the slave sends until the line stays quiet
async fn rtu_reply(master: &mut SerialStream) -> Vec<u8> {
    let mut reply = Vec::new();
    let mut buf = [0u8; 64];
    while let Ok(Ok(read)) = timeout(Duration::from_millis(300), master.read(&mut buf)).await {
        if read == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..read]);
    }
    reply
}

async fn replay_rtu_conversation(kind: EngineKind) -> Vec<Vec<u8>> {
    modbus_simu::utils::logging::init_test_logger();
    let (mut master, slave) = SerialStream::pair().unwrap();
    let store = Arc::new(RegisterStore::new());
    store.add_slave(1).unwrap();
    store.add_block(1, BlockKind::Coil, 0, 8).unwrap();
    store.set_value(1, BlockKind::Coil, 1, 1).unwrap();
    store.set_value(1, BlockKind::Coil, 3, 1).unwrap();
    store.add_block(1, BlockKind::HoldingRegister, 0, 10).unwrap();
    store.set_value(1, BlockKind::HoldingRegister, 0, 0x1234).unwrap();

    let settings = SerialSettings {
        port: slave.name().unwrap(),
        ..Default::default()
    };
    let engine = create_engine(kind, TransportConfig::Rtu(settings), Arc::clone(&store));
    engine.start().await.unwrap();

    let mut replies = Vec::new();
    for (step, request, expected) in rtu_conversation() {
        master.write_all(&request).await.unwrap();
        let reply = rtu_reply(&mut master).await;
        assert_eq!(reply, expected, "{} engine, {}", kind, step);
        replies.push(reply);
    }
    assert_eq!(store.get_value(1, BlockKind::HoldingRegister, 1).unwrap(), 0xABCD);

    drop(master);
    drop(slave);
    timeout(Duration::from_secs(3), async {
        while engine.is_running() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("engine notices the hangup");
    engine.stop().await.unwrap();
    replies
}

#[tokio::test]
async fn test_rtu_engines_answer_identically() {
    let native = replay_rtu_conversation(EngineKind::Native).await;
    let tokio_modbus = replay_rtu_conversation(EngineKind::TokioModbus).await;
    assert_eq!(native, tokio_modbus);
}

#[tokio::test]
async fn test_client_write_is_reconciled_then_simulated() {
    for engine in [EngineKind::Native, EngineKind::TokioModbus] {
        let (simulator, addr) = running_simulator(engine).await;
        simulator
            .change_range(ValueGroup::Registers, Some(10), Some(20))
            .await
            .unwrap();
        let mut changes = simulator.subscribe();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let write = tcp_frame(1, 1, &[0x06, 0x00, 0x02, 0x03, 0xE7]);
        assert_eq!(exchange(&mut stream, &write).await, write);

        // The shadow only learns about the write through reconciliation
        assert_eq!(simulator.get_value(1, BlockKind::HoldingRegister, 2).unwrap(), 7);
        assert_eq!(simulator.reconciliation().run_once(), 1);
        assert_eq!(simulator.get_value(1, BlockKind::HoldingRegister, 2).unwrap(), 999);
        let change = changes.recv().await.unwrap();
        assert_eq!((change.slave_id, change.address, change.value), (1, 2, 999));

        simulator.scheduler(TransportKind::Tcp).run_once();
        let value = simulator.get_value(1, BlockKind::HoldingRegister, 2).unwrap();
        assert!((10..=20).contains(&value));
        let read = exchange(&mut stream, &tcp_frame(2, 1, &[0x03, 0x00, 0x02, 0x00, 0x01])).await;
        assert_eq!(read, tcp_frame(2, 1, &[0x03, 0x02, 0x00, value as u8]));

        simulator.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simulation_while_clients_poll() {
    let (simulator, addr) = running_simulator(EngineKind::Native).await;
    simulator
        .change_simulation_settings(Duration::from_millis(10))
        .await
        .unwrap();
    simulator.start_stop_simulation(true).await;

    let mut clients = Vec::new();
    for client in 0..4u16 {
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for i in 0..20u16 {
                let id = client * 100 + i;
                let reply =
                    exchange(&mut stream, &tcp_frame(id, 1, &[0x03, 0x00, 0x00, 0x00, 0x03])).await;
                assert_eq!(&reply[..2], &id.to_be_bytes());
                assert_eq!(&reply[7..9], &[0x03, 0x06]);
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    simulator.stop_server().await.unwrap();
    assert!(!simulator.is_simulating());
    let frozen = simulator.get_value(1, BlockKind::HoldingRegister, 0).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(simulator.get_value(1, BlockKind::HoldingRegister, 0).unwrap(), frozen);
    simulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_on_one_address() {
    let store = Arc::new(RegisterStore::new());
    store.add_slave(1).unwrap();
    store.add_block(1, BlockKind::HoldingRegister, 0, 4).unwrap();

    let writers: Vec<_> = (1..=8u16)
        .map(|value| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for _ in 0..100 {
                    store.set_value(1, BlockKind::HoldingRegister, 0, value).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let value = store.get_value(1, BlockKind::HoldingRegister, 0).unwrap();
    assert!((1..=8).contains(&value));
}

#[tokio::test]
async fn test_state_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("slaves.json");

    let (simulator, addr) = running_simulator(EngineKind::Native).await;
    let mut stream = TcpStream::connect(addr).await?;
    exchange(&mut stream, &tcp_frame(1, 1, &[0x06, 0x00, 0x01, 0x00, 0x2A])).await;
    simulator.reconciliation().run_once();
    simulator.save_state(&path)?;
    simulator.shutdown().await?;

    let restored = Simulator::new(config(EngineKind::TokioModbus)).await?;
    let state = StateConfig {
        load_state: true,
        file: path,
    };
    assert!(restored.restore_saved_state(&state));
    assert_eq!(restored.slaves(), vec![1, 2]);
    assert_eq!(restored.get_value(1, BlockKind::HoldingRegister, 1)?, 42);

    restored.start_server().await?;
    let addr = restored.local_addr().expect("tokio-modbus engine bound");
    let mut stream = TcpStream::connect(addr).await?;
    let reply = exchange(&mut stream, &tcp_frame(7, 2, &[0x04, 0x00, 0x00, 0x00, 0x02])).await;
    assert_eq!(reply, tcp_frame(7, 2, &[0x04, 0x04, 0x00, 0x63, 0x00, 0x63]));
    restored.shutdown().await?;
    Ok(())
}

#[test]
fn test_config_file_drives_simulator() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    let yaml = concat!(
        "block:\n  start: 100\n  size: 4\n",
        "simulation:\n  reg_min: 5\n  reg_max: 5\n",
        "logging:\n  enabled: false\n",
    );
    std::io::Write::write_all(&mut file, yaml.as_bytes())?;
    let config = SimulatorConfig::from_file(file.path())?;

    tokio_test::block_on(async {
        let simulator = Simulator::new(config).await?;
        simulator.add_slaves(3, 1)?;
        assert_eq!(
            simulator.active_space().live().block_layout(3, BlockKind::InputRegister)?,
            (100, 4)
        );
        simulator.add_entries(3, BlockKind::InputRegister, 4, 0)?;
        assert_eq!(simulator.scheduler(TransportKind::Tcp).run_once(), 4);
        assert_eq!(simulator.get_value(3, BlockKind::InputRegister, 3)?, 5);
        Ok::<_, anyhow::Error>(())
    })
}
