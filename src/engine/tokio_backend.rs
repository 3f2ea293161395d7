/// `tokio-modbus` protocol engine
///
/// The `tokio-modbus` server owns its connection tasks and offers no way to
/// cancel them, so the engine gives it a dedicated multi-thread runtime and
/// shuts that runtime down on `stop`. Every connection dies with it.

use async_trait::async_trait;
use futures::future;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio_modbus::prelude::*;
use tokio_modbus::server::rtu::Server as RtuServer;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server as TcpServer};

use super::handler;
use super::serial::SerialSettings;
use super::{EngineKind, ProtocolEngine, ServerStats, TcpSettings, TransportConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse};
use crate::register_store::RegisterStore;

/// Grace period for in-flight requests when the runtime shuts down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type Ready = oneshot::Sender<ModbusResult<Option<SocketAddr>>>;

/// `tokio-modbus` service backed by the live store
#[derive(Clone)]
struct SimulatorService {
    store: Arc<RegisterStore>,
    stats: Arc<Mutex<ServerStats>>,
    /// RTU slaves stay silent on slave 0; over TCP it is an ordinary unit id
    silent_broadcast: bool,
}

impl tokio_modbus::server::Service for SimulatorService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;
        debug!("tokio-modbus request for slave {}: {:?}", slave, request);

        if slave == 0 && self.silent_broadcast {
            return future::ready(Ok(None));
        }

        let result = handler::handle_request(&self.store, slave, &from_tokio_request(request))
            .map(|response| Some(to_tokio_response(response)))
            .map_err(to_exception_code);

        let mut stats = self.stats.lock();
        stats.total_requests += 1;
        if result.is_ok() {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }

        future::ready(result)
    }
}

fn from_tokio_request(request: Request<'static>) -> ModbusRequest {
    let read = |function, address, quantity| ModbusRequest::Read {
        function,
        address,
        quantity,
    };

    match request {
        Request::ReadCoils(address, quantity) => read(ModbusFunction::ReadCoils, address, quantity),
        Request::ReadDiscreteInputs(address, quantity) => {
            read(ModbusFunction::ReadDiscreteInputs, address, quantity)
        }
        Request::ReadHoldingRegisters(address, quantity) => {
            read(ModbusFunction::ReadHoldingRegisters, address, quantity)
        }
        Request::ReadInputRegisters(address, quantity) => {
            read(ModbusFunction::ReadInputRegisters, address, quantity)
        }
        Request::WriteSingleCoil(address, value) => {
            ModbusRequest::WriteSingleCoil { address, value }
        }
        Request::WriteSingleRegister(address, value) => {
            ModbusRequest::WriteSingleRegister { address, value }
        }
        Request::WriteMultipleCoils(address, values) => ModbusRequest::WriteMultipleCoils {
            address,
            values: values.into_owned(),
        },
        Request::WriteMultipleRegisters(address, values) => ModbusRequest::WriteMultipleRegisters {
            address,
            values: values.into_owned(),
        },
        other => ModbusRequest::Unsupported {
            function_code: other.function_code().value(),
        },
    }
}

fn to_tokio_response(response: ModbusResponse) -> Response {
    match response {
        ModbusResponse::ReadCoils(bits) => Response::ReadCoils(bits),
        ModbusResponse::ReadDiscreteInputs(bits) => Response::ReadDiscreteInputs(bits),
        ModbusResponse::ReadHoldingRegisters(values) => Response::ReadHoldingRegisters(values),
        ModbusResponse::ReadInputRegisters(values) => Response::ReadInputRegisters(values),
        ModbusResponse::WriteSingleCoil(address, value) => {
            Response::WriteSingleCoil(address, value)
        }
        ModbusResponse::WriteSingleRegister(address, value) => {
            Response::WriteSingleRegister(address, value)
        }
        ModbusResponse::WriteMultipleCoils(address, quantity) => {
            Response::WriteMultipleCoils(address, quantity)
        }
        ModbusResponse::WriteMultipleRegisters(address, quantity) => {
            Response::WriteMultipleRegisters(address, quantity)
        }
    }
}

fn to_exception_code(exception: ModbusException) -> ExceptionCode {
    match exception {
        ModbusException::IllegalFunction => ExceptionCode::IllegalFunction,
        ModbusException::IllegalDataAddress => ExceptionCode::IllegalDataAddress,
        ModbusException::IllegalDataValue => ExceptionCode::IllegalDataValue,
        ModbusException::ServerDeviceFailure => ExceptionCode::ServerDeviceFailure,
        ModbusException::Acknowledge => ExceptionCode::Acknowledge,
        ModbusException::ServerDeviceBusy => ExceptionCode::ServerDeviceBusy,
        ModbusException::MemoryParityError => ExceptionCode::MemoryParityError,
        ModbusException::GatewayPathUnavailable => ExceptionCode::GatewayPathUnavailable,
        ModbusException::GatewayTargetDeviceFailedToRespond => ExceptionCode::GatewayTargetDevice,
    }
}

async fn serve_tcp(
    settings: TcpSettings,
    service: SimulatorService,
    running: Arc<AtomicBool>,
    ready: Ready,
) {
    let endpoint = settings.endpoint();
    let listener = match TcpListener::bind(&endpoint).await {
        Ok(listener) => listener,
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(ModbusError::bind(&endpoint, e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(listener.local_addr().ok()));

    let stats = Arc::clone(&service.stats);
    let server = TcpServer::new(listener);
    let on_connected = move |stream, socket_addr| {
        let service = service.clone();
        stats.lock().connections_count += 1;
        async move {
            info!("New client connected: {}", socket_addr);
            accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(service.clone())))
        }
    };
    let on_process_error = |err| {
        error!("Modbus TCP connection error: {}", err);
    };

    if let Err(e) = server.serve(&on_connected, on_process_error).await {
        error!("Modbus TCP server on {} failed: {}", endpoint, e);
    }
    running.store(false, Ordering::SeqCst);
}

async fn serve_rtu(
    settings: SerialSettings,
    service: SimulatorService,
    running: Arc<AtomicBool>,
    ready: Ready,
) {
    let serial = match settings.open() {
        Ok(serial) => serial,
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(None));

    let server = RtuServer::new(serial);
    match server.serve_forever(service).await {
        Ok(()) => warn!("Modbus RTU server on {} finished", settings.port),
        Err(e) => error!("Modbus RTU server on {} failed: {}", settings.port, e),
    }
    running.store(false, Ordering::SeqCst);
}

struct RunningRuntime {
    runtime: Runtime,
    started_at: Instant,
}

/// Protocol engine backed by `tokio-modbus`
pub struct TokioModbusEngine {
    transport: TransportConfig,
    store: Arc<RegisterStore>,
    stats: Arc<Mutex<ServerStats>>,
    server: tokio::sync::Mutex<Option<RunningRuntime>>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
}

impl TokioModbusEngine {
    pub fn new(transport: TransportConfig, store: Arc<RegisterStore>) -> Self {
        Self {
            transport,
            store,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            server: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProtocolEngine for TokioModbusEngine {
    async fn start(&self) -> ModbusResult<()> {
        let mut server = self.server.lock().await;
        if server.is_some() && self.is_running() {
            return Err(ModbusError::protocol("Server is already running"));
        }
        if let Some(stale) = server.take() {
            warn!(
                "tokio-modbus {} server on {} had stopped on its own, restarting",
                self.transport.kind(),
                self.transport.describe()
            );
            stale.runtime.shutdown_background();
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("modbus-simu-server")
            .enable_all()
            .build()
            .map_err(|e| ModbusError::internal(format!("Failed to build server runtime: {}", e)))?;

        let service = SimulatorService {
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            silent_broadcast: matches!(self.transport, TransportConfig::Rtu(_)),
        };
        // Set before spawning so a server task that exits at once leaves it cleared
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let (ready_tx, ready_rx) = oneshot::channel();
        match &self.transport {
            TransportConfig::Tcp(settings) => {
                runtime.spawn(serve_tcp(settings.clone(), service, running, ready_tx));
            }
            TransportConfig::Rtu(settings) => {
                runtime.spawn(serve_rtu(settings.clone(), service, running, ready_tx));
            }
        }

        let bound = match ready_rx.await {
            Ok(Ok(bound)) => bound,
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                runtime.shutdown_background();
                return Err(e);
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                runtime.shutdown_background();
                return Err(ModbusError::internal(
                    "Server task ended before acquiring the transport",
                ));
            }
        };

        *self.local_addr.lock() = bound;
        let started_at = Instant::now();
        *self.started_at.lock() = Some(started_at);
        info!(
            "tokio-modbus {} server listening on {}",
            self.transport.kind(),
            bound.map_or_else(|| self.transport.describe(), |a| a.to_string())
        );

        *server = Some(RunningRuntime { runtime, started_at });
        Ok(())
    }

    async fn stop(&self) -> ModbusResult<()> {
        let mut server = self.server.lock().await;
        let Some(running) = server.take() else {
            return Ok(());
        };

        let RunningRuntime { runtime, started_at } = running;
        tokio::task::spawn_blocking(move || runtime.shutdown_timeout(SHUTDOWN_TIMEOUT))
            .await
            .map_err(|e| ModbusError::internal(format!("Server runtime shutdown failed: {}", e)))?;

        self.running.store(false, Ordering::SeqCst);
        *self.local_addr.lock() = None;
        *self.started_at.lock() = None;
        info!(
            "tokio-modbus {} server on {} stopped after {:?}",
            self.transport.kind(),
            self.transport.describe(),
            started_at.elapsed()
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn engine_kind(&self) -> EngineKind {
        EngineKind::TokioModbus
    }

    fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().clone();
        stats.uptime_seconds = self
            .started_at
            .lock()
            .map_or(0, |started| started.elapsed().as_secs());
        stats.register_store_stats = Some(self.store.get_stats());
        stats
    }
}

impl Drop for TokioModbusEngine {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which is not allowed inside async code
        if let Some(running) = self.server.get_mut().take() {
            running.runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BlockKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn tcp_engine() -> TokioModbusEngine {
        let store = Arc::new(RegisterStore::new());
        store.add_slave(1).unwrap();
        store.add_block(1, BlockKind::Coil, 0, 8).unwrap();
        TokioModbusEngine::new(
            TransportConfig::Tcp(TcpSettings {
                port: 0,
                ..Default::default()
            }),
            store,
        )
    }

    #[test]
    fn test_request_conversion() {
        assert_eq!(
            from_tokio_request(Request::ReadCoils(3, 4)),
            ModbusRequest::Read {
                function: ModbusFunction::ReadCoils,
                address: 3,
                quantity: 4
            }
        );
        assert_eq!(
            from_tokio_request(Request::WriteMultipleRegisters(1, vec![5, 6].into())),
            ModbusRequest::WriteMultipleRegisters {
                address: 1,
                values: vec![5, 6]
            }
        );
        assert_eq!(
            from_tokio_request(Request::MaskWriteRegister(0, 0xFF00, 0x0012)),
            ModbusRequest::Unsupported { function_code: 0x16 }
        );
        assert_eq!(
            to_exception_code(ModbusException::GatewayTargetDeviceFailedToRespond),
            ExceptionCode::GatewayTargetDevice
        );
    }

    #[tokio::test]
    async fn test_serves_and_stops() {
        let engine = tcp_engine();
        engine.store().set_value(1, BlockKind::Coil, 1, 1).unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());
        let addr = engine.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x03])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x02]);

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        engine.stop().await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_engine_stopped() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();
        let engine = TokioModbusEngine::new(
            TransportConfig::Tcp(TcpSettings {
                port,
                ..Default::default()
            }),
            Arc::new(RegisterStore::new()),
        );
        assert!(matches!(engine.start().await, Err(ModbusError::Bind { .. })));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_serial_hangup_stops_engine() {
        use crate::codec::encode_rtu;
        use tokio_serial::{SerialPort, SerialStream};

        let (mut master, slave) = SerialStream::pair().unwrap();
        let store = Arc::new(RegisterStore::new());
        store.add_slave(1).unwrap();
        store.add_block(1, BlockKind::Coil, 0, 8).unwrap();
        store.set_value(1, BlockKind::Coil, 0, 1).unwrap();
        let engine = TokioModbusEngine::new(
            TransportConfig::Rtu(SerialSettings {
                port: slave.name().unwrap(),
                ..Default::default()
            }),
            store,
        );
        engine.start().await.unwrap();
        assert!(engine.is_running());

        master.write_all(&encode_rtu(1, &[0x01, 0x00, 0x00, 0x00, 0x03])).await.unwrap();
        let mut reply = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(2), master.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.to_vec(), encode_rtu(1, &[0x01, 0x01, 0x01]));

        drop(master);
        drop(slave);
        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.is_running() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let restart = engine.start().await;
        assert!(!matches!(restart, Err(ModbusError::Protocol { .. })));
        engine.stop().await.unwrap();
        assert!(!engine.is_running());
    }
}
