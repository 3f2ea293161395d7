/// Native protocol engine
///
/// MBAP and RTU framing are handled here; requests are served through the
/// shared [`handler`](super::handler). The engine runs on the caller's
/// tokio runtime:
///
/// - TCP: one accept loop plus one task per client, each client task
///   bounded by the request timeout.
/// - RTU: a single request loop on the serial port, frames delimited by a
///   3.5 character silent interval.
///
/// Every task listens on a broadcast shutdown channel; `stop` sends the
/// signal and joins the server task, which in turn joins its clients.

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_serial::SerialStream;

use super::handler;
use super::serial::SerialSettings;
use super::{EngineKind, ProtocolEngine, ServerStats, TcpSettings, TransportConfig};
use crate::codec::{self, MbapHeader, MAX_RTU_FRAME_SIZE, MBAP_HEADER_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::register_store::RegisterStore;
use crate::utils::log_packet;

type SharedStats = Arc<Mutex<ServerStats>>;

struct RunningServer {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// Protocol engine with in-crate framing
pub struct NativeEngine {
    transport: TransportConfig,
    store: Arc<RegisterStore>,
    stats: SharedStats,
    server: tokio::sync::Mutex<Option<RunningServer>>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
}

impl NativeEngine {
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

    async fn spawn_tcp(
        &self,
        settings: &TcpSettings,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> ModbusResult<JoinHandle<()>> {
        let endpoint = settings.endpoint();
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|e| ModbusError::bind(&endpoint, e.to_string()))?;
        let bound = listener.local_addr().ok();
        *self.local_addr.lock() = bound;

        info!("Modbus TCP server listening on {}", bound.map_or(endpoint, |a| a.to_string()));
        debug!(
            "   max connections: {}, request timeout: {:?}",
            settings.max_connections,
            settings.request_timeout()
        );

        Ok(tokio::spawn(serve_tcp(
            listener,
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            Arc::clone(&self.running),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
            settings.clone(),
        )))
    }

    fn spawn_rtu(
        &self,
        settings: &SerialSettings,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> ModbusResult<JoinHandle<()>> {
        let port = settings.open()?;
        info!(
            "Modbus RTU server listening on {} ({} baud, {}{}{})",
            settings.port, settings.baudrate, settings.bytesize, settings.parity, settings.stopbits
        );

        Ok(tokio::spawn(serve_rtu(
            port,
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            Arc::clone(&self.running),
            shutdown_tx.subscribe(),
            settings.clone(),
        )))
    }
}

#[async_trait]
impl ProtocolEngine for NativeEngine {
    async fn start(&self) -> ModbusResult<()> {
        let mut server = self.server.lock().await;
        if server.is_some() && self.is_running() {
            return Err(ModbusError::protocol("Server is already running"));
        }
        if let Some(stale) = server.take() {
            warn!(
                "Modbus {} server on {} had stopped on its own, restarting",
                self.transport.kind(),
                self.transport.describe()
            );
            if let Err(e) = stale.handle.await {
                error!("Modbus {} server task failed: {}", self.transport.kind(), e);
            }
        }

        // Set before spawning so a server task that exits at once leaves it cleared
        self.running.store(true, Ordering::SeqCst);
        let (shutdown_tx, _) = broadcast::channel(1);
        let spawned = match &self.transport {
            TransportConfig::Tcp(settings) => self.spawn_tcp(settings, &shutdown_tx).await,
            TransportConfig::Rtu(settings) => self.spawn_rtu(settings, &shutdown_tx),
        };
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let started_at = Instant::now();
        *self.started_at.lock() = Some(started_at);
        *server = Some(RunningServer {
            shutdown_tx,
            handle,
            started_at,
        });
        Ok(())
    }

    async fn stop(&self) -> ModbusResult<()> {
        let mut server = self.server.lock().await;
        let Some(running) = server.take() else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.handle.await {
            error!("Modbus {} server task failed: {}", self.transport.kind(), e);
        }

        self.running.store(false, Ordering::SeqCst);
        *self.local_addr.lock() = None;
        *self.started_at.lock() = None;
        info!(
            "Modbus {} server on {} stopped after {:?}",
            self.transport.kind(),
            self.transport.describe(),
            running.started_at.elapsed()
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn engine_kind(&self) -> EngineKind {
        EngineKind::Native
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

async fn serve_tcp(
    listener: TcpListener,
    store: Arc<RegisterStore>,
    stats: SharedStats,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    settings: TcpSettings,
) {
    let mut clients = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if clients.len() >= settings.max_connections {
                            warn!(
                                "Rejecting {}: {} clients already connected",
                                addr,
                                clients.len()
                            );
                            continue;
                        }
                        clients.spawn(handle_client(
                            stream,
                            addr,
                            Arc::clone(&store),
                            Arc::clone(&stats),
                            shutdown_tx.subscribe(),
                            settings.request_timeout(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drop(listener);
    while clients.join_next().await.is_some() {}
    running.store(false, Ordering::SeqCst);
}

/// Read one MBAP frame; `None` when the peer closed the connection
async fn read_mbap_frame(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
) -> ModbusResult<Option<(MbapHeader, BytesMut)>> {
    let mut header = [0u8; MBAP_HEADER_SIZE];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = MbapHeader::parse(&header)?;
    buffer.clear();
    buffer.resize(header.pdu_len(), 0);
    stream.read_exact(&mut buffer[..]).await?;
    Ok(Some((header, buffer.split())))
}

async fn handle_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    store: Arc<RegisterStore>,
    stats: SharedStats,
    mut shutdown_rx: broadcast::Receiver<()>,
    request_timeout: Duration,
) {
    info!("New client connected: {}", peer_addr);
    stats.lock().connections_count += 1;

    let peer = peer_addr.to_string();
    let mut buffer = BytesMut::with_capacity(codec::MAX_TCP_FRAME_SIZE);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received for client {}", peer_addr);
                break;
            }
            result = timeout(request_timeout, read_mbap_frame(&mut stream, &mut buffer)) => {
                let (header, pdu) = match result {
                    Ok(Ok(Some(frame))) => frame,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!("Dropping client {}: {}", peer_addr, e);
                        break;
                    }
                    Err(_) => {
                        warn!("Read timeout from {}", peer_addr);
                        break;
                    }
                };

                {
                    let mut stats = stats.lock();
                    stats.total_requests += 1;
                    stats.bytes_received += (MBAP_HEADER_SIZE + pdu.len()) as u64;
                }
                log_packet("TCP", "recv", &peer, &pdu);

                let Some(reply) = handler::process_pdu(&store, header.unit_id, &pdu) else {
                    stats.lock().failed_requests += 1;
                    continue;
                };
                let frame = codec::encode_mbap(header.transaction_id, header.unit_id, &reply);
                log_packet("TCP", "send", &peer, &frame);

                if let Err(e) = stream.write_all(&frame).await {
                    error!("Failed to send response to {}: {}", peer_addr, e);
                    break;
                }

                let mut stats = stats.lock();
                stats.bytes_sent += frame.len() as u64;
                if reply[0] & 0x80 == 0 {
                    stats.successful_requests += 1;
                } else {
                    stats.failed_requests += 1;
                }
            }
        }
    }

    info!("Client {} disconnected", peer_addr);
}

/// Collect bytes until the line stays silent for `frame_gap`
async fn read_rtu_frame(port: &mut SerialStream, frame_gap: Duration) -> ModbusResult<Vec<u8>> {
    let mut frame = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match timeout(frame_gap, port.read_exact(&mut byte)).await {
            Ok(Ok(_)) => {
                frame.push(byte[0]);
                if frame.len() > MAX_RTU_FRAME_SIZE {
                    return Err(ModbusError::frame("RTU frame too large"));
                }
            }
            Ok(Err(e)) => return Err(ModbusError::io(format!("Serial read error: {}", e))),
            Err(_) => {
                if !frame.is_empty() {
                    return Ok(frame);
                }
            }
        }
    }
}

async fn serve_rtu(
    mut port: SerialStream,
    store: Arc<RegisterStore>,
    stats: SharedStats,
    running: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
    settings: SerialSettings,
) {
    let frame_gap = settings.frame_gap();
    let write_timeout = settings.write_timeout();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received, closing {}", settings.port);
                break;
            }
            result = read_rtu_frame(&mut port, frame_gap) => {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e @ ModbusError::Frame { .. }) => {
                        warn!("Discarding RTU frame on {}: {}", settings.port, e);
                        continue;
                    }
                    Err(e) => {
                        error!("{} on {}, stopping RTU server", e, settings.port);
                        break;
                    }
                };

                log_packet("RTU", "recv", &settings.port, &frame);
                stats.lock().total_requests += 1;
                stats.lock().bytes_received += frame.len() as u64;

                let (slave_id, pdu) = match codec::decode_rtu(&frame) {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!("Discarding RTU frame on {}: {}", settings.port, e);
                        stats.lock().failed_requests += 1;
                        continue;
                    }
                };
                // Broadcast requests are never answered
                if slave_id == 0 {
                    continue;
                }

                let Some(reply) = handler::process_pdu(&store, slave_id, pdu) else {
                    stats.lock().failed_requests += 1;
                    continue;
                };
                let response = codec::encode_rtu(slave_id, &reply);
                log_packet("RTU", "send", &settings.port, &response);

                match timeout(write_timeout, port.write_all(&response)).await {
                    Ok(Ok(())) => {
                        let mut stats = stats.lock();
                        stats.bytes_sent += response.len() as u64;
                        if reply[0] & 0x80 == 0 {
                            stats.successful_requests += 1;
                        } else {
                            stats.failed_requests += 1;
                        }
                    }
                    Ok(Err(e)) => {
                        error!("Failed to send RTU response on {}: {}", settings.port, e);
                        stats.lock().failed_requests += 1;
                    }
                    Err(_) => {
                        let err = ModbusError::timeout(
                            "serial write",
                            write_timeout.as_millis() as u64,
                        );
                        warn!("{} on {}", err, settings.port);
                        stats.lock().failed_requests += 1;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
}
