//! rustcache TCP server
//!
//! Accepts framed operation batches, executes them against a shared
//! in-memory map and writes length-prefixed response batches back, reusing
//! buffers across events on each connection.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{read_frame, Wire};
use crate::constants::{
    DEFAULT_HOST, DEFAULT_NETWORK, DEFAULT_PORT, HEADER_SIZE, MAX_REQUEST_BATCH, OK, PONG,
    SHUTDOWN_TIMEOUT,
};
use crate::error::{Result, RustCacheError};
use crate::protocol::{BatchedRequest, BatchedResponse, OpResult, Operation, OperationKind};
use crate::store::CacheMap;

/// rustcache server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub network: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RustCacheError::InvalidAddress);
        }
        if self.port == 0 {
            return Err(RustCacheError::InvalidPort(self.port));
        }
        if self.network != DEFAULT_NETWORK {
            return Err(RustCacheError::UnsupportedNetwork(self.network.clone()));
        }
        Ok(())
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// rustcache TCP server
pub struct RustCacheServer {
    config: ServerConfig,
    store: Arc<CacheMap>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: Notify,
}

impl RustCacheServer {
    /// Create a new server instance. Configuration errors are fatal and
    /// never retried.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store: Arc::new(CacheMap::new()),
            shutdown_tx,
            stopped: Notify::new(),
        })
    }

    /// Run the accept loop until [`RustCacheServer::stop`] is called. Each
    /// connection is served by its own task with its own buffer set; the
    /// store lock serializes mutation.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.addr()).await?;
        info!("rustcache server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("client connected: {peer}");
                            let store = Arc::clone(&self.store);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, store, shutdown_rx).await {
                                    warn!("client {peer} closed with error: {err}");
                                }
                                debug!("client disconnected: {peer}");
                            });
                        }
                        Err(err) => {
                            warn!("failed to accept connection: {err}");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        debug!("server stopped with {} entries", self.store.len().await);
        self.stopped.notify_one();
        Ok(())
    }

    /// Signal shutdown, wait up to `SHUTDOWN_TIMEOUT` for the accept loop to
    /// acknowledge, then free the store.
    pub async fn stop(&self) -> Result<()> {
        let stopped = self.stopped.notified();
        let _ = self.shutdown_tx.send(());

        if timeout(SHUTDOWN_TIMEOUT, stopped).await.is_err() {
            warn!("timed out waiting for the event loop to stop");
        }

        self.store.clear().await;
        Ok(())
    }
}

/// Per-connection state: the inbound payload and outbound encode buffers are
/// reused across events and only ever grow.
struct Connection {
    store: Arc<CacheMap>,
    payload: Vec<u8>,
    response: BatchedResponse,
    res_buffer: BytesMut,
    out_buffer: BytesMut,
}

impl Connection {
    fn new(store: Arc<CacheMap>) -> Self {
        Connection {
            store,
            payload: Vec::new(),
            response: BatchedResponse {
                results: Vec::with_capacity(MAX_REQUEST_BATCH),
            },
            res_buffer: BytesMut::with_capacity(4096),
            out_buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Decode, execute and re-encode one inbound payload. Request-level
    /// failures become one-entry FAILURE batches; the connection survives
    /// them all.
    async fn process_payload(&mut self) -> &[u8] {
        let request = match BatchedRequest::decode_exact(&self.payload) {
            Ok(request) => request,
            Err(err) => return self.failure_response(&err.to_string()),
        };

        if request.operations.len() > MAX_REQUEST_BATCH {
            let message = format!(
                "batch too large: {} operations exceeds limit of {}",
                request.operations.len(),
                MAX_REQUEST_BATCH
            );
            return self.failure_response(&message);
        }

        self.response.results.clear();
        for operation in &request.operations {
            let result = execute(operation, &self.store).await;
            self.response.results.push(result);
        }

        self.frame_response()
    }

    fn failure_response(&mut self, message: &str) -> &[u8] {
        self.response.results.clear();
        self.response.results.push(OpResult::failure(message));
        self.frame_response()
    }

    fn frame_response(&mut self) -> &[u8] {
        self.res_buffer.clear();
        self.response.encode(&mut self.res_buffer);

        self.out_buffer.clear();
        self.out_buffer.reserve(HEADER_SIZE + self.res_buffer.len());
        self.out_buffer.put_u32_le(self.res_buffer.len() as u32);
        self.out_buffer.extend_from_slice(&self.res_buffer);
        &self.out_buffer
    }
}

async fn execute(operation: &Operation, store: &CacheMap) -> OpResult {
    match operation.kind {
        OperationKind::PING => OpResult::success(PONG),
        OperationKind::SET => match store.set(&operation.key, &operation.value).await {
            Ok(()) => OpResult::success(OK),
            Err(err) => OpResult::failure(err.to_string()),
        },
        OperationKind::GET => match store.get(&operation.key).await {
            Ok(value) => OpResult::success(value),
            Err(err) => OpResult::failure(err.to_string()),
        },
        OperationKind::DELETE => match store.del(&operation.key).await {
            Ok(()) => OpResult::success(OK),
            Err(err) => OpResult::failure(err.to_string()),
        },
        kind => OpResult::failure(format!("undefined operation: {kind}")),
    }
}

async fn handle_connection(
    stream: TcpStream,
    store: Arc<CacheMap>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut conn = Connection::new(store);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader, &mut conn.payload) => {
                match frame? {
                    None => break,
                    Some(_) => {
                        let out = conn.process_payload().await;
                        writer.write_all(out).await?;
                        writer.flush().await?;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultStatus;

    fn encoded_request(operations: Vec<Operation>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        BatchedRequest { operations }.encode(&mut buf);
        buf.to_vec()
    }

    async fn run_payload(conn: &mut Connection, payload: Vec<u8>) -> BatchedResponse {
        conn.payload = payload;
        let framed = conn.process_payload().await;

        let (header, body) = framed.split_at(HEADER_SIZE);
        assert_eq!(header, (body.len() as u32).to_le_bytes().as_slice());
        BatchedResponse::decode_exact(body).unwrap()
    }

    #[tokio::test]
    async fn executes_operations_in_order() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));
        let payload = encoded_request(vec![
            Operation::ping(),
            Operation::set("key", "value"),
            Operation::get("key"),
            Operation::delete("key"),
            Operation::get("key"),
        ]);

        let response = run_payload(&mut conn, payload).await;
        assert_eq!(response.results.len(), 5);
        assert_eq!(response.results[0], OpResult::success(PONG));
        assert_eq!(response.results[1], OpResult::success(OK));
        assert_eq!(response.results[2], OpResult::success("value"));
        assert_eq!(response.results[3], OpResult::success(OK));
        assert_eq!(response.results[4], OpResult::failure("key key not set"));
    }

    #[tokio::test]
    async fn missing_key_reports_not_set() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));
        let payload = encoded_request(vec![Operation::get("absent")]);

        let response = run_payload(&mut conn, payload).await;
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].status, ResultStatus::FAILURE);
        let message = String::from_utf8(response.results[0].message.clone()).unwrap();
        assert!(message.contains("not set"), "unexpected message: {message}");
    }

    #[tokio::test]
    async fn undefined_operation_fails_per_op() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));
        let payload = encoded_request(vec![
            Operation {
                kind: OperationKind(9),
                key: b"k".to_vec(),
                value: Vec::new(),
            },
            Operation::ping(),
        ]);

        let response = run_payload(&mut conn, payload).await;
        assert_eq!(response.results.len(), 2);
        assert_eq!(
            response.results[0],
            OpResult::failure("undefined operation: 9")
        );
        assert_eq!(response.results[1], OpResult::success(PONG));
    }

    #[tokio::test]
    async fn malformed_payload_answers_single_failure() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));

        for payload in [Vec::new(), vec![0xff; 3], vec![1, 0, 0, 0]] {
            let response = run_payload(&mut conn, payload).await;
            assert_eq!(response.results.len(), 1);
            assert_eq!(response.results[0].status, ResultStatus::FAILURE);
        }
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));
        let operations = vec![Operation::ping(); MAX_REQUEST_BATCH + 1];
        let payload = encoded_request(operations);

        let response = run_payload(&mut conn, payload).await;
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].status, ResultStatus::FAILURE);
        let message = String::from_utf8(response.results[0].message.clone()).unwrap();
        assert!(
            message.contains("batch too large"),
            "unexpected message: {message}"
        );
    }

    #[tokio::test]
    async fn full_batch_is_accepted() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));
        let operations = vec![Operation::ping(); MAX_REQUEST_BATCH];
        let payload = encoded_request(operations);

        let response = run_payload(&mut conn, payload).await;
        assert_eq!(response.results.len(), MAX_REQUEST_BATCH);
    }

    #[tokio::test]
    async fn buffers_are_reused_across_events() {
        let mut conn = Connection::new(Arc::new(CacheMap::new()));

        let first = run_payload(&mut conn, encoded_request(vec![Operation::ping()])).await;
        assert_eq!(first.results[0], OpResult::success(PONG));
        let res_capacity = conn.res_buffer.capacity();
        let out_capacity = conn.out_buffer.capacity();

        let second = run_payload(&mut conn, encoded_request(vec![Operation::ping()])).await;
        assert_eq!(second.results[0], OpResult::success(PONG));
        assert_eq!(conn.res_buffer.capacity(), res_capacity);
        assert_eq!(conn.out_buffer.capacity(), out_capacity);
    }

    #[test]
    fn config_validation() {
        assert!(RustCacheServer::new(ServerConfig::default()).is_ok());

        let bad_port = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            RustCacheServer::new(bad_port),
            Err(RustCacheError::InvalidPort(0))
        ));

        let bad_host = ServerConfig {
            host: String::new(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            RustCacheServer::new(bad_host),
            Err(RustCacheError::InvalidAddress)
        ));

        let bad_network = ServerConfig {
            network: "udp".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            RustCacheServer::new(bad_network),
            Err(RustCacheError::UnsupportedNetwork(_))
        ));
    }

    #[tokio::test]
    async fn stop_frees_the_store() {
        let server = RustCacheServer::new(ServerConfig::default()).unwrap();
        server.store.set(b"key", b"value").await.unwrap();

        server.stop().await.unwrap();
        assert!(server.store.is_empty().await);
    }
}
