//! Pooled batching client for rustcache
//!
//! The client holds a fixed pool of long-lived connections. Every caller
//! submits into one shared bounded channel; whichever worker picks a request
//! up appends it to that worker's pending batch. A batch flushes when it
//! reaches `MAX_REQUEST_BATCH` operations or `BASE_WAIT_TIME` after its
//! first operation, whichever comes first. On flush the worker collapses
//! identical operations into a single wire operation and fans the reply back
//! out to every caller that shared it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Duration, Instant};
use tracing::{debug, warn};

use crate::codec::{read_frame, write_frame, Wire};
use crate::constants::{
    BASE_WAIT_TIME, CLIENT_REQUEST_TIMEOUT, CONN_RETRY_WAIT, DEFAULT_HOST, DEFAULT_NETWORK,
    DEFAULT_PORT, DIAL_TIMEOUT, ERR_PREFIX, MAX_CONNECTION_POOL, MAX_REQUEST_BATCH, OK, PONG,
    READ_TIMEOUT,
};
use crate::error::{Result, RustCacheError};
use crate::protocol::{BatchedRequest, BatchedResponse, OpResult, Operation, ResultStatus};

/// rustcache client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub network: String,
    pub pool_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            network: DEFAULT_NETWORK.to_string(),
            pool_size: MAX_CONNECTION_POOL,
        }
    }
}

impl ClientConfig {
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
        if self.pool_size == 0 {
            return Err(RustCacheError::InvalidPoolSize);
        }
        Ok(())
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One caller's submission: the operation plus a single-shot reply sink.
struct CallerRequest {
    operation: Operation,
    reply: oneshot::Sender<Vec<String>>,
}

/// Receiver end of the shared request channel. Workers take turns locking it
/// so any caller may be picked up by any idle worker.
type SharedRequests = Arc<Mutex<mpsc::Receiver<CallerRequest>>>;

#[derive(Debug)]
struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Client for a rustcache server
#[derive(Debug)]
pub struct Client {
    requests: mpsc::Sender<CallerRequest>,
    workers: Vec<WorkerHandle>,
}

impl Client {
    /// Connect to a server at the default address.
    pub async fn connect_default() -> Result<Self> {
        Self::connect(ClientConfig::default()).await
    }

    /// Open the connection pool, start one worker per connection and verify
    /// the path with a ping. Construction errors leave no running workers.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.addr();

        // Dial the whole pool before spawning anything so a failed dial
        // cannot leave half a client behind.
        let mut connections = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            connections.push(connect_with_timeout(&addr, DIAL_TIMEOUT).await?);
        }

        let (requests_tx, requests_rx) =
            mpsc::channel(MAX_REQUEST_BATCH * config.pool_size);
        let shared: SharedRequests = Arc::new(Mutex::new(requests_rx));

        let mut workers = Vec::with_capacity(config.pool_size);
        for conn in connections {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let worker = Worker {
                conn,
                shutdown: shutdown_rx,
                requests: Arc::clone(&shared),
            };
            workers.push(WorkerHandle {
                shutdown: shutdown_tx,
                task: tokio::spawn(worker.scheduler()),
            });
        }

        let mut client = Client {
            requests: requests_tx,
            workers,
        };

        if let Err(err) = client.ping().await {
            client.stop().await?;
            return Err(err);
        }

        Ok(client)
    }

    pub async fn ping(&self) -> Result<()> {
        self.validate_client()?;
        let response = self.send_request(Operation::ping()).await?;
        expect_response("ping", PONG, &response)
    }

    /// Get the value stored for `key`.
    pub async fn get(&self, key: &str) -> Result<String> {
        self.validate_params(&[key])?;
        let response = self.send_request(Operation::get(key)).await?;
        get_response(key, &response)
    }

    /// Set `key` to `val`.
    pub async fn set(&self, key: &str, val: &str) -> Result<()> {
        self.validate_params(&[key, val])?;
        let response = self.send_request(Operation::set(key, val)).await?;
        expect_response("set", OK, &response)
    }

    /// Delete `key`; deleting an absent key succeeds.
    pub async fn del(&self, key: &str) -> Result<()> {
        self.validate_params(&[key])?;
        let response = self.send_request(Operation::delete(key)).await?;
        expect_response("del", OK, &response)
    }

    /// Shut every worker down and close the pool. Pending callers receive a
    /// `request aborted` error; afterwards the client is uninitialised.
    pub async fn stop(&mut self) -> Result<()> {
        for worker in self.workers.drain(..) {
            let _ = worker.shutdown.send(true);
            if let Err(err) = worker.task.await {
                warn!("worker task failed during stop: {err}");
            }
        }
        Ok(())
    }

    async fn send_request(&self, operation: Operation) -> Result<Vec<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CallerRequest {
            operation,
            reply: reply_tx,
        };

        timeout(CLIENT_REQUEST_TIMEOUT, async {
            self.requests
                .send(request)
                .await
                .map_err(|_| RustCacheError::RequestAborted)?;
            reply_rx.await.map_err(|_| RustCacheError::RequestAborted)
        })
        .await
        .map_err(|_| RustCacheError::RequestTimeout(CLIENT_REQUEST_TIMEOUT))?
    }

    fn validate_client(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(RustCacheError::ClientUninitialized);
        }
        Ok(())
    }

    fn validate_params(&self, params: &[&str]) -> Result<()> {
        self.validate_client()?;
        if params.iter().any(|param| param.is_empty()) {
            return Err(RustCacheError::EmptyParameter);
        }
        Ok(())
    }
}

/// Dial with a bounded retry loop: a timeout-typed failure is returned
/// immediately, anything else (refused, unreachable) retries every
/// `CONN_RETRY_WAIT` until the overall deadline passes.
async fn connect_with_timeout(addr: &str, dial_timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + dial_timeout;
    loop {
        match timeout(dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) if err.kind() == io::ErrorKind::TimedOut => {
                return Err(RustCacheError::Io(err));
            }
            Err(_) => {
                return Err(RustCacheError::DialTimeout {
                    addr: addr.to_string(),
                    timeout: dial_timeout,
                });
            }
            Ok(Err(err)) => {
                if Instant::now() >= deadline {
                    return Err(RustCacheError::DialTimeout {
                        addr: addr.to_string(),
                        timeout: dial_timeout,
                    });
                }
                debug!("dial {addr} failed ({err}), retrying");
                sleep(CONN_RETRY_WAIT).await;
            }
        }
    }
}

/// One worker owns one connection plus its pending batch and flush timer, so
/// the size-reached flush and the timer flush can never race.
struct Worker {
    conn: TcpStream,
    shutdown: watch::Receiver<bool>,
    requests: SharedRequests,
}

impl Worker {
    async fn scheduler(mut self) {
        let mut batch: Vec<Operation> = Vec::new();
        let mut callers: Vec<CallerRequest> = Vec::new();
        let mut encode_buf = BytesMut::with_capacity(4096);
        let mut read_buf: Vec<u8> = Vec::new();
        let mut deadline = Instant::now();
        let mut armed = false;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    abort_batch(&mut callers);
                    return;
                }

                request = recv_shared(&self.requests) => {
                    let Some(request) = request else {
                        // all senders gone: the client was dropped
                        abort_batch(&mut callers);
                        return;
                    };

                    if batch.is_empty() {
                        deadline = Instant::now() + BASE_WAIT_TIME;
                        armed = true;
                    }
                    batch.push(request.operation.clone());
                    callers.push(request);

                    if batch.len() >= MAX_REQUEST_BATCH {
                        self.process_batch(&mut batch, &mut callers, &mut encode_buf, &mut read_buf)
                            .await;
                        armed = false;
                    }
                }

                _ = sleep_until(deadline), if armed => {
                    self.process_batch(&mut batch, &mut callers, &mut encode_buf, &mut read_buf)
                        .await;
                    armed = false;
                }
            }
        }
    }

    /// Flush the pending batch: deduplicate, encode, send, await the framed
    /// reply and fan results back out. Any batch-level error is routed to
    /// every caller; the worker itself survives and serves the next batch.
    async fn process_batch(
        &mut self,
        batch: &mut Vec<Operation>,
        callers: &mut Vec<CallerRequest>,
        encode_buf: &mut BytesMut,
        read_buf: &mut Vec<u8>,
    ) {
        if callers.is_empty() {
            return;
        }

        let operations = mem::take(batch);
        let requests = mem::take(callers);

        let (operations, reverse_index) = deduplicate(operations);
        let wire_batch = BatchedRequest { operations };

        encode_buf.clear();
        wire_batch.encode(encode_buf);

        if let Err(err) = write_frame(&mut self.conn, encode_buf).await {
            return batch_error(&err.to_string(), requests);
        }

        match timeout(READ_TIMEOUT, read_frame(&mut self.conn, read_buf)).await {
            Err(_) => {
                return batch_error(
                    &RustCacheError::ReadTimeout(READ_TIMEOUT).to_string(),
                    requests,
                )
            }
            Ok(Err(err)) => return batch_error(&err.to_string(), requests),
            Ok(Ok(None)) => {
                return batch_error("connection closed before response", requests)
            }
            Ok(Ok(Some(_))) => {}
        }

        let response = match BatchedResponse::decode_exact(read_buf) {
            Ok(response) => response,
            Err(err) => return batch_error(&err.to_string(), requests),
        };

        let results = response.results;
        if results.len() != wire_batch.operations.len() {
            let message = match (results.as_slice(), wire_batch.operations.as_slice()) {
                ([only], [first, ..]) => format!(
                    "received 1 response: ({}) {}, requests: {:?}",
                    only.status,
                    String::from_utf8_lossy(&only.message),
                    first,
                ),
                _ => format!(
                    "expected {} responses, received {}",
                    wire_batch.operations.len(),
                    results.len(),
                ),
            };
            return batch_error(&message, requests);
        }

        propagate_batch(results, requests, &reverse_index);
    }
}

async fn recv_shared(requests: &SharedRequests) -> Option<CallerRequest> {
    requests.lock().await.recv().await
}

/// Collapse operations with identical `(kind, key, value)` identity into one
/// wire operation each, preserving first-appearance order. The reverse index
/// maps each wire position to the caller positions that share it.
fn deduplicate(operations: Vec<Operation>) -> (Vec<Operation>, Vec<Vec<usize>>) {
    let mut first_seen: HashMap<Vec<u8>, usize> = HashMap::with_capacity(operations.len());
    let mut deduped: Vec<Operation> = Vec::with_capacity(operations.len());
    let mut reverse_index: Vec<Vec<usize>> = Vec::with_capacity(operations.len());

    for (caller_index, operation) in operations.into_iter().enumerate() {
        match first_seen.entry(operation.index()) {
            Entry::Occupied(entry) => reverse_index[*entry.get()].push(caller_index),
            Entry::Vacant(entry) => {
                entry.insert(deduped.len());
                reverse_index.push(vec![caller_index]);
                deduped.push(operation);
            }
        }
    }

    (deduped, reverse_index)
}

/// Deliver each result to every caller that shared its wire operation.
/// SUCCESS becomes `[message]`, FAILURE becomes `["-" + message]`.
fn propagate_batch(
    results: Vec<OpResult>,
    requests: Vec<CallerRequest>,
    reverse_index: &[Vec<usize>],
) {
    let mut requests: Vec<Option<CallerRequest>> = requests.into_iter().map(Some).collect();

    for (wire_index, result) in results.into_iter().enumerate() {
        let message = String::from_utf8_lossy(&result.message);
        let reply = if result.status == ResultStatus::FAILURE {
            err_reply(&message)
        } else {
            vec![message.into_owned()]
        };

        for &caller_index in &reverse_index[wire_index] {
            if let Some(request) = requests[caller_index].take() {
                // a dropped receiver means the caller timed out; nothing to do
                let _ = request.reply.send(reply.clone());
            }
        }
    }
}

fn batch_error(message: &str, requests: Vec<CallerRequest>) {
    let reply = err_reply(message);
    for request in requests {
        let _ = request.reply.send(reply.clone());
    }
}

fn abort_batch(callers: &mut Vec<CallerRequest>) {
    if callers.is_empty() {
        return;
    }
    debug!("aborting {} pending requests", callers.len());
    batch_error(
        &RustCacheError::RequestAborted.to_string(),
        mem::take(callers),
    );
}

fn err_reply(message: &str) -> Vec<String> {
    vec![format!("{ERR_PREFIX}{message}")]
}

fn error_response(command: &str, res: &[String]) -> Result<()> {
    let Some(first) = res.first() else {
        return Err(RustCacheError::UnexpectedResponse(format!(
            "empty response back from {command} request"
        )));
    };
    if first.is_empty() {
        return Err(RustCacheError::UnexpectedResponse(format!(
            "empty argument from {command} request"
        )));
    }
    if let Some(message) = first.strip_prefix(ERR_PREFIX) {
        return Err(RustCacheError::Response(message.to_string()));
    }
    Ok(())
}

fn get_response(key: &str, res: &[String]) -> Result<String> {
    error_response("get", res)?;
    match res {
        [value] if !value.is_empty() => Ok(value.clone()),
        _ => Err(RustCacheError::UnexpectedResponse(format!(
            "expected value for key {key}, received {} results: {res:?}",
            res.len(),
        ))),
    }
}

fn expect_response(command: &str, expected: &str, res: &[String]) -> Result<()> {
    error_response(command, res)?;
    match res {
        [value] if value == expected => Ok(()),
        _ => Err(RustCacheError::UnexpectedResponse(format!(
            "expected {expected} for {command}, received {res:?}",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client whose request channel is answered by the test instead of a
    /// real worker. The placeholder worker only marks the client as
    /// initialised.
    fn stub_client() -> (Client, mpsc::Receiver<CallerRequest>) {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        let client = Client {
            requests: requests_tx,
            workers: vec![WorkerHandle {
                shutdown: shutdown_tx,
                task: tokio::spawn(async {}),
            }],
        };
        (client, requests_rx)
    }

    fn answer_next(
        mut requests_rx: mpsc::Receiver<CallerRequest>,
        expected: Operation,
        reply: Vec<String>,
    ) {
        tokio::spawn(async move {
            let request = requests_rx.recv().await.expect("request should arrive");
            assert_eq!(request.operation, expected);
            let _ = request.reply.send(reply);
        });
    }

    #[tokio::test]
    async fn get_returns_value() {
        let (client, requests_rx) = stub_client();
        answer_next(requests_rx, Operation::get("key"), vec!["data".to_string()]);
        assert_eq!(client.get("key").await.unwrap(), "data");
    }

    #[tokio::test]
    async fn get_rejects_empty_value_response() {
        let (client, requests_rx) = stub_client();
        answer_next(requests_rx, Operation::get("key"), vec![String::new()]);
        assert!(matches!(
            client.get("key").await,
            Err(RustCacheError::UnexpectedResponse(_))
        ));
    }

    #[tokio::test]
    async fn get_surfaces_error_response() {
        let (client, requests_rx) = stub_client();
        answer_next(
            requests_rx,
            Operation::get("key"),
            vec!["-Invalid get".to_string()],
        );
        let err = client.get("key").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid get");
    }

    #[tokio::test]
    async fn get_rejects_empty_key() {
        let (client, _requests_rx) = stub_client();
        assert!(matches!(
            client.get("").await,
            Err(RustCacheError::EmptyParameter)
        ));
    }

    #[tokio::test]
    async fn set_expects_ok() {
        let (client, requests_rx) = stub_client();
        answer_next(
            requests_rx,
            Operation::set("key", "val"),
            vec![OK.to_string()],
        );
        client.set("key", "val").await.unwrap();
    }

    #[tokio::test]
    async fn set_rejects_unexpected_sentinel() {
        let (client, requests_rx) = stub_client();
        answer_next(
            requests_rx,
            Operation::set("key", "val"),
            vec![PONG.to_string()],
        );
        assert!(matches!(
            client.set("key", "val").await,
            Err(RustCacheError::UnexpectedResponse(_))
        ));
    }

    #[tokio::test]
    async fn set_rejects_empty_value() {
        let (client, _requests_rx) = stub_client();
        assert!(matches!(
            client.set("key", "").await,
            Err(RustCacheError::EmptyParameter)
        ));
    }

    #[tokio::test]
    async fn del_expects_ok() {
        let (client, requests_rx) = stub_client();
        answer_next(requests_rx, Operation::delete("key"), vec![OK.to_string()]);
        client.del("key").await.unwrap();
    }

    #[tokio::test]
    async fn del_surfaces_error_response() {
        let (client, requests_rx) = stub_client();
        answer_next(
            requests_rx,
            Operation::delete("key"),
            vec!["-Invalid delete".to_string()],
        );
        let err = client.del("key").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid delete");
    }

    #[tokio::test]
    async fn ping_expects_pong() {
        let (client, requests_rx) = stub_client();
        answer_next(requests_rx, Operation::ping(), vec![PONG.to_string()]);
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn ping_rejects_other_replies() {
        let (client, requests_rx) = stub_client();
        answer_next(requests_rx, Operation::ping(), vec!["PING".to_string()]);
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn empty_reply_is_an_error() {
        let (client, requests_rx) = stub_client();
        answer_next(requests_rx, Operation::ping(), Vec::new());
        let err = client.ping().await.unwrap_err();
        assert!(err.to_string().contains("empty response back from ping"));
    }

    #[tokio::test]
    async fn uninitialised_client_rejects_requests() {
        let (requests_tx, _requests_rx) = mpsc::channel(1);
        let client = Client {
            requests: requests_tx,
            workers: Vec::new(),
        };
        assert!(matches!(
            client.ping().await,
            Err(RustCacheError::ClientUninitialized)
        ));
        assert!(matches!(
            client.get("key").await,
            Err(RustCacheError::ClientUninitialized)
        ));
    }

    #[tokio::test]
    async fn dropped_reply_sink_maps_to_aborted() {
        let (client, mut requests_rx) = stub_client();
        tokio::spawn(async move {
            let request = requests_rx.recv().await.expect("request should arrive");
            drop(request);
        });
        assert!(matches!(
            client.ping().await,
            Err(RustCacheError::RequestAborted)
        ));
    }

    #[test]
    fn deduplicate_collapses_identical_operations() {
        let batch = vec![
            Operation::get("hello"),
            Operation::get("hello"),
            Operation::delete("key"),
            Operation::set("bye", "set"),
            Operation::get("hello"),
            Operation::get("hello"),
            Operation::set("bye", "set"),
        ];

        let (operations, reverse_index) = deduplicate(batch);

        assert_eq!(
            operations,
            vec![
                Operation::get("hello"),
                Operation::delete("key"),
                Operation::set("bye", "set"),
            ]
        );
        assert_eq!(
            reverse_index,
            vec![vec![0, 1, 4, 5], vec![2], vec![3, 6]]
        );
    }

    #[test]
    fn deduplicate_keeps_distinct_operations() {
        let batch = vec![Operation::delete("hello"), Operation::set("hello", "hi")];

        let (operations, reverse_index) = deduplicate(batch);

        assert_eq!(
            operations,
            vec![Operation::delete("hello"), Operation::set("hello", "hi")]
        );
        assert_eq!(reverse_index, vec![vec![0], vec![1]]);
    }

    #[test]
    fn deduplicate_covers_every_caller_exactly_once() {
        let batch = vec![
            Operation::get("a"),
            Operation::set("a", "1"),
            Operation::get("a"),
            Operation::ping(),
            Operation::set("a", "2"),
            Operation::ping(),
            Operation::get("a"),
        ];
        let total = batch.len();

        let (operations, reverse_index) = deduplicate(batch.clone());

        assert_eq!(operations.len(), reverse_index.len());

        let mut seen = vec![false; total];
        for (wire_index, callers) in reverse_index.iter().enumerate() {
            for &caller_index in callers {
                assert!(!seen[caller_index], "caller {caller_index} covered twice");
                seen[caller_index] = true;
                assert_eq!(batch[caller_index].index(), operations[wire_index].index());
            }
        }
        assert!(seen.into_iter().all(|covered| covered));
    }

    #[test]
    fn propagate_routes_by_reverse_index() {
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let (tx_c, rx_c) = oneshot::channel();

        let requests = vec![
            CallerRequest {
                operation: Operation::get("a"),
                reply: tx_a,
            },
            CallerRequest {
                operation: Operation::get("a"),
                reply: tx_b,
            },
            CallerRequest {
                operation: Operation::get("b"),
                reply: tx_c,
            },
        ];
        let results = vec![OpResult::success("va"), OpResult::failure("gone")];
        let reverse_index = vec![vec![0, 1], vec![2]];

        propagate_batch(results, requests, &reverse_index);

        assert_eq!(rx_a.blocking_recv().unwrap(), vec!["va".to_string()]);
        assert_eq!(rx_b.blocking_recv().unwrap(), vec!["va".to_string()]);
        assert_eq!(rx_c.blocking_recv().unwrap(), vec!["-gone".to_string()]);
    }

    #[test]
    fn batch_error_reaches_every_caller() {
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let requests = vec![
            CallerRequest {
                operation: Operation::ping(),
                reply: tx_a,
            },
            CallerRequest {
                operation: Operation::get("k"),
                reply: tx_b,
            },
        ];

        batch_error("write failed", requests);

        assert_eq!(rx_a.blocking_recv().unwrap(), vec!["-write failed".to_string()]);
        assert_eq!(rx_b.blocking_recv().unwrap(), vec!["-write failed".to_string()]);
    }
}
