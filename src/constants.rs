//! Protocol and timing constants shared by the server and the client.

use std::time::Duration;

/// How long a worker waits for more operations before flushing a batch.
pub const BASE_WAIT_TIME: Duration = Duration::from_micros(500);

/// Overall deadline for establishing one pooled connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between dial attempts while the deadline has not passed.
pub const CONN_RETRY_WAIT: Duration = Duration::from_millis(10);

/// Per-frame deadline on the response read path.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `stop` waits for the server event loop to acknowledge shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Outer deadline around submit-and-await on the client facade. Well above
/// the dial and read timeouts, so it only fires for a stuck worker.
pub const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_NETWORK: &str = "tcp";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6379;

/// Number of long-lived connections a client holds.
pub const MAX_CONNECTION_POOL: usize = 20;

/// Largest operation batch accepted on the wire; a worker flushes as soon as
/// its pending batch reaches this size.
pub const MAX_REQUEST_BATCH: usize = 200;

/// Bytes in the little-endian length prefix of a frame.
pub const HEADER_SIZE: usize = 4;

pub const PONG: &str = "PONG";
pub const OK: &str = "OK";

/// First byte of an error reply on the caller-facing response slice.
pub const ERR_PREFIX: char = '-';
