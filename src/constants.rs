/// Every message on the wire, in both directions, ends with this byte.
pub const MESSAGE_TERMINATOR: u8 = 0;

/// Default per-connection receive buffer; a request must fit in it, terminator included.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8192;
/// Smallest receive buffer that holds a one-byte request plus its terminator.
pub const MIN_MESSAGE_SIZE: usize = 2;

pub const DEFAULT_PORT: u16 = 6789;
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Reply of the entry stage when no downstream stage is configured.
pub const DEFAULT_GREETING: &[u8] = b"Hello, world!\n\0";

/// Sent in place of an empty response.
pub const NO_DATA_RESPONSE: &[u8] = b"No data\n";

pub const TIMEOUT_RESPONSE: &[u8] = b"ERROR: request timed out";

pub const MAX_CONNECTIONS: usize = 4096;

const _: () = assert!(
    MAX_CONNECTIONS <= u32::MAX as usize,
    "slab key is packed into 32 bits of user_data"
);
