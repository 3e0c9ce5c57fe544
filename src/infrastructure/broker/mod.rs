pub mod protocol;
pub mod push_server;
pub mod socket_pool;

pub use protocol::{BrokerCommand, BrokerResponse, BrokerStatus, OpenResult};
pub use push_server::BrokerPushServer;
pub use socket_pool::{BrokerApi, BrokerSocketPool, DEFAULT_POOL_SIZE, DEFAULT_REQUEST_TIMEOUT};
