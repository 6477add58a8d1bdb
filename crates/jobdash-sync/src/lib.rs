pub mod channel;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod store;
pub mod timer;

#[cfg(test)]
mod test_support;

pub use channel::{ChannelError, FeedConfig, FeedConnection};
pub use config::{ConfigError, SyncConfig};
pub use gateway::{ActionGateway, GatewayError, HttpGateway};
pub use registry::{feed_handler, FeedHandler, HandlerRegistry};
pub use store::{
    ConnectionState, DashboardState, DashboardStore, LoadingFlags, StoreConfig, StoreError,
    DEFAULT_REJECT_REASON,
};
