pub mod bus;
pub mod channel;
pub mod error;
pub mod manager;
pub mod types;

pub use bus::MessageBus;
pub use channel::Channel;
pub use error::ChannelError;
pub use manager::ChannelManager;
pub use types::{
    ChannelStatus, InboundMessage, InboundMetadata, MessageFormat, OutboundMessage, ProgressEvent,
    ProgressSink,
};
