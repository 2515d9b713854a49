pub mod dispatch;
pub mod doctor;
pub mod observer;
pub mod supervisor;

pub use dispatch::Dispatcher;
pub use observer::{ChannelObserver, StationEvent, StationObserver, TracingObserver};
pub use supervisor::{spawn, ReconnectConfig, ReconnectPolicy, SourceFactory, SupervisorGone, SupervisorHandle};
