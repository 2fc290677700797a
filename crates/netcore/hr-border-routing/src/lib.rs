pub mod config;
pub mod dhcp6;
pub mod error;
pub mod nd;
pub mod pd_client;
pub mod prefix;
pub mod retx;
pub mod routing;
pub mod runtime;
pub mod timer;
pub mod tracker;

pub use config::{BorderRoutingConfig, Settings};
pub use error::{Error, Result};
pub use pd_client::{DelegatedPrefix, PdClient, PdState};
pub use routing::{RoutingEvent, RoutingManager, RoutingOptions, RoutingState};
pub use runtime::{Command, DriverHandle, PrefixSender, PrefixWatch};
pub use tracker::PrefixRouterTable;
