pub mod config;
pub mod disposition;
pub mod invoker;
pub mod milter;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod prepender;
pub mod replay;
pub mod session;
pub mod statistics;
pub mod suspect;
pub mod timing;
pub mod trash;

#[cfg(test)]
pub mod test_support;

pub use config::Config;
pub use disposition::{ActionCode, Disposition, Verdict};
pub use milter::MilterConnector;
pub use plugin::{AppenderPlugin, Plugin, PluginSet, PrependerPlugin, ScannerPlugin};
pub use plugins::build_plugin_set;
pub use replay::{ReplayOutcome, ReplayProtocolHandler};
pub use session::{ProtocolHandler, SessionHandler};
pub use statistics::{StatEvent, StatisticsCollector};
pub use suspect::Suspect;
