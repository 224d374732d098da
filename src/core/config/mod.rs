pub mod data;
pub mod defaults;
pub mod io;

#[cfg(test)]
pub mod tests;

pub use data::{
    Config, ConnectionConfig, IngressConfig, IngressProvider, LocalConfig, LoggingConfig,
    Platform, RelayConfig,
};
pub use io::ConfigError;
