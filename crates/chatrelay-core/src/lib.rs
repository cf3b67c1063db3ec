pub mod chat;
pub mod config;
pub mod documents;
pub mod error;
pub mod history;
pub mod resolver;

#[cfg(test)]
mod test_support;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 3000;

pub use chat::*;
pub use config::*;
pub use documents::*;
pub use error::*;
pub use history::*;
pub use resolver::*;
