mod conversation;
mod provider;
mod tool;

pub use conversation::*;
pub use provider::*;
pub use tool::*;
