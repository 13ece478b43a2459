pub mod content;
pub mod export;
pub mod graph;
pub mod net;
pub mod session;
pub mod util;

pub use session::{GraphSession, Heartbeat, SessionConfig};
