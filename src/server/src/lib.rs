pub mod error;
pub mod http;
pub mod metrics;
pub mod node;
pub mod server;

// Re-export commonly used types
pub use error::{NodeError, ServerError};
pub use http::{Api, HttpServer};
pub use metrics::Metrics;
pub use node::{Listing, Node, RecordWithHistory, WhoAmI};
pub use server::Server;
