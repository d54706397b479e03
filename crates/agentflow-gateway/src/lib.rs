mod connection;
pub mod protocol;
mod routes;
mod server;
mod state;
pub mod stream;

pub use protocol::StreamEvent;
pub use server::{router, GatewayServer};
pub use state::AppState;
pub use stream::SubscriberRegistry;
