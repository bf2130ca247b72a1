mod naming;
mod protocol;
mod registry;
mod relay;
mod router;
mod transport;
mod version;
mod ws;

pub use relay::{Relay, RelayConfig, SHUTDOWN_GAME_ACTION};
pub use transport::{InProcessTransport, PeerId, Transport, TransportEvent};
pub use ws::WsTransport;
