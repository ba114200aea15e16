/*!
VTun - An encrypted point-to-multipoint virtual network tunnel over UDP

This library provides the core functionality shared by the VTun server and client:
- Tunnel wire protocol
- Payload encryption
- UDP transport
- Virtual network device abstraction
- Virtual IP leasing and endpoint bookkeeping
*/

pub mod address_pool;
pub mod crypto;
pub mod endpoint;
pub mod network;
pub mod protocol;
pub mod virtual_device;

pub use address_pool::*;
pub use crypto::*;
pub use endpoint::*;
pub use network::*;
pub use protocol::*;
pub use virtual_device::*;

/// VTun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default VTun port
pub const DEFAULT_PORT: u16 = 6123;

/// Default MTU for virtual device
pub const DEFAULT_MTU: u32 = 1420;

/// Maximum datagram size accepted from the socket
pub const MAX_PACKET_SIZE: usize = protocol::MAX_FRAGMENT_SIZE;
