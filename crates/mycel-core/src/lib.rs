//! mycel-core — wire formats, addressing, and shared state types.
//! All other Mycel crates depend on this one. No I/O, no async.

pub mod address;
pub mod cache;
pub mod flags;
pub mod ident;
pub mod package;
pub mod packet;
pub mod schema;
pub mod sequence;

pub use address::{Address, AddressError, Metric};
pub use cache::TtlCache;
pub use flags::{Control, Flags};
pub use ident::{AppId, InterfaceId, NodeId};
pub use package::{half_sha256, Package, PACKAGE_HEADER_LEN};
pub use packet::{FieldValue, Packet};
pub use schema::{Schema, WireError, PROTOCOL_VERSION};
pub use sequence::{Sequence, SequenceError};
