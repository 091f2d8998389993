#![warn(missing_docs)]

//! dirsync wire layer: CSN logical clock, replication message set, versioned binary codec

pub mod codec;
pub mod csn;
pub mod error;
pub mod frame;
pub mod msg;
pub mod server_state;

pub use csn::{Csn, CsnGenerator};
pub use error::ProtoError;
pub use msg::ReplicationMsg;
pub use server_state::ServerState;
