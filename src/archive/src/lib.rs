#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate log;

pub mod dispatch;
pub mod extract;
pub mod layout;
pub mod merge;
pub mod packet;
pub mod reader;
pub mod rw;
pub mod scan;
pub mod store;
pub mod sum;
pub mod walk;

pub use hrdp_common::error::DecodeError;
pub use hrdp_common::iterator::AsyncIterator;
