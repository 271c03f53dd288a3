#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate lazy_static;

pub mod error;
pub mod iterator;
pub mod time;
