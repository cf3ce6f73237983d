//! Network primitives

pub use self::subnet::{Subnet, SubnetError};

mod subnet;
