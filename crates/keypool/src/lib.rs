#![doc = include_str!("../README.md")]

mod buffer;
mod cleanup;
mod clock;
mod control;
mod error;
mod generator;
mod key;
mod records;
mod signal;
mod store;

pub use crate::buffer::*;
pub use crate::cleanup::*;
pub use crate::clock::*;
pub use crate::control::*;
pub use crate::error::*;
pub use crate::generator::*;
pub use crate::key::*;
pub use crate::records::*;
pub use crate::signal::*;
pub use crate::store::*;
