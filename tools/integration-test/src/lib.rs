#![deny(warnings)]
#![doc = include_str!("../README.md")]

pub mod util;

#[cfg(any(test, doc))]
pub mod tests;
