#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

pub mod core;
pub mod scheduling;
pub mod utils;
