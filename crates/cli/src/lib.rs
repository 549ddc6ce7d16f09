//! `workerman` command-line front end: consumer loop, schedule loop and
//! operator commands.

pub mod app;
pub mod args;
pub mod shutdown;
pub mod workers;
