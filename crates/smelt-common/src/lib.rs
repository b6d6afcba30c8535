pub mod config;
pub mod driver;
pub mod lir;
pub mod target;
