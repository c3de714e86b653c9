#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;

pub mod auth;
pub mod browser_controller;
pub mod drive;
pub mod runner;
pub mod sheets;
pub mod tracker;
pub mod types;
pub mod utils;
