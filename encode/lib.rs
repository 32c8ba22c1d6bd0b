#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod artifact;
pub mod bootstrap;
pub mod catalog;
pub mod composite;
pub mod config;
pub mod flush;
pub mod ingest;
pub mod normalize;
pub mod pipeline;
pub mod types;
pub mod visit;

#[path = "../severity/mod.rs"]
pub mod severity;
