pub mod codec;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod store;
pub mod stream;
pub mod tree;
pub mod web;
