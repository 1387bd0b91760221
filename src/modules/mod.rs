//! Lumina model modules

pub mod dit;
pub mod attention;
pub mod feed_forward;
pub mod embeddings;
pub mod packing;
pub mod rope;
pub mod normalization;
pub mod modulation;
pub mod init;
pub mod memory;

pub use memory::{MemoryEstimate, MemoryProfile};
