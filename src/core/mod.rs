//! Fragment model, module contract and the session engine

pub mod binary;
pub mod crc;
pub mod engine;
pub mod fragment;
pub mod module;
pub mod numbering;
pub mod pattern;
pub mod registry;
pub mod vfs;
