//! # resblock
//!
//! A library for reading compiled Android resources: pooled string
//! tables with inline rich-text styling, binary XML documents exposed
//! through a pull parser, and the weak caches the resource runtime
//! keeps for themed and configuration-sensitive values.
//!
//! The usual entry points are [`xml_cursor::XmlBlock::from_bytes`] for a
//! compiled XML document and [`string_pool::StringPool`] over any
//! [`string_pool::PoolSource`].

pub mod cache;
pub mod chunk;
mod error;
pub mod string_pool;
pub mod xml_cursor;

#[cfg(test)]
mod tests;

pub use error::{position_description, XmlError, XmlResult};
