//! Sensitive-info type catalog client.
//!
//! Fetches `id -> display name` mappings only; never classifies content.
//! Plugs into the resolver through `AuthoritativeSource`.

mod client;

pub use client::{parse_catalog, CatalogClient, CatalogEntry, CatalogError};
