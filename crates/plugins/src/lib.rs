//! Plugin system: manifest discovery, catalog lookup and registration.
//!
//! A plugin is a manifest file (`.toml`, `.yaml`, `.yml` or `.json`) naming a
//! factory in a compiled-in [`PluginCatalog`]. [`import`] walks a directory
//! tree, builds a handler from every manifest it finds and hands it to a
//! [`HandlerSink`]. Bad manifests are reported, never fatal.

pub mod catalog;
pub mod error;
pub mod loader;
pub mod manifest;

pub use {
    catalog::{Factory, HandlerSink, PluginCatalog},
    error::PluginError,
    loader::{ImportReport, import},
    manifest::PluginManifest,
};
