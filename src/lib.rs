//! Prometheus exporter for the Enedis Linky meter.
//!
//! The meter Teleinfo output is read from a serial line and decoded frame by frame.
//! Each scrape of the HTTP endpoint read a fresh frame and export its numerical fields.

pub mod metrics;
pub mod observability;
pub mod proc;
pub mod registry;
pub mod teleinfo;
