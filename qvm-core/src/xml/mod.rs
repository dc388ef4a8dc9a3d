//! Domain XML rendering and parsing.

pub mod builder;
pub mod parser;

pub use builder::{disk_image_path, escape, snapshot_xml, validate_name, DomainTemplate};
pub use parser::{parse_devices, parse_domain_definition, parse_snapshot, DomainDevices};
