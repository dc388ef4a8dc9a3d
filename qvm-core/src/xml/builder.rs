//! Domain and snapshot definition documents.

use crate::paths::DISK_IMAGE_EXTENSION;
use crate::types::CreateVmSpec;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Longest VM or snapshot name accepted for interpolation.
pub const MAX_NAME_LEN: usize = 64;

/// Check that a name is safe to embed in a definition document and a file path.
///
/// Accepted: an ASCII alphanumeric first character followed by up to 63
/// characters from `[A-Za-z0-9._-]`.
pub fn validate_name(kind: &str, name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{} name is required", kind));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("{} name exceeds {} characters", kind, MAX_NAME_LEN));
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("{} name '{}' must start with a letter or digit", kind, name));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if let Some(bad) = chars.find(|&c| !allowed(c)) {
        return Err(format!("{} name '{}' contains invalid character '{}'", kind, name, bad));
    }
    Ok(())
}

/// Escape text for use in XML element content or a quoted attribute.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Disk image path for a VM: `<images_dir>/<name>.qcow2`.
pub fn disk_image_path(images_dir: &Path, name: &str) -> PathBuf {
    images_dir.join(format!("{}.{}", name, DISK_IMAGE_EXTENSION))
}

/// Renders domain definitions with fixed disk and boot settings.
#[derive(Debug, Clone)]
pub struct DomainTemplate {
    images_dir: PathBuf,
}

impl DomainTemplate {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self { images_dir: images_dir.into() }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Render the definition of a new KVM domain.
    ///
    /// The caller validates `spec.name` with [`validate_name`] first; every
    /// interpolated value is escaped regardless.
    pub fn render(&self, spec: &CreateVmSpec) -> String {
        let disk = disk_image_path(&self.images_dir, &spec.name);
        let mut xml = String::new();
        // Writing to a String cannot fail.
        let _ = write!(
            xml,
            "<domain type='kvm'>\n\
             \x20 <name>{name}</name>\n\
             \x20 <memory unit='KiB'>{memory}</memory>\n\
             \x20 <vcpu>{vcpus}</vcpu>\n\
             \x20 <os>\n\
             \x20   <type arch='x86_64' machine='{machine}'>hvm</type>\n\
             \x20 </os>\n\
             \x20 <devices>\n\
             \x20   <disk type='file' device='disk'>\n\
             \x20     <driver name='qemu' type='qcow2'/>\n\
             \x20     <source file='{disk}'/>\n\
             \x20     <target dev='vda' bus='virtio'/>\n\
             \x20   </disk>\n\
             \x20   <interface type='network'>\n\
             \x20     <source network='{network}'/>\n\
             \x20     <model type='{model}'/>\n\
             \x20   </interface>\n\
             \x20 </devices>\n\
             </domain>\n",
            name = escape(&spec.name),
            memory = spec.memory_kib,
            vcpus = spec.vcpu_count,
            machine = escape(&spec.machine_type),
            disk = escape(&disk.to_string_lossy()),
            network = escape(&spec.network_name),
            model = escape(&spec.network_model),
        );
        xml
    }
}

/// Render a snapshot request for `vm`.
pub fn snapshot_xml(vm: &str, snapshot: &str) -> String {
    format!(
        "<domainsnapshot>\n  <name>{}</name>\n  \
         <description>Snapshot of {}</description>\n</domainsnapshot>\n",
        escape(snapshot),
        escape(vm)
    )
}
