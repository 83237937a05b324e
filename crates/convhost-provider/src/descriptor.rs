//! libvirt domain XML for the in-place converter
//!
//! The converter reads the destination VM from a libvirt domain: raw block
//! disks on virtio in boot order, bridged virtio NICs and a qxl display.

use crate::error::{ProviderError, ProviderResult};

use convhost_common::VmSpec;
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename = "domain")]
struct Domain<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    name: &'a str,
    memory: Memory,
    vcpu: u32,
    os: Os,
    features: Features,
    devices: Devices<'a>,
}

#[derive(Serialize)]
struct Memory {
    #[serde(rename = "@unit")]
    unit: &'static str,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Serialize)]
struct Os {
    #[serde(rename = "type")]
    os_type: &'static str,
    boot: Boot,
}

#[derive(Serialize)]
struct Boot {
    #[serde(rename = "@dev")]
    dev: &'static str,
}

#[derive(Serialize)]
struct Features {
    acpi: (),
    apic: (),
    pae: (),
}

#[derive(Serialize)]
struct Devices<'a> {
    disk: Vec<Disk>,
    interface: Vec<Interface<'a>>,
    video: Video,
}

#[derive(Serialize)]
struct Disk {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@device")]
    device: &'static str,
    driver: Driver,
    source: DiskSource,
    target: Target,
}

#[derive(Serialize)]
struct Driver {
    #[serde(rename = "@name")]
    name: &'static str,
    #[serde(rename = "@type")]
    format: &'static str,
}

#[derive(Serialize)]
struct DiskSource {
    #[serde(rename = "@dev")]
    dev: String,
}

#[derive(Serialize)]
struct Target {
    #[serde(rename = "@dev")]
    dev: String,
    #[serde(rename = "@bus")]
    bus: &'static str,
}

#[derive(Serialize)]
struct Interface<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    source: Bridge<'a>,
    model: Model,
    mac: Mac<'a>,
}

#[derive(Serialize)]
struct Bridge<'a> {
    #[serde(rename = "@bridge")]
    bridge: &'a str,
}

#[derive(Serialize)]
struct Model {
    #[serde(rename = "@type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Mac<'a> {
    #[serde(rename = "@address")]
    address: &'a str,
}

#[derive(Serialize)]
struct Video {
    model: VideoModel,
}

#[derive(Serialize)]
struct VideoModel {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@ram")]
    ram: u32,
    #[serde(rename = "@heads")]
    heads: u32,
}

/// Device name for the `index`-th disk: `sda` .. `sdz`, `sdaa` ..
pub fn target_dev(index: usize) -> String {
    let mut suffix = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        suffix.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    suffix.reverse();
    format!("sd{}", String::from_utf8_lossy(&suffix))
}

/// Render the domain describing `spec` with its disks at their local paths
pub fn render_libvirt_xml(spec: &VmSpec) -> ProviderResult<String> {
    let disk = spec
        .disk_paths
        .iter()
        .enumerate()
        .map(|(index, path)| Disk {
            kind: "block",
            device: "disk",
            driver: Driver {
                name: "qemu",
                format: "raw",
            },
            source: DiskSource {
                dev: path.display().to_string(),
            },
            target: Target {
                dev: target_dev(index),
                bus: "virtio",
            },
        })
        .collect();

    let interface = spec
        .nics
        .iter()
        .map(|nic| Interface {
            kind: "bridge",
            source: Bridge {
                bridge: &nic.network,
            },
            model: Model { kind: "virtio" },
            mac: Mac {
                address: &nic.mac_address,
            },
        })
        .collect();

    let domain = Domain {
        kind: "kvm",
        name: &spec.name,
        memory: Memory {
            unit: "KiB",
            value: spec.memory / 1024,
        },
        vcpu: spec.cpu.vcpus(),
        os: Os {
            os_type: "hvm",
            boot: Boot { dev: "hd" },
        },
        features: Features {
            acpi: (),
            apic: (),
            pae: (),
        },
        devices: Devices {
            disk,
            interface,
            video: Video {
                model: VideoModel {
                    kind: "qxl",
                    ram: 65536,
                    heads: 1,
                },
            },
        },
    };

    let body = quick_xml::se::to_string(&domain)
        .map_err(|e| ProviderError::Converter(format!("domain XML: {e}")))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convhost_common::{CpuTopology, NicSpec};
    use std::path::PathBuf;

    fn spec() -> VmSpec {
        VmSpec {
            name: "web<01>".to_string(),
            cpu: CpuTopology {
                sockets: 2,
                cores_per_socket: 2,
            },
            memory: 4 << 30,
            disks: vec!["d1".to_string(), "d2".to_string()],
            disk_paths: vec![PathBuf::from("/dev/vdb"), PathBuf::from("/dev/vdc")],
            nics: vec![NicSpec {
                name: "nic0".to_string(),
                mac_address: "00:50:56:aa:bb:cc".to_string(),
                network: "br0".to_string(),
            }],
            operating_system: None,
        }
    }

    #[test]
    fn test_target_dev_names() {
        assert_eq!(target_dev(0), "sda");
        assert_eq!(target_dev(25), "sdz");
        assert_eq!(target_dev(26), "sdaa");
        assert_eq!(target_dev(27), "sdab");
    }

    #[test]
    fn test_render_domain() {
        let xml = render_libvirt_xml(&spec()).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<domain type=\"kvm\">"));
        assert!(xml.contains("<name>web&lt;01&gt;</name>"));
        assert!(xml.contains("<memory unit=\"KiB\">4194304</memory>"));
        assert!(xml.contains("<vcpu>4</vcpu>"));
        assert!(xml.contains("<source dev=\"/dev/vdb\"/>"));
        assert!(xml.contains("<target dev=\"sdb\" bus=\"virtio\"/>"));
        assert!(xml.contains("<source bridge=\"br0\"/>"));
        assert!(xml.contains("<mac address=\"00:50:56:aa:bb:cc\"/>"));
        assert!(xml.contains("<model type=\"qxl\" ram=\"65536\" heads=\"1\"/>"));
        assert_eq!(xml.matches("<disk ").count(), 2);
    }
}
