//! macosvm backend.
//!
//! Each VM is described by a `vm.json` next to its disk copy. The guest's
//! address is found in the host DHCP lease database by the MAC address
//! recorded in that file.

use super::{VmDriver, VmLayout, VmResources};
use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Host DHCP lease database used by Virtualization.framework NAT.
pub const DEFAULT_DHCP_LEASES: &str = "/var/db/dhcpd_leases";

/// VM description read by macosvm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct VmSpec {
    cpus: u32,
    ram: u64,
    machine_id: String,
    storage: Vec<StorageSpec>,
    networks: Vec<NetworkSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct StorageSpec {
    #[serde(rename = "type")]
    kind: String,
    file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct NetworkSpec {
    #[serde(rename = "type")]
    kind: String,
    mac: String,
}

/// Driver for the `macosvm` command-line tool.
#[derive(Debug, Clone)]
pub struct MacosvmDriver {
    binary: PathBuf,
    leases_path: PathBuf,
}

impl MacosvmDriver {
    /// Create a driver using `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            leases_path: PathBuf::from(DEFAULT_DHCP_LEASES),
        }
    }

    /// Read leases from a different file.
    pub fn with_leases_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.leases_path = path.into();
        self
    }

    fn read_spec(layout: &VmLayout) -> Result<Option<VmSpec>> {
        let raw = match std::fs::read(layout.config_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::driver("read vm.json", e.to_string())),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}

/// Random locally administered unicast MAC address.
fn generate_mac() -> String {
    let mut bytes: [u8; 6] = rand::thread_rng().gen();
    bytes[0] = (bytes[0] | 0x02) & 0xfe;
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

impl VmDriver for MacosvmDriver {
    fn name(&self) -> &'static str {
        "macosvm"
    }

    fn materialize(&self, base_image: &Path, layout: &VmLayout) -> Result<()> {
        let disk = layout.disk_path();
        std::fs::copy(base_image, &disk).map_err(|e| {
            Error::driver(
                "materialize",
                format!("copy {} to {}: {}", base_image.display(), disk.display(), e),
            )
        })?;
        Ok(())
    }

    fn create(&self, layout: &VmLayout, resources: &VmResources, machine_id: &str) -> Result<()> {
        let spec = VmSpec {
            cpus: resources.cpus,
            ram: resources.memory_bytes(),
            machine_id: machine_id.to_string(),
            storage: vec![StorageSpec {
                kind: "disk".to_string(),
                file: layout.disk_path(),
            }],
            networks: vec![NetworkSpec {
                kind: "nat".to_string(),
                mac: generate_mac(),
            }],
        };
        let json = serde_json::to_vec_pretty(&spec)?;
        crate::util::write_atomic(&layout.config_path(), &json)
    }

    fn start_command(&self, layout: &VmLayout) -> Result<Command> {
        let config = layout.config_path();
        if !config.exists() {
            return Err(Error::driver(
                "start",
                format!("{} does not exist", config.display()),
            ));
        }
        let mut cmd = Command::new(&self.binary);
        cmd.arg(config).current_dir(&layout.root);
        Ok(cmd)
    }

    fn delete(&self, layout: &VmLayout) -> Result<()> {
        // The VM is fully described by files under its root directory.
        for path in [layout.disk_path(), layout.config_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::driver(
                        "delete",
                        format!("{}: {}", path.display(), e),
                    ))
                }
            }
        }
        Ok(())
    }

    fn address(&self, layout: &VmLayout) -> Result<Option<IpAddr>> {
        let Some(spec) = Self::read_spec(layout)? else {
            return Ok(None);
        };
        let Some(mac) = spec.networks.first().map(|n| n.mac.clone()) else {
            return Err(Error::driver("address", "vm.json has no network"));
        };
        let wanted = parse_mac(&mac)
            .ok_or_else(|| Error::driver("address", format!("invalid MAC in vm.json: {}", mac)))?;

        let raw = match std::fs::read_to_string(&self.leases_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::driver(
                    "address",
                    format!("{}: {}", self.leases_path.display(), e),
                ))
            }
        };

        let leases = parse_dhcp_leases(&raw)?;
        Ok(leases
            .into_iter()
            .find(|lease| lease.hw_address == wanted)
            .map(|lease| lease.ip_address))
    }
}

/// One entry of the DHCP lease database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    /// Client-reported host name.
    pub name: Option<String>,
    /// Leased address.
    pub ip_address: IpAddr,
    /// Client hardware address.
    pub hw_address: [u8; 6],
}

/// Parse a MAC written with or without leading zeros per octet.
fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = raw.split(':');
    for byte in bytes.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(bytes)
}

/// Parse the DHCP lease database.
///
/// The file is a sequence of `{ key=value ... }` blocks. Every block must
/// carry a valid `ip_address` and `hw_address`; anything else is an error.
pub fn parse_dhcp_leases(raw: &str) -> Result<Vec<DhcpLease>> {
    let malformed = |line: usize, what: &str| {
        Error::driver("address", format!("malformed DHCP lease at line {}: {}", line, what))
    };

    let mut leases = Vec::new();
    let mut current: Option<(usize, Vec<(String, String)>)> = None;

    for (idx, line) in raw.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match (line, current.is_some()) {
            ("{", false) => current = Some((lineno, Vec::new())),
            ("{", true) => return Err(malformed(lineno, "nested block")),
            ("}", true) => {
                if let Some((start, fields)) = current.take() {
                    leases.push(lease_from_fields(&fields).map_err(|w| malformed(start, &w))?);
                }
            }
            ("}", false) => return Err(malformed(lineno, "unmatched '}'")),
            (_, true) => {
                let (key, value) = line
                    .split_once('=')
                    .ok_or_else(|| malformed(lineno, "expected key=value"))?;
                if let Some((_, fields)) = current.as_mut() {
                    fields.push((key.to_string(), value.to_string()));
                }
            }
            (_, false) => return Err(malformed(lineno, "text outside a block")),
        }
    }

    if let Some((start, _)) = current {
        return Err(malformed(start, "unterminated block"));
    }
    Ok(leases)
}

fn lease_from_fields(fields: &[(String, String)]) -> std::result::Result<DhcpLease, String> {
    let get = |key: &str| fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    let ip_raw = get("ip_address").ok_or("missing ip_address")?;
    let ip_address: IpAddr = ip_raw
        .parse()
        .map_err(|_| format!("invalid ip_address '{}'", ip_raw))?;

    // hw_address is "<type>,<mac>"; type 1 is Ethernet.
    let hw_raw = get("hw_address").ok_or("missing hw_address")?;
    let mac = hw_raw
        .split_once(',')
        .map(|(_, mac)| mac)
        .ok_or_else(|| format!("invalid hw_address '{}'", hw_raw))?;
    let hw_address = parse_mac(mac).ok_or_else(|| format!("invalid hw_address '{}'", hw_raw))?;

    Ok(DhcpLease {
        name: get("name").map(str::to_string),
        ip_address,
        hw_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASES: &str = "{
\tname=runner-1
\tip_address=192.168.64.7
\thw_address=1,2:a:3b:4:5c:6d
\tidentifier=1,2:a:3b:4:5c:6d
\tlease=0x66a0b1c2
}
{
\tname=other
\tip_address=192.168.64.3
\thw_address=1,6:0:0:0:0:1
\tlease=0x66a0b000
}
";

    fn layout(dir: &Path) -> VmLayout {
        let layout = VmLayout::new(dir, "vm-1");
        std::fs::create_dir_all(&layout.root).unwrap();
        layout
    }

    #[test]
    fn test_parse_dhcp_leases() {
        let leases = parse_dhcp_leases(LEASES).unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].name.as_deref(), Some("runner-1"));
        assert_eq!(leases[0].ip_address, "192.168.64.7".parse::<IpAddr>().unwrap());
        assert_eq!(leases[0].hw_address, [0x02, 0x0a, 0x3b, 0x04, 0x5c, 0x6d]);
    }

    #[test]
    fn test_parse_dhcp_leases_is_strict() {
        assert!(parse_dhcp_leases("{\nip_address=10.0.0.1\n").is_err());
        assert!(parse_dhcp_leases("{\nip_address=nope\nhw_address=1,2:0:0:0:0:1\n}\n").is_err());
        assert!(parse_dhcp_leases("{\nip_address=10.0.0.1\n}\n").is_err());
        assert!(parse_dhcp_leases("garbage\n").is_err());
        assert!(parse_dhcp_leases("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("02:0a:3b:04:5c:6d"), Some([2, 10, 0x3b, 4, 0x5c, 0x6d]));
        assert_eq!(parse_mac("2:a:3b:4:5c:6d"), Some([2, 10, 0x3b, 4, 0x5c, 0x6d]));
        assert_eq!(parse_mac("2:a:3b:4:5c"), None);
        assert_eq!(parse_mac("2:a:3b:4:5c:6d:7"), None);
        assert_eq!(parse_mac("zz:a:3b:4:5c:6d"), None);
    }

    #[test]
    fn test_generated_mac_is_locally_administered() {
        for _ in 0..100 {
            let mac = parse_mac(&generate_mac()).unwrap();
            assert_eq!(mac[0] & 0x02, 0x02);
            assert_eq!(mac[0] & 0x01, 0x00);
        }
    }

    #[test]
    fn test_create_and_address_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path());
        let leases = dir.path().join("leases");
        let driver = MacosvmDriver::new("/usr/local/bin/macosvm").with_leases_path(&leases);

        let base = dir.path().join("base.img");
        std::fs::write(&base, b"disk").unwrap();
        driver.materialize(&base, &layout).unwrap();
        driver
            .create(&layout, &VmResources { cpus: 2, memory_mib: 1024 }, "bWFjaGluZQ==")
            .unwrap();

        let spec = MacosvmDriver::read_spec(&layout).unwrap().unwrap();
        assert_eq!(spec.cpus, 2);
        assert_eq!(spec.ram, 1024 * 1024 * 1024);
        assert_eq!(spec.machine_id, "bWFjaGluZQ==");
        assert_eq!(spec.storage[0].file, layout.disk_path());

        // No lease database yet.
        assert_eq!(driver.address(&layout).unwrap(), None);

        let mac = parse_mac(&spec.networks[0].mac).unwrap();
        let hw = mac.iter().map(|b| format!("{:x}", b)).collect::<Vec<_>>().join(":");
        std::fs::write(
            &leases,
            format!("{}{{\n\tip_address=192.168.64.9\n\thw_address=1,{}\n}}\n", LEASES, hw),
        )
        .unwrap();
        assert_eq!(
            driver.address(&layout).unwrap(),
            Some("192.168.64.9".parse().unwrap())
        );

        let cmd = driver.start_command(&layout).unwrap();
        assert_eq!(cmd.get_program(), "/usr/local/bin/macosvm");

        driver.delete(&layout).unwrap();
        assert!(!layout.disk_path().exists());
        driver.delete(&layout).unwrap();
    }
}
