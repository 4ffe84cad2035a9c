//! Console and network interface discovery from domain descriptors.

use crate::error::Result;
use crate::types::{ConsoleDescriptor, InterfaceDescriptor};
use crate::xml::XmlElement;

/// A parsed domain XML descriptor.
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    root: XmlElement,
}

impl DomainDescriptor {
    /// Parse the XML reported by the driver for one domain.
    pub fn parse(xml: &str) -> Result<Self> {
        Ok(Self {
            root: XmlElement::parse(xml)?,
        })
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    pub fn into_root(self) -> XmlElement {
        self.root
    }

    /// The VNC console, unless the port is missing or still the `-1`
    /// autoport placeholder.
    pub fn vnc_console(&self) -> Option<ConsoleDescriptor> {
        let graphics = self
            .root
            .descendants("graphics")
            .into_iter()
            .find(|g| g.attr("type") == Some("vnc"))?;

        match graphics.attr("port") {
            Some(port) if !port.is_empty() && port != "-1" => Some(ConsoleDescriptor::Vnc {
                port: port.to_string(),
            }),
            _ => None,
        }
    }

    /// The pty console.
    ///
    /// `native_id` is the backend-local name to fall back to when the backend
    /// has its own console mechanism (OpenVZ). The fallback only applies when
    /// the descriptor has no pty console element at all.
    pub fn pty_console(&self, native_id: Option<&str>) -> Option<ConsoleDescriptor> {
        let console = self
            .root
            .descendants("console")
            .into_iter()
            .find(|c| c.attr("type") == Some("pty"));

        match console {
            Some(console) => match console.attr("tty") {
                Some(tty) if !tty.is_empty() => Some(ConsoleDescriptor::Pty {
                    pty: tty.to_string(),
                }),
                _ => None,
            },
            None => native_id.map(|cid| ConsoleDescriptor::OpenVz {
                cid: cid.to_string(),
            }),
        }
    }

    /// All discovered consoles, VNC first.
    pub fn consoles(&self, native_id: Option<&str>) -> Vec<ConsoleDescriptor> {
        [self.vnc_console(), self.pty_console(native_id)]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Network interfaces in document order.
    pub fn interfaces(&self) -> Vec<InterfaceDescriptor> {
        self.root
            .descendants("interface")
            .into_iter()
            .enumerate()
            .map(|(idx, iface)| describe_interface(idx, iface))
            .collect()
    }
}

fn describe_interface(idx: usize, iface: &XmlElement) -> InterfaceDescriptor {
    let raw_type = iface.attr("type");
    let is_nat = raw_type == Some("network")
        && match iface.child("forward") {
            None => true,
            Some(forward) => forward.attr("mode") == Some("nat"),
        };
    let kind = if is_nat {
        Some("nat".to_string())
    } else {
        raw_type.map(str::to_string)
    };

    let mac = iface
        .child("mac")
        .and_then(|m| m.attr("address"))
        .map(str::to_string);

    let name = match iface.child("alias") {
        Some(alias) => alias.attr("name").map(str::to_string),
        None => Some(format!("eth{}", idx)),
    };

    let ipv4_address = iface
        .child("ip")
        .and_then(|ip| ip.attr("address"))
        .map(normalize_cidr);

    InterfaceDescriptor {
        mac,
        name,
        kind,
        ipv4_address,
    }
}

/// Append a `/24` prefix to addresses that carry none.
pub fn normalize_cidr(address: &str) -> String {
    if address.contains('/') {
        address.to_string()
    } else {
        format!("{}/24", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(devices: &str) -> DomainDescriptor {
        DomainDescriptor::parse(&format!(
            "<domain type='kvm'><name>vm1</name><devices>{}</devices></domain>",
            devices
        ))
        .unwrap()
    }

    #[test]
    fn test_vnc_console_only() {
        let dom = descriptor("<graphics type='vnc' port='5900' autoport='no'/>");
        assert_eq!(
            dom.consoles(None),
            vec![ConsoleDescriptor::Vnc { port: "5900".to_string() }]
        );
    }

    #[test]
    fn test_vnc_autoport_placeholder_suppressed() {
        let dom = descriptor("<graphics type='vnc' port='-1' autoport='yes'/>");
        assert!(dom.vnc_console().is_none());
        assert!(dom.consoles(None).is_empty());
    }

    #[test]
    fn test_vnc_then_pty_order() {
        let dom = descriptor(
            "<console type='pty' tty='/dev/pts/3'><target port='0'/></console>\
             <graphics type='sdl'/>\
             <graphics type='vnc' port='5901'/>",
        );
        assert_eq!(
            dom.consoles(None),
            vec![
                ConsoleDescriptor::Vnc { port: "5901".to_string() },
                ConsoleDescriptor::Pty { pty: "/dev/pts/3".to_string() },
            ]
        );
    }

    #[test]
    fn test_native_console_fallback() {
        let dom = descriptor("");
        assert_eq!(
            dom.pty_console(Some("101")),
            Some(ConsoleDescriptor::OpenVz { cid: "101".to_string() })
        );
        assert_eq!(dom.pty_console(None), None);

        // A pty element without a tty does not fall back
        let dom = descriptor("<console type='pty'/>");
        assert_eq!(dom.pty_console(Some("101")), None);
    }

    #[test]
    fn test_interface_names_synthesized() {
        let dom = descriptor(
            "<interface type='bridge'><mac address='52:54:00:00:00:01'/><source bridge='br0'/></interface>\
             <interface type='bridge'><mac address='52:54:00:00:00:02'/><source bridge='br0'/></interface>",
        );
        let names: Vec<_> = dom.interfaces().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec![Some("eth0".to_string()), Some("eth1".to_string())]);
    }

    #[test]
    fn test_interface_alias_and_type() {
        let dom = descriptor(
            "<interface type='network'><mac address='52:54:00:00:00:01'/><alias name='net0'/></interface>\
             <interface type='network'><forward mode='route'/></interface>\
             <interface type='network'><forward mode='nat'/></interface>\
             <interface type='ethernet'/>",
        );
        let ifaces = dom.interfaces();

        assert_eq!(ifaces[0].name.as_deref(), Some("net0"));
        assert_eq!(ifaces[0].kind.as_deref(), Some("nat"));
        assert_eq!(ifaces[0].mac.as_deref(), Some("52:54:00:00:00:01"));
        assert_eq!(ifaces[1].kind.as_deref(), Some("network"));
        assert_eq!(ifaces[2].kind.as_deref(), Some("nat"));
        assert_eq!(ifaces[3].kind.as_deref(), Some("ethernet"));
        assert_eq!(ifaces[3].mac, None);
        assert_eq!(ifaces[3].name.as_deref(), Some("eth3"));
    }

    #[test]
    fn test_ipv4_prefix_normalization() {
        let dom = descriptor(
            "<interface type='bridge'><ip address='10.0.0.5'/></interface>\
             <interface type='bridge'><ip address='10.0.0.5/16'/></interface>\
             <interface type='bridge'/>",
        );
        let ifaces = dom.interfaces();

        assert_eq!(ifaces[0].ipv4_address.as_deref(), Some("10.0.0.5/24"));
        assert_eq!(ifaces[1].ipv4_address.as_deref(), Some("10.0.0.5/16"));
        assert_eq!(ifaces[2].ipv4_address, None);
    }
}
