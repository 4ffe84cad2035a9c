//! XML utilities for libvirt domain descriptors.
//!
//! Two halves live here:
//! - [`XmlElement`], a small owned element tree used to read domain and OVF
//!   descriptors and to write simulation snapshots.
//! - [`DomainXmlBuilder`], which renders a [`DomainSpec`] into libvirt domain
//!   XML for provisioning.

use std::io::Write;

use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Result, VirtError};

// =============================================================================
// ELEMENT TREE
// =============================================================================

/// An XML element with its attributes, text and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader.read_event().map_err(|e| {
                VirtError::XmlError(format!("at position {}: {}", reader.buffer_position(), e))
            })?;

            match event {
                Event::Start(start) => stack.push(Self::from_start(&start)?),
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    Self::attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        VirtError::XmlError("unbalanced closing tag".to_string())
                    })?;
                    Self::attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text.unescape()?);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(VirtError::XmlError(format!("unclosed element <{}>", stack[stack.len() - 1].name)));
        }

        root.ok_or_else(|| VirtError::XmlError("document has no root element".to_string()))
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));

        for attr in start.attributes() {
            let attr = attr.map_err(|e| VirtError::XmlError(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            element.attributes.push((key, value));
        }

        Ok(element)
    }

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    /// Element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    /// Attribute value by name, ignoring namespace prefixes.
    pub fn attr_local(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| local(k) == key)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given local name.
    pub fn child_local(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    /// All descendants with the given local name, in document order.
    pub fn descendants_local(&self, name: &str) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        self.collect_descendants_by(&|e: &XmlElement| e.local_name() == name, &mut found);
        found
    }

    fn collect_descendants_by<'a>(&'a self, pred: &dyn Fn(&XmlElement) -> bool, found: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if pred(child) {
                found.push(child);
            }
            child.collect_descendants_by(pred, found);
        }
    }

    /// Attribute value by name.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set (or replace) an attribute.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Direct children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first direct child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// All descendants with the given name, in document order.
    pub fn descendants(&self, name: &str) -> Vec<&XmlElement> {
        let mut found = Vec::new();
        self.collect_descendants_by(&|e: &XmlElement| e.name == name, &mut found);
        found
    }

    /// First descendant with the given name.
    pub fn descendant(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// Mutable access to the first direct child with the given name.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Serialize this element (without an XML declaration).
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer)?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| VirtError::XmlError(e.to_string()))
    }

    /// Serialize as a standalone document with an XML declaration.
    pub fn to_document(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
        writer.get_mut().write_all(b"\n")?;
        self.write_into(&mut writer)?;
        writer.get_mut().write_all(b"\n")?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| VirtError::XmlError(e.to_string()))
    }

    fn write_into<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() && self.text.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        if !self.text.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&self.text)))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

fn local(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, l)| l).unwrap_or(name)
}

// =============================================================================
// DOMAIN XML GENERATION
// =============================================================================

/// Disk attached to a generated domain.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskSpec {
    /// Image file on the host
    File {
        device: String,
        source_file: String,
        target_dev: String,
        target_bus: String,
    },
    /// Raw block device (physical disk or LVM volume)
    Block {
        device: String,
        source_dev: String,
        target_dev: String,
        target_bus: String,
        /// Physical disks bypass the host page cache
        uncached: bool,
    },
}

/// Bridged network interface of a generated domain.
#[derive(Debug, Clone, PartialEq)]
pub struct NicSpec {
    pub source_bridge: String,
    pub mac_address: Option<String>,
}

/// Graphics device of a generated domain.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsSpec {
    pub kind: String,
    pub port: i32,
    pub autoport: String,
    pub keymap: String,
}

/// Everything needed to render a KVM domain definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSpec {
    pub domain_type: String,
    pub name: String,
    pub uuid: String,
    pub memory_kib: u64,
    pub vcpu: u32,
    pub arch: String,
    pub machine: String,
    pub virt_type: String,
    pub boot_dev: String,
    pub features: Vec<String>,
    pub clock_offset: String,
    pub on_poweroff: String,
    pub on_reboot: String,
    pub on_crash: String,
    pub emulator: String,
    pub disks: Vec<DiskSpec>,
    pub nics: Vec<NicSpec>,
    pub serial_type: String,
    pub serial_port: u32,
    pub console_type: String,
    pub console_port: u32,
    pub mouse_bus: String,
    pub graphics: GraphicsSpec,
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    spec: &'a DomainSpec,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(spec: &'a DomainSpec) -> Self {
        Self { spec }
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let spec = self.spec;
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='{}'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory>{}</memory>
  <vcpu>{}</vcpu>
"#,
            escape(&spec.domain_type),
            escape(&spec.name),
            escape(&spec.uuid),
            spec.memory_kib,
            spec.vcpu
        ));

        xml.push_str(&format!(
            r#"  <os>
    <type arch='{}' machine='{}'>{}</type>
    <boot dev='{}'/>
  </os>
"#,
            escape(&spec.arch),
            escape(&spec.machine),
            escape(&spec.virt_type),
            escape(&spec.boot_dev)
        ));

        xml.push_str(&self.build_features());

        xml.push_str(&format!(
            r#"  <clock offset='{}'/>
  <on_poweroff>{}</on_poweroff>
  <on_reboot>{}</on_reboot>
  <on_crash>{}</on_crash>
"#,
            escape(&spec.clock_offset),
            escape(&spec.on_poweroff),
            escape(&spec.on_reboot),
            escape(&spec.on_crash)
        ));

        xml.push_str("  <devices>\n");
        xml.push_str(&format!("    <emulator>{}</emulator>\n", escape(&spec.emulator)));
        xml.push_str(&self.build_disks());
        xml.push_str(&self.build_nics());
        xml.push_str(&self.build_console());
        xml.push_str(&self.build_graphics());
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");

        xml
    }

    fn build_features(&self) -> String {
        if self.spec.features.is_empty() {
            return "  <features/>\n".to_string();
        }

        let mut xml = String::from("  <features>\n");
        for feature in &self.spec.features {
            xml.push_str(&format!("    <{}/>\n", escape(feature)));
        }
        xml.push_str("  </features>\n");
        xml
    }

    fn build_disks(&self) -> String {
        let mut xml = String::new();

        for disk in &self.spec.disks {
            match disk {
                DiskSpec::File { device, source_file, target_dev, target_bus } => {
                    xml.push_str(&format!(
                        r#"    <disk type='file' device='{}'>
      <source file='{}'/>
      <target dev='{}' bus='{}'/>
    </disk>
"#,
                        escape(device),
                        escape(source_file),
                        escape(target_dev),
                        escape(target_bus)
                    ));
                }
                DiskSpec::Block { device, source_dev, target_dev, target_bus, uncached } => {
                    let driver = if *uncached {
                        "      <driver name='qemu' cache='none'/>\n"
                    } else {
                        ""
                    };
                    xml.push_str(&format!(
                        r#"    <disk type='block' device='{}'>
{}      <source dev='{}'/>
      <target dev='{}' bus='{}'/>
    </disk>
"#,
                        escape(device),
                        driver,
                        escape(source_dev),
                        escape(target_dev),
                        escape(target_bus)
                    ));
                }
            }
        }

        xml
    }

    fn build_nics(&self) -> String {
        let mut xml = String::new();

        for nic in &self.spec.nics {
            xml.push_str("    <interface type='bridge'>\n");
            xml.push_str(&format!("      <source bridge='{}'/>\n", escape(&nic.source_bridge)));
            if let Some(ref mac) = nic.mac_address {
                xml.push_str(&format!("      <mac address='{}'/>\n", escape(mac)));
            }
            xml.push_str("    </interface>\n");
        }

        xml
    }

    fn build_console(&self) -> String {
        let spec = self.spec;
        format!(
            r#"    <serial type='{}'>
      <target port='{}'/>
    </serial>
    <console type='{}'>
      <target port='{}'/>
    </console>
    <input type='mouse' bus='{}'/>
"#,
            escape(&spec.serial_type),
            spec.serial_port,
            escape(&spec.console_type),
            spec.console_port,
            escape(&spec.mouse_bus)
        )
    }

    fn build_graphics(&self) -> String {
        let graphics = &self.spec.graphics;
        format!(
            "    <graphics type='{}' port='{}' autoport='{}' keymap='{}'/>\n",
            escape(&graphics.kind),
            graphics.port,
            escape(&graphics.autoport),
            escape(&graphics.keymap)
        )
    }
}
