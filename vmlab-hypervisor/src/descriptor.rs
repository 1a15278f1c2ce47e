//! Domain and snapshot descriptor handling.
//!
//! Only a handful of fields are ever read out of a libvirt descriptor, so
//! instead of deserializing the full schema this module walks the XML event
//! stream and picks out elements by their absolute path.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{HypervisorError, Result};
use crate::types::Snapshot;

/// Interface type whose MAC address identifies a domain on the lab network.
const NETWORK_INTERFACE_TYPE: &str = "network";

/// Fields extracted from a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    /// `<domain><name>`
    pub name: String,
    /// `<domain><description>`, empty when absent
    pub description: String,
    /// MAC address of the first `<interface type='network'>`, as written in
    /// the descriptor (not normalized)
    pub network_mac: Option<String>,
}

impl DomainDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            network_mac: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_network_mac(mut self, mac: impl Into<String>) -> Self {
        self.network_mac = Some(mac.into());
        self
    }

    /// Parse a domain descriptor.
    ///
    /// Only the first `network` interface carrying a `<mac>` is considered.
    /// Domains with several such interfaces are reduced to that one address.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut path: Vec<String> = Vec::new();
        let mut name: Option<String> = None;
        let mut description = String::new();
        let mut network_mac: Option<String> = None;
        let mut in_network_interface = false;

        loop {
            let event = reader.read_event().map_err(xml_error)?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let tag = local_name(e);

                    if tag == "interface" && path == ["domain", "devices"] {
                        in_network_interface =
                            attribute(e, "type")?.as_deref() == Some(NETWORK_INTERFACE_TYPE);
                    }

                    if tag == "mac"
                        && in_network_interface
                        && network_mac.is_none()
                        && path == ["domain", "devices", "interface"]
                    {
                        network_mac = attribute(e, "address")?;
                    }

                    if matches!(event, Event::Start(_)) {
                        path.push(tag);
                    }
                }
                Event::End(_) => {
                    if path.pop().as_deref() == Some("interface") {
                        in_network_interface = false;
                    }
                }
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(xml_error)?;
                    if path == ["domain", "name"] {
                        name = Some(text.into_owned());
                    } else if path == ["domain", "description"] {
                        description.push_str(&text);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let name = name.ok_or_else(|| {
            HypervisorError::XmlError("domain descriptor has no <name>".to_string())
        })?;

        Ok(Self {
            name,
            description,
            network_mac,
        })
    }

    /// Render a minimal domain descriptor carrying these fields.
    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<domain type='kvm'>\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(&self.name)));
        if !self.description.is_empty() {
            xml.push_str(&format!(
                "  <description>{}</description>\n",
                escape(&self.description)
            ));
        }
        xml.push_str("  <devices>\n");
        if let Some(ref mac) = self.network_mac {
            xml.push_str(&format!(
                r#"    <interface type='{}'>
      <source network='default'/>
      <mac address='{}'/>
      <model type='virtio'/>
    </interface>
"#,
                NETWORK_INTERFACE_TYPE,
                escape(mac)
            ));
        }
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");
        xml
    }
}

/// Parse a `<domainsnapshot>` descriptor into its name and parent name.
pub fn parse_snapshot(xml: &str) -> Result<Snapshot> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut name: Option<String> = None;
    let mut parent: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(ref e) => path.push(local_name(e)),
            Event::End(_) => {
                path.pop();
            }
            Event::Text(ref t) => {
                let text = t.unescape().map_err(xml_error)?;
                if path == ["domainsnapshot", "name"] {
                    name = Some(text.into_owned());
                } else if path == ["domainsnapshot", "parent", "name"] {
                    parent = Some(text.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let name = name.ok_or_else(|| {
        HypervisorError::XmlError("snapshot descriptor has no <name>".to_string())
    })?;

    Ok(Snapshot { name, parent })
}

/// Render the `<domainsnapshot>` document used to create a snapshot.
pub fn snapshot_xml(snapshot: &Snapshot) -> String {
    let mut xml = format!(
        "<domainsnapshot><name>{}</name>",
        escape(&snapshot.name)
    );
    if let Some(ref parent) = snapshot.parent {
        xml.push_str(&format!("<parent><name>{}</name></parent>", escape(parent)));
    }
    xml.push_str("</domainsnapshot>");
    xml
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    match e.try_get_attribute(key).map_err(xml_error)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned())),
        None => Ok(None),
    }
}

fn xml_error(e: impl std::fmt::Display) -> HypervisorError {
    HypervisorError::XmlError(e.to_string())
}
