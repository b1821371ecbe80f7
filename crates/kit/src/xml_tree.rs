//! Mutable XML DOM built on quick-xml.
//!
//! Libvirt domain documents are read into a small tree of [`XmlNode`]s,
//! edited field-by-field, and serialized back for `virsh define`. Attribute
//! order is preserved so the serialized form stays close to what the
//! hypervisor emitted.

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

use crate::error::{Error, Result};

/// One element in the parsed document.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlNode {
    /// Element name, including any namespace prefix.
    pub name: String,
    /// Attributes in document order.
    pub attributes: Vec<(String, String)>,
    /// Concatenated text content of this element.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    /// Create an element with text content and no attributes.
    pub fn with_text(name: &str, text: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            text: text.to_string(),
            children: Vec::new(),
        }
    }

    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set (or append) an attribute.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.attributes.iter_mut().find(|(k, _)| k == name) {
            entry.1 = value.to_string();
        } else {
            self.attributes.push((name.to_string(), value.to_string()));
        }
    }

    /// Find the first element named `element_name`, depth-first in document
    /// order, including this node itself.
    pub fn find(&self, element_name: &str) -> Option<&XmlNode> {
        if self.name == element_name {
            return Some(self);
        }
        for child in &self.children {
            if let Some(found) = child.find(element_name) {
                return Some(found);
            }
        }
        None
    }

    /// Mutable variant of [`XmlNode::find`].
    pub fn find_mut(&mut self, element_name: &str) -> Option<&mut XmlNode> {
        if self.name == element_name {
            return Some(self);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_mut(element_name) {
                return Some(found);
            }
        }
        None
    }

    /// First direct child named `element_name`.
    pub fn child(&self, element_name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == element_name)
    }

    /// Mutable variant of [`XmlNode::child`].
    pub fn child_mut(&mut self, element_name: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|c| c.name == element_name)
    }

    /// All descendants named `element_name`, depth-first in document order.
    pub fn find_all<'a>(&'a self, element_name: &str, out: &mut Vec<&'a XmlNode>) {
        if self.name == element_name {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(element_name, out);
        }
    }

    /// Text content of this node.
    pub fn text_content(&self) -> &str {
        &self.text
    }

    /// Replace the text content of this node.
    pub fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    /// Serialize this node and its subtree as XML.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        self.write_to(&mut writer)?;
        let bytes = writer.into_inner().into_inner();
        String::from_utf8(bytes).map_err(|e| Error::Parse(format!("non-UTF8 XML output: {e}")))
    }

    fn write_to(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> Result<()> {
        let mut elem = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            elem.push_attribute((key.as_str(), value.as_str()));
        }

        if self.text.is_empty() && self.children.is_empty() {
            writer
                .write_event(Event::Empty(elem))
                .map_err(|e| Error::Parse(format!("XML write failed: {e}")))?;
            return Ok(());
        }

        writer
            .write_event(Event::Start(elem))
            .map_err(|e| Error::Parse(format!("XML write failed: {e}")))?;
        if !self.text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&self.text)))
                .map_err(|e| Error::Parse(format!("XML write failed: {e}")))?;
        }
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| Error::Parse(format!("XML write failed: {e}")))?;
        Ok(())
    }
}

fn node_from_start(e: &BytesStart<'_>) -> Result<XmlNode> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Parse(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        attributes.push((key, value));
    }
    Ok(XmlNode {
        name,
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}

/// Parse an XML document into a DOM tree.
pub fn parse_xml_dom(xml: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                stack.push(node_from_start(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let node = node_from_start(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                } else if root.is_none() {
                    root = Some(node);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(completed) = stack.pop() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(completed);
                    } else {
                        root = Some(completed);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Ok(text) = e.unescape() {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Parse(format!("failed to parse XML: {e}"))),
            _ => {}
        }
        buf.clear();
    }

    root.ok_or_else(|| Error::Parse("no root element found in XML".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_navigate() {
        let xml = r#"
        <domain type="kvm">
            <name>jessie</name>
            <memory unit="KiB">1048576</memory>
            <devices>
                <disk type="block" device="disk">
                    <source dev="/dev/vm_jessie/root"/>
                    <target dev="vda" bus="virtio"/>
                </disk>
            </devices>
        </domain>
        "#;
        let dom = parse_xml_dom(xml).unwrap();
        assert_eq!(dom.name, "domain");
        assert_eq!(dom.attr("type"), Some("kvm"));
        assert_eq!(dom.find("name").map(|n| n.text_content()), Some("jessie"));
        assert_eq!(
            dom.find("source").and_then(|n| n.attr("dev")),
            Some("/dev/vm_jessie/root")
        );
        assert_eq!(dom.find("nonexistent"), None);
    }

    #[test]
    fn test_mutation_and_roundtrip() {
        let xml = r#"<domain><name>jessie</name><vcpu>1</vcpu></domain>"#;
        let mut dom = parse_xml_dom(xml).unwrap();
        dom.find_mut("name").unwrap().set_text("testvm");
        dom.find_mut("vcpu").unwrap().set_text("4");

        let out = dom.to_xml().unwrap();
        assert!(out.contains("<name>testvm</name>"));
        assert!(out.contains("<vcpu>4</vcpu>"));
        assert!(!out.contains("jessie"));
    }

    #[test]
    fn test_attribute_order_preserved() {
        let xml = r#"<target dev="vda" bus="virtio"/>"#;
        let dom = parse_xml_dom(xml).unwrap();
        let out = dom.to_xml().unwrap();
        assert_eq!(out, r#"<target dev="vda" bus="virtio"/>"#);
    }

    #[test]
    fn test_set_attr_updates_and_appends() {
        let mut node = XmlNode::with_text("graphics", "");
        node.set_attr("type", "vnc");
        node.set_attr("port", "5989");
        node.set_attr("port", "5942");
        assert_eq!(node.attr("type"), Some("vnc"));
        assert_eq!(node.attr("port"), Some("5942"));
        assert_eq!(node.attributes.len(), 2);
    }

    #[test]
    fn test_find_all_document_order() {
        let xml = r#"
        <devices>
            <disk id="a"/>
            <interface/>
            <disk id="b"><disk id="c"/></disk>
        </devices>
        "#;
        let dom = parse_xml_dom(xml).unwrap();
        let mut disks = Vec::new();
        dom.find_all("disk", &mut disks);
        let ids: Vec<_> = disks.iter().filter_map(|d| d.attr("id")).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(parse_xml_dom(""), Err(Error::Parse(_))));
    }
}
