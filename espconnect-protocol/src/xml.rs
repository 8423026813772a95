//! Small owned XML tree for server responses.
//!
//! Older servers answer some requests in XML. Responses are tiny, so they are
//! parsed into an owned tree and queried with a restricted path syntax:
//! `a/b` walks children, `.//a` searches descendants, `//a` also matches the
//! root, and `*` matches any element name.

use crate::error::ProtocolError;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    /// Parses a document and returns its root element.
    pub fn parse(text: &str) -> Result<XmlElement, ProtocolError> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader.read_event().map_err(xml_err)?;
            match event {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ProtocolError::Xml("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(xml_err)?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(value.into_owned()));
                    }
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(value));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(ProtocolError::Xml("unclosed element".to_string()));
        }
        root.ok_or_else(|| ProtocolError::Xml("document has no root element".to_string()))
    }

    /// Serializes the tree without an XML declaration.
    pub fn to_xml_string(&self) -> Result<String, ProtocolError> {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(xml_err)
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), ProtocolError> {
        let start = BytesStart::new(self.name.as_str()).with_attributes(
            self.attributes
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if self.children.is_empty() {
            return writer.write_event(Event::Empty(start)).map_err(xml_err);
        }
        writer.write_event(Event::Start(start)).map_err(xml_err)?;
        for child in &self.children {
            match child {
                XmlNode::Element(e) => e.write_into(writer)?,
                XmlNode::Text(t) => writer
                    .write_event(Event::Text(BytesText::new(t)))
                    .map_err(xml_err)?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_err)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// Concatenated text of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(t) => out.push_str(t),
                XmlNode::Element(e) => e.collect_text(out),
            }
        }
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    /// Text of the named child, if present.
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(XmlElement::text)
    }

    fn descendants<'a>(&'a self, out: &mut Vec<&'a XmlElement>) {
        for e in self.elements() {
            out.push(e);
            e.descendants(out);
        }
    }

    /// All elements matching `path`.
    pub fn find_all(&self, path: &str) -> Vec<&XmlElement> {
        let (absolute, steps) = parse_path(path);
        let mut current: Vec<&XmlElement> = vec![self];

        for (i, step) in steps.iter().enumerate() {
            let mut next = Vec::new();
            for node in current.iter().copied() {
                match step.axis {
                    Axis::Child => next.extend(node.elements().filter(|e| step.matches(e))),
                    Axis::Descendant => {
                        if i == 0 && absolute && step.matches(node) {
                            next.push(node);
                        }
                        let mut all = Vec::new();
                        node.descendants(&mut all);
                        next.extend(all.into_iter().filter(|e| step.matches(e)));
                    }
                }
            }
            current = next;
        }
        current
    }

    /// First element matching `path`.
    pub fn find(&self, path: &str) -> Option<&XmlElement> {
        self.find_all(path).into_iter().next()
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_xml_string() {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug)]
struct Step<'a> {
    axis: Axis,
    name: &'a str,
}

impl Step<'_> {
    fn matches(&self, e: &XmlElement) -> bool {
        self.name == "*" || e.name == self.name
    }
}

fn parse_path(path: &str) -> (bool, Vec<Step<'_>>) {
    let absolute = path.starts_with("//");
    let mut rest = path.strip_prefix('.').unwrap_or(path);
    let mut steps = Vec::new();
    let mut axis = Axis::Child;

    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("//") {
            axis = Axis::Descendant;
            rest = r;
            continue;
        }
        if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            continue;
        }
        let end = rest.find('/').unwrap_or(rest.len());
        let name = &rest[..end];
        if name != "." {
            steps.push(Step { axis, name });
        }
        axis = Axis::Child;
        rest = &rest[end..];
    }
    (absolute, steps)
}

fn element_from_start(start: &BytesStart<'_>) -> Result<XmlElement, ProtocolError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), ProtocolError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlNode::Element(element)),
        None => {
            if root.is_some() {
                return Err(ProtocolError::Xml("multiple root elements".to_string()));
            }
            *root = Some(element);
        }
    }
    Ok(())
}

fn xml_err(err: impl fmt::Display) -> ProtocolError {
    ProtocolError::Xml(err.to_string())
}
