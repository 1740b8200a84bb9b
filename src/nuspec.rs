//! # Nuspec Document Model
//!
//! A small mutable element tree for nuspec manifests, read with `quick-xml`'s
//! pull reader and written back through its indenting `Writer`: two-space
//! indent, text-only elements on one line, childless elements self-closed,
//! no blank lines.
//!
//! This is not a general purpose XML DOM. Processing instructions and the
//! doctype are dropped, whitespace-only text between elements is discarded
//! (other text is kept exactly as written), and namespaces are treated as plain
//! attributes, so stripping `xmlns` from `<package>` is an attribute removal.

use std::io::Write;
use anyhow::{Context, Result, anyhow, bail};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Declaration written at the top of every serialized document.
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" ?>"#;

/// A node inside an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

/// An XML element with ordered attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: adds (or replaces) an attribute.
    pub fn with_attr(mut self, key: &str, value: &str) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Builder: replaces the content with a single text node.
    pub fn with_text(mut self, text: &str) -> Self {
        self.set_text(text);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, key: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }

    /// Removes an attribute, returning its previous value.
    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        let pos = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(pos).1)
    }

    /// Iterates over the direct child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First direct child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|n| match n {
            Node::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    /// Like [`Element::child`], but a missing child is an error.
    pub fn require_child(&self, name: &str) -> Result<&Element> {
        let parent = &self.name;
        self.child(name)
            .ok_or_else(|| anyhow!("element <{}> not found in <{}>", name, parent))
    }

    pub fn require_child_mut(&mut self, name: &str) -> Result<&mut Element> {
        let parent = self.name.clone();
        self.child_mut(name)
            .ok_or_else(|| anyhow!("element <{}> not found in <{}>", name, parent))
    }

    /// Number of direct child elements with the given name.
    pub fn count_children(&self, name: &str) -> usize {
        self.elements().filter(|e| e.name == name).count()
    }

    /// Removes every direct child element with the given name.
    /// Returns how many were removed.
    pub fn remove_children(&mut self, name: &str) -> usize {
        let before = self.children.len();
        self.children
            .retain(|n| !matches!(n, Node::Element(e) if e.name == name));
        before - self.children.len()
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Concatenated text content of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn set_text(&mut self, text: &str) {
        self.children = vec![Node::Text(text.to_string())];
    }
}

/// A parsed nuspec manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub root: Element,
}

impl Document {
    /// Parses a document from a string. A leading byte order mark is ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let mut reader = Reader::from_str(content);

        // Stack of open elements; the finished root lands in `root`.
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .with_context(|| format!("Malformed XML at byte {}", reader.buffer_position()))?;

            match event {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let el = element_from_start(&start)?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::End(_) => {
                    let el = stack
                        .pop()
                        .ok_or_else(|| anyhow!("Unexpected closing tag"))?;
                    attach(&mut stack, &mut root, el)?;
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    if !text.trim().is_empty() {
                        push_node(&mut stack, Node::Text(text.into_owned()));
                    }
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    push_node(&mut stack, Node::Text(text));
                }
                Event::Comment(comment) => {
                    let text = String::from_utf8_lossy(&comment).into_owned();
                    push_node(&mut stack, Node::Comment(text));
                }
                Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.last() {
            bail!("Unexpected end of document: <{}> is never closed", open.name);
        }

        let root = root.ok_or_else(|| anyhow!("Document has no root element"))?;
        Ok(Self { root })
    }

    /// Serializes the document in the pretty layout, without blank lines and
    /// without a trailing newline.
    pub fn to_pretty_string(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        write_element(&mut writer, &self.root)?;
        let body = String::from_utf8(writer.into_inner())?;

        Ok(std::iter::once(XML_DECLARATION)
            .chain(body.lines())
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

fn element_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<Element> {
    let mut el = Element::new(&String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        el.attributes.push((key, value));
    }
    Ok(el)
}

/// Attaches a finished element to its parent, or makes it the root.
fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.push_child(el),
        None if root.is_none() => *root = Some(el),
        None => bail!("Document has more than one root element (found <{}>)", el.name),
    }
    Ok(())
}

/// Text and comments outside the root element are dropped.
fn push_node(stack: &mut [Element], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn write_element<W: Write>(writer: &mut Writer<W>, el: &Element) -> Result<()> {
    let mut start = BytesStart::new(el.name.as_str());
    for (key, value) in &el.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if el.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &el.children {
        match child {
            Node::Element(e) => write_element(writer, e)?,
            Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
            Node::Comment(c) => writer.write_event(Event::Comment(BytesText::from_escaped(c.as_str())))?,
        }
    }
    writer.write_event(Event::End(BytesEnd::new(el.name.as_str())))?;
    Ok(())
}
