//! Owned XML tree used to decode qdbapi responses.
//!
//! Responses are small, so the whole document is materialized into an
//! `Element` tree with `quick-xml`'s pull parser. Leaf text is kept exactly
//! as sent. Whitespace-only text in an element that has children is layout
//! and is dropped. CDATA is folded into the element text.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{malformed, Error, Result};

/// One XML element with its attributes, text content and children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a complete document and return its root element.
    pub fn parse(input: &str) -> Result<Element> {
        let mut reader = Reader::from_str(input);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event().map_err(malformed)? {
                Event::Start(start) => stack.push(open(&start)?),
                Event::Empty(start) => {
                    let element = open(&start)?;
                    close(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::Deserialization("unbalanced end tag".to_string()))?;
                    close(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text.unescape().map_err(malformed)?);
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

        if let Some(open) = stack.last() {
            return Err(Error::Deserialization(format!("unclosed element <{}>", open.name)));
        }
        root.ok_or_else(|| Error::Deserialization("document has no root element".to_string()))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of the first child named `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a `/`-separated path of child names, e.g. `table/fields`.
    pub fn find(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |element, segment| element.child(segment))
    }

    /// Move the children of the element at `path` out of the tree.
    pub fn take_children(&mut self, path: &str) -> Vec<Element> {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match current.children.iter_mut().find(|c| c.name == segment) {
                Some(next) => current = next,
                None => return Vec::new(),
            }
        }
        std::mem::take(&mut current.children)
    }
}

fn open(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn close(stack: &mut [Element], root: &mut Option<Element>, mut element: Element) -> Result<()> {
    if !element.children.is_empty() && element.text.trim().is_empty() {
        element.text.clear();
    }
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(Error::Deserialization(format!(
                "unexpected second root element <{}>",
                element.name
            )))
        }
    }
    Ok(())
}

/// Contents of the CDATA sections that carry `raw`. An embedded `]]>` is
/// split across two sections so neither contains the terminator.
pub fn cdata_sections(raw: &str) -> Vec<Cow<'_, str>> {
    let parts: Vec<&str> = raw.split("]]>").collect();
    let last = parts.len() - 1;
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| match (i == 0, i == last) {
            (true, true) => Cow::Borrowed(*part),
            (true, false) => Cow::Owned(format!("{part}]]")),
            (false, true) => Cow::Owned(format!(">{part}")),
            (false, false) => Cow::Owned(format!(">{part}]]")),
        })
        .collect()
}
