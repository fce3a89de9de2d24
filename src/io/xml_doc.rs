//! Editable XML tree that re-serialises untouched content byte for byte.
//!
//! Nodes live in an arena owned by [`XmlDocument`] and are addressed by
//! [`NodeId`], which stays valid across insertions and removals. Every node
//! parsed from the file remembers its source span; an element that was never
//! modified (nor any of its descendants) is written back as that span, so
//! comments, attribute order, entity spelling and formatting inside it are
//! preserved exactly. Only modified elements are re-assembled from their parts.
//!
//! Accepted deviations: whitespace around inserted and removed nodes is
//! normalised (inserted nodes copy their siblings' indentation, a removed node
//! takes the whitespace before it along), and a start tag whose attributes
//! change is rebuilt with single spaces between attributes.

use std::ops::Range;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::escape::{escape, partial_escape, unescape};
use quick_xml::events::{BytesStart, Event};

use crate::config::Target;
use crate::error::XmlParseError;

const INDENT_UNIT: &str = "    ";

/// Stable handle to a node of an [`XmlDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum Segment {
    Source(Range<usize>),
    Owned(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Text,
    CData,
    Comment,
    Other,
}

#[derive(Debug, Clone)]
struct Raw {
    kind: RawKind,
    segment: Segment,
}

#[derive(Debug, Clone)]
struct Attribute {
    name: String,
    /// Value exactly as written between the quotes.
    raw_value: String,
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    attributes: Vec<Attribute>,
    children: Vec<NodeId>,
    span: Option<Range<usize>>,
    start_tag: Option<Range<usize>>,
    end_tag: Option<Range<usize>>,
    self_closing: bool,
    /// Start tag must be rebuilt from `attributes`.
    start_modified: bool,
    /// Element or one of its descendants changed.
    modified: bool,
}

impl Element {
    fn new(name: &str) -> Self {
        Element {
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
            span: None,
            start_tag: None,
            end_tag: None,
            self_closing: true,
            start_modified: true,
            modified: true,
        }
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Raw(Raw),
    Element(Element),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
}

/// A parsed XML file.
#[derive(Debug, Clone)]
pub struct XmlDocument {
    source: String,
    nodes: Vec<Node>,
    top: Vec<NodeId>,
    modified: bool,
}

impl XmlDocument {
    /// Parses an in-memory snippet, such as a rule template.
    pub fn parse_str(source: &str) -> Result<XmlDocument, XmlParseError> {
        XmlDocument::parse(Path::new("<inline>"), source.to_string())
    }

    /// Parses the content of the file at `path`; `path` is only used for
    /// error reporting.
    pub fn parse(path: &Path, source: String) -> Result<XmlDocument, XmlParseError> {
        let syntax = |offset: usize, message: String| XmlParseError {
            path: path.to_path_buf(),
            offset,
            message,
        };

        let mut nodes: Vec<Node> = Vec::new();
        let mut top: Vec<NodeId> = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut cursor = 0usize;

        {
            let mut reader = Reader::from_str(&source);
            loop {
                let start = reader.buffer_position() as usize;
                let event = reader
                    .read_event()
                    .map_err(|err| syntax(reader.error_position() as usize, err.to_string()))?;
                let end = reader.buffer_position() as usize;

                if start > cursor {
                    // Bytes the reader skipped over, e.g. a byte order mark.
                    let gap = Raw {
                        kind: RawKind::Other,
                        segment: Segment::Source(cursor..start),
                    };
                    push_node(&mut nodes, &mut top, stack.last().copied(), NodeKind::Raw(gap));
                }
                cursor = end;

                let parent = stack.last().copied();
                let raw = |kind: RawKind| {
                    NodeKind::Raw(Raw {
                        kind,
                        segment: Segment::Source(start..end),
                    })
                };
                match event {
                    Event::Start(tag) => {
                        let element = element_from_tag(&tag, start..end, false)
                            .map_err(|message| syntax(start, message))?;
                        let id =
                            push_node(&mut nodes, &mut top, parent, NodeKind::Element(element));
                        stack.push(id);
                    }
                    Event::Empty(tag) => {
                        let element = element_from_tag(&tag, start..end, true)
                            .map_err(|message| syntax(start, message))?;
                        push_node(&mut nodes, &mut top, parent, NodeKind::Element(element));
                    }
                    Event::End(_) => {
                        let id = stack
                            .pop()
                            .ok_or_else(|| syntax(start, "unexpected closing tag".to_string()))?;
                        if let NodeKind::Element(element) = &mut nodes[id.0].kind {
                            element.end_tag = Some(start..end);
                            if let Some(span) = &mut element.span {
                                span.end = end;
                            }
                        }
                    }
                    Event::Text(_) => {
                        push_node(&mut nodes, &mut top, parent, raw(RawKind::Text));
                    }
                    Event::CData(_) => {
                        push_node(&mut nodes, &mut top, parent, raw(RawKind::CData));
                    }
                    Event::Comment(_) => {
                        push_node(&mut nodes, &mut top, parent, raw(RawKind::Comment));
                    }
                    Event::Eof => break,
                    _ => {
                        push_node(&mut nodes, &mut top, parent, raw(RawKind::Other));
                    }
                }
            }
        }

        if !stack.is_empty() {
            return Err(syntax(source.len(), "unclosed element at end of input".to_string()));
        }
        if cursor < source.len() {
            let tail = Raw {
                kind: RawKind::Other,
                segment: Segment::Source(cursor..source.len()),
            };
            push_node(&mut nodes, &mut top, None, NodeKind::Raw(tail));
        }

        Ok(XmlDocument {
            source,
            nodes,
            top,
            modified: false,
        })
    }

    /// Text the document was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether any edit has been applied since parsing.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Top-level elements (normally exactly one).
    pub fn root_elements(&self) -> Vec<NodeId> {
        self.top
            .iter()
            .copied()
            .filter(|id| self.element(*id).is_some())
            .collect()
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|element| element.name.as_str())
    }

    /// Element children of `id`, in document order.
    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.element(id)
            .map(|element| {
                element
                    .children
                    .iter()
                    .copied()
                    .filter(|child| self.element(*child).is_some())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First child element named `name`.
    pub fn child_element(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.element_children(id)
            .into_iter()
            .find(|child| self.name(*child) == Some(name))
    }

    /// Elements reached by following `path` from the top level, where
    /// `path[0]` names the root element.
    pub fn find_elements(&self, path: &[String]) -> Vec<NodeId> {
        let Some((first, rest)) = path.split_first() else {
            return Vec::new();
        };
        let mut current: Vec<NodeId> = self
            .root_elements()
            .into_iter()
            .filter(|id| self.name(*id) == Some(first.as_str()))
            .collect();
        for segment in rest {
            current = current
                .into_iter()
                .flat_map(|id| self.element_children(id))
                .filter(|id| self.name(*id) == Some(segment.as_str()))
                .collect();
        }
        current
    }

    /// Unescaped attribute value.
    pub fn attribute(&self, id: NodeId, name: &str) -> Option<String> {
        self.element(id)?
            .attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| unescape_lossy(&attribute.raw_value))
    }

    /// Text content of an element. For elements that also hold child
    /// elements, indentation-only text between them is ignored.
    pub fn text(&self, id: NodeId) -> String {
        let Some(element) = self.element(id) else {
            return String::new();
        };
        let mut text = String::new();
        for child in self.value_text_children(element) {
            if let NodeKind::Raw(raw) = &self.nodes[child.0].kind {
                let content = self.raw_content(raw);
                match raw.kind {
                    RawKind::CData => text.push_str(cdata_body(content)),
                    _ => text.push_str(&unescape_lossy(content)),
                }
            }
        }
        text
    }

    /// Reads a target relative to `id`; `None` when the attribute or child
    /// element does not exist.
    pub fn get(&self, id: NodeId, target: &Target) -> Option<String> {
        match target {
            Target::Text => Some(self.text(id)),
            Target::Attribute(name) => self.attribute(id, name),
            Target::ChildText(child) => self.child_element(id, child).map(|child| self.text(child)),
            Target::ChildAttribute { child, attribute } => self
                .child_element(id, child)
                .and_then(|child| self.attribute(child, attribute)),
        }
    }

    /// Writes a target relative to `id`, creating the child element when
    /// needed. Writing the current value is a no-op.
    pub fn set(&mut self, id: NodeId, target: &Target, value: &str) {
        match target {
            Target::Text => self.set_text(id, value),
            Target::Attribute(name) => self.set_attribute(id, name, value),
            Target::ChildText(child) => {
                let child = self.child_or_create(id, child);
                self.set_text(child, value);
            }
            Target::ChildAttribute { child, attribute } => {
                let child = self.child_or_create(id, child);
                self.set_attribute(child, attribute, value);
            }
        }
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        if self.attribute(id, name).as_deref() == Some(value) {
            return;
        }
        let raw_value = escape(value).into_owned();
        let Some(element) = self.element_mut(id) else {
            return;
        };
        match element.attributes.iter_mut().find(|attribute| attribute.name == name) {
            Some(attribute) => attribute.raw_value = raw_value,
            None => element.attributes.push(Attribute {
                name: name.to_string(),
                raw_value,
            }),
        }
        element.start_modified = true;
        self.mark_modified(id);
    }

    /// Replaces the text content of an element, keeping child elements,
    /// comments and indentation between child elements in place.
    pub fn set_text(&mut self, id: NodeId, value: &str) {
        if self.element(id).is_none() || self.text(id) == value {
            return;
        }
        let replaced: Vec<NodeId> = match self.element(id) {
            Some(element) => self.value_text_children(element),
            None => return,
        };
        let text_node = (!value.is_empty()).then(|| {
            self.alloc(
                NodeKind::Raw(Raw {
                    kind: RawKind::Text,
                    segment: Segment::Owned(partial_escape(value).into_owned()),
                }),
                Some(id),
            )
        });
        let Some(element) = self.element_mut(id) else {
            return;
        };
        let position = element
            .children
            .iter()
            .position(|child| replaced.contains(child))
            .unwrap_or(0);
        element.children.retain(|child| !replaced.contains(child));
        if let Some(text_node) = text_node {
            let position = position.min(element.children.len());
            element.children.insert(position, text_node);
            if element.self_closing {
                element.self_closing = false;
                element.start_modified = true;
            }
        }
        for child in replaced {
            self.nodes[child.0].parent = None;
        }
        self.mark_modified(id);
    }

    /// Creates a detached element; attach it with [`insert_element`](Self::insert_element).
    pub fn create_element(&mut self, name: &str) -> NodeId {
        self.alloc(NodeKind::Element(Element::new(name)), None)
    }

    /// Copies the root element of `template` into this document, detached.
    pub fn import_root(&mut self, template: &XmlDocument) -> Option<NodeId> {
        let root = *template.root_elements().first()?;
        Some(self.import_node(template, root, None))
    }

    /// Attaches a detached element to `parent`, directly after `after` when it
    /// is still a child of `parent`, otherwise after the last child element.
    /// Indentation is copied from the surrounding siblings.
    pub fn insert_element(&mut self, parent: NodeId, after: Option<NodeId>, child: NodeId) {
        let Some(parent_element) = self.element(parent) else {
            return;
        };
        let children = parent_element.children.clone();
        let siblings = self.element_children(parent);
        let parent_indent = self.leading_indent(parent).unwrap_or_else(|| "\n".to_string());

        let anchor = after.filter(|anchor| children.contains(anchor)).or(siblings.last().copied());
        let indent = match anchor {
            Some(anchor) => self.leading_indent(anchor).unwrap_or_default(),
            None => format!("{parent_indent}{INDENT_UNIT}"),
        };

        let position = match anchor.and_then(|anchor| children.iter().position(|c| *c == anchor)) {
            Some(index) => index + 1,
            None => match children.last() {
                Some(last) if self.is_whitespace_text(*last) => children.len() - 1,
                _ => children.len(),
            },
        };
        let appended_at_end = position == children.len();

        let mut inserted = Vec::with_capacity(3);
        if !indent.is_empty() {
            inserted.push(self.owned_text(&indent, parent));
        }
        inserted.push(child);
        if appended_at_end && anchor.is_none() {
            inserted.push(self.owned_text(&parent_indent, parent));
        }
        self.nodes[child.0].parent = Some(parent);

        if let Some(element) = self.element_mut(parent) {
            element.children.splice(position..position, inserted);
            if element.self_closing {
                element.self_closing = false;
                element.start_modified = true;
            }
        }
        self.mark_modified(parent);
    }

    /// Detaches a node together with the indentation preceding it.
    pub fn remove(&mut self, id: NodeId) {
        let parent = self.nodes[id.0].parent;
        let siblings = match parent {
            Some(parent) => match self.element(parent) {
                Some(element) => element.children.clone(),
                None => return,
            },
            None => self.top.clone(),
        };
        let Some(index) = siblings.iter().position(|sibling| *sibling == id) else {
            return;
        };
        let mut removed = vec![id];
        if index > 0 && self.is_whitespace_text(siblings[index - 1]) {
            removed.push(siblings[index - 1]);
        }
        match parent {
            Some(parent) => {
                if let Some(element) = self.element_mut(parent) {
                    element.children.retain(|child| !removed.contains(child));
                }
                self.mark_modified(parent);
            }
            None => {
                self.top.retain(|child| !removed.contains(child));
                self.modified = true;
            }
        }
        for node in removed {
            self.nodes[node.0].parent = None;
        }
    }

    /// Whether the node is still reachable from the document root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            match self.nodes[current.0].parent {
                Some(parent) => {
                    let linked = self
                        .element(parent)
                        .is_some_and(|element| element.children.contains(&current));
                    if !linked {
                        return false;
                    }
                    current = parent;
                }
                None => return self.top.contains(&current),
            }
        }
    }

    /// Serialises the document.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.source.len() + 256);
        for id in &self.top {
            self.write_node(*id, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id.0].kind {
            NodeKind::Raw(raw) => out.push_str(self.raw_content(raw)),
            NodeKind::Element(element) => {
                if !element.modified {
                    if let Some(span) = &element.span {
                        out.push_str(&self.source[span.clone()]);
                        return;
                    }
                }
                let empty = element.children.is_empty();
                match (&element.start_tag, element.start_modified) {
                    (Some(start), false) => out.push_str(&self.source[start.clone()]),
                    _ => {
                        out.push('<');
                        out.push_str(&element.name);
                        for attribute in &element.attributes {
                            let quote = if attribute.raw_value.contains('"') { '\'' } else { '"' };
                            out.push(' ');
                            out.push_str(&attribute.name);
                            out.push('=');
                            out.push(quote);
                            out.push_str(&attribute.raw_value);
                            out.push(quote);
                        }
                        out.push_str(if element.self_closing && empty { "/>" } else { ">" });
                    }
                }
                if element.self_closing && empty {
                    return;
                }
                for child in &element.children {
                    self.write_node(*child, out);
                }
                match &element.end_tag {
                    Some(end) => out.push_str(&self.source[end.clone()]),
                    None => {
                        out.push_str("</");
                        out.push_str(&element.name);
                        out.push('>');
                    }
                }
            }
        }
    }

    fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes.get(id.0)?.kind {
            NodeKind::Element(element) => Some(element),
            NodeKind::Raw(_) => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes.get_mut(id.0)?.kind {
            NodeKind::Element(element) => Some(element),
            NodeKind::Raw(_) => None,
        }
    }

    fn raw_content<'a>(&'a self, raw: &'a Raw) -> &'a str {
        match &raw.segment {
            Segment::Source(span) => &self.source[span.clone()],
            Segment::Owned(text) => text,
        }
    }

    /// Text and CDATA children that make up the element's value.
    fn value_text_children(&self, element: &Element) -> Vec<NodeId> {
        let has_elements = element
            .children
            .iter()
            .any(|child| self.element(*child).is_some());
        element
            .children
            .iter()
            .copied()
            .filter(|child| match &self.nodes[child.0].kind {
                NodeKind::Raw(raw) => match raw.kind {
                    RawKind::Text => !has_elements || !self.is_whitespace_text(*child),
                    RawKind::CData => true,
                    RawKind::Comment | RawKind::Other => false,
                },
                NodeKind::Element(_) => false,
            })
            .collect()
    }

    fn is_whitespace_text(&self, id: NodeId) -> bool {
        match &self.nodes[id.0].kind {
            NodeKind::Raw(raw) if raw.kind == RawKind::Text => {
                self.raw_content(raw).chars().all(char::is_whitespace)
            }
            _ => false,
        }
    }

    /// Indentation (`"\n"` plus the spaces of the last line) in the
    /// whitespace text directly before `id`.
    fn leading_indent(&self, id: NodeId) -> Option<String> {
        let siblings = match self.nodes[id.0].parent {
            Some(parent) => &self.element(parent)?.children,
            None => &self.top,
        };
        let index = siblings.iter().position(|sibling| *sibling == id)?;
        let previous = *siblings.get(index.checked_sub(1)?)?;
        if !self.is_whitespace_text(previous) {
            return None;
        }
        let NodeKind::Raw(raw) = &self.nodes[previous.0].kind else {
            return None;
        };
        let content = self.raw_content(raw);
        content
            .rfind('\n')
            .map(|newline| format!("\n{}", &content[newline + 1..]))
    }

    fn child_or_create(&mut self, id: NodeId, name: &str) -> NodeId {
        if let Some(child) = self.child_element(id, name) {
            return child;
        }
        let child = self.create_element(name);
        self.insert_element(id, None, child);
        child
    }

    fn owned_text(&mut self, text: &str, parent: NodeId) -> NodeId {
        self.alloc(
            NodeKind::Raw(Raw {
                kind: RawKind::Text,
                segment: Segment::Owned(text.to_string()),
            }),
            Some(parent),
        )
    }

    fn alloc(&mut self, kind: NodeKind, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { kind, parent });
        id
    }

    fn import_node(
        &mut self,
        template: &XmlDocument,
        id: NodeId,
        parent: Option<NodeId>,
    ) -> NodeId {
        match &template.nodes[id.0].kind {
            NodeKind::Raw(raw) => {
                let copy = Raw {
                    kind: raw.kind,
                    segment: Segment::Owned(template.raw_content(raw).to_string()),
                };
                self.alloc(NodeKind::Raw(copy), parent)
            }
            NodeKind::Element(element) => {
                let mut copy = Element::new(&element.name);
                copy.attributes = element.attributes.clone();
                copy.self_closing = element.self_closing;
                let new_id = self.alloc(NodeKind::Element(copy), parent);
                let children: Vec<NodeId> = element
                    .children
                    .iter()
                    .map(|child| self.import_node(template, *child, Some(new_id)))
                    .collect();
                if let Some(copy) = self.element_mut(new_id) {
                    copy.children = children;
                }
                new_id
            }
        }
    }

    fn mark_modified(&mut self, id: NodeId) {
        self.modified = true;
        let mut current = Some(id);
        while let Some(node) = current {
            if let NodeKind::Element(element) = &mut self.nodes[node.0].kind {
                element.modified = true;
            }
            current = self.nodes[node.0].parent;
        }
    }
}

fn push_node(
    nodes: &mut Vec<Node>,
    top: &mut Vec<NodeId>,
    parent: Option<NodeId>,
    kind: NodeKind,
) -> NodeId {
    let id = NodeId(nodes.len());
    nodes.push(Node { kind, parent });
    match parent {
        Some(parent) => {
            if let NodeKind::Element(element) = &mut nodes[parent.0].kind {
                element.children.push(id);
            }
        }
        None => top.push(id),
    }
    id
}

fn element_from_tag(
    tag: &BytesStart<'_>,
    span: Range<usize>,
    self_closing: bool,
) -> Result<Element, String> {
    let name = std::str::from_utf8(tag.name().as_ref())
        .map_err(|err| err.to_string())?
        .to_string();
    let mut attributes = Vec::new();
    for attribute in tag.attributes() {
        let attribute = attribute.map_err(|err| err.to_string())?;
        let name = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|err| err.to_string())?
            .to_string();
        let raw_value = std::str::from_utf8(&attribute.value)
            .map_err(|err| err.to_string())?
            .to_string();
        attributes.push(Attribute { name, raw_value });
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
        span: Some(span.clone()),
        start_tag: Some(span),
        end_tag: None,
        self_closing,
        start_modified: false,
        modified: false,
    })
}

fn unescape_lossy(raw: &str) -> String {
    unescape(raw).map(|text| text.into_owned()).unwrap_or_else(|_| raw.to_string())
}

fn cdata_body(raw: &str) -> &str {
    raw.strip_prefix("<![CDATA[")
        .and_then(|body| body.strip_suffix("]]>"))
        .unwrap_or(raw)
}
