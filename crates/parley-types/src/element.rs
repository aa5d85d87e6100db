//! Minimal stanza element model.
//!
//! Parsing is done by the transport's XML tokenizer; this type only carries
//! the resulting tree and knows how to serialise itself back to wire form.

use std::fmt;

/// A parsed or constructed XML element.
///
/// Attribute order is preserved so serialised output is stable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    cdata: Option<String>,
}

impl Element {
    /// Creates an empty element with the given (possibly prefixed) name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder: sets an attribute, replacing any previous value.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder: appends a child element.
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Builder: sets the character data.
    pub fn with_cdata(mut self, cdata: impl Into<String>) -> Self {
        self.cdata = Some(cdata.into());
        self
    }

    /// Sets an attribute, replacing any previous value.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// Full element name, including any prefix (`db:result`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element name with any prefix removed (`result`).
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Returns an attribute value.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes, in insertion order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Namespace declared for this element's own prefix.
    ///
    /// For `db:result` this is the value of `xmlns:db`; for an unprefixed
    /// name it is `xmlns`.
    pub fn xmlns(&self) -> Option<&str> {
        match self.name.split_once(':') {
            Some((prefix, _)) => self.attr(&format!("xmlns:{prefix}")),
            None => self.attr("xmlns"),
        }
    }

    /// True if the local name and namespace both match.
    pub fn is(&self, local_name: &str, xmlns: &str) -> bool {
        self.local_name() == local_name && self.xmlns() == Some(xmlns)
    }

    /// Character data, if any.
    pub fn cdata(&self) -> Option<&str> {
        self.cdata.as_deref()
    }

    /// Child elements.
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// First child with the given local name and namespace.
    pub fn find_child(&self, local_name: &str, xmlns: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(local_name, xmlns))
    }

    /// True if a child with the given local name and namespace exists.
    pub fn has_child(&self, local_name: &str, xmlns: &str) -> bool {
        self.find_child(local_name, xmlns).is_some()
    }

    /// Serialises the element to its XML text form.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape_xml(v));
            out.push('\'');
        }
        if self.children.is_empty() && self.cdata.is_none() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(cdata) = &self.cdata {
            out.push_str(&escape_xml(cdata));
        }
        for child in &self.children {
            child.write_into(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Escapes the five XML special characters.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
