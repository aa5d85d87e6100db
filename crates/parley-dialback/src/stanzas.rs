//! Builders for the wire artifacts of the trust layer.

use parley_types::{
    escape_xml, Element, StanzaType, NS_DIALBACK, NS_DIALBACK_FEATURE, NS_SERVER, NS_STANZA_ERRORS,
    NS_STREAMS, NS_STREAM_ERRORS,
};

/// The two dialback stanza kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialbackKind {
    /// `db:result`: a key presented by the originating server, or the
    /// receiving server's verdict on it.
    Result,
    /// `db:verify`: a key check asked of, or answered by, the authoritative
    /// server.
    Verify,
}

impl DialbackKind {
    /// Classifies an element; `None` if it is not a dialback stanza.
    ///
    /// Accepts both the `db:`-prefixed form and the default-namespace form.
    /// A `db:` element without its own prefix declaration inherits the one
    /// made on the stream header.
    pub fn of(stanza: &Element) -> Option<Self> {
        let in_namespace = match stanza.xmlns() {
            Some(ns) => ns == NS_DIALBACK,
            None => stanza.name().starts_with("db:"),
        };
        if !in_namespace {
            return None;
        }
        match stanza.local_name() {
            "result" => Some(Self::Result),
            "verify" => Some(Self::Verify),
            _ => None,
        }
    }

    fn element_name(self) -> &'static str {
        match self {
            Self::Result => "db:result",
            Self::Verify => "db:verify",
        }
    }
}

fn dialback(kind: DialbackKind, from: &str, to: &str) -> Element {
    Element::new(kind.element_name())
        .with_attr("xmlns:db", NS_DIALBACK)
        .with_attr("from", from)
        .with_attr("to", to)
}

/// Key presented by `from` to `to`.
pub fn dialback_key(from: &str, to: &str, key: &str) -> Element {
    dialback(DialbackKind::Result, from, to).with_cdata(key)
}

/// Asks the authoritative server `to` to check `key` for stream `stream_id`.
pub fn verify_request(from: &str, to: &str, stream_id: &str, key: &str) -> Element {
    dialback(DialbackKind::Verify, from, to)
        .with_attr("id", stream_id)
        .with_cdata(key)
}

/// Answer to a verify request.
pub fn verify_reply(from: &str, to: &str, stream_id: &str, valid: bool) -> Element {
    dialback(DialbackKind::Verify, from, to)
        .with_attr("id", stream_id)
        .with_attr("type", StanzaType::from_outcome(valid).as_str())
}

/// Verdict on a presented key, optionally carrying a stanza error.
pub fn result_reply(from: &str, to: &str, kind: StanzaType, error: Option<Element>) -> Element {
    let reply = dialback(DialbackKind::Result, from, to).with_attr("type", kind.as_str());
    match error {
        Some(error) => reply.with_child(error),
        None => reply,
    }
}

/// `<error type='..'><condition xmlns='..stanzas'/></error>`.
pub fn stanza_error(error_type: &str, condition: &str) -> Element {
    Element::new("error")
        .with_attr("type", error_type)
        .with_child(Element::new(condition).with_attr("xmlns", NS_STANZA_ERRORS))
}

/// `<stream:error><condition xmlns='..streams'/></stream:error>`.
pub fn stream_error(condition: &str) -> Element {
    Element::new("stream:error")
        .with_child(Element::new(condition).with_attr("xmlns", NS_STREAM_ERRORS))
}

/// True for a stream-level `error` element.
pub fn is_stream_error(stanza: &Element) -> bool {
    stanza.local_name() == "error"
        && (stanza.name() == "stream:error" || stanza.xmlns() == Some(NS_STREAMS))
}

/// True for a `stream:features` element.
pub fn is_stream_features(stanza: &Element) -> bool {
    stanza.local_name() == "features"
        && (stanza.name() == "stream:features" || stanza.xmlns() == Some(NS_STREAMS))
}

/// Dialback's entry in our stream features.
pub fn dialback_feature() -> Element {
    Element::new("dialback").with_attr("xmlns", NS_DIALBACK_FEATURE)
}

/// Opening stream header sent in answer to an inbound stream.
pub fn stream_header(
    stream_id: &str,
    from: Option<&str>,
    to: Option<&str>,
    version: Option<&str>,
) -> String {
    let mut header = format!(
        "<stream:stream xmlns='{NS_SERVER}' xmlns:stream='{NS_STREAMS}' xmlns:db='{NS_DIALBACK}' id='{}'",
        escape_xml(stream_id)
    );
    for (name, value) in [("from", from), ("to", to), ("version", version)] {
        if let Some(value) = value {
            header.push_str(&format!(" {name}='{}'", escape_xml(value)));
        }
    }
    header.push('>');
    header
}

/// `<stream:features>` wrapper around processor contributions.
pub fn stream_features(features: Vec<Element>) -> Element {
    features
        .into_iter()
        .fold(Element::new("stream:features"), Element::with_child)
}
