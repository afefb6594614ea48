//! HTML fragment parser and serializer.
//!
//! Covers the subset of HTML the server-rendered markup uses: elements with
//! quoted/bare/boolean attributes, text with character references, comments
//! (dropped), doctypes (dropped), and void elements. The parser is strict
//! where machine-generated markup allows it to be: an unreadable tag or a
//! mismatched close is [`DomError::MalformedMarkup`].

use crate::{Document, DomError, Node, NodeId, is_void_tag};

// ── Escaping ──────────────────────────────────────────────────────────────

pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let semi = match rest.find(';') {
            // An unterminated reference is passed through verbatim.
            None => {
                out.push_str(rest);
                return out;
            }
            Some(i) => i,
        };
        let entity = &rest[1..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let decoded = entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| {
                        entity.strip_prefix('#').and_then(|dec| dec.parse().ok())
                    })
                    .and_then(char::from_u32);
                match decoded {
                    Some(ch) => out.push(ch),
                    None => out.push_str(&rest[..=semi]),
                }
            }
        }
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    out
}

// ── Parser ────────────────────────────────────────────────────────────────

pub(crate) fn parse_fragment(doc: &mut Document, markup: &str) -> Result<Vec<NodeId>, DomError> {
    let mut parser = Parser { s: markup.as_bytes(), src: markup, pos: 0 };
    let mut out = Vec::new();
    parser.parse_nodes(doc, &mut out, None)?;
    Ok(out)
}

struct Parser<'a> {
    s: &'a [u8],
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.src[self.pos..].starts_with(pat)
    }

    fn err(&self, what: &str) -> DomError {
        DomError::MalformedMarkup(format!("{what} at byte {}", self.pos))
    }

    fn skip_until(&mut self, pat: &str) -> Result<(), DomError> {
        match self.src[self.pos..].find(pat) {
            Some(i) => {
                self.pos += i + pat.len();
                Ok(())
            }
            None => Err(self.err("unterminated markup declaration")),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_ascii_lowercase()
    }

    /// Parse sibling nodes until EOF or the matching close of `enclosing`.
    fn parse_nodes(
        &mut self,
        doc: &mut Document,
        out: &mut Vec<NodeId>,
        enclosing: Option<&str>,
    ) -> Result<(), DomError> {
        loop {
            if self.pos >= self.s.len() {
                return match enclosing {
                    Some(tag) => Err(self.err(&format!("unclosed <{tag}>"))),
                    None => Ok(()),
                };
            }
            if self.peek() == Some(b'<') {
                if self.starts_with("<!--") {
                    self.pos += 4;
                    self.skip_until("-->")?;
                } else if self.starts_with("<!") {
                    self.pos += 2;
                    self.skip_until(">")?;
                } else if self.starts_with("</") {
                    self.pos += 2;
                    let name = self.read_name();
                    self.skip_whitespace();
                    if self.peek() != Some(b'>') {
                        return Err(self.err("malformed closing tag"));
                    }
                    self.pos += 1;
                    return match enclosing {
                        Some(tag) if tag == name => Ok(()),
                        _ => Err(self.err(&format!("unexpected </{name}>"))),
                    };
                } else {
                    out.push(self.parse_element(doc)?);
                }
            } else {
                let start = self.pos;
                while self.pos < self.s.len() && self.peek() != Some(b'<') {
                    self.pos += 1;
                }
                let text = decode_entities(&self.src[start..self.pos]);
                out.push(doc.create_text(&text));
            }
        }
    }

    fn parse_element(&mut self, doc: &mut Document) -> Result<NodeId, DomError> {
        self.pos += 1; // consume '<'
        let name = self.read_name();
        if name.is_empty() {
            return Err(self.err("expected tag name"));
        }
        let el = doc.create_element(&name);
        let mut self_closed = false;
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') if self.starts_with("/>") => {
                    self.pos += 2;
                    self_closed = true;
                    break;
                }
                Some(_) => {
                    let attr = self.read_name();
                    if attr.is_empty() {
                        return Err(self.err("malformed attribute"));
                    }
                    self.skip_whitespace();
                    let value = if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.skip_whitespace();
                        self.read_attr_value()?
                    } else {
                        String::new()
                    };
                    doc.set_attr(el, &attr, &value);
                }
                None => return Err(self.err(&format!("unclosed <{name}>"))),
            }
        }
        if !self_closed && !is_void_tag(&name) {
            let mut children = Vec::new();
            self.parse_nodes(doc, &mut children, Some(&name))?;
            for child in children {
                doc.append_child(el, child);
            }
        }
        Ok(el)
    }

    fn read_attr_value(&mut self) -> Result<String, DomError> {
        match self.peek() {
            Some(q @ (b'"' | b'\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek() != Some(q) {
                    if self.pos >= self.s.len() {
                        return Err(self.err("unterminated attribute value"));
                    }
                    self.pos += 1;
                }
                let value = decode_entities(&self.src[start..self.pos]);
                self.pos += 1;
                Ok(value)
            }
            _ => {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b.is_ascii_whitespace() || b == b'>' {
                        break;
                    }
                    self.pos += 1;
                }
                Ok(decode_entities(&self.src[start..self.pos]))
            }
        }
    }
}

// ── Serializer ────────────────────────────────────────────────────────────

pub(crate) fn serialize_node(doc: &Document, id: NodeId, out: &mut String) {
    match doc.node(id) {
        Some(Node::Text(t)) => out.push_str(&escape_text(t)),
        Some(Node::Element(el)) => {
            out.push('<');
            out.push_str(&el.tag);
            for (name, value) in &el.attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
            }
            out.push('>');
            if !is_void_tag(&el.tag) {
                for &child in &el.children {
                    serialize_node(doc, child, out);
                }
                out.push_str("</");
                out.push_str(&el.tag);
                out.push('>');
            }
        }
        None => {}
    }
}

// ── Root-tag surgery ──────────────────────────────────────────────────────

/// Byte layout of the first opening tag in a markup string.
struct OpeningTag {
    /// Index of `<`.
    start: usize,
    tag: String,
    /// Index of the closing `>` of the opening tag.
    open_end: usize,
    self_closing: bool,
}

fn scan_opening_tag(markup: &str) -> Result<OpeningTag, DomError> {
    let bytes = markup.as_bytes();
    let mut pos = 0;
    // Skip leading whitespace and comments.
    loop {
        while matches!(bytes.get(pos), Some(b) if b.is_ascii_whitespace()) {
            pos += 1;
        }
        if markup[pos..].starts_with("<!--") {
            match markup[pos + 4..].find("-->") {
                Some(i) => pos += 4 + i + 3,
                None => return Err(DomError::MalformedMarkup("unterminated comment".into())),
            }
        } else {
            break;
        }
    }
    if bytes.get(pos) != Some(&b'<') {
        return Err(DomError::MalformedMarkup("no root tag found".into()));
    }
    let start = pos;
    pos += 1;
    let name_start = pos;
    while matches!(bytes.get(pos), Some(b) if b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_') {
        pos += 1;
    }
    if pos == name_start {
        return Err(DomError::MalformedMarkup("no root tag found".into()));
    }
    let tag = markup[name_start..pos].to_ascii_lowercase();
    // Find the end of the opening tag, respecting quoted attribute values.
    let mut quote: Option<u8> = None;
    loop {
        match bytes.get(pos) {
            None => return Err(DomError::MalformedMarkup(format!("unclosed <{tag}>"))),
            Some(&b) => {
                match quote {
                    Some(q) if b == q => quote = None,
                    Some(_) => {}
                    None if b == b'"' || b == b'\'' => quote = Some(b),
                    None if b == b'>' => {
                        let self_closing = bytes.get(pos - 1) == Some(&b'/');
                        return Ok(OpeningTag { start, tag, open_end: pos, self_closing });
                    }
                    None => {}
                }
                pos += 1;
            }
        }
    }
}

/// Tag name of the first element in `markup`.
pub fn leading_tag(markup: &str) -> Result<String, DomError> {
    scan_opening_tag(markup).map(|t| t.tag)
}

/// Inject attributes into the first opening tag of `markup`.
///
/// With `clear_contents`, the element's contents (and any trailing sibling
/// text) are dropped and an empty element is emitted instead — the shape a
/// skip placeholder takes.
pub fn inject_root_attrs(
    markup: &str,
    attrs: &[(&str, &str)],
    clear_contents: bool,
) -> Result<String, DomError> {
    let opening = scan_opening_tag(markup)?;
    let mut injected = String::with_capacity(markup.len() + attrs.len() * 24);
    let attrs_end = if opening.self_closing { opening.open_end - 1 } else { opening.open_end };
    injected.push_str(&markup[opening.start..attrs_end]);
    for (name, value) in attrs {
        injected.push(' ');
        injected.push_str(name);
        if !value.is_empty() {
            injected.push_str("=\"");
            injected.push_str(&escape_attr(value));
            injected.push('"');
        }
    }
    if clear_contents {
        if is_void_tag(&opening.tag) || opening.self_closing {
            injected.push_str(&markup[attrs_end..=opening.open_end]);
        } else {
            injected.push('>');
            injected.push_str("</");
            injected.push_str(&opening.tag);
            injected.push('>');
        }
        return Ok(injected);
    }
    injected.push_str(&markup[attrs_end..]);
    Ok(injected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Document;

    fn roundtrip(markup: &str) -> String {
        let doc = Document::from_html(markup).unwrap();
        doc.inner_html(doc.root())
    }

    #[test]
    fn parses_nested_elements() {
        let html = r#"<div id="a"><span class="x">hi</span> there</div>"#;
        assert_eq!(roundtrip(html), html);
    }

    #[test]
    fn void_and_boolean_attributes() {
        let doc = Document::from_html(r#"<input type="text" disabled value="a">"#).unwrap();
        let input = doc.children(doc.root())[0];
        assert_eq!(doc.attr(input, "disabled"), Some(""));
        assert_eq!(doc.attr(input, "value"), Some("a"));
        assert!(doc.children(input).is_empty());
    }

    #[test]
    fn comments_and_doctype_dropped() {
        assert_eq!(
            roundtrip("<!DOCTYPE html><!-- note --><p>x</p>"),
            "<p>x</p>"
        );
    }

    #[test]
    fn entities_decode_and_reescape() {
        let doc = Document::from_html("<p>a &amp; b &lt;c&gt; &#34;</p>").unwrap();
        let p = doc.children(doc.root())[0];
        assert_eq!(doc.text(doc.children(p)[0]), Some("a & b <c> \""));
        assert_eq!(doc.inner_html(p), "a &amp; b &lt;c&gt; \"");
    }

    #[test]
    fn mismatched_close_is_malformed() {
        assert!(matches!(
            Document::from_html("<div><span></div>"),
            Err(DomError::MalformedMarkup(_))
        ));
    }

    #[test]
    fn unparsable_root_tag_is_malformed() {
        assert!(matches!(leading_tag("just text"), Err(DomError::MalformedMarkup(_))));
        assert!(matches!(leading_tag("< div>"), Err(DomError::MalformedMarkup(_))));
    }

    #[test]
    fn inject_attrs_into_root() {
        let out = inject_root_attrs(
            r#"<div class="a > b">inner</div>"#,
            &[("data-live-id", "m1-v")],
            false,
        )
        .unwrap();
        assert_eq!(out, r#"<div class="a > b" data-live-id="m1-v">inner</div>"#);
    }

    #[test]
    fn inject_attrs_clearing_contents() {
        let out = inject_root_attrs(
            "<section><p>deep</p></section> trailing",
            &[("data-live-skip", ""), ("data-live-id", "m2-v")],
            true,
        )
        .unwrap();
        assert_eq!(out, r#"<section data-live-skip data-live-id="m2-v"></section>"#);
    }

    #[test]
    fn inject_attrs_skips_leading_comment() {
        let out = inject_root_attrs("<!-- c --><br/>", &[("data-live-id", "m3-v")], false).unwrap();
        assert_eq!(out, r#"<br data-live-id="m3-v"/>"#);
    }
}
