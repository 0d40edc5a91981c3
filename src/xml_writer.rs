use crate::events::{Element, XmlEvent};
use quick_xml::escape::escape;

/// Serializes a produced XML event stream back to markup text.
#[derive(Debug, Default)]
pub struct XmlWriter {
    out: String,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(&mut self, event: &XmlEvent) {
        match event {
            XmlEvent::StartDocument | XmlEvent::EndDocument => {}
            XmlEvent::StartElement(element) => self.start_element(element),
            XmlEvent::EndElement(name) => {
                self.out.push_str("</");
                self.out.push_str(name);
                self.out.push('>');
            }
            XmlEvent::Characters(text) => self.out.push_str(&escape(text.as_str())),
            XmlEvent::Comment(text) => {
                self.out.push_str("<!--");
                self.out.push_str(text);
                self.out.push_str("-->");
            }
        }
    }

    fn start_element(&mut self, element: &Element) {
        self.out.push('<');
        self.out.push_str(&element.name);
        for (prefix, uri) in &element.namespaces {
            if prefix.is_empty() {
                self.out.push_str(" xmlns=\"");
            } else {
                self.out.push_str(" xmlns:");
                self.out.push_str(prefix);
                self.out.push_str("=\"");
            }
            self.out.push_str(&escape(uri.as_str()));
            self.out.push('"');
        }
        for attr in &element.attributes {
            self.out.push(' ');
            self.out.push_str(&attr.name);
            self.out.push_str("=\"");
            self.out.push_str(&escape(attr.value.as_str()));
            self.out.push('"');
        }
        self.out.push('>');
    }

    pub fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Attribute;

    #[test]
    fn test_round_trips_an_element() {
        let mut writer = XmlWriter::new();
        writer.event(&XmlEvent::StartElement(Element {
            name: "div".to_string(),
            attributes: vec![Attribute {
                name: "about".to_string(),
                value: "http://example.org/a".to_string(),
            }],
            namespaces: vec![("ex".to_string(), "http://example.org/".to_string())],
        }));
        writer.event(&XmlEvent::Characters("a & b".to_string()));
        writer.event(&XmlEvent::EndElement("div".to_string()));
        assert_eq!(
            writer.finish(),
            "<div xmlns:ex=\"http://example.org/\" about=\"http://example.org/a\">a &amp; b</div>"
        );
    }
}
