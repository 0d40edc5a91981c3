use crate::buffer::XmlSource;
use crate::error::TemplateError;
use crate::events::{Attribute, Element, XmlEvent};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::VecDeque;

/// Template source backed by quick-xml.
///
/// Emits one `StartDocument`/`EndDocument` pair around the element
/// events. Empty-element tags are expanded into a start/end pair so
/// downstream consumers see a single element grammar.
pub struct TemplateSource<'a> {
    reader: Reader<&'a [u8]>,
    pending: VecDeque<XmlEvent>,
    started: bool,
    finished: bool,
}

impl<'a> TemplateSource<'a> {
    pub fn from_str(template: &'a str) -> Self {
        let mut reader = Reader::from_str(template);
        reader.config_mut().trim_text(false);
        Self {
            reader,
            pending: VecDeque::new(),
            started: false,
            finished: false,
        }
    }

    fn element(&self, tag: &BytesStart<'_>) -> Result<Element, TemplateError> {
        let name = String::from_utf8(tag.name().as_ref().to_vec())
            .map_err(|e| TemplateError::syntax(format!("non UTF-8 element name: {e}")))?;
        let mut attributes = Vec::new();
        let mut namespaces = Vec::new();
        for attr in tag.attributes() {
            let attr = attr.map_err(|e| TemplateError::syntax(format!("bad attribute: {e}")))?;
            let key = String::from_utf8(attr.key.as_ref().to_vec())
                .map_err(|e| TemplateError::syntax(format!("non UTF-8 attribute name: {e}")))?;
            let value = attr
                .unescape_value()
                .map_err(|e| TemplateError::syntax(format!("bad attribute value: {e}")))?
                .into_owned();
            if key == "xmlns" {
                namespaces.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                namespaces.push((prefix.to_string(), value));
            } else {
                attributes.push(Attribute { name: key, value });
            }
        }
        Ok(Element {
            name,
            attributes,
            namespaces,
        })
    }
}

impl XmlSource for TemplateSource<'_> {
    fn next(&mut self) -> Result<Option<XmlEvent>, TemplateError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if !self.started {
            self.started = true;
            return Ok(Some(XmlEvent::StartDocument));
        }
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.reader.read_event()? {
                Event::Start(tag) => {
                    return Ok(Some(XmlEvent::StartElement(self.element(&tag)?)));
                }
                Event::Empty(tag) => {
                    let element = self.element(&tag)?;
                    let name = element.name.clone();
                    self.pending.push_back(XmlEvent::EndElement(name));
                    return Ok(Some(XmlEvent::StartElement(element)));
                }
                Event::End(tag) => {
                    let name = String::from_utf8(tag.name().as_ref().to_vec())
                        .map_err(|e| TemplateError::syntax(format!("non UTF-8 tag name: {e}")))?;
                    return Ok(Some(XmlEvent::EndElement(name)));
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| TemplateError::syntax(format!("bad character data: {e}")))?;
                    return Ok(Some(XmlEvent::Characters(text.into_owned())));
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| TemplateError::syntax(format!("non UTF-8 CDATA: {e}")))?;
                    return Ok(Some(XmlEvent::Characters(text)));
                }
                Event::Comment(comment) => {
                    let text = comment
                        .unescape()
                        .map_err(|e| TemplateError::syntax(format!("bad comment: {e}")))?;
                    return Ok(Some(XmlEvent::Comment(text.into_owned())));
                }
                Event::Decl(_) | Event::DocType(_) | Event::PI(_) => {}
                Event::Eof => {
                    self.finished = true;
                    return Ok(Some(XmlEvent::EndDocument));
                }
            }
        }
    }
}
