use crate::buffer::{BufferedXmlReader, XmlSource};
use crate::error::TemplateError;
use crate::events::{
    Element, RDF_TYPE, RdfEvent, TermFactory, TriplePattern, VarOrTerm, XmlEvent,
};
use oxigraph::model::{Literal, NamedNode};
use regex::Regex;
use std::collections::HashMap;

/// RDFa attributes that bind in object position when they hold a bare
/// `?var` value.
pub const BINDING_ATTRIBUTES: &[&str] = &["about", "resource", "href", "src", "typeof", "content"];

/// The compiled shape of one template: its flat RDF event stream plus
/// the metadata the rest of the pipeline keys on.
#[derive(Debug, Clone, Default)]
pub struct TemplateModel {
    pub events: Vec<RdfEvent>,
    /// Variable name to the tree path of the element that first
    /// introduced it. The binder's grounding checks rest on this map.
    pub origins: HashMap<String, String>,
    pub namespaces: Vec<(String, String)>,
    pub base: Option<String>,
}

struct Frame {
    subject: VarOrTerm,
    opened_subject: bool,
    /// `rel`/`rev` waiting for a descendant subject to complete it.
    hanging: Option<(VarOrTerm, bool)>,
    pending_property: Option<VarOrTerm>,
    property_done: bool,
    position: usize,
    path: String,
    ns: HashMap<String, String>,
}

/// Walks the buffered template markup once and extracts the flat RDF
/// event stream: subject nesting from `about`/`typeof`, linking triples
/// from `rel`/`rev`, literal triples from `property`.
pub struct RdfaReader<'a> {
    factory: &'a mut TermFactory,
    inline_var: Regex,
    model: TemplateModel,
    stack: Vec<Frame>,
}

impl<'a> RdfaReader<'a> {
    pub fn read<S: XmlSource>(
        xml: &mut BufferedXmlReader<S>,
        factory: &'a mut TermFactory,
        base: Option<&str>,
    ) -> Result<TemplateModel, TemplateError> {
        let mut reader = RdfaReader {
            factory,
            inline_var: Regex::new(r"^\{\?([\p{L}\p{N}_]+)\}$").unwrap(),
            model: TemplateModel {
                base: base.map(str::to_string),
                ..Default::default()
            },
            stack: Vec::new(),
        };
        reader.run(xml)?;
        Ok(reader.model)
    }

    fn run<S: XmlSource>(&mut self, xml: &mut BufferedXmlReader<S>) -> Result<(), TemplateError> {
        self.model.events.push(RdfEvent::StartDocument);
        if let Some(base) = self.model.base.clone() {
            self.model.events.push(RdfEvent::Base(base));
        }
        let root_subject = match self.model.base.as_deref() {
            Some(base) => self.factory.reference(None, base)?,
            None => self.factory.fresh_blank_var(),
        };
        self.stack.push(Frame {
            subject: root_subject,
            opened_subject: false,
            hanging: None,
            pending_property: None,
            property_done: false,
            position: 0,
            path: String::new(),
            ns: HashMap::new(),
        });
        while let Some(event) = xml.next()? {
            match event {
                XmlEvent::StartElement(element) => self.start_element(&element)?,
                XmlEvent::EndElement(_) => self.end_element()?,
                XmlEvent::Characters(text) => self.characters(&text)?,
                XmlEvent::StartDocument | XmlEvent::EndDocument | XmlEvent::Comment(_) => {}
            }
        }
        if self.stack.len() > 1 {
            return Err(TemplateError::syntax("unbalanced template markup"));
        }
        self.model.events.push(RdfEvent::EndDocument);
        Ok(())
    }

    fn start_element(&mut self, element: &Element) -> Result<(), TemplateError> {
        let parent = self.stack.last_mut().expect("root frame");
        parent.position += 1;
        let path = format!("{}/{}", parent.path, parent.position);
        let mut ns = parent.ns.clone();
        let parent_subject = parent.subject.clone();
        let parent_hanging = parent.hanging.clone();
        for (prefix, uri) in &element.namespaces {
            ns.insert(prefix.clone(), uri.clone());
            if !prefix.is_empty()
                && !self
                    .model
                    .namespaces
                    .iter()
                    .any(|(p, u)| p == prefix && u == uri)
            {
                self.model.namespaces.push((prefix.clone(), uri.clone()));
                self.model.events.push(RdfEvent::Namespace {
                    prefix: prefix.clone(),
                    uri: uri.clone(),
                });
            }
        }

        let rel = element.attr("rel");
        let rev = element.attr("rev");
        let object_attr = element
            .attr("resource")
            .or_else(|| element.attr("href"))
            .or_else(|| element.attr("src"));

        let mut frame = Frame {
            subject: parent_subject.clone(),
            opened_subject: false,
            hanging: None,
            pending_property: None,
            property_done: false,
            position: 0,
            path: path.clone(),
            ns: ns.clone(),
        };

        // Which node does this element establish, if any?
        let own_subject = element.attr("about").is_some() || element.attr("typeof").is_some();
        let new_subject = if let Some(about) = element.attr("about") {
            Some(self.object_term(&ns, about, &path)?)
        } else if element.attr("typeof").is_some() {
            Some(self.factory.fresh_blank_var())
        } else if object_attr.is_some() && (rel.is_some() || rev.is_some()) {
            Some(self.object_term(&ns, object_attr.unwrap_or_default(), &path)?)
        } else {
            None
        };

        if let Some(subject) = new_subject {
            // `rel` next to `about` relates the new subject to its
            // descendants, not the new subject to its parent.
            let link = if own_subject {
                parent_hanging
            } else {
                match (rel, rev) {
                    (Some(rel), _) => Some((self.predicate_term(&ns, rel, &path)?, false)),
                    (_, Some(rev)) => Some((self.predicate_term(&ns, rev, &path)?, true)),
                    _ => None,
                }
            };
            if let Some((predicate, inverse)) = link {
                let pattern = if inverse {
                    TriplePattern::inverse(subject.clone(), predicate, parent_subject)
                } else {
                    TriplePattern::new(parent_subject, predicate, subject.clone())
                };
                self.model.events.push(RdfEvent::TriplePattern(pattern));
            }
            self.model.events.push(RdfEvent::StartSubject(subject.clone()));
            frame.subject = subject.clone();
            frame.opened_subject = true;
            if own_subject {
                frame.hanging = match (rel, rev) {
                    (Some(rel), _) => Some((self.predicate_term(&ns, rel, &path)?, false)),
                    (_, Some(rev)) => Some((self.predicate_term(&ns, rev, &path)?, true)),
                    _ => None,
                };
            }
            if let Some(typeof_attr) = element.attr("typeof") {
                for curie in typeof_attr.split_whitespace() {
                    let class = self.object_term(&ns, curie, &path)?;
                    self.model.events.push(RdfEvent::TriplePattern(
                        TriplePattern::new(
                            subject.clone(),
                            VarOrTerm::Iri(NamedNode::new_unchecked(RDF_TYPE)),
                            class,
                        ),
                    ));
                }
            }
        } else if rel.is_some() || rev.is_some() {
            // Object still to come from a descendant.
            frame.hanging = match (rel, rev) {
                (Some(rel), _) => Some((self.predicate_term(&ns, rel, &path)?, false)),
                (_, Some(rev)) => Some((self.predicate_term(&ns, rev, &path)?, true)),
                _ => None,
            };
        }

        if let Some(property) = element.attr("property") {
            let predicate = self.predicate_term(&ns, property, &path)?;
            if let Some(content) = element.attr("content") {
                let object = self.literal_term(content, &path)?;
                self.model.events.push(RdfEvent::TriplePattern(
                    TriplePattern::new(frame.subject.clone(), predicate, object),
                ));
                frame.property_done = true;
            } else {
                frame.pending_property = Some(predicate);
            }
        }

        self.stack.push(frame);
        Ok(())
    }

    fn characters(&mut self, text: &str) -> Result<(), TemplateError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let frame = self.stack.last_mut().expect("root frame");
        let Some(predicate) = frame.pending_property.take() else {
            return Ok(());
        };
        frame.property_done = true;
        let subject = frame.subject.clone();
        let path = frame.path.clone();
        let object = self.literal_term(text.trim(), &path)?;
        self.model
            .events
            .push(RdfEvent::TriplePattern(TriplePattern::new(
                subject, predicate, object,
            )));
        Ok(())
    }

    fn end_element(&mut self) -> Result<(), TemplateError> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| TemplateError::syntax("unbalanced template markup"))?;
        if let Some(predicate) = frame.pending_property {
            // Property element with no body: behaves like an unbound blank.
            self.model
                .events
                .push(RdfEvent::TriplePattern(TriplePattern::new(
                    frame.subject.clone(),
                    predicate,
                    VarOrTerm::Literal(Literal::new_simple_literal("")),
                )));
        }
        if frame.opened_subject {
            self.model.events.push(RdfEvent::EndSubject(frame.subject));
        }
        Ok(())
    }

    /// A subject/object position: variable, CURIE, IRI, or reference.
    fn object_term(
        &mut self,
        ns: &HashMap<String, String>,
        value: &str,
        path: &str,
    ) -> Result<VarOrTerm, TemplateError> {
        if let Some(name) = value.strip_prefix('?') {
            let term = self.factory.reference(None, value)?;
            self.record_origin(name, path);
            return Ok(term);
        }
        if let Some(term) = self.expand_curie(ns, value)? {
            return Ok(term);
        }
        self.factory.reference(self.model.base.as_deref(), value)
    }

    /// A predicate position. Variables are allowed here too.
    fn predicate_term(
        &mut self,
        ns: &HashMap<String, String>,
        value: &str,
        path: &str,
    ) -> Result<VarOrTerm, TemplateError> {
        self.object_term(ns, value, path)
    }

    /// A literal position: `?var`, `{?var}`, or plain text.
    fn literal_term(&mut self, value: &str, path: &str) -> Result<VarOrTerm, TemplateError> {
        if let Some(captures) = self.inline_var.captures(value) {
            let name = captures[1].to_string();
            self.record_origin(&name, path);
            return Ok(VarOrTerm::Var(name));
        }
        if let Some(name) = value.strip_prefix('?') {
            if self.factory.is_varname(name) {
                self.record_origin(name, path);
                return Ok(VarOrTerm::Var(name.to_string()));
            }
        }
        Ok(VarOrTerm::Literal(Literal::new_simple_literal(value)))
    }

    fn expand_curie(
        &self,
        ns: &HashMap<String, String>,
        value: &str,
    ) -> Result<Option<VarOrTerm>, TemplateError> {
        let Some((prefix, suffix)) = value.split_once(':') else {
            return Ok(None);
        };
        let Some(uri) = ns.get(prefix) else {
            return Ok(None);
        };
        let iri = NamedNode::new(format!("{uri}{suffix}"))
            .map_err(|e| TemplateError::syntax(format!("invalid CURIE {value:?}: {e}")))?;
        Ok(Some(VarOrTerm::Curie {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            iri,
        }))
    }

    fn record_origin(&mut self, name: &str, path: &str) {
        self.model
            .origins
            .entry(name.to_string())
            .or_insert_with(|| path.to_string());
    }
}
