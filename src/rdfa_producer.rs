use crate::buffer::{BufferedXmlReader, XmlSource};
use crate::error::TemplateError;
use crate::events::{Element, XmlEvent};
use crate::rdfa_reader::BINDING_ATTRIBUTES;
use crate::service::BindingRow;
use oxigraph::model::Term;
use regex::Regex;
use std::collections::{HashMap, VecDeque};

/// Per-element binder context. Assignment maps are copied, not shared,
/// when pushed to a child; `mark` is the replay offset of the element's
/// start tag in the buffered template stream.
#[derive(Debug)]
struct Context {
    path: String,
    position: usize,
    assignments: HashMap<String, Term>,
    branch: bool,
    skip: bool,
    mark: usize,
    ns: HashMap<String, String>,
}

impl Context {
    fn root() -> Self {
        Self {
            path: String::new(),
            position: 0,
            assignments: HashMap::new(),
            branch: false,
            skip: false,
            mark: 0,
            ns: HashMap::new(),
        }
    }
}

/// Walks the buffered template in lock-step with an ordered result-row
/// stream, deciding per element whether to emit, skip, or repeat markup.
///
/// An element is a branch point when its path is the origin of some
/// variable or when a binding attribute holds a bare `?var`. A branch
/// that cannot be grounded against the current row is skipped whole; a
/// branch whose subtree has been emitted is re-entered (cursor rewound
/// to its start mark) while further rows disagree with its assignments,
/// which is what repeats markup once per solution.
pub struct RdfaProducer<S: XmlSource> {
    xml: BufferedXmlReader<S>,
    rows: Vec<BindingRow>,
    row: usize,
    origins: HashMap<String, String>,
    store_namespaces: Vec<(String, String)>,
    stack: Vec<Context>,
    pending: VecDeque<XmlEvent>,
    inline_var: Regex,
    datatype: Regex,
    synth_seq: usize,
    done: bool,
}

impl<S: XmlSource> RdfaProducer<S> {
    pub fn new(
        xml: BufferedXmlReader<S>,
        rows: Vec<BindingRow>,
        origins: &HashMap<String, String>,
        store_namespaces: Vec<(String, String)>,
    ) -> Self {
        Self {
            xml,
            rows,
            row: 0,
            origins: origins.clone(),
            store_namespaces,
            stack: vec![Context::root()],
            pending: VecDeque::new(),
            inline_var: Regex::new(r"\{\?([\p{L}\p{N}_]+)\}").unwrap(),
            // Datatype of a literal, from its serialized form.
            datatype: Regex::new(r#"\^\^<([^>]+)>$"#).unwrap(),
            synth_seq: 0,
            done: false,
        }
    }

    pub fn next(&mut self) -> Result<Option<XmlEvent>, TemplateError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            let Some(event) = self.xml.next()? else {
                self.done = true;
                continue;
            };
            match event {
                XmlEvent::StartDocument => self.pending.push_back(XmlEvent::StartDocument),
                XmlEvent::EndDocument => {
                    self.pending.push_back(XmlEvent::EndDocument);
                    self.done = true;
                }
                XmlEvent::StartElement(element) => self.start_element(element)?,
                XmlEvent::EndElement(name) => self.end_element(name)?,
                XmlEvent::Characters(text) => self.characters(text),
                XmlEvent::Comment(text) => {
                    if !self.skipping() {
                        self.pending.push_back(XmlEvent::Comment(text));
                    }
                }
            }
        }
    }

    pub fn close(&mut self) -> Result<(), TemplateError> {
        self.pending.clear();
        self.done = true;
        self.xml.close()
    }

    fn skipping(&self) -> bool {
        self.stack.last().is_some_and(|c| c.skip)
    }

    fn current_row(&self) -> Option<&BindingRow> {
        self.rows.get(self.row)
    }

    fn start_element(&mut self, element: Element) -> Result<(), TemplateError> {
        // The start tag sits one behind the cursor that just consumed it.
        let mark = self.xml.mark() - 1;
        let parent = self.stack.last_mut().expect("root context");
        parent.position += 1;
        let path = format!("{}/{}", parent.path, parent.position);
        let mut ns = parent.ns.clone();
        for (prefix, uri) in &element.namespaces {
            ns.insert(prefix.clone(), uri.clone());
        }
        let mut context = Context {
            path: path.clone(),
            position: 0,
            assignments: parent.assignments.clone(),
            branch: false,
            skip: parent.skip,
            mark,
            ns,
        };
        if context.skip {
            self.stack.push(context);
            return Ok(());
        }

        context.branch = self.is_branch(&element, &path);
        if context.branch {
            match self.current_row().cloned() {
                None => context.skip = true,
                Some(row) => {
                    if !consistent(&row, &context.assignments) {
                        context.skip = true;
                    } else {
                        self.assign(&mut context, &row);
                        if self.row_consumed(&context, &row) {
                            self.row += 1;
                        }
                        if !self.grounded(&context) || self.hanging_rel(&element, &context) {
                            context.skip = true;
                        }
                    }
                }
            }

            #[cfg(debug_assertions)]
            println!(
                "[RdfaProducer] {} at {}: row {}",
                if context.skip { "skip" } else { "branch" },
                context.path,
                self.row
            );
        }

        if !context.skip {
            let element = self.bind_element(element, &context)?;
            self.pending.push_back(XmlEvent::StartElement(element));
        }
        self.stack.push(context);
        Ok(())
    }

    fn end_element(&mut self, name: String) -> Result<(), TemplateError> {
        let context = self
            .stack
            .pop()
            .ok_or_else(|| TemplateError::syntax("unbalanced template markup"))?;
        if !context.skip {
            self.pending.push_back(XmlEvent::EndElement(name));
        }
        // A finished branch is retried against the next row while that
        // row disagrees with what this pass bound. Rewinding re-enters
        // the same template element, repeating its markup.
        if context.branch && !context.skip {
            if let Some(row) = self.current_row() {
                if !consistent(row, &context.assignments) {
                    self.xml.reset(context.mark)?;
                    if let Some(parent) = self.stack.last_mut() {
                        parent.position -= 1;
                    }
                }
            }
        }
        Ok(())
    }

    fn characters(&mut self, text: String) {
        if self.skipping() {
            return;
        }
        let assignments = &self.stack.last().expect("root context").assignments;
        let substituted = self
            .inline_var
            .replace_all(&text, |captures: &regex::Captures<'_>| {
                match assignments.get(&captures[1]) {
                    Some(term) => lexical(term),
                    // Unresolved variables stay as static text.
                    None => captures[0].to_string(),
                }
            })
            .into_owned();
        self.pending.push_back(XmlEvent::Characters(substituted));
    }

    /// A branch point: the element's path is a variable's home, or a
    /// binding attribute holds a bare variable.
    fn is_branch(&self, element: &Element, path: &str) -> bool {
        self.origins.values().any(|origin| origin == path)
            || BINDING_ATTRIBUTES
                .iter()
                .any(|name| element.attr(name).is_some_and(|v| v.starts_with('?')))
    }

    /// Merges every binding whose origin is this element's path.
    fn assign(&self, context: &mut Context, row: &BindingRow) {
        for (variable, origin) in &self.origins {
            if origin == &context.path {
                if let Some(term) = row.get(variable) {
                    context.assignments.insert(variable.clone(), term.clone());
                }
            }
        }
    }

    /// True when nothing in the row remains for this or a later branch.
    fn row_consumed(&self, context: &Context, row: &BindingRow) -> bool {
        row.keys().all(|variable| {
            context.assignments.contains_key(variable) || !self.origins.contains_key(variable)
        })
    }

    /// Every variable whose home is exactly this path must be bound.
    fn grounded(&self, context: &Context) -> bool {
        self.origins
            .iter()
            .filter(|(_, origin)| *origin == &context.path)
            .all(|(variable, _)| context.assignments.contains_key(variable))
    }

    /// A `rel`/`rev` with no object here needs a completing binding in
    /// some descendant branch.
    fn hanging_rel(&self, element: &Element, context: &Context) -> bool {
        if element.attr("rel").is_none() && element.attr("rev").is_none() {
            return false;
        }
        if element.attr("resource").is_some()
            || element.attr("href").is_some()
            || element.attr("src").is_some()
        {
            return false;
        }
        let prefix = format!("{}/", context.path);
        let has_completion = self.origins.iter().any(|(variable, origin)| {
            origin.starts_with(&prefix)
                && self
                    .current_row()
                    .is_some_and(|row| row.contains_key(variable))
        });
        !has_completion
    }

    /// Substitutes bound values into the element's attributes and
    /// synthesizes `datatype`/`content` metadata implicit in the data.
    fn bind_element(
        &mut self,
        mut element: Element,
        context: &Context,
    ) -> Result<Element, TemplateError> {
        let mut content_term: Option<Term> = None;
        for attr in &mut element.attributes {
            if let Some(name) = attr.value.strip_prefix('?') {
                let Some(term) = context.assignments.get(name) else {
                    continue;
                };
                attr.value = match attr.name.as_str() {
                    "about" | "resource" | "href" | "src" => reference_form(term),
                    "property" | "rel" | "rev" | "typeof" => {
                        curie_form(term, &context.ns).unwrap_or_else(|| reference_form(term))
                    }
                    _ => lexical(term),
                };
                if attr.name == "content" {
                    content_term = Some(term.clone());
                }
            } else if self.inline_var.is_match(&attr.value) {
                let assignments = &context.assignments;
                if attr.name == "content" {
                    if let Some(captures) = self.inline_var.captures(&attr.value) {
                        content_term = assignments.get(&captures[1]).cloned();
                    }
                }
                attr.value = self
                    .inline_var
                    .replace_all(&attr.value, |captures: &regex::Captures<'_>| {
                        match assignments.get(&captures[1]) {
                            Some(term) => lexical(term),
                            None => captures[0].to_string(),
                        }
                    })
                    .into_owned();
            }
        }

        if element.attr("property").is_some() {
            if content_term.is_none() && element.attr("content").is_none() {
                // No content and an empty body: surface the bound
                // literal as a content attribute.
                if self.body_is_empty()? {
                    content_term = self.path_literal(context);
                    if let Some(term) = &content_term {
                        element.set_attr("content", lexical(term));
                    }
                }
            }
            if let Some(term) = &content_term {
                if element.attr("datatype").is_none() {
                    self.synthesize_datatype(&mut element, context, term);
                }
            }
        }
        Ok(element)
    }

    /// A bound literal whose home is this element, for content
    /// synthesis.
    fn path_literal(&self, context: &Context) -> Option<Term> {
        self.origins
            .iter()
            .filter(|(_, origin)| *origin == &context.path)
            .filter_map(|(variable, _)| context.assignments.get(variable))
            .find(|term| matches!(term, Term::Literal(_)))
            .cloned()
    }

    /// Derives a datatype CURIE from the literal's serialized form and
    /// attaches it, declaring a placeholder namespace when no known
    /// prefix covers it.
    fn synthesize_datatype(&mut self, element: &mut Element, context: &Context, term: &Term) {
        let serialized = term.to_string();
        let Some(captures) = self.datatype.captures(&serialized) else {
            return;
        };
        let datatype = captures[1].to_string();
        if let Some(curie) = curie_for_iri(&datatype, &context.ns) {
            element.set_attr("datatype", curie);
            return;
        }
        for (prefix, uri) in &self.store_namespaces {
            if let Some(local) = datatype.strip_prefix(uri.as_str()) {
                element.namespaces.push((prefix.clone(), uri.clone()));
                element.set_attr("datatype", format!("{prefix}:{local}"));
                return;
            }
        }
        let split = datatype
            .rfind(['#', '/'])
            .map(|idx| idx + 1)
            .unwrap_or(datatype.len());
        self.synth_seq += 1;
        let prefix = format!("ns{}", self.synth_seq);
        element
            .namespaces
            .push((prefix.clone(), datatype[..split].to_string()));
        element.set_attr("datatype", format!("{prefix}:{}", &datatype[split..]));
    }

    /// Looks ahead to the matching end tag without consuming anything.
    fn body_is_empty(&mut self) -> Result<bool, TemplateError> {
        let mark = self.xml.mark();
        let mut empty = true;
        loop {
            match self.xml.next()? {
                Some(XmlEvent::EndElement(_)) | None => break,
                Some(XmlEvent::Characters(text)) if text.trim().is_empty() => continue,
                Some(_) => {
                    empty = false;
                    break;
                }
            }
        }
        self.xml.reset(mark)?;
        Ok(empty)
    }
}

fn consistent(row: &BindingRow, assignments: &HashMap<String, Term>) -> bool {
    assignments
        .iter()
        .all(|(name, term)| row.get(name).is_none_or(|bound| bound == term))
}

fn lexical(term: &Term) -> String {
    match term {
        Term::Literal(literal) => literal.value().to_string(),
        Term::NamedNode(node) => node.as_str().to_string(),
        other => other.to_string(),
    }
}

fn reference_form(term: &Term) -> String {
    match term {
        Term::NamedNode(node) => node.as_str().to_string(),
        Term::Literal(literal) => literal.value().to_string(),
        other => other.to_string(),
    }
}

fn curie_form(term: &Term, ns: &HashMap<String, String>) -> Option<String> {
    match term {
        Term::NamedNode(node) => curie_for_iri(node.as_str(), ns),
        _ => None,
    }
}

fn curie_for_iri(iri: &str, ns: &HashMap<String, String>) -> Option<String> {
    for (prefix, uri) in ns {
        if prefix.is_empty() {
            continue;
        }
        if let Some(local) = iri.strip_prefix(uri.as_str()) {
            if !local.is_empty() && !local.contains(['/', '#']) {
                return Some(format!("{prefix}:{local}"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferedXmlReader;
    use crate::xml_source::TemplateSource;
    use crate::xml_writer::XmlWriter;
    use oxigraph::model::{Literal, NamedNode};

    fn named(iri: &str) -> Term {
        Term::from(NamedNode::new(iri).unwrap())
    }

    fn literal(value: &str) -> Term {
        Term::from(Literal::new_simple_literal(value))
    }

    fn render(
        template: &str,
        rows: Vec<Vec<(&str, Term)>>,
        origins: Vec<(&str, &str)>,
    ) -> String {
        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect::<BindingRow>()
            })
            .collect();
        let origins = origins
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        let xml = BufferedXmlReader::new(TemplateSource::from_str(template));
        let mut producer = RdfaProducer::new(xml, rows, &origins, Vec::new());
        let mut writer = XmlWriter::new();
        while let Some(event) = producer.next().unwrap() {
            writer.event(&event);
        }
        writer.finish()
    }

    #[test]
    fn test_two_rows_repeat_the_branch() {
        let out = render(
            r#"<div about="?s"><span property="?p" content="{?v}"/></div>"#,
            vec![
                vec![
                    ("s", named("http://example.org/a")),
                    ("p", named("http://example.org/name")),
                    ("v", literal("Ann")),
                ],
                vec![
                    ("s", named("http://example.org/b")),
                    ("p", named("http://example.org/name")),
                    ("v", literal("Bob")),
                ],
            ],
            vec![("s", "/1"), ("p", "/1/1"), ("v", "/1/1")],
        );
        assert_eq!(out.matches("<div").count(), 2);
        assert!(out.contains("Ann"));
        assert!(out.contains("Bob"));
        assert!(out.contains("about=\"http://example.org/a\""));
        assert!(out.contains("about=\"http://example.org/b\""));
    }

    #[test]
    fn test_ungrounded_branch_is_skipped() {
        let out = render(
            r#"<p>static</p><div about="?s">bound</div>"#,
            vec![vec![("other", literal("x"))]],
            vec![("s", "/2")],
        );
        assert!(out.contains("static"));
        assert!(!out.contains("bound"));
    }

    #[test]
    fn test_unresolved_inline_variable_is_static_text() {
        let out = render("<p>{?missing}</p>", vec![], vec![]);
        assert_eq!(out, "<p>{?missing}</p>");
    }

    #[test]
    fn test_no_rows_skips_all_branches() {
        let out = render(
            r#"<div about="?s">x</div>"#,
            vec![],
            vec![("s", "/1")],
        );
        assert_eq!(out, "");
    }

    #[test]
    fn test_inconsistent_row_reenters_subtree() {
        // Two rows disagree on ?v, whose home is the inner element: the
        // subtree must be re-entered, never emitted with mixed values.
        let out = render(
            r#"<div about="?s"><span property="?p" content="{?v}"/></div>"#,
            vec![
                vec![
                    ("s", named("http://example.org/a")),
                    ("p", named("http://example.org/name")),
                    ("v", literal("one")),
                ],
                vec![
                    ("s", named("http://example.org/a")),
                    ("p", named("http://example.org/name")),
                    ("v", literal("two")),
                ],
            ],
            vec![("s", "/1"), ("p", "/1/1"), ("v", "/1/1")],
        );
        assert_eq!(out.matches("<span").count(), 2);
        assert!(out.contains("one"));
        assert!(out.contains("two"));
    }

    #[test]
    fn test_datatype_synthesis_from_typed_literal() {
        let date = Term::from(Literal::new_typed_literal(
            "2024-05-01",
            NamedNode::new("http://www.w3.org/2001/XMLSchema#date").unwrap(),
        ));
        let out = render(
            r#"<div xmlns:xsd="http://www.w3.org/2001/XMLSchema#" about="?s"><span property="?p" content="{?v}"/></div>"#,
            vec![vec![
                ("s", named("http://example.org/a")),
                ("p", named("http://example.org/born")),
                ("v", date),
            ]],
            vec![("s", "/1"), ("p", "/1/1"), ("v", "/1/1")],
        );
        assert!(out.contains("datatype=\"xsd:date\""));
        assert!(out.contains("content=\"2024-05-01\""));
    }

    #[test]
    fn test_placeholder_namespace_for_unknown_datatype() {
        let typed = Term::from(Literal::new_typed_literal(
            "42",
            NamedNode::new("http://types.example.org/vocab#answer").unwrap(),
        ));
        let out = render(
            r#"<div about="?s"><span property="?p" content="{?v}"/></div>"#,
            vec![vec![
                ("s", named("http://example.org/a")),
                ("p", named("http://example.org/answer")),
                ("v", typed),
            ]],
            vec![("s", "/1"), ("p", "/1/1"), ("v", "/1/1")],
        );
        assert!(out.contains("xmlns:ns1=\"http://types.example.org/vocab#\""));
        assert!(out.contains("datatype=\"ns1:answer\""));
    }

    #[test]
    fn test_content_synthesis_for_empty_body() {
        let out = render(
            r#"<div xmlns:ex="http://example.org/" about="?s"><span property="ex:name"></span></div>"#,
            vec![vec![
                ("s", named("http://example.org/a")),
                ("v", literal("Ann")),
            ]],
            vec![("s", "/1"), ("v", "/1/1")],
        );
        assert!(out.contains("content=\"Ann\""));
    }
}
