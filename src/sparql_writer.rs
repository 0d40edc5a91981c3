use crate::buffer::RdfSource;
use crate::error::TemplateError;
use crate::events::{RDF_TYPE, RdfEvent, TriplePattern};

/// Pretty-prints a SPARQL syntax-event stream to query text.
///
/// Pure serializer: no validation happens here, a malformed event
/// sequence serializes to malformed SPARQL.
#[derive(Debug, Default)]
pub struct SparqlWriter {
    out: String,
    indent: usize,
    prologue: Vec<String>,
    prologue_flushed: bool,
    filtering: bool,
    in_builtin: bool,
    first_expression: bool,
}

impl SparqlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains a syntax-event source into query text.
    pub fn write(source: &mut impl RdfSource) -> Result<String, TemplateError> {
        let mut writer = Self::new();
        while let Some(event) = source.next()? {
            writer.event(&event);
        }
        Ok(writer.finish())
    }

    pub fn event(&mut self, event: &RdfEvent) {
        match event {
            RdfEvent::StartDocument | RdfEvent::EndDocument => {}
            RdfEvent::StartSubject(_) | RdfEvent::EndSubject(_) => {}
            RdfEvent::Base(base) => self.prologue.push(format!("BASE <{base}>")),
            RdfEvent::Namespace { prefix, uri } => {
                self.prologue.push(format!("PREFIX {prefix}: <{uri}>"));
            }
            RdfEvent::StartConstruct => {
                self.flush_prologue();
                self.line("CONSTRUCT {");
                self.indent += 1;
            }
            RdfEvent::EndConstruct => {
                self.indent -= 1;
                self.line("}");
            }
            RdfEvent::Ask => {
                self.flush_prologue();
                self.line("ASK");
            }
            RdfEvent::Select(vars) => {
                self.flush_prologue();
                if vars.is_empty() {
                    self.line("SELECT *");
                } else {
                    let vars = vars
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    self.line(&format!("SELECT {vars}"));
                }
            }
            RdfEvent::StartWhere => {
                self.flush_prologue();
                self.line("WHERE {");
                self.indent += 1;
            }
            RdfEvent::EndWhere => {
                self.end_filter();
                self.indent -= 1;
                self.line("}");
            }
            RdfEvent::Triple(pattern) | RdfEvent::TriplePattern(pattern) => {
                self.end_filter();
                self.pattern(pattern);
            }
            RdfEvent::StartGraph(graph) => {
                self.line(&format!("GRAPH {graph} {{"));
                self.indent += 1;
            }
            RdfEvent::EndGraph(_) => {
                self.indent -= 1;
                self.line("}");
            }
            RdfEvent::StartOptional => {
                self.end_filter();
                self.line("OPTIONAL {");
                self.indent += 1;
            }
            RdfEvent::EndOptional => {
                self.indent -= 1;
                self.line("}");
            }
            RdfEvent::StartGroup => {
                self.end_filter();
                self.line("{");
                self.indent += 1;
            }
            RdfEvent::EndGroup => {
                self.indent -= 1;
                self.line("}");
            }
            RdfEvent::Union => self.line("UNION"),
            RdfEvent::StartFilter => {
                if self.filtering {
                    // Consecutive filters conjoin on one line.
                    self.out.push_str(" && ");
                } else {
                    self.push_indent();
                    self.out.push_str("FILTER (");
                    self.filtering = true;
                }
            }
            RdfEvent::EndFilter => {}
            RdfEvent::StartBuiltInCall(name) => {
                self.out.push_str(name);
                self.out.push('(');
                self.in_builtin = true;
                self.first_expression = true;
            }
            RdfEvent::EndBuiltInCall => {
                self.out.push(')');
                self.in_builtin = false;
            }
            RdfEvent::Expression(term) => {
                if self.in_builtin && !self.first_expression {
                    self.out.push_str(", ");
                }
                self.first_expression = false;
                self.out.push_str(&term.to_string());
            }
            RdfEvent::OrderBy(vars) => {
                let vars = vars
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.line(&format!("ORDER BY {vars}"));
            }
        }
    }

    pub fn finish(mut self) -> String {
        self.end_filter();
        self.out
    }

    fn pattern(&mut self, pattern: &TriplePattern) {
        let predicate = match &pattern.predicate {
            term if term.iri_str() == Some(RDF_TYPE) => "a".to_string(),
            term => term.to_string(),
        };
        self.line(&format!(
            "{} {} {} .",
            pattern.subject, predicate, pattern.object
        ));
    }

    fn flush_prologue(&mut self) {
        if self.prologue_flushed {
            return;
        }
        self.prologue_flushed = true;
        for line in std::mem::take(&mut self.prologue) {
            self.out.push_str(&line);
            self.out.push('\n');
        }
    }

    fn end_filter(&mut self) {
        if self.filtering {
            self.out.push_str(")\n");
            self.filtering = false;
        }
    }

    fn push_indent(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
    }

    fn line(&mut self, text: &str) {
        self.push_indent();
        self.out.push_str(text);
        self.out.push('\n');
    }
}
