use crate::buffer::{BufferedRdfReader, RdfSource};
use crate::error::TemplateError;
use crate::events::{RdfEvent, TermFactory, VarOrTerm};
use std::collections::VecDeque;

/// Wraps a flat subject/triple event stream with `Optional` pairs.
///
/// A subject block whose subject is a template variable opens an
/// optional region; a triple whose partner term is a variable is
/// individually wrapped unless it links to an immediately following
/// nested subject block, in which case optionality is deferred to that
/// block's own wrapper.
pub struct GraphPatternReader<'f, S: RdfSource> {
    input: BufferedRdfReader<S>,
    factory: &'f mut TermFactory,
    pending: VecDeque<RdfEvent>,
    depth: usize,
    open_optionals: Vec<usize>,
    subject_stack: Vec<VarOrTerm>,
}

impl<'f, S: RdfSource> GraphPatternReader<'f, S> {
    pub fn new(input: S, factory: &'f mut TermFactory) -> Self {
        Self {
            input: BufferedRdfReader::new(input),
            factory,
            pending: VecDeque::new(),
            depth: 0,
            open_optionals: Vec::new(),
            subject_stack: Vec::new(),
        }
    }

    fn process(&mut self, event: RdfEvent) -> Result<(), TemplateError> {
        match event {
            RdfEvent::StartSubject(subject) => {
                let subject = self.rewrite(subject);
                if subject.is_var() && self.open_optionals.last() != Some(&self.depth) {
                    self.pending.push_back(RdfEvent::StartOptional);
                    self.open_optionals.push(self.depth);
                }
                self.depth += 1;
                self.subject_stack.push(subject.clone());
                self.pending.push_back(RdfEvent::StartSubject(subject));
            }
            RdfEvent::EndSubject(_) => {
                let subject = self
                    .subject_stack
                    .pop()
                    .ok_or_else(|| TemplateError::syntax("unbalanced subject nesting"))?;
                self.depth -= 1;
                self.pending.push_back(RdfEvent::EndSubject(subject));
                if self.open_optionals.last() == Some(&self.depth) {
                    self.open_optionals.pop();
                    self.pending.push_back(RdfEvent::EndOptional);
                }
            }
            RdfEvent::TriplePattern(mut pattern) => {
                pattern.subject = self.rewrite(pattern.subject);
                pattern.object = self.rewrite(pattern.object);
                if pattern.is_optional() {
                    // A linking triple directly followed by its object's
                    // own subject block stays plain; the block carries
                    // the optionality.
                    let nested = matches!(
                        self.input.peek(0)?,
                        Some(RdfEvent::StartSubject(s)) if s == pattern.partner()
                    );
                    if nested {
                        self.pending.push_back(RdfEvent::TriplePattern(pattern));
                    } else {
                        self.pending.push_back(RdfEvent::StartOptional);
                        self.pending.push_back(RdfEvent::TriplePattern(pattern));
                        self.pending.push_back(RdfEvent::EndOptional);
                    }
                } else {
                    self.pending.push_back(RdfEvent::TriplePattern(pattern));
                }
            }
            other => self.pending.push_back(other),
        }
        Ok(())
    }

    /// Empty string literals behave like unbound blanks, not like
    /// literal matches.
    fn rewrite(&mut self, term: VarOrTerm) -> VarOrTerm {
        match &term {
            VarOrTerm::Literal(lit) if lit.value().is_empty() && lit.language().is_none() => {
                self.factory.fresh_blank_var()
            }
            _ => term,
        }
    }
}

impl<S: RdfSource> RdfSource for GraphPatternReader<'_, S> {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let Some(event) = self.input.next()? else {
                return Ok(None);
            };
            self.process(event)?;
        }
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.pending.clear();
        self.input.close()
    }
}
