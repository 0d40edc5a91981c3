use crate::buffer::{BufferedRdfReader, RdfSource};
use crate::error::TemplateError;
use crate::events::{RdfEvent, TriplePattern};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    Group,
    Optional,
    Block,
}

/// One nesting level of the WHERE clause being produced.
#[derive(Debug)]
struct Level {
    kind: ClauseKind,
    /// True once a UNION has started at this level; later optional
    /// sibling blocks are preceded by the keyword.
    union: bool,
    /// Brackets this level actually emitted.
    grouped: bool,
    optionaled: bool,
    /// Optional triples held back so mandatory ones lead the block.
    deferred: Vec<TriplePattern>,
    /// A subject-level optional wrapper was swallowed on open; its end
    /// marker must be swallowed on close.
    swallow_end: bool,
}

impl Level {
    fn new(kind: ClauseKind) -> Self {
        Self {
            kind,
            union: false,
            grouped: false,
            optionaled: false,
            deferred: Vec::new(),
            swallow_end: false,
        }
    }
}

/// Direct content of a subject block, counted by one bounded lookahead
/// pass before bracket placement commits.
#[derive(Debug, Default, Clone, Copy)]
struct BlockStats {
    mandatory: usize,
    optional: usize,
    nested: usize,
}

impl BlockStats {
    fn all_optional(&self) -> bool {
        self.mandatory == 0 && (self.optional + self.nested) > 0
    }
}

/// Converts the graph-pattern stream into a properly bracketed SPARQL
/// syntax-event stream: redundant brackets are suppressed, mandatory
/// triples lead their block, all-optional subject blocks are wrapped in
/// OPTIONAL (plus a GROUP when not well-joined), and optional sibling
/// subjects at one level are joined by UNION.
pub struct SparqlProducer<S: RdfSource> {
    input: BufferedRdfReader<S>,
    pending: VecDeque<RdfEvent>,
    stack: Vec<Level>,
    last_pattern: Option<TriplePattern>,
    /// Set when a subject-level StartOptional has been consumed and the
    /// next StartSubject owns it.
    subject_optional: bool,
    in_where: bool,
    finished: bool,
}

impl<S: RdfSource> SparqlProducer<S> {
    pub fn new(input: S) -> Self {
        Self {
            input: BufferedRdfReader::new(input),
            pending: VecDeque::new(),
            stack: Vec::new(),
            last_pattern: None,
            subject_optional: false,
            in_where: false,
            finished: false,
        }
    }

    fn process(&mut self, event: RdfEvent) -> Result<(), TemplateError> {
        if !self.in_where {
            if event == RdfEvent::StartWhere {
                self.in_where = true;
                self.pending.push_back(RdfEvent::StartWhere);
                self.stack.push(Level::new(ClauseKind::Group));
            } else {
                self.pending.push_back(event);
            }
            return Ok(());
        }
        match event {
            RdfEvent::EndWhere => {
                while let Some(level) = self.stack.pop() {
                    self.close_level(level);
                }
                self.pending.push_back(RdfEvent::EndWhere);
                self.in_where = false;
            }
            RdfEvent::StartOptional => {
                if matches!(self.input.peek(0)?, Some(RdfEvent::StartSubject(_))) {
                    self.subject_optional = true;
                } else {
                    self.consume_optional_triple()?;
                }
            }
            RdfEvent::EndOptional => {
                // Stray end of an already-swallowed wrapper.
            }
            RdfEvent::TriplePattern(pattern) => self.emit_pattern(pattern),
            RdfEvent::StartSubject(subject) => {
                let stats = self.lookahead_stats()?;
                let is_optional = std::mem::take(&mut self.subject_optional);
                let wrap_optional = is_optional && stats.all_optional();
                let well_joined = stats.mandatory > 0
                    || self
                        .last_pattern
                        .as_ref()
                        .is_some_and(|p| p.shares(&subject));
                let parent_union = self.stack.last().is_some_and(|l| l.union);
                let parent_is_group = self
                    .stack
                    .last()
                    .is_some_and(|l| l.kind == ClauseKind::Group);
                let mut level = Level::new(if wrap_optional {
                    ClauseKind::Optional
                } else {
                    ClauseKind::Block
                });
                level.swallow_end = is_optional;
                if parent_union {
                    // A union has started here; this block is the next arm.
                    self.pending.push_back(RdfEvent::Union);
                    self.pending.push_back(RdfEvent::StartGroup);
                    level.grouped = true;
                } else if wrap_optional {
                    if parent_is_group {
                        if let Some(parent) = self.stack.last_mut() {
                            parent.union = true;
                        }
                    }
                    if !well_joined {
                        self.pending.push_back(RdfEvent::StartGroup);
                        level.grouped = true;
                    }
                }
                if wrap_optional {
                    self.pending.push_back(RdfEvent::StartOptional);
                    level.optionaled = true;
                }
                self.stack.push(level);
            }
            RdfEvent::EndSubject(_) => {
                let swallow_end = self.stack.last().is_some_and(|l| l.swallow_end);
                if let Some(level) = self.stack.pop() {
                    self.close_level(level);
                }
                if swallow_end && matches!(self.input.peek(0)?, Some(RdfEvent::EndOptional)) {
                    // The subject-level wrapper swallowed on open.
                    self.input.next()?;
                }
            }
            other => self.pending.push_back(other),
        }
        Ok(())
    }

    /// A triple-level `OPTIONAL { t }` wrapper: take the pattern, defer
    /// it, and drop the markers. A stream that ends inside the region is
    /// truncated input, not an error; whatever was read is still
    /// deferred so the EOF path can close it.
    fn consume_optional_triple(&mut self) -> Result<(), TemplateError> {
        let pattern = match self.input.next()? {
            Some(RdfEvent::TriplePattern(pattern)) => pattern,
            None => return Ok(()),
            Some(_) => {
                return Err(TemplateError::syntax(
                    "optional region without a triple pattern",
                ));
            }
        };
        match self.input.next()? {
            Some(RdfEvent::EndOptional) | None => {}
            Some(_) => {
                return Err(TemplateError::syntax("unterminated optional region"));
            }
        }
        match self.stack.last_mut() {
            Some(level) => level.deferred.push(pattern),
            None => self.pending.push_back(RdfEvent::TriplePattern(pattern)),
        }
        Ok(())
    }

    fn emit_pattern(&mut self, pattern: TriplePattern) {
        self.last_pattern = Some(pattern.clone());
        self.pending.push_back(RdfEvent::TriplePattern(pattern));
    }

    /// Closes every bracket the level owns, flushing held-back optional
    /// triples first.
    fn close_level(&mut self, level: Level) {
        for pattern in level.deferred {
            if level.optionaled {
                // The whole block is optional; inner wrappers collapse.
                self.last_pattern = Some(pattern.clone());
                self.pending.push_back(RdfEvent::TriplePattern(pattern));
            } else {
                self.pending.push_back(RdfEvent::StartOptional);
                self.last_pattern = Some(pattern.clone());
                self.pending.push_back(RdfEvent::TriplePattern(pattern));
                self.pending.push_back(RdfEvent::EndOptional);
            }
        }
        if level.optionaled {
            self.pending.push_back(RdfEvent::EndOptional);
        }
        if level.grouped {
            self.pending.push_back(RdfEvent::EndGroup);
        }
    }

    /// Counts the direct content of the subject block just opened,
    /// buffering events without consuming them.
    fn lookahead_stats(&mut self) -> Result<BlockStats, TemplateError> {
        let mut stats = BlockStats::default();
        let mut depth = 0usize;
        let mut i = 0usize;
        loop {
            let Some(event) = self.input.peek(i)? else {
                break;
            };
            match event {
                RdfEvent::EndSubject(_) if depth == 0 => break,
                RdfEvent::StartSubject(_) => {
                    if depth == 0 {
                        stats.nested += 1;
                    }
                    depth += 1;
                }
                RdfEvent::StartOptional | RdfEvent::StartGroup => {
                    if depth == 0 {
                        stats.optional += 1;
                    }
                    depth += 1;
                }
                RdfEvent::EndSubject(_) | RdfEvent::EndOptional | RdfEvent::EndGroup => {
                    depth = depth.saturating_sub(1);
                }
                RdfEvent::TriplePattern(_) => {
                    if depth == 0 {
                        stats.mandatory += 1;
                    }
                }
                RdfEvent::EndWhere | RdfEvent::EndDocument => break,
                _ => {}
            }
            i += 1;
        }
        Ok(stats)
    }
}

impl<S: RdfSource> RdfSource for SparqlProducer<S> {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.finished {
                return Ok(None);
            }
            match self.input.next()? {
                Some(event) => self.process(event)?,
                None => {
                    // Truncated input: close everything still open so the
                    // output stays bracket-balanced.
                    self.finished = true;
                    while let Some(level) = self.stack.pop() {
                        self.close_level(level);
                    }
                    if self.in_where {
                        self.pending.push_back(RdfEvent::EndWhere);
                        self.in_where = false;
                    }
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.pending.clear();
        self.finished = true;
        self.input.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::VecSource;
    use crate::events::VarOrTerm;
    use oxigraph::model::NamedNode;

    fn var(name: &str) -> VarOrTerm {
        VarOrTerm::Var(name.to_string())
    }

    fn iri(s: &str) -> VarOrTerm {
        VarOrTerm::Iri(NamedNode::new(s).unwrap())
    }

    fn produce(events: Vec<RdfEvent>) -> Vec<RdfEvent> {
        let mut producer = SparqlProducer::new(VecSource::new(events));
        let mut out = Vec::new();
        while let Some(event) = producer.next().unwrap() {
            out.push(event);
        }
        out
    }

    fn balanced(events: &[RdfEvent]) -> bool {
        let mut depth = 0i64;
        for event in events {
            match event {
                RdfEvent::StartGroup
                | RdfEvent::StartOptional
                | RdfEvent::StartConstruct
                | RdfEvent::StartWhere => depth += 1,
                RdfEvent::EndGroup
                | RdfEvent::EndOptional
                | RdfEvent::EndConstruct
                | RdfEvent::EndWhere => {
                    depth -= 1;
                    if depth < 0 {
                        return false;
                    }
                }
                _ => {}
            }
        }
        depth == 0
    }

    #[test]
    fn test_mandatory_triples_pass_through_without_brackets() {
        let p = TriplePattern::new(
            iri("http://example.org/a"),
            iri("http://example.org/p"),
            iri("http://example.org/o"),
        );
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartSubject(iri("http://example.org/a")),
            RdfEvent::TriplePattern(p.clone()),
            RdfEvent::EndSubject(iri("http://example.org/a")),
            RdfEvent::EndWhere,
        ]);
        assert_eq!(
            out,
            vec![
                RdfEvent::StartWhere,
                RdfEvent::TriplePattern(p),
                RdfEvent::EndWhere,
            ]
        );
    }

    #[test]
    fn test_all_optional_subject_block_collapses_to_one_optional() {
        // ?s ?p ?v with a variable subject: the whole block becomes one
        // OPTIONAL and the inner triple wrapper collapses.
        let p = TriplePattern::new(var("s"), var("p"), var("v"));
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("s")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(p.clone()),
            RdfEvent::EndOptional,
            RdfEvent::EndSubject(var("s")),
            RdfEvent::EndOptional,
            RdfEvent::EndWhere,
        ]);
        let optionals = out
            .iter()
            .filter(|e| matches!(e, RdfEvent::StartOptional))
            .count();
        assert_eq!(optionals, 1);
        assert!(balanced(&out));
        assert!(out.contains(&RdfEvent::TriplePattern(p)));
    }

    #[test]
    fn test_union_between_sibling_optional_subjects() {
        let pa = TriplePattern::new(var("a"), iri("http://example.org/p"), var("x"));
        let pb = TriplePattern::new(var("b"), iri("http://example.org/p"), var("y"));
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("a")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(pa),
            RdfEvent::EndOptional,
            RdfEvent::EndSubject(var("a")),
            RdfEvent::EndOptional,
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("b")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(pb),
            RdfEvent::EndOptional,
            RdfEvent::EndSubject(var("b")),
            RdfEvent::EndOptional,
            RdfEvent::EndWhere,
        ]);
        let unions = out.iter().filter(|e| matches!(e, RdfEvent::Union)).count();
        assert_eq!(unions, 1);
        assert!(balanced(&out));
    }

    #[test]
    fn test_mandatory_triples_are_hoisted() {
        let optional = TriplePattern::new(iri("http://example.org/a"), iri("http://example.org/p"), var("x"));
        let mandatory = TriplePattern::new(
            iri("http://example.org/a"),
            iri("http://example.org/q"),
            iri("http://example.org/o"),
        );
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartSubject(iri("http://example.org/a")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(optional.clone()),
            RdfEvent::EndOptional,
            RdfEvent::TriplePattern(mandatory.clone()),
            RdfEvent::EndSubject(iri("http://example.org/a")),
            RdfEvent::EndWhere,
        ]);
        let mandatory_event = RdfEvent::TriplePattern(mandatory);
        let optional_event = RdfEvent::TriplePattern(optional);
        let mandatory_idx = out.iter().position(|e| e == &mandatory_event).unwrap();
        let optional_idx = out.iter().position(|e| e == &optional_event).unwrap();
        assert!(mandatory_idx < optional_idx);
        assert!(balanced(&out));
    }

    #[test]
    fn test_truncated_input_is_still_balanced() {
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("a")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(TriplePattern::new(var("a"), var("p"), var("x"))),
            // Stream ends mid-subject.
        ]);
        assert!(balanced(&out));
    }

    #[test]
    fn test_input_ending_inside_optional_region_is_balanced() {
        let p = TriplePattern::new(iri("http://example.org/a"), var("p"), var("x"));
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartSubject(iri("http://example.org/a")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(p.clone()),
            // Stream ends before the optional region closes.
        ]);
        assert!(balanced(&out));
        assert!(out.contains(&RdfEvent::TriplePattern(p)));
    }

    #[test]
    fn test_nested_optional_subject_is_well_joined() {
        let link = TriplePattern::new(
            iri("http://example.org/a"),
            iri("http://example.org/knows"),
            var("b"),
        );
        let inner = TriplePattern::new(var("b"), iri("http://example.org/name"), var("n"));
        let out = produce(vec![
            RdfEvent::StartWhere,
            RdfEvent::StartSubject(iri("http://example.org/a")),
            RdfEvent::TriplePattern(link.clone()),
            RdfEvent::StartOptional,
            RdfEvent::StartSubject(var("b")),
            RdfEvent::StartOptional,
            RdfEvent::TriplePattern(inner.clone()),
            RdfEvent::EndOptional,
            RdfEvent::EndSubject(var("b")),
            RdfEvent::EndOptional,
            RdfEvent::EndSubject(iri("http://example.org/a")),
            RdfEvent::EndWhere,
        ]);
        // Chained through ?b: OPTIONAL without an enclosing group.
        assert!(!out.contains(&RdfEvent::StartGroup));
        assert_eq!(
            out.iter()
                .filter(|e| matches!(e, RdfEvent::StartOptional))
                .count(),
            1
        );
        assert!(balanced(&out));
    }
}
