use crate::error::TemplateError;
use crate::events::{RdfEvent, XmlEvent};
use std::collections::VecDeque;

/// A pull-based producer of RDF events. `close` must cascade to any
/// nested reader so partially consumed pipelines release their sources.
pub trait RdfSource {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError>;

    fn close(&mut self) -> Result<(), TemplateError> {
        Ok(())
    }
}

/// A pull-based producer of XML events.
pub trait XmlSource {
    fn next(&mut self) -> Result<Option<XmlEvent>, TemplateError>;

    fn close(&mut self) -> Result<(), TemplateError> {
        Ok(())
    }
}

/// An in-memory RDF event sequence.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    events: VecDeque<RdfEvent>,
}

impl VecSource {
    pub fn new(events: Vec<RdfEvent>) -> Self {
        Self {
            events: events.into(),
        }
    }
}

impl RdfSource for VecSource {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        Ok(self.events.pop_front())
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.events.clear();
        Ok(())
    }
}

/// Adds bounded lookahead over any RDF event source.
pub struct BufferedRdfReader<S: RdfSource> {
    source: S,
    lookahead: VecDeque<RdfEvent>,
    done: bool,
}

impl<S: RdfSource> BufferedRdfReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            lookahead: VecDeque::new(),
            done: false,
        }
    }

    /// Returns the event `n` positions ahead without consuming it,
    /// buffering as needed.
    pub fn peek(&mut self, n: usize) -> Result<Option<&RdfEvent>, TemplateError> {
        while self.lookahead.len() <= n && !self.done {
            match self.source.next()? {
                Some(event) => self.lookahead.push_back(event),
                None => self.done = true,
            }
        }
        Ok(self.lookahead.get(n))
    }
}

impl<S: RdfSource> RdfSource for BufferedRdfReader<S> {
    fn next(&mut self) -> Result<Option<RdfEvent>, TemplateError> {
        if let Some(event) = self.lookahead.pop_front() {
            return Ok(Some(event));
        }
        if self.done {
            return Ok(None);
        }
        self.source.next()
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.lookahead.clear();
        self.done = true;
        self.source.close()
    }
}

/// A restartable view over an XML event source.
///
/// Consumed events are retained in an append-only arena; `mark` returns
/// the current offset and `reset` rewinds the cursor into the arena.
/// Marks are plain integer offsets, never references into the buffer.
pub struct BufferedXmlReader<S: XmlSource> {
    source: S,
    arena: Vec<XmlEvent>,
    cursor: usize,
    done: bool,
}

impl<S: XmlSource> BufferedXmlReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            arena: Vec::new(),
            cursor: 0,
            done: false,
        }
    }

    pub fn mark(&self) -> usize {
        self.cursor
    }

    /// Rewinds the cursor to a previously returned mark. Resetting beyond
    /// the buffered region is a programming error and fails hard.
    pub fn reset(&mut self, position: usize) -> Result<(), TemplateError> {
        if position > self.arena.len() {
            return Err(TemplateError::syntax(format!(
                "reset to {position} is past the buffered region ({} events)",
                self.arena.len()
            )));
        }
        self.cursor = position;
        Ok(())
    }
}

impl<S: XmlSource> XmlSource for BufferedXmlReader<S> {
    fn next(&mut self) -> Result<Option<XmlEvent>, TemplateError> {
        if self.cursor < self.arena.len() {
            let event = self.arena[self.cursor].clone();
            self.cursor += 1;
            return Ok(Some(event));
        }
        if self.done {
            return Ok(None);
        }
        match self.source.next()? {
            Some(event) => {
                self.arena.push(event.clone());
                self.cursor += 1;
                Ok(Some(event))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    fn close(&mut self) -> Result<(), TemplateError> {
        self.done = true;
        self.source.close()
    }
}
