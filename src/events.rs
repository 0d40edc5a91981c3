use crate::error::TemplateError;
use oxigraph::model::{BlankNode, Literal, NamedNode, Term};
use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const RDF_FIRST: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#first";
pub const RDF_REST: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#rest";
pub const RDF_NIL: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#nil";

/// Namespace used to project template-variable identity into CONSTRUCT
/// results, since plain SPARQL results carry no variable names.
pub const VAR_NS: &str = "urn:template:variable:";

/// A term position in a triple pattern: either a template variable or a
/// ground RDF term.
///
/// Equality and hashing compare the denoted term, so a `Curie` and an
/// `Iri` expanding to the same IRI are the same term. This is what the
/// chaining ("well-joined") checks in the producer rely on.
#[derive(Debug, Clone)]
pub enum VarOrTerm {
    /// A named template variable, written `?name` in the template.
    Var(String),
    /// A synthesized placeholder for an anonymous or empty-literal
    /// subject. Never externally bound.
    BlankVar(String),
    /// An absolute IRI.
    Iri(NamedNode),
    /// A prefixed name from the template, kept with its expansion.
    Curie {
        prefix: String,
        suffix: String,
        iri: NamedNode,
    },
    /// An RDF literal.
    Literal(Literal),
    /// A resolved reference, kept with the relative form it was written as.
    Reference { iri: NamedNode, relative: String },
    /// A blank node coming back from the query service.
    Blank(BlankNode),
}

impl VarOrTerm {
    pub fn is_var(&self) -> bool {
        matches!(self, Self::Var(_) | Self::BlankVar(_))
    }

    pub fn is_named_var(&self) -> bool {
        matches!(self, Self::Var(_))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    pub fn var_name(&self) -> Option<&str> {
        match self {
            Self::Var(name) | Self::BlankVar(name) => Some(name),
            _ => None,
        }
    }

    /// The IRI this term denotes, if it denotes one.
    pub fn iri_str(&self) -> Option<&str> {
        match self {
            Self::Iri(iri) => Some(iri.as_str()),
            Self::Curie { iri, .. } => Some(iri.as_str()),
            Self::Reference { iri, .. } => Some(iri.as_str()),
            _ => None,
        }
    }

    /// Converts a ground term into an oxigraph term. Variables have no
    /// ground form.
    pub fn as_term(&self) -> Option<Term> {
        match self {
            Self::Var(_) | Self::BlankVar(_) => None,
            Self::Iri(iri) => Some(iri.clone().into()),
            Self::Curie { iri, .. } => Some(iri.clone().into()),
            Self::Reference { iri, .. } => Some(iri.clone().into()),
            Self::Literal(lit) => Some(lit.clone().into()),
            Self::Blank(b) => Some(b.clone().into()),
        }
    }

    /// Wraps a term returned by the query service.
    pub fn from_term(term: &Term) -> Self {
        match term {
            Term::NamedNode(n) => Self::Iri(n.clone()),
            Term::BlankNode(b) => Self::Blank(b.clone()),
            Term::Literal(l) => Self::Literal(l.clone()),
            #[allow(unreachable_patterns)]
            other => Self::Literal(Literal::new_simple_literal(other.to_string())),
        }
    }
}

impl PartialEq for VarOrTerm {
    fn eq(&self, other: &Self) -> bool {
        match (self.iri_str(), other.iri_str()) {
            (Some(a), Some(b)) => return a == b,
            (None, None) => {}
            _ => return false,
        }
        match (self, other) {
            (Self::Var(a), Self::Var(b)) => a == b,
            (Self::BlankVar(a), Self::BlankVar(b)) => a == b,
            (Self::Literal(a), Self::Literal(b)) => a == b,
            (Self::Blank(a), Self::Blank(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for VarOrTerm {}

impl Hash for VarOrTerm {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(iri) = self.iri_str() {
            iri.hash(state);
            return;
        }
        match self {
            Self::Var(name) => ("?", name).hash(state),
            Self::BlankVar(name) => ("?", name).hash(state),
            Self::Literal(lit) => lit.hash(state),
            Self::Blank(b) => b.hash(state),
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for VarOrTerm {
    /// SPARQL surface form of the term.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(name) | Self::BlankVar(name) => write!(f, "?{name}"),
            Self::Iri(iri) => write!(f, "{iri}"),
            Self::Curie { prefix, suffix, .. } => write!(f, "{prefix}:{suffix}"),
            Self::Literal(lit) => write!(f, "{lit}"),
            Self::Reference { iri, .. } => write!(f, "{iri}"),
            Self::Blank(b) => write!(f, "{b}"),
        }
    }
}

/// A triple pattern with the direction it was written in.
///
/// `inverse` is set for `rev`-style patterns where the template element
/// owns the object position. `partner()` is whichever term the owning
/// element does not hold; an unbound partner is what makes a pattern
/// optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriplePattern {
    pub subject: VarOrTerm,
    pub predicate: VarOrTerm,
    pub object: VarOrTerm,
    pub inverse: bool,
}

impl TriplePattern {
    pub fn new(subject: VarOrTerm, predicate: VarOrTerm, object: VarOrTerm) -> Self {
        Self {
            subject,
            predicate,
            object,
            inverse: false,
        }
    }

    pub fn inverse(subject: VarOrTerm, predicate: VarOrTerm, object: VarOrTerm) -> Self {
        Self {
            subject,
            predicate,
            object,
            inverse: true,
        }
    }

    /// The owning term of the pattern.
    pub fn about(&self) -> &VarOrTerm {
        if self.inverse {
            &self.object
        } else {
            &self.subject
        }
    }

    /// The non-owning term, used to decide optionality.
    pub fn partner(&self) -> &VarOrTerm {
        if self.inverse {
            &self.subject
        } else {
            &self.object
        }
    }

    pub fn is_optional(&self) -> bool {
        self.partner().is_var()
    }

    /// True when either end of the pattern is `term`.
    pub fn shares(&self, term: &VarOrTerm) -> bool {
        &self.subject == term || &self.object == term
    }
}

/// Events over RDF and SPARQL syntax. One closed union so that every
/// consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum RdfEvent {
    StartDocument,
    EndDocument,
    Base(String),
    Namespace { prefix: String, uri: String },
    StartSubject(VarOrTerm),
    EndSubject(VarOrTerm),
    /// A ground data triple replayed from query results.
    Triple(TriplePattern),
    /// A query triple pattern.
    TriplePattern(TriplePattern),
    StartGraph(VarOrTerm),
    EndGraph(VarOrTerm),
    StartConstruct,
    EndConstruct,
    Ask,
    Select(Vec<VarOrTerm>),
    StartWhere,
    EndWhere,
    StartOptional,
    EndOptional,
    StartGroup,
    EndGroup,
    Union,
    StartFilter,
    EndFilter,
    StartBuiltInCall(String),
    EndBuiltInCall,
    Expression(VarOrTerm),
    OrderBy(Vec<VarOrTerm>),
}

/// An attribute as written in the template, qname and all.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// A start tag with its attributes and the namespaces it declares.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
    /// `xmlns` declarations on this element: prefix (empty for the
    /// default namespace) to URI.
    pub namespaces: Vec<(String, String)>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: String) {
        if let Some(a) = self.attributes.iter_mut().find(|a| a.name == name) {
            a.value = value;
        } else {
            self.attributes.push(Attribute {
                name: name.to_string(),
                value,
            });
        }
    }
}

/// Events over template markup.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    StartDocument,
    EndDocument,
    StartElement(Element),
    EndElement(String),
    Characters(String),
    Comment(String),
}

/// Per-compile term factory: validates variable names and hands out the
/// sequence-numbered synthetic blank variables.
#[derive(Debug)]
pub struct TermFactory {
    seq: usize,
    varname: Regex,
}

impl Default for TermFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TermFactory {
    pub fn new() -> Self {
        Self {
            seq: 0,
            // SPARQL VARNAME, Unicode letter and digit classes.
            varname: Regex::new(r"^[\p{L}\p{N}_]+$").unwrap(),
        }
    }

    pub fn is_varname(&self, name: &str) -> bool {
        self.varname.is_match(name)
    }

    /// Fresh placeholder variable for an anonymous or empty-literal node.
    pub fn fresh_blank_var(&mut self) -> VarOrTerm {
        self.seq += 1;
        VarOrTerm::BlankVar(format!("blank_{}", self.seq))
    }

    /// Turns an attribute value into a variable or a resolved reference.
    /// A value starting with `?` must be a syntactically valid variable
    /// name; anything else is a hard parse error.
    pub fn reference(&self, base: Option<&str>, value: &str) -> Result<VarOrTerm, TemplateError> {
        if let Some(name) = value.strip_prefix('?') {
            if !self.is_varname(name) {
                return Err(TemplateError::syntax(format!(
                    "invalid variable name: ?{name}"
                )));
            }
            return Ok(VarOrTerm::Var(name.to_string()));
        }
        let absolute = resolve(base, value);
        let iri = NamedNode::new(absolute)
            .map_err(|e| TemplateError::syntax(format!("invalid reference {value:?}: {e}")))?;
        Ok(VarOrTerm::Reference {
            iri,
            relative: value.to_string(),
        })
    }
}

/// Minimal reference resolution against a base IRI. Absolute references
/// pass through untouched.
fn resolve(base: Option<&str>, reference: &str) -> String {
    if reference.contains("://") || reference.starts_with("urn:") {
        return reference.to_string();
    }
    let Some(base) = base else {
        return reference.to_string();
    };
    if let Some(fragment) = reference.strip_prefix('#') {
        let stem = base.split('#').next().unwrap_or(base);
        return format!("{stem}#{fragment}");
    }
    if reference.is_empty() {
        return base.to_string();
    }
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], reference),
        None => reference.to_string(),
    }
}
