//! Materialización del grafo RDF de un análisis: documento, menciones y
//! conceptos SKOS elegidos.
//!
//! Se serializa en N-Triples (líneas ordenadas) y en JSON-LD expandido. Ambas
//! formas codifican exactamente el mismo conjunto de tripletas; los lectores
//! [`parse_ntriples`] y [`parse_jsonld`] permiten comprobarlo.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{Decision, GraphDocument, Mention};

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const RDFS_LABEL: &str = "http://www.w3.org/2000/01/rdf-schema#label";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";

#[derive(Debug, thiserror::Error)]
pub enum RdfError {
    #[error("IRI inválida: {0:?}")]
    InvalidIri(String),

    #[error("estructura inválida: {0}")]
    Structure(String),

    #[error("no se pudo leer la serialización (línea {line}): {message}")]
    Parse { line: usize, message: String },

    #[error("error de JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Term {
    Iri(String),
    Literal {
        value: String,
        datatype: Option<String>,
    },
}

impl Term {
    fn literal(value: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
            datatype: None,
        }
    }

    fn integer(value: usize) -> Self {
        Self::Literal {
            value: value.to_string(),
            datatype: Some(XSD_INTEGER.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: Term,
}

impl Triple {
    fn new(subject: &str, predicate: &str, object: Term) -> Self {
        Self {
            subject: subject.to_string(),
            predicate: predicate.to_string(),
            object,
        }
    }
}

/// Construye el grafo de un análisis bajo un espacio de nombres base.
#[derive(Debug, Clone)]
pub struct GraphMaterializer {
    ns: String,
}

impl GraphMaterializer {
    pub fn new(base_namespace: &str) -> Self {
        let mut ns = base_namespace.trim().to_string();
        if !ns.ends_with('/') && !ns.ends_with('#') {
            ns.push('/');
        }
        Self { ns }
    }

    /// Hash SHA-256 (hex) del texto: mismo texto, mismo documento.
    pub fn content_hash(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        format!("{digest:x}")
    }

    pub fn document_iri(&self, text: &str) -> String {
        format!("{}Document/{}", self.ns, Self::content_hash(text))
    }

    /// Depende sólo del documento y del ordinal, no de la decisión.
    pub fn mention_iri(&self, text: &str, ordinal: usize) -> String {
        format!("{}Mention/{}/{}", self.ns, Self::content_hash(text), ordinal)
    }

    pub fn triples(
        &self,
        text: &str,
        mentions: &[Mention],
        decisions: &[Decision],
    ) -> Result<BTreeSet<Triple>, RdfError> {
        if mentions.len() != decisions.len() {
            return Err(RdfError::Structure(format!(
                "{} menciones y {} decisiones",
                mentions.len(),
                decisions.len()
            )));
        }

        let ex = |local: &str| format!("{}{}", self.ns, local);
        let doc = self.document_iri(text);
        validate_iri(&doc)?;

        let mut triples = BTreeSet::new();
        triples.insert(Triple::new(&doc, RDF_TYPE, Term::Iri(ex("Document"))));

        for (ordinal, (mention, decision)) in mentions.iter().zip(decisions).enumerate() {
            let m = self.mention_iri(text, ordinal);
            triples.insert(Triple::new(&m, RDF_TYPE, Term::Iri(ex("Mention"))));
            triples.insert(Triple::new(&m, RDFS_LABEL, Term::literal(&mention.surface)));
            triples.insert(Triple::new(&doc, &ex("mentions"), Term::Iri(m.clone())));
            triples.insert(Triple::new(&m, &ex("startOffset"), Term::integer(mention.start)));
            triples.insert(Triple::new(&m, &ex("endOffset"), Term::integer(mention.end)));
            if !mention.label.trim().is_empty() {
                triples.insert(Triple::new(&m, &ex("entityType"), Term::literal(mention.label.trim())));
            }

            if let Some(chosen) = &decision.chosen {
                validate_iri(&chosen.iri)?;
                triples.insert(Triple::new(&m, &ex("denotes"), Term::Iri(chosen.iri.clone())));
                triples.insert(Triple::new(&doc, &ex("hasTopic"), Term::Iri(chosen.iri.clone())));
                if !chosen.label.is_empty() {
                    triples.insert(Triple::new(&chosen.iri, RDFS_LABEL, Term::literal(&chosen.label)));
                }
            }
        }
        Ok(triples)
    }

    pub fn materialize(
        &self,
        text: &str,
        mentions: &[Mention],
        decisions: &[Decision],
    ) -> Result<GraphDocument, RdfError> {
        let triples = self.triples(text, mentions, decisions)?;
        let primary = to_ntriples(&triples);
        let alternate = to_jsonld(&triples)?;

        // Las dos serializaciones deben describir exactamente el mismo grafo.
        if parse_ntriples(&primary)? != triples || parse_jsonld(&alternate)? != triples {
            return Err(RdfError::Structure(
                "las serializaciones no codifican el mismo conjunto de tripletas".into(),
            ));
        }

        Ok(GraphDocument {
            document_uri: self.document_iri(text),
            primary_serialization: primary,
            alternate_serialization: alternate,
        })
    }
}

/// Absoluta (con esquema) y sin caracteres prohibidos en N-Triples.
pub fn validate_iri(iri: &str) -> Result<(), RdfError> {
    let scheme_ok = iri
        .split_once(':')
        .map(|(scheme, _)| {
            !scheme.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
        .unwrap_or(false);
    let chars_ok = iri
        .chars()
        .all(|c| !c.is_whitespace() && !c.is_control() && !"<>\"{}|^`\\".contains(c));

    if scheme_ok && chars_ok {
        Ok(())
    } else {
        Err(RdfError::InvalidIri(iri.to_string()))
    }
}

fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn format_term(term: &Term) -> String {
    match term {
        Term::Iri(iri) => format!("<{iri}>"),
        Term::Literal {
            value,
            datatype: None,
        } => format!("\"{}\"", escape_literal(value)),
        Term::Literal {
            value,
            datatype: Some(dt),
        } => format!("\"{}\"^^<{dt}>", escape_literal(value)),
    }
}

/// N-Triples canónico: una tripleta por línea, líneas ordenadas.
pub fn to_ntriples(triples: &BTreeSet<Triple>) -> String {
    let mut lines: Vec<String> = triples
        .iter()
        .map(|t| format!("<{}> <{}> {} .", t.subject, t.predicate, format_term(&t.object)))
        .collect();
    lines.sort();
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// JSON-LD expandido: un objeto por sujeto, ordenado por `@id`.
pub fn to_jsonld(triples: &BTreeSet<Triple>) -> Result<String, RdfError> {
    let mut nodes: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();

    for t in triples {
        let node = nodes.entry(t.subject.as_str()).or_insert_with(|| {
            let mut node = Map::new();
            node.insert("@id".to_string(), Value::String(t.subject.clone()));
            node
        });

        let (key, value) = match (&t.object, t.predicate.as_str()) {
            (Term::Iri(iri), RDF_TYPE) => ("@type".to_string(), Value::String(iri.clone())),
            (Term::Iri(iri), predicate) => (predicate.to_string(), json!({ "@id": iri })),
            (Term::Literal { value, datatype }, predicate) => {
                let mut literal = Map::new();
                literal.insert("@value".to_string(), Value::String(value.clone()));
                if let Some(dt) = datatype {
                    literal.insert("@type".to_string(), Value::String(dt.clone()));
                }
                (predicate.to_string(), Value::Object(literal))
            }
        };

        match node.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
            Value::Array(values) => values.push(value),
            _ => return Err(RdfError::Structure("propiedad JSON-LD no es una lista".into())),
        }
    }

    let document: Vec<Value> = nodes.into_values().map(Value::Object).collect();
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Lector de N-Triples suficiente para lo que produce [`to_ntriples`]
/// (IRIs, literales simples y tipados, comentarios).
pub fn parse_ntriples(input: &str) -> Result<BTreeSet<Triple>, RdfError> {
    let mut triples = BTreeSet::new();
    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let err = |message: &str| RdfError::Parse {
            line: line_no,
            message: message.to_string(),
        };

        let mut cursor = NtCursor { rest: line };
        let subject = cursor.iri().ok_or_else(|| err("sujeto"))?;
        let predicate = cursor.iri().ok_or_else(|| err("predicado"))?;
        let object = cursor.object().ok_or_else(|| err("objeto"))?;
        if cursor.rest.trim() != "." {
            return Err(err("falta el punto final"));
        }
        triples.insert(Triple {
            subject,
            predicate,
            object,
        });
    }
    Ok(triples)
}

struct NtCursor<'a> {
    rest: &'a str,
}

impl NtCursor<'_> {
    fn iri(&mut self) -> Option<String> {
        let s = self.rest.trim_start().strip_prefix('<')?;
        let end = s.find('>')?;
        self.rest = &s[end + 1..];
        Some(s[..end].to_string())
    }

    fn object(&mut self) -> Option<Term> {
        if self.rest.trim_start().starts_with('<') {
            return self.iri().map(Term::Iri);
        }
        let s = self.rest.trim_start().strip_prefix('"')?;
        let mut value = String::new();
        let mut chars = s.char_indices();
        let close = loop {
            let (i, c) = chars.next()?;
            match c {
                '"' => break i,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    'r' => value.push('\r'),
                    't' => value.push('\t'),
                    '"' => value.push('"'),
                    '\\' => value.push('\\'),
                    _ => return None,
                },
                other => value.push(other),
            }
        };
        self.rest = &s[close + 1..];

        let datatype = if let Some(after) = self.rest.strip_prefix("^^") {
            self.rest = after;
            Some(self.iri()?)
        } else {
            None
        };
        Some(Term::Literal { value, datatype })
    }
}

/// Lector del JSON-LD expandido que produce [`to_jsonld`].
pub fn parse_jsonld(input: &str) -> Result<BTreeSet<Triple>, RdfError> {
    let shape = |message: &str| RdfError::Structure(format!("JSON-LD: {message}"));
    let document: Value = serde_json::from_str(input)?;
    let nodes = document.as_array().ok_or_else(|| shape("se esperaba una lista de nodos"))?;

    let mut triples = BTreeSet::new();
    for node in nodes {
        let node = node.as_object().ok_or_else(|| shape("nodo no es un objeto"))?;
        let subject = node
            .get("@id")
            .and_then(Value::as_str)
            .ok_or_else(|| shape("nodo sin @id"))?;

        for (key, values) in node {
            if key == "@id" {
                continue;
            }
            let values = values.as_array().ok_or_else(|| shape("valores no son una lista"))?;
            for value in values {
                let object = if key == "@type" {
                    Term::Iri(value.as_str().ok_or_else(|| shape("@type no es texto"))?.to_string())
                } else if let Some(iri) = value.get("@id").and_then(Value::as_str) {
                    Term::Iri(iri.to_string())
                } else {
                    let literal = value
                        .get("@value")
                        .and_then(Value::as_str)
                        .ok_or_else(|| shape("valor sin @id ni @value"))?;
                    Term::Literal {
                        value: literal.to_string(),
                        datatype: value.get("@type").and_then(Value::as_str).map(str::to_string),
                    }
                };
                let predicate = if key == "@type" { RDF_TYPE } else { key.as_str() };
                triples.insert(Triple::new(subject, predicate, object));
            }
        }
    }
    Ok(triples)
}
