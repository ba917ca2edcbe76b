//! Capacidades de consulta sobre la taxonomía SKOS que necesita el pipeline:
//! búsqueda puntuada de conceptos y descarga de vecindades para el BFS.
//!
//! Neo4j las implementa en `neo4j_client`; [`InMemoryTaxonomy`] las implementa
//! sobre un grafo cargado en memoria (útil sin base de datos y en los tests).

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Candidate;

/// Búsqueda puntuada (full-text) sobre las etiquetas de la taxonomía.
#[async_trait]
pub trait ConceptSearch: Send + Sync {
    /// Devuelve como mucho `limit` candidatos. Una lista vacía es válida.
    async fn search(
        &self,
        surface: &str,
        label_hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>>;
}

/// Arista incidente a un nodo, vista desde `source` (el recorrido no tiene
/// en cuenta la dirección). Los grados cuentan todas las aristas del nodo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyEdge {
    pub source: String,
    pub source_label: Option<String>,
    pub source_degree: usize,
    pub predicate: String,
    pub target: String,
    pub target_label: Option<String>,
    pub target_degree: usize,
}

/// Acceso de sólo lectura a la vecindad de un conjunto de nodos.
#[async_trait]
pub trait AdjacencySource: Send + Sync {
    async fn neighbourhood(&self, iris: &[String]) -> Result<Vec<AdjacencyEdge>>;
}

/// Taxonomía en memoria: conceptos con etiqueta y aristas SKOS dirigidas.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaxonomy {
    labels: BTreeMap<String, String>,
    edges: Vec<(String, String, String)>,
}

impl InMemoryTaxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concept(mut self, iri: &str, label: &str) -> Self {
        self.labels.insert(iri.to_string(), label.to_string());
        self
    }

    pub fn with_edge(mut self, subject: &str, predicate: &str, object: &str) -> Self {
        self.edges
            .push((subject.to_string(), predicate.to_string(), object.to_string()));
        self
    }

    pub fn degree(&self, iri: &str) -> usize {
        self.edges
            .iter()
            .filter(|(s, _, o)| s == iri || o == iri)
            .count()
    }

    fn label(&self, iri: &str) -> Option<String> {
        self.labels.get(iri).cloned()
    }
}

#[async_trait]
impl ConceptSearch for InMemoryTaxonomy {
    /// Coincidencia léxica ingenua: la superficie debe aparecer dentro de la
    /// etiqueta. La puntuación es la fracción de la etiqueta cubierta.
    async fn search(
        &self,
        surface: &str,
        _label_hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let needle = surface.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches: Vec<Candidate> = self
            .labels
            .iter()
            .filter(|(_, label)| label.to_lowercase().contains(&needle))
            .map(|(iri, label)| Candidate {
                iri: iri.clone(),
                label: label.clone(),
                score: needle.chars().count() as f64 / label.chars().count().max(1) as f64,
            })
            .collect();

        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.iri.cmp(&b.iri)));
        matches.truncate(limit);
        Ok(matches)
    }
}

#[async_trait]
impl AdjacencySource for InMemoryTaxonomy {
    async fn neighbourhood(&self, iris: &[String]) -> Result<Vec<AdjacencyEdge>> {
        let wanted: BTreeSet<&str> = iris.iter().map(String::as_str).collect();
        let mut out = Vec::new();

        for (subject, predicate, object) in &self.edges {
            for (from, to) in [(subject, object), (object, subject)] {
                if wanted.contains(from.as_str()) {
                    out.push(AdjacencyEdge {
                        source: from.clone(),
                        source_label: self.label(from),
                        source_degree: self.degree(from),
                        predicate: predicate.clone(),
                        target: to.clone(),
                        target_label: self.label(to),
                        target_degree: self.degree(to),
                    });
                }
            }
        }
        Ok(out)
    }
}
