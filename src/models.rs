//! Modelos de dominio del pipeline de desambiguación (menciones, candidatos,
//! caminos en la taxonomía, decisiones y documento RDF resultante).

use serde::{Deserialize, Serialize};

/// Mención detectada en el texto. Los offsets son posiciones de carácter y
/// cumplen `0 <= start < end <= len(text)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub surface: String,
    pub label: String,
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Concepto de la taxonomía propuesto para una mención.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub iri: String,
    pub label: String,
    pub score: f64,
}

/// Candidatos ordenados de una mención (la respuesta los agrupa por superficie).
#[derive(Debug, Clone, Serialize)]
pub struct MentionCandidates {
    pub surface: String,
    pub candidates: Vec<Candidate>,
}

/// Un salto del camino, en orden de recorrido.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathStep {
    pub subject_iri: String,
    pub subject_label: Option<String>,
    pub predicate: String,
    pub object_iri: String,
    pub object_label: Option<String>,
}

/// Camino entre dos conceptos. Su longitud es el número de saltos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path {
    pub steps: Vec<PathStep>,
}

impl Path {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// IRIs de todos los nodos del camino, extremos incluidos.
    pub fn node_iris(&self) -> Vec<&str> {
        let mut nodes = Vec::with_capacity(self.steps.len() + 1);
        if let Some(first) = self.steps.first() {
            nodes.push(first.subject_iri.as_str());
        }
        nodes.extend(self.steps.iter().map(|s| s.object_iri.as_str()));
        nodes
    }

    /// Nodos atravesados (sin los extremos).
    pub fn intermediate_iris(&self) -> Vec<&str> {
        let nodes = self.node_iris();
        if nodes.len() <= 2 {
            return Vec::new();
        }
        nodes[1..nodes.len() - 1].to_vec()
    }
}

/// Evidencia textual derivada de los caminos que tocan a una mención.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PathEvidence {
    pub paths: Vec<Path>,
    pub summary: String,
}

/// Referencia reducida al concepto elegido.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChosenConcept {
    pub iri: String,
    pub label: String,
}

impl From<&Candidate> for ChosenConcept {
    fn from(c: &Candidate) -> Self {
        Self {
            iri: c.iri.clone(),
            label: c.label.clone(),
        }
    }
}

/// Origen de una decisión, para que el cliente pueda valorar la confianza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// El LLM eligió un candidato válido.
    Capability,
    /// El LLM respondió explícitamente "ninguno".
    CapabilityNone,
    /// Sin candidatos; no se consultó al LLM.
    NoCandidates,
    /// Respuesta no reconocida: se usa el candidato de mayor puntuación.
    InvalidAnswer,
    /// LLM caído o sin respuesta a tiempo: mismo criterio de respaldo.
    Unavailable,
}

impl DecisionSource {
    pub fn is_fallback(self) -> bool {
        matches!(self, Self::InvalidAnswer | Self::Unavailable)
    }
}

/// Resultado de la desambiguación de una mención.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub surface: String,
    pub chosen: Option<Candidate>,
    pub rationale: String,
    pub source: DecisionSource,
}

/// Marca por mención de qué etapas tuvieron que degradarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FallbackReport {
    pub candidates: bool,
    pub evidence: bool,
    pub decision: DecisionSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisambiguatedMention {
    pub surface: String,
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub chosen: Option<ChosenConcept>,
    pub rationale: String,
    pub evidence: PathEvidence,
    pub fallback: FallbackReport,
}

/// Documento RDF materializado. Inmutable una vez construido.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphDocument {
    pub document_uri: String,
    pub primary_serialization: String,
    pub alternate_serialization: String,
}

/// Cuerpo de `POST /analyze` tal como llega; se valida en el pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeParams {
    #[serde(default)]
    pub text: String,
    pub top_k: Option<i64>,
    pub max_hops: Option<i64>,
    pub hub_threshold: Option<i64>,
    pub idempotence_key: Option<String>,
}

/// Petición de análisis ya validada.
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub text: String,
    pub top_k: usize,
    pub max_hops: usize,
    pub hub_threshold: Option<usize>,
    pub idempotence_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub text: String,
    pub mentions: Vec<Mention>,
    pub candidate_selections: Vec<MentionCandidates>,
    pub disambiguation: Vec<DisambiguatedMention>,
    pub graph: GraphDocument,
}
