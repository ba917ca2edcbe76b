//! Selección de un concepto por mención.
//!
//! El juicio semántico lo hace el LLM, pero estas reglas se cumplen siempre:
//!   - sin candidatos no se consulta al LLM y la decisión es "ninguno";
//!   - una IRI que no coincide literalmente con un candidato es inválida;
//!   - respuesta inválida, error o timeout → candidato de mayor puntuación
//!     (empate: IRI lexicográficamente menor).

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{strip_code_fences, TextGenerator};
use crate::models::{Candidate, Decision, DecisionSource, Mention};

const CANDIDATE_DECISION_PROMPT: &str = r#"
Eres un experto en la ACM Computing Classification System (SKOS).
Recibirás un JSON con:
- "surface": la mención detectada en el texto,
- "context": el fragmento de texto que la rodea,
- "evidence": un resumen de cómo se conectan en la taxonomía los candidatos de
  ésta y otras menciones (puede estar vacío),
- "candidates": lista de conceptos candidatos con "iri", "label" y "score".

Elige el concepto al que se refiere la mención.
La salida DEBE ser un único objeto JSON: {"iri": "<iri exacta de un candidato>", "rationale": "<una frase>"}.
Si ningún candidato es correcto, devuelve {"iri": null, "rationale": "<una frase>"}.
No incluyas explicaciones fuera del JSON.
"#;

#[derive(Serialize)]
struct DecisionPayload<'a> {
    surface: &'a str,
    context: &'a str,
    evidence: &'a str,
    candidates: &'a [Candidate],
}

/// Interpretación de la respuesta del LLM frente a la lista de candidatos.
#[derive(Debug, PartialEq)]
enum Verdict {
    Chosen { index: usize, rationale: String },
    NoneOfTheAbove { rationale: String },
    Invalid(String),
}

#[derive(Clone)]
pub struct Disambiguator {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    context_window: usize,
}

impl Disambiguator {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration, context_window: usize) -> Self {
        Self {
            generator,
            timeout,
            context_window,
        }
    }

    /// Función total: siempre devuelve exactamente una decisión.
    pub async fn decide(
        &self,
        text: &str,
        mention: &Mention,
        candidates: &[Candidate],
        evidence_summary: &str,
    ) -> Decision {
        if candidates.is_empty() {
            return Decision {
                surface: mention.surface.clone(),
                chosen: None,
                rationale: "Sin candidatos en la taxonomía.".to_string(),
                source: DecisionSource::NoCandidates,
            };
        }

        let context = context_window(text, mention.start, mention.end, self.context_window);
        let payload = DecisionPayload {
            surface: &mention.surface,
            context: &context,
            evidence: evidence_summary,
            candidates,
        };
        let prompt = match serde_json::to_string(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(surface = %mention.surface, error = %e, "No se pudo serializar el payload de decisión");
                return fallback(mention, candidates, DecisionSource::Unavailable);
            }
        };

        let call = self.generator.generate(CANDIDATE_DECISION_PROMPT, &prompt);
        let response = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(surface = %mention.surface, error = %e, "LLM de decisión no disponible; se usa el mejor candidato");
                return fallback(mention, candidates, DecisionSource::Unavailable);
            }
            Err(_) => {
                warn!(surface = %mention.surface, "Timeout del LLM de decisión; se usa el mejor candidato");
                return fallback(mention, candidates, DecisionSource::Unavailable);
            }
        };

        match parse_verdict(&response, candidates) {
            Verdict::Chosen { index, rationale } => {
                debug!(surface = %mention.surface, iri = %candidates[index].iri, "candidato elegido por el LLM");
                Decision {
                    surface: mention.surface.clone(),
                    chosen: Some(candidates[index].clone()),
                    rationale,
                    source: DecisionSource::Capability,
                }
            }
            Verdict::NoneOfTheAbove { rationale } => Decision {
                surface: mention.surface.clone(),
                chosen: None,
                rationale,
                source: DecisionSource::CapabilityNone,
            },
            Verdict::Invalid(reason) => {
                warn!(surface = %mention.surface, %reason, "Respuesta de decisión inválida; se usa el mejor candidato");
                fallback(mention, candidates, DecisionSource::InvalidAnswer)
            }
        }
    }
}

fn fallback(mention: &Mention, candidates: &[Candidate], source: DecisionSource) -> Decision {
    let chosen = best_candidate(candidates).cloned();
    let rationale = match source {
        DecisionSource::InvalidAnswer => {
            "Respuesta del LLM no reconocida; se elige el candidato de mayor puntuación."
        }
        _ => "LLM no disponible; se elige el candidato de mayor puntuación.",
    };
    Decision {
        surface: mention.surface.clone(),
        chosen,
        rationale: rationale.to_string(),
        source,
    }
}

/// Mayor puntuación; a igualdad, la IRI lexicográficamente menor.
pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().min_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.iri.cmp(&b.iri),
        other => other,
    })
}

fn is_none_signal(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "none" | "none_of_the_above" | "none of the above" | "ninguno"
    )
}

fn parse_verdict(response: &str, candidates: &[Candidate]) -> Verdict {
    let cleaned = strip_code_fences(response);
    let find = |iri: &str| candidates.iter().position(|c| c.iri == iri);

    let Ok(Value::Object(answer)) = serde_json::from_str::<Value>(cleaned) else {
        // Algunos modelos responden sólo con la IRI.
        return match find(cleaned) {
            Some(index) => Verdict::Chosen {
                index,
                rationale: String::new(),
            },
            None if is_none_signal(cleaned) => Verdict::NoneOfTheAbove {
                rationale: String::new(),
            },
            None => Verdict::Invalid(format!("respuesta no reconocida: {cleaned}")),
        };
    };

    let rationale = answer
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    match answer.get("iri") {
        None => Verdict::Invalid("falta el campo iri".to_string()),
        Some(Value::Null) => Verdict::NoneOfTheAbove { rationale },
        Some(Value::String(iri)) => match find(iri) {
            Some(index) => Verdict::Chosen { index, rationale },
            None if is_none_signal(iri) => Verdict::NoneOfTheAbove { rationale },
            None => Verdict::Invalid(format!("IRI fuera de la lista de candidatos: {iri}")),
        },
        Some(other) => Verdict::Invalid(format!("campo iri con tipo inesperado: {other}")),
    }
}

/// Ventana de `window` caracteres a cada lado de la mención.
pub fn context_window(text: &str, start: usize, end: usize, window: usize) -> String {
    let left = start.saturating_sub(window);
    let right = end.saturating_add(window);
    text.chars().skip(left).take(right - left).collect()
}
