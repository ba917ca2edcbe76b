//! Conversión de caminos de la taxonomía en texto y resumen de la evidencia
//! de cada mención. La redacción la hace el LLM; aquí se arma el payload y
//! se valida la respuesta.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::warn;

use crate::llm::{strip_code_fences, TextGenerator};
use crate::models::Path;

const PATH_TO_TEXT_PROMPT: &str = r#"
Eres un experto en taxonomías SKOS (ACM Computing Classification System).
Recibirás un camino entre conceptos como JSON: una lista ordenada de saltos con
"subject", "predicate" y "object". Los predicados SKOS_BROADER, SKOS_NARROWER y
SKOS_RELATED significan "es más específico que", "es más general que" y
"está relacionado con".
Describe el camino en una o dos frases, en el mismo orden de recorrido.
Responde sólo con el texto, sin listas ni explicaciones adicionales.
"#;

const PATH_SUMMARY_PROMPT: &str = r#"
Eres un experto en taxonomías SKOS (ACM Computing Classification System).
Recibirás una lista JSON de frases, cada una describe cómo se conectan dos
conceptos de la taxonomía.
Resume en un único párrafo breve qué relación semántica sugieren en conjunto.
Responde sólo con el párrafo.
"#;

#[derive(Serialize)]
struct PathHop<'a> {
    subject: &'a str,
    predicate: &'a str,
    object: &'a str,
}

/// Texto de evidencia de una mención. `degraded` indica que alguna llamada
/// al LLM falló y el resumen puede estar vacío o incompleto.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceText {
    pub summary: String,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct EvidenceTextualizer {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
}

impl EvidenceTextualizer {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Redacta un camino; `None` si el LLM falló.
    pub async fn render(&self, path: &Path) -> Option<String> {
        match self.render_path(path).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(hops = path.len(), error = %e, "No se pudo convertir el camino a texto");
                None
            }
        }
    }

    async fn render_path(&self, path: &Path) -> Result<String> {
        let hops: Vec<PathHop<'_>> = path
            .steps
            .iter()
            .map(|step| PathHop {
                subject: step.subject_label.as_deref().unwrap_or(&step.subject_iri),
                predicate: &step.predicate,
                object: step.object_label.as_deref().unwrap_or(&step.object_iri),
            })
            .collect();
        let payload = serde_json::to_string(&hops)?;
        self.call(PATH_TO_TEXT_PROMPT, &payload).await
    }

    /// Une las redacciones de los caminos de una mención en un único pasaje.
    /// Con una sola redacción no hace falta llamar al LLM.
    pub async fn summarize(&self, renderings: &[Option<String>]) -> EvidenceText {
        let missing = renderings.iter().any(Option::is_none);
        let sentences: Vec<&str> = renderings.iter().flatten().map(String::as_str).collect();

        match sentences.as_slice() {
            [] => EvidenceText {
                summary: String::new(),
                degraded: missing,
            },
            [only] => EvidenceText {
                summary: (*only).to_string(),
                degraded: missing,
            },
            many => {
                let payload = match serde_json::to_string(many) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "No se pudo serializar las frases de evidencia");
                        return EvidenceText {
                            summary: String::new(),
                            degraded: true,
                        };
                    }
                };
                match self.call(PATH_SUMMARY_PROMPT, &payload).await {
                    Ok(summary) => EvidenceText {
                        summary,
                        degraded: missing,
                    },
                    Err(e) => {
                        warn!(paths = many.len(), error = %e, "No se pudo resumir la evidencia; se deja vacía");
                        EvidenceText {
                            summary: String::new(),
                            degraded: true,
                        }
                    }
                }
            }
        }
    }

    async fn call(&self, system_prompt: &str, payload: &str) -> Result<String> {
        let response = tokio::time::timeout(self.timeout, self.generator.generate(system_prompt, payload))
            .await
            .map_err(|_| anyhow!("timeout tras {:?}", self.timeout))??;
        normalize_text(&response)
    }
}

/// Acepta texto plano o una lista JSON de frases (algunos modelos devuelven
/// el formato del payload). Rechaza respuestas vacías.
fn normalize_text(response: &str) -> Result<String> {
    let cleaned = strip_code_fences(response);
    let text = match serde_json::from_str::<Vec<String>>(cleaned) {
        Ok(sentences) => sentences
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => cleaned.split_whitespace().collect::<Vec<_>>().join(" "),
    };
    if text.is_empty() {
        return Err(anyhow!("respuesta vacía del LLM"));
    }
    Ok(text)
}
