//! Extracción de menciones (NER) a través del LLM.
//!
//! A diferencia del resto de etapas, un fallo aquí es fatal para la petición:
//! sin menciones no hay nada que desambiguar.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::llm::{strip_code_fences, TextGenerator};
use crate::models::Mention;

const NER_PROMPT: &str = r#"
Eres un sistema de reconocimiento de entidades para textos de informática.
Identifica las menciones a áreas, técnicas, tecnologías o conceptos que puedan
corresponder a un concepto de la ACM Computing Classification System.

Responde SOLO con un JSON con esta forma exacta:
{"mentions": [{"surface": "...", "label": "...", "start": 0, "end": 0, "confidence": 0.0}]}

- "surface": el fragmento exacto tal como aparece en el texto.
- "label": el tipo de entidad (por ejemplo Field, Technique, Technology).
- "start" y "end": posiciones de carácter (inicio incluido, fin excluido).
- "confidence": opcional, entre 0 y 1.
Si no hay menciones, responde {"mentions": []}.
"#;

#[derive(Debug, Deserialize)]
struct NerResponse {
    #[serde(default)]
    mentions: Vec<RawMention>,
}

#[derive(Debug, Deserialize)]
struct RawMention {
    #[serde(default)]
    surface: String,
    #[serde(default)]
    label: String,
    start: Option<i64>,
    end: Option<i64>,
    confidence: Option<f64>,
}

/// Pide al LLM las menciones del texto y las ancla a posiciones válidas.
pub async fn extract_mentions(
    generator: &dyn TextGenerator,
    text: &str,
    timeout: Duration,
) -> Result<Vec<Mention>, PipelineError> {
    let response = tokio::time::timeout(timeout, generator.generate(NER_PROMPT, text))
        .await
        .map_err(|_| PipelineError::extraction(format!("timeout tras {timeout:?}")))?
        .map_err(PipelineError::extraction)?;

    let mentions = parse_mentions(text, &response)?;
    debug!(count = mentions.len(), "menciones extraídas");
    Ok(mentions)
}

/// Interpreta la respuesta del NER. JSON inválido es un error; menciones
/// sueltas que no se pueden anclar se descartan.
pub fn parse_mentions(text: &str, response: &str) -> Result<Vec<Mention>, PipelineError> {
    let parsed: NerResponse = serde_json::from_str(strip_code_fences(response))
        .map_err(|e| PipelineError::extraction(format!("respuesta NER no es JSON válido: {e}")))?;

    let chars: Vec<char> = text.chars().collect();
    let mut mentions: Vec<Mention> = Vec::with_capacity(parsed.mentions.len());
    let mut cursor = 0usize;

    for raw in parsed.mentions {
        let surface = raw.surface.trim();
        if surface.is_empty() {
            warn!("Mención con superficie vacía descartada");
            continue;
        }
        let surface_chars: Vec<char> = surface.chars().collect();

        let declared = match (raw.start, raw.end) {
            (Some(s), Some(e)) if s >= 0 && e >= 0 => Some((s as usize, e as usize)),
            _ => None,
        };
        let anchored = declared
            .filter(|&(s, e)| s < e && e <= chars.len() && chars[s..e] == surface_chars[..])
            .or_else(|| {
                // Tras la mención anterior; si el NER las desordenó, desde el principio.
                find_chars(&chars, &surface_chars, cursor)
                    .or_else(|| find_chars(&chars, &surface_chars, 0))
                    .map(|s| (s, s + surface_chars.len()))
            });

        let Some((start, end)) = anchored else {
            warn!(surface, "Mención no encontrada en el texto; se descarta");
            continue;
        };
        if declared != Some((start, end)) {
            debug!(surface, start, end, "mención re-anclada");
        }

        cursor = end;
        mentions.push(Mention {
            surface: surface.to_string(),
            label: raw.label.trim().to_string(),
            start,
            end,
            confidence: raw.confidence.filter(|c| c.is_finite()),
        });
    }
    Ok(mentions)
}

/// Primera aparición de `needle` en `haystack` a partir de `from`.
fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}
