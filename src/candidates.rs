//! Generación de candidatos: búsqueda full-text de cada mención sobre la
//! taxonomía, deduplicada por IRI y acotada a `top_k`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::models::{Candidate, Mention};
use crate::taxonomy::ConceptSearch;

/// Candidatos de una mención y si la búsqueda tuvo que degradarse.
#[derive(Debug, Clone, Default)]
pub struct CandidateOutcome {
    pub candidates: Vec<Candidate>,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct CandidateGenerator {
    search: Arc<dyn ConceptSearch>,
    use_label_hint: bool,
    timeout: Duration,
}

impl CandidateGenerator {
    pub fn new(search: Arc<dyn ConceptSearch>, use_label_hint: bool, timeout: Duration) -> Self {
        Self {
            search,
            use_label_hint,
            timeout,
        }
    }

    /// Nunca falla: un error o timeout de la búsqueda deja a la mención sin
    /// candidatos y la marca como degradada.
    pub async fn generate(&self, mention: &Mention, top_k: usize) -> CandidateOutcome {
        let hint = if self.use_label_hint && !mention.label.trim().is_empty() {
            Some(mention.label.as_str())
        } else {
            None
        };

        let search = self.search.search(&mention.surface, hint, top_k);
        match tokio::time::timeout(self.timeout, search).await {
            Ok(Ok(raw)) => {
                let candidates = rank_candidates(raw, top_k);
                debug!(surface = %mention.surface, count = candidates.len(), "candidatos obtenidos");
                CandidateOutcome {
                    candidates,
                    degraded: false,
                }
            }
            Ok(Err(e)) => {
                warn!(surface = %mention.surface, error = %e, "Fallo en la búsqueda de candidatos; se continúa sin candidatos");
                CandidateOutcome {
                    candidates: Vec::new(),
                    degraded: true,
                }
            }
            Err(_) => {
                warn!(surface = %mention.surface, "Timeout en la búsqueda de candidatos; se continúa sin candidatos");
                CandidateOutcome {
                    candidates: Vec::new(),
                    degraded: true,
                }
            }
        }
    }
}

/// Deduplica por IRI (se queda la mayor puntuación), ordena por puntuación
/// descendente (empate: IRI ascendente) y trunca a `top_k`.
pub fn rank_candidates(raw: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    let mut best: HashMap<String, Candidate> = HashMap::with_capacity(raw.len());
    for mut candidate in raw {
        if candidate.iri.trim().is_empty() {
            continue;
        }
        if !candidate.score.is_finite() {
            candidate.score = 0.0;
        }
        match best.get(&candidate.iri) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.iri.clone(), candidate);
            }
        }
    }

    let mut ranked: Vec<Candidate> = best.into_values().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.iri.cmp(&b.iri)));
    ranked.truncate(top_k);
    ranked
}
