//! Pipeline de desambiguación completo.
//!
//! Flujo de un análisis:
//!   1. Validación de la petición (sin efectos si falla).
//!   2. Extracción de menciones con el LLM (fallo fatal).
//!   3. Candidatos por mención, en paralelo.
//!   4. Caminos entre candidatos de cada par de menciones; cada par espera
//!      sólo a los candidatos de sus dos menciones.
//!   5. Redacción de cada camino (una vez por camino distinto) y resumen de
//!      la evidencia por mención.
//!   6. Decisión por mención, en paralelo.
//!
//! Las etapas 4 a 6 forman un orden parcial: una mención avanza en cuanto
//! terminan sus propios candidatos y los pares que la tocan, sin esperar al
//! resto de menciones.
//!   7. Materialización del grafo en el orden de las menciones de entrada.
//!   8. Registro del grafo (opcional, nunca falla la petición).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::candidates::{CandidateGenerator, CandidateOutcome};
use crate::config::{PathStrategy, PipelineConfig};
use crate::disambiguation::Disambiguator;
use crate::error::PipelineError;
use crate::evidence::EvidenceTextualizer;
use crate::graph_log::{GraphLog, GraphLogEntry};
use crate::llm::TextGenerator;
use crate::mentions::extract_mentions;
use crate::models::{
    AnalyzeParams, AnalyzeRequest, AnalyzeResponse, ChosenConcept, Decision, DisambiguatedMention,
    FallbackReport, MentionCandidates, Path, PathEvidence,
};
use crate::paths::{
    paths_for_mention, plan_pairs, BfsPathFinder, PairPaths, PathConstraints, PathEvidenceBuilder, PathFinder,
};
use crate::rdf::GraphMaterializer;
use crate::taxonomy::{AdjacencySource, ConceptSearch};

/// Capacidades externas que consume el pipeline.
#[derive(Clone)]
pub struct Capabilities {
    pub generator: Arc<dyn TextGenerator>,
    pub search: Arc<dyn ConceptSearch>,
    pub adjacency: Arc<dyn AdjacencySource>,
    /// Búsqueda de caminos nativa del almacén, si la hay.
    pub native_paths: Option<Arc<dyn PathFinder>>,
}

/// Estado de una mención antes de materializar el grafo.
struct ResolvedMention {
    outcome: CandidateOutcome,
    paths: Vec<Path>,
    evidence_degraded: bool,
    summary: String,
    decision: Decision,
}

pub struct Pipeline {
    config: PipelineConfig,
    generator: Arc<dyn TextGenerator>,
    candidates: CandidateGenerator,
    paths: PathEvidenceBuilder,
    textualizer: EvidenceTextualizer,
    disambiguator: Disambiguator,
    materializer: GraphMaterializer,
    graph_log: Option<GraphLog>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, caps: Capabilities) -> Self {
        let timeout = config.call_timeout;
        let bfs: Arc<dyn PathFinder> = Arc::new(BfsPathFinder::new(caps.adjacency.clone()));

        let paths = match (config.path_strategy, caps.native_paths) {
            (PathStrategy::Native, Some(native)) => PathEvidenceBuilder::new(native, Some(bfs), timeout),
            (PathStrategy::Native, None) => {
                warn!("Estrategia nativa sin soporte en el almacén; se usa BFS en memoria");
                PathEvidenceBuilder::new(bfs, None, timeout)
            }
            (PathStrategy::Bfs, _) => PathEvidenceBuilder::new(bfs, None, timeout),
        };

        Self {
            candidates: CandidateGenerator::new(caps.search, config.search_label_hint, timeout),
            paths,
            textualizer: EvidenceTextualizer::new(caps.generator.clone(), timeout),
            disambiguator: Disambiguator::new(caps.generator.clone(), timeout, config.context_window_chars),
            materializer: GraphMaterializer::new(&config.rdf_base_namespace),
            graph_log: config.graph_log_path.as_deref().map(GraphLog::new),
            generator: caps.generator,
            config,
        }
    }

    /// Valida la entrada y completa los valores por defecto.
    pub fn prepare(&self, params: AnalyzeParams) -> Result<AnalyzeRequest, PipelineError> {
        if params.text.trim().is_empty() {
            return Err(PipelineError::invalid_input("el campo 'text' es obligatorio y no puede estar vacío"));
        }

        let top_k = match params.top_k {
            None => self.config.default_top_k,
            Some(k) if k >= 1 => k as usize,
            Some(k) => return Err(PipelineError::invalid_input(format!("top_k debe ser >= 1 (recibido {k})"))),
        };
        let max_hops = match params.max_hops {
            None => self.config.default_max_hops,
            Some(h) if h >= 0 => h as usize,
            Some(h) => return Err(PipelineError::invalid_input(format!("max_hops debe ser >= 0 (recibido {h})"))),
        };
        let hub_threshold = match params.hub_threshold {
            None => self.config.default_hub_threshold,
            Some(t) if t >= 0 => Some(t as usize),
            Some(t) => {
                return Err(PipelineError::invalid_input(format!("hub_threshold debe ser >= 0 (recibido {t})")))
            }
        };
        let idempotence_key = params
            .idempotence_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(AnalyzeRequest {
            text: params.text,
            top_k,
            max_hops,
            hub_threshold,
            idempotence_key,
        })
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    /// Comprobación del LLM para `/health`, con el mismo timeout que el resto
    /// de llamadas.
    pub async fn llm_health(&self) -> anyhow::Result<()> {
        tokio::time::timeout(self.config.call_timeout, self.generator.health())
            .await
            .map_err(|_| anyhow::anyhow!("timeout tras {:?}", self.config.call_timeout))?
    }

    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse, PipelineError> {
        let span = info_span!("analyze", idempotence_key = %request.idempotence_key);
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse, PipelineError> {
        let start_time = Utc::now();
        let text = request.text.as_str();

        let mentions = extract_mentions(self.generator.as_ref(), text, self.config.call_timeout).await?;
        info!(mentions = mentions.len(), top_k = request.top_k, max_hops = request.max_hops, "Iniciando desambiguación");

        // Candidatos: cada futuro se comparte entre la mención y sus pares.
        let candidate_futures: Vec<Shared<BoxFuture<'_, CandidateOutcome>>> = mentions
            .iter()
            .map(|mention| {
                let generator = &self.candidates;
                let top_k = request.top_k;
                async move { generator.generate(mention, top_k).await }.boxed().shared()
            })
            .collect();

        let constraints = PathConstraints {
            max_hops: request.max_hops,
            hub_threshold: request.hub_threshold,
        };
        let mut pairs = if constraints.max_hops == 0 {
            Vec::new()
        } else {
            plan_pairs(mentions.len(), self.config.pairing)
        };
        if self.config.intra_mention_paths && constraints.max_hops > 0 {
            pairs.extend((0..mentions.len()).map(|i| (i, i)));
        }

        let pair_futures: Vec<Shared<BoxFuture<'_, PairPaths>>> = pairs
            .iter()
            .map(|&(i, j)| {
                let left = candidate_futures[i].clone();
                let right = candidate_futures[j].clone();
                async move {
                    let (left, right) = futures::join!(left, right);
                    self.paths
                        .paths_between((i, left.candidates.as_slice()), (j, right.candidates.as_slice()), constraints)
                        .await
                }
                .boxed()
                .shared()
            })
            .collect();

        // Cada camino distinto se redacta una sola vez, aunque lo compartan
        // varias menciones.
        let renderings: Mutex<HashMap<Path, Shared<BoxFuture<'_, Option<String>>>>> = Mutex::new(HashMap::new());
        let render = |path: &Path| {
            let mut cache = renderings.lock().unwrap_or_else(PoisonError::into_inner);
            let rendering = cache
                .entry(path.clone())
                .or_insert_with(|| {
                    let path = path.clone();
                    async move { self.textualizer.render(&path).await }.boxed().shared()
                })
                .clone();
            rendering
        };

        // Cada mención espera sólo a sus candidatos y a los pares que la tocan.
        let per_mention = mentions.iter().enumerate().map(|(idx, mention)| {
            let own = candidate_futures[idx].clone();
            let touching: Vec<_> = pairs
                .iter()
                .zip(&pair_futures)
                .filter(|((i, j), _)| *i == idx || *j == idx)
                .map(|(_, pair)| pair.clone())
                .collect();
            let render = &render;
            async move {
                let (outcome, touching) = futures::join!(own, join_all(touching));
                let (paths, paths_degraded) = paths_for_mention(idx, &touching);
                let texts = join_all(paths.iter().map(render)).await;
                let evidence = self.textualizer.summarize(&texts).await;
                let decision = self
                    .disambiguator
                    .decide(text, mention, &outcome.candidates, &evidence.summary)
                    .await;
                ResolvedMention {
                    outcome,
                    paths,
                    evidence_degraded: paths_degraded || evidence.degraded,
                    summary: evidence.summary,
                    decision,
                }
            }
        });
        let resolved: Vec<ResolvedMention> = join_all(per_mention).await;
        // Liberan los préstamos sobre `mentions`.
        drop(renderings);
        drop(pair_futures);
        drop(candidate_futures);

        let decisions: Vec<_> = resolved.iter().map(|r| r.decision.clone()).collect();
        let graph = self.materializer.materialize(text, &mentions, &decisions)?;

        let candidate_selections = mentions
            .iter()
            .zip(&resolved)
            .map(|(m, r)| MentionCandidates {
                surface: m.surface.clone(),
                candidates: r.outcome.candidates.clone(),
            })
            .collect();

        let disambiguation: Vec<DisambiguatedMention> = mentions
            .iter()
            .zip(resolved)
            .map(|(mention, r)| DisambiguatedMention {
                surface: mention.surface.clone(),
                label: mention.label.clone(),
                start: mention.start,
                end: mention.end,
                chosen: r.decision.chosen.as_ref().map(ChosenConcept::from),
                rationale: r.decision.rationale,
                evidence: PathEvidence {
                    paths: r.paths,
                    summary: r.summary,
                },
                fallback: FallbackReport {
                    candidates: r.outcome.degraded,
                    evidence: r.evidence_degraded,
                    decision: r.decision.source,
                },
            })
            .collect();

        let fallbacks = disambiguation
            .iter()
            .filter(|d| d.fallback.candidates || d.fallback.evidence || d.fallback.decision.is_fallback())
            .count();
        info!(
            document_uri = %graph.document_uri,
            linked = disambiguation.iter().filter(|d| d.chosen.is_some()).count(),
            fallbacks,
            "Análisis completado"
        );

        if let Some(log) = &self.graph_log {
            log.append(&GraphLogEntry {
                start_time,
                end_time: Utc::now(),
                idempotence_key: &request.idempotence_key,
                input_text: text,
                document_uri: &graph.document_uri,
                ntriples: &graph.primary_serialization,
                model: self.generator.model_name(),
            })
            .await;
        }

        Ok(AnalyzeResponse {
            text: request.text.clone(),
            mentions,
            candidate_selections,
            disambiguation,
            graph,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PairingPolicy;
    use crate::models::DecisionSource;
    use crate::rdf::{parse_jsonld, parse_ntriples, Term};
    use crate::taxonomy::{AdjacencyEdge, InMemoryTaxonomy};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    type DecideFn = Box<dyn Fn(&Value) -> Option<String> + Send + Sync>;

    /// LLM de guion: distingue la etapa por la forma del payload.
    struct ScriptedLlm {
        ner: Option<String>,
        decide: DecideFn,
        decision_calls: AtomicUsize,
        path_calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(ner: Option<&str>, decide: DecideFn) -> Self {
            Self {
                ner: ner.map(str::to_string),
                decide,
                decision_calls: AtomicUsize::new(0),
                path_calls: AtomicUsize::new(0),
            }
        }

        /// Elige siempre el primer candidato del payload.
        fn first_candidate(ner: &str) -> Self {
            Self::new(
                Some(ner),
                Box::new(|payload: &Value| {
                    let iri = payload["candidates"][0]["iri"].as_str()?;
                    Some(format!(r#"{{"iri": "{iri}", "rationale": "encaja con el contexto"}}"#))
                }),
            )
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedLlm {
        async fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
            match serde_json::from_str::<Value>(prompt) {
                Ok(payload) if payload.get("candidates").is_some() => {
                    self.decision_calls.fetch_add(1, Ordering::SeqCst);
                    (self.decide)(&payload).ok_or_else(|| anyhow!("decisión no disponible"))
                }
                Ok(Value::Array(_)) => {
                    self.path_calls.fetch_add(1, Ordering::SeqCst);
                    Ok("un concepto es más específico que el otro".to_string())
                }
                _ => self.ner.clone().ok_or_else(|| anyhow!("NER no disponible")),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    /// Cuenta las descargas de vecindad para saber si hubo búsqueda de caminos.
    struct CountingAdjacency {
        inner: InMemoryTaxonomy,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AdjacencySource for CountingAdjacency {
        async fn neighbourhood(&self, iris: &[String]) -> Result<Vec<AdjacencyEdge>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.neighbourhood(iris).await
        }
    }

    fn taxonomy() -> InMemoryTaxonomy {
        InMemoryTaxonomy::new()
            .with_concept("ccs:ml", "Machine learning")
            .with_concept("ccs:ai", "Artificial intelligence")
            .with_concept("ccs:crypto", "Cryptography")
            .with_concept("ccs:computing", "Computing methodologies")
            .with_edge("ccs:ml", "SKOS_BROADER", "ccs:ai")
            .with_edge("ccs:ai", "SKOS_BROADER", "ccs:computing")
            .with_edge("ccs:crypto", "SKOS_BROADER", "ccs:computing")
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            path_strategy: PathStrategy::Bfs,
            pairing: PairingPolicy::AllPairs { window: None },
            call_timeout: Duration::from_secs(2),
            ..PipelineConfig::default()
        }
    }

    struct Harness {
        pipeline: Pipeline,
        llm: Arc<ScriptedLlm>,
        adjacency: Arc<CountingAdjacency>,
    }

    fn harness(llm: ScriptedLlm) -> Harness {
        let llm = Arc::new(llm);
        let adjacency = Arc::new(CountingAdjacency {
            inner: taxonomy(),
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new(
            config(),
            Capabilities {
                generator: llm.clone(),
                search: Arc::new(taxonomy()),
                adjacency: adjacency.clone(),
                native_paths: None,
            },
        );
        Harness {
            pipeline,
            llm,
            adjacency,
        }
    }

    /// Búsqueda nativa que tarda `delay` en el par `slow` (en cualquier
    /// sentido) y delega el resto en el BFS.
    struct SlowPair {
        slow: (&'static str, &'static str),
        delay: Duration,
        inner: BfsPathFinder,
    }

    #[async_trait]
    impl PathFinder for SlowPair {
        async fn shortest_path(
            &self,
            source: &str,
            target: &str,
            constraints: PathConstraints,
        ) -> Result<Option<Path>> {
            let (a, b) = self.slow;
            if (source == a && target == b) || (source == b && target == a) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.shortest_path(source, target, constraints).await
        }
    }

    fn native_harness(llm: ScriptedLlm, native: Arc<dyn PathFinder>, call_timeout: Duration) -> Harness {
        let llm = Arc::new(llm);
        let adjacency = Arc::new(CountingAdjacency {
            inner: taxonomy(),
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new(
            PipelineConfig {
                path_strategy: PathStrategy::Native,
                call_timeout,
                ..config()
            },
            Capabilities {
                generator: llm.clone(),
                search: Arc::new(taxonomy()),
                adjacency: adjacency.clone(),
                native_paths: Some(native),
            },
        );
        Harness {
            pipeline,
            llm,
            adjacency,
        }
    }

    fn params(text: &str) -> AnalyzeParams {
        AnalyzeParams {
            text: text.to_string(),
            idempotence_key: Some("test-key".to_string()),
            ..AnalyzeParams::default()
        }
    }

    async fn analyze(h: &Harness, text: &str) -> std::result::Result<AnalyzeResponse, PipelineError> {
        let request = h.pipeline.prepare(params(text))?;
        h.pipeline.analyze(request).await
    }

    #[tokio::test]
    async fn single_unambiguous_mention_links_without_path_search() {
        let h = harness(ScriptedLlm::first_candidate(
            r#"{"mentions": [{"surface": "Cryptography", "label": "Field", "start": 0, "end": 12}]}"#,
        ));
        let response = tokio_test::assert_ok!(analyze(&h, "Cryptography matters.").await);

        let d = &response.disambiguation[0];
        assert_eq!(d.chosen.as_ref().map(|c| c.iri.as_str()), Some("ccs:crypto"));
        assert_eq!(d.fallback.decision, DecisionSource::Capability);
        assert!(d.evidence.paths.is_empty());
        assert_eq!(h.adjacency.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.llm.path_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn adjacent_candidates_produce_one_hop_evidence() {
        let h = harness(ScriptedLlm::first_candidate(
            r#"{"mentions": [
                {"surface": "Machine learning", "label": "Field"},
                {"surface": "artificial intelligence", "label": "Field"}
            ]}"#,
        ));
        let response = analyze(&h, "Machine learning is part of artificial intelligence.")
            .await
            .unwrap();

        assert_eq!(response.mentions.len(), 2);
        for d in &response.disambiguation {
            assert_eq!(d.evidence.paths.len(), 1);
            assert_eq!(d.evidence.paths[0].len(), 1);
            assert!(!d.evidence.summary.is_empty());
            assert!(!d.fallback.evidence);
        }
        // El mismo camino se redacta una vez aunque lo compartan dos menciones.
        assert_eq!(h.llm.path_calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.disambiguation[1].chosen.as_ref().unwrap().iri, "ccs:ai");
    }

    #[tokio::test]
    async fn mention_without_candidates_is_left_unlinked() {
        let h = harness(ScriptedLlm::first_candidate(
            r#"{"mentions": [
                {"surface": "quantum computing", "label": "Field"},
                {"surface": "Cryptography", "label": "Field"}
            ]}"#,
        ));
        let response = analyze(&h, "quantum computing threatens Cryptography")
            .await
            .unwrap();

        let first = &response.disambiguation[0];
        assert!(first.chosen.is_none());
        assert_eq!(first.fallback.decision, DecisionSource::NoCandidates);
        assert!(first.evidence.paths.is_empty());
        assert!(first.evidence.summary.is_empty());
        assert!(response.candidate_selections[0].candidates.is_empty());
        // Sólo se consulta al LLM de decisión por la mención con candidatos.
        assert_eq!(h.llm.decision_calls.load(Ordering::SeqCst), 1);

        let triples = parse_ntriples(&response.graph.primary_serialization).unwrap();
        let denotes = triples
            .iter()
            .filter(|t| t.predicate == "http://example.org/denotes")
            .count();
        assert_eq!(denotes, 1);
    }

    #[tokio::test]
    async fn unknown_iri_from_decision_falls_back_to_best_candidate() {
        let h = harness(ScriptedLlm::new(
            Some(r#"{"mentions": [{"surface": "Machine learning", "label": "Field"}]}"#),
            Box::new(|_: &Value| Some(r#"{"iri": "ccs:does-not-exist", "rationale": "?"}"#.to_string())),
        ));
        let response = analyze(&h, "Machine learning everywhere").await.unwrap();

        let d = &response.disambiguation[0];
        assert_eq!(d.chosen.as_ref().unwrap().iri, "ccs:ml");
        assert_eq!(d.fallback.decision, DecisionSource::InvalidAnswer);
        assert!(d.fallback.decision.is_fallback());
    }

    #[tokio::test]
    async fn decision_outage_degrades_every_mention_but_succeeds() {
        let h = harness(ScriptedLlm::new(
            Some(
                r#"{"mentions": [
                    {"surface": "Machine learning", "label": "Field"},
                    {"surface": "Cryptography", "label": "Field"}
                ]}"#,
            ),
            Box::new(|_: &Value| None),
        ));
        let response = analyze(&h, "Machine learning meets Cryptography").await.unwrap();
        assert_eq!(response.disambiguation.len(), 2);
        assert!(response
            .disambiguation
            .iter()
            .all(|d| d.chosen.is_some() && d.fallback.decision == DecisionSource::Unavailable));
    }

    #[tokio::test]
    async fn ner_failure_is_fatal() {
        let h = harness(ScriptedLlm::new(None, Box::new(|_: &Value| None)));
        let err = analyze(&h, "Machine learning").await.unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(_)));
    }

    #[tokio::test]
    async fn results_follow_mention_order_and_graph_is_stable() {
        let ner = r#"{"mentions": [
            {"surface": "Cryptography", "label": "Field"},
            {"surface": "Machine learning", "label": "Field"},
            {"surface": "artificial intelligence", "label": "Field"}
        ]}"#;
        let text = "Cryptography and Machine learning within artificial intelligence";
        let a = analyze(&harness(ScriptedLlm::first_candidate(ner)), text).await.unwrap();
        let b = analyze(&harness(ScriptedLlm::first_candidate(ner)), text).await.unwrap();

        let surfaces: Vec<&str> = a.disambiguation.iter().map(|d| d.surface.as_str()).collect();
        assert_eq!(surfaces, vec!["Cryptography", "Machine learning", "artificial intelligence"]);
        assert_eq!(a.graph, b.graph);
        assert_eq!(
            parse_ntriples(&a.graph.primary_serialization).unwrap(),
            parse_jsonld(&a.graph.alternate_serialization).unwrap()
        );
        assert!(parse_ntriples(&a.graph.primary_serialization)
            .unwrap()
            .iter()
            .any(|t| t.object == Term::Iri("ccs:crypto".to_string())));
    }

    #[tokio::test]
    async fn hop_bound_limits_evidence() {
        // crypto y ml sólo se conectan a través de dos nodos intermedios.
        let h = harness(ScriptedLlm::first_candidate(
            r#"{"mentions": [
                {"surface": "Cryptography", "label": "Field"},
                {"surface": "Machine learning", "label": "Field"}
            ]}"#,
        ));
        let mut request = h.pipeline.prepare(params("Cryptography vs Machine learning")).unwrap();
        request.max_hops = 2;
        let response = h.pipeline.analyze(request).await.unwrap();
        assert!(response.disambiguation.iter().all(|d| d.evidence.paths.is_empty()));

        let mut request = h.pipeline.prepare(params("Cryptography vs Machine learning")).unwrap();
        request.max_hops = 3;
        let response = h.pipeline.analyze(request).await.unwrap();
        let paths = &response.disambiguation[0].evidence.paths;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 3);
    }

    #[tokio::test]
    async fn slow_pair_only_delays_the_mentions_it_touches() {
        let started = Instant::now();
        let timings: Arc<Mutex<Vec<(String, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = timings.clone();
        let llm = ScriptedLlm::new(
            Some(
                r#"{"mentions": [
                    {"surface": "Machine learning", "label": "Field"},
                    {"surface": "artificial intelligence", "label": "Field"},
                    {"surface": "Cryptography", "label": "Field"}
                ]}"#,
            ),
            Box::new(move |payload: &Value| {
                let surface = payload["surface"].as_str()?.to_string();
                seen.lock().unwrap().push((surface, started.elapsed()));
                let iri = payload["candidates"][0]["iri"].as_str()?;
                Some(format!(r#"{{"iri": "{iri}", "rationale": "encaja"}}"#))
            }),
        );
        let slow = SlowPair {
            slow: ("ccs:ai", "ccs:crypto"),
            delay: Duration::from_millis(1500),
            inner: BfsPathFinder::new(Arc::new(taxonomy())),
        };
        let h = native_harness(llm, Arc::new(slow), Duration::from_secs(5));

        let response = analyze(&h, "Machine learning, artificial intelligence and Cryptography")
            .await
            .unwrap();
        assert!(response.disambiguation.iter().all(|d| d.chosen.is_some()));

        let timings = timings.lock().unwrap();
        let decided_at = |surface: &str| {
            timings
                .iter()
                .find(|(s, _)| s == surface)
                .map(|(_, at)| *at)
                .expect("decisión registrada")
        };
        // La mención 0 no participa en el par (1, 2).
        assert!(
            decided_at("Machine learning") < Duration::from_secs(1),
            "la mención 0 esperó {:?}",
            decided_at("Machine learning")
        );
        assert!(decided_at("artificial intelligence") >= Duration::from_millis(1500));
        assert!(decided_at("Cryptography") >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn hanging_native_paths_degrade_evidence_but_request_succeeds() {
        let hanging = SlowPair {
            slow: ("ccs:ml", "ccs:ai"),
            delay: Duration::from_secs(30),
            inner: BfsPathFinder::new(Arc::new(taxonomy())),
        };
        let h = native_harness(
            ScriptedLlm::first_candidate(
                r#"{"mentions": [
                    {"surface": "Machine learning", "label": "Field"},
                    {"surface": "artificial intelligence", "label": "Field"}
                ]}"#,
            ),
            Arc::new(hanging),
            Duration::from_millis(200),
        );

        let response = tokio_test::assert_ok!(analyze(&h, "Machine learning is part of artificial intelligence").await);
        for d in &response.disambiguation {
            assert!(d.fallback.evidence);
            assert!(d.chosen.is_some());
            // El BFS de respaldo encuentra el mismo salto directo.
            assert_eq!(d.evidence.paths.len(), 1);
        }
        assert!(h.adjacency.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn llm_health_reflects_the_generator() {
        let up = harness(ScriptedLlm::first_candidate(r#"{"mentions": []}"#));
        tokio_test::assert_ok!(up.pipeline.llm_health().await);

        let down = harness(ScriptedLlm::new(None, Box::new(|_: &Value| None)));
        tokio_test::assert_err!(down.pipeline.llm_health().await);
    }

    #[test]
    fn request_validation() {
        let h = harness(ScriptedLlm::first_candidate(r#"{"mentions": []}"#));
        assert!(matches!(h.pipeline.prepare(params("   ")), Err(PipelineError::InvalidInput(_))));

        let bad_top_k = AnalyzeParams {
            top_k: Some(0),
            ..params("texto")
        };
        assert!(matches!(h.pipeline.prepare(bad_top_k), Err(PipelineError::InvalidInput(_))));

        let bad_hops = AnalyzeParams {
            max_hops: Some(-1),
            ..params("texto")
        };
        assert!(matches!(h.pipeline.prepare(bad_hops), Err(PipelineError::InvalidInput(_))));

        let defaults = h.pipeline.prepare(AnalyzeParams { idempotence_key: None, ..params("texto") }).unwrap();
        assert_eq!(defaults.top_k, 5);
        assert_eq!(defaults.max_hops, 2);
        assert_eq!(defaults.hub_threshold, None);
        assert!(Uuid::parse_str(&defaults.idempotence_key).is_ok());
    }
}
