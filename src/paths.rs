//! Evidencia de caminos entre candidatos de distintas menciones.
//!
//! Dos implementaciones intercambiables de [`PathFinder`]:
//!   - nativa: `shortestPath` de Neo4j (ver `neo4j_client`);
//!   - [`BfsPathFinder`]: BFS en memoria sobre la vecindad descargada.
//!
//! Ambas aplican las mismas [`PathConstraints`] (longitud máxima y poda de
//! hubs sobre nodos intermedios), así que sus resultados son comparables.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::config::PairingPolicy;
use crate::models::{Candidate, Path, PathStep};
use crate::taxonomy::{AdjacencyEdge, AdjacencySource};

/// Consultas de camino simultáneas dentro de un mismo par de menciones.
const PAIR_QUERY_CONCURRENCY: usize = 8;

/// Restricciones de búsqueda compartidas por todas las estrategias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathConstraints {
    pub max_hops: usize,
    pub hub_threshold: Option<usize>,
}

impl PathConstraints {
    /// Un nodo sólo puede atravesarse si su grado no supera el umbral.
    pub fn admits_intermediate(&self, degree: usize) -> bool {
        self.hub_threshold.map_or(true, |limit| degree <= limit)
    }

    /// Comprueba un camino ya construido; `degree_of` da el grado de cada nodo.
    pub fn admits_path<F>(&self, path: &Path, degree_of: F) -> bool
    where
        F: Fn(&str) -> usize,
    {
        path.len() <= self.max_hops
            && path
                .intermediate_iris()
                .into_iter()
                .all(|iri| self.admits_intermediate(degree_of(iri)))
    }
}

#[async_trait]
pub trait PathFinder: Send + Sync {
    /// Camino más corto entre dos conceptos, o `None` si no existe dentro
    /// de las restricciones.
    async fn shortest_path(
        &self,
        source: &str,
        target: &str,
        constraints: PathConstraints,
    ) -> Result<Option<Path>>;
}

/// Vista en memoria de una porción de la taxonomía.
#[derive(Debug, Clone, Default)]
pub struct AdjacencyView {
    adjacency: BTreeMap<String, BTreeSet<(String, String)>>,
    labels: HashMap<String, String>,
    degrees: HashMap<String, usize>,
    expanded: HashSet<String>,
}

impl AdjacencyView {
    pub fn extend(&mut self, edges: Vec<AdjacencyEdge>) {
        for edge in edges {
            if let Some(label) = edge.source_label.filter(|l| !l.is_empty()) {
                self.labels.insert(edge.source.clone(), label);
            }
            if let Some(label) = edge.target_label.filter(|l| !l.is_empty()) {
                self.labels.insert(edge.target.clone(), label);
            }
            self.degrees.insert(edge.source.clone(), edge.source_degree);
            self.degrees.insert(edge.target.clone(), edge.target_degree);
            self.adjacency
                .entry(edge.source)
                .or_default()
                .insert((edge.predicate, edge.target));
        }
    }

    pub fn mark_expanded(&mut self, iri: &str) {
        self.expanded.insert(iri.to_string());
    }

    pub fn is_expanded(&self, iri: &str) -> bool {
        self.expanded.contains(iri)
    }

    pub fn degree(&self, iri: &str) -> usize {
        self.degrees.get(iri).copied().unwrap_or(0)
    }

    fn neighbours(&self, iri: &str) -> impl Iterator<Item = &(String, String)> {
        self.adjacency.get(iri).into_iter().flatten()
    }

    fn label(&self, iri: &str) -> Option<String> {
        self.labels.get(iri).cloned()
    }

    fn reaches(&self, iri: &str) -> bool {
        self.adjacency
            .values()
            .any(|edges| edges.iter().any(|(_, target)| target == iri))
    }
}

/// BFS acotado: el vecino con menor (predicado, IRI) se explora primero, así
/// que el resultado es estable para la misma vista.
pub fn bfs_shortest_path(
    view: &AdjacencyView,
    source: &str,
    target: &str,
    constraints: PathConstraints,
) -> Option<Path> {
    if source == target || constraints.max_hops == 0 {
        return None;
    }

    let mut visited: HashSet<&str> = HashSet::from([source]);
    let mut parents: HashMap<&str, (&str, &str)> = HashMap::new();
    let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(source, 0)]);

    while let Some((current, depth)) = queue.pop_front() {
        if depth >= constraints.max_hops {
            continue;
        }
        for (predicate, next) in view.neighbours(current) {
            let next = next.as_str();
            if visited.contains(next) {
                continue;
            }
            if next == target {
                parents.insert(next, (current, predicate.as_str()));
                return Some(rebuild_path(view, &parents, source, target));
            }
            if !constraints.admits_intermediate(view.degree(next)) {
                continue;
            }
            visited.insert(next);
            parents.insert(next, (current, predicate.as_str()));
            queue.push_back((next, depth + 1));
        }
    }
    None
}

fn rebuild_path(
    view: &AdjacencyView,
    parents: &HashMap<&str, (&str, &str)>,
    source: &str,
    target: &str,
) -> Path {
    let mut steps = Vec::new();
    let mut cursor = target;
    while cursor != source {
        let Some(&(parent, predicate)) = parents.get(cursor) else {
            break;
        };
        steps.push(PathStep {
            subject_iri: parent.to_string(),
            subject_label: view.label(parent),
            predicate: predicate.to_string(),
            object_iri: cursor.to_string(),
            object_label: view.label(cursor),
        });
        cursor = parent;
    }
    steps.reverse();
    Path { steps }
}

/// Estrategia de respaldo: descarga la vecindad del origen capa a capa y
/// ejecuta [`bfs_shortest_path`] sobre ella.
#[derive(Clone)]
pub struct BfsPathFinder {
    source: Arc<dyn AdjacencySource>,
}

impl BfsPathFinder {
    pub fn new(source: Arc<dyn AdjacencySource>) -> Self {
        Self { source }
    }

    async fn load_view(
        &self,
        origin: &str,
        target: &str,
        constraints: PathConstraints,
    ) -> Result<AdjacencyView> {
        let mut view = AdjacencyView::default();
        let mut frontier = vec![origin.to_string()];

        for depth in 0..constraints.max_hops {
            if frontier.is_empty() {
                break;
            }
            let edges = self.source.neighbourhood(&frontier).await?;
            for iri in &frontier {
                view.mark_expanded(iri);
            }
            view.extend(edges);

            // Todo lo que está a distancia <= depth ya está expandido: si el
            // destino aparece ahora, el camino más corto ya está en la vista.
            if view.reaches(target) || depth + 1 == constraints.max_hops {
                break;
            }

            let next: Vec<String> = frontier
                .iter()
                .flat_map(|iri| view.neighbours(iri).map(|(_, t)| t.clone()))
                .filter(|iri| !view.is_expanded(iri))
                .filter(|iri| constraints.admits_intermediate(view.degree(iri)))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            frontier = next;
        }
        Ok(view)
    }
}

#[async_trait]
impl PathFinder for BfsPathFinder {
    async fn shortest_path(
        &self,
        source: &str,
        target: &str,
        constraints: PathConstraints,
    ) -> Result<Option<Path>> {
        if source == target || constraints.max_hops == 0 {
            return Ok(None);
        }
        let view = self.load_view(source, target, constraints).await?;
        Ok(bfs_shortest_path(&view, source, target, constraints))
    }
}

/// Pares de menciones (por ordinal) cuyos candidatos se conectan.
pub fn plan_pairs(mention_count: usize, policy: PairingPolicy) -> Vec<(usize, usize)> {
    match policy {
        PairingPolicy::Sequential => (1..mention_count).map(|j| (j - 1, j)).collect(),
        PairingPolicy::AllPairs { window } => {
            let mut pairs = Vec::new();
            for i in 0..mention_count {
                for j in (i + 1)..mention_count {
                    if window.map_or(true, |w| j - i <= w) {
                        pairs.push((i, j));
                    }
                }
            }
            pairs
        }
    }
}

/// Caminos encontrados para un par de menciones (o una mención consigo misma
/// cuando se comparan sus propios candidatos).
#[derive(Debug, Clone, Default)]
pub struct PairPaths {
    pub left: usize,
    pub right: usize,
    pub paths: Vec<Path>,
    /// Alguna consulta falló en la estrategia principal (se usó BFS o se
    /// perdió ese camino).
    pub degraded: bool,
}

/// Calcula caminos entre conjuntos de candidatos con la estrategia
/// principal y, si falla, con la de respaldo.
#[derive(Clone)]
pub struct PathEvidenceBuilder {
    primary: Arc<dyn PathFinder>,
    fallback: Option<Arc<dyn PathFinder>>,
    timeout: Duration,
}

impl PathEvidenceBuilder {
    pub fn new(
        primary: Arc<dyn PathFinder>,
        fallback: Option<Arc<dyn PathFinder>>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    /// Caminos entre cada candidato de `left` y cada candidato de `right`.
    /// Con alguno de los conjuntos vacío no hay consultas.
    pub async fn paths_between(
        &self,
        (left_idx, left): (usize, &[Candidate]),
        (right_idx, right): (usize, &[Candidate]),
        constraints: PathConstraints,
    ) -> PairPaths {
        let mut queries: Vec<(String, String)> = Vec::new();
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for a in left {
            for b in right {
                let key = if a.iri <= b.iri {
                    (a.iri.as_str(), b.iri.as_str())
                } else {
                    (b.iri.as_str(), a.iri.as_str())
                };
                if a.iri != b.iri && seen.insert(key) {
                    queries.push((a.iri.clone(), b.iri.clone()));
                }
            }
        }

        let results: Vec<(Option<Path>, bool)> = stream::iter(queries)
            .map(|(source, target)| async move { self.search_one(&source, &target, constraints).await })
            .buffered(PAIR_QUERY_CONCURRENCY)
            .collect()
            .await;

        let mut pair = PairPaths {
            left: left_idx,
            right: right_idx,
            ..PairPaths::default()
        };
        for (path, degraded) in results {
            pair.degraded |= degraded;
            if let Some(path) = path {
                if !pair.paths.contains(&path) {
                    pair.paths.push(path);
                }
            }
        }
        debug!(
            left = left_idx,
            right = right_idx,
            paths = pair.paths.len(),
            degraded = pair.degraded,
            "caminos calculados"
        );
        pair
    }

    async fn search_one(
        &self,
        source: &str,
        target: &str,
        constraints: PathConstraints,
    ) -> (Option<Path>, bool) {
        match self.timed(self.primary.as_ref(), source, target, constraints).await {
            Ok(path) => return (path, false),
            Err(e) => warn!(%source, %target, error = %e, "Fallo en la búsqueda de caminos principal"),
        }

        let Some(fallback) = &self.fallback else {
            return (None, true);
        };
        match self.timed(fallback.as_ref(), source, target, constraints).await {
            Ok(path) => (path, true),
            Err(e) => {
                warn!(%source, %target, error = %e, "Fallo también en el BFS en memoria; par sin camino");
                (None, true)
            }
        }
    }

    async fn timed(
        &self,
        finder: &dyn PathFinder,
        source: &str,
        target: &str,
        constraints: PathConstraints,
    ) -> Result<Option<Path>> {
        tokio::time::timeout(self.timeout, finder.shortest_path(source, target, constraints))
            .await
            .map_err(|_| anyhow!("timeout tras {:?}", self.timeout))?
    }
}

/// Caminos que tocan a la mención `idx`, sin repetidos y en orden de par.
pub fn paths_for_mention(idx: usize, pairs: &[PairPaths]) -> (Vec<Path>, bool) {
    let mut paths: Vec<Path> = Vec::new();
    let mut degraded = false;
    for pair in pairs.iter().filter(|p| p.left == idx || p.right == idx) {
        degraded |= pair.degraded;
        for path in &pair.paths {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
    }
    (paths, degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::InMemoryTaxonomy;

    fn taxonomy() -> InMemoryTaxonomy {
        // ml-algos -> ml -> ai <- robotics ; "computing" es un hub que lo toca todo
        InMemoryTaxonomy::new()
            .with_concept("ccs:ml-algos", "Machine learning algorithms")
            .with_concept("ccs:ml", "Machine learning")
            .with_concept("ccs:ai", "Artificial intelligence")
            .with_concept("ccs:robotics", "Robotics")
            .with_concept("ccs:crypto", "Cryptography")
            .with_concept("ccs:computing", "Computing methodologies")
            .with_edge("ccs:ml-algos", "SKOS_BROADER", "ccs:ml")
            .with_edge("ccs:ml", "SKOS_BROADER", "ccs:ai")
            .with_edge("ccs:robotics", "SKOS_BROADER", "ccs:ai")
            .with_edge("ccs:ml-algos", "SKOS_BROADER", "ccs:computing")
            .with_edge("ccs:crypto", "SKOS_BROADER", "ccs:computing")
            .with_edge("ccs:ai", "SKOS_BROADER", "ccs:computing")
            .with_edge("ccs:robotics", "SKOS_BROADER", "ccs:computing")
    }

    fn cand(iri: &str) -> Candidate {
        Candidate {
            iri: iri.to_string(),
            label: iri.to_string(),
            score: 1.0,
        }
    }

    fn constraints(max_hops: usize, hub_threshold: Option<usize>) -> PathConstraints {
        PathConstraints {
            max_hops,
            hub_threshold,
        }
    }

    struct Broken;

    #[async_trait]
    impl PathFinder for Broken {
        async fn shortest_path(&self, _: &str, _: &str, _: PathConstraints) -> Result<Option<Path>> {
            Err(anyhow!("procedimiento shortestPath no disponible"))
        }
    }

    /// Nunca responde a tiempo.
    struct Hanging;

    #[async_trait]
    impl PathFinder for Hanging {
        async fn shortest_path(&self, _: &str, _: &str, _: PathConstraints) -> Result<Option<Path>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
    }

    fn bfs(tax: InMemoryTaxonomy) -> BfsPathFinder {
        BfsPathFinder::new(Arc::new(tax))
    }

    #[tokio::test]
    async fn adjacent_concepts_yield_single_hop_path() {
        let path = bfs(taxonomy())
            .shortest_path("ccs:ml", "ccs:ai", constraints(2, None))
            .await
            .unwrap()
            .expect("camino directo");
        assert_eq!(path.len(), 1);
        assert_eq!(path.steps[0].predicate, "SKOS_BROADER");
        assert_eq!(path.steps[0].subject_label.as_deref(), Some("Machine learning"));
    }

    #[tokio::test]
    async fn hop_bound_is_respected() {
        let finder = bfs(taxonomy());
        // ml-algos -> ml -> ai -> robotics son 3 saltos sin pasar por el hub,
        // pero vía computing son 2.
        let via_hub = finder
            .shortest_path("ccs:ml-algos", "ccs:robotics", constraints(2, None))
            .await
            .unwrap()
            .expect("camino por el hub");
        assert_eq!(via_hub.node_iris(), vec!["ccs:ml-algos", "ccs:computing", "ccs:robotics"]);

        let none = finder
            .shortest_path("ccs:ml-algos", "ccs:robotics", constraints(1, None))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn hubs_are_pruned_from_intermediate_positions() {
        let finder = bfs(taxonomy());
        // computing tiene grado 4: con umbral 3 no puede atravesarse.
        let pruned = finder
            .shortest_path("ccs:ml-algos", "ccs:robotics", constraints(2, Some(3)))
            .await
            .unwrap();
        assert!(pruned.is_none());

        let longer = finder
            .shortest_path("ccs:ml-algos", "ccs:robotics", constraints(3, Some(3)))
            .await
            .unwrap()
            .expect("camino evitando el hub");
        assert_eq!(longer.len(), 3);
        let tax = taxonomy();
        assert!(constraints(3, Some(3)).admits_path(&longer, |iri| tax.degree(iri)));
        assert!(!longer.intermediate_iris().contains(&"ccs:computing"));
    }

    #[tokio::test]
    async fn hub_may_still_be_an_endpoint() {
        let path = bfs(taxonomy())
            .shortest_path("ccs:crypto", "ccs:computing", constraints(2, Some(1)))
            .await
            .unwrap();
        assert_eq!(path.map(|p| p.len()), Some(1));
    }

    #[tokio::test]
    async fn zero_hops_and_identical_endpoints_yield_nothing() {
        let finder = bfs(taxonomy());
        assert!(finder
            .shortest_path("ccs:ml", "ccs:ai", constraints(0, None))
            .await
            .unwrap()
            .is_none());
        assert!(finder
            .shortest_path("ccs:ml", "ccs:ml", constraints(2, None))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn pairing_policies() {
        assert_eq!(
            plan_pairs(3, PairingPolicy::AllPairs { window: None }),
            vec![(0, 1), (0, 2), (1, 2)]
        );
        assert_eq!(
            plan_pairs(4, PairingPolicy::AllPairs { window: Some(1) }),
            vec![(0, 1), (1, 2), (2, 3)]
        );
        assert_eq!(plan_pairs(3, PairingPolicy::Sequential), vec![(0, 1), (1, 2)]);
        assert!(plan_pairs(1, PairingPolicy::AllPairs { window: None }).is_empty());
        assert!(plan_pairs(0, PairingPolicy::Sequential).is_empty());
    }

    #[tokio::test]
    async fn builder_falls_back_to_bfs_with_same_constraints() {
        let bfs_finder: Arc<dyn PathFinder> = Arc::new(bfs(taxonomy()));
        let builder = PathEvidenceBuilder::new(
            Arc::new(Broken),
            Some(bfs_finder.clone()),
            Duration::from_secs(1),
        );
        let left = vec![cand("ccs:ml")];
        let right = vec![cand("ccs:ai"), cand("ccs:crypto")];

        let pair = builder
            .paths_between((0, &left), (1, &right), constraints(1, None))
            .await;
        assert!(pair.degraded);
        assert_eq!(pair.paths.len(), 1);
        assert!(pair.paths.iter().all(|p| p.len() <= 1));

        let reference = PathEvidenceBuilder::new(bfs_finder, None, Duration::from_secs(1))
            .paths_between((0, &left), (1, &right), constraints(1, None))
            .await;
        assert!(!reference.degraded);
        assert_eq!(reference.paths, pair.paths);
    }

    #[tokio::test]
    async fn builder_without_fallback_degrades_to_empty() {
        let builder = PathEvidenceBuilder::new(Arc::new(Broken), None, Duration::from_secs(1));
        let left = vec![cand("a")];
        let right = vec![cand("b")];
        let pair = builder
            .paths_between((0, &left), (1, &right), constraints(2, None))
            .await;
        assert!(pair.paths.is_empty());
        assert!(pair.degraded);
    }

    #[tokio::test]
    async fn hanging_finder_times_out_and_degrades_the_pair() {
        let builder = PathEvidenceBuilder::new(Arc::new(Hanging), None, Duration::from_millis(50));
        let left = vec![cand("ccs:ml")];
        let right = vec![cand("ccs:ai")];

        let started = std::time::Instant::now();
        let pair = builder
            .paths_between((0, &left), (1, &right), constraints(2, None))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(pair.paths.is_empty());
        assert!(pair.degraded);

        // Con respaldo, el timeout de la principal da paso al BFS.
        let with_fallback = PathEvidenceBuilder::new(
            Arc::new(Hanging),
            Some(Arc::new(bfs(taxonomy()))),
            Duration::from_millis(50),
        )
        .paths_between((0, &left), (1, &right), constraints(2, None))
        .await;
        assert!(with_fallback.degraded);
        assert_eq!(with_fallback.paths.len(), 1);
    }

    #[tokio::test]
    async fn empty_candidate_set_means_no_queries() {
        let builder = PathEvidenceBuilder::new(Arc::new(Broken), None, Duration::from_secs(1));
        let left: Vec<Candidate> = Vec::new();
        let right = vec![cand("b")];
        let pair = builder
            .paths_between((0, &left), (1, &right), constraints(2, None))
            .await;
        assert!(pair.paths.is_empty());
        assert!(!pair.degraded);
    }

    #[test]
    fn mention_paths_are_collected_from_every_pair() {
        let p = |a: &str, b: &str| Path {
            steps: vec![PathStep {
                subject_iri: a.to_string(),
                subject_label: None,
                predicate: "SKOS_RELATED".to_string(),
                object_iri: b.to_string(),
                object_label: None,
            }],
        };
        let pairs = vec![
            PairPaths { left: 0, right: 1, paths: vec![p("a", "b")], degraded: false },
            PairPaths { left: 1, right: 2, paths: vec![p("b", "c"), p("a", "b")], degraded: true },
        ];
        let (paths, degraded) = paths_for_mention(1, &pairs);
        assert_eq!(paths.len(), 2);
        assert!(degraded);
        let (paths, degraded) = paths_for_mention(0, &pairs);
        assert_eq!(paths.len(), 1);
        assert!(!degraded);
    }
}
