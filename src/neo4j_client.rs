//! Acceso a la taxonomía SKOS almacenada en Neo4j.
//!
//! [`Neo4jTaxonomy`] implementa las tres capacidades que consume el pipeline:
//! búsqueda full-text de conceptos, descarga de vecindades (para el BFS) y
//! `shortestPath` nativo. Todas las consultas son de sólo lectura.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph, Query, RowStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::models::{Candidate, Path, PathStep};
use crate::paths::{PathConstraints, PathFinder};
use crate::taxonomy::{AdjacencyEdge, AdjacencySource, ConceptSearch};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri).context("NEO4J_URI no es una URL válida")?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    let build_config = || {
        let mut builder = neo4rs::ConfigBuilder::default()
            .uri(&addr)
            .user(&cfg.neo4j_user)
            .password(&cfg.neo4j_password)
            .max_connections(cfg.neo4j_max_connections);
        if let Some(db) = &cfg.neo4j_database {
            builder = builder.db(db.as_str());
        }
        builder.build()
    };

    info!("Conectando a Neo4j en {addr}...");
    let graph = match Graph::connect(build_config()?).await {
        Ok(graph) => graph,
        Err(e) => {
            warn!("Primer intento de conexión a Neo4j fallido ({e}); reintentando");
            Graph::connect(build_config()?).await?
        }
    };
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea la constraint de unicidad de `:Concept(uri)` y el índice full-text
/// sobre `prefLabel` que usa la búsqueda de candidatos.
pub async fn ensure_schema(graph: &Graph, fulltext_index: &str) -> Result<()> {
    if !is_identifier(fulltext_index) {
        return Err(anyhow!("Nombre de índice full-text inválido: {fulltext_index}"));
    }
    let statements = [
        "CREATE CONSTRAINT concept_uri IF NOT EXISTS
         FOR (c:Concept)
         REQUIRE c.uri IS UNIQUE"
            .to_string(),
        format!(
            "CREATE FULLTEXT INDEX {fulltext_index} IF NOT EXISTS
             FOR (c:Concept)
             ON EACH [c.prefLabel]"
        ),
    ];

    for stmt in statements {
        graph.run(query(&stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraint de :Concept e índice {fulltext_index}).");
    Ok(())
}

/// `RETURN 1` contra la base de datos.
pub async fn health(graph: &Graph) -> Result<()> {
    graph.run(query("RETURN 1")).await?;
    Ok(())
}

/// La taxonomía tal y como está cargada en Neo4j: nodos `:Concept` con
/// `uri` y `prefLabel`, unidos por relaciones SKOS.
#[derive(Clone)]
pub struct Neo4jTaxonomy {
    graph: Arc<Graph>,
    fulltext_index: String,
    relations: Vec<String>,
}

impl Neo4jTaxonomy {
    pub fn new(graph: Arc<Graph>, fulltext_index: &str, relations: Vec<String>) -> Result<Self> {
        if !is_identifier(fulltext_index) {
            return Err(anyhow!("Nombre de índice full-text inválido: {fulltext_index}"));
        }
        if relations.is_empty() || !relations.iter().all(|r| is_identifier(r)) {
            return Err(anyhow!("Lista de relaciones SKOS inválida: {relations:?}"));
        }
        Ok(Self {
            graph,
            fulltext_index: fulltext_index.to_string(),
            relations,
        })
    }

    /// `:SKOS_BROADER|SKOS_NARROWER|...`, ya validado como identificadores.
    fn relation_pattern(&self) -> String {
        format!(":{}", self.relations.join("|"))
    }

    /// Grado de `n` contando sólo relaciones SKOS, igual que el BFS.
    fn degree_expr(&self, var: &str) -> String {
        format!("size([({var})-[{}]-() | 1])", self.relation_pattern())
    }

    /// Un reintento inmediato ante cualquier fallo de la consulta.
    async fn execute_with_retry(&self, build: impl Fn() -> Query) -> Result<RowStream> {
        match self.graph.execute(build()).await {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                warn!("Consulta a Neo4j fallida ({e}); reintentando una vez");
                Ok(self.graph.execute(build()).await?)
            }
        }
    }
}

#[async_trait]
impl ConceptSearch for Neo4jTaxonomy {
    async fn search(
        &self,
        surface: &str,
        label_hint: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let Some(lucene) = lucene_query(surface, label_hint) else {
            return Ok(Vec::new());
        };

        let mut cursor = self
            .execute_with_retry(|| {
                query(
                    "CALL db.index.fulltext.queryNodes($index_name, $q)
                     YIELD node, score
                     RETURN node.uri AS iri, coalesce(node.prefLabel, '') AS label, score
                     ORDER BY score DESC, iri ASC
                     LIMIT $k",
                )
                .param("index_name", self.fulltext_index.clone())
                .param("q", lucene.clone())
                .param("k", limit as i64)
            })
            .await?;

        let mut out = Vec::new();
        while let Some(row) = cursor.next().await? {
            let Some(iri) = row.get::<String>("iri") else {
                continue;
            };
            let label: String = row.get("label").unwrap_or_default();
            let score: f64 = row.get("score").ok_or_else(|| anyhow!("Falta campo 'score' en resultado de Neo4j"))?;
            out.push(Candidate { iri, label, score });
        }
        debug!(surface, hits = out.len(), "búsqueda full-text");
        Ok(out)
    }
}

#[async_trait]
impl AdjacencySource for Neo4jTaxonomy {
    async fn neighbourhood(&self, iris: &[String]) -> Result<Vec<AdjacencyEdge>> {
        if iris.is_empty() {
            return Ok(Vec::new());
        }
        let cypher = format!(
            "UNWIND $iris AS iri
             MATCH (a:Concept {{uri: iri}})-[r{rels}]-(b:Concept)
             RETURN a.uri AS source, coalesce(a.prefLabel, '') AS source_label,
                    {deg_a} AS source_degree,
                    type(r) AS predicate,
                    b.uri AS target, coalesce(b.prefLabel, '') AS target_label,
                    {deg_b} AS target_degree",
            rels = self.relation_pattern(),
            deg_a = self.degree_expr("a"),
            deg_b = self.degree_expr("b"),
        );
        let wanted = iris.to_vec();

        let mut cursor = self
            .execute_with_retry(|| query(&cypher).param("iris", wanted.clone()))
            .await?;

        let mut edges = Vec::new();
        while let Some(row) = cursor.next().await? {
            let (Some(source), Some(predicate), Some(target)) = (
                row.get::<String>("source"),
                row.get::<String>("predicate"),
                row.get::<String>("target"),
            ) else {
                continue;
            };
            edges.push(AdjacencyEdge {
                source,
                source_label: non_empty(row.get("source_label")),
                source_degree: to_degree(row.get("source_degree")),
                predicate,
                target,
                target_label: non_empty(row.get("target_label")),
                target_degree: to_degree(row.get("target_degree")),
            });
        }
        Ok(edges)
    }
}

#[async_trait]
impl PathFinder for Neo4jTaxonomy {
    async fn shortest_path(
        &self,
        source: &str,
        target: &str,
        constraints: PathConstraints,
    ) -> Result<Option<Path>> {
        if source == target || constraints.max_hops == 0 {
            return Ok(None);
        }

        let cypher = format!(
            "MATCH (a:Concept {{uri: $source}}), (b:Concept {{uri: $target}})
             MATCH p = shortestPath((a)-[{rels}*1..{hops}]-(b))
             WHERE $hub < 0 OR all(n IN nodes(p)[1..-1] WHERE {deg_n} <= $hub)
             RETURN [n IN nodes(p) | n.uri] AS uris,
                    [n IN nodes(p) | coalesce(n.prefLabel, '')] AS labels,
                    [n IN nodes(p) | {deg_n}] AS degrees,
                    [r IN relationships(p) | type(r)] AS predicates
             LIMIT 1",
            rels = self.relation_pattern(),
            hops = constraints.max_hops,
            deg_n = self.degree_expr("n"),
        );
        let hub: i64 = constraints.hub_threshold.map_or(-1, |h| h as i64);

        let mut cursor = self
            .execute_with_retry(|| {
                query(&cypher)
                    .param("source", source.to_string())
                    .param("target", target.to_string())
                    .param("hub", hub)
            })
            .await?;

        let Some(row) = cursor.next().await? else {
            return Ok(None);
        };
        let uris: Vec<String> = row.get("uris").ok_or_else(|| anyhow!("Falta campo 'uris' en resultado de Neo4j"))?;
        let labels: Vec<String> = row.get("labels").unwrap_or_default();
        let degrees: Vec<i64> = row.get("degrees").unwrap_or_default();
        let predicates: Vec<String> =
            row.get("predicates").ok_or_else(|| anyhow!("Falta campo 'predicates' en resultado de Neo4j"))?;

        let path = assemble_path(&uris, &labels, &predicates)?;
        let degree_of = |iri: &str| {
            uris.iter()
                .position(|u| u == iri)
                .and_then(|i| degrees.get(i))
                .map_or(0, |&d| to_degree(Some(d)))
        };
        if !constraints.admits_path(&path, degree_of) {
            // El planificador de Cypher no garantiza el WHERE en todos los casos.
            return Err(anyhow!("shortestPath devolvió un camino fuera de las restricciones"));
        }
        Ok(Some(path))
    }
}

/// Pasos en orden de recorrido a partir de las listas devueltas por Cypher.
fn assemble_path(uris: &[String], labels: &[String], predicates: &[String]) -> Result<Path> {
    if uris.len() != predicates.len() + 1 {
        return Err(anyhow!(
            "Camino inconsistente: {} nodos y {} relaciones",
            uris.len(),
            predicates.len()
        ));
    }
    let label_at = |i: usize| non_empty(labels.get(i).cloned());
    let steps = predicates
        .iter()
        .enumerate()
        .map(|(i, predicate)| PathStep {
            subject_iri: uris[i].clone(),
            subject_label: label_at(i),
            predicate: predicate.clone(),
            object_iri: uris[i + 1].clone(),
            object_label: label_at(i + 1),
        })
        .collect();
    Ok(Path { steps })
}

/// Consulta Lucene para el índice full-text. Los términos se escapan; la
/// pista de etiqueta sólo suma puntuación.
fn lucene_query(surface: &str, label_hint: Option<&str>) -> Option<String> {
    let terms = lucene_terms(surface);
    if terms.is_empty() {
        return None;
    }
    match label_hint.map(lucene_terms).filter(|h| !h.is_empty()) {
        Some(hint) => Some(format!("+({terms}) ({hint})^0.3")),
        None => Some(terms),
    }
}

/// Escapa los caracteres especiales y pasa a minúsculas los operadores
/// `AND`/`OR`/`NOT`, que Lucene sólo reconoce en mayúsculas.
fn lucene_terms(input: &str) -> String {
    escape_lucene(input)
        .split_whitespace()
        .map(|word| match word {
            "AND" | "OR" | "NOT" => word.to_lowercase(),
            _ => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_lucene(input: &str) -> String {
    const SPECIAL: &str = "+-!(){}[]^\"~*?:\\/&|";
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if SPECIAL.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn to_degree(value: Option<i64>) -> usize {
    value.and_then(|d| usize::try_from(d).ok()).unwrap_or(0)
}
