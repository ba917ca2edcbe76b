//! Carga y gestión de configuración de la aplicación (Neo4j + LLM + pipeline).
//!
//! La configuración se construye una única vez al arrancar el proceso y se
//! pasa explícitamente a cada componente. Ningún componente vuelve a leer el
//! entorno durante un análisis.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
        }
    }
}

/// Estrategia de búsqueda de caminos en la taxonomía.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStrategy {
    /// `shortestPath` nativo de Neo4j, con BFS en memoria si falla.
    Native,
    /// Siempre BFS en memoria sobre la vecindad descargada del grafo.
    Bfs,
}

impl FromStr for PathStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "bfs" => Ok(Self::Bfs),
            other => Err(anyhow!("Estrategia de caminos no soportada: {other}")),
        }
    }
}

/// Política para emparejar menciones al buscar caminos entre sus candidatos.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingPolicy {
    /// Todos los pares (i, j) con `j - i <= window`.
    AllPairs { window: Option<usize> },
    /// Sólo menciones consecutivas (i, i + 1).
    Sequential,
}

impl PairingPolicy {
    pub fn parse(policy: &str, window: Option<usize>) -> Result<Self> {
        match policy.trim().to_lowercase().as_str() {
            "all-pairs" | "all_pairs" => Ok(Self::AllPairs { window }),
            "sequential" => Ok(Self::Sequential),
            other => Err(anyhow!("Política de emparejado no soportada: {other}")),
        }
    }
}

/// Parámetros del pipeline de desambiguación.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub default_top_k: usize,
    pub default_max_hops: usize,
    pub default_hub_threshold: Option<usize>,
    pub path_strategy: PathStrategy,
    pub pairing: PairingPolicy,
    pub intra_mention_paths: bool,
    pub skos_relations: Vec<String>,
    pub call_timeout: Duration,
    pub context_window_chars: usize,
    pub search_label_hint: bool,
    pub rdf_base_namespace: String,
    pub graph_log_path: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            default_max_hops: 2,
            default_hub_threshold: None,
            path_strategy: PathStrategy::Native,
            pairing: PairingPolicy::AllPairs { window: None },
            intra_mention_paths: false,
            skos_relations: vec![
                "SKOS_BROADER".to_string(),
                "SKOS_NARROWER".to_string(),
                "SKOS_RELATED".to_string(),
            ],
            call_timeout: Duration::from_secs(60),
            context_window_chars: 80,
            search_label_hint: false,
            rdf_base_namespace: "http://example.org/".to_string(),
            graph_log_path: None,
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: Option<String>,
    pub neo4j_fulltext_index: String,
    pub neo4j_max_connections: usize,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,

    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri = env::var("NEO4J_URI")
            .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?;
        let neo4j_user = env::var("NEO4J_USER")
            .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?;
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;
        let neo4j_database = optional_var("NEO4J_DATABASE");
        let neo4j_fulltext_index =
            env::var("NEO4J_FULLTEXT_INDEX").unwrap_or_else(|_| "skos_fulltext".to_string());
        let neo4j_max_connections = parse_var("NEO4J_MAX_CONNECTIONS", 16)?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:5050".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let pipeline = PipelineConfig::from_env()?;

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            neo4j_database,
            neo4j_fulltext_index,
            neo4j_max_connections,
            server_addr,
            llm_provider,
            llm_chat_model,
            pipeline,
        })
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let default_top_k = parse_var("DEFAULT_TOP_K", defaults.default_top_k)?;
        if default_top_k == 0 {
            return Err(anyhow!("DEFAULT_TOP_K debe ser >= 1"));
        }
        let default_max_hops = parse_var("DEFAULT_MAX_HOPS", defaults.default_max_hops)?;
        let default_hub_threshold = parse_optional_var("DEFAULT_HUB_THRESHOLD")?;

        let path_strategy = match optional_var("PATH_STRATEGY") {
            Some(raw) => raw.parse()?,
            None => defaults.path_strategy,
        };
        let window = parse_optional_var("PATH_PAIR_WINDOW")?;
        let pairing = PairingPolicy::parse(
            &env::var("PATH_PAIRING").unwrap_or_else(|_| "all-pairs".to_string()),
            window,
        )?;
        let intra_mention_paths = parse_var("INTRA_MENTION_PATHS", defaults.intra_mention_paths)?;

        let skos_relations = match optional_var("SKOS_RELATIONS") {
            Some(raw) => parse_relation_list(&raw)?,
            None => defaults.skos_relations,
        };

        let call_timeout = Duration::from_secs(parse_var("CALL_TIMEOUT_SECS", 60u64)?);
        let context_window_chars =
            parse_var("CONTEXT_WINDOW_CHARS", defaults.context_window_chars)?;
        let search_label_hint = parse_var("SEARCH_LABEL_HINT", defaults.search_label_hint)?;

        let mut rdf_base_namespace =
            env::var("RDF_BASE_NAMESPACE").unwrap_or(defaults.rdf_base_namespace);
        if !rdf_base_namespace.ends_with('/') && !rdf_base_namespace.ends_with('#') {
            rdf_base_namespace.push('/');
        }
        url::Url::parse(&rdf_base_namespace)
            .with_context(|| format!("RDF_BASE_NAMESPACE no es una IRI válida: {rdf_base_namespace}"))?;

        Ok(Self {
            default_top_k,
            default_max_hops,
            default_hub_threshold,
            path_strategy,
            pairing,
            intra_mention_paths,
            skos_relations,
            call_timeout,
            context_window_chars,
            search_label_hint,
            rdf_base_namespace,
            graph_log_path: optional_var("GRAPH_LOG_PATH"),
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("Valor inválido para {key} ('{raw}'): {e}")),
        None => Ok(default),
    }
}

fn parse_optional_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow!("Valor inválido para {key} ('{raw}'): {e}"))
        })
        .transpose()
}

/// Los tipos de relación se interpolan en Cypher, así que sólo se aceptan
/// identificadores simples.
fn parse_relation_list(raw: &str) -> Result<Vec<String>> {
    let relations: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();

    if relations.is_empty() {
        return Err(anyhow!("SKOS_RELATIONS no puede estar vacío"));
    }
    if let Some(bad) = relations
        .iter()
        .find(|r| !r.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
    {
        return Err(anyhow!("Tipo de relación inválido en SKOS_RELATIONS: {bad}"));
    }
    Ok(relations)
}
