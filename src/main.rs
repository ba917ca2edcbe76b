// Módulos de la aplicación
mod api;
mod app_state;
mod candidates;
mod config;
mod disambiguation;
mod error;
mod evidence;
mod graph_log;
mod llm;
mod mentions;
mod models;
mod neo4j_client;
mod paths;
mod pipeline;
mod rdf;
mod taxonomy;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::neo4j_client::Neo4jTaxonomy;
use crate::pipeline::{Capabilities, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Conectar a Neo4j y asegurar esquemas
    let graph = Arc::new(
        neo4j_client::connect_from_config(&cfg)
            .await
            .context("Error conectando a Neo4j")?,
    );
    neo4j_client::ensure_schema(&graph, &cfg.neo4j_fulltext_index)
        .await
        .context("Error asegurando el esquema de Neo4j")?;

    // 4. Inicializar gestor de LLMs y taxonomía
    let llm_manager = Arc::new(llm::LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?);
    let taxonomy = Arc::new(Neo4jTaxonomy::new(
        graph.clone(),
        &cfg.neo4j_fulltext_index,
        cfg.pipeline.skos_relations.clone(),
    )?);
    info!(
        provider = cfg.llm_provider.as_str(),
        model = %cfg.llm_chat_model,
        strategy = ?cfg.pipeline.path_strategy,
        "Componentes inicializados"
    );

    // 5. Crear pipeline y estado compartido de la aplicación
    let pipeline = Pipeline::new(
        cfg.pipeline.clone(),
        Capabilities {
            generator: llm_manager,
            search: taxonomy.clone(),
            adjacency: taxonomy.clone(),
            native_paths: Some(taxonomy),
        },
    );
    let app_state = AppState {
        config: cfg.clone(),
        graph,
        pipeline: Arc::new(pipeline),
    };

    // 6. Configurar el router de la API
    let app = Router::new().merge(api::create_router(app_state.clone())).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {server_addr}"))?;
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("No se pudo escuchar Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
