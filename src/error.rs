//! Errores del pipeline que sí se propagan hasta la petición.
//!
//! Los fallos de búsqueda, caminos, evidencia y decisión se recuperan
//! localmente y nunca llegan aquí.

use crate::rdf::RdfError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Texto vacío o parámetros numéricos fuera de rango.
    #[error("entrada inválida: {0}")]
    InvalidInput(String),

    /// Fallo del reconocimiento de entidades: sin menciones no hay nada que hacer.
    #[error("error de generación en la extracción de menciones: {0}")]
    Extraction(String),

    /// Error interno al materializar el grafo.
    #[error("error al materializar el grafo: {0}")]
    Materialization(#[from] RdfError),
}

impl PipelineError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn extraction(msg: impl std::fmt::Display) -> Self {
        Self::Extraction(msg.to_string())
    }
}
