//! Registro JSONL de los grafos materializados (una línea por análisis).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
pub struct GraphLogEntry<'a> {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub idempotence_key: &'a str,
    pub input_text: &'a str,
    pub document_uri: &'a str,
    pub ntriples: &'a str,
    pub model: &'a str,
}

#[derive(Debug, Clone)]
pub struct GraphLog {
    path: PathBuf,
}

impl GraphLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Añade la entrada al fichero. Un fallo de escritura sólo se registra.
    pub async fn append(&self, entry: &GraphLogEntry<'_>) {
        if let Err(e) = self.try_append(entry).await {
            warn!(path = %self.path.display(), error = %e, "No se pudo escribir el registro de grafos");
        }
    }

    async fn try_append(&self, entry: &GraphLogEntry<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(document_uri = entry.document_uri, "grafo registrado");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(key: &'a str) -> GraphLogEntry<'a> {
        let now = Utc::now();
        GraphLogEntry {
            start_time: now,
            end_time: now,
            idempotence_key: key,
            input_text: "texto",
            document_uri: "http://example.org/Document/abc",
            ntriples: "<a:b> <c:d> <e:f> .\n",
            model: "test",
        }
    }

    #[tokio::test]
    async fn appends_one_json_line_per_entry() {
        let path = std::env::temp_dir().join(format!("graph_log_{}.jsonl", uuid::Uuid::new_v4()));
        let log = GraphLog::new(&path);
        log.append(&entry("k1")).await;
        log.append(&entry("k2")).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["idempotence_key"], "k2");
        assert!(lines[0]["start_time"].is_string());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_directories_are_created() {
        let dir = std::env::temp_dir().join(format!("graph_log_dir_{}", uuid::Uuid::new_v4()));
        let path = dir.join("logs").join("graphs.jsonl");
        let log = GraphLog::new(&path);
        log.append(&entry("k")).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 1);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        // El "directorio" padre es un fichero: ni se crea ni se puede escribir.
        let blocker = std::env::temp_dir().join(format!("graph_log_blocker_{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&blocker, b"no soy un directorio").await.unwrap();
        let log = GraphLog::new(blocker.join("log.jsonl"));

        log.append(&entry("k")).await;
        assert!(log.try_append(&entry("k")).await.is_err());
        assert_eq!(tokio::fs::read(&blocker).await.unwrap(), b"no soy un directorio");
        let _ = tokio::fs::remove_file(&blocker).await;
    }
}
