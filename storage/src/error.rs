//! Driver-error classification into the core's closed error kinds.

use corpora_models::CoreError;

/// Classify a reqwest error from the vector store REST API.
pub fn classify_http(err: reqwest::Error) -> CoreError {
    if err.is_timeout() || err.is_connect() {
        return CoreError::transient(format!("vector store unreachable: {}", err));
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), err.to_string());
    }
    CoreError::dependency("vector_store", err.to_string())
}

/// Classify an HTTP status from any external store endpoint.
pub fn classify_status(status: u16, body: String) -> CoreError {
    match status {
        409 => CoreError::Conflict(body),
        404 => CoreError::NotFound(body),
        400 | 422 => CoreError::Permanent(body),
        429 | 500..=599 => CoreError::transient(format!("status {}: {}", status, body)),
        _ => CoreError::dependency("vector_store", format!("status {}: {}", status, body)),
    }
}

/// Classify a sqlx error from the metadata store.
pub fn classify_sqlx(err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
        sqlx::Error::Database(db) => {
            // 23505 unique_violation, 23503 foreign_key_violation
            match db.code().as_deref() {
                Some("23505") => CoreError::Conflict(db.message().to_string()),
                Some(code) if code.starts_with("23") => {
                    CoreError::Permanent(db.message().to_string())
                }
                _ => CoreError::dependency("metadata_store", db.message().to_string()),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            CoreError::transient(format!("metadata store unavailable: {}", err))
        }
        _ => CoreError::dependency("metadata_store", err.to_string()),
    }
}

/// Classify a neo4rs error from the graph store.
pub fn classify_neo4j(err: neo4rs::Error) -> CoreError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("connection") || lowered.contains("timeout") || lowered.contains("io error")
    {
        CoreError::transient(format!("graph store unavailable: {}", message))
    } else if lowered.contains("constraint") {
        CoreError::Conflict(message)
    } else {
        CoreError::dependency("graph_store", message)
    }
}
