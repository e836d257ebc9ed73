// ABOUTME: PostgreSQL connection helpers - TLS setup, retries and lazy reconnection
// ABOUTME: Shared by the source reader, the sink writer and the schedule override table

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::error::SyncError;
use crate::utils::{retry_with_backoff, sanitize_url, TableRef};

static ALLOW_SELF_SIGNED_CERTS: AtomicBool = AtomicBool::new(false);

/// Set the process-wide TLS policy. Call once at startup, before connecting.
pub fn init_tls_policy(allow_self_signed: bool) {
    if allow_self_signed {
        tracing::warn!("TLS certificate verification is disabled for PostgreSQL connections");
    }
    ALLOW_SELF_SIGNED_CERTS.store(allow_self_signed, Ordering::Relaxed);
}

/// Open one connection and drive it on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let mut builder = TlsConnector::builder();
    if ALLOW_SELF_SIGNED_CERTS.load(Ordering::Relaxed) {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with three retries and exponential backoff starting at one second.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    retry_with_backoff(|| connect(url), 3, Duration::from_secs(1)).await
}

/// A single connection that is opened on first use and reopened once closed.
///
/// Failures to (re)connect surface as `SyncError::Connectivity` tagged with the
/// component name, so callers can flip their health flag and retry next tick.
pub struct PgConnection {
    component: &'static str,
    url: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PgConnection {
    pub fn new(component: &'static str, url: impl Into<String>) -> Self {
        Self {
            component,
            url: url.into(),
            client: Mutex::new(None),
        }
    }

    /// Connection string with the password masked.
    pub fn display_url(&self) -> String {
        sanitize_url(&self.url)
    }

    pub async fn client(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::warn!(
                "{} connection to {} was closed, reconnecting",
                self.component,
                self.display_url()
            );
        }

        let client = connect_with_retry(&self.url)
            .await
            .map_err(|e| SyncError::Connectivity {
                component: self.component,
                reason: format!("{:#}", e),
            })?;
        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// `SELECT 1` round-trip.
    pub async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| SyncError::Connectivity {
                component: self.component,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (
                     SELECT 1 FROM information_schema.tables
                     WHERE table_schema = $1 AND table_name = $2
                 )",
                &[&table.schema, &table.table],
            )
            .await
            .with_context(|| format!("Failed to check whether {} exists", table.qualified_name()))?;
        row.try_get(0).context("Failed to read table existence flag")
    }
}
