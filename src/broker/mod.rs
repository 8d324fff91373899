//! The DDS broker: a star-topology bus mediating all client traffic.
//!
//! # Architecture
//!
//! ```text
//! TransportServer ──accepted TcpStream──► accept task
//!                                             │ spawns
//!                                             ▼
//!                              handle_connection (one task per client)
//!                                  │ handshake / REQ_UUID / CONN_READY
//!                                  ▼
//!                          Arc<Mutex<Registry>>
//!            subsystems · bindings · KV caches · subscriptions · events
//! ```
//!
//! The broker is in-memory only: nothing survives a restart, and clients
//! are expected to replay registrations and subscriptions on reconnect.

pub(crate) mod connection;
pub(crate) mod registry;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::logging::LogClient;
use crate::transport::TransportServer;

use connection::handle_connection;
use registry::Registry;

/// A running broker.
///
/// Dropping (or [`shutdown`](Broker::shutdown)) stops the accept loop and
/// tears down every client connection.
#[derive(Debug)]
pub struct Broker {
    local_addr: SocketAddr,
    server: TransportServer,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    logger: Option<Arc<LogClient>>,
}

impl Broker {
    /// Bind the broker and start serving.
    ///
    /// # Errors
    ///
    /// Bind failure is fatal.
    pub async fn bind(config: &BrokerConfig) -> Result<Self> {
        Self::bind_with_logger(config, None).await
    }

    /// Bind with an optional structured-log client for journal records.
    ///
    /// # Errors
    ///
    /// Bind failure is fatal.
    pub async fn bind_with_logger(
        config: &BrokerConfig,
        logger: Option<Arc<LogClient>>,
    ) -> Result<Self> {
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let server = TransportServer::bind(&config.bind_addr(), conn_tx).await?;
        let local_addr = server.local_addr();

        let registry = Arc::new(Mutex::new(Registry::new()));
        let conn_tasks = Arc::new(Mutex::new(Vec::new()));

        if let Some(logger) = &logger {
            logger.log("DEBUG", &format!("Binding {}", config.bind_addr()));
        }

        let accept_task = {
            let conn_tasks = Arc::clone(&conn_tasks);
            let logger = logger.clone();
            tokio::spawn(async move {
                while let Some(stream) = conn_rx.recv().await {
                    if let Some(logger) = &logger {
                        logger.log("DEBUG", "Client connected");
                    }
                    let handle = tokio::spawn(handle_connection(stream, Arc::clone(&registry)));
                    let mut tasks = conn_tasks.lock().expect("task list poisoned");
                    // Opportunistically reap finished handlers.
                    tasks.retain(|t: &JoinHandle<()>| !t.is_finished());
                    tasks.push(handle);
                }
            })
        };

        log::info!("[Broker] serving on {local_addr}");
        Ok(Self { local_addr, server, accept_task, conn_tasks, logger })
    }

    /// Actual bound address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every client connection.
    pub fn shutdown(&self) {
        if let Some(logger) = &self.logger {
            logger.log("INFO", "Broker shutting down");
        }
        self.server.shutdown();
        self.accept_task.abort();
        for task in self.conn_tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        log::info!("[Broker] stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.server.shutdown();
        self.accept_task.abort();
        for task in self.conn_tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }
}
