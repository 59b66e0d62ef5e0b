//! Foreground contexts and best-effort broadcast to them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};
use url::Url;

use crate::error::{SwError, SwResult};
use crate::messages::OutboundMessage;

/// Something the worker asks a foreground context to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Deliver a message.
    Message(OutboundMessage),
    /// Navigate to a URL (a reload when it is the current one).
    Navigate(Url),
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// A connected foreground context.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Current location.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    /// Post message to client.
    pub fn post_message(&self, message: OutboundMessage) -> SwResult<()> {
        self.tx
            .send(ClientEvent::Message(message))
            .map_err(|_| SwError::State(format!("client {} is gone", self.id)))
    }

    /// Navigate client to URL.
    pub fn navigate(&self, url: Url) -> SwResult<()> {
        if self.client_type != ClientType::Window {
            return Err(SwError::State(
                "Can only navigate window clients".to_string(),
            ));
        }
        self.tx
            .send(ClientEvent::Navigate(url))
            .map_err(|_| SwError::State(format!("client {} is gone", self.id)))
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    pub client_type: ClientType,
}

/// Registry of connected clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client; its events arrive on the returned receiver.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> (Client, mpsc::UnboundedReceiver<ClientEvent>) {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            client_type,
            tx,
        };
        debug!(id = %client.id, url = %client.url, "Client connected");
        self.clients
            .write()
            .await
            .insert(client.id.clone(), client.clone());
        (client, rx)
    }

    /// Remove a client.
    pub async fn disconnect(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Match all clients of the requested type.
    pub async fn match_all(&self, options: ClientMatchOptions) -> Vec<Client> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .cloned()
            .collect()
    }
}

/// Delivers worker messages to every window client.
#[derive(Debug, Clone)]
pub struct ClientNotifier {
    clients: Arc<Clients>,
}

impl ClientNotifier {
    pub fn new(clients: Arc<Clients>) -> Self {
        Self { clients }
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    /// Deliver to each window client independently. Returns how many
    /// deliveries succeeded; an unreachable client does not stop the rest.
    pub async fn broadcast(&self, message: OutboundMessage) -> usize {
        let targets = self.clients.match_all(ClientMatchOptions::default()).await;
        let mut delivered = 0;
        for client in &targets {
            match client.post_message(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(client = %client.id, error = %e, "Dropped message"),
            }
        }
        trace!(?message, delivered, targets = targets.len(), "Broadcast");
        delivered
    }

    /// Ask every window client to reload its current location.
    pub async fn reload_all(&self) -> usize {
        let targets = self.clients.match_all(ClientMatchOptions::default()).await;
        targets
            .iter()
            .filter(|c| c.navigate(c.url.clone()).is_ok())
            .count()
    }
}
