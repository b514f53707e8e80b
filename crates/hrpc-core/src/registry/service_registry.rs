//! Service registry backed by a coordination service.
//!
//! Providers call [`ServiceRegistry::register`] to publish an ephemeral
//! address node under `<registry_path>/<service>`. Consumers call
//! [`ServiceRegistry::lookup`], which initializes the registry on first use
//! and afterwards answers from an in-memory map without touching the
//! network.
//!
//! The map is published through an [`ArcSwap`]; each service entry is
//! replaced as a whole, so readers see either the old or the new address
//! list and never a mix. Child-change notifications are delivered as
//! messages to a single owner task, which is the only writer after
//! initialization.

use super::balance::pick_random;
use super::gate::{InitGate, InitState};
use crate::config::RpcConfig;
use crate::coordination::{join_path, ChildEvent, Coordinator, CreateMode};
use crate::error::{Result, RpcError};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Service name to current address list.
pub type RegistryMap = HashMap<String, Arc<Vec<String>>>;

/// Discovery and registration against one coordination session.
pub struct ServiceRegistry {
    coordinator: Arc<dyn Coordinator>,
    registry_path: String,
    focus_services: Vec<String>,
    services: Arc<ArcSwap<RegistryMap>>,
    gate: InitGate,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    updates: Arc<watch::Sender<u64>>,
}

impl ServiceRegistry {
    /// Create a registry using the root path and focus list of `config`.
    pub fn new(coordinator: Arc<dyn Coordinator>, config: &RpcConfig) -> Self {
        Self::with_root(
            coordinator,
            config.registry_path.clone(),
            config.focus_services.clone(),
        )
    }

    /// Create a registry rooted at `registry_path`.
    ///
    /// An empty `focus_services` list means every service under the root is
    /// discovered, including ones that appear after initialization.
    pub fn with_root(
        coordinator: Arc<dyn Coordinator>,
        registry_path: impl Into<String>,
        focus_services: Vec<String>,
    ) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            coordinator,
            registry_path: registry_path.into(),
            focus_services,
            services: Arc::new(ArcSwap::from_pointee(RegistryMap::new())),
            gate: InitGate::new(),
            watch_task: Mutex::new(None),
            updates: Arc::new(updates),
        }
    }

    /// Where the one-time initialization currently stands.
    pub fn init_state(&self) -> InitState {
        self.gate.state()
    }

    /// Make `address` discoverable under `service_name`.
    ///
    /// Creates the registry root and service node as persistent nodes when
    /// absent, then the ephemeral address node. Does nothing if the address
    /// node already exists.
    pub async fn register(&self, service_name: &str, address: &str) -> Result<()> {
        let registration_error = |message: String| RpcError::Registration {
            service: service_name.to_string(),
            address: address.to_string(),
            message,
        };

        if service_name.is_empty() || service_name.contains('/') {
            return Err(registration_error(format!(
                "invalid service name {:?}",
                service_name
            )));
        }
        if address.is_empty() || address.contains('/') {
            return Err(registration_error(format!("invalid address {:?}", address)));
        }

        let service_path = join_path(&self.registry_path, service_name);
        let node_path = join_path(&service_path, address);

        self.create_registration(&service_path, &node_path, address)
            .await
            .map_err(|e| registration_error(e.to_string()))
    }

    async fn create_registration(
        &self,
        service_path: &str,
        node_path: &str,
        address: &str,
    ) -> Result<()> {
        if self.coordinator.exists(node_path).await? {
            debug!("Registration already present: {}", node_path);
            return Ok(());
        }

        self.ensure_persistent(service_path).await?;

        match self
            .coordinator
            .create(node_path, address.as_bytes(), CreateMode::Ephemeral)
            .await
        {
            Ok(()) => {
                info!("Registered service node {}", node_path);
                Ok(())
            }
            Err(RpcError::NodeExists { .. }) => {
                debug!("Registration created concurrently: {}", node_path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create `path` and its missing ancestors as persistent nodes.
    async fn ensure_persistent(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);

            if self.coordinator.exists(&current).await? {
                continue;
            }
            match self
                .coordinator
                .create(&current, &[], CreateMode::Persistent)
                .await
            {
                Ok(()) => info!("Created registry node {}", current),
                Err(RpcError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Fetch the initial address lists and subscribe to changes.
    ///
    /// Runs at most once to success per registry; concurrent callers wait
    /// for the one in flight.
    pub async fn init(&self) -> Result<()> {
        self.gate.run(|| self.initialize()).await
    }

    async fn initialize(&self) -> Result<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let discover_all = self.focus_services.is_empty();

        if discover_all {
            self.coordinator
                .watch_children(&self.registry_path, events_tx.clone())
                .await?;
        }

        let names = if discover_all {
            match self.coordinator.children(&self.registry_path).await {
                Ok(names) => names,
                Err(RpcError::NoNode { .. }) => Vec::new(),
                Err(e) => return Err(e),
            }
        } else {
            self.focus_services.clone()
        };

        let mut map = RegistryMap::new();
        for name in &names {
            let service_path = join_path(&self.registry_path, name);
            self.coordinator
                .watch_children(&service_path, events_tx.clone())
                .await?;
            let addresses = fetch_addresses(self.coordinator.as_ref(), &service_path).await?;
            debug!("Discovered {} address(es) for {}", addresses.len(), name);
            map.insert(name.clone(), Arc::new(addresses));
        }

        self.services.store(Arc::new(map));
        self.updates.send_modify(|generation| *generation += 1);

        let owner = WatchOwner {
            coordinator: Arc::clone(&self.coordinator),
            registry_path: self.registry_path.clone(),
            discover_all,
            watched: names.iter().cloned().collect(),
            services: Arc::clone(&self.services),
            updates: Arc::clone(&self.updates),
            events_tx,
        };
        let handle = tokio::spawn(owner.run(events_rx));
        if let Ok(mut slot) = self.watch_task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }

        info!(
            "Service registry initialized under {} with {} service(s)",
            self.registry_path,
            names.len()
        );
        Ok(())
    }

    /// Choose one address for `service_name`, or `None` if none is known.
    ///
    /// Initializes the registry on first use. An initialization failure is
    /// logged and reported as `None`; the next lookup retries it.
    pub async fn lookup(&self, service_name: &str) -> Option<String> {
        if let Err(e) = self.init().await {
            warn!("Service registry initialization failed: {}", e);
            return None;
        }

        let services = self.services.load();
        let address = services
            .get(service_name)
            .and_then(|addresses| pick_random(addresses));
        if address.is_none() {
            debug!("No address known for {}", service_name);
        }
        address
    }

    /// Snapshot of the current address list of `service_name`.
    pub fn addresses(&self, service_name: &str) -> Option<Arc<Vec<String>>> {
        self.services.load().get(service_name).cloned()
    }

    /// Names of every service currently in the map.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Receiver that changes every time the map is republished.
    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Ok(slot) = self.watch_task.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Read the address data of every child of `service_path`.
async fn fetch_addresses(
    coordinator: &dyn Coordinator,
    service_path: &str,
) -> Result<Vec<String>> {
    let children = match coordinator.children(service_path).await {
        Ok(children) => children,
        Err(RpcError::NoNode { .. }) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    read_addresses(coordinator, service_path, &children).await
}

async fn read_addresses(
    coordinator: &dyn Coordinator,
    service_path: &str,
    children: &[String],
) -> Result<Vec<String>> {
    let mut addresses = Vec::with_capacity(children.len());
    for child in children {
        let node_path = join_path(service_path, child);
        // A child removed since the listing simply has no data anymore.
        if let Some(data) = coordinator.read_data(&node_path).await? {
            addresses.push(String::from_utf8_lossy(&data).into_owned());
        }
    }
    Ok(addresses)
}

/// Sole writer of the registry map once initialization has finished.
struct WatchOwner {
    coordinator: Arc<dyn Coordinator>,
    registry_path: String,
    discover_all: bool,
    watched: HashSet<String>,
    services: Arc<ArcSwap<RegistryMap>>,
    updates: Arc<watch::Sender<u64>>,
    events_tx: mpsc::UnboundedSender<ChildEvent>,
}

impl WatchOwner {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChildEvent>) {
        while let Some(event) = events.recv().await {
            if self.discover_all && event.path == self.registry_path {
                self.on_services_changed(event.children).await;
            } else if let Some(name) = self.service_name_of(&event.path) {
                self.on_addresses_changed(name, &event.path, &event.children)
                    .await;
            }
        }
        debug!("Registry watch channel closed for {}", self.registry_path);
    }

    fn service_name_of(&self, path: &str) -> Option<String> {
        let name = path
            .strip_prefix(self.registry_path.as_str())?
            .strip_prefix('/')?;
        (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
    }

    async fn on_services_changed(&mut self, names: Vec<String>) {
        for name in names {
            if self.watched.contains(&name) {
                continue;
            }
            let service_path = join_path(&self.registry_path, &name);
            if let Err(e) = self
                .coordinator
                .watch_children(&service_path, self.events_tx.clone())
                .await
            {
                warn!("Failed to watch {}: {}", service_path, e);
                continue;
            }
            info!("Watching new service {}", name);
            self.watched.insert(name.clone());

            match fetch_addresses(self.coordinator.as_ref(), &service_path).await {
                Ok(addresses) => self.publish(name, addresses),
                Err(e) => warn!("Failed to read addresses of {}: {}", name, e),
            }
        }
    }

    async fn on_addresses_changed(
        &mut self,
        name: String,
        service_path: &str,
        children: &[String],
    ) {
        match read_addresses(self.coordinator.as_ref(), service_path, children).await {
            Ok(addresses) => self.publish(name, addresses),
            Err(e) => warn!(
                "Keeping previous addresses of {} after read failure: {}",
                name, e
            ),
        }
    }

    fn publish(&self, name: String, addresses: Vec<String>) {
        debug!("Publishing {} address(es) for {}", addresses.len(), name);
        let addresses = Arc::new(addresses);
        self.services.rcu(|current| {
            let mut next = RegistryMap::clone(current);
            next.insert(name.clone(), Arc::clone(&addresses));
            next
        });
        self.updates.send_modify(|generation| *generation += 1);
    }
}
