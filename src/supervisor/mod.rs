pub mod console;
pub mod error;
pub mod events;
pub mod managed_process;
pub mod players;
pub mod server;
pub mod state_machine;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::GlobalConfig;
use crate::instance::{InstanceSpec, ServerInstance, ServerProperties, SettingsPatch, INSTANCE_FILE};
use error::{Result, SupervisorError};
pub use events::ServerEvent;
pub use server::{ManagedServer, ServerSummary};
pub use state_machine::ProcessState;

/// Registry of every managed server, keyed by name.
pub struct Supervisor {
    config: Arc<GlobalConfig>,
    servers_dir: PathBuf,
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
}

impl Supervisor {
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self {
            servers_dir: config.servers_dir.clone(),
            config,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<GlobalConfig> {
        &self.config
    }

    pub fn servers_dir(&self) -> &Path {
        &self.servers_dir
    }

    /// Rebuild the registry from `<servers_dir>/*/server.json`.
    /// Returns the number of servers loaded.
    pub async fn load_all(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.servers_dir)?;

        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&self.servers_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.join(INSTANCE_FILE).is_file())
            .collect();
        dirs.sort();

        let mut servers = self.servers.write().await;
        for dir in dirs {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let instance = match ServerInstance::load(&dir) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::error!("Skipping server directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            if instance.name != dir_name {
                tracing::error!(
                    "Skipping server directory {}: config name '{}' does not match",
                    dir.display(),
                    instance.name
                );
                continue;
            }
            if servers.contains_key(&instance.name) {
                continue;
            }
            match ManagedServer::new(instance, self.config.clone()) {
                Ok(server) => {
                    servers.insert(dir_name, server);
                }
                Err(e) => tracing::error!("Skipping server directory {}: {}", dir.display(), e),
            }
        }

        tracing::info!("Loaded {} server(s) from {}", servers.len(), self.servers_dir.display());
        Ok(servers.len())
    }

    /// Validate `spec`, create the server directory and register it.
    pub async fn create(&self, spec: InstanceSpec) -> Result<Arc<ManagedServer>> {
        spec.validate()?;

        let mut servers = self.servers.write().await;
        let dir = self.servers_dir.join(&spec.name);
        if servers.contains_key(&spec.name) || dir.exists() {
            return Err(SupervisorError::NameTaken(spec.name));
        }
        self.ensure_port_free(&servers, spec.port, None).await?;

        std::fs::create_dir_all(&dir)?;
        let instance = ServerInstance::from_spec(spec, dir.clone());
        let created = (|| -> Result<Arc<ManagedServer>> {
            instance.save()?;
            ServerProperties::sync_from_instance(&dir, &instance)?;
            ManagedServer::new(instance.clone(), self.config.clone())
        })();
        let server = match created {
            Ok(server) => server,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        tracing::info!(
            "Created server '{}' ({} {}, port {})",
            instance.name, instance.engine, instance.version, instance.port
        );
        servers.insert(instance.name.clone(), server.clone());
        Ok(server)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<ManagedServer>> {
        self.servers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(format!("server '{}'", name)))
    }

    /// All servers, sorted by name.
    pub async fn list(&self) -> Vec<Arc<ManagedServer>> {
        let mut servers: Vec<_> = self.servers.read().await.values().cloned().collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));
        servers
    }

    /// Retire the server and remove its directory. Offline (or crashed) only.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let server = self.get(name).await?;
        server.retire().await?;
        self.servers.write().await.remove(name);

        let dir = server.instance().await.directory;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", dir.display(), e);
                return Err(e.into());
            }
        }
        tracing::info!("Deleted server '{}'", name);
        Ok(())
    }

    /// Port, player and RAM changes. Offline only.
    pub async fn update_settings(&self, name: &str, patch: &SettingsPatch) -> Result<ServerInstance> {
        let server = self.get(name).await?;
        if let Some(port) = patch.port {
            let servers = self.servers.read().await;
            self.ensure_port_free(&servers, port, Some(name)).await?;
        }
        server.update_settings(patch).await
    }

    async fn ensure_port_free(
        &self,
        servers: &HashMap<String, Arc<ManagedServer>>,
        port: u16,
        except: Option<&str>,
    ) -> Result<()> {
        for (name, server) in servers {
            if Some(name.as_str()) == except {
                continue;
            }
            if server.instance().await.port == port {
                return Err(SupervisorError::InvalidSpec(format!(
                    "port {} is already used by server '{}'",
                    port, name
                )));
            }
        }
        Ok(())
    }

    /// Stop every running server (daemon shutdown).
    pub async fn shutdown_all(&self) {
        let servers = self.list().await;
        let stops = servers.into_iter().filter(|s| !s.state().is_settled()).map(|server| async move {
            tracing::info!("Stopping server '{}'", server.name());
            if let Err(e) = server.request_stop(false).await {
                tracing::warn!("Failed to stop server '{}': {}", server.name(), e);
            }
        });
        futures_util::future::join_all(stops).await;
    }
}
