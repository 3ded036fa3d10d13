//! Socket lifecycle, `setup.sh` invocation, restore-from-disk, and the
//! accept loop.
//!
//! Startup order: unlink any stale socket, run `setup.sh`, restore
//! containers found in the depot, bind and listen, then accept
//! connections forever, spawning one task per connection.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::Configuration;
use crate::connection;
use crate::container::{self, ActorContext, Snapshot};
use crate::error::ActorError;
use crate::pool::network::NetworkPool;
use crate::pool::port::PortPool;
use crate::pool::user::UserPool;
use crate::registry::Registry;

/// Long-lived daemon state shared by every accepted connection.
pub struct Server {
    ctx: Arc<ActorContext>,
}

impl Server {
    pub fn new(config: Configuration) -> Result<Self, ActorError> {
        let config = Arc::new(config);

        let network_pool = NetworkPool::new(
            config
                .network
                .pool_start_address
                .parse()
                .unwrap_or(std::net::Ipv4Addr::new(10, 254, 0, 0)),
            config.network.pool_size,
        );
        let port_pool = PortPool::new(-1, 0).map_err(|_| ActorError::PoolExhausted)?;
        let user_pool = UserPool::new(config.user.pool_start_uid, config.user.pool_size);

        let ctx = Arc::new(ActorContext {
            config,
            network_pool: Arc::new(network_pool),
            port_pool: Arc::new(port_pool),
            user_pool: Arc::new(user_pool),
            registry: Arc::new(Registry::new()),
        });

        Ok(Self { ctx })
    }

    /// Run `setup.sh`, restore containers from the depot, bind the
    /// socket, and accept connections forever. Only socket-setup
    /// errors are fatal; accept errors are logged and skipped.
    pub async fn run(&self) -> Result<(), ActorError> {
        self.run_setup_script().await;
        self.restore_depot().await;

        let socket_path = &self.ctx.config.server.unix_domain_path;
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ActorError::Io(e)),
        }

        let listener = UnixListener::bind(socket_path)?;
        let permissions = std::fs::Permissions::from_mode(
            self.ctx.config.server.unix_domain_permissions,
        );
        std::fs::set_permissions(socket_path, permissions)?;

        info!(path = %socket_path.display(), "listening");

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    self.spawn_connection(stream);
                }
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let registry = Arc::clone(&self.ctx.registry);
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let create = move || container::spawn_actor(Arc::clone(&ctx));
            connection::handle_connection(stream, registry, create).await;
        });
    }

    async fn run_setup_script(&self) {
        let setup_script = self.ctx.config.server.container_script_path.join("setup.sh");
        let mut cmd = Command::new(&setup_script);
        cmd.env(
            "allow_networks",
            self.ctx.config.network.allow_networks.join(" "),
        );
        cmd.env(
            "deny_networks",
            self.ctx.config.network.deny_networks.join(" "),
        );
        cmd.env(
            "CONTAINER_ROOTFS_PATH",
            self.ctx.config.server.container_rootfs_path.display().to_string(),
        );
        cmd.env(
            "CONTAINER_DEPOT_PATH",
            self.ctx.config.server.container_depot_path.display().to_string(),
        );
        cmd.env(
            "disk_quota_enabled",
            if self.ctx.config.server.quota.disk_quota_enabled {
                "true"
            } else {
                "false"
            },
        );

        match cmd.output().await {
            Ok(output) if !output.status.success() => {
                error!(
                    script = %setup_script.display(),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "setup.sh failed"
                );
            }
            Err(e) => {
                warn!(script = %setup_script.display(), error = %e, "failed to run setup.sh");
            }
            Ok(_) => {}
        }
    }

    /// Walk the container depot. A directory with `etc/snapshot.json`
    /// is restored and relaunched; one without is torn down via
    /// `clear.sh`/`destroy.sh` and deleted, since its state is unknown.
    async fn restore_depot(&self) {
        let depot = self.ctx.config.server.container_depot_path.clone();
        let mut entries = match tokio::fs::read_dir(&depot).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(depot = %depot.display(), error = %e, "could not read container depot");
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("error walking container depot: {}", e);
                    break;
                }
            };

            if !entry.path().is_dir() {
                continue;
            }

            match Snapshot::load(&entry.path()).await {
                Ok(Some(snapshot)) => self.restore_container(snapshot).await,
                Ok(None) => self.discard_container_dir(&entry.path()).await,
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "failed to load snapshot, discarding");
                    self.discard_container_dir(&entry.path()).await;
                }
            }
        }
    }

    async fn restore_container(&self, snapshot: Snapshot) {
        if let Some(network) = snapshot.network {
            self.ctx.network_pool.remove(&network);
        }
        if let Some(uid) = snapshot.uid {
            self.ctx.user_pool.remove(&uid);
        }
        for port in &snapshot.ports {
            self.ctx.port_pool.remove(port);
        }

        let handle = snapshot.handle.clone();
        let container_handle = container::spawn_from_snapshot(Arc::clone(&self.ctx), snapshot);
        if let Err(e) = self.ctx.registry.register(handle.clone(), container_handle) {
            warn!(handle = %handle, error = %e, "failed to register restored container");
        } else {
            info!(handle = %handle, "restored container from snapshot");
        }
    }

    async fn discard_container_dir(&self, dir: &std::path::Path) {
        let clear_script = dir.join("clear.sh");
        if tokio::fs::try_exists(&clear_script).await.unwrap_or(false) {
            let mut cmd = Command::new(&clear_script);
            cmd.arg(dir);
            if let Err(e) = cmd.output().await {
                warn!(script = %clear_script.display(), error = %e, "failed to run clear.sh during restore cleanup");
            }
        }

        let destroy_script = dir.join("destroy.sh");
        if tokio::fs::try_exists(&destroy_script).await.unwrap_or(false) {
            let mut cmd = Command::new(&destroy_script);
            if let Err(e) = cmd.output().await {
                warn!(script = %destroy_script.display(), error = %e, "failed to run destroy.sh during restore cleanup");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove stale container directory");
        }
    }
}

