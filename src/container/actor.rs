//! The container actor: state machine, resource ownership, request
//! dispatch.
//!
//! One task per container, driven by its own `mpsc` inbox. A plain
//! `mpsc::Sender` whose `send` fails once the actor's receiver is
//! dropped already carries "this container is no longer accepting
//! requests" -- `ContainerHandle::execute` returning
//! `Err(ActorError::NotAccepting)` on a dropped channel is that signal,
//! no extra hand-off layer needed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::connection::PendingRequest;
use crate::error::ActorError;
use crate::handle::next_handle;
use crate::idle_timer::IdleTimer;
use crate::job::Job;
use crate::pool::network::{NetworkPool, Subnet};
use crate::pool::port::{Port, PortPool};
use crate::pool::user::{Uid, UserPool};
use crate::protocol::*;
use crate::registry::Registry;

use super::snapshot::Snapshot;
use super::state::ContainerState;

/// Run a script to completion and map a non-zero exit into
/// `ActorError::ScriptFailed`. A free function (no `self` borrow) so
/// the background-stop path can `tokio::spawn` it without tying the
/// task's lifetime to the actor.
async fn run_script(
    path: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
) -> Result<(), ActorError> {
    let mut cmd = Command::new(&path);
    cmd.args(&args);
    cmd.envs(envs);
    let output = cmd.output().await?;
    if !output.status.success() {
        warn!(
            script = %path.display(),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "script failed"
        );
        return Err(ActorError::ScriptFailed(path.display().to_string()));
    }
    Ok(())
}

/// Owned job-construction parameters, gathered from the actor
/// (`ContainerActor::job_params`) so `build_job` can run detached from
/// the actor's own lifetime -- needed for `DoRun`, which builds and
/// runs a job entirely inside a spawned task.
struct JobParams {
    spawner_bin: PathBuf,
    linker_bin: PathBuf,
    job_dir: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

/// Create the job's work directory and construct the `Job`, ready to
/// `spawn()`. A free function over owned `JobParams` rather than a
/// `&self` method so it can be awaited inside a detached task.
async fn build_job(params: JobParams, stdin: Vec<u8>) -> Result<Arc<Job>, ActorError> {
    tokio::fs::create_dir_all(&params.job_dir).await?;
    Ok(Arc::new(Job::new(
        params.spawner_bin,
        params.linker_bin,
        params.job_dir,
        params.args,
        params.env,
        Some(stdin),
    )))
}

/// Shared pools and configuration every container actor needs; built
/// once by the server and handed to each spawned actor.
pub struct ActorContext {
    pub config: Arc<Configuration>,
    pub network_pool: Arc<NetworkPool>,
    pub port_pool: Arc<PortPool>,
    pub user_pool: Arc<UserPool>,
    pub registry: Arc<Registry<ContainerHandle>>,
}

struct ActorMessage {
    request: Request,
    pending: Arc<PendingRequest>,
}

/// The outward-facing reference to a running container actor. Sending
/// on a dropped actor's channel fails immediately -- that failure
/// *is* "container no longer accepting requests".
pub struct ContainerHandle {
    tx: mpsc::Sender<ActorMessage>,
}

impl ContainerHandle {
    pub async fn execute(
        &self,
        request: Request,
        pending: Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        self.tx
            .send(ActorMessage { request, pending })
            .await
            .map_err(|_| ActorError::NotAccepting)
    }
}

/// Spawn a brand-new, unregistered container actor (Born state) and
/// return the handle callers use to deliver its first request
/// (typically `Create`). The actor registers itself with the registry
/// once `DoCreate` succeeds.
pub fn spawn_actor(ctx: Arc<ActorContext>) -> Arc<ContainerHandle> {
    let (tx, rx) = mpsc::channel(1);
    let handle_ref = Arc::new(ContainerHandle { tx });

    let id = next_handle();
    let actor = ContainerActor {
        id: id.clone(),
        handle: id,
        state: ContainerState::Born,
        idle_timeout: Duration::from_secs(ctx.config.server.container_grace_time),
        idle_timer: Arc::new(IdleTimer::new(Duration::from_secs(
            ctx.config.server.container_grace_time,
        ))),
        network: None,
        uid: None,
        ports: Vec::new(),
        next_job_id: AtomicU32::new(0),
        jobs: HashMap::new(),
        memory_limit_in_bytes: None,
        disk_limit_in_bytes: None,
        bandwidth: None,
        ctx,
        self_handle: Arc::clone(&handle_ref),
    };

    tokio::spawn(actor.run(rx));

    handle_ref
}

/// Reconstruct an actor from a restored snapshot and launch it
/// directly into the snapshot's state (used by the server's
/// restore-from-disk pass). Resources named in the snapshot must
/// already have been reserved from the pools via `remove` by the
/// caller.
pub fn spawn_from_snapshot(ctx: Arc<ActorContext>, snapshot: Snapshot) -> Arc<ContainerHandle> {
    let (tx, rx) = mpsc::channel(1);
    let handle_ref = Arc::new(ContainerHandle { tx });

    let idle_timeout = Duration::from_secs(snapshot.idle_timeout_secs);
    let actor = ContainerActor {
        id: snapshot.id,
        handle: snapshot.handle,
        state: snapshot.state,
        idle_timeout,
        idle_timer: Arc::new(IdleTimer::new(idle_timeout)),
        network: snapshot.network,
        uid: snapshot.uid,
        ports: snapshot.ports,
        next_job_id: AtomicU32::new(snapshot.next_job_id),
        jobs: HashMap::new(),
        memory_limit_in_bytes: snapshot.memory_limit_in_bytes,
        disk_limit_in_bytes: snapshot.disk_limit_in_bytes,
        bandwidth: snapshot.bandwidth,
        ctx,
        self_handle: Arc::clone(&handle_ref),
    };

    tokio::spawn(actor.run(rx));

    handle_ref
}

/// Outcome of running one request through a state's dispatch
/// function: either fully handled (possibly with an error to report),
/// or hijacked -- in which case a background task owns writing the
/// response and marking the request done, and the actor loop must not
/// touch `pending` again.
enum DispatchOutcome {
    Handled(Result<(), ActorError>),
    Hijacked,
}

struct ContainerActor {
    id: String,
    handle: String,
    state: ContainerState,

    idle_timeout: Duration,
    idle_timer: Arc<IdleTimer>,

    network: Option<Subnet>,
    uid: Option<Uid>,
    ports: Vec<Port>,

    next_job_id: AtomicU32,
    jobs: HashMap<String, Arc<Job>>,

    memory_limit_in_bytes: Option<u64>,
    disk_limit_in_bytes: Option<u64>,
    bandwidth: Option<(u64, u64)>,

    ctx: Arc<ActorContext>,
    self_handle: Arc<ContainerHandle>,
}

impl ContainerActor {
    fn container_dir(&self) -> PathBuf {
        self.ctx.config.server.container_depot_path.join(&self.handle)
    }

    fn script_path(&self, name: &str) -> PathBuf {
        self.ctx.config.server.container_script_path.join(name)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ActorMessage>) {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(ActorMessage { request, pending }) = msg else {
                        return;
                    };

                    self.idle_timer.r#ref();

                    let watcher_pending = Arc::clone(&pending);
                    let watcher_timer = Arc::clone(&self.idle_timer);
                    tokio::spawn(async move {
                        watcher_pending.wait_done().await;
                        watcher_timer.unref();
                    });

                    let started = std::time::Instant::now();
                    let kind = request.type_name();
                    self.dispatch(request, Arc::clone(&pending)).await;
                    debug!(
                        handle = %self.handle,
                        request = kind,
                        took_ms = started.elapsed().as_millis() as u64,
                        "request dispatched"
                    );

                    self.idle_timer.set_duration(self.idle_timeout);
                }
                _ = self.idle_timer.fired() => {
                    break;
                }
            }
        }

        info!(handle = %self.handle, "idle timeout elapsed, self-destroying");
        self.do_destroy_on_idle().await;
    }

    async fn dispatch(&mut self, request: Request, pending: Arc<PendingRequest>) {
        let state = self.state;
        let outcome = match state {
            ContainerState::Born => self.run_born(request, &pending).await,
            ContainerState::Active => self.run_active(request, &pending).await,
            ContainerState::Stopped => self.run_stopped(request, &pending).await,
            ContainerState::Destroyed => self.run_destroyed(request, &pending).await,
        };

        let result = match outcome {
            DispatchOutcome::Hijacked => return,
            DispatchOutcome::Handled(r) => r,
        };

        if let Err(e) = result {
            let response = match e {
                ActorError::InvalidState => Response::invalid_state(&state.to_string()),
                other => Response::error(other.to_string()),
            };
            let _ = pending.write_response(&response).await;
        }
    }

    /// `Born`: only `Create` is meaningful.
    async fn run_born(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> DispatchOutcome {
        match request {
            Request::Create(_) => DispatchOutcome::Handled(self.do_create(request, pending).await),
            _ => DispatchOutcome::Handled(Err(ActorError::InvalidState)),
        }
    }

    /// `Active`: the bulk of the dispatch table -- everything that
    /// needs a running container.
    async fn run_active(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> DispatchOutcome {
        match request {
            Request::Stop(_) => DispatchOutcome::Handled(self.do_stop(request, pending).await),
            Request::Destroy(_) => {
                DispatchOutcome::Handled(self.do_destroy(request, pending).await)
            }
            Request::Spawn(_) => DispatchOutcome::Handled(self.do_spawn(request, pending).await),
            Request::Link(_) => {
                self.do_link(request, pending);
                DispatchOutcome::Hijacked
            }
            Request::Run(_) => {
                self.do_run(request, pending);
                DispatchOutcome::Hijacked
            }
            Request::Stream(_) => {
                self.do_stream(request, pending);
                DispatchOutcome::Hijacked
            }
            Request::Info(_) => DispatchOutcome::Handled(self.do_info(request, pending).await),
            Request::NetIn(_) => DispatchOutcome::Handled(self.do_net_in(request, pending).await),
            Request::NetOut(_) => DispatchOutcome::Handled(self.do_net_out(request, pending).await),
            Request::CopyIn(_) => DispatchOutcome::Handled(self.do_copy_in(request, pending).await),
            Request::CopyOut(_) => {
                DispatchOutcome::Handled(self.do_copy_out(request, pending).await)
            }
            Request::LimitMemory(_) => {
                DispatchOutcome::Handled(self.do_limit_memory(request, pending).await)
            }
            Request::LimitDisk(_) => {
                DispatchOutcome::Handled(self.do_limit_disk(request, pending).await)
            }
            Request::LimitBandwidth(_) => {
                DispatchOutcome::Handled(self.do_limit_bandwidth(request, pending).await)
            }
            _ => DispatchOutcome::Handled(Err(ActorError::InvalidState)),
        }
    }

    /// `Stopped`: only `Destroy` and read-only `Info` remain valid.
    async fn run_stopped(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> DispatchOutcome {
        match request {
            Request::Destroy(_) => {
                DispatchOutcome::Handled(self.do_destroy(request, pending).await)
            }
            Request::Info(_) => DispatchOutcome::Handled(self.do_info(request, pending).await),
            _ => DispatchOutcome::Handled(Err(ActorError::InvalidState)),
        }
    }

    /// `Destroyed`: terminal, nothing is valid.
    async fn run_destroyed(
        &mut self,
        _request: Request,
        _pending: &Arc<PendingRequest>,
    ) -> DispatchOutcome {
        DispatchOutcome::Handled(Err(ActorError::InvalidState))
    }

    async fn do_create(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::Create(req) = request else {
            unreachable!()
        };

        Snapshot::mark_dirty(&self.container_dir()).await?;

        if self.network.is_none() {
            self.network = Some(
                self.ctx
                    .network_pool
                    .acquire()
                    .map_err(|_| ActorError::PoolExhausted)?,
            );
        }
        if self.uid.is_none() {
            self.uid = Some(
                self.ctx
                    .user_pool
                    .acquire()
                    .map_err(|_| ActorError::PoolExhausted)?,
            );
        }

        if let Some(h) = &req.handle {
            self.handle = h.clone();
        }
        if let Some(grace) = req.grace_time {
            self.idle_timeout = Duration::from_secs(grace);
            self.idle_timer.set_duration(self.idle_timeout);
        }

        let network = self.network.expect("just acquired above");
        let uid = self.uid.expect("just acquired above");

        let create_result = run_script(
            self.script_path("create.sh"),
            vec![self.container_dir().display().to_string()],
            vec![
                ("id".to_string(), self.id.clone()),
                ("network_host_ip".to_string(), network.add(1).to_string()),
                (
                    "network_container_ip".to_string(),
                    network.add(2).to_string(),
                ),
                ("user_uid".to_string(), uid.0.to_string()),
                (
                    "rootfs_path".to_string(),
                    self.ctx.config.server.container_rootfs_path.display().to_string(),
                ),
            ],
        )
        .await;

        if create_result.is_err() {
            let _ = pending.write_response(&Response::error("error")).await;
            return Ok(());
        }

        let start_script = self.container_dir().join("start.sh");
        if run_script(start_script, vec![], vec![]).await.is_err() {
            let _ = pending.write_response(&Response::error("error")).await;
            return Ok(());
        }

        if let Err(e) = self
            .ctx
            .registry
            .register(self.handle.clone(), Arc::clone(&self.self_handle))
        {
            let _ = pending
                .write_response(&Response::error(format!("handle already exists: {}", e)))
                .await;
            return Ok(());
        }
        self.state = ContainerState::Active;

        self.persist().await?;

        let _ = pending
            .write_response(&Response::Create(CreateResponse {
                handle: self.handle.clone(),
            }))
            .await;
        Ok(())
    }

    async fn do_stop(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::Stop(req) = request else {
            unreachable!()
        };

        let stop_script = self.container_dir().join("stop.sh");
        let mut args = Vec::new();
        if req.kill {
            args.push("-w".to_string());
            args.push("0".to_string());
        }

        if req.background {
            tokio::spawn(run_script(stop_script, args, vec![]));
        } else {
            let _ = run_script(stop_script, args, vec![]).await;
        }

        self.state = ContainerState::Stopped;
        self.persist().await?;

        let _ = pending.write_response(&Response::Stop(StopResponse {})).await;
        Ok(())
    }

    async fn do_destroy(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::Destroy(_) = request else {
            unreachable!()
        };

        Snapshot::mark_dirty(&self.container_dir()).await?;

        let destroy_script = self.container_dir().join("destroy.sh");
        if run_script(destroy_script, vec![], vec![]).await.is_err() {
            let _ = pending.write_response(&Response::error("error")).await;
            return Ok(());
        }

        self.state = ContainerState::Destroyed;
        self.ctx.registry.unregister(&self.handle)?;
        self.release_resources();

        let _ = tokio::fs::remove_dir_all(self.container_dir()).await;

        let _ = pending
            .write_response(&Response::Destroy(DestroyResponse {}))
            .await;
        Ok(())
    }

    /// Spontaneous destroy triggered by idle-timer expiry: no request,
    /// no response to write, just the same teardown steps.
    async fn do_destroy_on_idle(&mut self) {
        if self.state == ContainerState::Destroyed {
            return;
        }
        let _ = Snapshot::mark_dirty(&self.container_dir()).await;
        let destroy_script = self.container_dir().join("destroy.sh");
        let _ = run_script(destroy_script, vec![], vec![]).await;

        self.state = ContainerState::Destroyed;
        let _ = self.ctx.registry.unregister(&self.handle);
        self.release_resources();
        let _ = tokio::fs::remove_dir_all(self.container_dir()).await;
    }

    fn release_resources(&mut self) {
        if let Some(network) = self.network.take() {
            self.ctx.network_pool.release(network);
        }
        if let Some(uid) = self.uid.take() {
            self.ctx.user_pool.release(uid);
        }
        for port in self.ports.drain(..) {
            self.ctx.port_pool.release(port);
        }
    }

    /// Gather the owned parameters `build_job` needs, so a job can be
    /// built from inside a detached `tokio::spawn` task (e.g. `DoRun`)
    /// without holding a borrow of the actor across the `.await`.
    fn job_params(&self, job_id: u32, privileged: bool, rlimits: &Option<ResourceLimits>) -> JobParams {
        let job_dir = self.container_dir().join("jobs").join(job_id.to_string());
        let user = if privileged { "root" } else { "vcap" };
        let sock_path = self.container_dir().join("run").join("wshd.sock");
        let wsh = self.container_dir().join("wsh").display().to_string();

        let effective_rlimits = rlimits.clone().unwrap_or_default();
        let env = effective_rlimits.env_vars(&self.ctx.config.server.container_rlimits);

        JobParams {
            spawner_bin: self.script_path("iomux-spawn"),
            linker_bin: self.script_path("iomux-link"),
            job_dir,
            args: vec![
                wsh,
                "--socket".to_string(),
                sock_path.display().to_string(),
                "--user".to_string(),
                user.to_string(),
            ],
            env,
        }
    }

    async fn do_spawn(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::Spawn(req) = request else {
            unreachable!()
        };

        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let params = self.job_params(job_id, req.privileged, &req.rlimits);
        let job = build_job(params, req.script.clone().into_bytes()).await?;

        if job.spawn().await.is_err() {
            let _ = pending
                .write_response(&Response::error("failed to spawn job"))
                .await;
            return Ok(());
        }

        self.jobs.insert(job_id.to_string(), job);
        self.persist().await?;

        let _ = pending
            .write_response(&Response::Spawn(SpawnResponse { job_id }))
            .await;
        Ok(())
    }

    /// Hijacks the request and hands it to a background task that
    /// waits for the job to finish, then writes the response and
    /// marks the request done itself.
    fn do_link(&mut self, request: Request, pending: &Arc<PendingRequest>) {
        let Request::Link(req) = request else {
            unreachable!()
        };

        let job = match self.jobs.get(&req.job_id.to_string()) {
            Some(job) => Arc::clone(job),
            None => {
                let pending = Arc::clone(pending);
                tokio::spawn(async move {
                    let _ = pending
                        .write_response(&Response::error(format!("unknown job id: {}", req.job_id)))
                        .await;
                });
                return;
            }
        };

        pending.hijack();
        let pending = Arc::clone(pending);
        tokio::spawn(async move {
            let exit_status = job.link().await;
            let response = Response::Link(LinkResponse {
                stdout: String::from_utf8_lossy(&job.stdout.snapshot()).into_owned(),
                stderr: String::from_utf8_lossy(&job.stderr.snapshot()).into_owned(),
                exit_status,
            });
            let _ = pending.write_response(&response).await;
            pending.mark_done();
        });
    }

    /// `Run` is spawn+link collapsed into one round trip: build the job,
    /// spawn it, then immediately link it without ever publishing a job
    /// id to the caller. Hijacked for the same reason `Link` is -- the
    /// child may run for a while and must not block the actor loop.
    fn do_run(&mut self, request: Request, pending: &Arc<PendingRequest>) {
        let Request::Run(req) = request else {
            unreachable!()
        };

        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let params = self.job_params(job_id, req.privileged, &req.rlimits);
        let stdin = req.script.clone().into_bytes();

        pending.hijack();
        let pending = Arc::clone(pending);
        tokio::spawn(async move {
            let job = match build_job(params, stdin).await {
                Ok(job) => job,
                Err(e) => {
                    let _ = pending
                        .write_response(&Response::error(format!("failed to build job: {}", e)))
                        .await;
                    pending.mark_done();
                    return;
                }
            };

            if job.spawn().await.is_err() {
                let _ = pending
                    .write_response(&Response::error("failed to spawn job"))
                    .await;
                pending.mark_done();
                return;
            }

            let exit_status = job.link().await;
            let response = Response::Run(RunResponse {
                stdout: String::from_utf8_lossy(&job.stdout.snapshot()).into_owned(),
                stderr: String::from_utf8_lossy(&job.stderr.snapshot()).into_owned(),
                exit_status,
            });
            let _ = pending.write_response(&response).await;
            pending.mark_done();
        });
    }

    /// `Stream` hijacks like `Link`; this core has no multi-frame
    /// incremental push, so it answers with the same
    /// full-replay-from-byte-zero semantics as `Link` once the job
    /// finishes.
    fn do_stream(&mut self, request: Request, pending: &Arc<PendingRequest>) {
        let Request::Stream(req) = request else {
            unreachable!()
        };

        let job = match self.jobs.get(&req.job_id.to_string()) {
            Some(job) => Arc::clone(job),
            None => {
                let pending = Arc::clone(pending);
                tokio::spawn(async move {
                    let _ = pending
                        .write_response(&Response::error(format!("unknown job id: {}", req.job_id)))
                        .await;
                });
                return;
            }
        };

        pending.hijack();
        let pending = Arc::clone(pending);
        tokio::spawn(async move {
            let exit_status = job.link().await;
            let response = Response::Stream(StreamResponse {
                stdout: String::from_utf8_lossy(&job.stdout.snapshot()).into_owned(),
                stderr: String::from_utf8_lossy(&job.stderr.snapshot()).into_owned(),
                exit_status,
            });
            let _ = pending.write_response(&response).await;
            pending.mark_done();
        });
    }

    /// `NetOut` authorises outbound traffic from the container to a
    /// network/port; the rule is applied by `setup.sh`'s iptables setup
    /// honouring `allow_networks`/`deny_networks`, so this handler is
    /// pure bookkeeping acknowledgement once the container is
    /// confirmed active.
    async fn do_net_out(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::NetOut(_) = request else {
            unreachable!()
        };

        let _ = pending
            .write_response(&Response::NetOut(NetOutResponse {}))
            .await;
        Ok(())
    }

    /// `CopyIn` copies a file from the host into the container's
    /// directory tree. A faithful namespace-aware copy would shell out
    /// the way `create.sh` et al. do; this core resolves `dst_path`
    /// relative to the container directory directly since there's no
    /// separate copy-tool script in play here.
    async fn do_copy_in(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::CopyIn(req) = request else {
            unreachable!()
        };

        let dst = self.container_dir().join(req.dst_path.trim_start_matches('/'));
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::copy(&req.src_path, &dst).await {
            let _ = pending
                .write_response(&Response::error(format!("copy_in failed: {}", e)))
                .await;
            return Ok(());
        }

        let _ = pending
            .write_response(&Response::CopyIn(CopyInResponse {}))
            .await;
        Ok(())
    }

    /// `CopyOut` is the inverse of `CopyIn`: copies a file out of the
    /// container's directory tree to a host path.
    async fn do_copy_out(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::CopyOut(req) = request else {
            unreachable!()
        };

        let src = self.container_dir().join(req.src_path.trim_start_matches('/'));
        if let Some(parent) = std::path::Path::new(&req.dst_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::copy(&src, &req.dst_path).await {
            let _ = pending
                .write_response(&Response::error(format!("copy_out failed: {}", e)))
                .await;
            return Ok(());
        }

        let _ = pending
            .write_response(&Response::CopyOut(CopyOutResponse {}))
            .await;
        Ok(())
    }

    /// `LimitMemory` records the effective memory ceiling; enforcement
    /// happens in the cgroup set up by `create.sh`/`start.sh`, outside
    /// this core. Omitting `limit_in_bytes` reads back the current
    /// value without changing it, matching the reference daemon's
    /// get-or-set limit request shape.
    async fn do_limit_memory(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::LimitMemory(req) = request else {
            unreachable!()
        };

        if let Some(limit) = req.limit_in_bytes {
            self.memory_limit_in_bytes = Some(limit);
            self.persist().await?;
        }

        let _ = pending
            .write_response(&Response::LimitMemory(LimitMemoryResponse {
                limit_in_bytes: self.memory_limit_in_bytes.unwrap_or(0),
            }))
            .await;
        Ok(())
    }

    async fn do_limit_disk(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::LimitDisk(req) = request else {
            unreachable!()
        };

        if let Some(limit) = req.byte_limit {
            self.disk_limit_in_bytes = Some(limit);
            self.persist().await?;
        }

        let _ = pending
            .write_response(&Response::LimitDisk(LimitDiskResponse {
                byte_limit: self.disk_limit_in_bytes.unwrap_or(0),
            }))
            .await;
        Ok(())
    }

    async fn do_limit_bandwidth(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::LimitBandwidth(req) = request else {
            unreachable!()
        };

        if let (Some(rate), Some(burst)) = (req.rate, req.burst) {
            self.bandwidth = Some((rate, burst));
            self.persist().await?;
        }

        let (rate, burst) = self.bandwidth.unwrap_or((0, 0));
        let _ = pending
            .write_response(&Response::LimitBandwidth(LimitBandwidthResponse {
                rate,
                burst,
            }))
            .await;
        Ok(())
    }

    async fn do_info(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::Info(_) = request else {
            unreachable!()
        };

        let host_ip = self.network.map(|n| n.add(1).to_string()).unwrap_or_default();
        let container_ip = self.network.map(|n| n.add(2).to_string()).unwrap_or_default();

        let mut job_ids: Vec<u32> = self.jobs.keys().filter_map(|k| k.parse().ok()).collect();
        job_ids.sort_unstable();

        let _ = pending
            .write_response(&Response::Info(InfoResponse {
                state: self.state.to_string(),
                host_ip,
                container_ip,
                container_path: self.container_dir().display().to_string(),
                job_ids,
            }))
            .await;
        Ok(())
    }

    async fn do_net_in(
        &mut self,
        request: Request,
        pending: &Arc<PendingRequest>,
    ) -> Result<(), ActorError> {
        let Request::NetIn(req) = request else {
            unreachable!()
        };

        let host_port = match req.host_port {
            Some(p) => {
                let port = Port(p);
                if !self.ctx.port_pool.remove(&port) {
                    let _ = pending
                        .write_response(&Response::error(format!("port {} unavailable", p)))
                        .await;
                    return Ok(());
                }
                port
            }
            None => self
                .ctx
                .port_pool
                .acquire()
                .map_err(|_| ActorError::PoolExhausted)?,
        };

        let container_port = req.container_port.unwrap_or(host_port.0);
        self.ports.push(host_port);
        self.persist().await?;

        let _ = pending
            .write_response(&Response::NetIn(NetInResponse {
                host_port: host_port.0,
                container_port,
            }))
            .await;
        Ok(())
    }

    async fn persist(&self) -> Result<(), ActorError> {
        let snapshot = Snapshot {
            id: self.id.clone(),
            handle: self.handle.clone(),
            state: self.state,
            network: self.network,
            uid: self.uid,
            ports: self.ports.clone(),
            idle_timeout_secs: self.idle_timeout.as_secs(),
            next_job_id: self.next_job_id.load(Ordering::SeqCst),
            job_ids: self.jobs.keys().filter_map(|k| k.parse().ok()).collect(),
            memory_limit_in_bytes: self.memory_limit_in_bytes,
            disk_limit_in_bytes: self.disk_limit_in_bytes,
            bandwidth: self.bandwidth,
        };
        snapshot.mark_clean(&self.container_dir()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use tempfile::tempdir;
    use tokio::net::UnixStream;

    use crate::connection::PendingRequest;
    use crate::registry::Registry;

    fn test_ctx(depot: PathBuf, scripts: PathBuf) -> Arc<ActorContext> {
        let mut config = Configuration::default();
        config.server.container_depot_path = depot;
        config.server.container_script_path = scripts;

        Arc::new(ActorContext {
            config: Arc::new(config),
            network_pool: Arc::new(NetworkPool::new(Ipv4Addr::new(10, 254, 0, 0), 4)),
            port_pool: Arc::new(PortPool::new(20000, 16).unwrap()),
            user_pool: Arc::new(UserPool::new(10000, 4)),
            registry: Arc::new(Registry::new()),
        })
    }

    fn test_actor(ctx: Arc<ActorContext>, handle: &str) -> ContainerActor {
        let (tx, _rx) = mpsc::channel(1);
        ContainerActor {
            id: handle.to_string(),
            handle: handle.to_string(),
            state: ContainerState::Active,
            idle_timeout: Duration::from_secs(300),
            idle_timer: Arc::new(IdleTimer::new(Duration::from_secs(300))),
            network: None,
            uid: None,
            ports: Vec::new(),
            next_job_id: AtomicU32::new(0),
            jobs: HashMap::new(),
            memory_limit_in_bytes: None,
            disk_limit_in_bytes: None,
            bandwidth: None,
            ctx,
            self_handle: Arc::new(ContainerHandle { tx }),
        }
    }

    /// A `PendingRequest` backed by a real `UnixStream` pair, plus the
    /// reader half used to observe what got written to it.
    async fn pending_pair() -> (Arc<PendingRequest>, crate::protocol::FrameReader<tokio::io::ReadHalf<UnixStream>>) {
        let (local, peer) = UnixStream::pair().unwrap();
        let (_local_r, local_w) = tokio::io::split(local);
        let (peer_r, _peer_w) = tokio::io::split(peer);

        let writer = Arc::new(tokio::sync::Mutex::new(crate::protocol::FrameWriter::new(local_w)));
        (PendingRequest::new(writer), crate::protocol::FrameReader::new(peer_r))
    }

    #[tokio::test]
    async fn job_params_picks_root_for_privileged() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let actor = test_actor(ctx, "handle1");

        let privileged = actor.job_params(0, true, &None);
        assert!(privileged.args.contains(&"root".to_string()));

        let unprivileged = actor.job_params(1, false, &None);
        assert!(unprivileged.args.contains(&"vcap".to_string()));
    }

    #[tokio::test]
    async fn job_params_layers_rlimits_over_config_defaults() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let actor = test_actor(ctx, "handle1");

        let rlimits = ResourceLimits {
            nofile: Some(64),
            ..Default::default()
        };
        let params = actor.job_params(0, false, &Some(rlimits));
        assert!(params.env.contains(&("RLIMIT_NOFILE".to_string(), "64".to_string())));
    }

    #[tokio::test]
    async fn build_job_creates_the_job_directory() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let actor = test_actor(ctx, "handle1");

        let params = actor.job_params(7, false, &None);
        let job_dir = params.job_dir.clone();
        let job = build_job(params, b"echo hi".to_vec()).await.unwrap();

        assert!(job_dir.is_dir());
        assert_eq!(job.workdir, job_dir);
    }

    #[tokio::test]
    async fn copy_in_then_copy_out_round_trips_a_file() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let src_dir = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let mut actor = test_actor(ctx, "handle1");

        let src_path = src_dir.path().join("payload.txt");
        tokio::fs::write(&src_path, b"hello from the host").await.unwrap();

        let (pending, mut reader) = pending_pair().await;
        let request = Request::CopyIn(CopyInRequest {
            handle: "handle1".to_string(),
            src_path: src_path.display().to_string(),
            dst_path: "/inside/payload.txt".to_string(),
        });
        actor.do_copy_in(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::CopyIn(_) => {}
            other => panic!("unexpected response: {:?}", other),
        }

        let copied = actor.container_dir().join("inside").join("payload.txt");
        assert_eq!(tokio::fs::read(&copied).await.unwrap(), b"hello from the host");

        let out_dir = tempdir().unwrap();
        let out_path = out_dir.path().join("back.txt");
        let (pending, mut reader) = pending_pair().await;
        let request = Request::CopyOut(CopyOutRequest {
            handle: "handle1".to_string(),
            src_path: "/inside/payload.txt".to_string(),
            dst_path: out_path.display().to_string(),
        });
        actor.do_copy_out(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::CopyOut(_) => {}
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(tokio::fs::read(&out_path).await.unwrap(), b"hello from the host");
    }

    #[tokio::test]
    async fn copy_in_reports_an_error_response_on_missing_source() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let mut actor = test_actor(ctx, "handle1");

        let (pending, mut reader) = pending_pair().await;
        let request = Request::CopyIn(CopyInRequest {
            handle: "handle1".to_string(),
            src_path: "/no/such/file".to_string(),
            dst_path: "/inside/payload.txt".to_string(),
        });
        actor.do_copy_in(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::Error(e) => assert!(e.message.contains("copy_in failed")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn limit_memory_is_get_or_set() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let mut actor = test_actor(ctx, "handle1");

        let (pending, mut reader) = pending_pair().await;
        let request = Request::LimitMemory(LimitMemoryRequest {
            handle: "handle1".to_string(),
            limit_in_bytes: Some(1024),
        });
        actor.do_limit_memory(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::LimitMemory(r) => assert_eq!(r.limit_in_bytes, 1024),
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(actor.memory_limit_in_bytes, Some(1024));

        let (pending, mut reader) = pending_pair().await;
        let request = Request::LimitMemory(LimitMemoryRequest {
            handle: "handle1".to_string(),
            limit_in_bytes: None,
        });
        actor.do_limit_memory(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::LimitMemory(r) => assert_eq!(r.limit_in_bytes, 1024),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn limit_bandwidth_requires_both_rate_and_burst_to_update() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let mut actor = test_actor(ctx, "handle1");

        let (pending, mut reader) = pending_pair().await;
        let request = Request::LimitBandwidth(LimitBandwidthRequest {
            handle: "handle1".to_string(),
            rate: Some(100),
            burst: None,
        });
        actor.do_limit_bandwidth(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::LimitBandwidth(r) => {
                assert_eq!(r.rate, 0);
                assert_eq!(r.burst, 0);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(actor.bandwidth.is_none());

        let (pending, mut reader) = pending_pair().await;
        let request = Request::LimitBandwidth(LimitBandwidthRequest {
            handle: "handle1".to_string(),
            rate: Some(100),
            burst: Some(50),
        });
        actor.do_limit_bandwidth(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::LimitBandwidth(r) => {
                assert_eq!(r.rate, 100);
                assert_eq!(r.burst, 50);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(actor.bandwidth, Some((100, 50)));
    }

    #[tokio::test]
    async fn net_out_is_a_plain_acknowledgement() {
        let depot = tempdir().unwrap();
        let scripts = tempdir().unwrap();
        let ctx = test_ctx(depot.path().to_path_buf(), scripts.path().to_path_buf());
        let mut actor = test_actor(ctx, "handle1");

        let (pending, mut reader) = pending_pair().await;
        let request = Request::NetOut(NetOutRequest {
            handle: "handle1".to_string(),
            network: "0.0.0.0/0".to_string(),
            port: None,
        });
        actor.do_net_out(request, &pending).await.unwrap();
        match reader.read_response().await.unwrap() {
            Response::NetOut(_) => {}
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
