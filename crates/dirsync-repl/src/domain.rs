//! The replication domain: everything one replicated base DN needs, wired
//! together. Local updates flow out through assured bookkeeping and the
//! session; remote updates flow in through the history engine and the
//! naming resolver, strictly in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use std::collections::VecDeque;

use dirsync_proto::msg::{
    AckMsg, AddMsg, AssuredMode, ModifyDnMsg, ModifyMsg, MonitorMsg, ReplicationMsg,
    ServerStartMsg, StartSessionMsg, UpdateHeader, WindowCreditMsg,
};
use dirsync_proto::{Csn, CsnGenerator, ProtoError, ServerState};

use crate::assured::{AckOutcome, AssuredCoordinator};
use crate::broker::{self, BrokerDecision, LocalInfo, RsCandidate};
use crate::config::DomainConfig;
use crate::entry::{AttrRegistry, Modification};
use crate::entry_history::{EntryHistorical, FakeOperation};
use crate::error::ReplError;
use crate::metrics::{Counter, ReplicationMonitor};
use crate::naming::{NamingOutcome, NamingResolver};
use crate::session::{
    message_name, perform_handshake, FramedSession, HandshakeOutcome,
};
use crate::store::EntryStore;
use crate::topology::TopologyView;

/// Opens byte streams toward replication servers. The deployment decides
/// what a URL means (TCP, TLS, an in-process pipe).
pub trait Connector: Send + Sync {
    /// The stream type produced.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a stream to the given replication server URL.
    fn connect(
        &self,
        url: &str,
    ) -> impl std::future::Future<Output = Result<Self::Stream, ReplError>> + Send;
}

/// A connected, handshaken session toward one replication server.
pub struct SessionHandle<T> {
    session: Arc<FramedSession<T>>,
    /// Server id of the connected replication server.
    pub rs_id: u16,
    /// Group id of the connected replication server.
    pub rs_group_id: u8,
    send_window: Arc<Semaphore>,
}

impl<T> std::fmt::Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("rs_id", &self.rs_id)
            .field("rs_group_id", &self.rs_group_id)
            .field("send_credits", &self.send_window.available_permits())
            .finish()
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionHandle<T> {
    fn new(session: Arc<FramedSession<T>>, rs_id: u16, rs_group_id: u8, window: u32) -> Self {
        Self {
            session,
            rs_id,
            rs_group_id,
            send_window: Arc::new(Semaphore::new(window as usize)),
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &FramedSession<T> {
        &self.session
    }

    /// Updates currently allowed out before the peer must credit us.
    pub fn send_credits(&self) -> usize {
        self.send_window.available_permits()
    }
}

/// How a session run ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer asked for an orderly stop.
    Stopped,
    /// A topology change makes another replication server the better choice.
    Rebalance {
        /// The server to connect to instead.
        target: u16,
    },
    /// The session failed; reconnect with backoff.
    Lost(ReplError),
}

/// Outcome of publishing one local update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The update went out without acknowledgement tracking.
    Sent,
    /// The update was tracked as assured and completed as given.
    Assured(AckOutcome),
}

/// Replication domain for one base DN.
pub struct ReplicationDomain<S> {
    config: Mutex<DomainConfig>,
    generator: CsnGenerator,
    state: Arc<Mutex<ServerState>>,
    store: Arc<S>,
    registry: AttrRegistry,
    naming: NamingResolver<S>,
    assured: AssuredCoordinator,
    monitor: Arc<dyn ReplicationMonitor>,
    topology: Mutex<TopologyView>,
    shutdown: AtomicBool,
}

impl<S: EntryStore> ReplicationDomain<S> {
    /// Create a domain over the given store.
    pub fn new(
        config: DomainConfig,
        store: Arc<S>,
        registry: AttrRegistry,
        monitor: Arc<dyn ReplicationMonitor>,
    ) -> Result<Self, ReplError> {
        config.validate()?;
        let naming = NamingResolver::new(
            Arc::clone(&store),
            config.base_dn.clone(),
            registry.clone(),
            Arc::clone(&monitor),
        );
        let assured = AssuredCoordinator::new(config.assured_timeout(), Arc::clone(&monitor));
        Ok(Self {
            generator: CsnGenerator::new(config.replica_id),
            config: Mutex::new(config),
            state: Arc::new(Mutex::new(ServerState::new())),
            store,
            registry,
            naming,
            assured,
            monitor,
            topology: Mutex::new(TopologyView::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> DomainConfig {
        self.config.lock().unwrap().clone()
    }

    /// A copy of the local progress vector.
    pub fn server_state(&self) -> ServerState {
        self.state.lock().unwrap().clone()
    }

    /// Swap in a new configuration at runtime. Returns true when the
    /// change requires the caller to drop and re-establish the session.
    pub fn apply_configuration_change(&self, new: DomainConfig) -> Result<bool, ReplError> {
        new.validate()?;
        let mut config = self.config.lock().unwrap();
        let needs_reconnect = config.reconnect_required(&new);
        self.assured.set_timeout(new.assured_timeout());
        info!(base_dn = %new.base_dn, needs_reconnect, "applying configuration change");
        *config = new;
        Ok(needs_reconnect)
    }

    /// Ask the run loop to stop after the current session ends.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Stamp a new update header with the next CSN and the configured
    /// assured defaults.
    pub fn new_update_header(&self, entry_uuid: &str, dn: &str) -> UpdateHeader {
        let config = self.config.lock().unwrap();
        UpdateHeader {
            csn: self.generator.next_csn(),
            entry_uuid: entry_uuid.to_string(),
            dn: dn.to_string(),
            assured: config.assured,
            assured_mode: config.assured_mode,
            safe_data_level: config.safe_data_level,
        }
    }

    /// Publish one local update, blocking on the acknowledgement criterion
    /// when the update is assured.
    pub async fn publish_update<T>(
        &self,
        handle: &SessionHandle<T>,
        msg: ReplicationMsg,
    ) -> Result<PublishOutcome, ReplError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(header) = msg.update_header().cloned() else {
            return Err(ReplError::InvalidConfiguration {
                reason: "publish_update takes update messages only".to_string(),
            });
        };
        // Flow control: one credit per update, returned by WindowCredit.
        let permit = self
            .send_window_permit(handle)
            .await
            .map_err(|_| ReplError::SessionClosed)?;
        permit.forget();

        let waiter = if header.assured {
            let (group_id, level) = {
                let config = self.config.lock().unwrap();
                (config.group_id, config.safe_data_level)
            };
            match header.assured_mode {
                // Safe-data guarantees only hold along a same-group path;
                // otherwise the update silently degrades to fire-and-forget.
                AssuredMode::SafeData if handle.rs_group_id != group_id => None,
                // Level one is satisfied by the local store alone.
                AssuredMode::SafeData if level <= 1 => None,
                mode => {
                    Some(self.assured.register(header.csn, mode, self.generator.replica_id()))
                }
            }
        } else {
            None
        };

        if let Err(err) = handle.session.publish(&msg).await {
            self.assured.session_closed();
            return Err(err.into());
        }
        self.monitor.incr(Counter::SentUpdates);
        self.state.lock().unwrap().update(header.csn);

        match waiter {
            Some(waiter) => Ok(PublishOutcome::Assured(self.assured.wait(waiter).await)),
            None => Ok(PublishOutcome::Sent),
        }
    }

    async fn send_window_permit<T>(
        &self,
        handle: &SessionHandle<T>,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, tokio::sync::AcquireError> {
        Arc::clone(&handle.send_window).acquire_owned().await
    }

    /// Connect to the best reachable replication server and complete the
    /// handshake. Losing candidates get an orderly Stop.
    pub async fn connect<C: Connector>(
        &self,
        connector: &C,
    ) -> Result<(SessionHandle<C::Stream>, HandshakeOutcome), ReplError> {
        let config = self.config();
        let urls = config.replication_servers.clone();
        let mut attempts: Vec<(Arc<FramedSession<C::Stream>>, HandshakeOutcome)> = Vec::new();
        for url in &urls {
            match self.try_handshake(connector, url, &config).await {
                Ok(done) => attempts.push(done),
                Err(err) => {
                    warn!(%url, error = %err, "replication server unreachable");
                }
            }
        }
        if attempts.is_empty() {
            return Err(ReplError::NoReplicationServer { attempted: urls.len() });
        }

        let candidates: Vec<RsCandidate> = attempts
            .iter()
            .map(|(_, outcome)| RsCandidate {
                server_id: outcome.rs.server_id,
                server_url: outcome.rs.server_url.clone(),
                group_id: outcome.rs.group_id,
                generation_id: outcome.rs.generation_id,
                weight: rs_weight(outcome),
                connected_ds_count: rs_connected_ds(outcome),
                state: Some(outcome.rs.state.clone()),
            })
            .collect();
        let local_state = self.server_state();
        let local = LocalInfo::from_config(&config, &local_state);
        let chosen_id =
            broker::pick_first_connection(&candidates, &local, &mut rand::thread_rng())
                .unwrap_or(candidates[0].server_id);
        let chosen_idx = attempts
            .iter()
            .position(|(_, outcome)| outcome.rs.server_id == chosen_id)
            .unwrap_or(0);

        let (session, outcome) = attempts.swap_remove(chosen_idx);
        for (loser, _) in attempts {
            let _ = loser.publish(&ReplicationMsg::Stop).await;
            loser.close().await;
        }
        info!(
            rs_id = outcome.rs.server_id,
            url = %outcome.rs.server_url,
            version = outcome.version.as_u8(),
            "connected to replication server"
        );
        self.topology.lock().unwrap().update_from(&outcome.topology);
        let handle = SessionHandle::new(
            session,
            outcome.rs.server_id,
            outcome.rs.group_id,
            outcome.rs.window_size,
        );
        Ok((handle, outcome))
    }

    async fn try_handshake<C: Connector>(
        &self,
        connector: &C,
        url: &str,
        config: &DomainConfig,
    ) -> Result<(Arc<FramedSession<C::Stream>>, HandshakeOutcome), ReplError> {
        let stream = connector.connect(url).await?;
        let session = Arc::new(FramedSession::new(stream));
        let server_start = ServerStartMsg {
            replica_id: config.replica_id,
            base_dn: config.base_dn.clone(),
            generation_id: config.generation_id,
            group_id: config.group_id,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            window_size: config.window_size,
            state: self.server_state(),
        };
        let start_session = StartSessionMsg {
            assured: config.assured,
            assured_mode: config.assured_mode,
            safe_data_level: config.safe_data_level,
        };
        let outcome = perform_handshake(&session, server_start, start_session).await?;
        Ok((session, outcome))
    }

    /// Run the session until it ends: pumps the receive loop, answers
    /// protocol traffic, applies updates, emits heartbeats.
    pub async fn run_session<T>(
        &self,
        handle: &SessionHandle<T>,
        outcome: &HandshakeOutcome,
    ) -> SessionEnd
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let pending = self.collect_missing_changes(&outcome.rs.state);
        if !pending.is_empty() {
            info!(count = pending.len(), "replaying changes the peer missed");
        }
        let heartbeat = self.spawn_heartbeat(handle);
        let end = self.receive_loop(handle, pending).await;
        heartbeat.abort();
        handle.send_window.close();
        self.assured.session_closed();
        end
    }

    fn spawn_heartbeat<T>(&self, handle: &SessionHandle<T>) -> tokio::task::JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Arc::clone(&handle.session);
        let state = Arc::clone(&self.state);
        let replica_id = self.generator.replica_id();
        let interval = self.config.lock().unwrap().heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if session.publish(&ReplicationMsg::Heartbeat).await.is_err() {
                    return;
                }
                let newest = state.lock().unwrap().max_csn(replica_id);
                if let Some(csn) = newest {
                    let msg = ReplicationMsg::ChangeTimeHeartbeat(
                        dirsync_proto::msg::ChangeTimeHeartbeatMsg { csn },
                    );
                    if session.publish(&msg).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    async fn receive_loop<T>(
        &self,
        handle: &SessionHandle<T>,
        mut pending: VecDeque<(Csn, ReplicationMsg)>,
    ) -> SessionEnd
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (heartbeat_interval, window_size) = {
            let config = self.config.lock().unwrap();
            (config.heartbeat_interval(), config.window_size)
        };
        // Silence twice the heartbeat interval means the peer is gone.
        let silence_limit = heartbeat_interval * 2;
        let mut consumed: u32 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = handle.session.publish(&ReplicationMsg::Stop).await;
                return SessionEnd::Stopped;
            }
            // Catch-up replay drains as far as the send window allows; the
            // remainder waits for the peer's next credit.
            while handle.send_credits() > 0 {
                let Some((_, msg)) = pending.pop_front() else { break };
                if let Err(err) = self.publish_update(handle, msg).await {
                    return SessionEnd::Lost(err);
                }
            }
            let msg = match tokio::time::timeout(silence_limit, handle.session.receive()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(err)) => return SessionEnd::Lost(err.into()),
                Err(_) => {
                    return SessionEnd::Lost(
                        ProtoError::connection_lost("no traffic within heartbeat limit").into(),
                    )
                }
            };
            match msg {
                ReplicationMsg::Add(_)
                | ReplicationMsg::Delete(_)
                | ReplicationMsg::Modify(_)
                | ReplicationMsg::ModifyDn(_) => {
                    self.apply_remote_update(handle, &msg).await;
                    consumed += 1;
                    // Credit the sender once half our window is consumed.
                    if consumed >= window_size / 2 {
                        let credit = ReplicationMsg::WindowCredit(WindowCreditMsg {
                            num_ack: consumed,
                        });
                        if handle.session.publish(&credit).await.is_err() {
                            return SessionEnd::Lost(ReplError::SessionClosed);
                        }
                        consumed = 0;
                    }
                }
                ReplicationMsg::Ack(ack) => {
                    self.assured.on_ack(&ack);
                }
                ReplicationMsg::Heartbeat => {}
                ReplicationMsg::ChangeTimeHeartbeat(m) => {
                    self.generator.adjust(&m.csn);
                }
                ReplicationMsg::WindowCredit(m) => {
                    handle.send_window.add_permits(m.num_ack as usize);
                }
                ReplicationMsg::WindowProbe => {
                    let credit =
                        ReplicationMsg::WindowCredit(WindowCreditMsg { num_ack: consumed });
                    consumed = 0;
                    if handle.session.publish(&credit).await.is_err() {
                        return SessionEnd::Lost(ReplError::SessionClosed);
                    }
                }
                ReplicationMsg::Topology(topology) => {
                    let decision = {
                        let mut view = self.topology.lock().unwrap();
                        view.update_from(&topology);
                        self.reevaluate_connection(&view, handle.rs_id)
                    };
                    if let BrokerDecision::ConnectTo(target) = decision {
                        info!(target, "topology change makes another replication server better");
                        let _ = handle.session.publish(&ReplicationMsg::Stop).await;
                        return SessionEnd::Rebalance { target };
                    }
                }
                ReplicationMsg::Stop => {
                    info!("peer requested session stop");
                    return SessionEnd::Stopped;
                }
                ReplicationMsg::MonitorRequest(req) => {
                    let answer = ReplicationMsg::Monitor(MonitorMsg {
                        sender_id: self.generator.replica_id(),
                        dest_id: req.sender_id,
                        state: self.server_state(),
                    });
                    if handle.session.publish(&answer).await.is_err() {
                        return SessionEnd::Lost(ReplError::SessionClosed);
                    }
                }
                ReplicationMsg::Monitor(m) => {
                    debug!(sender = m.sender_id, "monitor snapshot received");
                }
                ReplicationMsg::InitializeRequest(req) => {
                    // Bulk initialization is served by the import pipeline,
                    // not by this core.
                    let answer = ReplicationMsg::Error(dirsync_proto::msg::ErrorMsg {
                        sender_id: self.generator.replica_id(),
                        dest_id: req.sender_id,
                        code: 1,
                        detail: "online initialization not available".to_string(),
                    });
                    if handle.session.publish(&answer).await.is_err() {
                        return SessionEnd::Lost(ReplError::SessionClosed);
                    }
                }
                ReplicationMsg::InitializeTarget(_)
                | ReplicationMsg::EntryChunk(_)
                | ReplicationMsg::InitializeRcvAck(_) => {
                    debug!("ignoring initialization traffic");
                }
                ReplicationMsg::Error(err) => {
                    warn!(code = err.code, detail = %err.detail, "peer reported an error");
                }
                other @ (ReplicationMsg::ServerStart(_)
                | ReplicationMsg::ReplServerStart(_)
                | ReplicationMsg::StartSession(_)) => {
                    return SessionEnd::Lost(ReplError::HandshakeViolation {
                        state: "Connected",
                        got: message_name(&other),
                    });
                }
            }
        }
    }

    fn reevaluate_connection(&self, view: &TopologyView, current_rs: u16) -> BrokerDecision {
        let config = self.config.lock().unwrap();
        let candidates: Vec<RsCandidate> = view
            .rs_infos()
            .map(|rs| RsCandidate {
                server_id: rs.server_id,
                server_url: rs.server_url.clone(),
                group_id: rs.group_id,
                generation_id: rs.generation_id,
                weight: rs.weight,
                connected_ds_count: rs.connected_ds_count,
                state: None,
            })
            .collect();
        let local_state = self.state.lock().unwrap().clone();
        let local = LocalInfo::from_config(&config, &local_state);
        let ds_on_current = view.ds_connected_to(current_rs);
        broker::reevaluate(&candidates, &local, current_rs, &ds_on_current)
    }

    /// Apply one remote update in arrival order.
    async fn apply_remote_update<T>(&self, handle: &SessionHandle<T>, msg: &ReplicationMsg)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.monitor.incr(Counter::ReceivedUpdates);
        let Some(header) = msg.update_header().cloned() else {
            return;
        };
        self.generator.adjust(&header.csn);

        let replayed_ok = match msg {
            ReplicationMsg::Add(add) => {
                !matches!(self.naming.apply_add(add), NamingOutcome::Dropped { .. })
            }
            ReplicationMsg::Delete(del) => {
                !matches!(self.naming.apply_delete(del), NamingOutcome::Dropped { .. })
            }
            ReplicationMsg::ModifyDn(moddn) => {
                !matches!(self.naming.apply_modify_dn(moddn), NamingOutcome::Dropped { .. })
            }
            ReplicationMsg::Modify(modify) => self.replay_modify(modify),
            _ => false,
        };
        if replayed_ok {
            self.monitor.incr(Counter::ReplayedUpdates);
        }
        self.state.lock().unwrap().update(header.csn);

        // The replaying side acknowledges safe-read updates; safe-data
        // accounting belongs to the replication server alone.
        if header.assured && header.assured_mode == AssuredMode::SafeRead {
            self.monitor.incr(Counter::AssuredSrReceivedUpdates);
            let ack = if replayed_ok {
                self.monitor.incr(Counter::AssuredSrReceivedUpdatesAcked);
                AckMsg::clean(header.csn)
            } else {
                self.monitor.incr(Counter::AssuredSrReceivedUpdatesNotAcked);
                AckMsg {
                    csn: header.csn,
                    has_timeout: false,
                    has_wrong_status: false,
                    has_replay_error: true,
                    failed_servers: vec![self.generator.replica_id()],
                }
            };
            if let Err(err) = handle.session.publish(&ReplicationMsg::Ack(ack)).await {
                warn!(error = %err, "failed to send safe-read acknowledgement");
            }
        }
    }

    // Replays a modify through the entry's history, then persists both.
    fn replay_modify(&self, modify: &ModifyMsg) -> bool {
        let header = &modify.header;
        let entry = self
            .store
            .get_by_uuid(&header.entry_uuid)
            .or_else(|| self.store.get_by_dn(&header.dn));
        let Some(mut entry) = entry else {
            debug!(uuid = %header.entry_uuid, dn = %header.dn, "modify target not found");
            return false;
        };
        let mut hist = EntryHistorical::from_entry(&entry, &self.registry);
        let mods: Vec<Modification> =
            modify.mods.iter().cloned().map(Modification::from).collect();
        let result = hist.replay_batch(header.csn, &mods, &mut entry, &self.registry);
        for _ in 0..result.conflicts() {
            self.monitor.incr(Counter::ModifyConflicts);
        }
        hist.attach_to(&mut entry, self.purge_cutoff_ms());
        self.store.put(entry);
        true
    }

    fn purge_cutoff_ms(&self) -> u64 {
        let purge_delay = self.config.lock().unwrap().purge_delay_ms;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        now.saturating_sub(purge_delay)
    }

    /// Reconstruct every local change the peer's progress vector misses,
    /// in CSN order, ready to be replayed toward it.
    fn collect_missing_changes(&self, peer_state: &ServerState) -> VecDeque<(Csn, ReplicationMsg)> {
        let replica_id = self.generator.replica_id();
        let mut pending: Vec<(Csn, ReplicationMsg)> = Vec::new();
        for entry in self.store.all_entries() {
            let hist = EntryHistorical::from_entry(&entry, &self.registry);
            for op in hist.fake_operations(&entry) {
                let csn = op.csn();
                if csn.replica_id != replica_id || peer_state.covers(&csn) {
                    continue;
                }
                pending.push((csn, fake_op_to_msg(op, &entry)));
            }
        }
        pending.sort_by_key(|(csn, _)| *csn);
        pending.into()
    }

    /// Connect-and-serve loop with exponential backoff, until shutdown or
    /// an orderly stop.
    pub async fn run<C: Connector>(&self, connector: &C) -> Result<(), ReplError> {
        let mut backoff = Duration::from_millis(500);
        let backoff_max = Duration::from_secs(30);
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.connect(connector).await {
                Ok((handle, outcome)) => {
                    backoff = Duration::from_millis(500);
                    match self.run_session(&handle, &outcome).await {
                        SessionEnd::Stopped => {
                            handle.session.close().await;
                            return Ok(());
                        }
                        SessionEnd::Rebalance { target } => {
                            debug!(target, "rebalancing to another replication server");
                            handle.session.close().await;
                        }
                        SessionEnd::Lost(err) => {
                            warn!(error = %err, "session lost, reconnecting");
                            handle.session.close().await;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "connection attempt failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_max);
                }
            }
        }
        Err(ReplError::Shutdown)
    }
}

fn fake_op_to_msg(op: FakeOperation, entry: &crate::entry::Entry) -> ReplicationMsg {
    match op {
        FakeOperation::Add { csn, entry } => ReplicationMsg::Add(AddMsg {
            header: UpdateHeader::plain(csn, entry.uuid.clone(), entry.dn.clone()),
            attributes: entry.to_wire_attributes(),
        }),
        FakeOperation::ModifyDn { csn, new_rdn } => ReplicationMsg::ModifyDn(ModifyDnMsg {
            header: UpdateHeader::plain(csn, entry.uuid.clone(), entry.dn.clone()),
            new_rdn,
            delete_old_rdn: false,
            new_superior: None,
        }),
        FakeOperation::Modify { csn, mods } => ReplicationMsg::Modify(ModifyMsg {
            header: UpdateHeader::plain(csn, entry.uuid.clone(), entry.dn.clone()),
            mods: mods.into_iter().map(Into::into).collect(),
        }),
    }
}

// Weight and connected-DS count for the broker come from the initial
// topology snapshot when the peer lists itself, with safe fallbacks.
fn rs_weight(outcome: &HandshakeOutcome) -> u8 {
    outcome
        .topology
        .rs_infos
        .iter()
        .find(|rs| rs.server_id == outcome.rs.server_id)
        .map(|rs| rs.weight)
        .unwrap_or(1)
}

fn rs_connected_ds(outcome: &HandshakeOutcome) -> u32 {
    outcome
        .topology
        .rs_infos
        .iter()
        .find(|rs| rs.server_id == outcome.rs.server_id)
        .map(|rs| rs.connected_ds_count)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use dirsync_proto::msg::{
        ModOp, ReplServerStartMsg, RsInfo, TopologyMsg, WireAttribute, WireModification,
    };

    use crate::metrics::CounterMonitor;
    use crate::session::answer_handshake;
    use crate::store::MemoryEntryStore;

    const RS_ID: u16 = 201;

    struct TestConnector {
        streams: Mutex<HashMap<String, Vec<DuplexStream>>>,
    }

    impl TestConnector {
        fn new() -> Self {
            Self { streams: Mutex::new(HashMap::new()) }
        }

        fn add(&self, url: &str, stream: DuplexStream) {
            self.streams.lock().unwrap().entry(url.to_string()).or_default().push(stream);
        }
    }

    impl Connector for TestConnector {
        type Stream = DuplexStream;

        async fn connect(&self, url: &str) -> Result<DuplexStream, ReplError> {
            self.streams
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|v| v.pop())
                .ok_or(ReplError::NoReplicationServer { attempted: 1 })
        }
    }

    #[derive(Clone, Copy)]
    enum RsScenario {
        AckClean,
        AckWithReplayError,
        NoAck,
    }

    struct FakeRs {
        group_id: u8,
        window_size: u32,
        scenario: RsScenario,
        received: mpsc::UnboundedSender<ReplicationMsg>,
        inject: mpsc::UnboundedReceiver<ReplicationMsg>,
    }

    impl FakeRs {
        fn spawn(self, stream: DuplexStream) -> tokio::task::JoinHandle<()> {
            let FakeRs { group_id, window_size, scenario, received, mut inject } = self;
            tokio::spawn(async move {
                let session = FramedSession::new(stream);
                let rs_start = ReplServerStartMsg {
                    server_id: RS_ID,
                    server_url: "rs1:8989".to_string(),
                    generation_id: -1,
                    group_id,
                    window_size,
                    state: ServerState::new(),
                };
                let topology = TopologyMsg {
                    rs_infos: vec![RsInfo {
                        server_id: RS_ID,
                        server_url: "rs1:8989".to_string(),
                        group_id,
                        generation_id: -1,
                        weight: 1,
                        connected_ds_count: 1,
                    }],
                    ds_infos: vec![],
                };
                let session = Arc::new(session);
                if answer_handshake(&session, rs_start, topology).await.is_err() {
                    return;
                }
                // Writes are internally serialized, so a side task can
                // forward injected messages while this loop keeps reading.
                let writer = Arc::clone(&session);
                let forwarder = tokio::spawn(async move {
                    while let Some(msg) = inject.recv().await {
                        if writer.publish(&msg).await.is_err() {
                            return;
                        }
                    }
                });
                loop {
                    let msg = match session.receive().await {
                        Ok(msg) => msg,
                        Err(_) => break,
                    };
                    if !handle_rs_message(scenario, &received, &session, msg).await {
                        break;
                    }
                }
                forwarder.abort();
            })
        }
    }

    async fn handle_rs_message(
        scenario: RsScenario,
        received: &mpsc::UnboundedSender<ReplicationMsg>,
        session: &FramedSession<DuplexStream>,
        msg: ReplicationMsg,
    ) -> bool {
        match &msg {
            ReplicationMsg::Stop => {
                let _ = received.send(msg);
                false
            }
            m if m.is_update() => {
                let header = m.update_header().cloned();
                let _ = received.send(msg);
                if let Some(header) = header {
                    if header.assured {
                        match scenario {
                            RsScenario::AckClean => {
                                let ack = AckMsg::clean(header.csn);
                                let _ = session.publish(&ReplicationMsg::Ack(ack)).await;
                            }
                            RsScenario::AckWithReplayError => {
                                let ack = AckMsg {
                                    csn: header.csn,
                                    has_timeout: false,
                                    has_wrong_status: false,
                                    has_replay_error: true,
                                    failed_servers: vec![7],
                                };
                                let _ = session.publish(&ReplicationMsg::Ack(ack)).await;
                            }
                            RsScenario::NoAck => {}
                        }
                    }
                }
                true
            }
            _ => {
                let _ = received.send(msg);
                true
            }
        }
    }

    fn domain_config(assured: bool, mode: AssuredMode, level: u8) -> DomainConfig {
        DomainConfig {
            replica_id: 1,
            base_dn: "dc=example,dc=com".to_string(),
            assured,
            assured_mode: mode,
            safe_data_level: level,
            assured_timeout_ms: 2_000,
            replication_servers: vec!["rs1".to_string()],
            ..DomainConfig::default()
        }
    }

    struct Harness {
        domain: Arc<ReplicationDomain<MemoryEntryStore>>,
        store: Arc<MemoryEntryStore>,
        monitor: Arc<CounterMonitor>,
        received: mpsc::UnboundedReceiver<ReplicationMsg>,
        inject: mpsc::UnboundedSender<ReplicationMsg>,
        connector: TestConnector,
    }

    fn harness(config: DomainConfig, scenario: RsScenario) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store = Arc::new(MemoryEntryStore::new());
        let monitor = Arc::new(CounterMonitor::new());
        let domain = Arc::new(
            ReplicationDomain::new(
                config,
                Arc::clone(&store),
                AttrRegistry::new(),
                monitor.clone() as Arc<dyn ReplicationMonitor>,
            )
            .unwrap(),
        );
        let (ds_stream, rs_stream) = tokio::io::duplex(256 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        FakeRs { group_id: 1, window_size: 100, scenario, received: tx, inject: inject_rx }
            .spawn(rs_stream);
        let connector = TestConnector::new();
        connector.add("rs1", ds_stream);
        Harness { domain, store, monitor, received: rx, inject: inject_tx, connector }
    }

    fn modify_msg(header: UpdateHeader) -> ReplicationMsg {
        ReplicationMsg::Modify(ModifyMsg {
            header,
            mods: vec![WireModification {
                op: ModOp::Replace,
                attr: "description".to_string(),
                values: vec![b"v".to_vec()],
            }],
        })
    }

    // Heartbeats flow on every session; skip anything the test is not
    // looking for.
    async fn recv_until<F>(
        rx: &mut mpsc::UnboundedReceiver<ReplicationMsg>,
        pred: F,
    ) -> ReplicationMsg
    where
        F: Fn(&ReplicationMsg) -> bool,
    {
        loop {
            let msg = rx.recv().await.expect("fake RS channel closed");
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_publish_plain_update() {
        let mut h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::AckClean);
        let (handle, _outcome) = h.domain.connect(&h.connector).await.unwrap();
        assert_eq!(handle.rs_id, RS_ID);
        let before = handle.send_credits();

        let header = h.domain.new_update_header("u-1", "uid=a,dc=example,dc=com");
        assert!(!header.assured);
        let csn = header.csn;
        let outcome = h.domain.publish_update(&handle, modify_msg(header)).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Sent);
        assert_eq!(handle.send_credits(), before - 1);
        assert_eq!(h.domain.server_state().max_csn(1), Some(csn));
        assert_eq!(h.monitor.get(Counter::SentUpdates), 1);

        let received = h.received.recv().await.unwrap();
        assert!(matches!(received, ReplicationMsg::Modify(_)));
    }

    #[tokio::test]
    async fn test_assured_safe_read_waits_for_ack() {
        let h = harness(domain_config(true, AssuredMode::SafeRead, 1), RsScenario::AckClean);
        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);

        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        let header = h.domain.new_update_header("u-1", "uid=a,dc=example,dc=com");
        assert!(header.assured);
        let published = h.domain.publish_update(&handle, modify_msg(header)).await.unwrap();
        assert_eq!(
            published,
            PublishOutcome::Assured(AckOutcome::Acknowledged { errors: false })
        );
        assert_eq!(h.monitor.get(Counter::AssuredSrSentUpdates), 1);
        assert_eq!(h.monitor.get(Counter::AssuredSrAcknowledgedUpdates), 1);
        session_task.abort();
    }

    #[tokio::test]
    async fn test_assured_ack_with_errors_still_acknowledges() {
        let h = harness(
            domain_config(true, AssuredMode::SafeRead, 1),
            RsScenario::AckWithReplayError,
        );
        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);
        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        let header = h.domain.new_update_header("u-1", "uid=a,dc=example,dc=com");
        let published = h.domain.publish_update(&handle, modify_msg(header)).await.unwrap();
        assert_eq!(
            published,
            PublishOutcome::Assured(AckOutcome::Acknowledged { errors: true })
        );
        assert_eq!(h.monitor.get(Counter::AssuredSrReplayErrorUpdates), 1);
        assert_eq!(h.monitor.server_errors(AssuredMode::SafeRead, 7), 1);
        session_task.abort();
    }

    #[tokio::test]
    async fn test_assured_timeout_reports_timed_out() {
        let mut config = domain_config(true, AssuredMode::SafeRead, 1);
        config.assured_timeout_ms = 30;
        let h = harness(config, RsScenario::NoAck);
        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);
        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        let header = h.domain.new_update_header("u-1", "uid=a,dc=example,dc=com");
        let published = h.domain.publish_update(&handle, modify_msg(header)).await.unwrap();
        assert_eq!(published, PublishOutcome::Assured(AckOutcome::TimedOut));
        assert_eq!(h.monitor.get(Counter::AssuredSrTimeoutUpdates), 1);
        // No remote reported anything, so the local replica carries the error.
        assert_eq!(h.monitor.server_errors(AssuredMode::SafeRead, 1), 1);
        session_task.abort();
    }

    #[tokio::test]
    async fn test_safe_data_group_mismatch_is_fire_and_forget() {
        let h = harness(domain_config(true, AssuredMode::SafeData, 2), RsScenario::NoAck);
        // The fake RS advertises group 1 and so does the domain; move the
        // domain to another group to break the same-group path.
        let mut config = h.domain.config();
        config.group_id = 9;
        h.domain.apply_configuration_change(config).unwrap();

        let (handle, _outcome) = h.domain.connect(&h.connector).await.unwrap();
        let header = h.domain.new_update_header("u-1", "uid=a,dc=example,dc=com");
        assert!(header.assured);
        let published = h.domain.publish_update(&handle, modify_msg(header)).await.unwrap();
        assert_eq!(published, PublishOutcome::Sent);
        assert_eq!(h.monitor.get(Counter::AssuredSdSentUpdates), 0);
    }

    #[tokio::test]
    async fn test_safe_data_level_one_never_waits() {
        let h = harness(domain_config(true, AssuredMode::SafeData, 1), RsScenario::NoAck);
        let (handle, _outcome) = h.domain.connect(&h.connector).await.unwrap();
        let header = h.domain.new_update_header("u-1", "uid=a,dc=example,dc=com");
        let published = h.domain.publish_update(&handle, modify_msg(header)).await.unwrap();
        assert_eq!(published, PublishOutcome::Sent);
    }

    #[tokio::test]
    async fn test_remote_add_applied_and_safe_read_acked() {
        let mut h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::NoAck);
        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);
        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        // An assured safe-read Add arriving from a remote replica.
        let mut header = UpdateHeader::plain(
            Csn::new(100, 0, 2),
            "22222222-2222-2222-2222-222222222222",
            "uid=bob,dc=example,dc=com",
        );
        header.assured = true;
        header.assured_mode = AssuredMode::SafeRead;
        h.inject
            .send(ReplicationMsg::Add(AddMsg {
                header,
                attributes: vec![WireAttribute {
                    name: "cn".to_string(),
                    values: vec![b"bob".to_vec()],
                }],
            }))
            .unwrap();

        // The replaying side answers with a clean acknowledgement.
        let ack = recv_until(&mut h.received, |m| matches!(m, ReplicationMsg::Ack(_))).await;
        match ack {
            ReplicationMsg::Ack(ack) => {
                assert_eq!(ack.csn, Csn::new(100, 0, 2));
                assert!(!ack.has_errors());
            }
            other => panic!("expected Ack, got {other:?}"),
        }
        let entry = h.store.get_by_dn("uid=bob,dc=example,dc=com").expect("entry applied");
        assert!(entry.has_value("cn", b"bob"));
        assert_eq!(h.monitor.get(Counter::ReceivedUpdates), 1);
        assert_eq!(h.monitor.get(Counter::AssuredSrReceivedUpdates), 1);
        assert_eq!(h.monitor.get(Counter::AssuredSrReceivedUpdatesAcked), 1);
        assert_eq!(h.domain.server_state().max_csn(2), Some(Csn::new(100, 0, 2)));
        session_task.abort();
    }

    #[tokio::test]
    async fn test_remote_safe_read_modify_of_missing_entry_acks_replay_error() {
        let mut h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::NoAck);
        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);
        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        let mut header = UpdateHeader::plain(
            Csn::new(200, 0, 2),
            "33333333-3333-3333-3333-333333333333",
            "uid=ghost,dc=example,dc=com",
        );
        header.assured = true;
        header.assured_mode = AssuredMode::SafeRead;
        h.inject.send(modify_msg(header)).unwrap();

        let ack = recv_until(&mut h.received, |m| matches!(m, ReplicationMsg::Ack(_))).await;
        match ack {
            ReplicationMsg::Ack(ack) => {
                assert!(ack.has_replay_error);
                assert_eq!(ack.failed_servers, vec![1]);
            }
            other => panic!("expected Ack, got {other:?}"),
        }
        assert_eq!(h.monitor.get(Counter::AssuredSrReceivedUpdatesNotAcked), 1);
        session_task.abort();
    }

    #[tokio::test]
    async fn test_topology_change_triggers_rebalance() {
        let mut h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::NoAck);
        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);
        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        // A topology where the current server became another group while a
        // same-group alternative exists: the domain must move.
        h.inject
            .send(ReplicationMsg::Topology(TopologyMsg {
                rs_infos: vec![
                    RsInfo {
                        server_id: RS_ID,
                        server_url: "rs1:8989".to_string(),
                        group_id: 9,
                        generation_id: -1,
                        weight: 1,
                        connected_ds_count: 1,
                    },
                    RsInfo {
                        server_id: 202,
                        server_url: "rs2:8989".to_string(),
                        group_id: 1,
                        generation_id: -1,
                        weight: 1,
                        connected_ds_count: 0,
                    },
                ],
                ds_infos: vec![],
            }))
            .unwrap();

        match session_task.await.unwrap() {
            SessionEnd::Rebalance { target } => assert_eq!(target, 202),
            other => panic!("expected rebalance, got {other:?}"),
        }
        // The session said goodbye with a Stop.
        let stop = recv_until(&mut h.received, |m| matches!(m, ReplicationMsg::Stop)).await;
        assert!(matches!(stop, ReplicationMsg::Stop));
    }

    #[tokio::test]
    async fn test_catch_up_replays_changes_peer_missed() {
        let mut h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::NoAck);

        // A local entry modified at t=50 by this replica; the fake RS
        // advertises an empty state, so the change must be replayed to it.
        let mut entry = crate::entry::Entry::new("uid=a,dc=example,dc=com", "u-1");
        entry.set_attribute("description", vec![b"v".to_vec()]);
        let mut hist = EntryHistorical::new();
        let mods = vec![Modification::of_strs(ModOp::Replace, "description", &["v"])];
        hist.replay_batch(Csn::new(50, 0, 1), &mods, &mut entry, &AttrRegistry::new());
        hist.attach_to(&mut entry, 0);
        h.store.put(entry);

        let (handle, outcome) = h.domain.connect(&h.connector).await.unwrap();
        let handle = Arc::new(handle);
        let domain = Arc::clone(&h.domain);
        let loop_handle = Arc::clone(&handle);
        let session_task =
            tokio::spawn(async move { domain.run_session(&loop_handle, &outcome).await });

        let replayed = recv_until(&mut h.received, ReplicationMsg::is_update).await;
        match replayed {
            ReplicationMsg::Modify(m) => {
                assert_eq!(m.header.csn, Csn::new(50, 0, 1));
                assert_eq!(m.mods[0].values, vec![b"v".to_vec()]);
            }
            other => panic!("expected replayed modify, got {other:?}"),
        }
        session_task.abort();
    }

    #[tokio::test]
    async fn test_configuration_change_hot_vs_reconnect() {
        let h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::NoAck);
        let mut hot = h.domain.config();
        hot.assured_timeout_ms = 123;
        hot.weight = 5;
        assert!(!h.domain.apply_configuration_change(hot).unwrap());

        let mut cold = h.domain.config();
        cold.replication_servers.push("rs2".to_string());
        assert!(h.domain.apply_configuration_change(cold).unwrap());

        let mut bad = h.domain.config();
        bad.safe_data_level = 0;
        assert!(h.domain.apply_configuration_change(bad).is_err());
    }

    #[tokio::test]
    async fn test_connect_fails_when_no_server_reachable() {
        let h = harness(domain_config(false, AssuredMode::SafeData, 1), RsScenario::NoAck);
        let empty = TestConnector::new();
        let err = h.domain.connect(&empty).await.unwrap_err();
        assert!(matches!(err, ReplError::NoReplicationServer { attempted: 1 }));
    }
}
