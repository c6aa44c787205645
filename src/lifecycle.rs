//! Module lifecycle: the client-side state machine each module runs.
//!
//! A module registers with the coordinator, requests setup, then
//! heartbeats. All recoverable failures (timeouts, missing handlers,
//! recipient failures, setup rejection) retry with fixed delays and bounded
//! circuit-breaker tolerance before escalating to a full reconnect; only
//! local configuration defects are fatal.
//!
//! The machine runs on a single mpsc event loop: requests are spawned and
//! their replies come back as events, timers are spawned tasks feeding the
//! same channel, so all state transitions happen on one logical flow.
//! Re-entrancy is guarded with the `registering` flag and idempotent timer
//! slots; never two pending timers of the same kind.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::command::{ARG_ID, Args};
use crate::config::ModuleConfig;
use crate::envelope::{
  EXIT_PROCESS_METHOD, Envelope, MODULE_RESET_ADDRESS, RESET_CONNECTION_METHOD, SpecialKind,
};
use crate::error::{CoordError, is_command_error, is_connection_error};
use crate::handler::{
  CapabilityRegistry, CommandOutcome, process_exiter, register_exit_capability,
};
use crate::session::{ConnectionSession, SessionHandle};
use crate::transaction::TransactionLedger;
use crate::transport::Transport;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 32;

/// Where the state machine currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
  /// No connection; nothing in flight.
  Disconnected,
  /// Registration request in flight or scheduled.
  Registering,
  /// Registered; waiting for a usable setup.
  AwaitingSetup,
  /// Setup applied; heartbeating.
  Operational,
}

/// Self-reported module state carried in heartbeats.
///
/// Derived from the lifecycle phase and the setup circuit breaker by
/// default; a module may report a custom state instead via its
/// configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
  /// Registration in progress.
  Registering,
  /// Waiting for setup.
  AwaitingSetup,
  /// Healthy and processing.
  Operational,
  /// Running but the setup breaker is not closed.
  Degraded,
  /// Connection reset in progress.
  Resetting,
}

impl ModuleState {
  /// Derives the reported state from the circuit breaker gate.
  pub fn from_breaker(state: BreakerState) -> Self {
    match state {
      BreakerState::Closed => ModuleState::Operational,
      BreakerState::Open | BreakerState::HalfOpen => ModuleState::Degraded,
    }
  }

  /// Wire string of this state.
  pub const fn as_str(self) -> &'static str {
    match self {
      ModuleState::Registering => "registering",
      ModuleState::AwaitingSetup => "awaiting-setup",
      ModuleState::Operational => "operational",
      ModuleState::Degraded => "degraded",
      ModuleState::Resetting => "resetting",
    }
  }
}

impl std::fmt::Display for ModuleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Events driving the lifecycle loop.
#[derive(Debug)]
pub enum LifecycleEvent {
  /// Begin registration (initial trigger).
  Start,
  /// The register retry timer fired.
  RetryRegister,
  /// A register reply arrived.
  RegisterReply(Envelope),
  /// The setup retry timer fired.
  RetrySetup,
  /// A setup reply arrived.
  SetupReply(Envelope),
  /// The heartbeat timer ticked.
  HeartbeatTick,
  /// A heartbeat reply arrived.
  HeartbeatReply(Envelope),
  /// A connection reset was requested (operator, peer, or escalation).
  ResetRequested,
  /// The postponed-reset timer fired.
  PendingResetFired,
  /// Stop the loop and release the session.
  Shutdown,
}

/// Business-level consumer of the setup document.
#[async_trait]
pub trait SetupHandler: Send + Sync {
  /// Applies the setup payload; a rejection makes the lifecycle retry
  /// setup after a fixed delay.
  async fn apply_setup(&self, setup: Args) -> Result<(), crate::handler::CommandRejected>;
}

/// The per-module lifecycle state machine.
pub struct ModuleLifecycle {
  config: ModuleConfig,
  transport: Arc<dyn Transport>,
  registry: CapabilityRegistry,
  setup_handler: Arc<dyn SetupHandler>,
  events: mpsc::Sender<LifecycleEvent>,
  breaker: CircuitBreaker,
  pub(crate) phase: LifecyclePhase,
  pub(crate) connection_id: Option<String>,
  pub(crate) registering: bool,
  pub(crate) register_retry: Option<JoinHandle<()>>,
  pub(crate) setup_retry: Option<JoinHandle<()>>,
  pub(crate) pending_reset: Option<JoinHandle<()>>,
  pub(crate) heartbeat: Option<JoinHandle<()>>,
  session: Option<SessionHandle>,
}

impl ModuleLifecycle {
  /// Creates the state machine and its event channel.
  ///
  /// Registers the module-side control capabilities into the given
  /// registry: `resetConnection`, so a peer-initiated reset flows into the
  /// event loop, and `exitProcess` terminating the process (unless the
  /// caller already registered its own exit capability, which is kept).
  /// Fails fast on invalid configuration.
  pub fn new(
    config: ModuleConfig,
    transport: Arc<dyn Transport>,
    registry: CapabilityRegistry,
    setup_handler: Arc<dyn SetupHandler>,
  ) -> Result<(Self, mpsc::Receiver<LifecycleEvent>), CoordError> {
    config.validate()?;
    let (tx, rx) = mpsc::channel(EVENT_CAPACITY);

    let events = tx.clone();
    registry.register(RESET_CONNECTION_METHOD, move |_args: Args, _create_undo| {
      let events = events.clone();
      async move {
        let _ = events.send(LifecycleEvent::ResetRequested).await;
        Ok(CommandOutcome::empty())
      }
    });
    if !registry.contains(EXIT_PROCESS_METHOD) {
      register_exit_capability(&registry, process_exiter());
    }

    let breaker = CircuitBreaker::new(config.breaker);
    Ok((
      Self {
        config,
        transport,
        registry,
        setup_handler,
        events: tx,
        breaker,
        phase: LifecyclePhase::Disconnected,
        connection_id: None,
        registering: false,
        register_retry: None,
        setup_retry: None,
        pending_reset: None,
        heartbeat: None,
        session: None,
      },
      rx,
    ))
  }

  /// Returns the current lifecycle phase.
  pub fn phase(&self) -> LifecyclePhase {
    self.phase
  }

  /// Returns the assigned connection id, if registered.
  pub fn connection_id(&self) -> Option<&str> {
    self.connection_id.as_deref()
  }

  pub(crate) fn breaker_opens(&self) -> u32 {
    self.breaker.consecutive_opens()
  }

  /// Self-reported state for heartbeats (custom override, or derived from
  /// phase and breaker).
  pub fn module_state(&self) -> ModuleState {
    match self.phase {
      LifecyclePhase::Disconnected => ModuleState::Resetting,
      LifecyclePhase::Registering => ModuleState::Registering,
      LifecyclePhase::AwaitingSetup => ModuleState::AwaitingSetup,
      LifecyclePhase::Operational => ModuleState::from_breaker(self.breaker.current_state()),
    }
  }

  /// Runs the event loop until shutdown.
  pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>) {
    while let Some(event) = events.recv().await {
      if !self.handle_event(event).await {
        break;
      }
    }
    self.cancel_timers();
    if let Some(session) = self.session.take() {
      session.reset().await;
    }
  }

  /// Handles one event; returns false on shutdown.
  pub async fn handle_event(&mut self, event: LifecycleEvent) -> bool {
    match event {
      LifecycleEvent::Start => self.start().await,
      LifecycleEvent::RetryRegister => {
        self.register_retry = None;
        self.attempt_register().await;
      }
      LifecycleEvent::RegisterReply(reply) => self.handle_register_reply(reply).await,
      LifecycleEvent::RetrySetup => {
        self.setup_retry = None;
        self.attempt_setup().await;
      }
      LifecycleEvent::SetupReply(reply) => self.handle_setup_reply(reply).await,
      LifecycleEvent::HeartbeatTick => self.send_heartbeat(),
      LifecycleEvent::HeartbeatReply(reply) => {
        if reply.has_payload() {
          warn!("heartbeat reply carried a payload; resetting connection");
          self.reset_connection().await;
        }
      }
      LifecycleEvent::ResetRequested => self.reset_connection().await,
      LifecycleEvent::PendingResetFired => {
        self.pending_reset = None;
        self.reset_connection().await;
      }
      LifecycleEvent::Shutdown => return false,
    }
    true
  }

  /// Enters `Registering` and sends the register command, unless a
  /// registration is already in progress (concurrent triggers collapse
  /// into one in-flight attempt).
  pub async fn start(&mut self) {
    if self.registering {
      debug!("registration already in progress");
      return;
    }
    self.attempt_register().await;
  }

  async fn attempt_register(&mut self) {
    self.registering = true;
    self.phase = LifecyclePhase::Registering;
    let mut args = Args::new();
    args.insert("moduleType".to_string(), json!(self.config.module_type));
    let envelope = Envelope::command(
      &self.config.module_type,
      &self.config.coordinator_address,
      "register",
      args,
    );
    debug!(module_type = %self.config.module_type, "registering with coordinator");
    self.spawn_request(envelope, LifecycleEvent::RegisterReply);
  }

  async fn handle_register_reply(&mut self, reply: Envelope) {
    let assigned_id = if is_command_error(&reply) || is_connection_error(&reply) {
      None
    } else {
      reply
        .body
        .as_ref()
        .and_then(|body| body.rest.get(ARG_ID))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
    };

    let Some(id) = assigned_id else {
      warn!("registration failed; scheduling retry");
      self.phase = LifecyclePhase::Disconnected;
      self.schedule_register_retry();
      return;
    };

    info!(id = %id, "registered; binding session and requesting setup");
    let ledger = TransactionLedger::new(self.config.push_policy);
    let session = ConnectionSession::new(&id, self.registry.clone(), ledger);
    self.session = Some(session.bind(self.transport.clone()).await);
    self.connection_id = Some(id);
    self.phase = LifecyclePhase::AwaitingSetup;
    self.attempt_setup().await;
  }

  async fn attempt_setup(&mut self) {
    let Some(id) = self.connection_id.clone() else {
      debug!("setup requested without a connection id");
      return;
    };
    if !self.breaker.try_acquire() {
      self.on_breaker_failure().await;
      return;
    }
    let mut args = Args::new();
    args.insert(ARG_ID.to_string(), json!(id));
    let envelope = Envelope::command(&id, &self.config.coordinator_address, "sendSetup", args);
    self.spawn_request(envelope, LifecycleEvent::SetupReply);
  }

  async fn handle_setup_reply(&mut self, reply: Envelope) {
    if is_command_error(&reply) || is_connection_error(&reply) {
      warn!("setup request failed");
      self.breaker.record_failure();
      self.on_breaker_failure().await;
      return;
    }

    self.breaker.record_success();
    let setup = reply.body.map(|body| body.rest).unwrap_or_default();
    match self.setup_handler.apply_setup(setup).await {
      Ok(()) => {
        info!("setup applied; module operational");
        self.phase = LifecyclePhase::Operational;
        self.registering = false;
        self.start_heartbeat();
      }
      Err(rejected) => {
        warn!(error = %rejected, "setup rejected by module; retrying after delay");
        self.schedule_setup_retry();
      }
    }
  }

  /// Retry-or-escalate after a circuit breaker failure: below the open
  /// limit, retry setup after a fixed short delay; at the limit, stop
  /// retrying and force a full connection reset, clearing the counter.
  async fn on_breaker_failure(&mut self) {
    if self.breaker.open_limit_reached() {
      warn!(
        opens = self.breaker.consecutive_opens(),
        "setup open limit reached; forcing connection reset"
      );
      self.breaker.reset();
      self.do_reset().await;
    } else {
      self.schedule_setup_retry();
    }
  }

  fn send_heartbeat(&mut self) {
    let Some(id) = self.connection_id.clone() else {
      return;
    };
    let state = self
      .config
      .reported_state
      .clone()
      .unwrap_or_else(|| self.module_state().to_string());
    let envelope = Envelope::special(SpecialKind::Heartbeat, &id, Some(&state));
    self.spawn_request(envelope, LifecycleEvent::HeartbeatReply);
  }

  /// Requests a connection reset.
  ///
  /// While a registration is in flight the reset is postponed via a single
  /// pending-reset timer (at most one postponed reset is ever scheduled);
  /// otherwise timers are cancelled, the session is reset, and the machine
  /// re-enters `Registering`.
  pub async fn reset_connection(&mut self) {
    if self.registering {
      if self.pending_reset.is_none() {
        debug!("registration in flight; postponing reset");
        let events = self.events.clone();
        let delay = self.config.pending_reset_delay;
        self.pending_reset = Some(tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          let _ = events.send(LifecycleEvent::PendingResetFired).await;
        }));
      }
      return;
    }
    self.do_reset().await;
  }

  async fn do_reset(&mut self) {
    info!("resetting connection");
    self.cancel_timers();
    if let Some(session) = self.session.take() {
      session.reset().await;
    }
    self.connection_id = None;
    self.registering = false;
    self.phase = LifecyclePhase::Disconnected;
    self.start().await;
  }

  fn schedule_register_retry(&mut self) {
    if self.register_retry.is_some() {
      return;
    }
    let events = self.events.clone();
    let delay = self.config.register_retry_delay;
    self.register_retry = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = events.send(LifecycleEvent::RetryRegister).await;
    }));
  }

  fn schedule_setup_retry(&mut self) {
    if self.setup_retry.is_some() {
      return;
    }
    let events = self.events.clone();
    let delay = self.config.setup_retry_delay;
    self.setup_retry = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = events.send(LifecycleEvent::RetrySetup).await;
    }));
  }

  fn start_heartbeat(&mut self) {
    if self.heartbeat.is_some() {
      return;
    }
    let events = self.events.clone();
    let period = self.config.heartbeat_interval;
    self.heartbeat = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await; // immediate first tick consumed
      loop {
        ticker.tick().await;
        if events.send(LifecycleEvent::HeartbeatTick).await.is_err() {
          break;
        }
      }
    }));
  }

  fn cancel_timers(&mut self) {
    for timer in [
      &mut self.register_retry,
      &mut self.setup_retry,
      &mut self.pending_reset,
      &mut self.heartbeat,
    ] {
      if let Some(handle) = timer.take() {
        handle.abort();
      }
    }
  }

  fn spawn_request(&self, envelope: Envelope, wrap: fn(Envelope) -> LifecycleEvent) {
    let transport = self.transport.clone();
    let address = self.config.coordinator_address.clone();
    let timeout = self.config.request_timeout;
    let events = self.events.clone();
    tokio::spawn(async move {
      let reply = transport.request(&address, envelope, timeout).await;
      let _ = events.send(wrap(reply)).await;
    });
  }
}

impl std::fmt::Debug for ModuleLifecycle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModuleLifecycle")
      .field("phase", &self.phase)
      .field("connection_id", &self.connection_id)
      .field("registering", &self.registering)
      .finish_non_exhaustive()
  }
}

/// Handle to a spawned lifecycle loop.
pub struct LifecycleHandle {
  events: mpsc::Sender<LifecycleEvent>,
  join: JoinHandle<()>,
}

impl LifecycleHandle {
  /// Returns a sender for injecting lifecycle events.
  pub fn events(&self) -> mpsc::Sender<LifecycleEvent> {
    self.events.clone()
  }

  /// Stops the loop and waits for it to release its session.
  pub async fn shutdown(self) {
    let _ = self.events.send(LifecycleEvent::Shutdown).await;
    let _ = self.join.await;
  }
}

impl std::fmt::Debug for LifecycleHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LifecycleHandle").finish_non_exhaustive()
  }
}

/// Validates configuration, spawns the lifecycle loop, subscribes to the
/// `module_reset` broadcast, and triggers registration.
pub async fn spawn(
  config: ModuleConfig,
  transport: Arc<dyn Transport>,
  registry: CapabilityRegistry,
  setup_handler: Arc<dyn SetupHandler>,
) -> Result<LifecycleHandle, CoordError> {
  let (lifecycle, rx) = ModuleLifecycle::new(config, transport.clone(), registry, setup_handler)?;
  let events = lifecycle.events.clone();

  let mut resets = transport.subscribe_broadcast(MODULE_RESET_ADDRESS).await;
  let reset_events = events.clone();
  tokio::spawn(async move {
    while resets.recv().await.is_some() {
      if reset_events.send(LifecycleEvent::ResetRequested).await.is_err() {
        break;
      }
    }
  });

  let _ = events.send(LifecycleEvent::Start).await;
  let join = tokio::spawn(lifecycle.run(rx));
  Ok(LifecycleHandle { events, join })
}
