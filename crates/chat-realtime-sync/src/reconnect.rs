//! Reconnection state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//! ┌─────────────────┐  PushDisabled / InitFailed
//! │  Disconnected   │ ─────────────────────────────────┐
//! └────────┬────────┘                                  │
//!          │ Connect                                   │
//!          ▼                                           │
//! ┌─────────────────┐  ConnectionLost  ┌────────────┐  │
//! │   Connecting    │ ───────────────► │  Retrying  │  │
//! └────────┬────────┘                  └─────┬──────┘  │
//!          │ Subscribed        Subscribed    │         │
//!          ▼                ◄────────────────┤         │
//! ┌─────────────────┐  ConnectionLost        │         │
//! │    Connected    │ ──────────► Retrying   │         │
//! └─────────────────┘                        │         │
//!                      RetriesExhausted /    │         │
//!                      InitFailed            ▼         ▼
//!                                 ┌──────────────────────┐
//!                                 │   FallbackPolling    │ (terminal until Reset)
//!                                 └──────────────────────┘
//! ```

use rust_fsm::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub connection_machine(Disconnected)

    Disconnected => {
        Connect => Connecting,
        PushDisabled => FallbackPolling,
        InitFailed => FallbackPolling,
        Reset => Disconnected
    },
    Connecting => {
        Subscribed => Connected,
        // The first subscribe failing counts as a failed attempt
        ConnectionLost => Retrying,
        InitFailed => FallbackPolling,
        RetriesExhausted => FallbackPolling,
        PushDisabled => FallbackPolling,
        Reset => Disconnected
    },
    Connected => {
        Subscribed => Connected,
        ConnectionLost => Retrying,
        RetriesExhausted => FallbackPolling,
        Reset => Disconnected
    },
    Retrying => {
        Subscribed => Connected,
        ConnectionLost => Retrying,
        InitFailed => FallbackPolling,
        RetriesExhausted => FallbackPolling,
        Reset => Disconnected
    },
    FallbackPolling => {
        Reset => Disconnected
    }
}

pub use connection_machine::Input as ConnectionMachineInput;
pub use connection_machine::State as ConnectionMachineState;
pub use connection_machine::StateMachine as ConnectionMachine;

/// Connection state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// Establishing or re-establishing push delivery.
    Connecting,
    Connected,
    /// Push abandoned for the rest of the session.
    FallbackPolling,
}

impl From<&ConnectionMachineState> for ConnectionState {
    fn from(state: &ConnectionMachineState) -> Self {
        match state {
            ConnectionMachineState::Disconnected => ConnectionState::Disconnected,
            ConnectionMachineState::Connecting | ConnectionMachineState::Retrying => {
                ConnectionState::Connecting
            }
            ConnectionMachineState::Connected => ConnectionState::Connected,
            ConnectionMachineState::FallbackPolling => ConnectionState::FallbackPolling,
        }
    }
}

/// Backoff policy for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Failed reconnect attempts tolerated before falling back to polling.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnect that follows `retry_count` failed ones.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

/// What the manager should do after a connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Re-initialize after `delay`; `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// Retries exhausted: poll for the rest of the session.
    Fallback,
    /// Nothing to do (already retrying, fallen back, or never connected).
    Ignore,
}

/// Drives the machine and owns the retry counter.
#[derive(Debug)]
pub struct Reconnector {
    machine: ConnectionMachine,
    policy: ReconnectPolicy,
    retry_count: u32,
    retry_pending: bool,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            machine: ConnectionMachine::new(),
            policy,
            retry_count: 0,
            retry_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.machine.state())
    }

    pub fn machine_state(&self) -> &ConnectionMachineState {
        self.machine.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_fallback(&self) -> bool {
        *self.machine.state() == ConnectionMachineState::FallbackPolling
    }

    /// A reconnect has been scheduled and not yet started.
    pub fn is_retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Start the first connection. Returns false when not disconnected.
    pub fn begin_connect(&mut self) -> bool {
        if *self.machine.state() != ConnectionMachineState::Disconnected {
            return false;
        }
        self.consume(ConnectionMachineInput::Connect)
    }

    /// A channel subscription was confirmed.
    ///
    /// Returns true when this moved the machine into `Connected`, meaning
    /// polling should stop.
    pub fn on_subscribed(&mut self) -> bool {
        let was_connected = *self.machine.state() == ConnectionMachineState::Connected;
        if !self.consume(ConnectionMachineInput::Subscribed) {
            return false;
        }
        if self.retry_count > 0 {
            info!(retries = self.retry_count, "Push delivery restored");
        }
        self.retry_count = 0;
        self.retry_pending = false;
        !was_connected
    }

    /// The connection dropped or a (re)subscription failed.
    pub fn on_connection_lost(&mut self) -> ReconnectDecision {
        match self.machine.state() {
            ConnectionMachineState::Disconnected | ConnectionMachineState::FallbackPolling => {
                return ReconnectDecision::Ignore;
            }
            _ => {}
        }
        if self.retry_pending {
            debug!("Reconnect already scheduled");
            return ReconnectDecision::Ignore;
        }

        if self.retry_count >= self.policy.max_retries {
            warn!(
                retries = self.retry_count,
                "Reconnect attempts exhausted, falling back to polling"
            );
            self.consume(ConnectionMachineInput::RetriesExhausted);
            return ReconnectDecision::Fallback;
        }

        self.consume(ConnectionMachineInput::ConnectionLost);
        let delay = self.policy.delay_for_attempt(self.retry_count);
        self.retry_count += 1;
        self.retry_pending = true;
        info!(
            attempt = self.retry_count,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        ReconnectDecision::Retry {
            attempt: self.retry_count,
            delay,
        }
    }

    /// The scheduled reconnect timer fired.
    pub fn on_retry_started(&mut self) {
        self.retry_pending = false;
    }

    /// Transport initialization threw; push is abandoned.
    pub fn on_init_failed(&mut self) {
        self.retry_pending = false;
        self.consume(ConnectionMachineInput::InitFailed);
    }

    /// The transport selector disabled push for this deployment.
    pub fn on_push_disabled(&mut self) {
        self.consume(ConnectionMachineInput::PushDisabled);
    }

    /// Back to a fresh `Disconnected` machine.
    pub fn reset(&mut self) {
        self.consume(ConnectionMachineInput::Reset);
        self.retry_count = 0;
        self.retry_pending = false;
    }

    fn consume(&mut self, input: ConnectionMachineInput) -> bool {
        match self.machine.consume(&input) {
            Ok(_) => true,
            Err(_) => {
                debug!(state = ?self.machine.state(), input = ?input, "Ignoring transition");
                false
            }
        }
    }
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
