//! Connection session arena
//!
//! All mutable protocol state of one connection lives in [`Session`], behind a
//! single `parking_lot::Mutex` owned by the client. Every method here is
//! synchronous and completes without touching the network, so the lock is
//! only ever held for the duration of a map update and never across an
//! `.await`.
//!
//! Field ownership:
//! - `pending_subscriptions` / `pending_unsubscriptions`: inserted by the
//!   calling task before its frame is sent, removed by the read loop on the
//!   tagged ack or by the caller on timeout / send failure.
//! - `bindings`: written only when an ack is applied or on disposal, read by
//!   the read loop for every price frame.
//! - `state`: written by connect / read loop exit / disconnect.

use super::error::StreamError;
use super::handler::PriceHandler;
use super::messages::{Ack, ErrorCode};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Completion signal of one pending request
pub(crate) type Completion = oneshot::Sender<Result<(), StreamError>>;

/// Lifecycle of the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connecting,
    Open,
    Closing,
    /// Closed by the peer, by a transport error or by disposal
    Closed,
}

pub(crate) struct PendingSubscription {
    pub instrument: String,
    pub levels: Vec<f64>,
    pub handler: Arc<dyn PriceHandler>,
    /// Issued while a resubscription pass was running
    pub resubscription: bool,
    pub completion: Completion,
}

pub(crate) struct PendingUnsubscription {
    pub instrument: String,
    pub completion: Completion,
}

struct Binding {
    levels: Vec<f64>,
    handler: Arc<dyn PriceHandler>,
}

/// Outcome of applying an ack to the session
pub(crate) struct Resolved {
    pub instrument: String,
    pub completion: Completion,
    pub result: Result<(), StreamError>,
}

#[derive(Default)]
pub(crate) struct Session {
    pending_subscriptions: FxHashMap<String, PendingSubscription>,
    pending_unsubscriptions: FxHashMap<String, PendingUnsubscription>,
    bindings: FxHashMap<String, Binding>,
    tradable_instruments: Vec<String>,
    resubscription_depth: usize,
    pub state: ConnectionState,
    pub last_price_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("pending_subscriptions", &self.pending_subscriptions.len())
            .field("pending_unsubscriptions", &self.pending_unsubscriptions.len())
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("resubscription_depth", &self.resubscription_depth)
            .finish()
    }
}

impl Session {
    pub fn is_resubscribing(&self) -> bool {
        self.resubscription_depth > 0
    }

    pub fn enter_resubscription(&mut self) {
        self.resubscription_depth += 1;
    }

    pub fn leave_resubscription(&mut self) {
        self.resubscription_depth = self.resubscription_depth.saturating_sub(1);
    }

    fn has_pending_subscription(&self, instrument: &str) -> bool {
        self.pending_subscriptions
            .values()
            .any(|pending| pending.instrument == instrument)
    }

    /// Record a subscribe request before its frame goes out
    ///
    /// Duplicate checks are skipped while a resubscription pass runs.
    pub fn register_subscription(
        &mut self,
        tag: String,
        instrument: &str,
        levels: &[f64],
        handler: Arc<dyn PriceHandler>,
        completion: Completion,
    ) -> Result<(), StreamError> {
        let resubscription = self.is_resubscribing();
        if !resubscription
            && (self.bindings.contains_key(instrument) || self.has_pending_subscription(instrument))
        {
            return Err(StreamError::AlreadySubscribed(instrument.to_owned()));
        }

        self.pending_subscriptions.insert(
            tag,
            PendingSubscription {
                instrument: instrument.to_owned(),
                levels: levels.to_vec(),
                handler,
                resubscription,
                completion,
            },
        );
        Ok(())
    }

    /// Record an unsubscribe request before its frame goes out
    pub fn register_unsubscription(
        &mut self,
        tag: String,
        instrument: &str,
        completion: Completion,
    ) -> Result<(), StreamError> {
        if !self.bindings.contains_key(instrument) {
            return Err(StreamError::NotSubscribed(instrument.to_owned()));
        }
        if self
            .pending_unsubscriptions
            .values()
            .any(|pending| pending.instrument == instrument)
        {
            return Err(StreamError::UnsubscriptionInFlight(instrument.to_owned()));
        }

        self.pending_unsubscriptions.insert(
            tag,
            PendingUnsubscription {
                instrument: instrument.to_owned(),
                completion,
            },
        );
        Ok(())
    }

    /// Apply a subscribe ack; `None` if no pending request carries its tag
    pub fn complete_subscription(&mut self, ack: &Ack) -> Option<Resolved> {
        let tag = ack.tag.as_deref()?;
        let pending = self.pending_subscriptions.remove(tag)?;

        let result = match &ack.outcome {
            Ok(()) => Ok(()),
            Err(error) if pending.resubscription && error.code == ErrorCode::ALREADY_SUBSCRIBED => Ok(()),
            Err(error) => Err(StreamError::SubscriptionRejected {
                instrument: pending.instrument.clone(),
                code: error.code,
                message: error.message.clone(),
            }),
        };

        if result.is_ok() {
            self.bindings.insert(
                pending.instrument.clone(),
                Binding {
                    levels: pending.levels,
                    handler: pending.handler,
                },
            );
        }

        Some(Resolved {
            instrument: pending.instrument,
            completion: pending.completion,
            result,
        })
    }

    /// Apply an unsubscribe ack; `None` if no pending request carries its tag
    ///
    /// A `3008 not subscribed yet` answer means the provider has no
    /// subscription left either, so the binding is dropped and the call
    /// succeeds.
    pub fn complete_unsubscription(&mut self, ack: &Ack) -> Option<Resolved> {
        let tag = ack.tag.as_deref()?;
        let pending = self.pending_unsubscriptions.remove(tag)?;

        let result = match &ack.outcome {
            Ok(()) => Ok(()),
            Err(error) if error.code == ErrorCode::NOT_SUBSCRIBED_YET => Ok(()),
            Err(error) => Err(StreamError::SubscriptionRejected {
                instrument: pending.instrument.clone(),
                code: error.code,
                message: error.message.clone(),
            }),
        };

        if result.is_ok() {
            self.bindings.remove(&pending.instrument);
        }

        Some(Resolved {
            instrument: pending.instrument,
            completion: pending.completion,
            result,
        })
    }

    pub fn remove_pending_subscription(&mut self, tag: &str) -> bool {
        self.pending_subscriptions.remove(tag).is_some()
    }

    pub fn remove_pending_unsubscription(&mut self, tag: &str) -> bool {
        self.pending_unsubscriptions.remove(tag).is_some()
    }

    /// Take every pending completion, leaving the tables empty
    pub fn drain_pending(&mut self) -> Vec<Completion> {
        let subscriptions = self
            .pending_subscriptions
            .drain()
            .map(|(_, pending)| pending.completion);
        let unsubscriptions = self
            .pending_unsubscriptions
            .drain()
            .map(|(_, pending)| pending.completion);
        subscriptions.chain(unsubscriptions).collect()
    }

    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    pub fn handler_for(&self, instrument: &str) -> Option<Arc<dyn PriceHandler>> {
        self.bindings
            .get(instrument)
            .map(|binding| Arc::clone(&binding.handler))
    }

    pub fn is_bound(&self, instrument: &str) -> bool {
        self.bindings.contains_key(instrument)
    }

    pub fn levels_for(&self, instrument: &str) -> Option<Vec<f64>> {
        self.bindings.get(instrument).map(|binding| binding.levels.clone())
    }

    pub fn active_instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self.bindings.keys().cloned().collect();
        instruments.sort();
        instruments
    }

    pub fn pending_count(&self) -> usize {
        self.pending_subscriptions.len() + self.pending_unsubscriptions.len()
    }

    pub fn set_tradable_instruments(&mut self, instruments: Vec<String>) {
        self.tradable_instruments = instruments;
    }

    pub fn tradable_instruments(&self) -> &[String] {
        &self.tradable_instruments
    }
}
