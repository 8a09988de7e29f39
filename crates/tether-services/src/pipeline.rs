//! Stage chain: an ordered, static list of transforms between the transport
//! and the application.
//!
//! Stage 0 sits next to the transport. Inbound traffic enters at stage 0
//! and climbs; outbound traffic enters above the last stage and descends.
//! A stage answers every call with a list of [`Action`]s:
//!
//! - `Inbound` continues upwards from the stage that emitted it.
//! - `Outbound` continues downwards and its outcome belongs to the caller.
//! - `Detached` continues downwards as a side message (ping, ack, unite);
//!   its failure is logged and never reaches the caller.
//!
//! Returning no actions consumes the message. The chain is synchronous and
//! never awaits I/O. Frames leave through an unbounded channel drained by
//! the transport's send worker.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tether_core::{Body, Envelope, PublicKey};
use tokio::sync::mpsc;

use crate::error::PipelineError;

// ── Messages ──────────────────────────────────────────────────────────────────

/// Where a message comes from or goes to.
///
/// Routing stages turn `Peer` into `Socket`. A message still addressed to a
/// bare key when it reaches the transport has no route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Socket(SocketAddr),
    Peer(PublicKey),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Peer(key) => write!(f, "{key}"),
        }
    }
}

/// A message between two stages: raw frame bytes below the codec, decoded
/// envelopes above it.
#[derive(Debug, Clone)]
pub enum Message {
    Bytes(Bytes),
    Envelope(Envelope),
}

impl Message {
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Message::Envelope(envelope) => Some(envelope),
            Message::Bytes(_) => None,
        }
    }
}

impl From<Envelope> for Message {
    fn from(envelope: Envelope) -> Self {
        Message::Envelope(envelope)
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Inbound { from: Address, message: Message },
    Outbound { to: Address, message: Message },
    Detached { to: Address, message: Message },
}

impl Action {
    pub fn inbound(from: Address, message: impl Into<Message>) -> Self {
        Action::Inbound {
            from,
            message: message.into(),
        }
    }

    pub fn outbound(to: Address, message: impl Into<Message>) -> Self {
        Action::Outbound {
            to,
            message: message.into(),
        }
    }

    pub fn detached(to: Address, message: impl Into<Message>) -> Self {
        Action::Detached {
            to,
            message: message.into(),
        }
    }
}

/// Node lifecycle events broadcast to every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    NodeUp,
    NodeDown,
    UnrecoverableError,
}

impl NodeEvent {
    /// Both `NodeDown` and `UnrecoverableError` end the node's session.
    pub fn is_shutdown(self) -> bool {
        matches!(self, NodeEvent::NodeDown | NodeEvent::UnrecoverableError)
    }
}

/// A frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub bytes: Bytes,
}

/// An application payload that reached the top of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: PublicKey,
    pub payload: Bytes,
}

// ── Stage ─────────────────────────────────────────────────────────────────────

/// One transform in the chain. Default methods pass everything through.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        Ok(vec![Action::Inbound { from, message }])
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        Ok(vec![Action::Outbound { to, message }])
    }

    /// Called once per heartbeat.
    fn on_tick(&self) -> Result<Vec<Action>, PipelineError> {
        Ok(Vec::new())
    }

    fn on_event(&self, _event: NodeEvent) -> Result<Vec<Action>, PipelineError> {
        Ok(Vec::new())
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Pipeline {
    /// `stages[0]` is nearest the transport.
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        outgoing: mpsc::UnboundedSender<Outgoing>,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            stages,
            outgoing,
            deliveries,
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Feed a frame received from the transport.
    pub fn inbound(&self, from: SocketAddr, bytes: Bytes) -> Result<(), PipelineError> {
        self.run_inbound(0, Address::Socket(from), Message::Bytes(bytes))
    }

    /// Send a message from the application end.
    pub fn outbound(&self, to: Address, message: Message) -> Result<(), PipelineError> {
        self.run_outbound(self.stages.len(), to, message)
    }

    /// Run every stage's heartbeat work. Failures are per peer and only logged.
    pub fn tick(&self) {
        for (idx, stage) in self.stages.iter().enumerate() {
            match stage.on_tick() {
                Ok(actions) => self.dispatch_detached(idx, actions),
                Err(e) => tracing::warn!(stage = stage.name(), error = %e, "heartbeat failed"),
            }
        }
    }

    /// Broadcast a lifecycle event, transport end first.
    pub fn fire(&self, event: NodeEvent) {
        for (idx, stage) in self.stages.iter().enumerate() {
            match stage.on_event(event) {
                Ok(actions) => self.dispatch_detached(idx, actions),
                Err(e) => tracing::warn!(stage = stage.name(), ?event, error = %e, "event handling failed"),
            }
        }
    }

    fn run_inbound(&self, idx: usize, from: Address, message: Message) -> Result<(), PipelineError> {
        match self.stages.get(idx) {
            Some(stage) => {
                let actions = stage.on_inbound(from, message)?;
                self.dispatch(idx, actions)
            }
            None => {
                self.deliver(from, message);
                Ok(())
            }
        }
    }

    /// Run stages `below - 1` down to 0, then hand the frame to the transport.
    fn run_outbound(&self, below: usize, to: Address, message: Message) -> Result<(), PipelineError> {
        match below.checked_sub(1) {
            Some(idx) => {
                let actions = self.stages[idx].on_outbound(to, message)?;
                self.dispatch(idx, actions)
            }
            None => self.transmit(to, message),
        }
    }

    /// Apply the actions emitted by stage `idx`. Every action runs; the
    /// first error is returned.
    fn dispatch(&self, idx: usize, actions: Vec<Action>) -> Result<(), PipelineError> {
        let mut result = Ok(());
        for action in actions {
            let outcome = match action {
                Action::Inbound { from, message } => self.run_inbound(idx + 1, from, message),
                Action::Outbound { to, message } => self.run_outbound(idx, to, message),
                Action::Detached { to, message } => {
                    self.send_detached(idx, to, message);
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Like `dispatch`, but nobody waits for the outcome.
    fn dispatch_detached(&self, idx: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Inbound { from, message } => {
                    if let Err(e) = self.run_inbound(idx + 1, from, message) {
                        tracing::debug!(%from, error = %e, "inbound message dropped");
                    }
                }
                Action::Outbound { to, message } | Action::Detached { to, message } => {
                    self.send_detached(idx, to, message)
                }
            }
        }
    }

    fn send_detached(&self, idx: usize, to: Address, message: Message) {
        if let Err(e) = self.run_outbound(idx, to, message) {
            tracing::warn!(%to, error = %e, "side message not sent");
        }
    }

    fn deliver(&self, from: Address, message: Message) {
        let Message::Envelope(envelope) = message else {
            tracing::trace!(%from, "raw frame reached application end, dropped");
            return;
        };
        if envelope.recipient().is_none() {
            tracing::debug!(%from, sender = %envelope.sender(), "unaddressed message reached application end, dropped");
            return;
        }
        match envelope.body() {
            Ok(Body::Application(payload)) => {
                let delivery = Delivery {
                    sender: envelope.sender(),
                    payload: payload.clone(),
                };
                if self.deliveries.send(delivery).is_err() {
                    tracing::debug!(sender = %envelope.sender(), "delivery receiver dropped");
                }
            }
            Ok(body) => {
                tracing::trace!(%from, message_type = ?body.message_type(), "unconsumed message dropped")
            }
            Err(e) => tracing::debug!(%from, error = %e, "undecodable message dropped"),
        }
    }

    fn transmit(&self, to: Address, message: Message) -> Result<(), PipelineError> {
        let to = match to {
            Address::Socket(addr) => addr,
            Address::Peer(key) => return Err(PipelineError::NoRouteToPeer(key)),
        };
        let bytes = match message {
            Message::Bytes(bytes) => bytes,
            Message::Envelope(envelope) => envelope.encode(),
        };
        tracing::trace!(%to, len = bytes.len(), "frame out");
        if self.outgoing.send(Outgoing { to, bytes }).is_err() {
            tracing::debug!(%to, "send worker gone, frame dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tether_core::ProofOfWork;

    const ME: PublicKey = PublicKey([0x01; 32]);
    const PEER: PublicKey = PublicKey([0x02; 32]);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn app(payload: &'static [u8]) -> Envelope {
        Envelope::new(1, PEER, ProofOfWork(0), ME, Body::Application(Bytes::from_static(payload)))
    }

    fn channels() -> (
        mpsc::UnboundedSender<Outgoing>,
        mpsc::UnboundedReceiver<Outgoing>,
        mpsc::UnboundedSender<Delivery>,
        mpsc::UnboundedReceiver<Delivery>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (del_tx, del_rx) = mpsc::unbounded_channel();
        (out_tx, out_rx, del_tx, del_rx)
    }

    /// Decodes frames on the way up and records every call.
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl Stage for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
            self.calls.lock().unwrap().push("inbound");
            let message = match message {
                Message::Bytes(bytes) => Message::Envelope(Envelope::decode(bytes)?),
                other => other,
            };
            Ok(vec![Action::Inbound { from, message }])
        }

        fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
            self.calls.lock().unwrap().push("outbound");
            Ok(vec![Action::Outbound { to, message }])
        }
    }

    /// Answers every inbound message with a detached reply to a bare key.
    struct Responder;

    impl Stage for Responder {
        fn name(&self) -> &'static str {
            "responder"
        }

        fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
            Ok(vec![
                Action::detached(Address::Peer(PEER), app(b"reply")),
                Action::Inbound { from, message },
            ])
        }
    }

    #[test]
    fn inbound_frame_is_delivered_at_the_top() {
        let (out_tx, _out_rx, del_tx, mut del_rx) = channels();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(vec![recorder.clone()], out_tx, del_tx);

        pipeline.inbound(addr(1), app(b"hello").encode()).unwrap();
        let delivery = del_rx.try_recv().unwrap();
        assert_eq!(delivery.sender, PEER);
        assert_eq!(&delivery.payload[..], b"hello");
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["inbound"]);
    }

    #[test]
    fn unaddressed_application_is_not_delivered() {
        let (out_tx, _out_rx, del_tx, mut del_rx) = channels();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(vec![recorder], out_tx, del_tx);

        let unaddressed = Envelope::new(
            1,
            PEER,
            ProofOfWork(0),
            PublicKey::NONE,
            Body::Application(Bytes::from_static(b"forged")),
        );
        pipeline.inbound(addr(1), unaddressed.encode()).unwrap();
        assert!(del_rx.try_recv().is_err());
    }

    #[test]
    fn outbound_descends_through_every_stage_and_is_encoded() {
        let (out_tx, mut out_rx, del_tx, _del_rx) = channels();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(vec![recorder.clone(), recorder.clone()], out_tx, del_tx);

        let envelope = app(b"out");
        pipeline
            .outbound(Address::Socket(addr(9)), envelope.clone().into())
            .unwrap();
        let frame = out_rx.try_recv().unwrap();
        assert_eq!(frame.to, addr(9));
        assert_eq!(Envelope::decode(frame.bytes).unwrap().id(), envelope.id());
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn unresolved_peer_at_transport_has_no_route() {
        let (out_tx, mut out_rx, del_tx, _del_rx) = channels();
        let pipeline = Pipeline::new(Vec::new(), out_tx, del_tx);
        let err = pipeline
            .outbound(Address::Peer(PEER), app(b"x").into())
            .unwrap_err();
        assert_eq!(err, PipelineError::NoRouteToPeer(PEER));
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn detached_failure_does_not_fail_the_message() {
        let (out_tx, _out_rx, del_tx, mut del_rx) = channels();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(vec![recorder, Arc::new(Responder)], out_tx, del_tx);

        // the reply has no route, the inbound message is still delivered
        pipeline.inbound(addr(1), app(b"ping").encode()).unwrap();
        assert_eq!(&del_rx.try_recv().unwrap().payload[..], b"ping");
    }

    #[test]
    fn malformed_frame_fails_only_that_message() {
        let (out_tx, _out_rx, del_tx, mut del_rx) = channels();
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::new(vec![recorder], out_tx, del_tx);

        let err = pipeline
            .inbound(addr(1), Bytes::from_static(&[3, 1, 2]))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Wire(_)));
        pipeline.inbound(addr(1), app(b"next").encode()).unwrap();
        assert_eq!(&del_rx.try_recv().unwrap().payload[..], b"next");
    }
}
