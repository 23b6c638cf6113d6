//! Per-call relay state machine.
//!
//! One `RelaySession` exists per media-stream connection. It owns the
//! per-call session state (the stream SID and the caller-supplied parameters)
//! and decides, for each translated call-side event, what the connection
//! loop should do next. Keeping the decision logic free of I/O makes the
//! ordering rules directly testable.

use bytes::Bytes;
use std::collections::HashMap;

/// Lifecycle phase of one call relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Connection accepted, `start` not yet observed. The agent connection
    /// cannot be opened before this phase ends: the handshake needs the
    /// custom parameters that only arrive with `start`.
    AwaitingStart,
    /// Both legs live; events are routed between them.
    Bridging,
    /// The call has ended; nothing more is routed.
    Terminated,
}

/// A call-side frame translated into the internal event model.
#[derive(Debug)]
pub enum CallEvent {
    SessionStarted {
        stream_sid: String,
        params: HashMap<String, String>,
    },
    /// One chunk of caller audio, already decoded from base64.
    InboundAudio(Bytes),
    SessionStopped,
}

/// What the connection loop must do in response to an event.
#[derive(Debug)]
pub enum Step {
    /// Open the agent leg with the captured session parameters. Emitted at
    /// most once per call.
    OpenAgent {
        stream_sid: String,
        params: HashMap<String, String>,
    },
    /// Forward caller audio to the agent leg, in arrival order.
    ForwardAudio(Bytes),
    /// Tear down both legs.
    Shutdown,
    /// Drop the event; the reason is logged by the caller.
    Ignore(&'static str),
}

pub struct RelaySession {
    phase: Phase,
    stream_sid: Option<String>,
}

impl RelaySession {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingStart,
            stream_sid: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    /// Advances the state machine by one event and returns the action the
    /// connection loop should take.
    pub fn apply(&mut self, event: CallEvent) -> Step {
        match (self.phase, event) {
            (Phase::Terminated, _) => Step::Ignore("call already terminated"),
            (Phase::AwaitingStart, CallEvent::SessionStarted { stream_sid, params }) => {
                self.phase = Phase::Bridging;
                self.stream_sid = Some(stream_sid.clone());
                Step::OpenAgent { stream_sid, params }
            }
            (Phase::AwaitingStart, CallEvent::InboundAudio(_)) => {
                // Audio before `start` has no destination leg yet; it is
                // dropped rather than buffered.
                Step::Ignore("audio received before the stream started")
            }
            (Phase::Bridging, CallEvent::SessionStarted { .. }) => {
                Step::Ignore("duplicate start frame")
            }
            (Phase::Bridging, CallEvent::InboundAudio(bytes)) => Step::ForwardAudio(bytes),
            (_, CallEvent::SessionStopped) => {
                self.phase = Phase::Terminated;
                Step::Shutdown
            }
        }
    }

    /// Marks the relay terminated, regardless of the current phase. Used when
    /// the connection ends without a `stop` frame (transport error, close).
    pub fn terminate(&mut self) {
        self.phase = Phase::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(sid: &str) -> CallEvent {
        CallEvent::SessionStarted {
            stream_sid: sid.to_string(),
            params: HashMap::from([("prompt".to_string(), "be nice".to_string())]),
        }
    }

    #[test]
    fn test_start_opens_agent_with_session_state() {
        let mut relay = RelaySession::new();
        assert_eq!(relay.phase(), Phase::AwaitingStart);

        match relay.apply(started("MZ1")) {
            Step::OpenAgent { stream_sid, params } => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(params.get("prompt").map(String::as_str), Some("be nice"));
            }
            other => panic!("expected OpenAgent, got {:?}", other),
        }
        assert_eq!(relay.phase(), Phase::Bridging);
        assert_eq!(relay.stream_sid(), Some("MZ1"));
    }

    #[test]
    fn test_duplicate_start_is_ignored() {
        let mut relay = RelaySession::new();
        assert!(matches!(relay.apply(started("MZ1")), Step::OpenAgent { .. }));

        // A second start must never re-trigger the agent bootstrap or
        // overwrite the captured stream SID.
        assert!(matches!(relay.apply(started("MZ2")), Step::Ignore(_)));
        assert_eq!(relay.stream_sid(), Some("MZ1"));
    }

    #[test]
    fn test_audio_before_start_is_dropped() {
        let mut relay = RelaySession::new();
        let step = relay.apply(CallEvent::InboundAudio(Bytes::from_static(b"x")));
        assert!(matches!(step, Step::Ignore(_)));
        assert_eq!(relay.phase(), Phase::AwaitingStart);
    }

    #[test]
    fn test_audio_is_forwarded_in_order() {
        let mut relay = RelaySession::new();
        relay.apply(started("MZ1"));

        let chunks: Vec<&[u8]> = vec![b"a", b"b", b"c"];
        let mut forwarded = Vec::new();
        for chunk in &chunks {
            match relay.apply(CallEvent::InboundAudio(Bytes::copy_from_slice(chunk))) {
                Step::ForwardAudio(bytes) => forwarded.push(bytes),
                other => panic!("expected ForwardAudio, got {:?}", other),
            }
        }

        assert_eq!(forwarded.len(), 3);
        for (sent, received) in chunks.iter().zip(&forwarded) {
            assert_eq!(&received[..], *sent);
        }
    }

    #[test]
    fn test_stop_shuts_down_the_relay() {
        let mut relay = RelaySession::new();
        relay.apply(started("MZ1"));

        assert!(matches!(relay.apply(CallEvent::SessionStopped), Step::Shutdown));
        assert_eq!(relay.phase(), Phase::Terminated);
    }

    #[test]
    fn test_stop_before_start_still_terminates() {
        let mut relay = RelaySession::new();
        assert!(matches!(relay.apply(CallEvent::SessionStopped), Step::Shutdown));
        assert_eq!(relay.phase(), Phase::Terminated);
    }

    #[test]
    fn test_events_after_termination_are_ignored() {
        let mut relay = RelaySession::new();
        relay.apply(started("MZ1"));
        relay.apply(CallEvent::SessionStopped);

        assert!(matches!(
            relay.apply(CallEvent::InboundAudio(Bytes::from_static(b"x"))),
            Step::Ignore(_)
        ));
        assert!(matches!(relay.apply(started("MZ3")), Step::Ignore(_)));
        assert!(matches!(
            relay.apply(CallEvent::SessionStopped),
            Step::Ignore(_)
        ));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut relay = RelaySession::new();
        relay.terminate();
        relay.terminate();
        assert_eq!(relay.phase(), Phase::Terminated);
    }
}
