//! Inbound fan-out.
//!
//! One pass per `MESSAGE` frame: decode the body, snapshot the directory,
//! call each handler in registration order. A handler whose consumer
//! detached after the snapshot was taken is skipped. A frame that fails to
//! decode is dropped and the next one is processed normally.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use courier_core::{MessageEnvelope, Result};
use tracing::{debug, error, warn};

use crate::directory::HandlerDirectory;
use crate::frame::Frame;
use crate::stats::TransportStats;

/// Run `f`, turning a panic into an `Err` carrying its message.
pub(crate) fn call_isolated<F: FnOnce()>(
    label: &'static str,
    f: F,
) -> std::result::Result<(), String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        error!(callback = label, panic = %message, "callback panicked");
        message
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result of one fan-out pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that returned normally.
    pub delivered: usize,
    /// Handlers that panicked.
    pub panicked: usize,
    /// Handlers retired between the snapshot and their turn.
    pub skipped: usize,
}

/// Decodes inbound frames and fans envelopes out to the directory.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    directory: Arc<HandlerDirectory>,
    stats: Arc<TransportStats>,
}

impl Dispatcher {
    /// Dispatcher over `directory`.
    pub fn new(directory: Arc<HandlerDirectory>, stats: Arc<TransportStats>) -> Self {
        Self { directory, stats }
    }

    /// Decode a `MESSAGE` frame body and fan it out.
    ///
    /// A body that is not a valid envelope is logged, counted and returned as
    /// `Decode`; the caller carries on with the next frame.
    pub fn dispatch_frame(&self, frame: &Frame) -> Result<DispatchOutcome> {
        match MessageEnvelope::from_json(&frame.body) {
            Ok(envelope) => Ok(self.dispatch(&envelope)),
            Err(err) => {
                self.stats.frame_dropped();
                warn!(
                    destination = frame.get("destination").unwrap_or_default(),
                    error = %err,
                    "dropping undecodable message"
                );
                Err(err)
            }
        }
    }

    /// Fan `envelope` out to every handler currently registered.
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> DispatchOutcome {
        let handlers = self.directory.message_handlers();
        let mut outcome = DispatchOutcome::default();
        for slot in &handlers {
            match slot.invoke(envelope) {
                Some(Ok(())) => outcome.delivered += 1,
                Some(Err(_)) => {
                    outcome.panicked += 1;
                    self.stats.handler_panicked();
                    debug!(handler_id = slot.id().get(), "handler panicked, continuing fan-out");
                }
                None => {
                    outcome.skipped += 1;
                    debug!(
                        consumer_id = %slot.consumer(),
                        handler_id = slot.id().get(),
                        "consumer detached mid-pass, handler skipped"
                    );
                }
            }
        }
        self.stats.frame_dispatched();
        debug!(
            sender_id = %envelope.sender_id,
            recipient_id = %envelope.recipient_id,
            handlers = handlers.len(),
            "dispatched"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Command;
    use assert_matches::assert_matches;
    use courier_core::{ConsumerId, CourierError};
    use parking_lot::Mutex;

    fn setup() -> (Dispatcher, Arc<HandlerDirectory>, Arc<TransportStats>) {
        let directory = Arc::new(HandlerDirectory::new());
        let stats = Arc::new(TransportStats::default());
        (
            Dispatcher::new(Arc::clone(&directory), Arc::clone(&stats)),
            directory,
            stats,
        )
    }

    fn message(body: &str) -> Frame {
        Frame::new(Command::Message)
            .header("destination", "/topic/messages/U1")
            .body(body)
    }

    fn recorder(directory: &HandlerDirectory, log: &Arc<Mutex<Vec<String>>>, tag: &str) {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        let _ = directory.register(
            &ConsumerId::new(),
            Arc::new(move |env: &MessageEnvelope| log.lock().push(format!("{tag}:{}", env.content))),
        );
    }

    #[test]
    fn fans_out_to_every_handler() {
        let (dispatcher, directory, stats) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&directory, &log, "a");
        recorder(&directory, &log, "b");

        let env = MessageEnvelope::text("U9", "U1", "hello");
        let outcome = dispatcher.dispatch_frame(&message(&env.to_json().unwrap())).unwrap();

        assert_eq!(outcome.delivered, 2);
        assert_eq!(*log.lock(), vec!["a:hello", "b:hello"]);
        assert_eq!(stats.snapshot().frames_dispatched, 1);
    }

    #[test]
    fn malformed_then_valid() {
        let (dispatcher, directory, stats) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&directory, &log, "a");

        assert_matches!(
            dispatcher.dispatch_frame(&message("{not json")),
            Err(CourierError::Decode(_))
        );
        let env = MessageEnvelope::text("U9", "U1", "second");
        assert!(dispatcher.dispatch_frame(&message(&env.to_json().unwrap())).is_ok());

        assert_eq!(*log.lock(), vec!["a:second"]);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.frames_dispatched, 1);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let (dispatcher, directory, stats) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        fn buggy(_: &MessageEnvelope) {
            panic!("handler bug");
        }
        let _ = directory.register(&ConsumerId::new(), Arc::new(buggy));
        recorder(&directory, &log, "after");

        let outcome = dispatcher.dispatch(&MessageEnvelope::text("U9", "U1", "x"));
        assert_eq!(
            outcome,
            DispatchOutcome {
                delivered: 1,
                panicked: 1,
                skipped: 0
            }
        );
        assert_eq!(*log.lock(), vec!["after:x"]);
        assert_eq!(stats.snapshot().handler_panics, 1);
    }

    #[test]
    fn unregistered_handler_not_invoked() {
        let (dispatcher, directory, _) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let gone = ConsumerId::new();
        let log_gone = Arc::clone(&log);
        let id = directory.register(
            &gone,
            Arc::new(move |_: &MessageEnvelope| log_gone.lock().push("gone".to_string())),
        );
        recorder(&directory, &log, "kept");
        assert!(directory.unregister(&gone, id));

        let _ = dispatcher.dispatch(&MessageEnvelope::text("U9", "U1", "m"));
        assert_eq!(*log.lock(), vec!["kept:m"]);
    }

    #[test]
    fn handler_detaching_a_later_one_mid_pass() {
        let (dispatcher, directory, _) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let later = ConsumerId::new();

        let (dir, victim, log_a) = (Arc::clone(&directory), later.clone(), Arc::clone(&log));
        let _ = directory.register(
            &ConsumerId::new(),
            Arc::new(move |_: &MessageEnvelope| {
                let retired = dir.unregister_consumer(&victim).map(|r| {
                    let n = r.len();
                    r.wait();
                    n
                });
                log_a.lock().push(format!("first retired {retired:?}"));
            }),
        );
        recorder(&directory, &log, "kept");
        let log_b = Arc::clone(&log);
        let _ = directory.register(
            &later,
            Arc::new(move |_: &MessageEnvelope| log_b.lock().push("victim".to_string())),
        );

        let outcome = dispatcher.dispatch(&MessageEnvelope::text("U9", "U1", "m"));
        assert_eq!(*log.lock(), vec!["first retired Some(1)", "kept:m"]);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn no_handlers_is_fine() {
        let (dispatcher, _, _) = setup();
        let outcome = dispatcher.dispatch(&MessageEnvelope::text("U9", "U1", "m"));
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[test]
    fn panic_message_extraction() {
        let err = call_isolated("test", || panic!("static str")).unwrap_err();
        assert_eq!(err, "static str");
        let err = call_isolated("test", || panic!("{}", String::from("owned"))).unwrap_err();
        assert_eq!(err, "owned");
        assert!(call_isolated("test", || {}).is_ok());
    }
}
