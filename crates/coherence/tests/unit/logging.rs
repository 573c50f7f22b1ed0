//! # Logging Tests
//!
//! The controller reports every policy decision through `tracing`.

use std::io;
use std::sync::{Arc, Mutex};

use cohsim_core::protocol::MessageKind;
use tracing_subscriber::EnvFilter;

use crate::common::builder::{ConfigBuilder, from_core};
use crate::common::harness::TestContext;

/// A `MakeWriter` target that appends into a shared buffer.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Runs `f` with a subscriber that records `filter`-enabled events into the result.
fn capture(filter: &str, f: impl FnOnce()) -> String {
    let sink = Capture::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    sink.contents()
}

#[test]
fn policy_decisions_are_logged_with_their_bank() {
    let logs = capture("cohsim_core=debug", || {
        let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
        ctx.send_request(from_core(MessageKind::ReadReq, 0x40, 1));
        let _ = ctx.next_snoop();
    });
    assert!(logs.contains("policy decision"), "{logs}");
    assert!(logs.contains("bank=0"), "{logs}");
    assert!(logs.contains("kind=Request"), "{logs}");
}

#[test]
fn decisions_are_silent_above_debug() {
    let logs = capture("cohsim_core=info", || {
        let mut ctx = TestContext::new(&ConfigBuilder::new().cores(4).build());
        ctx.send_request(from_core(MessageKind::ReadReq, 0x40, 1));
        let _ = ctx.next_snoop();
    });
    assert!(!logs.contains("policy decision"), "{logs}");
}
