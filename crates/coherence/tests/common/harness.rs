use cohsim_core::controller::{BankedController, DirectoryController};
use cohsim_core::policy::Policy;
use cohsim_core::protocol::Transport;
use cohsim_core::Config;
use tracing_subscriber::EnvFilter;

/// Cycles a drive loop may take before the test is declared hung.
pub const MAX_CYCLES: u64 = 256;

/// Routes engine logs through the test writer. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One directory bank and its clock.
pub struct TestContext {
    pub ctrl: DirectoryController,
    pub now: u64,
}

impl TestContext {
    pub fn new(config: &Config) -> Self {
        init_tracing();
        let ctrl = DirectoryController::new(0, config).expect("test config must be valid");
        Self { ctrl, now: 0 }
    }

    /// Wraps bank 0 around a hand-built policy.
    pub fn with_policy(config: &Config, policy: Box<dyn Policy>) -> Self {
        init_tracing();
        let ctrl =
            DirectoryController::with_policy(0, config, policy).expect("test config must be valid");
        Self { ctrl, now: 0 }
    }

    pub fn policy(&self) -> &dyn Policy {
        self.ctrl.policy()
    }

    pub fn send_request(&mut self, t: Transport) {
        self.ctrl.input_mut().request.push(t);
    }

    pub fn send_reply(&mut self, t: Transport) {
        self.ctrl.input_mut().reply.push(t);
    }

    pub fn step(&mut self) {
        self.ctrl.drive(self.now);
        self.now += 1;
    }

    /// Drives `n` cycles.
    pub fn run(&mut self, n: u64) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Drives until `done` holds.
    ///
    /// # Panics
    ///
    /// Panics if `done` does not hold within [`MAX_CYCLES`].
    pub fn run_until(&mut self, done: impl Fn(&DirectoryController) -> bool) {
        for _ in 0..MAX_CYCLES {
            self.step();
            if done(&self.ctrl) {
                return;
            }
        }
        panic!("bank did not converge by cycle {}: {:?}", self.now, self.ctrl);
    }

    /// Drives until a snoop is emitted and takes it.
    pub fn next_snoop(&mut self) -> Transport {
        self.run_until(|c| !c.output().snoop.is_empty());
        self.ctrl.output_mut().snoop.pop().expect("snoop emitted")
    }

    /// Drives until a reply is emitted and takes it.
    pub fn next_reply(&mut self) -> Transport {
        self.run_until(|c| !c.output().reply.is_empty());
        self.ctrl.output_mut().reply.pop().expect("reply emitted")
    }

    /// Drives until the bank has no work left.
    pub fn quiesce(&mut self) {
        self.run_until(DirectoryController::is_quiesced);
    }
}

/// A banked controller and its clock.
pub struct BankedContext {
    pub ctrl: BankedController,
    pub now: u64,
}

impl BankedContext {
    pub fn new(config: &Config) -> Self {
        init_tracing();
        let ctrl = BankedController::new(config).expect("test config must be valid");
        Self { ctrl, now: 0 }
    }

    pub fn step(&mut self) {
        self.ctrl.drive(self.now);
        self.now += 1;
    }

    /// Drives until `done` holds, panicking after [`MAX_CYCLES`].
    pub fn run_until(&mut self, done: impl Fn(&BankedController) -> bool) {
        for _ in 0..MAX_CYCLES {
            self.step();
            if done(&self.ctrl) {
                return;
            }
        }
        panic!("banked controller did not converge by cycle {}", self.now);
    }
}
