use std::fmt;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::{
    LoginError,
    context::VtNumber,
    interrupt::InterruptController,
    runtime::build_environment,
    subprocess::ProcessHandle,
    users::Identity,
    utmp::{Accountant, RecordHandle, SessionEntry},
};
use crate::{
    session::{Carrier, CarrierFactory, client, metadata::SessionDefinition},
    utils::config::Config,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoginState {
    Idle,
    EnvironmentPrepared,
    CarrierStarting,
    CarrierReady,
    ClientRunning,
    Unwinding,
    Terminal,
}

#[derive(Debug)]
pub enum Terminal {
    Success,
    Interrupted,
    Failure(LoginError),
}

impl Terminal {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Interrupted | Self::Failure(_) => 1,
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Session ended"),
            Self::Interrupted => write!(f, "Session interrupted"),
            // The whole chain on one line
            Self::Failure(error) => {
                write!(f, "{error}")?;
                let mut source = std::error::Error::source(error);
                while let Some(cause) = source {
                    write!(f, ": {cause}")?;
                    source = std::error::Error::source(cause);
                }
                Ok(())
            }
        }
    }
}

enum Outcome {
    ClientExited,
    Interrupted,
}

/// Everything that has to be given back, in acquisition order
enum Acquired {
    Carrier(Box<dyn Carrier>),
    Record(RecordHandle),
    Client(ProcessHandle),
}

/// Drives one login from a validated identity to a finished session
pub struct Orchestrator<'a, F: CarrierFactory, A: Accountant> {
    config: &'a Config,
    carriers: F,
    accountant: A,
    interrupts: &'a InterruptController,
    state: LoginState,
    ledger: Vec<Acquired>,
}

impl<'a, F: CarrierFactory, A: Accountant> Orchestrator<'a, F, A> {
    pub fn new(
        config: &'a Config,
        carriers: F,
        accountant: A,
        interrupts: &'a InterruptController,
    ) -> Self {
        Self {
            config,
            carriers,
            accountant,
            interrupts,
            state: LoginState::Idle,
            ledger: Vec::new(),
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    fn advance(&mut self, next: LoginState) {
        debug_assert!(next > self.state, "{:?} cannot follow {:?}", next, self.state);
        debug!("{:?} -> {next:?}", self.state);
        self.state = next;
    }

    pub async fn login(&mut self, identity: Identity, definition: SessionDefinition, lang: &str) -> Terminal {
        let outcome = self.run(identity, &definition, lang).await;

        self.advance(LoginState::Unwinding);
        let interrupted = self.interrupts.is_interrupted();
        if interrupted {
            self.interrupts.interrupt_armed().await;
        }
        let teardown = self.unwind().await;
        self.interrupts.arm(Vec::new());
        self.advance(LoginState::Terminal);

        // Logged and otherwise ignored, the session itself still ended the way it did
        if let Err(error) = teardown.map_err(LoginError::Teardown) {
            warn!(stage = error.stage(), "Session ended with an incomplete teardown");
        }

        match outcome {
            _ if interrupted => Terminal::Interrupted,
            Ok(Outcome::Interrupted) => Terminal::Interrupted,
            Err(error) => Terminal::Failure(error),
            Ok(Outcome::ClientExited) => Terminal::Success,
        }
    }

    async fn run(
        &mut self,
        identity: Identity,
        definition: &SessionDefinition,
        lang: &str,
    ) -> Result<Outcome, LoginError> {
        let config = self.config;
        let interrupts = self.interrupts;

        let env = build_environment(&identity, config, lang)
            .map_err(LoginError::ResourceAllocation)?
            .set(definition);
        self.advance(LoginState::EnvironmentPrepared);

        if interrupts.is_interrupted() {
            return Ok(Outcome::Interrupted);
        }

        self.advance(LoginState::CarrierStarting);
        let mut carrier = self.carriers.carrier(definition);
        let started = interrupts.race(carrier.start(&identity, &env)).await;

        let hosts_client = carrier.hosts_client();
        let display = carrier.record_display();
        let env = env.merge(carrier.session_env());
        // A carrier may hold resources even when its start did not finish
        self.ledger.push(Acquired::Carrier(carrier));

        let server = match started {
            None => return Ok(Outcome::Interrupted),
            Some(started) => started.map_err(LoginError::CarrierStart)?,
        };
        interrupts.arm(vec![server.clone()]);
        self.advance(LoginState::CarrierReady);

        let record = self
            .accountant
            .open(SessionEntry {
                username: identity.username.clone(),
                pid: server.pid().as_raw_nonzero().get(),
                line: VtNumber::from(config.tty).tty_name(),
                display,
            })
            .map_err(LoginError::ResourceAllocation)?;
        self.ledger.push(Acquired::Record(record));

        self.advance(LoginState::ClientRunning);
        let client = if hosts_client {
            server
        } else {
            let script = client::login_script(&identity, definition, config);
            let words = client::command_line(definition, config, script.as_deref());

            info!("Starting session {}", words.join(" "));
            let client = client::command(&identity, &words, env)
                .and_then(|mut cmd| ProcessHandle::spawn("session", &mut cmd))
                .map_err(LoginError::ClientLaunch)?;

            self.ledger.push(Acquired::Client(client.clone()));
            interrupts.arm(vec![server, client.clone()]);
            client
        };

        match interrupts.race(client.wait()).await {
            None => Ok(Outcome::Interrupted),
            Some(Ok(status)) => {
                info!("Session of {} ended with {status}", identity.username);
                Ok(Outcome::ClientExited)
            }
            Some(Err(error)) => Err(LoginError::ClientLaunch(error)),
        }
    }

    /// Releases everything in the ledger, newest first.
    /// Failures are logged and do not stop the rest from being released.
    async fn unwind(&mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(acquired) = self.ledger.pop() {
            let released = match acquired {
                Acquired::Client(client) => client
                    .interrupt_and_wait()
                    .await
                    .map(|_| ())
                    .context("Failed to end the session client"),
                Acquired::Record(record) => self.accountant.close(record),
                Acquired::Carrier(mut carrier) => {
                    carrier.stop().await.context("Failed to stop the carrier")
                }
            };

            if let Err(error) = released {
                warn!("{error:#}");
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
