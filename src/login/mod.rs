pub mod context;
pub mod interrupt;
pub mod orchestrator;
#[cfg(feature = "pam")]
pub mod pam;
pub mod privilege;
pub mod runtime;
pub mod subprocess;
pub mod tty;
pub mod users;
pub mod utmp;

use thiserror::Error;
use tracing::info;

use crate::{
    session::{
        Carriers,
        metadata::{self, SessionDefinition, SessionDirs},
    },
    utils::config::Config,
};
use interrupt::InterruptController;
use orchestrator::{Orchestrator, Terminal};
use users::{Identity, Passwd, UserInfoProvider};
use utmp::Utmp;

/// The stage a login attempt failed at
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Authentication failed")]
    Authentication(#[source] anyhow::Error),
    #[error("Failed to prepare the session")]
    ResourceAllocation(#[source] anyhow::Error),
    #[error("Failed to start the display carrier")]
    CarrierStart(#[source] anyhow::Error),
    #[error("Failed to launch the session")]
    ClientLaunch(#[source] anyhow::Error),
    #[error("Failed to clean up after the session")]
    Teardown(#[source] anyhow::Error),
}

impl LoginError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::ResourceAllocation(_) => "resource allocation",
            Self::CarrierStart(_) => "carrier start",
            Self::ClientLaunch(_) => "client launch",
            Self::Teardown(_) => "teardown",
        }
    }
}

/// The session and locale `identity` logs into
fn session_for(
    identity: &Identity,
    requested: Option<&str>,
    config: &Config,
) -> Result<(SessionDefinition, String), LoginError> {
    let requested = requested.or(config.default_session.as_deref());

    let (definition, lang) = metadata::resolve(identity, requested, &SessionDirs::default())
        .map_err(LoginError::ResourceAllocation)?;

    info!("Starting session {} for {}", definition.name, identity.username);
    Ok((definition, lang.unwrap_or_else(|| config.lang.clone())))
}

async fn run_session(
    config: &Config,
    interrupts: &InterruptController,
    identity: Identity,
    definition: SessionDefinition,
    lang: &str,
) -> Terminal {
    Orchestrator::new(config, Carriers { config }, Utmp::default(), interrupts)
        .login(identity, definition, lang)
        .await
}

fn is_autologin(config: &Config, username: Option<&str>) -> bool {
    match (config.autologin.as_deref(), username) {
        (Some(_), None) => true,
        (Some(auto), Some(name)) => auto == name,
        (None, _) => false,
    }
}

/// Opens a PAM session for the user and resolves what they log into.
/// Prompts give up once `cancel` fires.
#[cfg(feature = "pam")]
fn open_pam_session(
    config: &Config,
    username: Option<String>,
    requested_session: Option<&str>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(pam::Pam, Identity, SessionDefinition, String), LoginError> {
    use context::{Seat, SessionClass, VtNumber};
    use pam::{Console, CredentialsOP, Pam};
    use pam_sys::PamItemType;
    use tracing::warn;

    use crate::environment::Env;

    let vt = VtNumber::from(config.tty);
    let autologin = is_autologin(config, username.as_deref());
    let username = username.or(config.autologin.clone());

    let mut pam = Pam::start(&config.pam_service, Console::new(cancel), username.as_deref(), false)
        .map_err(LoginError::Authentication)?;

    if !autologin {
        pam.authenticate(false).map_err(LoginError::Authentication)?;
    }
    pam.assert_account_is_valid(false)
        .map_err(LoginError::Authentication)?;

    let name = pam.get_username().map_err(LoginError::Authentication)?;
    let mut identity = Passwd.query(&name).map_err(LoginError::Authentication)?;

    let (definition, lang) = session_for(&identity, requested_session, config)?;

    pam.set_item(PamItemType::TTY, &vt.tty_name())
        .map_err(LoginError::ResourceAllocation)?;
    pam.put_env(
        &Env::empty()
            .set(&definition)
            .set((Seat::default(), vt, SessionClass::User)),
    )
    .map_err(LoginError::ResourceAllocation)?;

    pam.credentials(CredentialsOP::Establish)
        .map_err(LoginError::Authentication)?;
    if let Err(error) = pam.open_session() {
        if let Err(error) = pam.credentials(CredentialsOP::Delete) {
            warn!("{error:#}");
        }
        return Err(LoginError::ResourceAllocation(error));
    }

    identity.env = pam.get_env().map_err(LoginError::ResourceAllocation)?;

    Ok((pam, identity, definition, lang))
}

/// Authenticates a user through PAM and runs their session to completion
#[cfg(feature = "pam")]
pub async fn login(
    config: &Config,
    interrupts: &InterruptController,
    username: Option<String>,
    requested_session: Option<String>,
) -> Terminal {
    use pam::CredentialsOP;
    use tracing::warn;

    // The prompt blocks, so it runs off the runtime while the signal listener keeps going
    let cancel = interrupts.token();
    let owned = config.clone();
    let prepared = tokio::task::spawn_blocking(move || {
        open_pam_session(&owned, username, requested_session.as_deref(), cancel)
    })
    .await;

    let (mut pam, identity, definition, lang) = match prepared {
        Ok(Ok(prepared)) => prepared,
        Ok(Err(_)) if interrupts.is_interrupted() => return Terminal::Interrupted,
        Ok(Err(error)) => return Terminal::Failure(error),
        Err(error) => {
            return Terminal::Failure(LoginError::Authentication(
                anyhow::Error::new(error).context("PAM transaction did not finish"),
            ));
        }
    };

    let terminal = if interrupts.is_interrupted() {
        Terminal::Interrupted
    } else {
        run_session(config, interrupts, identity, definition, &lang).await
    };

    if let Err(error) = pam.close_session() {
        warn!("{error:#}");
    }
    if let Err(error) = pam.credentials(CredentialsOP::Delete) {
        warn!("{error:#}");
    }
    if let Err(error) = pam.end() {
        warn!("{error:#}");
    }

    terminal
}

/// Runs the configured autologin session. Password logins need the `pam` feature.
#[cfg(not(feature = "pam"))]
pub async fn login(
    config: &Config,
    interrupts: &InterruptController,
    username: Option<String>,
    requested_session: Option<String>,
) -> Terminal {
    let identity = match (is_autologin(config, username.as_deref()), &config.autologin) {
        (true, Some(name)) => Passwd.query(name),
        _ => Err(anyhow::anyhow!("Password login requires PAM support, only autologin is available")),
    };

    let identity = match identity {
        Ok(identity) => identity,
        Err(error) => return Terminal::Failure(LoginError::Authentication(error)),
    };

    match session_for(&identity, requested_session.as_deref(), config) {
        Ok((definition, lang)) => run_session(config, interrupts, identity, definition, &lang).await,
        Err(error) => Terminal::Failure(error),
    }
}
