use std::error::Error as StdError;

use thiserror::Error;
use tracing::debug;
use x11rb::{
    reexports::x11rb_protocol::parse_display::ConnectAddress,
    rust_connection::{DefaultStream, RustConnection},
};

use super::display::Display;

const AUTH_NAME: &[u8] = b"MIT-MAGIC-COOKIE-1";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Display cookie is not valid hex")]
    InvalidCookie(#[from] hex::FromHexError),
    #[error("Display {display} is unreachable")]
    DisplayUnreachable {
        display: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// Client connection used to tell whether an X server accepts connections.
/// It is held for the lifetime of the session.
#[derive(Default)]
pub struct DisplayConnector {
    connection: Option<RustConnection>,
}

impl DisplayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a single connection attempt, authenticated with `cookie`
    pub fn open(&mut self, x_display: &Display, cookie: &str) -> Result<(), ConnectError> {
        let auth_data = hex::decode(cookie)?;
        let unreachable = |source: Box<dyn StdError + Send + Sync>| ConnectError::DisplayUnreachable {
            display: x_display.to_string(),
            source,
        };

        // Going through the socket directly skips the DISPLAY and XAUTHORITY lookups
        let (stream, _) = DefaultStream::connect(&ConnectAddress::Socket(x_display.local_socket()))
            .map_err(|e| unreachable(e.into()))?;

        let connection = RustConnection::connect_to_stream_with_auth_info(
            stream,
            0,
            AUTH_NAME.to_vec(),
            auth_data,
        )
        .map_err(|e| unreachable(e.into()))?;

        debug!("Connected to display {x_display}");
        self.connection = Some(connection);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("Display connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_an_unopened_connector_is_a_noop() {
        let mut connector = DisplayConnector::new();

        connector.close();
        assert!(!connector.is_open());
    }

    #[test]
    fn invalid_cookie_is_rejected_before_connecting() {
        let mut connector = DisplayConnector::new();
        let result = connector.open(&Display::new(0), "not-hex");

        assert!(matches!(result, Err(ConnectError::InvalidCookie(_))));
    }

    #[test]
    fn absent_server_is_unreachable() {
        let mut connector = DisplayConnector::new();
        // No server listens this high in the slot range on a test host
        let result = connector.open(&Display::new(31), "00112233445566778899aabbccddeeff");

        assert!(matches!(
            result,
            Err(ConnectError::DisplayUnreachable { .. })
        ));
        assert!(!connector.is_open());
    }
}
