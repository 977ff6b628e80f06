// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The TLS record layer as seen by the TLSDNS pump.
//!
//! rustls already is the "BIO pair" model: `read_tls`/`write_tls` move
//! ciphertext between the kernel socket and the session, and
//! `reader()`/`writer()` move plaintext between the session and the framing
//! layer. This module only adds the small state machine the pump drives and
//! the pending-error slot consumed by the next cycle.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::result::{Error, Result};

/// Phases of a TLS session as the pump sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsState {
    /// Socket opened, handshake not yet started.
    None,
    /// Handshake in flight.
    Handshake,
    /// Application data flows.
    Io,
    /// Terminal failure; the stored error is surfaced once.
    Error,
}

/// One connection's TLS session plus pump bookkeeping.
pub(crate) struct TlsLayer {
    pub(crate) conn: Connection,
    pub(crate) state: TlsState,
    pub(crate) pending_error: Option<Error>,
    /// An asynchronous cycle event is already queued for this socket.
    pub(crate) cycle_scheduled: bool,
}

impl TlsLayer {
    /// Creates the server-side session for an accepted connection.
    pub(crate) fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config).map_err(Error::from)?;
        Ok(Self::wrap(Connection::from(conn)))
    }

    /// Creates the client-side session for an outgoing connection. The peer
    /// is verified by address, as DNS transports connect to IPs.
    pub(crate) fn client(config: Arc<ClientConfig>, peer: SocketAddr) -> Result<Self> {
        let name = ServerName::from(peer.ip());
        let conn = ClientConnection::new(config, name).map_err(Error::from)?;
        Ok(Self::wrap(Connection::from(conn)))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn,
            state: TlsState::None,
            pending_error: None,
            cycle_scheduled: false,
        }
    }

    pub(crate) fn is_server(&self) -> bool {
        matches!(self.conn, Connection::Server(_))
    }

    /// Records a terminal failure; the next cycle call returns it once.
    pub(crate) fn fail(&mut self, err: Error) {
        if self.pending_error.is_none() {
            self.pending_error = Some(err);
        }
        self.state = TlsState::Error;
    }
}

impl std::fmt::Debug for TlsLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsLayer")
            .field("state", &self.state)
            .field("pending_error", &self.pending_error)
            .field("is_server", &self.is_server())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_state_is_terminal_and_stores_first_error() {
        let mut layer = TlsLayer {
            conn: Connection::Server(
                ServerConnection::new(test_server_config()).expect("server session"),
            ),
            state: TlsState::Io,
            pending_error: None,
            cycle_scheduled: false,
        };

        layer.fail(Error::Eof);
        layer.fail(Error::Tls);

        assert_eq!(layer.state, TlsState::Error);
        assert_eq!(layer.pending_error.take(), Some(Error::Eof));
        // Consumed once; the state stays terminal.
        assert_eq!(layer.pending_error, None);
        assert_eq!(layer.state, TlsState::Error);
    }

    fn test_server_config() -> Arc<ServerConfig> {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .expect("self-signed certificate");
        let cert_der = key.cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
            key.key_pair.serialize_der().into(),
        );
        Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der)
                .expect("server config"),
        )
    }
}
