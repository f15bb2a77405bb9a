/*!
Secure transport context

Builds the rustls client and server configurations shared by every
meta-connection. Dialed peers run the client side of the handshake, accepted
peers the server side.
*/

use std::sync::Arc;

use rustls::{
    Certificate, ClientConfig, ClientConnection, Connection, PrivateKey, RootCertStore,
    ServerConfig, ServerConnection, ServerName,
};

use crate::error::{Error, Result};

/// Shared TLS state for all meta-connections
#[derive(Clone)]
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    server_name: ServerName,
}

impl TlsContext {
    /// Build a context from DER material.
    ///
    /// `roots` are the certificates peers must chain to, `server_name` the
    /// name every peer certificate is issued for. Any failure here is
    /// process-fatal.
    pub fn new(
        cert_chain: Vec<Certificate>,
        key: PrivateKey,
        roots: &[Vec<u8>],
        server_name: &str,
    ) -> Result<Self> {
        if cert_chain.is_empty() {
            return Err(Error::TlsContext("empty certificate chain".to_string()));
        }

        let mut root_store = RootCertStore::empty();
        let (added, ignored) = root_store.add_parsable_certificates(roots);
        if added == 0 {
            return Err(Error::TlsContext(format!(
                "no usable trust root ({ignored} rejected)"
            )));
        }
        if ignored > 0 {
            log::warn!("{ignored} trust root certificates could not be parsed");
        }

        let server = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::TlsContext(e.to_string()))?;

        let client = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name)
            .map_err(|e| Error::TlsContext(format!("invalid server name {server_name:?}: {e}")))?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
            server_name,
        })
    }

    /// Session for a connection we accepted
    pub fn server_session(&self) -> Result<Connection> {
        Ok(ServerConnection::new(self.server.clone())?.into())
    }

    /// Session for a connection we dialed
    pub fn client_session(&self) -> Result<Connection> {
        Ok(ClientConnection::new(self.client.clone(), self.server_name.clone())?.into())
    }
}
