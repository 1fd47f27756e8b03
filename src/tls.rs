//! The DNS-over-TLS transport.
//!
//! The resolver core treats DoT as an external collaborator: the send
//! engine hands a query and a list of validated servers to a
//! [`TlsDispatcher`] and maps its outcome onto the private DNS policy,
//! and the tracker probes candidate servers through a [`TlsValidator`].
//! This module defines those two contracts and provides default
//! implementations on top of rustls: a per-query TCP+TLS connection to
//! port 853 with the standard two octet length framing.
//!
//! Certificate handling follows the private DNS profiles: a pinned CA
//! certificate when one is configured, the system trust anchors when a
//! hostname is given, and no authentication at all for opportunistic
//! servers that are only identified by address.

use crate::header::Header;
use crate::packet::HEADER_LEN;
use crate::pdns::DotServer;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

//------------ TlsResponse ---------------------------------------------------

/// The outcome of dispatching a query over TLS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TlsResponse {
    /// A response of the given length was written into the answer buffer.
    Success(usize),

    /// No server could be reached or none produced a response in time.
    NetworkError,

    /// The dispatcher failed before reaching the network.
    InternalError,

    /// The dispatcher refused the query due to resource limits.
    LimitError,
}

//------------ TlsDispatcher -------------------------------------------------

/// Sends queries over TLS to a set of private DNS servers.
pub trait TlsDispatcher: Send + Sync {
    /// Queries the given servers, writing the response into `ans`.
    fn query<'a>(
        &'a self,
        servers: &'a [DotServer],
        netid: u32,
        query: &'a [u8],
        ans: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = TlsResponse> + Send + 'a>>;
}

//------------ TlsValidator --------------------------------------------------

/// Probes whether a private DNS server actually speaks DoT.
pub trait TlsValidator: Send + Sync {
    /// Returns whether a TLS handshake and a probe query succeeded.
    fn validate<'a>(
        &'a self,
        server: &'a DotServer,
        netid: u32,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

//------------ RustlsDispatcher ----------------------------------------------

/// The default DoT transport.
///
/// Opens a fresh connection per query and walks the server list in
/// order, returning the first response whose ID matches the query.
#[derive(Clone, Debug, Default)]
pub struct RustlsDispatcher(());

impl RustlsDispatcher {
    /// Creates a new dispatcher.
    pub fn new() -> Self {
        RustlsDispatcher(())
    }
}

impl TlsDispatcher for RustlsDispatcher {
    fn query<'a>(
        &'a self,
        servers: &'a [DotServer],
        netid: u32,
        query: &'a [u8],
        ans: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = TlsResponse> + Send + 'a>> {
        Box::pin(async move {
            if query.len() > usize::from(u16::MAX) {
                return TlsResponse::InternalError;
            }
            for server in servers {
                match query_server(server, query, ans).await {
                    Ok(len) => return TlsResponse::Success(len),
                    Err(err) => {
                        debug!(
                            netid,
                            server = %server.addr,
                            %err,
                            "TLS query failed"
                        );
                    }
                }
            }
            TlsResponse::NetworkError
        })
    }
}

//------------ RustlsValidator -----------------------------------------------

/// The default DoT validation probe.
///
/// Performs the full handshake and sends a throwaway query for the root
/// NS set; any well-formed response counts as success.
#[derive(Clone, Debug, Default)]
pub struct RustlsValidator(());

impl RustlsValidator {
    /// Creates a new validator.
    pub fn new() -> Self {
        RustlsValidator(())
    }
}

impl TlsValidator for RustlsValidator {
    fn validate<'a>(
        &'a self,
        server: &'a DotServer,
        netid: u32,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let probe = probe_query();
            let mut ans = [0u8; 1024];
            match query_server(server, &probe, &mut ans).await {
                Ok(_) => true,
                Err(err) => {
                    debug!(
                        netid,
                        server = %server.addr,
                        %err,
                        "TLS validation failed"
                    );
                    false
                }
            }
        })
    }
}

/// Builds the probe query: root NS, recursion desired, random ID.
fn probe_query() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 5);
    buf.extend_from_slice(&rand::random::<u16>().to_be_bytes());
    buf.push(0x01); // RD
    buf.push(0x00);
    buf.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    buf.push(0); // root name
    buf.extend_from_slice(&2u16.to_be_bytes()); // NS
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    buf
}

//------------ Connection plumbing -------------------------------------------

/// Sends one query to one server over a fresh TLS connection.
async fn query_server(
    server: &DotServer,
    query: &[u8],
    ans: &mut [u8],
) -> io::Result<usize> {
    let config = client_config(server)?;
    let tcp = timeout(server.connect_timeout, TcpStream::connect(server.addr))
        .await
        .map_err(|_| {
            io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
        })??;
    let connector = TlsConnector::from(config);
    let mut tls = connector.connect(server_name(server)?, tcp).await?;

    tls.write_all(&(query.len() as u16).to_be_bytes()).await?;
    tls.write_all(query).await?;
    tls.flush().await?;

    loop {
        let mut len_buf = [0u8; 2];
        tls.read_exact(&mut len_buf).await?;
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len < HEADER_LEN || len > ans.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad response length",
            ));
        }
        tls.read_exact(&mut ans[..len]).await?;
        // A stale response from an earlier query on the same connection
        // cannot happen on a fresh connection, but be strict anyway.
        if Header::for_message_slice(&ans[..len]).id()
            == Header::for_message_slice(query).id()
        {
            return Ok(len);
        }
    }
}

/// Builds the TLS client configuration for a server's profile.
fn client_config(server: &DotServer) -> io::Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let config = if let Some(pem) = &server.ca_pem {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
            roots
                .add(cert?)
                .map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidInput, err)
                })?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else if !server.hostname.is_empty() {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        // Opportunistic profile: the server is identified by address
        // only, there is nothing to authenticate the certificate against.
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(
                NoVerification(provider),
            ))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Returns the name to present for SNI and certificate matching.
fn server_name(server: &DotServer) -> io::Result<ServerName<'static>> {
    if server.hostname.is_empty() {
        Ok(ServerName::IpAddress(server.addr.ip().into()))
    } else {
        ServerName::try_from(server.hostname.clone()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid DNS name")
        })
    }
}

//------------ NoVerification ------------------------------------------------

/// Accepts any server certificate.
///
/// Used for the opportunistic profile only; signatures are still checked
/// so a broken handshake does not slip through.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
