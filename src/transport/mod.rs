pub mod deadline;
pub mod proxy_protocol;

use crate::config::{TlsClientConfig, TransportConfig};
use crate::error::ProxyError;
use crate::proxy::BoxBody;
use crate::upstream::pool::{DialAddress, DialInfo};
use deadline::DeadlineStream;
use hyper::body::Incoming;
use hyper::Request;
use hyper::Response;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `insecure_skip_verify` is set — internal / mesh
/// traffic where encryption is desired but upstream identity verification
/// is not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct TlsRuntime {
    connector: tokio_rustls::TlsConnector,
    /// Static SNI override; forces the direct-dial path for TLS requests.
    server_name: Option<ServerName<'static>>,
    except_ports: Vec<u16>,
    handshake_timeout: Duration,
}

/// Owns the upstream connections. Three paths:
///
/// - the pooled hyper-util client for plain `http`/`https` (ALPN picks
///   h1/h2 per connection),
/// - a plaintext HTTP/2-only client when `h2c` is enabled,
/// - a direct-dial path (fresh connection per request) for unix sockets,
///   PROXY-protocol upstreams, per-connection deadlines, and SNI overrides.
///
/// The `DialInfo` bound to each request decides where the connection
/// actually goes, regardless of what the request URI said on arrival.
pub struct Transport {
    cfg: TransportConfig,
    pooled: Client<HttpsConnector<HttpConnector>, BoxBody>,
    h2c: Option<Client<HttpConnector, BoxBody>>,
    tls: Option<TlsRuntime>,
    h2c_enabled: bool,
}

impl Transport {
    pub fn new(cfg: TransportConfig) -> Result<Self, ProxyError> {
        let h1 = cfg.versions.iter().any(|v| v == "1.1");
        let h2 = cfg.versions.iter().any(|v| v == "2");
        let h2c_enabled = cfg.versions.iter().any(|v| v == "h2c");

        let tls = match &cfg.tls {
            Some(tls_cfg) => Some(build_tls_runtime(tls_cfg, h1, h2)?),
            None => None,
        };

        let connector = build_http_connector(&cfg)?;
        let https = build_https_connector(&cfg, connector.clone(), h1, h2)?;

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_idle_timeout(cfg.keep_alive.idle_timeout);
        builder.pool_max_idle_per_host(if cfg.keep_alive.enabled {
            cfg.keep_alive.max_idle_conns_per_host
        } else {
            0
        });
        let pooled = builder.build(https);

        let h2c = if h2c_enabled {
            let mut b = Client::builder(TokioExecutor::new());
            b.pool_idle_timeout(cfg.keep_alive.idle_timeout);
            b.pool_max_idle_per_host(if cfg.keep_alive.enabled {
                cfg.keep_alive.max_idle_conns_per_host
            } else {
                0
            });
            b.http2_only(true);
            Some(b.build(connector))
        } else {
            None
        };

        Ok(Self {
            cfg,
            pooled,
            h2c,
            tls,
            h2c_enabled,
        })
    }

    /// Whether forwarded requests carry the `https` scheme.
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls_insecure(&self) -> bool {
        self.cfg
            .tls
            .as_ref()
            .map(|t| t.insecure_skip_verify)
            .unwrap_or(false)
    }

    fn tls_for_port(&self, port: u16) -> bool {
        match &self.tls {
            Some(rt) => !rt.except_ports.contains(&port),
            None => false,
        }
    }

    fn needs_direct(&self, https: bool) -> bool {
        if !self.cfg.proxy_protocol.is_empty() {
            return true;
        }
        if !self.cfg.read_timeout.is_zero() || !self.cfg.write_timeout.is_zero() {
            return true;
        }
        https
            && self
                .tls
                .as_ref()
                .is_some_and(|rt| rt.server_name.is_some())
    }

    /// Send one request to the destination named by `dial`. `endpoints` is
    /// the downstream (peer, local) pair, consumed by the PROXY-protocol
    /// preamble.
    pub async fn round_trip(
        &self,
        mut req: Request<BoxBody>,
        dial: &DialInfo,
        endpoints: Option<(SocketAddr, SocketAddr)>,
    ) -> Result<Response<Incoming>, ProxyError> {
        match &dial.address {
            DialAddress::Unix(path) => {
                set_outbound_uri(&mut req, false, "localhost", None)?;
                self.direct_unix(req, path).await
            }
            DialAddress::Tcp { host, port } => {
                let https = self.tls_for_port(*port);
                set_outbound_uri(&mut req, https, host, Some(*port))?;
                if self.needs_direct(https) {
                    self.direct_tcp(req, host, *port, https, endpoints).await
                } else if !https && self.h2c_enabled {
                    let client = self.h2c.as_ref().expect("h2c client built");
                    client.request(req).await.map_err(classify_legacy_error)
                } else {
                    self.pooled.request(req).await.map_err(classify_legacy_error)
                }
            }
        }
    }

    async fn direct_unix(
        &self,
        req: Request<BoxBody>,
        path: &str,
    ) -> Result<Response<Incoming>, ProxyError> {
        let stream = tokio::time::timeout(self.cfg.dial_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ProxyError::Dial(format!("dial unix/{} timed out", path)))?
            .map_err(|e| ProxyError::Dial(format!("dial unix/{}: {}", path, e)))?;
        let io = self.wrap_deadlines(stream);
        if self.h2c_enabled {
            self.handshake_h2(io, req).await
        } else {
            self.handshake_h1(io, req).await
        }
    }

    async fn direct_tcp(
        &self,
        req: Request<BoxBody>,
        host: &str,
        port: u16,
        https: bool,
        endpoints: Option<(SocketAddr, SocketAddr)>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let addr = format!("{}:{}", host, port);
        let mut stream = tokio::time::timeout(self.cfg.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::Dial(format!("dial {} timed out", addr)))?
            .map_err(|e| ProxyError::Dial(format!("dial {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        // The preamble goes out once per fresh connection, before any TLS
        // or HTTP bytes. Direct dialing never reuses connections, which is
        // exactly what PROXY protocol requires.
        if let Some(preamble) = self.preamble(endpoints) {
            stream
                .write_all(&preamble)
                .await
                .map_err(|e| ProxyError::Dial(format!("proxy protocol preamble: {}", e)))?;
        }

        let io = self.wrap_deadlines(stream);
        if https {
            let rt = self.tls.as_ref().ok_or_else(|| {
                ProxyError::Config("https requested without a TLS config".to_string())
            })?;
            let sni = match &rt.server_name {
                Some(name) => name.clone(),
                None => ServerName::try_from(host.to_string())
                    .map_err(|e| ProxyError::Dial(format!("bad SNI host {:?}: {}", host, e)))?,
            };
            let tls_stream =
                tokio::time::timeout(rt.handshake_timeout, rt.connector.connect(sni, io))
                    .await
                    .map_err(|_| ProxyError::Dial(format!("TLS handshake with {} timed out", addr)))?
                    .map_err(|e| ProxyError::Dial(format!("TLS handshake with {}: {}", addr, e)))?;
            let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
            if negotiated_h2 {
                self.handshake_h2(tls_stream, req).await
            } else {
                self.handshake_h1(tls_stream, req).await
            }
        } else if self.h2c_enabled {
            self.handshake_h2(io, req).await
        } else {
            self.handshake_h1(io, req).await
        }
    }

    fn preamble(&self, endpoints: Option<(SocketAddr, SocketAddr)>) -> Option<Vec<u8>> {
        match self.cfg.proxy_protocol.as_str() {
            "v1" => Some(match endpoints {
                Some((src, dst)) => proxy_protocol::encode_v1(src, dst),
                None => proxy_protocol::encode_v1_unknown(),
            }),
            "v2" => Some(match endpoints {
                Some((src, dst)) => proxy_protocol::encode_v2(src, dst),
                None => proxy_protocol::encode_v2_unspec(),
            }),
            _ => None,
        }
    }

    fn wrap_deadlines<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: S) -> DeadlineStream<S> {
        let read = (!self.cfg.read_timeout.is_zero()).then_some(self.cfg.read_timeout);
        let write = (!self.cfg.write_timeout.is_zero()).then_some(self.cfg.write_timeout);
        DeadlineStream::new(stream, read, write)
    }

    async fn handshake_h1<S>(
        &self,
        io: S,
        req: Request<BoxBody>,
    ) -> Result<Response<Incoming>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::Dial(format!("h1 handshake: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("transport: connection ended, error={}", e);
            }
        });
        sender.send_request(req).await.map_err(classify_hyper_error)
    }

    async fn handshake_h2<S>(
        &self,
        io: S,
        req: Request<BoxBody>,
    ) -> Result<Response<Incoming>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
                .await
                .map_err(|e| ProxyError::Dial(format!("h2 handshake: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("transport: connection ended, error={}", e);
            }
        });
        sender.send_request(req).await.map_err(classify_hyper_error)
    }
}

/// Bind the request to the dial target: absolute URI whose authority is the
/// upstream address. This is what "DialInfo overrides the URL" means in
/// practice — whatever host the client asked for, the bytes go to the
/// selected upstream.
fn set_outbound_uri(
    req: &mut Request<BoxBody>,
    https: bool,
    host: &str,
    port: Option<u16>,
) -> Result<(), ProxyError> {
    let pq = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let scheme = if https { "https" } else { "http" };
    let bracketed;
    let host = if host.contains(':') && !host.starts_with('[') {
        bracketed = format!("[{}]", host);
        &bracketed
    } else {
        host
    };
    let uri = match port {
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, pq),
        None => format!("{}://{}{}", scheme, host, pq),
    };
    *req.uri_mut() = uri
        .parse()
        .map_err(|e| ProxyError::Config(format!("bad outbound uri {:?}: {}", uri, e)))?;
    Ok(())
}

fn classify_legacy_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    if e.is_connect() {
        return ProxyError::Dial(e.to_string());
    }
    match find_hyper_error(&e) {
        Some(h) if h.is_canceled() => ProxyError::ClientCancelled,
        h => ProxyError::Transport {
            message: e.to_string(),
            // EOF before response headers usually means a keep-alive race;
            // classified pre-write so the try-loop may pick another
            // upstream.
            post_write: !h.map(|h| h.is_incomplete_message()).unwrap_or(false),
        },
    }
}

fn classify_hyper_error(e: hyper::Error) -> ProxyError {
    if e.is_canceled() {
        return ProxyError::ClientCancelled;
    }
    ProxyError::Transport {
        message: e.to_string(),
        post_write: !e.is_incomplete_message(),
    }
}

fn find_hyper_error(e: &dyn std::error::Error) -> Option<&hyper::Error> {
    let mut source = e.source();
    while let Some(s) = source {
        if let Some(h) = s.downcast_ref::<hyper::Error>() {
            return Some(h);
        }
        source = s.source();
    }
    None
}

fn build_http_connector(cfg: &TransportConfig) -> Result<HttpConnector, ProxyError> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.enforce_http(false);
    http.set_connect_timeout(Some(cfg.dial_timeout));
    http.set_keepalive(if cfg.keep_alive.enabled {
        Some(cfg.keep_alive.probe_interval)
    } else {
        None
    });
    if let Some(addr) = &cfg.local_address {
        let ip = addr
            .parse()
            .map_err(|e| ProxyError::Config(format!("bad local_address {:?}: {}", addr, e)))?;
        http.set_local_address(Some(ip));
    }
    Ok(http)
}

fn build_https_connector(
    cfg: &TransportConfig,
    http: HttpConnector,
    h1: bool,
    h2: bool,
) -> Result<HttpsConnector<HttpConnector>, ProxyError> {
    // Only build a bespoke rustls config when the TLS options require one;
    // the stock webpki-roots path covers the common case.
    let custom = cfg.tls.as_ref().filter(|t| {
        t.insecure_skip_verify
            || !t.root_ca_pem_files.is_empty()
            || !t.root_ca_certs.is_empty()
            || t.client_certificate_file.is_some()
    });

    let builder = match custom {
        Some(tls_cfg) => {
            let config = build_rustls_config(tls_cfg)?;
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(Arc::unwrap_or_clone(config))
                .https_or_http()
        }
        None => hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http(),
    };

    Ok(match (h1, h2) {
        (true, true) | (false, false) => builder
            .enable_http1()
            .enable_http2()
            .wrap_connector(http),
        (true, false) => builder.enable_http1().wrap_connector(http),
        (false, true) => builder.enable_http2().wrap_connector(http),
    })
}

fn build_tls_runtime(tls_cfg: &TlsClientConfig, h1: bool, h2: bool) -> Result<TlsRuntime, ProxyError> {
    let mut config = Arc::unwrap_or_clone(build_rustls_config(tls_cfg)?);
    config.alpn_protocols.clear();
    if h2 {
        config.alpn_protocols.push(b"h2".to_vec());
    }
    if h1 || !h2 {
        config.alpn_protocols.push(b"http/1.1".to_vec());
    }

    let server_name = tls_cfg
        .server_name
        .as_ref()
        .map(|name| {
            ServerName::try_from(name.clone())
                .map_err(|e| ProxyError::Config(format!("bad server_name {:?}: {}", name, e)))
        })
        .transpose()?;

    Ok(TlsRuntime {
        connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
        server_name,
        except_ports: tls_cfg.except_ports.clone(),
        handshake_timeout: tls_cfg.handshake_timeout,
    })
}

fn build_rustls_config(tls: &TlsClientConfig) -> Result<Arc<rustls::ClientConfig>, ProxyError> {
    let builder = rustls::ClientConfig::builder();

    let builder = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if tls.root_ca_pem_files.is_empty() && tls.root_ca_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for path in &tls.root_ca_pem_files {
                let file = std::fs::File::open(path).map_err(|e| {
                    ProxyError::Config(format!("read CA file {:?}: {}", path, e))
                })?;
                let mut reader = BufReader::new(file);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|e| {
                        ProxyError::Config(format!("parse CA file {:?}: {}", path, e))
                    })?;
                    roots.add(cert).map_err(|e| {
                        ProxyError::Config(format!("add CA from {:?}: {}", path, e))
                    })?;
                }
            }
            for b64 in &tls.root_ca_certs {
                use base64::Engine;
                let der = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| ProxyError::Config(format!("bad inline CA: {}", e)))?;
                roots
                    .add(rustls::pki_types::CertificateDer::from(der))
                    .map_err(|e| ProxyError::Config(format!("add inline CA: {}", e)))?;
            }
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&tls.client_certificate_file, &tls.client_certificate_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_pem_certs(cert_path)?;
            let key = load_pem_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ProxyError::Config(format!("client certificate: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ProxyError::Config(
                "client certificate needs both certificate and key files".to_string(),
            ))
        }
    };

    Ok(Arc::new(config))
}

fn load_pem_certs(
    path: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ProxyError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Config(format!("read certificate {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("parse certificate {:?}: {}", path, e)))
}

fn load_pem_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ProxyError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Config(format!("read key {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Config(format!("parse key {:?}: {}", path, e)))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in {:?}", path)))
}
