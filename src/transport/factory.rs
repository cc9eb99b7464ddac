/// 传输工厂
///
/// 进程级一次性初始化（日志、TLS 加密后端、DNS 线程池），并创建服务端与客户端实例。
/// `init` 可以重复调用，只有第一次生效。
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};

use super::client::QuicClient;
use super::server::QuicServer;
use crate::adapters::ProofSource;
use crate::error::TransportError;
use crate::protocol::{ProtocolConfig, QuicClientConfig, QuicServerConfig};
use crate::Result;

static FACTORY: OnceLock<QuicTransportFactory> = OnceLock::new();

/// 工厂初始化选项
#[derive(Debug, Clone)]
pub struct FactoryOptions {
    /// Install a `tracing-subscriber` fmt subscriber unless one already exists.
    pub init_logging: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Worker threads of the shared pool used for name resolution.
    pub pool_threads: usize,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            init_logging: true,
            log_filter: "info".to_string(),
            pool_threads: 2,
        }
    }
}

/// Resolves host names on the factory's shared pool.
#[derive(Clone)]
pub(crate) struct Resolver {
    pool: Option<Handle>,
}

impl Resolver {
    pub fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| TransportError::config_error("factory", "resolver pool is shut down"))?;

        let (reply_tx, reply_rx) = flume::bounded(1);
        let target = format!("{}:{}", host, port);
        pool.spawn(async move {
            let result = tokio::net::lookup_host(target).await.map(|mut addrs| addrs.next());
            let _ = reply_tx.send(result);
        });

        match reply_rx.recv() {
            Ok(Ok(Some(addr))) => {
                tracing::debug!("[START] resolved {} to {}", host, addr);
                Ok(addr)
            }
            Ok(Ok(None)) => Err(TransportError::connection_error(
                format!("no address found for {}", host),
                false,
            )),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::connection_error("resolver pool is shut down", false)),
        }
    }
}

/// 进程级工厂
pub struct QuicTransportFactory {
    pool: Mutex<Option<Runtime>>,
    instances: AtomicUsize,
}

impl QuicTransportFactory {
    /// One-time process-wide setup; later calls return the existing factory.
    pub fn init(options: FactoryOptions) -> Result<&'static Self> {
        if let Some(factory) = FACTORY.get() {
            return Ok(factory);
        }

        if options.init_logging {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&options.log_filter));
            // Fails when the application already installed a subscriber.
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
        // Fails when a provider was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let pool = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.pool_threads.max(1))
            .thread_name("quicbridge-pool")
            .enable_all()
            .build()?;

        let factory = Self {
            pool: Mutex::new(Some(pool)),
            instances: AtomicUsize::new(0),
        };
        if FACTORY.set(factory).is_err() {
            tracing::debug!("[START] factory initialized concurrently, keeping the first");
        } else {
            tracing::info!("[START] quicbridge {} initialized", crate::version::version_number());
        }
        FACTORY
            .get()
            .ok_or_else(|| TransportError::config_error("factory", "initialization failed"))
    }

    /// The factory, initializing it with default options on first use.
    pub fn get() -> Result<&'static Self> {
        Self::init(FactoryOptions::default())
    }

    fn next_instance(&self) -> usize {
        self.instances.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn resolver(&self) -> Resolver {
        Resolver {
            pool: self.pool.lock().as_ref().map(|runtime| runtime.handle().clone()),
        }
    }

    /// Certificates come from the configuration (files, then PEM), or a
    /// self-signed certificate for `localhost` when neither is set.
    pub fn create_server(&self, config: QuicServerConfig) -> Result<QuicServer> {
        config.validate()?;
        let proof_source = ProofSource::from_config(&config).map_err(|e| {
            tracing::error!("[ERROR] proof source initialization failed: {}", e);
            e
        })?;
        QuicServer::new(config, proof_source, self.next_instance())
    }

    pub fn create_server_with_cert(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<QuicServer> {
        let config = QuicServerConfig::default().with_cert_files(cert_path.as_ref(), key_path.as_ref());
        self.create_server(config)
    }

    pub fn create_client(&self, config: QuicClientConfig) -> Result<QuicClient> {
        config.validate()?;
        QuicClient::new(config, self.resolver(), self.next_instance())
    }

    /// Stop the shared pool. Servers and clients keep working; clients can
    /// then only connect to literal IP addresses.
    pub fn shutdown(&self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown_background();
            tracing::info!("[STOP] shared pool shut down");
        }
    }
}
