//! Newline-delimited JSON-RPC transport for Electrum servers.
//!
//! A `TcpTransport` owns one socket (plain TCP, or TLS via native-tls, optionally tunnelled
//! through a SOCKS5 proxy). Writes are serialized behind a lock; a single reader task matches
//! responses to pending requests by id and hands server notifications to the
//! [`NotificationRouter`]. When the reader task ends, every pending request fails with
//! `ConnectionClosed` and the transport reports itself dead.

use super::session::NotificationRouter;
use super::types::{ElectrumError, RpcRequest, RpcResponse};
use crate::config::{Protocol, ServerEndpoint};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

/// Request/response channel to one Electrum server
#[async_trait]
pub trait Transport: Send + Sync {
	/// Send one request and wait for its result.
	async fn request(&self, request: RpcRequest) -> Result<Value, ElectrumError>;

	/// Send requests as one JSON-RPC batch.
	///
	/// The outer error is a failure to send; per-item results are aligned to request order.
	async fn batch(
		&self,
		requests: Vec<RpcRequest>,
	) -> Result<Vec<Result<Value, ElectrumError>>, ElectrumError>;

	fn is_connected(&self) -> bool;

	/// Whether the background reader is still running
	fn is_reader_alive(&self) -> bool;

	async fn close(&self);
}

/// Opens transports to a configured endpoint
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(
		&self,
		endpoint: &ServerEndpoint,
		router: Arc<NotificationRouter>,
	) -> Result<Arc<dyn Transport>, ElectrumError>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

pub struct TcpTransport {
	writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
	pending: PendingMap,
	next_id: AtomicU64,
	connected: Arc<AtomicBool>,
	reader: JoinHandle<()>,
	timeout: Duration,
}

impl TcpTransport {
	/// Wrap a connected stream and start the reader task.
	pub fn from_stream<S>(stream: S, router: Arc<NotificationRouter>, timeout: Duration) -> Self
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		let (read_half, write_half) = tokio::io::split(stream);
		let pending: PendingMap = Arc::default();
		let connected = Arc::new(AtomicBool::new(true));
		let reader = tokio::spawn(read_loop(
			read_half,
			pending.clone(),
			router,
			connected.clone(),
		));

		Self {
			writer: tokio::sync::Mutex::new(Box::new(write_half)),
			pending,
			next_id: AtomicU64::new(1),
			connected,
			reader,
			timeout,
		}
	}

	fn register(&self) -> (u64, oneshot::Receiver<RpcResponse>) {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = oneshot::channel();
		lock(&self.pending).insert(id, tx);
		(id, rx)
	}

	fn forget(&self, id: u64) {
		lock(&self.pending).remove(&id);
	}

	async fn send(&self, payload: Value) -> Result<(), ElectrumError> {
		let mut line = payload.to_string();
		line.push('\n');
		let mut writer = self.writer.lock().await;
		writer.write_all(line.as_bytes()).await?;
		writer.flush().await?;
		Ok(())
	}

	async fn wait(&self, id: u64, rx: oneshot::Receiver<RpcResponse>) -> Result<Value, ElectrumError> {
		match tokio::time::timeout(self.timeout, rx).await {
			Ok(Ok(response)) => response.into_result(),
			Ok(Err(_)) => Err(ElectrumError::ConnectionClosed),
			Err(_) => {
				self.forget(id);
				Err(ElectrumError::Timeout(self.timeout.as_secs()))
			}
		}
	}
}

#[async_trait]
impl Transport for TcpTransport {
	async fn request(&self, request: RpcRequest) -> Result<Value, ElectrumError> {
		if !self.is_connected() {
			return Err(ElectrumError::ConnectionClosed);
		}
		let (id, rx) = self.register();
		if let Err(e) = self.send(request.to_json(id)).await {
			self.forget(id);
			return Err(e);
		}
		self.wait(id, rx).await
	}

	async fn batch(
		&self,
		requests: Vec<RpcRequest>,
	) -> Result<Vec<Result<Value, ElectrumError>>, ElectrumError> {
		if requests.is_empty() {
			return Ok(Vec::new());
		}
		if !self.is_connected() {
			return Err(ElectrumError::ConnectionClosed);
		}

		let mut waiting = Vec::with_capacity(requests.len());
		let mut payload = Vec::with_capacity(requests.len());
		for request in &requests {
			let (id, rx) = self.register();
			payload.push(request.to_json(id));
			waiting.push((id, rx));
		}

		if let Err(e) = self.send(Value::Array(payload)).await {
			for (id, _) in &waiting {
				self.forget(*id);
			}
			return Err(e);
		}

		Ok(futures::future::join_all(waiting.into_iter().map(|(id, rx)| self.wait(id, rx))).await)
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	fn is_reader_alive(&self) -> bool {
		!self.reader.is_finished()
	}

	async fn close(&self) {
		self.connected.store(false, Ordering::SeqCst);
		self.reader.abort();
		if let Err(e) = self.writer.lock().await.shutdown().await {
			debug!("Error closing connection: {}", e);
		}
		lock(&self.pending).clear();
	}
}

impl Drop for TcpTransport {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

async fn read_loop<R>(
	reader: R,
	pending: PendingMap,
	router: Arc<NotificationRouter>,
	connected: Arc<AtomicBool>,
) where
	R: AsyncRead + Unpin,
{
	let mut lines = BufReader::new(reader).lines();
	loop {
		match lines.next_line().await {
			Ok(Some(line)) => {
				if line.trim().is_empty() {
					continue;
				}
				if let Err(e) = dispatch_line(&line, &pending, &router) {
					warn!("Could not parse server message: {}", e);
				}
			}
			Ok(None) => {
				debug!("Server closed the connection");
				break;
			}
			Err(e) => {
				debug!("Read thread terminated: {}", e);
				break;
			}
		}
	}

	connected.store(false, Ordering::SeqCst);
	// Dropping the senders fails every waiter with ConnectionClosed
	lock(&pending).clear();
}

fn dispatch_line(
	line: &str,
	pending: &PendingMap,
	router: &NotificationRouter,
) -> Result<(), ElectrumError> {
	let value: Value = serde_json::from_str(line)?;
	let messages = match value {
		Value::Array(items) => items,
		other => vec![other],
	};

	for message in messages {
		if message.get("id").is_some_and(|id| !id.is_null()) {
			let response: RpcResponse = serde_json::from_value(message)?;
			match lock(pending).remove(&response.id) {
				Some(tx) => {
					let _ = tx.send(response);
				}
				None => debug!(id = response.id, "Dropping response for unknown request"),
			}
		} else if message.get("method").is_some() {
			router.route(serde_json::from_value(message)?);
		} else {
			warn!("Ignoring message that is neither response nor notification");
		}
	}
	Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connects over TCP or TLS, honouring an optional SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct TcpConnector {
	timeout: Duration,
	accept_invalid_certs: bool,
}

impl TcpConnector {
	pub fn new(timeout: Duration, accept_invalid_certs: bool) -> Self {
		Self { timeout, accept_invalid_certs }
	}

	fn tls_connector(
		&self,
		certificate: Option<&Path>,
	) -> Result<tokio_native_tls::TlsConnector, ElectrumError> {
		let mut builder = native_tls::TlsConnector::builder();
		if let Some(path) = certificate {
			let pem = std::fs::read(path)?;
			builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
			// A pinned certificate is usually self-signed for an IP or local name
			builder.danger_accept_invalid_hostnames(true);
		}
		if self.accept_invalid_certs {
			builder.danger_accept_invalid_certs(true);
		}
		Ok(tokio_native_tls::TlsConnector::from(builder.build()?))
	}

	async fn open(
		&self,
		endpoint: &ServerEndpoint,
		router: Arc<NotificationRouter>,
	) -> Result<Arc<dyn Transport>, ElectrumError> {
		let address = &endpoint.address;
		let stream = match &endpoint.proxy {
			// The proxy resolves the server name
			Some(proxy) => Socks5Stream::connect(
				(proxy.host.as_str(), proxy.port),
				(address.host.as_str(), address.port),
			)
			.await
			.map_err(|e| {
				ElectrumError::ProxyError(format!("{}:{} via {}:{}: {}", address.host, address.port, proxy.host, proxy.port, e))
			})?
			.into_inner(),
			None => TcpStream::connect((address.host.as_str(), address.port)).await?,
		};
		stream.set_nodelay(true)?;

		match address.protocol {
			Protocol::Tcp => Ok(Arc::new(TcpTransport::from_stream(stream, router, self.timeout))),
			Protocol::Ssl => {
				let tls = self.tls_connector(endpoint.certificate.as_deref())?;
				let stream = tls.connect(&address.host, stream).await?;
				Ok(Arc::new(TcpTransport::from_stream(stream, router, self.timeout)))
			}
		}
	}
}

#[async_trait]
impl Connector for TcpConnector {
	async fn connect(
		&self,
		endpoint: &ServerEndpoint,
		router: Arc<NotificationRouter>,
	) -> Result<Arc<dyn Transport>, ElectrumError> {
		debug!("Connecting to {}", endpoint.address);
		match tokio::time::timeout(self.timeout, self.open(endpoint, router)).await {
			Ok(result) => result,
			Err(_) => Err(ElectrumError::Timeout(self.timeout.as_secs())),
		}
	}
}
